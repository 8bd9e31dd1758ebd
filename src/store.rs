//! Durable appointment store
//!
//! Backed by an embedded sled database with a single key-value namespace:
//! `appointment/<id>` holds the JSON of the signed appointment and
//! `meta/lastBlock` the last fully processed head. The end-block index and
//! the locator map are in-memory projections rebuilt on open; on restart
//! the store is the source of truth for every other component.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

use tracing::{debug, info};

use crate::appointment::SignedAppointment;
use crate::error::StoreError;

const APPOINTMENT_PREFIX: &str = "appointment/";
const LAST_BLOCK_KEY: &str = "meta/lastBlock";

/// Outcome of a successful put.
#[derive(Debug)]
pub enum PutOutcome {
    /// Fresh locator, nothing replaced.
    Inserted,
    /// Identical record was already present.
    Unchanged,
    /// A lower-job appointment with the same locator was replaced.
    Replaced(SignedAppointment),
}

struct Indexes {
    /// end_block -> appointment ids expiring there
    by_end: BTreeMap<u64, BTreeSet<String>>,
    /// locator -> (appointment id, job_id) of the live appointment
    by_locator: HashMap<String, (String, u64)>,
}

/// Exclusive owner of appointment records.
pub struct AppointmentStore {
    db: sled::Db,
    indexes: Mutex<Indexes>,
}

impl AppointmentStore {
    /// Open (or create) the database and rebuild the in-memory indexes.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let mut by_end: BTreeMap<u64, BTreeSet<String>> = BTreeMap::new();
        let mut by_locator: HashMap<String, (String, u64)> = HashMap::new();

        for entry in db.scan_prefix(APPOINTMENT_PREFIX.as_bytes()) {
            let (key, value) = entry?;
            let key = String::from_utf8_lossy(&key).to_string();
            let signed = decode(&key, &value)?;
            let id = signed.appointment.id().to_string();
            let locator = signed.appointment.locator().to_string();

            by_end
                .entry(signed.appointment.end_block)
                .or_default()
                .insert(id.clone());
            match by_locator.get(&locator) {
                Some((_, live)) if *live >= signed.appointment.job_id => {}
                _ => {
                    by_locator.insert(locator, (id, signed.appointment.job_id));
                }
            }
        }

        info!(appointments = by_locator.len(), "appointment store opened");
        Ok(Self {
            db,
            indexes: Mutex::new(Indexes { by_end, by_locator }),
        })
    }

    /// Insert a signed appointment with a single batched write.
    ///
    /// Re-putting an identical record is idempotent. A record with the same
    /// id but different contents is rejected. A live appointment with the
    /// same locator and a lower `job_id` is atomically replaced and handed
    /// back so the caller can swap its event filter.
    pub fn put(&self, signed: &SignedAppointment) -> Result<PutOutcome, StoreError> {
        let id = signed.appointment.id().to_string();
        let locator = signed.appointment.locator().to_string();
        let key = appointment_key(&id);

        let mut indexes = self.indexes.lock().expect("store index lock");

        if let Some(existing) = self.db.get(key.as_bytes())? {
            let existing = decode(&key, &existing)?;
            if existing == *signed {
                return Ok(PutOutcome::Unchanged);
            }
            return Err(StoreError::Conflict { id });
        }

        let superseded = match indexes.by_locator.get(&locator) {
            Some((_, live_job)) if *live_job >= signed.appointment.job_id => {
                debug!(%locator, live_job, "rejecting stale job id");
                return Err(StoreError::StaleJob {
                    locator,
                    live_job_id: *live_job,
                });
            }
            Some((live_id, _)) => {
                let raw = self
                    .db
                    .get(appointment_key(live_id).as_bytes())?
                    .ok_or_else(|| StoreError::Corrupt {
                        key: appointment_key(live_id),
                        message: "indexed record missing".into(),
                    })?;
                Some(decode(live_id, &raw)?)
            }
            None => None,
        };

        let encoded = serde_json::to_vec(signed).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            message: e.to_string(),
        })?;

        let mut batch = sled::Batch::default();
        if let Some(old) = &superseded {
            batch.remove(appointment_key(&old.appointment.id().to_string()).as_bytes());
        }
        batch.insert(key.as_bytes(), encoded);
        self.db.apply_batch(batch)?;
        self.db.flush()?;

        if let Some(old) = &superseded {
            let old_id = old.appointment.id().to_string();
            if let Some(ids) = indexes.by_end.get_mut(&old.appointment.end_block) {
                ids.remove(&old_id);
                if ids.is_empty() {
                    indexes.by_end.remove(&old.appointment.end_block);
                }
            }
        }
        indexes
            .by_end
            .entry(signed.appointment.end_block)
            .or_default()
            .insert(id.clone());
        indexes
            .by_locator
            .insert(locator, (id, signed.appointment.job_id));

        Ok(match superseded {
            Some(old) => PutOutcome::Replaced(old),
            None => PutOutcome::Inserted,
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<SignedAppointment>, StoreError> {
        let key = appointment_key(id);
        match self.db.get(key.as_bytes())? {
            None => Ok(None),
            Some(raw) => Ok(Some(decode(&key, &raw)?)),
        }
    }

    /// Ids of appointments whose `end_block` is at most `height`, ascending.
    pub fn iter_by_end_block_upto(&self, height: u64) -> Vec<String> {
        let indexes = self.indexes.lock().expect("store index lock");
        indexes
            .by_end
            .range(..=height)
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect()
    }

    /// Ids of every stored appointment.
    pub fn live_ids(&self) -> Vec<String> {
        let indexes = self.indexes.lock().expect("store index lock");
        indexes
            .by_end
            .values()
            .flat_map(|ids| ids.iter().cloned())
            .collect()
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let key = appointment_key(id);
        let mut indexes = self.indexes.lock().expect("store index lock");
        let Some(raw) = self.db.get(key.as_bytes())? else {
            return Ok(());
        };
        let signed = decode(&key, &raw)?;
        self.db.remove(key.as_bytes())?;
        self.db.flush()?;

        if let Some(ids) = indexes.by_end.get_mut(&signed.appointment.end_block) {
            ids.remove(id);
            if ids.is_empty() {
                indexes.by_end.remove(&signed.appointment.end_block);
            }
        }
        let locator = signed.appointment.locator().to_string();
        if let Some((live_id, _)) = indexes.by_locator.get(&locator) {
            if live_id == id {
                indexes.by_locator.remove(&locator);
            }
        }
        Ok(())
    }

    /// Every persisted appointment, in key order.
    pub fn all(&self) -> Result<Vec<SignedAppointment>, StoreError> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(APPOINTMENT_PREFIX.as_bytes()) {
            let (key, value) = entry?;
            let key = String::from_utf8_lossy(&key).to_string();
            out.push(decode(&key, &value)?);
        }
        Ok(out)
    }

    /// Last fully processed head, if any.
    pub fn last_block(&self) -> Result<Option<u64>, StoreError> {
        match self.db.get(LAST_BLOCK_KEY.as_bytes())? {
            None => Ok(None),
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_ref().try_into().map_err(|_| StoreError::Corrupt {
                    key: LAST_BLOCK_KEY.into(),
                    message: format!("expected 8 bytes, got {}", raw.len()),
                })?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
        }
    }

    pub fn set_last_block(&self, number: u64) -> Result<(), StoreError> {
        self.db
            .insert(LAST_BLOCK_KEY.as_bytes(), number.to_be_bytes().to_vec())?;
        Ok(())
    }
}

fn appointment_key(id: &str) -> String {
    format!("{APPOINTMENT_PREFIX}{id}")
}

fn decode(key: &str, raw: &[u8]) -> Result<SignedAppointment, StoreError> {
    serde_json::from_slice(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appointment::{free_tier_payment_hash, Appointment};
    use alloy::primitives::{Address, Bytes, U256};

    fn signed(chosen_id: u64, job_id: u64, end_block: u64) -> SignedAppointment {
        SignedAppointment {
            appointment: Appointment {
                contract_address: Address::repeat_byte(0x11),
                customer_address: Address::repeat_byte(0x22),
                start_block: 1,
                end_block,
                challenge_period: 10,
                customer_chosen_id: chosen_id,
                job_id,
                data: Bytes::from(vec![1, 2, 3]),
                refund: U256::from(5u64),
                gas_limit: 100_000,
                mode: 0,
                event_abi: "event EventDispute(uint256 indexed channel)".to_string(),
                event_args: Bytes::new(),
                pre_condition: Bytes::new(),
                post_condition: Bytes::new(),
                payment_hash: free_tier_payment_hash(),
                customer_signature: Bytes::from(vec![0u8; 65]),
            },
            signature: Bytes::from(vec![9u8; 65]),
        }
    }

    fn open_store() -> (AppointmentStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (AppointmentStore::open(dir.path()).unwrap(), dir)
    }

    #[test]
    fn test_put_get_delete() {
        let (store, _dir) = open_store();
        let a = signed(1, 1, 100);
        assert!(matches!(store.put(&a).unwrap(), PutOutcome::Inserted));

        let id = a.appointment.id().to_string();
        assert_eq!(store.get(&id).unwrap().unwrap(), a);

        store.delete(&id).unwrap();
        assert!(store.get(&id).unwrap().is_none());
        // delete is idempotent
        store.delete(&id).unwrap();
    }

    #[test]
    fn test_idempotent_reput_and_conflict() {
        let (store, _dir) = open_store();
        let a = signed(1, 1, 100);
        store.put(&a).unwrap();
        assert!(matches!(store.put(&a).unwrap(), PutOutcome::Unchanged));

        let mut conflicting = a.clone();
        conflicting.signature = Bytes::from(vec![7u8; 65]);
        assert!(matches!(
            store.put(&conflicting),
            Err(StoreError::Conflict { .. })
        ));
    }

    #[test]
    fn test_higher_job_replaces_lower() {
        let (store, _dir) = open_store();
        let old = signed(1, 1, 100);
        let new = signed(1, 2, 120);
        store.put(&old).unwrap();

        match store.put(&new).unwrap() {
            PutOutcome::Replaced(replaced) => {
                assert_eq!(replaced, old);
            }
            other => panic!("expected replacement, got {other:?}"),
        }

        // old record is gone, new one is live
        assert!(store
            .get(&old.appointment.id().to_string())
            .unwrap()
            .is_none());
        assert!(store
            .get(&new.appointment.id().to_string())
            .unwrap()
            .is_some());
        assert_eq!(store.live_ids().len(), 1);
    }

    #[test]
    fn test_stale_job_rejected() {
        let (store, _dir) = open_store();
        store.put(&signed(1, 2, 100)).unwrap();
        assert!(matches!(
            store.put(&signed(1, 1, 90)),
            Err(StoreError::StaleJob { live_job_id: 2, .. })
        ));
    }

    #[test]
    fn test_end_block_index() {
        let (store, _dir) = open_store();
        store.put(&signed(1, 1, 100)).unwrap();
        store.put(&signed(2, 1, 150)).unwrap();
        store.put(&signed(3, 1, 200)).unwrap();

        assert_eq!(store.iter_by_end_block_upto(99).len(), 0);
        assert_eq!(store.iter_by_end_block_upto(150).len(), 2);
        assert_eq!(store.iter_by_end_block_upto(500).len(), 3);
    }

    #[test]
    fn test_reopen_rebuilds_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let a = signed(1, 1, 100);
        let b = signed(2, 1, 150);
        {
            let store = AppointmentStore::open(dir.path()).unwrap();
            store.put(&a).unwrap();
            store.put(&b).unwrap();
            store.set_last_block(123).unwrap();
        }

        let store = AppointmentStore::open(dir.path()).unwrap();
        assert_eq!(store.all().unwrap().len(), 2);
        assert_eq!(store.iter_by_end_block_upto(120), vec![a
            .appointment
            .id()
            .to_string()]);
        assert_eq!(store.last_block().unwrap(), Some(123));

        // replacement still enforced after reopen
        assert!(matches!(
            store.put(&signed(1, 1, 100)),
            Ok(PutOutcome::Unchanged)
        ));
        assert!(matches!(
            store.put(&signed(2, 0, 90)),
            Err(StoreError::StaleJob { .. })
        ));
    }
}
