//! Garbage collection of expired appointments
//!
//! Every `interval_blocks` heads the collector scans the store's end-block
//! index for appointments whose window closed more than the confirmation
//! depth ago, drops their subscriptions and deletes the records. Sweeps
//! are idempotent.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::AppointmentStore;
use crate::subscriber::EventSubscriber;

pub struct GarbageCollector {
    store: Arc<AppointmentStore>,
    interval_blocks: u64,
    confirmations: u64,
    last_sweep: Option<u64>,
}

impl GarbageCollector {
    pub fn new(store: Arc<AppointmentStore>, interval_blocks: u64, confirmations: u64) -> Self {
        Self {
            store,
            interval_blocks: interval_blocks.max(1),
            confirmations,
            last_sweep: None,
        }
    }

    /// Whether a sweep is due at this head.
    pub fn due(&self, head: u64) -> bool {
        match self.last_sweep {
            None => true,
            Some(last) => head >= last + self.interval_blocks,
        }
    }

    /// Collect appointments with `end_block + confirmations < head`.
    ///
    /// Returns the collected ids so the caller can drop any remaining
    /// in-memory markers.
    pub fn sweep(
        &mut self,
        head: u64,
        subscriber: &mut EventSubscriber,
    ) -> Result<Vec<String>, StoreError> {
        self.last_sweep = Some(head);

        // end_block + confirmations < head  <=>  end_block <= horizon
        let Some(horizon) = head
            .checked_sub(self.confirmations)
            .and_then(|h| h.checked_sub(1))
        else {
            return Ok(vec![]);
        };

        let expired = self.store.iter_by_end_block_upto(horizon);
        if expired.is_empty() {
            return Ok(vec![]);
        }

        for id in &expired {
            subscriber.remove(id);
            self.store.delete(id)?;
            debug!(appointment = %id, head, "expired appointment collected");
        }
        info!(count = expired.len(), head, "garbage collection sweep");
        Ok(expired)
    }
}
