//! Event subscription and log routing
//!
//! Tracks one filter per live appointment, fetches logs for each new head,
//! and routes matches to every listening appointment. Delivered logs are
//! remembered with their block height for the reorg window: on a
//! `reorg_to(h)` every log delivered at height >= h is retracted so a
//! Triggered appointment can fall back to Active.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use alloy::json_abi::Event;
use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolValue;
use tracing::{debug, warn};

use crate::appointment::Appointment;
use crate::chain::{BlockStub, ChainEndpoint, LogEntry};
use crate::error::{ProviderError, ValidationError};

/// Provider-level log filter: contract address plus topic constraints.
///
/// `topics[0]` is the event selector; further slots constrain indexed
/// arguments, `None` being a wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub address: Address,
    pub topics: Vec<Option<B256>>,
}

impl EventFilter {
    /// Derive the filter from an appointment's event declaration and
    /// encoded argument specification.
    ///
    /// `event_args` is the ABI encoding of `(uint256[], bytes32[])`:
    /// positions into the event's indexed inputs followed by the 32-byte
    /// topic values; positions not listed stay wildcards.
    pub fn derive(appointment: &Appointment) -> Result<Self, ValidationError> {
        let event = parse_event(&appointment.event_abi)?;
        let indexed = event.inputs.iter().filter(|input| input.indexed).count();
        if indexed > 3 {
            return Err(ValidationError::BadEventAbi(format!(
                "{indexed} indexed arguments exceed the 3 topic slots"
            )));
        }

        let mut topics: Vec<Option<B256>> = vec![Some(event.selector())];
        topics.extend(std::iter::repeat(None).take(indexed));

        if !appointment.event_args.is_empty() {
            let (positions, values): (Vec<U256>, Vec<B256>) =
                <(Vec<U256>, Vec<B256>)>::abi_decode_params(&appointment.event_args, true)
                    .map_err(|e| ValidationError::BadEventArgs(e.to_string()))?;
            if positions.len() != values.len() {
                return Err(ValidationError::BadEventArgs(format!(
                    "{} positions but {} values",
                    positions.len(),
                    values.len()
                )));
            }
            for (position, value) in positions.iter().zip(values) {
                let position = usize::try_from(*position)
                    .map_err(|_| ValidationError::BadEventArgs("position overflow".into()))?;
                if position >= indexed {
                    return Err(ValidationError::BadEventArgs(format!(
                        "position {position} exceeds {indexed} indexed arguments"
                    )));
                }
                topics[1 + position] = Some(value);
            }
        }

        Ok(Self {
            address: appointment.contract_address,
            topics,
        })
    }

    /// Whether a delivered log satisfies this filter.
    pub fn matches(&self, log: &LogEntry) -> bool {
        if log.address != self.address {
            return false;
        }
        for (slot, constraint) in self.topics.iter().enumerate() {
            if let Some(expected) = constraint {
                if log.topics.get(slot) != Some(expected) {
                    return false;
                }
            }
        }
        true
    }
}

fn parse_event(declaration: &str) -> Result<Event, ValidationError> {
    Event::parse(declaration)
        .or_else(|_| Event::parse(&format!("event {declaration}")))
        .map_err(|e| ValidationError::BadEventAbi(e.to_string()))
}

/// A log routed to a listening appointment.
#[derive(Debug, Clone)]
pub struct MatchedLog {
    pub appointment_id: String,
    pub log: LogEntry,
}

/// A previously delivered log invalidated by a reorg.
#[derive(Debug, Clone)]
pub struct RetractedLog {
    pub appointment_id: String,
    pub log_key: String,
    pub height: u64,
}

struct DeliveredLog {
    appointment_id: String,
    log_key: String,
    height: u64,
}

/// Owner of filter registrations for live appointments.
pub struct EventSubscriber {
    chain: Arc<dyn ChainEndpoint>,
    filters: HashMap<String, EventFilter>,
    /// installed provider filters by refcount; uninstalled at zero
    installed: HashMap<EventFilterKey, usize>,
    delivered: VecDeque<DeliveredLog>,
    window: u64,
}

/// Hashable form of a filter for refcounting.
#[derive(PartialEq, Eq, Hash)]
struct EventFilterKey(Address, Vec<Option<B256>>);

impl From<&EventFilter> for EventFilterKey {
    fn from(filter: &EventFilter) -> Self {
        Self(filter.address, filter.topics.clone())
    }
}

impl EventSubscriber {
    pub fn new(chain: Arc<dyn ChainEndpoint>, window: u64) -> Self {
        Self {
            chain,
            filters: HashMap::new(),
            installed: HashMap::new(),
            delivered: VecDeque::new(),
            window,
        }
    }

    /// Register a filter for an appointment id.
    pub fn add(&mut self, filter: EventFilter, appointment_id: &str) {
        let key = EventFilterKey::from(&filter);
        let count = self.installed.entry(key).or_insert(0);
        if *count == 0 {
            debug!(address = %filter.address, "installing provider filter");
        }
        *count += 1;
        self.filters.insert(appointment_id.to_string(), filter);
    }

    /// Drop an appointment's registration; uninstalls the provider filter
    /// when its refcount reaches zero. Idempotent.
    pub fn remove(&mut self, appointment_id: &str) {
        let Some(filter) = self.filters.remove(appointment_id) else {
            return;
        };
        let key = EventFilterKey::from(&filter);
        if let Some(count) = self.installed.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                debug!(address = %filter.address, "uninstalling provider filter");
                self.installed.remove(&key);
            }
        }
    }

    pub fn is_subscribed(&self, appointment_id: &str) -> bool {
        self.filters.contains_key(appointment_id)
    }

    pub fn subscription_count(&self) -> usize {
        self.filters.len()
    }

    /// Fetch this head's logs and route matches to listeners.
    pub async fn scan_block(&mut self, block: &BlockStub) -> Result<Vec<MatchedLog>, ProviderError> {
        self.scan_range(block.number, block.number).await
    }

    /// Fetch logs for a block range and route matches to listeners. Used
    /// per-head in steady state and over the recent window at recovery.
    pub async fn scan_range(
        &mut self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<MatchedLog>, ProviderError> {
        let addresses: HashSet<Address> =
            self.filters.values().map(|filter| filter.address).collect();

        let mut matches = Vec::new();
        for address in addresses {
            let logs = self.chain.logs(address, from_block, to_block).await?;
            for log in logs {
                for (appointment_id, filter) in &self.filters {
                    if filter.matches(&log) {
                        self.delivered.push_back(DeliveredLog {
                            appointment_id: appointment_id.clone(),
                            log_key: log.key(),
                            height: log.block_number,
                        });
                        matches.push(MatchedLog {
                            appointment_id: appointment_id.clone(),
                            log: log.clone(),
                        });
                    }
                }
            }
        }

        // retention bounded by the reorg window
        let horizon = to_block.saturating_sub(self.window);
        while let Some(front) = self.delivered.front() {
            if front.height >= horizon {
                break;
            }
            self.delivered.pop_front();
        }

        Ok(matches)
    }

    /// Retract every delivered log at height >= `height`.
    pub fn retract(&mut self, height: u64) -> Vec<RetractedLog> {
        let mut retracted = Vec::new();
        let mut kept = VecDeque::with_capacity(self.delivered.len());
        for entry in self.delivered.drain(..) {
            if entry.height >= height {
                warn!(
                    appointment = %entry.appointment_id,
                    height = entry.height,
                    "retracting log from orphaned block"
                );
                retracted.push(RetractedLog {
                    appointment_id: entry.appointment_id,
                    log_key: entry.log_key,
                    height: entry.height,
                });
            } else {
                kept.push_back(entry);
            }
        }
        self.delivered = kept;
        retracted
    }
}
