//! Appointment watching
//!
//! Drives each live appointment's lifecycle from the block stream and the
//! subscriber's log deliveries. On a match inside the window the watcher
//! re-reads the appointment from the store, marks it Triggered in memory
//! and hands a response to the responder; a retraction before confirmation
//! cancels the intent and returns the appointment to Active.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use tracing::{debug, info, warn};

use crate::appointment::AppointmentStatus;
use crate::chain::{respond_calldata, BlockStub, ChainEndpoint};
use crate::error::TowerResult;
use crate::inspector::InspectorRegistry;
use crate::machine::{MappedBlockReducer, MappedStateMachine};
use crate::responder::{ResponderHandle, ResponseData};
use crate::store::AppointmentStore;
use crate::subscriber::{MatchedLog, RetractedLog};

/// Window phase of an appointment, reduced block-by-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Active,
    Expired,
}

/// Computes an appointment's window phase from the store's record.
struct PhaseReducer {
    store: Arc<AppointmentStore>,
}

impl PhaseReducer {
    fn phase_at(&self, id: &str, height: u64) -> Phase {
        match self.store.get(id) {
            Ok(Some(signed)) => {
                let a = &signed.appointment;
                if height < a.start_block {
                    Phase::Pending
                } else if height <= a.end_block {
                    Phase::Active
                } else {
                    Phase::Expired
                }
            }
            // deleted or unreadable records never trigger
            _ => Phase::Expired,
        }
    }
}

impl MappedBlockReducer for PhaseReducer {
    type State = Phase;

    fn initial(&self, id: &str, block: &BlockStub) -> Phase {
        self.phase_at(id, block.number)
    }

    fn reduce(&self, id: &str, _prev: &Phase, block: &BlockStub) -> Phase {
        self.phase_at(id, block.number)
    }
}

struct TriggerRecord {
    log_key: String,
    height: u64,
}

/// Routes log matches into responder intents and tracks per-appointment
/// status in memory; persistent state is never mutated here.
pub struct Watcher {
    store: Arc<AppointmentStore>,
    chain: Arc<dyn ChainEndpoint>,
    responder: ResponderHandle,
    inspectors: Arc<InspectorRegistry>,
    /// Accountability contract every response transaction calls
    tower_contract: Address,
    phases: MappedStateMachine<PhaseReducer>,
    triggers: HashMap<String, TriggerRecord>,
    /// confirmation height per completed appointment
    completed_at: HashMap<String, u64>,
    failed: HashSet<String>,
}

impl Watcher {
    pub fn new(
        store: Arc<AppointmentStore>,
        chain: Arc<dyn ChainEndpoint>,
        responder: ResponderHandle,
        inspectors: Arc<InspectorRegistry>,
        tower_contract: Address,
        reorg_window: usize,
    ) -> Self {
        let phases = MappedStateMachine::new(
            PhaseReducer {
                store: store.clone(),
            },
            reorg_window,
        );
        Self {
            store,
            chain,
            responder,
            inspectors,
            tower_contract,
            phases,
            triggers: HashMap::new(),
            completed_at: HashMap::new(),
            failed: HashSet::new(),
        }
    }

    /// Reduce every live appointment's phase with the new head.
    pub fn on_head(&mut self, block: &BlockStub) {
        let ids = self.store.live_ids();
        self.phases.apply(ids.iter().map(|id| id.as_str()), block);
    }

    /// In-memory status of an appointment.
    pub fn status(&self, id: &str) -> AppointmentStatus {
        if self.failed.contains(id) {
            return AppointmentStatus::Failed;
        }
        if self.completed_at.contains_key(id) {
            return AppointmentStatus::Completed;
        }
        if self.triggers.contains_key(id) {
            return AppointmentStatus::Triggered;
        }
        match self.phases.state(id) {
            None | Some(Phase::Pending) => AppointmentStatus::Pending,
            Some(Phase::Active) => AppointmentStatus::Active,
            Some(Phase::Expired) => AppointmentStatus::Expired,
        }
    }

    /// Handle a log routed to an appointment: trigger it and enqueue the
    /// response if it is Active.
    pub async fn on_log(&mut self, matched: &MatchedLog) -> TowerResult<()> {
        let id = &matched.appointment_id;
        let Some(signed) = self.store.get(id)? else {
            debug!(appointment = %id, "log for unknown appointment");
            return Ok(());
        };
        let a = &signed.appointment;

        let height = matched.log.block_number;
        if height < a.start_block || height > a.end_block {
            debug!(appointment = %id, height, "log outside the watch window");
            return Ok(());
        }
        match self.status(id) {
            AppointmentStatus::Active | AppointmentStatus::Pending => {}
            status => {
                debug!(appointment = %id, ?status, "ignoring log in non-active status");
                return Ok(());
            }
        }

        let deadline = self
            .inspectors
            .get(a.mode)
            .and_then(|inspector| inspector.decode_time(&matched.log))
            .unwrap_or(a.end_block + a.challenge_period);

        let ideal_gas_price = self.chain.gas_price().await?;
        let payload = respond_calldata(
            a.contract_address,
            a.customer_address,
            a.customer_chosen_id,
            a.job_id,
            a.data.clone(),
            a.gas_limit,
        );

        info!(
            appointment = %id,
            height,
            deadline,
            "dispute event observed; dispatching response"
        );
        self.responder
            .submit(
                ResponseData {
                    appointment_id: id.clone(),
                    to: self.tower_contract,
                    payload,
                    value: U256::ZERO,
                    gas_limit: a.gas_limit,
                    end_block: deadline,
                },
                ideal_gas_price,
            )
            .await;

        self.triggers.insert(
            id.clone(),
            TriggerRecord {
                log_key: matched.log.key(),
                height,
            },
        );
        Ok(())
    }

    /// A previously delivered log was orphaned; cancel the intent and fall
    /// back to Active.
    pub async fn on_retraction(&mut self, retracted: &RetractedLog) {
        let id = &retracted.appointment_id;
        let Some(trigger) = self.triggers.get(id) else {
            return;
        };
        if trigger.log_key != retracted.log_key {
            return;
        }
        warn!(
            appointment = %id,
            height = trigger.height,
            "trigger log retracted; reverting to active"
        );
        self.triggers.remove(id);
        self.responder.cancel(id).await;
    }

    /// Roll phases and confirmation markers back past a reorg.
    pub fn on_reorg(&mut self, height: u64) {
        self.phases.rollback_to(height);
        // orphaned confirmations return to Triggered; the responder
        // requeues the transaction itself
        self.completed_at.retain(|_, confirmed| *confirmed < height);
    }

    /// A response for this appointment confirmed at `block_number`.
    pub async fn on_response_confirmed(&mut self, id: &str, block_number: u64) {
        self.completed_at.insert(id.to_string(), block_number);
        let Ok(Some(signed)) = self.store.get(id) else {
            return;
        };
        let a = &signed.appointment;
        let Some(inspector) = self.inspectors.get(a.mode) else {
            return;
        };
        match self
            .chain
            .logs(a.contract_address, block_number, block_number)
            .await
        {
            Ok(logs) => {
                if !inspector.check_post(&logs) {
                    warn!(appointment = %id, block_number, "post-condition check failed");
                }
            }
            Err(e) => debug!(appointment = %id, error = %e, "post-condition logs unavailable"),
        }
    }

    /// The responder gave up on this appointment's intent.
    pub fn on_response_failed(&mut self, id: &str) {
        self.failed.insert(id.to_string());
    }

    /// Forget every in-memory marker for an id (superseded or collected).
    pub fn forget(&mut self, id: &str) {
        self.triggers.remove(id);
        self.completed_at.remove(id);
        self.failed.remove(id);
    }
}
