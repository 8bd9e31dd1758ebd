//! Service statistics
//!
//! Counters surfaced on the stats endpoint and used by operators to watch
//! the tower's throughput and failure behaviour.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Tower service statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct TowerStats {
    pub appointments_accepted: u64,
    pub appointments_rejected: u64,
    pub responses_sent: u64,
    pub responses_confirmed: u64,
    pub responses_failed: u64,
    pub attempts_failed: u64,
    pub reorgs_observed: u64,
    pub appointments_collected: u64,
    /// Latest fully processed head
    pub head_block: u64,
    pub service_started: Option<DateTime<Utc>>,
    pub last_accepted_at: Option<DateTime<Utc>>,
    pub last_response_at: Option<DateTime<Utc>>,
}

impl TowerStats {
    pub fn record_accepted(&mut self) {
        self.appointments_accepted += 1;
        self.last_accepted_at = Some(Utc::now());
    }

    pub fn record_rejected(&mut self) {
        self.appointments_rejected += 1;
    }

    pub fn record_response_sent(&mut self) {
        self.responses_sent += 1;
    }

    pub fn record_response_confirmed(&mut self) {
        self.responses_confirmed += 1;
        self.last_response_at = Some(Utc::now());
    }

    pub fn record_response_failed(&mut self) {
        self.responses_failed += 1;
    }

    pub fn record_attempt_failed(&mut self) {
        self.attempts_failed += 1;
    }

    pub fn record_reorg(&mut self) {
        self.reorgs_observed += 1;
    }

    pub fn record_collected(&mut self, count: u64) {
        self.appointments_collected += count;
    }

    pub fn record_head(&mut self, number: u64) {
        self.head_block = number;
    }
}
