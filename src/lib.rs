//! PISA Watchtower
//!
//! An accountable watchtower: customers hire the tower to watch an
//! on-chain dispute event inside a block window and submit a pre-agreed
//! response transaction on their behalf. Each accepted appointment comes
//! back with a signed receipt the customer can use against the tower's
//! on-chain bond if it fails to respond.

pub mod api;
pub mod appointment;
pub mod blocks;
pub mod chain;
pub mod config;
pub mod error;
pub mod gas_queue;
pub mod gc;
pub mod inspector;
pub mod machine;
pub mod receipt;
pub mod responder;
pub mod stats;
pub mod store;
pub mod subscriber;
pub mod tower;
pub mod watcher;


pub use appointment::{Appointment, AppointmentId, AppointmentStatus, Locator, SignedAppointment};
pub use config::TowerConfig;
pub use error::{ErrorSeverity, TowerError, TowerResult};
pub use gas_queue::{GasQueue, GasQueueItem, QueueError, QueueRequest, TxIdentity};
pub use responder::{Responder, ResponderConfig, ResponderEvent, ResponderHandle, ResponseData};
pub use stats::TowerStats;
pub use tower::Tower;
