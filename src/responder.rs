//! Response dispatch
//!
//! The responder exclusively owns the signing key's nonce space. Intents
//! arrive as commands, live in the gas queue, and are driven to inclusion
//! by a single cooperative dispatch loop: broadcast in nonce order, wait a
//! bounded time for the head to confirm, re-price and rebroadcast on
//! timeout, give up after a bounded number of attempts. Outcomes surface as
//! typed events that listeners attach to at construction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{Address, Bytes, TxKind, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::chain::{ChainEndpoint, ReceiptInfo};
use crate::error::ProviderError;
use crate::gas_queue::{GasQueue, GasQueueItem, QueueError, QueueRequest, TxIdentity};

/// How often the dispatcher polls for a receipt while waiting on inclusion.
const RECEIPT_POLL: Duration = Duration::from_millis(250);

/// Outcome events emitted by the responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderEvent {
    /// The intent's transaction reached the provider.
    ResponseSent { appointment_id: String, nonce: u64 },
    /// The intent's transaction was included in a block.
    ResponseConfirmed {
        appointment_id: String,
        block_number: u64,
    },
    /// One broadcast or confirmation attempt failed.
    AttemptFailed {
        appointment_id: String,
        attempt: u32,
    },
    /// The intent was abandoned after exhausting its attempts.
    ResponseFailed { appointment_id: String },
}

/// A response handed over by the watcher.
#[derive(Debug, Clone)]
pub struct ResponseData {
    pub appointment_id: String,
    pub to: Address,
    pub payload: Bytes,
    pub value: U256,
    pub gas_limit: u64,
    /// Deadline after which the response no longer helps the customer
    pub end_block: u64,
}

#[derive(Debug)]
enum Command {
    Submit {
        data: ResponseData,
        ideal_gas_price: u128,
    },
    Cancel {
        appointment_id: String,
    },
    ReorgTo {
        height: u64,
    },
}

/// Cloneable handle for submitting, cancelling and observing intents.
#[derive(Clone)]
pub struct ResponderHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ResponderEvent>,
}

impl ResponderHandle {
    pub async fn submit(&self, data: ResponseData, ideal_gas_price: u128) {
        let _ = self
            .commands
            .send(Command::Submit {
                data,
                ideal_gas_price,
            })
            .await;
    }

    pub async fn cancel(&self, appointment_id: &str) {
        let _ = self
            .commands
            .send(Command::Cancel {
                appointment_id: appointment_id.to_string(),
            })
            .await;
    }

    pub async fn reorg_to(&self, height: u64) {
        let _ = self.commands.send(Command::ReorgTo { height }).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResponderEvent> {
        self.events.subscribe()
    }
}

/// Dispatch tuning knobs.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub replacement_rate: u32,
    pub max_queue_depth: usize,
    pub max_attempts: u32,
    /// Bounded wait per provider interaction
    pub provider_timeout: Duration,
    /// Wait between attempts
    pub attempt_interval: Duration,
    /// Confirmed transactions retained for reorg recovery, in blocks
    pub reorg_window: u64,
}

struct BroadcastState {
    hash: B256,
    price: u128,
}

struct ConfirmedIntent {
    item: GasQueueItem,
    block_number: u64,
}

/// Single owner of the response key's nonce space.
pub struct Responder {
    chain: Arc<dyn ChainEndpoint>,
    signer: PrivateKeySigner,
    chain_id: u64,
    config: ResponderConfig,
    queue: GasQueue,
    /// nonce -> live broadcast for that slot; always a prefix of the queue
    broadcast_state: HashMap<u64, BroadcastState>,
    /// attempts per appointment id
    attempts: HashMap<String, u32>,
    /// recently confirmed intents, by nonce, kept for the reorg window
    confirmed: BTreeMap<u64, ConfirmedIntent>,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<ResponderEvent>,
}

impl Responder {
    pub fn new(
        chain: Arc<dyn ChainEndpoint>,
        signer: PrivateKeySigner,
        chain_id: u64,
        initial_nonce: u64,
        config: ResponderConfig,
    ) -> (Self, ResponderHandle) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, _) = broadcast::channel(256);
        let queue = GasQueue::new(
            initial_nonce,
            config.replacement_rate,
            config.max_queue_depth,
        );
        let handle = ResponderHandle {
            commands: command_tx,
            events: event_tx.clone(),
        };
        let responder = Self {
            chain,
            signer,
            chain_id,
            config,
            queue,
            broadcast_state: HashMap::new(),
            attempts: HashMap::new(),
            confirmed: BTreeMap::new(),
            commands: command_rx,
            events: event_tx,
        };
        (responder, handle)
    }

    /// Drive intents until every handle is dropped and the queue is idle.
    pub async fn run(mut self) {
        info!(
            max_attempts = self.config.max_attempts,
            replacement_rate = self.config.replacement_rate,
            "responder started"
        );
        let mut ticker = tokio::time::interval(self.config.attempt_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        if self.queue.is_empty() {
                            info!("responder stopping");
                            return;
                        }
                    }
                },
                _ = ticker.tick() => self.step().await,
            }
        }
    }

    fn emit(&self, event: ResponderEvent) {
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                data,
                ideal_gas_price,
            } => self.handle_submit(data, ideal_gas_price),
            Command::Cancel { appointment_id } => self.handle_cancel(&appointment_id),
            Command::ReorgTo { height } => self.handle_reorg(height),
        }
    }

    fn handle_submit(&mut self, data: ResponseData, ideal_gas_price: u128) {
        if self.queue.contains(&data.appointment_id) {
            debug!(appointment = %data.appointment_id, "intent already queued");
            return;
        }
        let request = QueueRequest {
            identity: TxIdentity {
                chain_id: self.chain_id,
                to: data.to,
                value: data.value,
                payload: data.payload.clone(),
                gas_limit: data.gas_limit,
            },
            appointment_id: data.appointment_id.clone(),
            end_block: data.end_block,
            noop: false,
        };
        match self.queue.add(request, ideal_gas_price) {
            Ok(queue) => {
                info!(
                    appointment = %data.appointment_id,
                    ideal_gas_price,
                    depth = queue.len(),
                    "intent queued"
                );
                self.queue = queue;
            }
            Err(QueueError::Full { depth }) => {
                warn!(
                    appointment = %data.appointment_id,
                    depth,
                    "gas queue full; dropping intent"
                );
                self.emit(ResponderEvent::ResponseFailed {
                    appointment_id: data.appointment_id,
                });
            }
            Err(e @ QueueError::Inconsistent(_)) => {
                error!(error = %e, "gas queue rejected intent");
            }
        }
    }

    fn handle_cancel(&mut self, appointment_id: &str) {
        let Some(item) = self.queue.find(appointment_id).cloned() else {
            return;
        };
        self.attempts.remove(appointment_id);
        if self.broadcast_state.contains_key(&item.nonce) {
            // the nonce is on the network; reclaim it with a no-op
            match self.queue.replace_with_noop(item.nonce, self.noop_request(item.nonce)) {
                Ok((queue, _)) => {
                    info!(appointment = %appointment_id, nonce = item.nonce, "cancelled; reclaiming nonce");
                    self.queue = queue;
                }
                Err(e) => error!(error = %e, "cancel failed"),
            }
        } else {
            match self.queue.remove_pending(appointment_id) {
                Ok((queue, _)) => {
                    info!(appointment = %appointment_id, "cancelled before broadcast");
                    self.queue = queue;
                }
                Err(e) => error!(error = %e, "cancel failed"),
            }
        }
    }

    fn handle_reorg(&mut self, height: u64) {
        // restore orphaned confirmations at their original nonces, newest
        // first to keep the run contiguous; prices keep their last value
        let orphaned: Vec<u64> = self
            .confirmed
            .iter()
            .filter(|(_, c)| c.block_number >= height)
            .map(|(nonce, _)| *nonce)
            .collect();
        for nonce in orphaned.into_iter().rev() {
            let Some(confirmed) = self.confirmed.remove(&nonce) else {
                continue;
            };
            warn!(
                appointment = %confirmed.item.request.appointment_id,
                nonce,
                height,
                "confirmation orphaned; requeueing"
            );
            match self.queue.requeue_front(confirmed.item) {
                Ok(queue) => {
                    self.queue = queue;
                    // force a rebroadcast of the same signed payload
                    self.broadcast_state.remove(&nonce);
                }
                Err(e) => error!(error = %e, "could not requeue orphaned intent"),
            }
        }
    }

    fn noop_request(&self, nonce: u64) -> QueueRequest {
        QueueRequest {
            identity: TxIdentity {
                chain_id: self.chain_id,
                to: self.signer.address(),
                value: U256::ZERO,
                payload: Bytes::new(),
                gas_limit: 21_000,
            },
            appointment_id: format!("noop:{nonce}"),
            end_block: u64::MAX,
            noop: true,
        }
    }

    /// One dispatch cycle: broadcast pending slots, then wait on the head.
    async fn step(&mut self) {
        if let Err(failed) = self.broadcast_pass().await {
            self.register_failure(&failed);
            return;
        }
        self.await_head().await;
    }

    /// Broadcast every item whose slot holds no transaction at its current
    /// price, in nonce order. Stops at the first failure so the broadcast
    /// set stays a prefix of the queue.
    async fn broadcast_pass(&mut self) -> Result<(), GasQueueItem> {
        let items: Vec<GasQueueItem> = self.queue.items().to_vec();
        for item in items {
            let up_to_date = self
                .broadcast_state
                .get(&item.nonce)
                .is_some_and(|b| b.price >= item.current_gas_price);
            if up_to_date {
                continue;
            }
            let raw = match self.sign_item(&item) {
                Ok(raw) => raw,
                Err(e) => {
                    error!(error = %e, appointment = %item.request.appointment_id, "signing failed");
                    return Err(item);
                }
            };
            let sent = tokio::time::timeout(self.config.provider_timeout, self.chain.send_raw(raw))
                .await;
            match sent {
                Ok(Ok(hash)) => {
                    let first = !self.broadcast_state.contains_key(&item.nonce);
                    debug!(
                        appointment = %item.request.appointment_id,
                        nonce = item.nonce,
                        gas_price = item.current_gas_price,
                        tx = %hash,
                        "broadcast"
                    );
                    self.broadcast_state.insert(
                        item.nonce,
                        BroadcastState {
                            hash,
                            price: item.current_gas_price,
                        },
                    );
                    if first && !item.request.noop {
                        self.emit(ResponderEvent::ResponseSent {
                            appointment_id: item.request.appointment_id.clone(),
                            nonce: item.nonce,
                        });
                    }
                }
                Ok(Err(e)) => {
                    debug!(error = %e, nonce = item.nonce, "broadcast failed");
                    return Err(item);
                }
                Err(_) => {
                    debug!(nonce = item.nonce, "broadcast timed out");
                    return Err(item);
                }
            }
        }
        Ok(())
    }

    /// Wait a bounded time for the head's transaction to confirm; on
    /// timeout raise its price so the next pass rebroadcasts.
    async fn await_head(&mut self) {
        let Some(head) = self.queue.head().cloned() else {
            return;
        };
        let Some(state) = self.broadcast_state.get(&head.nonce) else {
            return;
        };
        let hash = state.hash;

        let waited =
            tokio::time::timeout(self.config.provider_timeout, self.poll_receipt(hash)).await;
        match waited {
            Ok(Ok(receipt)) => self.register_confirmation(&head, receipt),
            Ok(Err(e)) => {
                debug!(error = %e, nonce = head.nonce, "receipt poll failed");
                self.register_failure(&head);
            }
            Err(_) => {
                debug!(nonce = head.nonce, "inclusion wait timed out");
                match self.queue.bump_head() {
                    Ok(queue) => self.queue = queue,
                    Err(e) => error!(error = %e, "could not bump head price"),
                }
                self.register_failure(&head);
            }
        }
    }

    async fn poll_receipt(&self, hash: B256) -> Result<ReceiptInfo, ProviderError> {
        loop {
            if let Some(receipt) = self.chain.transaction_receipt(hash).await? {
                return Ok(receipt);
            }
            tokio::time::sleep(RECEIPT_POLL).await;
        }
    }

    fn register_confirmation(&mut self, head: &GasQueueItem, receipt: ReceiptInfo) {
        match self.queue.confirm_head(head.nonce) {
            Ok((queue, item)) => {
                info!(
                    appointment = %item.request.appointment_id,
                    nonce = item.nonce,
                    block = receipt.block_number,
                    "response confirmed"
                );
                self.queue = queue;
                self.broadcast_state.remove(&item.nonce);
                self.attempts.remove(&item.request.appointment_id);
                if !item.request.noop {
                    self.emit(ResponderEvent::ResponseConfirmed {
                        appointment_id: item.request.appointment_id.clone(),
                        block_number: receipt.block_number,
                    });
                }
                self.confirmed.insert(
                    item.nonce,
                    ConfirmedIntent {
                        item,
                        block_number: receipt.block_number,
                    },
                );
                let horizon = receipt.block_number.saturating_sub(self.config.reorg_window);
                self.confirmed.retain(|_, c| c.block_number >= horizon);
            }
            Err(e) => error!(error = %e, "confirmation bookkeeping failed"),
        }
    }

    fn register_failure(&mut self, item: &GasQueueItem) {
        let id = item.request.appointment_id.clone();
        let attempt = self.attempts.entry(id.clone()).or_insert(0);
        *attempt += 1;
        let attempt = *attempt;
        if !item.request.noop {
            self.emit(ResponderEvent::AttemptFailed {
                appointment_id: id.clone(),
                attempt,
            });
        }
        if attempt < self.config.max_attempts {
            return;
        }

        // attempts exhausted
        self.attempts.remove(&id);
        if item.request.noop {
            // a no-op exists only to reclaim its nonce; keep trying
            warn!(nonce = item.nonce, "nonce reclaim still failing; resetting attempts");
            return;
        }
        warn!(appointment = %id, attempts = attempt, "giving up on intent");
        self.emit(ResponderEvent::ResponseFailed {
            appointment_id: id.clone(),
        });
        if self.broadcast_state.contains_key(&item.nonce) {
            match self.queue.replace_with_noop(item.nonce, self.noop_request(item.nonce)) {
                Ok((queue, _)) => self.queue = queue,
                Err(e) => error!(error = %e, "could not reclaim nonce"),
            }
        } else {
            match self.queue.remove_pending(&id) {
                Ok((queue, _)) => self.queue = queue,
                Err(e) => error!(error = %e, "could not drop failed intent"),
            }
        }
    }

    fn sign_item(&self, item: &GasQueueItem) -> Result<Bytes, ProviderError> {
        let mut tx = TxLegacy {
            chain_id: Some(item.request.identity.chain_id),
            nonce: item.nonce,
            gas_price: item.current_gas_price,
            gas_limit: item.request.identity.gas_limit,
            to: TxKind::Call(item.request.identity.to),
            value: item.request.identity.value,
            input: item.request.identity.payload.clone(),
        };
        let signature = self
            .signer
            .sign_transaction_sync(&mut tx)
            .map_err(|e| ProviderError::Signing(e.to_string()))?;
        let envelope = TxEnvelope::from(tx.into_signed(signature));
        Ok(Bytes::from(envelope.encoded_2718()))
    }
}
