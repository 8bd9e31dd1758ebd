//! Tower admission and runtime
//!
//! The admission path accepts a customer appointment end-to-end: validate,
//! inspect for the requested mode, sign the receipt, persist, subscribe.
//! The runtime drives the block pipeline: each head flows through the
//! watcher, the subscriber and the garbage collector before the next block
//! is started, and reorg notifications fan out to every reorg-aware
//! component.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::appointment::{free_tier_payment_hash, Appointment, SignedAppointment};
use crate::blocks::{BlockSource, ChainEvent};
use crate::chain::{BlockStub, ChainEndpoint, HttpEndpoint};
use crate::config::TowerConfig;
use crate::error::{ConfigError, StoreError, TowerError, TowerResult, ValidationError};
use crate::gc::GarbageCollector;
use crate::inspector::InspectorRegistry;
use crate::receipt::{verify_customer_signature, ReceiptSigner};
use crate::responder::{Responder, ResponderConfig, ResponderEvent, ResponderHandle};
use crate::stats::TowerStats;
use crate::store::{AppointmentStore, PutOutcome};
use crate::subscriber::{EventFilter, EventSubscriber};
use crate::watcher::Watcher;

/// The watchtower service.
pub struct Tower {
    config: TowerConfig,
    chain: Arc<dyn ChainEndpoint>,
    store: Arc<AppointmentStore>,
    subscriber: Mutex<EventSubscriber>,
    inspectors: Arc<InspectorRegistry>,
    receipt_signer: ReceiptSigner,
    responder: ResponderHandle,
    watcher: Mutex<Watcher>,
    stats: Arc<RwLock<TowerStats>>,
}

impl Tower {
    /// Assemble a tower from its collaborators.
    pub fn new(
        config: TowerConfig,
        chain: Arc<dyn ChainEndpoint>,
        store: Arc<AppointmentStore>,
        responder: ResponderHandle,
    ) -> TowerResult<Self> {
        let tower_contract: Address = config
            .tower_contract_address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(config.tower_contract_address.clone()))?;
        let receipt_signer = ReceiptSigner::new(&config.receipt_key, tower_contract)?;
        let inspectors = Arc::new(InspectorRegistry::standard(
            config.state_channel_min_dispute_period,
        ));
        let subscriber = Mutex::new(EventSubscriber::new(
            chain.clone(),
            config.reorg_window as u64,
        ));
        let watcher = Mutex::new(Watcher::new(
            store.clone(),
            chain.clone(),
            responder.clone(),
            inspectors.clone(),
            tower_contract,
            config.reorg_window,
        ));
        let mut stats = TowerStats::default();
        stats.service_started = Some(Utc::now());

        Ok(Self {
            config,
            chain,
            store,
            subscriber,
            inspectors,
            receipt_signer,
            responder,
            watcher,
            stats: Arc::new(RwLock::new(stats)),
        })
    }

    /// Connect the chain endpoint, open the store, start the responder and
    /// assemble the tower.
    pub async fn bootstrap(config: TowerConfig) -> TowerResult<Arc<Self>> {
        let chain: Arc<dyn ChainEndpoint> = Arc::new(HttpEndpoint::connect(&config.json_rpc_url)?);
        let chain_id = chain.chain_id().await?;
        info!(chain_id, rpc = %config.json_rpc_url, "connected to chain");

        let store = Arc::new(AppointmentStore::open(&config.db_path)?);

        let signer: PrivateKeySigner = config
            .responder_key
            .parse()
            .map_err(|_| ConfigError::InvalidPrivateKey)?;
        let initial_nonce = chain.transaction_count(signer.address()).await?;
        info!(
            responder = %signer.address(),
            initial_nonce,
            "responder key loaded"
        );

        let (responder, handle) = Responder::new(
            chain.clone(),
            signer,
            chain_id,
            initial_nonce,
            ResponderConfig {
                replacement_rate: config.replacement_rate_percent,
                max_queue_depth: config.max_queue_depth,
                max_attempts: config.max_attempts,
                provider_timeout: Duration::from_millis(config.provider_response_timeout_ms),
                attempt_interval: Duration::from_millis(config.attempt_interval_ms),
                reorg_window: config.reorg_window as u64,
            },
        );
        tokio::spawn(responder.run());

        let tower = Arc::new(Self::new(config, chain, store, handle)?);
        tower.recover().await?;
        Ok(tower)
    }

    /// Address customers verify receipts against.
    pub fn receipt_address(&self) -> Address {
        self.receipt_signer.address()
    }

    pub fn stats_handle(&self) -> Arc<RwLock<TowerStats>> {
        self.stats.clone()
    }

    pub fn config(&self) -> &TowerConfig {
        &self.config
    }

    /// End-to-end accept path.
    pub async fn add_appointment(
        &self,
        appointment: Appointment,
    ) -> TowerResult<SignedAppointment> {
        let result = self.admit(appointment).await;
        let mut stats = self.stats.write().await;
        match &result {
            Ok(_) => stats.record_accepted(),
            Err(_) => stats.record_rejected(),
        }
        result
    }

    async fn admit(&self, appointment: Appointment) -> TowerResult<SignedAppointment> {
        // 1. structural validation
        let filter = self.validate(&appointment)?;

        // 2. protocol-specific inspection for the mode
        let inspector = self
            .inspectors
            .get(appointment.mode)
            .ok_or(ValidationError::UnknownMode(appointment.mode))?;
        inspector.inspect(&appointment, self.chain.as_ref()).await?;

        // 3. receipt signature over the canonical encoding
        let signature = self.receipt_signer.sign(&appointment)?;
        let signed = SignedAppointment {
            appointment,
            signature,
        };

        // 4. durable insert; a lower-job sibling is atomically replaced
        let id = signed.appointment.id().to_string();
        let outcome = match self.store.put(&signed) {
            Ok(outcome) => outcome,
            Err(StoreError::StaleJob {
                locator,
                live_job_id,
            }) => {
                return Err(ValidationError::InvalidField {
                    field: "job_id".into(),
                    message: format!(
                        "locator {locator} already has a live appointment with job_id {live_job_id}"
                    ),
                }
                .into())
            }
            Err(e) => return Err(e.into()),
        };

        // 5. filter registration; the superseded filter is dropped first.
        // lock order is watcher then subscriber, as in the block pipeline
        {
            let mut watcher = self.watcher.lock().await;
            let mut subscriber = self.subscriber.lock().await;
            if let PutOutcome::Replaced(old) = &outcome {
                let old_id = old.appointment.id().to_string();
                info!(superseded = %old_id, replacement = %id, "appointment superseded");
                subscriber.remove(&old_id);
                self.responder.cancel(&old_id).await;
                watcher.forget(&old_id);
            }
            subscriber.add(filter, &id);
        }

        info!(appointment = %id, "appointment accepted");
        Ok(signed)
    }

    /// Structural request validation; returns the derived event filter.
    fn validate(&self, appointment: &Appointment) -> Result<EventFilter, ValidationError> {
        if appointment.start_block > appointment.end_block {
            return Err(ValidationError::WindowInverted {
                start: appointment.start_block,
                end: appointment.end_block,
            });
        }
        if appointment.gas_limit == 0 {
            return Err(ValidationError::ZeroGasLimit);
        }
        if appointment.payment_hash != free_tier_payment_hash() {
            return Err(ValidationError::PaymentHashMismatch);
        }
        if appointment.customer_signature.len() != 65 {
            return Err(ValidationError::InvalidField {
                field: "customer_signature".into(),
                message: format!(
                    "expected 65 bytes, got {}",
                    appointment.customer_signature.len()
                ),
            });
        }
        if !self.inspectors.knows(appointment.mode) {
            return Err(ValidationError::UnknownMode(appointment.mode));
        }
        verify_customer_signature(appointment, self.receipt_signer.tower_address())?;
        EventFilter::derive(appointment)
    }

    /// Startup recovery: re-register a filter for every persisted
    /// appointment and re-enqueue intents whose trigger is still visible.
    ///
    /// Runs to completion before the HTTP listener accepts requests, so an
    /// admission interrupted between persist and subscribe cannot lose its
    /// filter.
    pub async fn recover(&self) -> TowerResult<()> {
        let persisted = self.store.all()?;
        if persisted.is_empty() {
            return Ok(());
        }

        {
            let mut subscriber = self.subscriber.lock().await;
            for signed in &persisted {
                let id = signed.appointment.id().to_string();
                match EventFilter::derive(&signed.appointment) {
                    Ok(filter) => subscriber.add(filter, &id),
                    Err(e) => {
                        // the record was validated at admission; failure
                        // here means the store was tampered with
                        error!(appointment = %id, error = %e, "unsubscribable record");
                    }
                }
            }
        }
        info!(appointments = persisted.len(), "subscriptions rebuilt");

        // replay the recent window for triggers that are still visible
        let head = self.chain.head_number().await?;
        let last = self.store.last_block()?.unwrap_or(head);
        let from = last.saturating_sub(self.config.reorg_window as u64);
        let matches = {
            let mut subscriber = self.subscriber.lock().await;
            subscriber.scan_range(from, head).await?
        };
        if !matches.is_empty() {
            info!(count = matches.len(), from, head, "replaying visible triggers");
            let mut watcher = self.watcher.lock().await;
            for matched in &matches {
                watcher.on_log(matched).await?;
            }
        }
        Ok(())
    }

    /// Run the block pipeline until the source stops or fails fast.
    pub async fn run(self: Arc<Self>) -> TowerResult<()> {
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let source = BlockSource::new(
            self.chain.clone(),
            self.config.reorg_window,
            Duration::from_millis(self.config.polling_interval_ms),
            event_tx,
        );
        let source_task = tokio::spawn(source.run());

        let mut gc = GarbageCollector::new(
            self.store.clone(),
            self.config.gc_interval_blocks,
            self.config.watcher_response_confirmations,
        );
        let mut responder_events = self.responder.subscribe();

        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(event) => self.process_event(event, &mut gc).await?,
                    None => break,
                },
                event = responder_events.recv() => match event {
                    Ok(event) => self.process_responder_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "responder event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(TowerError::Application("responder stopped".into()));
                    }
                }
            }
        }

        // the source only stops on fatal errors or shutdown
        match source_task.await {
            Ok(result) => result,
            Err(e) => Err(TowerError::Application(format!("block source panicked: {e}"))),
        }
    }

    /// Apply one block-derived event; downstream work reaches a stable
    /// state before the caller feeds the next event.
    pub async fn process_event(
        &self,
        event: ChainEvent,
        gc: &mut GarbageCollector,
    ) -> TowerResult<()> {
        match event {
            ChainEvent::Head(block) => self.process_head(block, gc).await,
            ChainEvent::ReorgTo(height) => self.process_reorg(height).await,
        }
    }

    async fn process_head(&self, block: BlockStub, gc: &mut GarbageCollector) -> TowerResult<()> {
        let mut watcher = self.watcher.lock().await;
        watcher.on_head(&block);

        let matches = {
            let mut subscriber = self.subscriber.lock().await;
            subscriber.scan_block(&block).await?
        };
        for matched in &matches {
            watcher.on_log(matched).await?;
        }

        if gc.due(block.number) {
            let mut subscriber = self.subscriber.lock().await;
            let collected = gc.sweep(block.number, &mut subscriber)?;
            if !collected.is_empty() {
                for id in &collected {
                    watcher.forget(id);
                }
                self.stats
                    .write()
                    .await
                    .record_collected(collected.len() as u64);
            }
        }

        self.store.set_last_block(block.number)?;
        self.stats.write().await.record_head(block.number);
        Ok(())
    }

    async fn process_reorg(&self, height: u64) -> TowerResult<()> {
        warn!(height, "processing reorg");
        let retractions = {
            let mut subscriber = self.subscriber.lock().await;
            subscriber.retract(height)
        };
        {
            let mut watcher = self.watcher.lock().await;
            for retracted in &retractions {
                watcher.on_retraction(retracted).await;
            }
            watcher.on_reorg(height);
        }
        self.responder.reorg_to(height).await;
        self.stats.write().await.record_reorg();
        Ok(())
    }

    async fn process_responder_event(&self, event: ResponderEvent) {
        match event {
            ResponderEvent::ResponseSent { .. } => {
                self.stats.write().await.record_response_sent();
            }
            ResponderEvent::ResponseConfirmed {
                appointment_id,
                block_number,
            } => {
                self.watcher
                    .lock()
                    .await
                    .on_response_confirmed(&appointment_id, block_number)
                    .await;
                self.stats.write().await.record_response_confirmed();
            }
            ResponderEvent::AttemptFailed { .. } => {
                self.stats.write().await.record_attempt_failed();
            }
            ResponderEvent::ResponseFailed { appointment_id } => {
                self.watcher
                    .lock()
                    .await
                    .on_response_failed(&appointment_id);
                self.stats.write().await.record_response_failed();
            }
        }
    }
}
