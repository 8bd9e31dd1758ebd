//! End-to-end tests for the watchtower
//!
//! These drive the admission path and the block pipeline against an
//! in-process scripted chain endpoint: accept appointments, observe
//! dispute logs, and check that responses reach (mock) inclusion.

mod common;

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use tokio::sync::broadcast;

use pisa_tower::blocks::ChainEvent;
use pisa_tower::error::TowerError;
use pisa_tower::gc::GarbageCollector;
use pisa_tower::receipt::recover_receipt_signer;
use pisa_tower::responder::{Responder, ResponderConfig, ResponderEvent, ResponderHandle};
use pisa_tower::store::AppointmentStore;
use pisa_tower::{Tower, TowerConfig};

use common::{
    dispute_log, signed_request, MockChain, RECEIPT_KEY, RESPONDER_KEY, TOWER_CONTRACT,
};

fn test_config(db_path: &std::path::Path) -> TowerConfig {
    TowerConfig {
        json_rpc_url: "http://localhost:8545".to_string(),
        host_name: "127.0.0.1".to_string(),
        host_port: 0,
        responder_key: RESPONDER_KEY.to_string(),
        receipt_key: RECEIPT_KEY.to_string(),
        tower_contract_address: TOWER_CONTRACT.to_string(),
        watcher_response_confirmations: 6,
        rate_limit_user_max: 100,
        rate_limit_user_window_ms: 60_000,
        rate_limit_global_max: 1_000,
        rate_limit_global_window_ms: 60_000,
        polling_interval_ms: 50,
        reorg_window: 200,
        gc_interval_blocks: 10,
        max_queue_depth: 12,
        replacement_rate_percent: 15,
        max_attempts: 5,
        provider_response_timeout_ms: 200,
        attempt_interval_ms: 20,
        db_path: db_path.to_string_lossy().to_string(),
        state_channel_min_dispute_period: 20,
    }
}

struct Harness {
    chain: Arc<MockChain>,
    tower: Arc<Tower>,
    store: Arc<AppointmentStore>,
    responder: ResponderHandle,
    gc: GarbageCollector,
    _db: tempfile::TempDir,
    _responder_task: tokio::task::JoinHandle<()>,
}

fn harness() -> Harness {
    let chain = Arc::new(MockChain::new());
    let db = tempfile::tempdir().unwrap();
    let config = test_config(db.path());

    let signer: PrivateKeySigner = RESPONDER_KEY.parse().unwrap();
    let (responder, handle) = Responder::new(
        chain.clone(),
        signer,
        1,
        0,
        ResponderConfig {
            replacement_rate: config.replacement_rate_percent,
            max_queue_depth: config.max_queue_depth,
            max_attempts: config.max_attempts,
            provider_timeout: Duration::from_millis(config.provider_response_timeout_ms),
            attempt_interval: Duration::from_millis(config.attempt_interval_ms),
            reorg_window: config.reorg_window as u64,
        },
    );
    let responder_task = tokio::spawn(responder.run());

    let store = Arc::new(AppointmentStore::open(db.path()).unwrap());
    let tower = Arc::new(Tower::new(config, chain.clone(), store.clone(), handle.clone()).unwrap());
    let gc = GarbageCollector::new(store.clone(), 10, 6);

    Harness {
        chain,
        tower,
        store,
        responder: handle,
        gc,
        _db: db,
        _responder_task: responder_task,
    }
}

async fn expect_event(
    events: &mut broadcast::Receiver<ResponderEvent>,
    predicate: impl Fn(&ResponderEvent) -> bool,
) -> ResponderEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected responder event before timeout")
}

fn watched_contract() -> Address {
    Address::repeat_byte(0x42)
}

// =============================================================================
// Admission
// =============================================================================

#[tokio::test]
async fn test_admission_returns_verifiable_receipt() {
    let h = harness();
    let request = signed_request(7, 1, watched_contract(), vec![0xa1; 8]);

    let signed = h.tower.add_appointment(request.clone()).await.unwrap();

    // the returned object carries exactly the submitted fields
    assert_eq!(signed.appointment, request);

    // and the receipt verifies against the tower's advertised key
    let tower_contract: Address = TOWER_CONTRACT.parse().unwrap();
    let recovered =
        recover_receipt_signer(&signed.appointment, tower_contract, &signed.signature).unwrap();
    assert_eq!(recovered, h.tower.receipt_address());

    // the record is durable
    let id = signed.appointment.id().to_string();
    assert_eq!(h.store.get(&id).unwrap().unwrap(), signed);
}

#[tokio::test]
async fn test_admission_rejects_bad_requests() {
    let h = harness();

    // wrong payment hash
    let mut request = signed_request(1, 1, watched_contract(), vec![1]);
    request.payment_hash = alloy::primitives::B256::ZERO;
    assert!(matches!(
        h.tower.add_appointment(request).await,
        Err(TowerError::Validation(_))
    ));

    // inverted window
    let mut request = signed_request(2, 1, watched_contract(), vec![1]);
    request.start_block = 600;
    assert!(matches!(
        h.tower.add_appointment(request).await,
        Err(TowerError::Validation(_))
    ));

    // unknown mode
    let mut request = signed_request(3, 1, watched_contract(), vec![1]);
    request.mode = 42;
    assert!(matches!(
        h.tower.add_appointment(request).await,
        Err(TowerError::Validation(_))
    ));

    // tampered contents no longer match the customer signature
    let mut request = signed_request(4, 1, watched_contract(), vec![1]);
    request.end_block += 1;
    assert!(matches!(
        h.tower.add_appointment(request).await,
        Err(TowerError::Validation(_))
    ));

    // stale job id for an existing locator
    let first = signed_request(5, 3, watched_contract(), vec![1]);
    h.tower.add_appointment(first).await.unwrap();
    let stale = signed_request(5, 2, watched_contract(), vec![2]);
    assert!(matches!(
        h.tower.add_appointment(stale).await,
        Err(TowerError::Validation(_))
    ));
}

// =============================================================================
// Trigger and response
// =============================================================================

#[tokio::test]
async fn test_trigger_drives_response_to_confirmation() {
    let mut h = harness();
    h.chain.confirm_broadcasts_at(42);
    h.chain.extend_to(10);

    let mut events = h.responder.subscribe();

    let request = signed_request(7, 1, watched_contract(), vec![0xa1; 8]);
    let expected_id = request.id().to_string();
    h.tower.add_appointment(request).await.unwrap();

    h.chain.push_log(dispute_log(watched_contract(), 10, 0));
    h.tower
        .process_event(ChainEvent::Head(h.chain.block(10)), &mut h.gc)
        .await
        .unwrap();

    expect_event(&mut events, |e| {
        matches!(e, ResponderEvent::ResponseSent { .. })
    })
    .await;
    let confirmed = expect_event(&mut events, |e| {
        matches!(e, ResponderEvent::ResponseConfirmed { .. })
    })
    .await;
    assert_eq!(
        confirmed,
        ResponderEvent::ResponseConfirmed {
            appointment_id: expected_id,
            block_number: 42,
        }
    );
}

#[tokio::test]
async fn test_back_to_back_appointments_both_rescued() {
    let mut h = harness();
    h.chain.confirm_broadcasts_at(42);
    h.chain.extend_to(12);

    let mut events = h.responder.subscribe();

    // first appointment, first dispute, first rescue
    let first = signed_request(1, 1, watched_contract(), vec![0xa1; 8]);
    h.tower.add_appointment(first).await.unwrap();

    h.chain.push_log(dispute_log(watched_contract(), 10, 0));
    h.tower
        .process_event(ChainEvent::Head(h.chain.block(10)), &mut h.gc)
        .await
        .unwrap();
    expect_event(&mut events, |e| {
        matches!(e, ResponderEvent::ResponseConfirmed { .. })
    })
    .await;

    // same shape again under a fresh id; the counter must move twice
    let second = signed_request(2, 1, watched_contract(), vec![0xa1; 8]);
    h.tower.add_appointment(second).await.unwrap();

    h.chain.push_log(dispute_log(watched_contract(), 12, 1));
    h.tower
        .process_event(ChainEvent::Head(h.chain.block(12)), &mut h.gc)
        .await
        .unwrap();
    expect_event(&mut events, |e| {
        matches!(e, ResponderEvent::ResponseConfirmed { .. })
    })
    .await;

    // one response per dispute
    assert_eq!(h.chain.sent_count(), 2);
}

#[tokio::test]
async fn test_replacement_by_job_id_broadcasts_latest_only() {
    let mut h = harness();
    h.chain.confirm_broadcasts_at(42);
    h.chain.extend_to(10);

    let mut events = h.responder.subscribe();

    let job1 = signed_request(7, 1, watched_contract(), vec![0xa1; 8]);
    let job2 = signed_request(7, 2, watched_contract(), vec![0xb2; 8]);
    h.tower.add_appointment(job1).await.unwrap();
    h.tower.add_appointment(job2.clone()).await.unwrap();

    // only the replacement survives in the store
    assert_eq!(h.store.live_ids(), vec![job2.id().to_string()]);

    h.chain.push_log(dispute_log(watched_contract(), 10, 0));
    h.tower
        .process_event(ChainEvent::Head(h.chain.block(10)), &mut h.gc)
        .await
        .unwrap();

    expect_event(&mut events, |e| {
        matches!(e, ResponderEvent::ResponseConfirmed { .. })
    })
    .await;

    // exactly one broadcast, carrying the job 2 payload
    assert_eq!(h.chain.sent_count(), 1);
    assert_eq!(h.chain.sent_containing(&[0xb2; 8]), 1);
    assert_eq!(h.chain.sent_containing(&[0xa1; 8]), 0);
}

// =============================================================================
// Reorg recovery
// =============================================================================

#[tokio::test]
async fn test_orphaned_confirmation_is_reresponded() {
    let mut h = harness();
    h.chain.confirm_broadcasts_at(42);
    h.chain.extend_to(10);

    let mut events = h.responder.subscribe();

    let request = signed_request(7, 1, watched_contract(), vec![0xa1; 8]);
    h.tower.add_appointment(request).await.unwrap();

    h.chain.push_log(dispute_log(watched_contract(), 10, 0));
    h.tower
        .process_event(ChainEvent::Head(h.chain.block(10)), &mut h.gc)
        .await
        .unwrap();
    expect_event(&mut events, |e| {
        matches!(e, ResponderEvent::ResponseConfirmed { .. })
    })
    .await;

    // the confirming block is orphaned; the trigger log (height 10) is not
    h.tower
        .process_event(ChainEvent::ReorgTo(40), &mut h.gc)
        .await
        .unwrap();

    // a second confirmed response follows
    expect_event(&mut events, |e| {
        matches!(e, ResponderEvent::ResponseConfirmed { .. })
    })
    .await;
    assert!(h.chain.sent_count() >= 2);
}

// =============================================================================
// Crash recovery
// =============================================================================

#[tokio::test]
async fn test_recovery_resubscribes_and_replays_triggers() {
    let h = harness();
    h.chain.extend_to(20);

    // an appointment admitted before the "crash"
    let request = signed_request(7, 1, watched_contract(), vec![0xa1; 8]);
    h.tower.add_appointment(request).await.unwrap();
    h.store.set_last_block(20).unwrap();

    // its trigger is on-chain and still visible
    h.chain.push_log(dispute_log(watched_contract(), 15, 0));

    // a fresh tower over the same store: subscriptions rebuilt, trigger
    // replayed, response dispatched
    let db = tempfile::tempdir().unwrap();
    let config = test_config(db.path());
    let signer: PrivateKeySigner = RESPONDER_KEY.parse().unwrap();
    let (responder, handle) = Responder::new(
        h.chain.clone(),
        signer,
        1,
        0,
        ResponderConfig {
            replacement_rate: 15,
            max_queue_depth: 12,
            max_attempts: 5,
            provider_timeout: Duration::from_millis(200),
            attempt_interval: Duration::from_millis(20),
            reorg_window: 200,
        },
    );
    let task = tokio::spawn(responder.run());
    let mut events = handle.subscribe();

    let revived = Tower::new(config, h.chain.clone(), h.store.clone(), handle).unwrap();
    revived.recover().await.unwrap();

    expect_event(&mut events, |e| {
        matches!(e, ResponderEvent::ResponseSent { .. })
    })
    .await;

    task.abort();
}
