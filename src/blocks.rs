//! Block source and reorg detection
//!
//! The source polls the chain endpoint at a bounded interval and feeds each
//! observed head to the detector. The detector keeps a bounded suffix of
//! recently emitted heads; when a new head does not extend the tip it walks
//! the new chain's ancestry back through the suffix, emits a
//! `ReorgTo(height)` notification, then re-emits the new chain forward. A
//! common ancestor below the retained window is fatal.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::chain::{BlockStub, ChainEndpoint};
use crate::error::{TowerError, TowerResult};

/// Block-derived event flowing through the pipeline, strictly in block order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEvent {
    /// A new canonical head.
    Head(BlockStub),
    /// Blocks at height >= the given height have been orphaned.
    ReorgTo(u64),
}

/// Bounded suffix of emitted canonical heads.
///
/// New heads either extend the tip, repeat a known block, or trigger an
/// ancestry walk that yields a reorg notification plus the replacement
/// segment.
pub struct ReorgDetector {
    suffix: BTreeMap<u64, B256>,
    window: usize,
}

impl ReorgDetector {
    pub fn new(window: usize) -> Self {
        Self {
            suffix: BTreeMap::new(),
            window,
        }
    }

    /// Height/hash of the current tip, if any head has been emitted.
    pub fn tip(&self) -> Option<(u64, B256)> {
        self.suffix.last_key_value().map(|(n, h)| (*n, *h))
    }

    /// Feed a newly observed head; returns the events to emit downstream.
    pub async fn advance(
        &mut self,
        head: BlockStub,
        chain: &dyn ChainEndpoint,
    ) -> TowerResult<Vec<ChainEvent>> {
        let Some((tip_number, tip_hash)) = self.tip() else {
            self.record(head);
            return Ok(vec![ChainEvent::Head(head)]);
        };

        // duplicate or already-known block
        if self.suffix.get(&head.number) == Some(&head.hash) {
            return Ok(vec![]);
        }

        if head.number == tip_number + 1 && head.parent == tip_hash {
            self.record(head);
            return Ok(vec![ChainEvent::Head(head)]);
        }

        // Walk the new chain's ancestry back until a retained head matches.
        let mut segment = vec![head];
        let mut cursor = head;
        let ancestor = loop {
            let parent_number = match cursor.number.checked_sub(1) {
                Some(n) => n,
                None => break None,
            };
            if self.suffix.get(&parent_number) == Some(&cursor.parent) {
                break Some(parent_number);
            }
            let oldest = *self.suffix.keys().next().expect("suffix not empty");
            if parent_number < oldest {
                error!(
                    oldest_retained = oldest,
                    window = self.window,
                    "reorg beyond retained window"
                );
                return Err(TowerError::DeepReorg {
                    oldest_retained: oldest,
                    window: self.window,
                });
            }
            let parent = chain
                .block_by_number(parent_number)
                .await?
                .ok_or(crate::error::ProviderError::MissingBlock {
                    number: parent_number,
                })?;
            segment.push(parent);
            cursor = parent;
        };

        let fork_height = ancestor.map(|a| a + 1).unwrap_or(0);
        let mut events = Vec::with_capacity(segment.len() + 1);
        if fork_height <= tip_number {
            warn!(
                fork_height,
                tip = tip_number,
                depth = tip_number + 1 - fork_height,
                "chain reorganisation detected"
            );
            self.suffix.split_off(&fork_height);
            events.push(ChainEvent::ReorgTo(fork_height));
        }

        segment.reverse();
        for block in segment {
            self.record(block);
            events.push(ChainEvent::Head(block));
        }
        Ok(events)
    }

    fn record(&mut self, block: BlockStub) {
        self.suffix.insert(block.number, block.hash);
        while self.suffix.len() > self.window {
            self.suffix.pop_first();
        }
    }
}

/// Polls the chain endpoint and pushes ordered [`ChainEvent`]s downstream.
pub struct BlockSource {
    chain: Arc<dyn ChainEndpoint>,
    detector: ReorgDetector,
    interval: Duration,
    events: mpsc::Sender<ChainEvent>,
}

impl BlockSource {
    pub fn new(
        chain: Arc<dyn ChainEndpoint>,
        window: usize,
        interval: Duration,
        events: mpsc::Sender<ChainEvent>,
    ) -> Self {
        Self {
            chain,
            detector: ReorgDetector::new(window),
            interval,
            events,
        }
    }

    /// Poll until the event receiver is dropped or a deep reorg is hit.
    pub async fn run(mut self) -> TowerResult<()> {
        info!(interval_ms = self.interval.as_millis() as u64, "block source started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                if !e.is_retryable() {
                    return Err(e);
                }
                debug!(error = %e, "poll failed; will retry");
            }
            if self.events.is_closed() {
                info!("event receiver dropped; block source stopping");
                return Ok(());
            }
        }
    }

    /// One poll step: fetch the head and feed it to the detector.
    pub async fn poll_once(&mut self) -> TowerResult<()> {
        let number = self.chain.head_number().await?;
        if let Some((tip, _)) = self.detector.tip() {
            if number == tip {
                return Ok(());
            }
        }
        let head = self
            .chain
            .block_by_number(number)
            .await?
            .ok_or(crate::error::ProviderError::MissingBlock { number })?;
        let events = self.detector.advance(head, self.chain.as_ref()).await?;
        for event in events {
            if self.events.send(event).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}
