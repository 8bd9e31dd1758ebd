//! Replace-by-fee gas queue
//!
//! The responder's single signing key has a single monotone nonce space.
//! The queue orders outgoing intents by ascending nonce and resolves
//! conflicts with replace-by-fee: an intent willing to pay more is inserted
//! at a lower nonce and every displaced transaction is re-priced so miners
//! prefer the replacement.
//!
//! The queue is a value: every operation returns a new queue and the
//! constructor re-checks the invariants on each derived version. nonces form
//! a contiguous ascending run ending at `empty_nonce - 1`, ideal prices are
//! non-increasing along the queue, current prices never fall below ideal,
//! and no two live items share a transaction identifier.

use alloy::primitives::{Address, Bytes, U256};

/// Identifier of the transaction an intent will produce.
///
/// Two intents with equal identity would race each other on-chain; the
/// queue refuses to hold both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIdentity {
    pub chain_id: u64,
    pub to: Address,
    pub value: U256,
    pub payload: Bytes,
    pub gas_limit: u64,
}

/// A queued intent: the transaction identity plus the higher-level response
/// it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRequest {
    pub identity: TxIdentity,
    /// Appointment the response belongs to; synthetic for no-op reclaims
    pub appointment_id: String,
    /// Deadline after which the response is pointless
    pub end_block: u64,
    /// Nonce-reclaiming self-transfer, invisible to event listeners
    pub noop: bool,
}

/// One live queue slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasQueueItem {
    pub request: QueueRequest,
    /// Price the fee model wants to pay
    pub ideal_gas_price: u128,
    /// Price currently broadcast at; rises via the replacement rate
    pub current_gas_price: u128,
    pub nonce: u64,
}

/// Errors surfaced by queue operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("gas queue is full (depth {depth})")]
    Full { depth: usize },

    /// Invariant breach in a derived queue. A programming bug, never
    /// user-visible.
    #[error("gas queue invariant violated: {0}")]
    Inconsistent(String),
}

/// Minimum price that replaces a transaction broadcast at `price`.
pub fn replacement_price(price: u128, rate_percent: u32) -> u128 {
    (price * (100 + rate_percent as u128)).div_ceil(100)
}

/// Ordered queue of outgoing intents under one signing key.
#[derive(Debug, Clone)]
pub struct GasQueue {
    items: Vec<GasQueueItem>,
    empty_nonce: u64,
    replacement_rate: u32,
    max_depth: usize,
}

impl GasQueue {
    /// An empty queue whose next free nonce is `initial_nonce`.
    pub fn new(initial_nonce: u64, replacement_rate: u32, max_depth: usize) -> Self {
        Self {
            items: Vec::new(),
            empty_nonce: initial_nonce,
            replacement_rate,
            max_depth,
        }
    }

    /// Build a queue from existing items, enforcing the invariants.
    pub fn from_items(
        items: Vec<GasQueueItem>,
        empty_nonce: u64,
        replacement_rate: u32,
        max_depth: usize,
    ) -> Result<Self, QueueError> {
        let queue = Self {
            items,
            empty_nonce,
            replacement_rate,
            max_depth,
        };
        queue.check()?;
        Ok(queue)
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.items.len() > self.max_depth {
            return Err(QueueError::Inconsistent(format!(
                "length {} exceeds max depth {}",
                self.items.len(),
                self.max_depth
            )));
        }
        for pair in self.items.windows(2) {
            if pair[1].nonce != pair[0].nonce + 1 {
                return Err(QueueError::Inconsistent(format!(
                    "nonces not contiguous: {} then {}",
                    pair[0].nonce, pair[1].nonce
                )));
            }
            if pair[1].ideal_gas_price > pair[0].ideal_gas_price {
                return Err(QueueError::Inconsistent(format!(
                    "ideal gas price increased along the queue: {} then {}",
                    pair[0].ideal_gas_price, pair[1].ideal_gas_price
                )));
            }
        }
        if let Some(last) = self.items.last() {
            if self.empty_nonce != last.nonce + 1 {
                return Err(QueueError::Inconsistent(format!(
                    "empty nonce {} does not follow last nonce {}",
                    self.empty_nonce, last.nonce
                )));
            }
        }
        for item in &self.items {
            if item.current_gas_price < item.ideal_gas_price {
                return Err(QueueError::Inconsistent(format!(
                    "current price {} below ideal {} at nonce {}",
                    item.current_gas_price, item.ideal_gas_price, item.nonce
                )));
            }
        }
        for (i, a) in self.items.iter().enumerate() {
            for b in &self.items[i + 1..] {
                if a.request.identity == b.request.identity {
                    return Err(QueueError::Inconsistent(format!(
                        "duplicate transaction identity at nonces {} and {}",
                        a.nonce, b.nonce
                    )));
                }
            }
        }
        Ok(())
    }

    /// Insert an intent at the position its ideal price earns.
    ///
    /// Appends when no queued item pays less. Otherwise the new item takes
    /// the nonce of the first cheaper item and every displaced item whose
    /// advanced nonce lands on a slot that already carried a transaction is
    /// re-priced for replace-by-fee. The last displaced item moves onto the
    /// previously free nonce and keeps its price.
    pub fn add(&self, request: QueueRequest, ideal_gas_price: u128) -> Result<Self, QueueError> {
        if self.items.len() >= self.max_depth {
            return Err(QueueError::Full {
                depth: self.max_depth,
            });
        }

        let mut items = self.items.clone();
        let position = items
            .iter()
            .position(|item| item.ideal_gas_price < ideal_gas_price);

        match position {
            None => {
                items.push(GasQueueItem {
                    request,
                    ideal_gas_price,
                    current_gas_price: ideal_gas_price,
                    nonce: self.empty_nonce,
                });
            }
            Some(i) => {
                let freed_nonce = items[i].nonce;
                let last = items.len() - 1;
                for (j, item) in items.iter_mut().enumerate().skip(i) {
                    item.nonce += 1;
                    // Every slot except the previously free one already
                    // carries a broadcast transaction that must be outbid.
                    if j < last {
                        item.current_gas_price = item.current_gas_price.max(replacement_price(
                            item.current_gas_price,
                            self.replacement_rate,
                        ));
                    }
                }
                items.insert(
                    i,
                    GasQueueItem {
                        request,
                        ideal_gas_price,
                        current_gas_price: ideal_gas_price,
                        nonce: freed_nonce,
                    },
                );
            }
        }

        Self::from_items(
            items,
            self.empty_nonce + 1,
            self.replacement_rate,
            self.max_depth,
        )
    }

    /// Drop the head after its transaction confirmed at `nonce`.
    pub fn confirm_head(&self, nonce: u64) -> Result<(Self, GasQueueItem), QueueError> {
        let head = self
            .items
            .first()
            .ok_or_else(|| QueueError::Inconsistent("confirm on empty queue".into()))?;
        if head.nonce != nonce {
            return Err(QueueError::Inconsistent(format!(
                "confirmed nonce {nonce} is not the head nonce {}",
                head.nonce
            )));
        }
        let mut items = self.items.clone();
        let confirmed = items.remove(0);
        let queue = Self::from_items(
            items,
            self.empty_nonce,
            self.replacement_rate,
            self.max_depth,
        )?;
        Ok((queue, confirmed))
    }

    /// Raise the head's broadcast price by the replacement rate.
    pub fn bump_head(&self) -> Result<Self, QueueError> {
        let mut items = self.items.clone();
        let head = items
            .first_mut()
            .ok_or_else(|| QueueError::Inconsistent("bump on empty queue".into()))?;
        head.current_gas_price = replacement_price(head.current_gas_price, self.replacement_rate);
        Self::from_items(
            items,
            self.empty_nonce,
            self.replacement_rate,
            self.max_depth,
        )
    }

    /// Remove a never-broadcast intent and close the nonce gap.
    ///
    /// Only valid while nothing at or above the removed nonce has been
    /// broadcast; callers reclaim broadcast nonces with
    /// [`GasQueue::replace_with_noop`] instead.
    pub fn remove_pending(&self, appointment_id: &str) -> Result<(Self, GasQueueItem), QueueError> {
        let index = self
            .items
            .iter()
            .position(|item| item.request.appointment_id == appointment_id)
            .ok_or_else(|| {
                QueueError::Inconsistent(format!("no queued intent for {appointment_id}"))
            })?;
        let mut items = self.items.clone();
        let removed = items.remove(index);
        for item in items.iter_mut().skip(index) {
            item.nonce -= 1;
        }
        let queue = Self::from_items(
            items,
            self.empty_nonce - 1,
            self.replacement_rate,
            self.max_depth,
        )?;
        Ok((queue, removed))
    }

    /// Replace a broadcast intent with a nonce-reclaiming no-op.
    ///
    /// The slot keeps its nonce and ideal price; the current price rises by
    /// the replacement rate so the no-op outbids the abandoned transaction.
    pub fn replace_with_noop(
        &self,
        nonce: u64,
        noop: QueueRequest,
    ) -> Result<(Self, GasQueueItem), QueueError> {
        let index = self
            .items
            .iter()
            .position(|item| item.nonce == nonce)
            .ok_or_else(|| QueueError::Inconsistent(format!("no queued intent at nonce {nonce}")))?;
        let mut items = self.items.clone();
        let replaced = items[index].clone();
        items[index] = GasQueueItem {
            request: noop,
            ideal_gas_price: replaced.ideal_gas_price,
            current_gas_price: replacement_price(
                replaced.current_gas_price,
                self.replacement_rate,
            ),
            nonce,
        };
        let queue = Self::from_items(
            items,
            self.empty_nonce,
            self.replacement_rate,
            self.max_depth,
        )?;
        Ok((queue, replaced))
    }

    /// Re-insert an item whose confirming block was orphaned.
    ///
    /// The item returns at its original nonce with its last price.
    pub fn requeue_front(&self, item: GasQueueItem) -> Result<Self, QueueError> {
        match self.items.first() {
            Some(front) if front.nonce != item.nonce + 1 => {
                return Err(QueueError::Inconsistent(format!(
                    "requeued nonce {} does not precede front nonce {}",
                    item.nonce, front.nonce
                )));
            }
            None if item.nonce + 1 != self.empty_nonce => {
                return Err(QueueError::Inconsistent(format!(
                    "requeued nonce {} does not precede empty nonce {}",
                    item.nonce, self.empty_nonce
                )));
            }
            _ => {}
        }
        let mut items = self.items.clone();
        items.insert(0, item);
        Self::from_items(
            items,
            self.empty_nonce,
            self.replacement_rate,
            self.max_depth,
        )
    }

    pub fn head(&self) -> Option<&GasQueueItem> {
        self.items.first()
    }

    pub fn items(&self) -> &[GasQueueItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn empty_nonce(&self) -> u64 {
        self.empty_nonce
    }

    pub fn replacement_rate(&self) -> u32 {
        self.replacement_rate
    }

    pub fn contains(&self, appointment_id: &str) -> bool {
        self.items
            .iter()
            .any(|item| item.request.appointment_id == appointment_id)
    }

    pub fn find(&self, appointment_id: &str) -> Option<&GasQueueItem> {
        self.items
            .iter()
            .find(|item| item.request.appointment_id == appointment_id)
    }
}
