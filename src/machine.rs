//! Per-component anchor state, reduced block-by-block
//!
//! Components register an initial-state function and a reducer; the runtime
//! applies confirmed blocks in order and retains a bounded history of
//! snapshots so a reorg can roll the state back to the fork height. The
//! mapped variant indexes sub-states by a string id drawn from a dynamic
//! collection, such as the set of live appointments.

use std::collections::{BTreeMap, HashMap};

use crate::chain::BlockStub;

/// A block-driven reducer over a single state.
pub trait BlockReducer {
    type State: Clone + Send + 'static;

    fn initial(&self, block: &BlockStub) -> Self::State;

    fn reduce(&self, prev: &Self::State, block: &BlockStub) -> Self::State;
}

/// A block-driven reducer over id-indexed sub-states.
pub trait MappedBlockReducer {
    type State: Clone + Send + 'static;

    fn initial(&self, id: &str, block: &BlockStub) -> Self::State;

    fn reduce(&self, id: &str, prev: &Self::State, block: &BlockStub) -> Self::State;
}

/// Applies blocks to one reducer, keeping per-height snapshots for rollback.
pub struct StateMachine<R: BlockReducer> {
    reducer: R,
    history: BTreeMap<u64, R::State>,
    window: usize,
}

impl<R: BlockReducer> StateMachine<R> {
    pub fn new(reducer: R, window: usize) -> Self {
        Self {
            reducer,
            history: BTreeMap::new(),
            window,
        }
    }

    /// Current state, if any block has been applied.
    pub fn state(&self) -> Option<&R::State> {
        self.history.last_key_value().map(|(_, s)| s)
    }

    /// Reduce the state with a new block and return the result.
    pub fn apply(&mut self, block: &BlockStub) -> &R::State {
        let next = match self.state() {
            None => self.reducer.initial(block),
            Some(prev) => self.reducer.reduce(prev, block),
        };
        self.history.insert(block.number, next);
        while self.history.len() > self.window {
            self.history.pop_first();
        }
        self.history.get(&block.number).expect("just inserted")
    }

    /// Drop snapshots at heights >= `height`.
    pub fn rollback_to(&mut self, height: u64) {
        self.history.split_off(&height);
    }
}

/// Mapped variant: one snapshot history per live id.
pub struct MappedStateMachine<R: MappedBlockReducer> {
    reducer: R,
    histories: HashMap<String, BTreeMap<u64, R::State>>,
    window: usize,
}

impl<R: MappedBlockReducer> MappedStateMachine<R> {
    pub fn new(reducer: R, window: usize) -> Self {
        Self {
            reducer,
            histories: HashMap::new(),
            window,
        }
    }

    pub fn state(&self, id: &str) -> Option<&R::State> {
        self.histories
            .get(id)?
            .last_key_value()
            .map(|(_, s)| s)
    }

    /// Apply a block across the current id collection.
    ///
    /// Ids seen for the first time get an initial state; known ids are
    /// reduced; ids absent from the collection are dropped.
    pub fn apply<'a>(
        &mut self,
        ids: impl IntoIterator<Item = &'a str>,
        block: &BlockStub,
    ) {
        let mut live: HashMap<String, BTreeMap<u64, R::State>> = HashMap::new();
        for id in ids {
            let mut history = self.histories.remove(id).unwrap_or_default();
            let next = match history.last_key_value() {
                None => self.reducer.initial(id, block),
                Some((_, prev)) => self.reducer.reduce(id, prev, block),
            };
            history.insert(block.number, next);
            while history.len() > self.window {
                history.pop_first();
            }
            live.insert(id.to_string(), history);
        }
        self.histories = live;
    }

    /// Roll every id back to before `height`; ids with no older snapshot
    /// are forgotten and re-initialised on their next sighting.
    pub fn rollback_to(&mut self, height: u64) {
        self.histories.retain(|_, history| {
            history.split_off(&height);
            !history.is_empty()
        });
    }
}
