//! Fact ledger: the pending-fact queue and the two lookup tables behind one lock.
//!
//! ```text
//! fact  -> [page hash, ...]     (LogMemoryPagesHashes)
//! page  -> carrying L1 tx       (LogMemoryPageFactContinuous)
//! queue of observed facts       (LogStateTransitionFact)
//! ```
//!
//! Every mutation is written through to the store before memory changes, so a reload after a
//! crash sees exactly the confirmed state. A resolved marker per fact makes processing
//! at-most-once across replays.

use crate::abi::L1Event;
use crate::store::{prefixed, KeyValueStore, StoreError, WriteBatch};
use alloy::primitives::B256;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

const PENDING_PREFIX: &[u8] = b"ledger/pending/";
const PAGES_PREFIX: &[u8] = b"ledger/pages/";
const PAGE_TX_PREFIX: &[u8] = b"ledger/page_tx/";
const RESOLVED_PREFIX: &[u8] = b"ledger/resolved/";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("fact {0} is not being resolved")]
    NotInFlight(B256),
}

/// First-write-wins map. Entries are immutable once recorded.
#[derive(Debug, Clone)]
pub struct LookupTable<K, V> {
    map: HashMap<K, V>,
}

impl<K: Eq + Hash, V> LookupTable<K, V> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Insert unless the key is present. Returns whether the value was recorded.
    pub fn add(&mut self, key: K, value: V) -> bool {
        if self.map.contains_key(&key) {
            return false;
        }
        self.map.insert(key, value);
        true
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn exists(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key)
    }
}

impl<K: Eq + Hash, V> Default for LookupTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a fact is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactStatus {
    Unknown,
    /// Queued; its page set is not known yet.
    Observed,
    /// Queued with a known page set.
    PagesKnown,
    /// Handed to the resolver.
    Resolving,
    Resolved,
}

/// A fact whose pages and carrying transactions are all known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyFact {
    pub fact: B256,
    /// `(page hash, carrying transaction)` in page order.
    pub pages: Vec<(B256, B256)>,
}

#[derive(Debug, Default)]
struct LedgerState {
    /// `(sequence, fact)` in observation order.
    pending: VecDeque<(u64, B256)>,
    next_seq: u64,
    pages: LookupTable<B256, Vec<B256>>,
    page_tx: LookupTable<B256, B256>,
    in_flight: HashSet<B256>,
}

impl LedgerState {
    fn is_pending(&self, fact: &B256) -> bool {
        self.pending.iter().any(|(_, f)| f == fact)
    }

    /// Pages of `fact` with a recorded transaction that no other fact's page list mentions.
    fn released_pages(&self, fact: &B256) -> Vec<B256> {
        let Some(pages) = self.pages.get(fact) else {
            return Vec::new();
        };
        pages
            .iter()
            .filter(|page| self.page_tx.exists(page))
            .filter(|page| {
                !self
                    .pages
                    .map
                    .iter()
                    .any(|(other, list)| other != fact && list.contains(page))
            })
            .copied()
            .collect()
    }

    /// Page/transaction pairs if every dependency of `fact` is known.
    fn ready(&self, fact: &B256) -> Option<Vec<(B256, B256)>> {
        self.pages
            .get(fact)?
            .iter()
            .map(|page| self.page_tx.get(page).map(|tx| (*page, *tx)))
            .collect()
    }
}

pub struct FactLedger {
    store: Arc<dyn KeyValueStore>,
    strict_order: bool,
    state: Mutex<LedgerState>,
}

impl FactLedger {
    /// Open the ledger, reloading whatever was persisted.
    pub fn load(store: Arc<dyn KeyValueStore>, strict_order: bool) -> Result<Self, LedgerError> {
        let mut state = LedgerState::default();
        for (key, value) in store.scan_prefix(PENDING_PREFIX)? {
            let seq = u64::from_be_bytes(fixed(&key[PENDING_PREFIX.len()..], &key)?);
            let fact = B256::from(fixed::<32>(&value, &key)?);
            state.pending.push_back((seq, fact));
            state.next_seq = state.next_seq.max(seq + 1);
        }
        for (key, value) in store.scan_prefix(PAGES_PREFIX)? {
            let fact = B256::from(fixed::<32>(&key[PAGES_PREFIX.len()..], &key)?);
            if value.len() % 32 != 0 {
                return Err(corrupt(&key, "page list is not a multiple of 32 bytes"));
            }
            let pages = value.chunks_exact(32).map(B256::from_slice).collect();
            state.pages.add(fact, pages);
        }
        for (key, value) in store.scan_prefix(PAGE_TX_PREFIX)? {
            let page = B256::from(fixed::<32>(&key[PAGE_TX_PREFIX.len()..], &key)?);
            state.page_tx.add(page, B256::from(fixed::<32>(&value, &key)?));
        }
        tracing::debug!(
            pending = state.pending.len(),
            facts_with_pages = state.pages.len(),
            pages = state.page_tx.len(),
            "fact ledger loaded"
        );
        Ok(Self {
            store,
            strict_order,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_resolved(&self, fact: &B256) -> Result<bool, LedgerError> {
        Ok(self.store.get(&prefixed(RESOLVED_PREFIX, fact.as_slice()))?.is_some())
    }

    /// Route a decoded event to the right table.
    pub fn apply(&self, event: &L1Event) -> Result<(), LedgerError> {
        match event {
            L1Event::StateTransitionFact { fact, .. } => {
                self.observe_fact(*fact)?;
            }
            L1Event::MemoryPagesHashes { fact, pages, .. } => {
                self.add_pages(*fact, pages)?;
            }
            L1Event::MemoryPageFact { page, origin } => {
                self.add_page_tx(*page, origin.transaction_hash)?;
            }
        }
        Ok(())
    }

    /// Queue a fact. Facts already queued or resolved are ignored.
    pub fn observe_fact(&self, fact: B256) -> Result<bool, LedgerError> {
        let mut state = self.lock();
        if state.is_pending(&fact) || self.is_resolved(&fact)? {
            return Ok(false);
        }
        let seq = state.next_seq;
        self.store.put(
            &prefixed(PENDING_PREFIX, &seq.to_be_bytes()),
            fact.as_slice(),
        )?;
        state.pending.push_back((seq, fact));
        state.next_seq = seq + 1;
        tracing::debug!(fact = %fact, seq, "fact observed");
        Ok(true)
    }

    /// Record the ordered page set of a fact.
    pub fn add_pages(&self, fact: B256, pages: &[B256]) -> Result<bool, LedgerError> {
        let mut state = self.lock();
        if state.pages.exists(&fact) || self.is_resolved(&fact)? {
            return Ok(false);
        }
        let value: Vec<u8> = pages.iter().flat_map(|p| p.0).collect();
        self.store
            .put(&prefixed(PAGES_PREFIX, fact.as_slice()), &value)?;
        state.pages.add(fact, pages.to_vec());
        tracing::debug!(fact = %fact, pages = pages.len(), "page hashes recorded");
        Ok(true)
    }

    /// Record the transaction carrying a page.
    pub fn add_page_tx(&self, page: B256, tx: B256) -> Result<bool, LedgerError> {
        let mut state = self.lock();
        if state.page_tx.exists(&page) {
            return Ok(false);
        }
        self.store
            .put(&prefixed(PAGE_TX_PREFIX, page.as_slice()), tx.as_slice())?;
        state.page_tx.add(page, tx);
        Ok(true)
    }

    /// Claim the next fact whose dependencies are all known.
    ///
    /// In strict mode only the head of the queue is considered, so facts resolve in observed
    /// order; otherwise the oldest ready fact is taken.
    pub fn next_ready(&self) -> Option<ReadyFact> {
        self.next_ready_except(&HashSet::new())
    }

    /// [FactLedger::next_ready], passing over the facts in `skip` in relaxed mode.
    pub fn next_ready_except(&self, skip: &HashSet<B256>) -> Option<ReadyFact> {
        let mut state = self.lock();
        let found = if self.strict_order {
            let (_, head) = *state.pending.front()?;
            if state.in_flight.contains(&head) {
                return None;
            }
            state.ready(&head).map(|pages| (head, pages))
        } else {
            state
                .pending
                .iter()
                .filter(|(_, f)| !state.in_flight.contains(f) && !skip.contains(f))
                .find_map(|(_, f)| state.ready(f).map(|pages| (*f, pages)))
        };
        let (fact, pages) = found?;
        state.in_flight.insert(fact);
        Some(ReadyFact { fact, pages })
    }

    /// Commit a resolution: drop the fact from the queue and mark it resolved, atomically.
    /// Carrying transactions of pages no other fact lists are dropped with it.
    pub fn complete(&self, fact: B256) -> Result<(), LedgerError> {
        let mut state = self.lock();
        if !state.in_flight.contains(&fact) {
            return Err(LedgerError::NotInFlight(fact));
        }
        let released = state.released_pages(&fact);
        let mut batch = WriteBatch::new();
        for (seq, _) in state.pending.iter().filter(|(_, f)| *f == fact) {
            batch.delete(prefixed(PENDING_PREFIX, &seq.to_be_bytes()));
        }
        batch.delete(prefixed(PAGES_PREFIX, fact.as_slice()));
        for page in &released {
            batch.delete(prefixed(PAGE_TX_PREFIX, page.as_slice()));
        }
        batch.put(prefixed(RESOLVED_PREFIX, fact.as_slice()), vec![1u8]);
        self.store.write_batch(batch)?;

        state.pending.retain(|(_, f)| *f != fact);
        state.pages.remove(&fact);
        for page in &released {
            state.page_tx.remove(page);
        }
        state.in_flight.remove(&fact);
        tracing::debug!(fact = %fact, released = released.len(), "fact completed");
        Ok(())
    }

    /// Return a claimed fact to the queue after a failed attempt.
    pub fn abandon(&self, fact: B256) {
        self.lock().in_flight.remove(&fact);
    }

    pub fn status(&self, fact: &B256) -> Result<FactStatus, LedgerError> {
        let state = self.lock();
        if self.is_resolved(fact)? {
            return Ok(FactStatus::Resolved);
        }
        let status = if !state.is_pending(fact) {
            FactStatus::Unknown
        } else if state.in_flight.contains(fact) {
            FactStatus::Resolving
        } else if state.pages.exists(fact) {
            FactStatus::PagesKnown
        } else {
            FactStatus::Observed
        };
        Ok(status)
    }

    /// Pending facts in queue order.
    pub fn pending(&self) -> Vec<B256> {
        self.lock().pending.iter().map(|(_, f)| *f).collect()
    }
}

fn fixed<const N: usize>(bytes: &[u8], key: &[u8]) -> Result<[u8; N], LedgerError> {
    bytes
        .try_into()
        .map_err(|_| corrupt(key, &format!("expected {N} bytes, got {}", bytes.len())))
}

fn corrupt(key: &[u8], reason: &str) -> LedgerError {
    LedgerError::Store(StoreError::Corrupt {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: reason.to_string(),
    })
}
