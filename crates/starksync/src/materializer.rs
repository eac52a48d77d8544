//! State materializer: applies L2 state diffs to the contract state tree.
//!
//! A block is applied in one store batch: storage leaves, contract hashes, code, and the
//! contract commitments in the state tree. The L2 checkpoint (next block to apply) is saved
//! only after that batch is written, so a crash in between re-applies the block, which is a
//! no-op in effect.

use crate::checkpoint::{Checkpoint, CheckpointError};
use crate::commitment::{contract_commitment, felt_from_hex, felt_to_hex, CommitmentError};
use crate::config::MaterializerConfig;
use crate::feeder::{BlockId, ContractCode, FeederClient, FeederError, StateDiff};
use crate::resolver::ResolvedFact;
use crate::store::{prefixed, KeyValueStore, StoreError, WriteBatch};
use crate::trie::{PatriciaTrie, TrieError};
use alloy::primitives::B256;
use starknet_types_core::felt::Felt;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

const STATE_PREFIX: &[u8] = b"state/";
const STORAGE_PREFIX: &[u8] = b"storage/";
const CONTRACT_HASH_PREFIX: &[u8] = b"contract_hash/";
const CODE_PREFIX: &[u8] = b"code/";
const BLOCK_PREFIX: &[u8] = b"block/";
const TX_PREFIX: &[u8] = b"tx/";
const MEMPAGE_PREFIX: &[u8] = b"mempage/";
const FACT_PAGES_PREFIX: &[u8] = b"fact_pages/";

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error(transparent)]
    Feeder(#[from] FeederError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("block {block}: {field} {value}: {source}")]
    Commitment {
        block: u64,
        field: &'static str,
        value: String,
        #[source]
        source: CommitmentError,
    },
    #[error("block {block}: {source}")]
    Trie {
        block: u64,
        #[source]
        source: TrieError,
    },
    #[error("block {block}: no contract hash known for {address}")]
    UnknownContract { block: u64, address: String },
    #[error("state diff for block {got} while block {expected} is next")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("encode {what}: {reason}")]
    Encode { what: &'static str, reason: String },
}

impl MaterializeError {
    /// Fatal errors halt the materializer; the others are retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MaterializeError::Commitment { .. }
                | MaterializeError::Trie { .. }
                | MaterializeError::UnknownContract { .. }
                | MaterializeError::OutOfOrder { .. }
                | MaterializeError::Encode { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { block: u64, root: Felt },
    /// The checkpoint is already past this block.
    AlreadyApplied(u64),
}

/// Per-contract work for one block.
struct ContractUpdate {
    contract_hash: Felt,
    storage: Vec<(Felt, Felt)>,
}

pub struct StateMaterializer {
    store: Arc<dyn KeyValueStore>,
    feeder: Arc<dyn FeederClient>,
    checkpoint: Checkpoint,
    state_trie: PatriciaTrie,
    config: MaterializerConfig,
}

impl StateMaterializer {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        feeder: Arc<dyn FeederClient>,
        config: MaterializerConfig,
    ) -> Self {
        Self {
            checkpoint: Checkpoint::state(store.clone()),
            state_trie: PatriciaTrie::new(store.clone(), STATE_PREFIX),
            store,
            feeder,
            config,
        }
    }

    /// Next L2 block to apply.
    pub fn next_block(&self) -> Result<u64, StoreError> {
        self.checkpoint.load()
    }

    pub fn state_root(&self) -> Result<Felt, TrieError> {
        self.state_trie.root()
    }

    /// Commitment leaf of a contract in the state tree.
    pub fn contract_state(&self, address: &Felt) -> Result<Option<Felt>, TrieError> {
        self.state_trie.get(address)
    }

    pub fn storage_trie(&self, address: &Felt) -> PatriciaTrie {
        let mut prefix = prefixed(STORAGE_PREFIX, &address.to_bytes_be());
        prefix.push(b'/');
        PatriciaTrie::new(self.store.clone(), prefix)
    }

    pub fn contract_hash(&self, address: &Felt) -> Result<Option<Felt>, StoreError> {
        let key = prefixed(CONTRACT_HASH_PREFIX, &address.to_bytes_be());
        match self.store.get(&key)? {
            None => Ok(None),
            Some(bytes) => {
                let raw: [u8; 32] = bytes.as_slice().try_into().map_err(|_| StoreError::Corrupt {
                    key: format!("contract_hash/{}", felt_to_hex(address)),
                    reason: format!("expected 32 bytes, got {}", bytes.len()),
                })?;
                Ok(Some(Felt::from_bytes_be(&raw)))
            }
        }
    }

    pub fn code(&self, address: &Felt) -> Result<Option<ContractCode>, StoreError> {
        let key = prefixed(CODE_PREFIX, &address.to_bytes_be());
        let Some(bytes) = self.store.get(&key)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: format!("code/{}", felt_to_hex(address)),
                reason: e.to_string(),
            })
    }

    pub fn memory_page(&self, hash: &B256) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.get(&prefixed(MEMPAGE_PREFIX, hash.as_slice()))
    }

    /// Store the pages of a resolved fact under their page hashes.
    pub fn record_resolved_fact(&self, fact: &ResolvedFact) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        for page in &fact.pages {
            batch.put(prefixed(MEMPAGE_PREFIX, page.hash.as_slice()), page.data.to_vec());
        }
        let hashes: Vec<u8> = fact.pages.iter().flat_map(|p| p.hash.0).collect();
        batch.put(prefixed(FACT_PAGES_PREFIX, fact.fact.as_slice()), hashes);
        self.store.write_batch(batch)?;
        tracing::debug!(fact = %fact.fact, pages = fact.pages.len(), "memory pages recorded");
        Ok(())
    }

    /// Apply one block's diff. Diffs must arrive in block order.
    pub async fn apply(&self, diff: &StateDiff) -> Result<ApplyOutcome, MaterializeError> {
        let block = diff.block_number;
        let next = self.checkpoint.load()?;
        if block < next {
            tracing::debug!(block, next, "state diff already applied");
            return Ok(ApplyOutcome::AlreadyApplied(block));
        }
        if block > next {
            return Err(MaterializeError::OutOfOrder {
                expected: next,
                got: block,
            });
        }

        let parse = |field: &'static str, value: &str| {
            felt_from_hex(value).map_err(|source| MaterializeError::Commitment {
                block,
                field,
                value: value.to_string(),
                source,
            })
        };
        let trie_err = |source: TrieError| match source {
            TrieError::Store(e) => MaterializeError::Store(e),
            source => MaterializeError::Trie { block, source },
        };

        let mut batch = WriteBatch::new();
        let mut updates: BTreeMap<Felt, ContractUpdate> = BTreeMap::new();

        for deployed in &diff.deployed_contracts {
            let address = parse("contract address", &deployed.address)?;
            let contract_hash = parse("contract hash", &deployed.contract_hash)?;
            let code = self
                .feeder
                .code(&deployed.address, &diff.block_hash)
                .await?;
            let encoded = serde_json::to_vec(&code).map_err(|e| MaterializeError::Encode {
                what: "contract code",
                reason: e.to_string(),
            })?;
            batch.put(prefixed(CODE_PREFIX, &address.to_bytes_be()), encoded);
            batch.put(
                prefixed(CONTRACT_HASH_PREFIX, &address.to_bytes_be()),
                contract_hash.to_bytes_be().to_vec(),
            );
            updates.insert(
                address,
                ContractUpdate {
                    contract_hash,
                    storage: Vec::new(),
                },
            );
        }

        for (raw_address, kvs) in &diff.storage_diffs {
            let address = parse("contract address", raw_address)?;
            let update = match updates.entry(address) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    // Storage-only update: the contract was deployed in an earlier block.
                    let contract_hash = self.contract_hash(&address)?.ok_or_else(|| {
                        MaterializeError::UnknownContract {
                            block,
                            address: raw_address.clone(),
                        }
                    })?;
                    entry.insert(ContractUpdate {
                        contract_hash,
                        storage: Vec::new(),
                    })
                }
            };
            for kv in kvs {
                update
                    .storage
                    .push((parse("storage key", &kv.key)?, parse("storage value", &kv.value)?));
            }
        }

        let mut leaves = Vec::with_capacity(updates.len());
        for (address, update) in &updates {
            let trie = self.storage_trie(address);
            let storage_root = trie.stage(&update.storage, &mut batch).map_err(trie_err)?;
            let commitment = contract_commitment(&update.contract_hash, &storage_root);
            tracing::debug!(
                block,
                address = %felt_to_hex(address),
                storage_root = %felt_to_hex(&storage_root),
                commitment = %felt_to_hex(&commitment),
                "contract committed"
            );
            leaves.push((*address, commitment));
        }
        let root = self.state_trie.stage(&leaves, &mut batch).map_err(trie_err)?;

        if self.config.store_blocks {
            self.stage_block(block, &mut batch).await?;
        }

        self.store.write_batch(batch)?;
        self.audit_root(block, &root, &diff.new_root);
        self.checkpoint.save(block + 1)?;
        tracing::info!(block, contracts = updates.len(), root = %felt_to_hex(&root), "state update applied");
        Ok(ApplyOutcome::Applied { block, root })
    }

    async fn stage_block(&self, block: u64, batch: &mut WriteBatch) -> Result<(), MaterializeError> {
        let info = self.feeder.block(BlockId::Number(block)).await?;
        for tx in &info.transactions {
            let details = self.feeder.transaction(&tx.transaction_hash).await?;
            let encoded = serde_json::to_vec(&details).map_err(|e| MaterializeError::Encode {
                what: "transaction",
                reason: e.to_string(),
            })?;
            batch.put(prefixed(TX_PREFIX, tx.transaction_hash.as_bytes()), encoded);
        }
        let encoded = serde_json::to_vec(&info).map_err(|e| MaterializeError::Encode {
            what: "block",
            reason: e.to_string(),
        })?;
        batch.put(prefixed(BLOCK_PREFIX, &block.to_be_bytes()), encoded);
        Ok(())
    }

    /// Compare the computed root with the feeder's. A mismatch is logged, not fatal.
    fn audit_root(&self, block: u64, computed: &Felt, reported: &str) {
        match felt_from_hex(reported) {
            Ok(expected) if expected == *computed => {}
            Ok(expected) => tracing::warn!(
                block,
                computed = %felt_to_hex(computed),
                reported = %felt_to_hex(&expected),
                "state root differs from feeder"
            ),
            Err(e) => tracing::warn!(block, reported, reason = %e, "unparseable feeder state root"),
        }
    }

    /// Fetch and apply the next block. `None` when the feeder does not have it yet.
    pub async fn sync_next(&self) -> Result<Option<ApplyOutcome>, MaterializeError> {
        let next = self.checkpoint.load()?;
        match self.feeder.state_update(BlockId::Number(next)).await {
            Ok(update) => self.apply(&update.into_state_diff(next)).await.map(Some),
            Err(FeederError::BlockNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Follow the feeder until cancelled or a fatal error, recording resolved facts as they
    /// arrive.
    pub async fn run(
        self,
        mut resolved: mpsc::Receiver<ResolvedFact>,
        cancel: CancellationToken,
    ) -> Result<(), MaterializeError> {
        let mut unrecorded: VecDeque<ResolvedFact> = VecDeque::new();
        let mut resolved_open = true;
        loop {
            while resolved_open {
                match resolved.try_recv() {
                    Ok(fact) => unrecorded.push_back(fact),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => resolved_open = false,
                }
            }
            while let Some(fact) = unrecorded.front() {
                if let Err(e) = self.record_resolved_fact(fact) {
                    tracing::warn!(fact = %fact.fact, reason = %e, "memory pages not recorded, will retry");
                    break;
                }
                unrecorded.pop_front();
            }
            if cancel.is_cancelled() {
                return Ok(());
            }

            let wait = match self.sync_next().await {
                Ok(Some(_)) => Duration::ZERO,
                Ok(None) => self.config.poll_interval,
                Err(e) if e.is_fatal() => {
                    tracing::error!(reason = %e, "materializer halted");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(reason = %e, "state update failed, retrying");
                    self.config.retry_backoff
                }
            };
            if !wait.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = sleep(wait) => {}
                }
            }
        }
    }
}
