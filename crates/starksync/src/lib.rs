//! StarkNet L1 fact resolution and state commitment engine.
//!
//! - **IngestionPipeline**: backfills the state, verifier and memory page registry contract logs
//!   in bounded windows from the deployment block, then live-tails them over a websocket
//!   subscription; emits typed [L1Event]s plus `Synced` markers on one channel.
//! - **FactLedger / FactResolver**: tracks fact -> page hashes -> carrying transaction and
//!   resolves each fact into its memory pages once every dependency is known.
//! - **StateMaterializer**: applies L2 state diffs from the feeder gateway, committing
//!   `h(h(h(contract_hash, storage_root), 0), 0)` per contract into a height-251 Patricia tree.
//! - **Checkpoint**: crash-safe resume points for both pipelines.
//!
//! [Synchronizer::start] wires everything from a [SyncContext].

pub mod abi;
pub mod checkpoint;
pub mod client;
pub mod commitment;
pub mod config;
pub mod cursor;
pub mod feeder;
pub mod indexer;
pub mod ledger;
pub mod materializer;
pub mod network;
pub mod resolver;
pub mod rpc;
pub mod store;
pub mod sync;
pub mod trie;

pub use abi::{decode_log, DecodeError, L1Event, LogOrigin, RawLog};
pub use checkpoint::{Checkpoint, CheckpointError};
pub use client::{ClientError, L1Client, L1Transaction, LogFilter, LogStream};
pub use commitment::{array_digest, contract_commitment, digest, CommitmentError};
pub use config::{
    L1Config, MaterializerConfig, ReconnectionConfig, ResolutionConfig, RetryConfig, SyncConfig,
};
pub use cursor::Cursor;
pub use feeder::{BlockId, FeederClient, FeederError, FeederGatewayClient, StateDiff};
pub use indexer::{IngestError, IngestMessage, IngestionPipeline};
pub use ledger::{FactLedger, FactStatus, LedgerError, LookupTable};
pub use materializer::{ApplyOutcome, MaterializeError, StateMaterializer};
pub use network::{Network, WatchedContracts};
pub use resolver::{Dispatcher, FactResolver, MemoryPage, ResolveError, ResolvedFact};
pub use rpc::JsonRpcClient;
pub use store::{KeyValueStore, MemoryStore, StoreError, WriteBatch};
pub use sync::{SyncContext, SyncError, SyncHandle, Synchronizer};
pub use trie::{PatriciaTrie, TrieError};

/// Field element used for commitments and state tree keys.
pub use starknet_types_core::felt::Felt;
