//! Common helpers for integration tests: in-process L1 node and feeder gateway fakes.

#![allow(dead_code)]

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use futures_util::StreamExt;
use starksync::abi::{LogMemoryPageFactContinuous, LogMemoryPagesHashes, LogStateTransitionFact};
use starksync::client::{ClientError, L1Client, L1Transaction, LogFilter, LogStream};
use starksync::config::{L1Config, ReconnectionConfig, RetryConfig};
use starksync::feeder::{
    Block, BlockId, ContractAddresses, ContractCode, DeployedContractEntry, FeederClient,
    FeederError, StateDiffPayload, StateUpdate, StorageEntry, TransactionInfo,
};
use starksync::indexer::IngestMessage;
use starksync::network::WatchedContracts;
use starksync::RawLog;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

pub const DEPLOYMENT_BLOCK: u64 = 100;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn contracts() -> WatchedContracts {
    WatchedContracts {
        state: Address::repeat_byte(0x51),
        gps_verifier: Address::repeat_byte(0x52),
        memory_page_registry: Address::repeat_byte(0x53),
        deployment_block: DEPLOYMENT_BLOCK,
    }
}

/// L1 config with small windows and millisecond backoffs.
pub fn l1_config(window_size: u64) -> L1Config {
    L1Config {
        http_url: "http://fake".into(),
        ws_url: "ws://fake".into(),
        window_size,
        retry: RetryConfig {
            max_attempts: 4,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        reconnection: ReconnectionConfig {
            initial_backoff_secs: 0,
            max_backoff_secs: 0,
        },
    }
}

fn raw_log(address: Address, topic: B256, data: Vec<u8>, block: u64, index: u64, tx: B256) -> RawLog {
    RawLog {
        address,
        topics: vec![topic],
        data: Bytes::from(data),
        block_number: block,
        transaction_hash: tx,
        log_index: index,
        removed: false,
    }
}

pub fn fact_log(block: u64, index: u64, fact: B256) -> RawLog {
    let ev = LogStateTransitionFact {
        stateTransitionFact: fact,
    };
    raw_log(
        contracts().state,
        LogStateTransitionFact::SIGNATURE_HASH,
        ev.encode_data(),
        block,
        index,
        B256::with_last_byte(0xf1),
    )
}

pub fn pages_log(block: u64, index: u64, fact: B256, pages: Vec<B256>) -> RawLog {
    let ev = LogMemoryPagesHashes {
        factHash: fact,
        pagesHashes: pages,
    };
    raw_log(
        contracts().gps_verifier,
        LogMemoryPagesHashes::SIGNATURE_HASH,
        ev.encode_data(),
        block,
        index,
        B256::with_last_byte(0xf2),
    )
}

/// Registration of `page`, carried by transaction `tx`.
pub fn page_log(block: u64, index: u64, page: B256, tx: B256) -> RawLog {
    let ev = LogMemoryPageFactContinuous {
        factHash: B256::ZERO,
        memoryHash: U256::from_be_bytes(page.0),
        prod: U256::from(1u64),
    };
    raw_log(
        contracts().memory_page_registry,
        LogMemoryPageFactContinuous::SIGNATURE_HASH,
        ev.encode_data(),
        block,
        index,
        tx,
    )
}

type Subscriber = (LogFilter, mpsc::UnboundedSender<Result<RawLog, ClientError>>);

#[derive(Default)]
struct FakeL1State {
    head: u64,
    logs: Vec<RawLog>,
    txs: HashMap<B256, L1Transaction>,
    fail_filter_logs: u32,
    windows: Vec<(u64, u64)>,
    subscribers: Vec<Subscriber>,
}

/// In-memory L1 node.
pub struct FakeL1 {
    chain_id: u64,
    state: Mutex<FakeL1State>,
    pub subscriptions: AtomicUsize,
    pub tx_lookups: AtomicUsize,
}

impl FakeL1 {
    pub fn new(chain_id: u64, head: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(FakeL1State {
                head,
                ..Default::default()
            }),
            subscriptions: AtomicUsize::new(0),
            tx_lookups: AtomicUsize::new(0),
        }
    }

    /// Add a historical log; the head moves up to cover it.
    pub fn add_log(&self, log: RawLog) {
        let mut s = self.state.lock().unwrap();
        s.head = s.head.max(log.block_number);
        s.logs.push(log);
    }

    /// Add a log and push it to live subscribers whose filter matches.
    pub fn publish(&self, log: RawLog) {
        let mut s = self.state.lock().unwrap();
        s.head = s.head.max(log.block_number);
        s.logs.push(log.clone());
        s.subscribers.retain(|(filter, sender)| {
            if !filter.matches(&log) {
                return !sender.is_closed();
            }
            sender.send(Ok(log.clone())).is_ok()
        });
    }

    /// Push a log only to subscribers, e.g. a node replaying an already returned log.
    pub fn push_live(&self, log: RawLog) {
        let s = self.state.lock().unwrap();
        for (_, sender) in &s.subscribers {
            let _ = sender.send(Ok(log.clone()));
        }
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub fn add_transaction(&self, hash: B256, input: Vec<u8>) {
        self.state.lock().unwrap().txs.insert(
            hash,
            L1Transaction {
                hash,
                block_number: Some(1),
                input: Bytes::from(input),
            },
        );
    }

    pub fn fail_next_filter_logs(&self, n: u32) {
        self.state.lock().unwrap().fail_filter_logs = n;
    }

    /// Successfully answered `[from, to]` queries, in call order.
    pub fn windows(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().windows.clone()
    }

    /// Drop every live subscription, as a node restart would.
    pub fn close_subscriptions(&self) {
        self.state.lock().unwrap().subscribers.clear();
    }
}

#[async_trait]
impl L1Client for FakeL1 {
    async fn chain_id(&self) -> Result<u64, ClientError> {
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64, ClientError> {
        Ok(self.state.lock().unwrap().head)
    }

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ClientError> {
        let mut s = self.state.lock().unwrap();
        if s.fail_filter_logs > 0 {
            s.fail_filter_logs -= 1;
            return Err(ClientError::Rpc("query timeout".into()));
        }
        let from = filter.from_block.unwrap_or(0);
        let to = filter.to_block.unwrap_or(u64::MAX);
        s.windows.push((from, to));
        let mut logs: Vec<RawLog> = s.logs.iter().filter(|l| filter.matches(l)).cloned().collect();
        logs.sort_by_key(|l| l.position());
        Ok(logs)
    }

    async fn subscribe_logs(&self, filter: &LogFilter) -> Result<LogStream, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().subscribers.push((filter.clone(), tx));
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn transaction_by_hash(&self, hash: B256) -> Result<Option<L1Transaction>, ClientError> {
        self.tx_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().unwrap().txs.get(&hash).cloned())
    }
}

#[derive(Default)]
struct FakeFeederState {
    updates: BTreeMap<u64, StateUpdate>,
    fail_state_update: u32,
}

/// In-memory feeder gateway.
pub struct FakeFeeder {
    state_contract: Address,
    state: Mutex<FakeFeederState>,
    pub code_calls: AtomicUsize,
    pub transaction_calls: AtomicUsize,
}

impl FakeFeeder {
    pub fn new() -> Self {
        Self {
            state_contract: contracts().state,
            state: Mutex::new(FakeFeederState::default()),
            code_calls: AtomicUsize::new(0),
            transaction_calls: AtomicUsize::new(0),
        }
    }

    pub fn add_update(&self, block: u64, update: StateUpdate) {
        self.state.lock().unwrap().updates.insert(block, update);
    }

    pub fn fail_next_state_updates(&self, n: u32) {
        self.state.lock().unwrap().fail_state_update = n;
    }
}

#[async_trait]
impl FeederClient for FakeFeeder {
    async fn contract_addresses(&self) -> Result<ContractAddresses, FeederError> {
        Ok(ContractAddresses {
            starknet: format!("{}", self.state_contract),
            gps_statement_verifier: format!("{}", contracts().gps_verifier),
        })
    }

    async fn state_update(&self, block: BlockId) -> Result<StateUpdate, FeederError> {
        let mut s = self.state.lock().unwrap();
        if s.fail_state_update > 0 {
            s.fail_state_update -= 1;
            return Err(FeederError::Api {
                code: "503".into(),
                message: "unavailable".into(),
            });
        }
        let BlockId::Number(n) = block else {
            return Err(FeederError::BlockNotFound(block.to_string()));
        };
        s.updates
            .get(&n)
            .cloned()
            .ok_or_else(|| FeederError::BlockNotFound(n.to_string()))
    }

    async fn code(&self, address: &str, _block_hash: &str) -> Result<ContractCode, FeederError> {
        self.code_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ContractCode {
            bytecode: vec![address.to_string()],
            abi: serde_json::json!([]),
        })
    }

    async fn block(&self, block: BlockId) -> Result<Block, FeederError> {
        let BlockId::Number(n) = block else {
            return Err(FeederError::BlockNotFound(block.to_string()));
        };
        Ok(Block {
            block_hash: format!("0x{n:x}"),
            block_number: n,
            parent_block_hash: None,
            state_root: None,
            transactions: vec![serde_json::from_value(serde_json::json!({
                "transaction_hash": format!("0x{:x}", n + 1000),
                "type": "INVOKE_FUNCTION"
            }))
            .map_err(|e| FeederError::Decode {
                method: "get_block",
                reason: e.to_string(),
            })?],
            rest: BTreeMap::new(),
        })
    }

    async fn transaction(&self, hash: &str) -> Result<TransactionInfo, FeederError> {
        self.transaction_calls.fetch_add(1, Ordering::SeqCst);
        Ok(TransactionInfo {
            status: "ACCEPTED_ON_L1".into(),
            block_hash: None,
            block_number: None,
            transaction: serde_json::json!({ "transaction_hash": hash }),
        })
    }
}

/// State update deploying `deployed` and writing `storage`.
pub fn state_update(
    block: u64,
    deployed: &[(&str, &str)],
    storage: &[(&str, &[(&str, &str)])],
) -> StateUpdate {
    StateUpdate {
        block_hash: format!("0x{:x}", block + 0xb000),
        new_root: "0x0".into(),
        old_root: None,
        state_diff: StateDiffPayload {
            storage_diffs: storage
                .iter()
                .map(|(address, kvs)| {
                    let entries = kvs
                        .iter()
                        .map(|(key, value)| StorageEntry {
                            key: key.to_string(),
                            value: value.to_string(),
                        })
                        .collect();
                    (address.to_string(), entries)
                })
                .collect(),
            deployed_contracts: deployed
                .iter()
                .map(|(address, hash)| DeployedContractEntry {
                    address: address.to_string(),
                    contract_hash: hash.to_string(),
                })
                .collect(),
        },
    }
}

/// Receive until `done` returns true or the timeout expires.
pub async fn collect_until(
    rx: &mut mpsc::Receiver<IngestMessage>,
    timeout: Duration,
    mut done: impl FnMut(&[IngestMessage]) -> bool,
) -> Vec<IngestMessage> {
    let mut out = Vec::new();
    let _ = tokio::time::timeout(timeout, async {
        while let Some(msg) = rx.recv().await {
            out.push(msg);
            if done(&out) {
                break;
            }
        }
    })
    .await;
    out
}

/// Poll `cond` every few milliseconds until it holds or the timeout expires.
pub async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
