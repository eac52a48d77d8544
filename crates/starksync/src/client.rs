//! L1 client seam.
//!
//! The pipeline and the resolver only see [L1Client]; [crate::rpc::JsonRpcClient] is the
//! JSON-RPC implementation.

use crate::abi::RawLog;
use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::{json, Value};
use thiserror::Error;

/// Transport-level failures. All of them are retryable.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("websocket: {0}")]
    WebSocket(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("subscription closed")]
    SubscriptionClosed,
}

/// Live log stream returned by [L1Client::subscribe_logs].
pub type LogStream = BoxStream<'static, Result<RawLog, ClientError>>;

/// Log query: `{fromBlock, toBlock, address[], topics[][]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub addresses: Vec<Address>,
    /// Position-wise OR-sets; an empty set matches anything.
    pub topics: Vec<Vec<B256>>,
}

impl LogFilter {
    pub fn new(addresses: Vec<Address>, topic0: Vec<B256>) -> Self {
        Self {
            from_block: None,
            to_block: None,
            addresses,
            topics: vec![topic0],
        }
    }

    /// Same filter bounded to `[from, to]`.
    pub fn range(&self, from: u64, to: u64) -> Self {
        Self {
            from_block: Some(from),
            to_block: Some(to),
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Value {
        let mut filter = json!({
            "address": self
                .addresses
                .iter()
                .map(|a| format!("0x{}", hex::encode(a)))
                .collect::<Vec<_>>(),
        });
        if !self.topics.is_empty() {
            filter["topics"] = Value::Array(
                self.topics
                    .iter()
                    .map(|set| {
                        Value::Array(
                            set.iter()
                                .map(|t| Value::String(format!("0x{}", hex::encode(t))))
                                .collect(),
                        )
                    })
                    .collect(),
            );
        }
        if let Some(from) = self.from_block {
            filter["fromBlock"] = Value::String(format!("0x{:x}", from));
        }
        if let Some(to) = self.to_block {
            filter["toBlock"] = Value::String(format!("0x{:x}", to));
        }
        filter
    }

    /// Client-side evaluation, for nodes that ignore or reject the filter.
    pub fn matches(&self, log: &RawLog) -> bool {
        if self.from_block.is_some_and(|from| log.block_number < from)
            || self.to_block.is_some_and(|to| log.block_number > to)
        {
            return false;
        }
        if !self.addresses.is_empty() && !self.addresses.contains(&log.address) {
            return false;
        }
        self.topics.iter().enumerate().all(|(i, set)| {
            set.is_empty() || log.topics.get(i).is_some_and(|t| set.contains(t))
        })
    }
}

/// The parts of an L1 transaction the resolver needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L1Transaction {
    pub hash: B256,
    pub block_number: Option<u64>,
    /// Calldata; for memory page registrations this is the encoded page.
    pub input: Bytes,
}

#[async_trait]
pub trait L1Client: Send + Sync {
    async fn chain_id(&self) -> Result<u64, ClientError>;

    async fn block_number(&self) -> Result<u64, ClientError>;

    /// Logs matching a bounded filter, in chain order.
    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ClientError>;

    /// Logs matching `filter` from the moment the subscription is established.
    async fn subscribe_logs(&self, filter: &LogFilter) -> Result<LogStream, ClientError>;

    /// `None` if the node does not know the transaction.
    async fn transaction_by_hash(&self, hash: B256) -> Result<Option<L1Transaction>, ClientError>;
}
