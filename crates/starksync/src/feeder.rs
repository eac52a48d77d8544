//! L2 feeder gateway: trait, HTTP client and payload types.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

const BLOCK_NOT_FOUND: &str = "BLOCK_NOT_FOUND";

#[derive(Debug, Error)]
pub enum FeederError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("feeder error {code}: {message}")]
    Api { code: String, message: String },
    #[error("block {0} not found")]
    BlockNotFound(String),
    #[error("decode {method}: {reason}")]
    Decode { method: &'static str, reason: String },
}

/// Block selector for feeder queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockId {
    Number(u64),
    Hash(String),
    Latest,
}

impl BlockId {
    fn query(&self) -> Vec<(&'static str, String)> {
        match self {
            BlockId::Number(n) => vec![("blockNumber", n.to_string())],
            BlockId::Hash(h) => vec![("blockHash", h.clone())],
            BlockId::Latest => Vec::new(),
        }
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockId::Number(n) => write!(f, "{n}"),
            BlockId::Hash(h) => write!(f, "{h}"),
            BlockId::Latest => write!(f, "latest"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContractAddresses {
    #[serde(rename = "Starknet")]
    pub starknet: String,
    #[serde(rename = "GpsStatementVerifier")]
    pub gps_statement_verifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageEntry {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeployedContractEntry {
    pub address: String,
    #[serde(alias = "class_hash")]
    pub contract_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StateDiffPayload {
    #[serde(default)]
    pub storage_diffs: BTreeMap<String, Vec<StorageEntry>>,
    #[serde(default)]
    pub deployed_contracts: Vec<DeployedContractEntry>,
}

/// `get_state_update` response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StateUpdate {
    pub block_hash: String,
    pub new_root: String,
    #[serde(default)]
    pub old_root: Option<String>,
    pub state_diff: StateDiffPayload,
}

/// `get_code` response, kept as-is for the code store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCode {
    #[serde(default)]
    pub bytecode: Vec<String>,
    #[serde(default)]
    pub abi: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTransaction {
    pub transaction_hash: String,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

/// `get_block` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub block_hash: String,
    pub block_number: u64,
    #[serde(default)]
    pub parent_block_hash: Option<String>,
    #[serde(default)]
    pub state_root: Option<String>,
    #[serde(default)]
    pub transactions: Vec<BlockTransaction>,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

/// `get_transaction` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub status: String,
    #[serde(default)]
    pub block_hash: Option<String>,
    #[serde(default)]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub transaction: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedContract {
    pub address: String,
    pub contract_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KV {
    pub key: String,
    pub value: String,
}

/// Deployments and storage writes of one L2 block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDiff {
    pub block_number: u64,
    pub block_hash: String,
    pub new_root: String,
    pub deployed_contracts: Vec<DeployedContract>,
    pub storage_diffs: BTreeMap<String, Vec<KV>>,
}

impl StateUpdate {
    pub fn into_state_diff(self, block_number: u64) -> StateDiff {
        StateDiff {
            block_number,
            block_hash: self.block_hash,
            new_root: self.new_root,
            deployed_contracts: self
                .state_diff
                .deployed_contracts
                .into_iter()
                .map(|d| DeployedContract {
                    address: d.address,
                    contract_hash: d.contract_hash,
                })
                .collect(),
            storage_diffs: self
                .state_diff
                .storage_diffs
                .into_iter()
                .map(|(address, entries)| {
                    let kvs = entries
                        .into_iter()
                        .map(|e| KV {
                            key: e.key,
                            value: e.value,
                        })
                        .collect();
                    (address, kvs)
                })
                .collect(),
        }
    }
}

#[async_trait]
pub trait FeederClient: Send + Sync {
    async fn contract_addresses(&self) -> Result<ContractAddresses, FeederError>;

    async fn state_update(&self, block: BlockId) -> Result<StateUpdate, FeederError>;

    async fn code(&self, address: &str, block_hash: &str) -> Result<ContractCode, FeederError>;

    async fn block(&self, block: BlockId) -> Result<Block, FeederError>;

    async fn transaction(&self, hash: &str) -> Result<TransactionInfo, FeederError>;
}

/// HTTP client for `{base_url}/feeder_gateway/<method>`.
pub struct FeederGatewayClient {
    http: reqwest::Client,
    base_url: String,
}

impl FeederGatewayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        method: &'static str,
        query: &[(&'static str, String)],
    ) -> Result<T, FeederError> {
        let url = format!("{}/feeder_gateway/{}", self.base_url, method);
        let resp = self.http.get(&url).query(query).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }
        serde_json::from_str(&body).map_err(|e| FeederError::Decode {
            method,
            reason: e.to_string(),
        })
    }
}

/// Map a non-2xx feeder response to an error.
fn api_error(status: u16, body: &str) -> FeederError {
    #[derive(Deserialize)]
    struct ErrorBody {
        code: String,
        #[serde(default)]
        message: String,
    }
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(err) if err.code.ends_with(BLOCK_NOT_FOUND) => FeederError::BlockNotFound(err.message),
        Ok(err) => FeederError::Api {
            code: err.code,
            message: err.message,
        },
        Err(_) => FeederError::Api {
            code: status.to_string(),
            message: body.to_string(),
        },
    }
}

#[async_trait]
impl FeederClient for FeederGatewayClient {
    async fn contract_addresses(&self) -> Result<ContractAddresses, FeederError> {
        self.get("get_contract_addresses", &[]).await
    }

    async fn state_update(&self, block: BlockId) -> Result<StateUpdate, FeederError> {
        self.get("get_state_update", &block.query()).await
    }

    async fn code(&self, address: &str, block_hash: &str) -> Result<ContractCode, FeederError> {
        let query = [
            ("contractAddress", address.to_string()),
            ("blockHash", block_hash.to_string()),
        ];
        self.get("get_code", &query).await
    }

    async fn block(&self, block: BlockId) -> Result<Block, FeederError> {
        self.get("get_block", &block.query()).await
    }

    async fn transaction(&self, hash: &str) -> Result<TransactionInfo, FeederError> {
        self.get("get_transaction", &[("transactionHash", hash.to_string())])
            .await
    }
}
