//! ABI types and decoding for the three watched L1 contracts.
//!
//! Raw logs are parsed from the JSON-RPC log shape (eth_getLogs result / eth_subscription
//! payload) and decoded once into a typed [L1Event]; nothing downstream looks fields up by name.

use crate::network::{ContractKind, WatchedContracts};
use alloy::primitives::{Address, Bytes, B256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use serde_json::Value;
use thiserror::Error;

sol! {
    /// StarkNet core contract.
    event LogStateTransitionFact(bytes32 stateTransitionFact);

    /// GPS statement verifier.
    event LogMemoryPagesHashes(bytes32 factHash, bytes32[] pagesHashes);

    /// Memory page fact registry; the page payload lives in the emitting transaction's input.
    event LogMemoryPageFactContinuous(bytes32 factHash, uint256 memoryHash, uint256 prod);
}

/// topic0 of LogStateTransitionFact.
pub const STATE_TRANSITION_FACT_TOPIC: B256 = LogStateTransitionFact::SIGNATURE_HASH;
/// topic0 of LogMemoryPagesHashes.
pub const MEMORY_PAGES_HASHES_TOPIC: B256 = LogMemoryPagesHashes::SIGNATURE_HASH;
/// topic0 of LogMemoryPageFactContinuous.
pub const MEMORY_PAGE_FACT_CONTINUOUS_TOPIC: B256 = LogMemoryPageFactContinuous::SIGNATURE_HASH;

/// All topics the pipeline filters on (one OR-set in topic position 0).
pub fn watched_topics() -> Vec<B256> {
    vec![
        MEMORY_PAGES_HASHES_TOPIC,
        MEMORY_PAGE_FACT_CONTINUOUS_TOPIC,
        STATE_TRANSITION_FACT_TOPIC,
    ]
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("log from unwatched address {0}")]
    UnknownContract(Address),

    #[error("log has no topics")]
    NoTopics,

    #[error("unexpected topic {topic} for {kind:?} contract")]
    UnexpectedTopic { kind: ContractKind, topic: B256 },

    #[error("ABI decode failed: {0}")]
    Abi(String),
}

/// A log as returned by the node, before ABI decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
    /// Set by the node when the log was dropped by a reorg.
    pub removed: bool,
}

impl RawLog {
    /// Parse the JSON-RPC log shape.
    pub fn from_json(log_value: &Value) -> Result<Self, DecodeError> {
        let field = |name: &'static str| {
            log_value
                .get(name)
                .and_then(|v| v.as_str())
                .ok_or(DecodeError::MissingField(name))
        };
        let address = parse_address(field("address")?).map_err(|reason| DecodeError::InvalidField {
            field: "address",
            reason,
        })?;
        let block_number = parse_hex_u64(field("blockNumber")?).map_err(|reason| {
            DecodeError::InvalidField {
                field: "blockNumber",
                reason,
            }
        })?;
        let log_index = parse_hex_u64(field("logIndex")?).map_err(|reason| {
            DecodeError::InvalidField {
                field: "logIndex",
                reason,
            }
        })?;
        let transaction_hash = parse_hex_b256(field("transactionHash")?).map_err(|reason| {
            DecodeError::InvalidField {
                field: "transactionHash",
                reason,
            }
        })?;
        let data = parse_hex_bytes(field("data")?)
            .map_err(|reason| DecodeError::InvalidField {
                field: "data",
                reason,
            })?;
        let topics = log_value
            .get("topics")
            .and_then(|t| t.as_array())
            .ok_or(DecodeError::MissingField("topics"))?
            .iter()
            .map(|t| {
                t.as_str()
                    .ok_or_else(|| "topic not a string".to_string())
                    .and_then(parse_hex_b256)
                    .map_err(|reason| DecodeError::InvalidField {
                        field: "topics",
                        reason,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let removed = log_value
            .get("removed")
            .and_then(|r| r.as_bool())
            .unwrap_or(false);
        Ok(Self {
            address,
            topics,
            data: Bytes::from(data),
            block_number,
            transaction_hash,
            log_index,
            removed,
        })
    }

    /// On-chain position `(block_number, log_index)`.
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }

    pub fn origin(&self) -> LogOrigin {
        LogOrigin {
            block_number: self.block_number,
            transaction_hash: self.transaction_hash,
            log_index: self.log_index,
        }
    }
}

/// Where on L1 an event was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogOrigin {
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
}

/// Typed event emitted by the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L1Event {
    /// A state transition fact was registered by the state contract.
    StateTransitionFact { fact: B256, origin: LogOrigin },
    /// The verifier published the ordered page hashes of a fact.
    MemoryPagesHashes {
        fact: B256,
        pages: Vec<B256>,
        origin: LogOrigin,
    },
    /// A memory page was registered; its payload is the input of `origin.transaction_hash`.
    MemoryPageFact { page: B256, origin: LogOrigin },
}

impl L1Event {
    pub fn origin(&self) -> &LogOrigin {
        match self {
            L1Event::StateTransitionFact { origin, .. }
            | L1Event::MemoryPagesHashes { origin, .. }
            | L1Event::MemoryPageFact { origin, .. } => origin,
        }
    }
}

/// Decode a raw log according to the contract that emitted it.
pub fn decode_log(log: &RawLog, contracts: &WatchedContracts) -> Result<L1Event, DecodeError> {
    let kind = contracts
        .kind_of(&log.address)
        .ok_or(DecodeError::UnknownContract(log.address))?;
    let topic0 = *log.topics.first().ok_or(DecodeError::NoTopics)?;
    let origin = log.origin();
    match kind {
        ContractKind::State if topic0 == STATE_TRANSITION_FACT_TOPIC => {
            let ev = decode::<LogStateTransitionFact>(log)?;
            Ok(L1Event::StateTransitionFact {
                fact: ev.stateTransitionFact,
                origin,
            })
        }
        ContractKind::GpsVerifier if topic0 == MEMORY_PAGES_HASHES_TOPIC => {
            let ev = decode::<LogMemoryPagesHashes>(log)?;
            Ok(L1Event::MemoryPagesHashes {
                fact: ev.factHash,
                pages: ev.pagesHashes,
                origin,
            })
        }
        ContractKind::MemoryPageRegistry if topic0 == MEMORY_PAGE_FACT_CONTINUOUS_TOPIC => {
            let ev = decode::<LogMemoryPageFactContinuous>(log)?;
            Ok(L1Event::MemoryPageFact {
                page: B256::from(ev.memoryHash.to_be_bytes::<32>()),
                origin,
            })
        }
        _ => Err(DecodeError::UnexpectedTopic {
            kind,
            topic: topic0,
        }),
    }
}

fn decode<E: SolEvent>(log: &RawLog) -> Result<E, DecodeError> {
    E::decode_raw_log(log.topics.iter().copied(), &log.data, true)
        .map_err(|e| DecodeError::Abi(e.to_string()))
}

pub(crate) fn parse_hex_u64(s: &str) -> Result<u64, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| format!("parse hex u64: {e}"))
}

pub(crate) fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).map_err(|e| format!("parse hex bytes: {e}"))
}

pub(crate) fn parse_hex_b256(s: &str) -> Result<B256, String> {
    let bytes = parse_hex_bytes(s)?;
    if bytes.len() != 32 {
        return Err(format!("expected 32 bytes, got {}", bytes.len()));
    }
    Ok(B256::from_slice(&bytes))
}

/// Parse a 20-byte address, accepting the 32-byte left-padded form of indexed topics.
pub fn parse_address(s: &str) -> Result<Address, String> {
    let bytes = parse_hex_bytes(s)?;
    match bytes.len() {
        20 => Ok(Address::from_slice(&bytes)),
        32 => Ok(Address::from_slice(&bytes[12..32])),
        n => Err(format!("expected 20 or 32 bytes for address, got {n}")),
    }
}
