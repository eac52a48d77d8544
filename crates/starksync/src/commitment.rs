//! Pedersen commitments over the STARK field.
//!
//! `digest` and `array_digest` are the StarkWare Pedersen hash and its chained form
//! (`h(h(h(0, x1), x2) ..., n)`), delegated to `starknet-types-core` so the output matches
//! the network's own commitments bit for bit.

use starknet_types_core::felt::Felt;
use starknet_types_core::hash::{Pedersen, StarkHash};
use thiserror::Error;

/// Errors produced while turning external values into field elements.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommitmentError {
    #[error("invalid hex field element {0:?}")]
    InvalidHex(String),

    #[error("field element {0} does not fit in 252 bits")]
    TooLong(String),

    #[error("value {0} is not below the field modulus")]
    OutOfRange(String),
}

/// Pedersen hash of two field elements.
pub fn digest(a: &Felt, b: &Felt) -> Felt {
    Pedersen::hash(a, b)
}

/// Chained Pedersen hash of a sequence, folding in its length last.
///
/// Empty input is the defined base case `h(0, 0)`.
pub fn array_digest(elements: &[Felt]) -> Felt {
    Pedersen::hash_array(elements)
}

/// Leaf value of a contract in the state tree: `h(h(h(contract_hash, storage_root), 0), 0)`.
pub fn contract_commitment(contract_hash: &Felt, storage_root: &Felt) -> Felt {
    let inner = digest(contract_hash, storage_root);
    let inner = digest(&inner, &Felt::ZERO);
    digest(&inner, &Felt::ZERO)
}

/// Parse a hex string (with or without `0x`) into a field element.
///
/// Unlike a lenient parse, values at or above the modulus are rejected instead of reduced.
pub fn felt_from_hex(s: &str) -> Result<Felt, CommitmentError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CommitmentError::InvalidHex(s.to_string()));
    }
    let digits = digits.trim_start_matches('0');
    if digits.len() > 64 {
        return Err(CommitmentError::TooLong(s.to_string()));
    }
    let padded = format!("{:0>64}", digits);
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(&padded, &mut bytes).map_err(|_| CommitmentError::InvalidHex(s.to_string()))?;
    if bytes > Felt::MAX.to_bytes_be() {
        return Err(CommitmentError::OutOfRange(s.to_string()));
    }
    Ok(Felt::from_bytes_be(&bytes))
}

/// Lowercase `0x`-prefixed, zero-padded hex of a field element.
pub fn felt_to_hex(felt: &Felt) -> String {
    format!("0x{}", hex::encode(felt.to_bytes_be()))
}
