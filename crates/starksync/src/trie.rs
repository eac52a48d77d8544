//! Binary Merkle-Patricia tree of height 251 over a key prefix of the store.
//!
//! Node hashing follows the StarkNet commitment tree:
//!
//! - binary node: `h(left, right)`
//! - edge node: `h(child, path) + length`
//! - empty tree: `0`
//!
//! Layout under the prefix:
//!
//! - `l || key` -> leaf value
//! - `n || depth || path` -> binary node, holding both children as `(depth, key, hash)`
//! - `r` -> topmost node
//!
//! Edges are not stored: a child sitting more than one level below its parent hangs off an edge
//! whose bits are read from the child's key. An update reads and rewrites only the binary nodes
//! on its own path. A zero value removes the leaf.

use crate::commitment::digest;
use crate::store::{prefixed, KeyValueStore, StoreError, WriteBatch};
use starknet_types_core::felt::Felt;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Number of key bits addressed by the tree.
pub const TRIE_HEIGHT: usize = 251;

const LEAF_TAG: u8 = b'l';
const NODE_TAG: u8 = b'n';
const ROOT_TAG: u8 = b'r';

/// Encoded [NodeRef]: depth (2) + key (32) + hash (32).
const REF_LEN: usize = 66;

/// Errors produced by [PatriciaTrie].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrieError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("key {0} does not fit in 251 bits")]
    KeyOutOfRange(String),

    #[error("corrupt leaf under key {0}")]
    CorruptLeaf(String),

    #[error("corrupt node under key {0}")]
    CorruptNode(String),
}

/// Patricia tree persisting its leaves and binary nodes.
#[derive(Clone)]
pub struct PatriciaTrie {
    store: Arc<dyn KeyValueStore>,
    prefix: Vec<u8>,
}

impl PatriciaTrie {
    pub fn new(store: Arc<dyn KeyValueStore>, prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn get(&self, key: &Felt) -> Result<Option<Felt>, TrieError> {
        let k = path_key(key)?;
        match self.store.get(&self.leaf_entry(&k))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(decode_leaf(&k, &bytes)?)),
        }
    }

    /// Write one leaf straight to the store.
    pub fn put(&self, key: &Felt, value: &Felt) -> Result<(), TrieError> {
        let mut batch = WriteBatch::new();
        self.stage(&[(*key, *value)], &mut batch)?;
        self.store.write_batch(batch)?;
        Ok(())
    }

    pub fn root(&self) -> Result<Felt, TrieError> {
        Staged::new(self).root_hash()
    }

    /// Root the tree would have after applying `updates`, without writing anything.
    pub fn root_with(&self, updates: &[(Felt, Felt)]) -> Result<Felt, TrieError> {
        let mut staged = Staged::new(self);
        for (key, value) in updates {
            staged.apply(path_key(key)?, *value)?;
        }
        staged.root_hash()
    }

    /// Append the writes for `updates` to `batch` and return the resulting root.
    pub fn stage(&self, updates: &[(Felt, Felt)], batch: &mut WriteBatch) -> Result<Felt, TrieError> {
        let mut staged = Staged::new(self);
        for (key, value) in updates {
            staged.apply(path_key(key)?, *value)?;
        }
        let root = staged.root_hash()?;
        for (key, value) in staged.writes {
            match value {
                Some(value) => batch.put(key, value),
                None => batch.delete(key),
            }
        }
        Ok(root)
    }

    fn leaf_entry(&self, key: &[u8; 32]) -> Vec<u8> {
        let mut entry = prefixed(&self.prefix, &[LEAF_TAG]);
        entry.extend_from_slice(key);
        entry
    }

    fn node_entry(&self, depth: usize, key: &[u8; 32]) -> Vec<u8> {
        let mut entry = prefixed(&self.prefix, &[NODE_TAG]);
        entry.extend_from_slice(&(depth as u16).to_be_bytes());
        entry.extend_from_slice(&masked_path(key, depth));
        entry
    }

    fn root_entry(&self) -> Vec<u8> {
        prefixed(&self.prefix, &[ROOT_TAG])
    }
}

/// Topmost node of a subtree: a leaf at depth 251 or a binary node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeRef {
    depth: usize,
    /// A key below the node. Its bits above `depth` are the node's path.
    key: [u8; 32],
    hash: Felt,
}

impl NodeRef {
    fn leaf(key: [u8; 32], value: Felt) -> Self {
        Self {
            depth: TRIE_HEIGHT,
            key,
            hash: value,
        }
    }

    /// Hash as seen from a slot at depth `from`, through an edge when the node sits deeper.
    fn hash_from(&self, from: usize) -> Felt {
        let len = self.depth - from;
        if len == 0 {
            return self.hash;
        }
        digest(&self.hash, &path_value(&self.key, from, len)) + Felt::from(len as u64)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.depth as u16).to_be_bytes());
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.hash.to_bytes_be());
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != REF_LEN {
            return None;
        }
        let depth = usize::from(u16::from_be_bytes([bytes[0], bytes[1]]));
        if depth > TRIE_HEIGHT {
            return None;
        }
        let key: [u8; 32] = bytes[2..34].try_into().ok()?;
        let hash: [u8; 32] = bytes[34..].try_into().ok()?;
        Some(Self {
            depth,
            key,
            hash: Felt::from_bytes_be(&hash),
        })
    }
}

fn binary_hash(depth: usize, children: &[NodeRef; 2]) -> Felt {
    digest(&children[0].hash_from(depth + 1), &children[1].hash_from(depth + 1))
}

/// Pending writes layered over the store; later updates in the same batch read them back.
struct Staged<'a> {
    trie: &'a PatriciaTrie,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> Staged<'a> {
    fn new(trie: &'a PatriciaTrie) -> Self {
        Self {
            trie,
            writes: BTreeMap::new(),
        }
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        match self.writes.get(key) {
            Some(value) => Ok(value.clone()),
            None => Ok(self.trie.store.get(key)?),
        }
    }

    fn root_ref(&self) -> Result<Option<NodeRef>, TrieError> {
        let entry = self.trie.root_entry();
        match self.get(&entry)? {
            None => Ok(None),
            Some(bytes) => NodeRef::decode(&bytes)
                .map(Some)
                .ok_or_else(|| corrupt_node(&entry)),
        }
    }

    fn root_hash(&self) -> Result<Felt, TrieError> {
        Ok(self
            .root_ref()?
            .map_or(Felt::ZERO, |root| root.hash_from(0)))
    }

    fn children(&self, node: &NodeRef) -> Result<[NodeRef; 2], TrieError> {
        let entry = self.trie.node_entry(node.depth, &node.key);
        let bytes = self.get(&entry)?.ok_or_else(|| corrupt_node(&entry))?;
        if bytes.len() != 2 * REF_LEN {
            return Err(corrupt_node(&entry));
        }
        let left = NodeRef::decode(&bytes[..REF_LEN]).ok_or_else(|| corrupt_node(&entry))?;
        let right = NodeRef::decode(&bytes[REF_LEN..]).ok_or_else(|| corrupt_node(&entry))?;
        Ok([left, right])
    }

    fn write_binary(&mut self, depth: usize, key: [u8; 32], children: [NodeRef; 2]) -> NodeRef {
        let mut value = Vec::with_capacity(2 * REF_LEN);
        children[0].encode(&mut value);
        children[1].encode(&mut value);
        self.writes
            .insert(self.trie.node_entry(depth, &key), Some(value));
        NodeRef {
            depth,
            key,
            hash: binary_hash(depth, &children),
        }
    }

    fn apply(&mut self, key: [u8; 32], value: Felt) -> Result<(), TrieError> {
        let root = self.root_ref()?;
        let leaf = self.trie.leaf_entry(&key);
        let root = if value == Felt::ZERO {
            self.writes.insert(leaf, None);
            self.remove(root, 0, &key)?
        } else {
            self.writes.insert(leaf, Some(value.to_bytes_be().to_vec()));
            Some(self.upsert(root, 0, key, value)?)
        };
        let entry = self.trie.root_entry();
        match root {
            Some(root) => {
                let mut bytes = Vec::with_capacity(REF_LEN);
                root.encode(&mut bytes);
                self.writes.insert(entry, Some(bytes));
            }
            None => {
                self.writes.insert(entry, None);
            }
        }
        Ok(())
    }

    /// Set `key` inside the subtree topped by `node`, whose slot is at depth `from`.
    fn upsert(
        &mut self,
        node: Option<NodeRef>,
        from: usize,
        key: [u8; 32],
        value: Felt,
    ) -> Result<NodeRef, TrieError> {
        let Some(node) = node else {
            return Ok(NodeRef::leaf(key, value));
        };
        if let Some(split) = first_difference(&key, &node.key, from, node.depth) {
            let leaf = NodeRef::leaf(key, value);
            let children = if bit(&key, split) {
                [node, leaf]
            } else {
                [leaf, node]
            };
            return Ok(self.write_binary(split, key, children));
        }
        if node.depth == TRIE_HEIGHT {
            return Ok(NodeRef::leaf(key, value));
        }
        let mut children = self.children(&node)?;
        let side = usize::from(bit(&key, node.depth));
        children[side] = self.upsert(Some(children[side]), node.depth + 1, key, value)?;
        Ok(self.write_binary(node.depth, node.key, children))
    }

    /// Drop `key` from the subtree topped by `node`. A binary node left with one child is
    /// replaced by that child.
    fn remove(
        &mut self,
        node: Option<NodeRef>,
        from: usize,
        key: &[u8; 32],
    ) -> Result<Option<NodeRef>, TrieError> {
        let Some(node) = node else {
            return Ok(None);
        };
        if first_difference(key, &node.key, from, node.depth).is_some() {
            return Ok(Some(node));
        }
        if node.depth == TRIE_HEIGHT {
            return Ok(None);
        }
        let mut children = self.children(&node)?;
        let side = usize::from(bit(key, node.depth));
        match self.remove(Some(children[side]), node.depth + 1, key)? {
            None => {
                self.writes
                    .insert(self.trie.node_entry(node.depth, &node.key), None);
                Ok(Some(children[1 - side]))
            }
            Some(child) if child == children[side] => Ok(Some(node)),
            Some(child) => {
                children[side] = child;
                Ok(Some(self.write_binary(node.depth, node.key, children)))
            }
        }
    }
}

fn path_key(key: &Felt) -> Result<[u8; 32], TrieError> {
    let bytes = key.to_bytes_be();
    // 256 - 251 = 5 leading bits must be clear.
    if bytes[0] & 0xf8 != 0 {
        return Err(TrieError::KeyOutOfRange(hex::encode(bytes)));
    }
    Ok(bytes)
}

fn decode_leaf(key: &[u8; 32], bytes: &[u8]) -> Result<Felt, TrieError> {
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| TrieError::CorruptLeaf(hex::encode(key)))?;
    Ok(Felt::from_bytes_be(&raw))
}

fn corrupt_node(entry: &[u8]) -> TrieError {
    TrieError::CorruptNode(hex::encode(entry))
}

/// Bit `depth` of a 251-bit path, counted from the most significant path bit.
fn bit(key: &[u8; 32], depth: usize) -> bool {
    let index = TRIE_HEIGHT - 1 - depth;
    (key[31 - index / 8] >> (index % 8)) & 1 == 1
}

fn first_difference(a: &[u8; 32], b: &[u8; 32], from: usize, to: usize) -> Option<usize> {
    (from..to).find(|&depth| bit(a, depth) != bit(b, depth))
}

/// `key` with path bits from `depth` on cleared.
fn masked_path(key: &[u8; 32], depth: usize) -> [u8; 32] {
    let mut out = [0u8; 32];
    for d in (0..depth).filter(|&d| bit(key, d)) {
        let index = TRIE_HEIGHT - 1 - d;
        out[31 - index / 8] |= 1 << (index % 8);
    }
    out
}

/// Integer value of path bits `[from, from + len)`.
fn path_value(key: &[u8; 32], from: usize, len: usize) -> Felt {
    let mut out = [0u8; 32];
    for depth in from..from + len {
        let mut carry = u8::from(bit(key, depth));
        for byte in out.iter_mut().rev() {
            let next = *byte >> 7;
            *byte = (*byte << 1) | carry;
            carry = next;
        }
    }
    Felt::from_bytes_be(&out)
}
