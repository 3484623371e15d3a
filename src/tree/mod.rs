//! Sparse Merkle Tree Adapter
//!
//! Fixed-depth (28) sparse Merkle tree over Poseidon, holding one leaf per
//! account position. The tree is append-only in practice: positions
//! `[0, total_accounts)` are written once, everything beyond holds the
//! empty-leaf hash `Poseidon(0,0,0,0,0)`.
//!
//! # Versioning
//!
//! Mutations accumulate in a pending overlay and become durable on
//! `commit(version)`; versions are dense and monotonic, equal to the batch
//! height + 1. Each commit persists an undo journal so `rollback(to)` can
//! restore any earlier committed version after a crash.
//!
//! # Proof orientation
//!
//! Sibling lists are LSB-first: at level `i`, if bit `i` of the account index
//! is 0 the running node is the left input. This orientation is part of the
//! wire contract shared with the circuit.
//!
//! # Store seam
//!
//! Node storage is behind the [`TreeStore`] trait with `memory` (tests,
//! single-pass root computation) and `redis` (production) implementations.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use std::collections::HashMap;
use std::sync::OnceLock;

use ark_bn254::Fr;
use ark_ff::Zero;
use serde::{Deserialize, Serialize};

use crate::crypto::poseidon::{fr_from_bytes, fr_to_bytes32, poseidon_hash};
use crate::error::{PorError, Result};
use crate::types::{Bytes32, ACCOUNT_TREE_DEPTH};

/// Key-value backend for tree nodes, the version marker and undo journals.
pub trait TreeStore: Send {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set_many(&mut self, entries: &[(String, Vec<u8>)]) -> Result<()>;
    fn delete_many(&mut self, keys: &[String]) -> Result<()>;
}

fn node_key(level: usize, index: u64) -> String {
    format!("smt:n:{}:{}", level, index)
}

fn journal_key(version: u64) -> String {
    format!("smt:j:{}", version)
}

const VERSION_KEY: &str = "smt:version";

/// Undo journal of one commit: previous value per touched node
/// (`None` = node did not exist before).
#[derive(Serialize, Deserialize)]
struct Journal {
    entries: Vec<(String, Option<Bytes32>)>,
}

/// Hash of two sibling nodes.
fn hash_nodes(left: &Bytes32, right: &Bytes32) -> Bytes32 {
    fr_to_bytes32(&poseidon_hash(&[fr_from_bytes(left), fr_from_bytes(right)]))
}

/// Default (all-empty-subtree) hash per level, level 0 being the leaves.
fn default_hashes() -> &'static [Bytes32; ACCOUNT_TREE_DEPTH + 1] {
    static CELL: OnceLock<[Bytes32; ACCOUNT_TREE_DEPTH + 1]> = OnceLock::new();
    CELL.get_or_init(|| {
        let mut out = [[0u8; 32]; ACCOUNT_TREE_DEPTH + 1];
        out[0] = fr_to_bytes32(&poseidon_hash(&[Fr::zero(); 5]));
        for level in 1..=ACCOUNT_TREE_DEPTH {
            out[level] = hash_nodes(&out[level - 1], &out[level - 1]);
        }
        out
    })
}

/// `Poseidon(0,0,0,0,0)`, the hash every unwritten account position holds.
pub fn empty_leaf_hash() -> Bytes32 {
    default_hashes()[0]
}

/// Root of the all-empty tree at depth 28; the verifier's replay starts here.
pub fn empty_tree_root() -> Bytes32 {
    default_hashes()[ACCOUNT_TREE_DEPTH]
}

/// Opens the account tree on the store named by the config: `memory` for
/// tests and single-pass root computation, `redis` for production.
pub fn open_account_tree(config: &crate::config::TreeDbConfig) -> Result<AccountTree> {
    let store: Box<dyn TreeStore> = match config.driver.as_str() {
        "memory" => Box::new(MemoryStore::new()),
        "redis" => Box::new(RedisStore::connect(&config.option.addr)?),
        other => {
            return Err(PorError::ConfigInvariant(format!(
                "unknown tree db driver {:?}",
                other
            )))
        }
    };
    AccountTree::new(store)
}

/// Versioned account tree over a pluggable node store.
pub struct AccountTree {
    store: Box<dyn TreeStore>,
    /// Uncommitted node writes, layered over the store.
    pending: HashMap<(usize, u64), Bytes32>,
    /// Last committed value of every node touched since the last commit.
    pending_old: HashMap<(usize, u64), Option<Bytes32>>,
    latest_version: u64,
}

impl AccountTree {
    pub fn new(store: Box<dyn TreeStore>) -> Result<Self> {
        let mut tree = AccountTree {
            store,
            pending: HashMap::new(),
            pending_old: HashMap::new(),
            latest_version: 0,
        };
        if let Some(raw) = tree.store.get(VERSION_KEY)? {
            let text = String::from_utf8_lossy(&raw).to_string();
            tree.latest_version = text.parse().map_err(|_| {
                PorError::ConfigInvariant(format!("corrupt tree version marker: {}", text))
            })?;
        }
        Ok(tree)
    }

    pub fn latest_version(&self) -> u64 {
        self.latest_version
    }

    fn node(&mut self, level: usize, index: u64) -> Result<Bytes32> {
        if let Some(v) = self.pending.get(&(level, index)) {
            return Ok(*v);
        }
        match self.store.get(&node_key(level, index))? {
            Some(raw) => raw.try_into().map_err(|_| {
                PorError::ConfigInvariant(format!("corrupt node at level {} index {}", level, index))
            }),
            None => Ok(default_hashes()[level]),
        }
    }

    pub fn root(&mut self) -> Result<Bytes32> {
        self.node(ACCOUNT_TREE_DEPTH, 0)
    }

    pub fn get_leaf(&mut self, index: u64) -> Result<Bytes32> {
        self.node(0, index)
    }

    /// LSB-first sibling list authenticating position `index`.
    pub fn get_proof(&mut self, index: u64) -> Result<[Bytes32; ACCOUNT_TREE_DEPTH]> {
        let mut proof = [[0u8; 32]; ACCOUNT_TREE_DEPTH];
        for level in 0..ACCOUNT_TREE_DEPTH {
            let sibling = (index >> level) ^ 1;
            proof[level] = self.node(level, sibling)?;
        }
        Ok(proof)
    }

    fn write_node(&mut self, level: usize, index: u64, value: Bytes32) -> Result<()> {
        if !self.pending_old.contains_key(&(level, index)) {
            let old = self
                .store
                .get(&node_key(level, index))?
                .map(|raw| {
                    raw.try_into().map_err(|_| {
                        PorError::ConfigInvariant("corrupt node during journaling".to_string())
                    })
                })
                .transpose()?;
            self.pending_old.insert((level, index), old);
        }
        self.pending.insert((level, index), value);
        Ok(())
    }

    /// Writes `leaf` at `index` and recomputes the path to the root. The new
    /// root is visible immediately through `root()`; durability comes with
    /// `commit`.
    pub fn set(&mut self, index: u64, leaf: Bytes32) -> Result<()> {
        debug_assert!(index < 1u64 << ACCOUNT_TREE_DEPTH);
        self.write_node(0, index, leaf)?;
        let mut position = index;
        for level in 1..=ACCOUNT_TREE_DEPTH {
            let left = self.node(level - 1, position & !1)?;
            let right = self.node(level - 1, position | 1)?;
            position >>= 1;
            self.write_node(level, position, hash_nodes(&left, &right))?;
        }
        Ok(())
    }

    /// Seals the pending overlay as `version`. Versions are dense: `version`
    /// must be exactly `latest_version + 1`.
    pub fn commit(&mut self, version: u64) -> Result<u64> {
        if version != self.latest_version + 1 {
            return Err(PorError::ConfigInvariant(format!(
                "non-monotonic tree commit: latest {} requested {}",
                self.latest_version, version
            )));
        }
        let journal = Journal {
            entries: self
                .pending_old
                .iter()
                .map(|(&(level, index), old)| (node_key(level, index), *old))
                .collect(),
        };
        let journal_blob = bincode::serialize(&journal)
            .map_err(|e| PorError::CryptoFailure(format!("journal encode: {}", e)))?;

        let mut entries: Vec<(String, Vec<u8>)> = self
            .pending
            .iter()
            .map(|(&(level, index), value)| (node_key(level, index), value.to_vec()))
            .collect();
        entries.push((journal_key(version), journal_blob));
        entries.push((VERSION_KEY.to_string(), version.to_string().into_bytes()));
        self.store.set_many(&entries)?;

        self.pending.clear();
        self.pending_old.clear();
        self.latest_version = version;
        Ok(version)
    }

    /// Discards uncommitted changes and unwinds committed versions down to
    /// `to_version` by replaying undo journals.
    pub fn rollback(&mut self, to_version: u64) -> Result<()> {
        self.pending.clear();
        self.pending_old.clear();
        while self.latest_version > to_version {
            let version = self.latest_version;
            let raw = self
                .store
                .get(&journal_key(version))?
                .ok_or_else(|| {
                    PorError::ConfigInvariant(format!("missing undo journal for version {}", version))
                })?;
            let journal: Journal = bincode::deserialize(&raw)
                .map_err(|e| PorError::CryptoFailure(format!("journal decode: {}", e)))?;

            let mut restores: Vec<(String, Vec<u8>)> = Vec::new();
            let mut deletions: Vec<String> = Vec::new();
            for (key, old) in journal.entries {
                match old {
                    Some(value) => restores.push((key, value.to_vec())),
                    None => deletions.push(key),
                }
            }
            let next = version - 1;
            restores.push((VERSION_KEY.to_string(), next.to_string().into_bytes()));
            self.store.set_many(&restores)?;
            deletions.push(journal_key(version));
            self.store.delete_many(&deletions)?;
            self.latest_version = next;
        }
        Ok(())
    }
}

/// Replays an LSB-first sibling path and compares against `root`.
/// Bit = 0 means the running node is the left hash input.
pub fn verify_merkle_proof(
    root: &Bytes32,
    account_index: u32,
    proof: &[Bytes32],
    leaf: &Bytes32,
) -> bool {
    if proof.len() != ACCOUNT_TREE_DEPTH {
        return false;
    }
    let mut node = *leaf;
    for (level, sibling) in proof.iter().enumerate() {
        node = if account_index & (1 << level) == 0 {
            hash_nodes(&node, sibling)
        } else {
            hash_nodes(sibling, &node)
        };
    }
    node == *root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_tree() -> AccountTree {
        AccountTree::new(Box::new(MemoryStore::new())).unwrap()
    }

    #[test]
    fn test_empty_tree_root_is_folded_empty_leaf() {
        let mut expected = empty_leaf_hash();
        for _ in 0..ACCOUNT_TREE_DEPTH {
            expected = hash_nodes(&expected, &expected);
        }
        assert_eq!(empty_tree_root(), expected);

        let mut tree = memory_tree();
        assert_eq!(tree.root().unwrap(), empty_tree_root());
        assert_eq!(tree.get_leaf(12345).unwrap(), empty_leaf_hash());
    }

    #[test]
    fn test_set_get_proof_roundtrip() {
        let mut tree = memory_tree();
        let leaf = [7u8; 32];
        // fresh position authenticates the empty leaf first
        let prior = tree.get_proof(3).unwrap();
        assert!(verify_merkle_proof(
            &tree.root().unwrap(),
            3,
            &prior,
            &empty_leaf_hash()
        ));

        tree.set(3, leaf).unwrap();
        let root = tree.root().unwrap();
        let proof = tree.get_proof(3).unwrap();
        assert!(verify_merkle_proof(&root, 3, &proof, &leaf));
        assert!(!verify_merkle_proof(&root, 3, &proof, &empty_leaf_hash()));
        assert!(!verify_merkle_proof(&root, 2, &proof, &leaf));
    }

    #[test]
    fn test_neighbor_updates_share_path() {
        let mut tree = memory_tree();
        tree.set(0, [1u8; 32]).unwrap();
        tree.set(1, [2u8; 32]).unwrap();
        let root = tree.root().unwrap();
        let proof0 = tree.get_proof(0).unwrap();
        let proof1 = tree.get_proof(1).unwrap();
        assert_eq!(proof0[0], [2u8; 32]);
        assert_eq!(proof1[0], [1u8; 32]);
        assert!(verify_merkle_proof(&root, 0, &proof0, &[1u8; 32]));
        assert!(verify_merkle_proof(&root, 1, &proof1, &[2u8; 32]));
    }

    #[test]
    fn test_commit_rollback_restores_root() {
        let mut tree = memory_tree();
        tree.set(0, [1u8; 32]).unwrap();
        tree.commit(1).unwrap();
        let root_v1 = tree.root().unwrap();

        tree.set(1, [2u8; 32]).unwrap();
        tree.commit(2).unwrap();
        assert_ne!(tree.root().unwrap(), root_v1);
        assert_eq!(tree.latest_version(), 2);

        tree.rollback(1).unwrap();
        assert_eq!(tree.latest_version(), 1);
        assert_eq!(tree.root().unwrap(), root_v1);

        tree.rollback(0).unwrap();
        assert_eq!(tree.root().unwrap(), empty_tree_root());
    }

    #[test]
    fn test_rollback_discards_pending() {
        let mut tree = memory_tree();
        tree.set(0, [1u8; 32]).unwrap();
        tree.commit(1).unwrap();
        let committed_root = tree.root().unwrap();
        tree.set(5, [9u8; 32]).unwrap();
        tree.rollback(1).unwrap();
        assert_eq!(tree.root().unwrap(), committed_root);
    }

    #[test]
    fn test_commit_requires_dense_versions() {
        let mut tree = memory_tree();
        tree.set(0, [1u8; 32]).unwrap();
        assert!(tree.commit(2).is_err());
        assert_eq!(tree.commit(1).unwrap(), 1);
    }

    #[test]
    fn test_version_survives_reopen() {
        // MemoryStore clones share the underlying map, standing in for a
        // persistent backend across a restart
        let store = MemoryStore::new();
        {
            let mut tree = AccountTree::new(Box::new(store.clone())).unwrap();
            tree.set(0, [1u8; 32]).unwrap();
            tree.commit(1).unwrap();
        }
        let mut reopened = AccountTree::new(Box::new(store)).unwrap();
        assert_eq!(reopened.latest_version(), 1);
        assert_ne!(reopened.root().unwrap(), empty_tree_root());
        assert_eq!(reopened.get_leaf(0).unwrap(), [1u8; 32]);
    }
}
