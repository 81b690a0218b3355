//! Merkle Tree over Entry Hashes
//!
//! Compact commitment to a set of entries, plus inclusion proofs so a single
//! entry can be shown to belong to an exported bundle.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audit::entry::sha256_hex;
use crate::error::{LedgerError, Result};

fn combine(left: &str, right: &str) -> String {
    sha256_hex(format!("{}{}", left, right).as_bytes())
}

fn next_level(level: &[String]) -> Vec<String> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => combine(left, right),
            [single] => combine(single, single),
            _ => String::new(),
        })
        .collect()
}

/// Root over `leaves`; an odd node is paired with itself
pub fn merkle_root(leaves: &[String]) -> Option<String> {
    let mut level: Vec<String> = leaves.to_vec();
    if level.is_empty() {
        return None;
    }

    while level.len() > 1 {
        level = next_level(&level);
    }

    let root = level.pop();
    debug!(leaf_count = leaves.len(), root = ?root, "merkle root computed");
    root
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: String,
    pub side: Side,
}

/// Inclusion proof for one leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf: String,
    pub index: usize,
    pub steps: Vec<ProofStep>,
}

impl MerkleProof {
    /// Recompute the root from the leaf and compare
    pub fn verify(&self, root: &str) -> bool {
        let computed = self.steps.iter().fold(self.leaf.clone(), |acc, step| match step.side {
            Side::Left => combine(&step.sibling, &acc),
            Side::Right => combine(&acc, &step.sibling),
        });
        computed == root
    }
}

/// Build the inclusion proof for `leaves[index]`
pub fn inclusion_proof(leaves: &[String], index: usize) -> Result<MerkleProof> {
    let leaf = leaves
        .get(index)
        .cloned()
        .ok_or_else(|| LedgerError::invalid_field("index", format!("leaf {} out of range", index)))?;

    let mut steps = Vec::new();
    let mut level: Vec<String> = leaves.to_vec();
    let mut position = index;

    while level.len() > 1 {
        let sibling_index = position ^ 1;
        let sibling = level.get(sibling_index).unwrap_or(&level[position]).clone();
        let side = if position % 2 == 0 { Side::Right } else { Side::Left };
        steps.push(ProofStep { sibling, side });

        level = next_level(&level);
        position /= 2;
    }

    Ok(MerkleProof { leaf, index, steps })
}
