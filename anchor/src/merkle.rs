//! Binary Merkle trees over commitments.
//!
//! Construction rules:
//!
//! - leaves are used as-is; a single-leaf tree's root is that leaf,
//! - nodes are paired left to right in original order,
//! - an odd node at the end of a level is paired with itself,
//! - an internal node is `BLAKE3(0x01 || left || right)`.
//!
//! Proofs carry the leaf index and leaf count next to the sibling path, so a
//! verifier can recompute the root from one leaf without the rest of the
//! tree and can tell a malformed proof apart from a proof that simply does
//! not match.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Hash256;

const NODE_PREFIX: u8 = 0x01;

/// Errors reported by tree construction and proof handling.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum MerkleError {
    #[error("cannot build a Merkle tree over an empty leaf set")]
    EmptyLeafSet,
    #[error("leaf index {index} out of range for {leaf_count} leaves")]
    IndexOutOfRange { index: u64, leaf_count: u64 },
    #[error("malformed proof path: expected {expected} siblings, got {actual}")]
    MalformedPath { expected: usize, actual: usize },
}

/// Hashes two child nodes into their parent.
pub fn hash_node(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash256(*hasher.finalize().as_bytes())
}

/// Number of siblings in a proof for a tree of `leaf_count` leaves
/// (`ceil(log2(leaf_count))`).
pub fn expected_path_len(leaf_count: u64) -> usize {
    if leaf_count <= 1 {
        0
    } else {
        (u64::BITS - (leaf_count - 1).leading_zeros()) as usize
    }
}

/// A fully materialized tree. `levels[0]` holds the leaves, the last level
/// holds the root alone.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash256>>,
}

impl MerkleTree {
    pub fn build(leaves: &[Hash256]) -> Result<Self, MerkleError> {
        if leaves.is_empty() {
            return Err(MerkleError::EmptyLeafSet);
        }

        let mut levels = vec![leaves.to_vec()];
        while levels[levels.len() - 1].len() > 1 {
            let next: Vec<Hash256> = levels[levels.len() - 1]
                .chunks(2)
                .map(|pair| hash_node(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                .collect();
            levels.push(next);
        }

        Ok(Self { levels })
    }

    pub fn root(&self) -> Hash256 {
        self.levels[self.levels.len() - 1][0]
    }

    pub fn leaf_count(&self) -> u64 {
        self.levels[0].len() as u64
    }

    pub fn leaves(&self) -> &[Hash256] {
        &self.levels[0]
    }

    /// Inclusion proof for the leaf at `index`.
    pub fn prove(&self, index: u64) -> Result<MerkleProof, MerkleError> {
        let leaf_count = self.leaf_count();
        if index >= leaf_count {
            return Err(MerkleError::IndexOutOfRange { index, leaf_count });
        }

        let mut path = Vec::with_capacity(expected_path_len(leaf_count));
        let mut idx = index as usize;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = if idx % 2 == 0 {
                // The last odd node is its own sibling.
                level.get(idx + 1).unwrap_or(&level[idx])
            } else {
                &level[idx - 1]
            };
            path.push(*sibling);
            idx /= 2;
        }

        Ok(MerkleProof {
            leaf_index: index,
            leaf_count,
            path,
        })
    }
}

/// Sibling path from one leaf up to the root.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: u64,
    pub leaf_count: u64,
    /// Siblings ordered from the leaf level upwards.
    pub path: Vec<Hash256>,
}

impl MerkleProof {
    /// Recomputes the root from `leaf` and this path.
    ///
    /// Structural problems are errors; `Ok(false)` means the proof is well
    /// formed but does not lead to `root`.
    pub fn verify(&self, leaf: &Hash256, root: &Hash256) -> Result<bool, MerkleError> {
        if self.leaf_count == 0 {
            return Err(MerkleError::EmptyLeafSet);
        }
        if self.leaf_index >= self.leaf_count {
            return Err(MerkleError::IndexOutOfRange {
                index: self.leaf_index,
                leaf_count: self.leaf_count,
            });
        }
        let expected = expected_path_len(self.leaf_count);
        if self.path.len() != expected {
            return Err(MerkleError::MalformedPath {
                expected,
                actual: self.path.len(),
            });
        }

        let mut acc = *leaf;
        let mut idx = self.leaf_index;
        let mut width = self.leaf_count;
        for sibling in &self.path {
            acc = if idx % 2 == 1 {
                hash_node(sibling, &acc)
            } else if idx + 1 == width {
                // Odd tail: only a self-pairing is a valid sibling here.
                if *sibling != acc {
                    return Ok(false);
                }
                hash_node(&acc, &acc)
            } else {
                hash_node(&acc, sibling)
            };
            idx /= 2;
            width = width.div_ceil(2);
        }
        Ok(acc == *root)
    }
}

/// Free-standing form of [`MerkleProof::verify`].
pub fn verify(leaf: &Hash256, proof: &MerkleProof, root: &Hash256) -> Result<bool, MerkleError> {
    proof.verify(leaf, root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u64) -> Vec<Hash256> {
        (0..n).map(|i| Hash256::compute(&i.to_le_bytes())).collect()
    }

    #[test]
    fn single_leaf_root_is_the_leaf() {
        let l = leaves(1);
        let tree = MerkleTree::build(&l).unwrap();
        assert_eq!(tree.root(), l[0]);
        let proof = tree.prove(0).unwrap();
        assert!(proof.path.is_empty());
        assert!(proof.verify(&l[0], &tree.root()).unwrap());
    }

    #[test]
    fn four_leaves_give_two_level_tree() {
        let l = leaves(4);
        let tree = MerkleTree::build(&l).unwrap();
        let expected = hash_node(&hash_node(&l[0], &l[1]), &hash_node(&l[2], &l[3]));
        assert_eq!(tree.root(), expected);

        let proof = tree.prove(2).unwrap();
        assert_eq!(proof.path, vec![l[3], hash_node(&l[0], &l[1])]);
        assert!(verify(&l[2], &proof, &tree.root()).unwrap());
        assert!(!verify(&l[2], &proof, &Hash256([0xAA; 32])).unwrap());
    }

    #[test]
    fn odd_leaf_is_paired_with_itself() {
        let l = leaves(3);
        let tree = MerkleTree::build(&l).unwrap();
        let expected = hash_node(&hash_node(&l[0], &l[1]), &hash_node(&l[2], &l[2]));
        assert_eq!(tree.root(), expected);
    }

    #[test]
    fn every_leaf_round_trips() {
        for n in 1..=17u64 {
            let l = leaves(n);
            let tree = MerkleTree::build(&l).unwrap();
            for (i, leaf) in l.iter().enumerate() {
                let proof = tree.prove(i as u64).unwrap();
                assert_eq!(proof.path.len(), expected_path_len(n), "n={n}");
                assert!(proof.verify(leaf, &tree.root()).unwrap(), "n={n} i={i}");
            }
        }
    }

    #[test]
    fn wrong_leaf_does_not_verify() {
        let l = leaves(5);
        let tree = MerkleTree::build(&l).unwrap();
        let proof = tree.prove(1).unwrap();
        assert!(!proof.verify(&l[2], &tree.root()).unwrap());
    }

    #[test]
    fn structural_errors_are_distinct() {
        assert_eq!(MerkleTree::build(&[]).unwrap_err(), MerkleError::EmptyLeafSet);

        let l = leaves(4);
        let tree = MerkleTree::build(&l).unwrap();
        assert!(matches!(
            tree.prove(4),
            Err(MerkleError::IndexOutOfRange { index: 4, leaf_count: 4 })
        ));

        let mut proof = tree.prove(0).unwrap();
        proof.path.pop();
        assert!(matches!(
            proof.verify(&l[0], &tree.root()),
            Err(MerkleError::MalformedPath { expected: 2, actual: 1 })
        ));

        let mut proof = tree.prove(0).unwrap();
        proof.leaf_index = 9;
        assert!(matches!(
            proof.verify(&l[0], &tree.root()),
            Err(MerkleError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn path_length_is_ceil_log2() {
        assert_eq!(expected_path_len(1), 0);
        assert_eq!(expected_path_len(2), 1);
        assert_eq!(expected_path_len(3), 2);
        assert_eq!(expected_path_len(4), 2);
        assert_eq!(expected_path_len(5), 3);
        assert_eq!(expected_path_len(1024), 10);
    }
}
