//! RFC 6962 Merkle tree hashing and inclusion proofs.
//!
//! Leaves hash as `SHA-256(0x00 || data)` and interior nodes as
//! `SHA-256(0x01 || left || right)`. Inclusion proofs are checked with the
//! iterative algorithm of RFC 9162 section 2.1.3.2, which handles the
//! unbalanced right edge of trees whose size is not a power of two.

use super::VerificationError;
use sha2::{Digest, Sha256};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

pub fn compute_leaf_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    hasher.finalize().into()
}

pub fn compute_node_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Check that `leaf_hash` sits at `leaf_index` in a tree of `tree_size`
/// leaves whose root is `expected_root`.
pub fn verify_inclusion_proof(
    leaf_index: u64,
    tree_size: u64,
    leaf_hash: &[u8; 32],
    proof_hashes: &[[u8; 32]],
    expected_root: &[u8; 32],
) -> Result<(), VerificationError> {
    if leaf_index >= tree_size {
        return Err(VerificationError::Tlog(format!(
            "leaf index {leaf_index} is out of range for tree size {tree_size}"
        )));
    }

    let mut index = leaf_index;
    let mut last = tree_size - 1;
    let mut hash = *leaf_hash;

    for sibling in proof_hashes {
        if last == 0 {
            return Err(VerificationError::Tlog(
                "inclusion proof is longer than the tree height".to_string(),
            ));
        }
        if index & 1 == 1 || index == last {
            hash = compute_node_hash(sibling, &hash);
            if index & 1 == 0 {
                // Right edge: climb until this node is a right child again.
                while index & 1 == 0 && index != 0 {
                    index >>= 1;
                    last >>= 1;
                }
            }
        } else {
            hash = compute_node_hash(&hash, sibling);
        }
        index >>= 1;
        last >>= 1;
    }

    if last != 0 {
        return Err(VerificationError::Tlog(
            "inclusion proof is shorter than the tree height".to_string(),
        ));
    }
    if &hash != expected_root {
        return Err(VerificationError::Tlog(format!(
            "computed root {} does not match expected root {}",
            hex::encode(hash),
            hex::encode(expected_root)
        )));
    }
    Ok(())
}

pub(crate) fn to_hash(bytes: &[u8], what: &str) -> Result<[u8; 32], VerificationError> {
    bytes.try_into().map_err(|_| {
        VerificationError::Tlog(format!("{what} is {} bytes, expected 32", bytes.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_hash(leaves: &[[u8; 32]]) -> [u8; 32] {
        match leaves.len() {
            1 => leaves[0],
            n => {
                let k = split_point(n);
                compute_node_hash(&tree_hash(&leaves[..k]), &tree_hash(&leaves[k..]))
            }
        }
    }

    fn split_point(n: usize) -> usize {
        let mut k = 1;
        while k * 2 < n {
            k *= 2;
        }
        k
    }

    fn audit_path(index: usize, leaves: &[[u8; 32]]) -> Vec<[u8; 32]> {
        if leaves.len() <= 1 {
            return Vec::new();
        }
        let k = split_point(leaves.len());
        if index < k {
            let mut path = audit_path(index, &leaves[..k]);
            path.push(tree_hash(&leaves[k..]));
            path
        } else {
            let mut path = audit_path(index - k, &leaves[k..]);
            path.push(tree_hash(&leaves[..k]));
            path
        }
    }

    fn leaves(n: usize) -> Vec<[u8; 32]> {
        (0..n)
            .map(|i| compute_leaf_hash(format!("entry {i}").as_bytes()))
            .collect()
    }

    #[test]
    fn test_leaf_and_node_domain_separation() {
        let leaf = compute_leaf_hash(b"");
        assert_eq!(
            hex::encode(leaf),
            "6e340b9cffb37a989ca544e6bb780a2c78901d3fb33738768511a30617afa01d"
        );
        assert_ne!(compute_node_hash(&leaf, &leaf), leaf);
    }

    #[test]
    fn test_every_leaf_of_unbalanced_trees() {
        for size in [1usize, 2, 3, 5, 7, 8, 13] {
            let leaves = leaves(size);
            let root = tree_hash(&leaves);
            for index in 0..size {
                let path = audit_path(index, &leaves);
                verify_inclusion_proof(index as u64, size as u64, &leaves[index], &path, &root)
                    .unwrap_or_else(|e| panic!("size {size} index {index}: {e}"));
            }
        }
    }

    #[test]
    fn test_rejects_wrong_root_or_index() {
        let leaves = leaves(7);
        let root = tree_hash(&leaves);
        let path = audit_path(5, &leaves);
        assert!(verify_inclusion_proof(4, 7, &leaves[5], &path, &root).is_err());
        assert!(verify_inclusion_proof(5, 7, &leaves[4], &path, &root).is_err());
        assert!(verify_inclusion_proof(7, 7, &leaves[5], &path, &root).is_err());
        assert!(verify_inclusion_proof(5, 7, &leaves[5], &path, &leaves[0]).is_err());
    }

    #[test]
    fn test_rejects_wrong_proof_length() {
        let leaves = leaves(8);
        let root = tree_hash(&leaves);
        let mut path = audit_path(3, &leaves);
        assert!(verify_inclusion_proof(3, 8, &leaves[3], &path[..2], &root).is_err());
        path.push(root);
        assert!(verify_inclusion_proof(3, 8, &leaves[3], &path, &root).is_err());
    }

    #[test]
    fn test_to_hash_length() {
        assert!(to_hash(&[0u8; 32], "root").is_ok());
        assert!(to_hash(&[0u8; 31], "root").is_err());
    }
}
