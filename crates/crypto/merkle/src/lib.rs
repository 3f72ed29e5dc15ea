//! Binary merkle trees and branch verification, following the SSZ merkleization rules.

use alloy_primitives::B256;
use anyhow::ensure;

fn hash_concat(left: &[u8], right: &[u8]) -> B256 {
    ethereum_hashing::hash32_concat(left, right).into()
}

/// Builds a complete binary tree of `2^(depth + 1)` nodes over the given leaves, padding the
/// bottom layer with zero leaves. Node `i` has children `2i` and `2i + 1`; the root sits at
/// index 1.
pub fn merkle_tree(leaves: &[B256], depth: u64) -> anyhow::Result<Vec<B256>> {
    let bottom_length = 1usize << depth;
    ensure!(
        leaves.len() <= bottom_length,
        "Too many leaves for a tree of depth {depth}"
    );

    let mut tree = vec![B256::ZERO; bottom_length * 2];
    tree[bottom_length..bottom_length + leaves.len()].copy_from_slice(leaves);

    for i in (1..bottom_length).rev() {
        tree[i] = hash_concat(tree[i * 2].as_slice(), tree[i * 2 + 1].as_slice());
    }

    Ok(tree)
}

/// Collects the sibling hashes on the path from leaf `index` up to the root, ordered bottom-up
/// as expected by [is_valid_merkle_branch].
pub fn generate_proof(tree: &[B256], index: u64, depth: u64) -> anyhow::Result<Vec<B256>> {
    ensure!(index < (1 << depth), "Leaf index out of bounds");

    let mut node = index + (1 << depth);
    let mut proof = Vec::with_capacity(depth as usize);

    while node > 1 {
        proof.push(tree[(node ^ 1) as usize]);
        node /= 2;
    }

    Ok(proof)
}

/// Checks that `leaf` at position `index` hashes up through `branch` to `root`.
pub fn is_valid_merkle_branch(
    leaf: B256,
    branch: &[B256],
    depth: u64,
    index: u64,
    root: B256,
) -> bool {
    if branch.len() < depth as usize {
        return false;
    }

    let mut value = leaf;
    for i in 0..depth {
        value = if index >> i & 1 == 1 {
            hash_concat(branch[i as usize].as_slice(), value.as_slice())
        } else {
            hash_concat(value.as_slice(), branch[i as usize].as_slice())
        };
    }
    value == root
}

/// Root of a depth-`depth` tree over `leaves` without materializing the padded layers; the
/// all-zero sibling of each level is folded up instead. This is how the deposit tree root is
/// computed, where `depth` is 32 and materializing is out of the question.
pub fn padded_merkle_root(leaves: &[B256], depth: u64) -> anyhow::Result<B256> {
    ensure!(
        depth >= 64 || leaves.len() as u64 <= 1u64 << depth,
        "Too many leaves for a tree of depth {depth}"
    );

    let mut layer = leaves.to_vec();
    let mut zero = B256::ZERO;
    for _ in 0..depth {
        if layer.len() % 2 == 1 {
            layer.push(zero);
        }
        layer = layer
            .chunks(2)
            .map(|pair| hash_concat(pair[0].as_slice(), pair[1].as_slice()))
            .collect();
        zero = hash_concat(zero.as_slice(), zero.as_slice());
    }

    Ok(layer.first().copied().unwrap_or(zero))
}

/// SSZ length mix-in: hashes `root` with the little-endian `length` to form a List root.
pub fn mix_in_length(root: B256, length: u64) -> B256 {
    let mut length_bytes = [0u8; 32];
    length_bytes[..8].copy_from_slice(&length.to_le_bytes());
    hash_concat(root.as_slice(), &length_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proofs_verify_for_every_leaf() {
        let leaves = (0u8..6)
            .map(|i| B256::repeat_byte(i + 1))
            .collect::<Vec<_>>();
        let depth = 3;

        let tree = merkle_tree(&leaves, depth).unwrap();
        let root = tree[1];

        for (index, leaf) in leaves.iter().enumerate() {
            let proof = generate_proof(&tree, index as u64, depth).unwrap();
            assert!(is_valid_merkle_branch(
                *leaf,
                &proof,
                depth,
                index as u64,
                root
            ));
            assert!(!is_valid_merkle_branch(
                B256::repeat_byte(0xFF),
                &proof,
                depth,
                index as u64,
                root
            ));
        }
    }

    #[test]
    fn proof_against_wrong_index_fails() {
        let leaves = vec![B256::repeat_byte(1), B256::repeat_byte(2)];
        let tree = merkle_tree(&leaves, 1).unwrap();

        let proof = generate_proof(&tree, 0, 1).unwrap();
        assert!(!is_valid_merkle_branch(leaves[0], &proof, 1, 1, tree[1]));
    }

    #[test]
    fn rejects_too_many_leaves() {
        let leaves = vec![B256::ZERO; 5];
        assert!(merkle_tree(&leaves, 2).is_err());
    }

    #[test]
    fn padded_root_matches_materialized_tree() {
        let leaves = (0u8..5)
            .map(|i| B256::repeat_byte(i + 1))
            .collect::<Vec<_>>();
        let depth = 4;

        let tree = merkle_tree(&leaves, depth).unwrap();
        assert_eq!(padded_merkle_root(&leaves, depth).unwrap(), tree[1]);
        assert_eq!(
            padded_merkle_root(&[], depth).unwrap(),
            merkle_tree(&[], depth).unwrap()[1]
        );
    }

    #[test]
    fn mixed_in_length_distinguishes_list_sizes() {
        let root = B256::repeat_byte(0xAB);
        assert_ne!(mix_in_length(root, 1), mix_in_length(root, 2));
    }

    #[test]
    fn short_branch_is_rejected() {
        assert!(!is_valid_merkle_branch(
            B256::ZERO,
            &[B256::ZERO; 2],
            3,
            0,
            B256::ZERO
        ));
    }
}
