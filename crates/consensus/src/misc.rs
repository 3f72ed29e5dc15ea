use std::cmp::max;

use alloy_primitives::{B256, aliases::B32};
use anyhow::ensure;
use ethereum_hashing::hash;
use tree_hash::TreeHash;

use crate::{
    constants::{
        EPOCHS_PER_SYNC_COMMITTEE_PERIOD, GENESIS_FORK_VERSION, MAX_SEED_LOOKAHEAD,
        SHUFFLE_ROUND_COUNT, SLOTS_PER_EPOCH,
    },
    fork_data::ForkData,
    signing_data::SigningData,
};

pub mod checksummed_address {
    use alloy_primitives::Address;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S>(address: &Address, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let checksummed = address.to_checksum(None);
        serializer.serialize_str(&checksummed)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Address, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        s.parse::<Address>().map_err(D::Error::custom)
    }
}

pub fn compute_signing_root<SSZObject: TreeHash>(ssz_object: SSZObject, domain: B256) -> B256 {
    SigningData {
        object_root: ssz_object.tree_hash_root(),
        domain,
    }
    .tree_hash_root()
}

/// Swap-or-not permutation of a single index. The batch equivalent over a whole index list lives
/// in [crate::shuffling::shuffle_list]; both must agree for every index.
pub fn compute_shuffled_index(
    mut index: usize,
    index_count: usize,
    seed: B256,
) -> anyhow::Result<usize> {
    ensure!(index < index_count, "Index must be less than index_count");
    for round in 0..SHUFFLE_ROUND_COUNT {
        let seed_with_round = [seed.as_slice(), &round.to_le_bytes()].concat();
        let pivot = bytes_to_int64(&hash(&seed_with_round)[..]) % index_count as u64;

        let flip = (pivot as usize + (index_count - index)) % index_count;
        let position = max(index, flip);
        let seed_with_position = [
            seed_with_round.as_slice(),
            &(position / 256).to_le_bytes()[0..4],
        ]
        .concat();
        let source = hash(&seed_with_position);
        let byte = source[(position % 256) / 8];
        let bit = (byte >> (position % 8)) % 2;

        index = if bit == 1 { flip } else { index };
    }
    Ok(index)
}

// Return the integer deserialization of ``data`` interpreted as ``ENDIANNESS``-endian.
pub fn bytes_to_int64(slice: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let len = slice.len().min(8);
    bytes[..len].copy_from_slice(&slice[..len]);
    u64::from_le_bytes(bytes)
}

/// Return the committee corresponding to ``indices``, ``seed``, ``index``, and committee ``count``.
pub fn compute_committee(
    indices: &[u64],
    seed: B256,
    index: u64,
    count: u64,
) -> anyhow::Result<Vec<u64>> {
    let start = (indices.len() as u64 * index) / count;
    let end = (indices.len() as u64 * (index + 1)) / count;
    ensure!(start <= end, "Committee range start is past its end");
    (start..end)
        .map(|i| {
            let shuffled_index = compute_shuffled_index(i as usize, indices.len(), seed)?;
            indices
                .get(shuffled_index)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("Index out of bounds: {shuffled_index}"))
        })
        .collect::<anyhow::Result<Vec<u64>>>()
}

/// Return the epoch number at ``slot``.
pub fn compute_epoch_at_slot(slot: u64) -> u64 {
    slot / SLOTS_PER_EPOCH
}

/// Return the start slot of ``epoch``.
pub fn compute_start_slot_at_epoch(epoch: u64) -> u64 {
    epoch * SLOTS_PER_EPOCH
}

/// Return the epoch during which validator activations and exits initiated in ``epoch`` take
/// effect.
pub fn compute_activation_exit_epoch(epoch: u64) -> u64 {
    epoch + 1 + MAX_SEED_LOOKAHEAD
}

/// Return the domain for the ``domain_type`` and ``fork_version``
pub fn compute_domain(
    domain_type: B32,
    fork_version: Option<B32>,
    genesis_validators_root: Option<B256>,
) -> B256 {
    let fork_data = ForkData {
        current_version: fork_version.unwrap_or(GENESIS_FORK_VERSION),
        genesis_validators_root: genesis_validators_root.unwrap_or_default(),
    };
    let fork_data_root = fork_data.compute_fork_data_root();
    let domain_bytes = [&domain_type.0, &fork_data_root.0[..28]].concat();
    B256::from_slice(&domain_bytes)
}

pub fn is_sorted_and_unique(indices: &[usize]) -> bool {
    indices.windows(2).all(|w| w[0] < w[1])
}

pub fn integer_squareroot(n: u64) -> u64 {
    if n == u64::MAX {
        return 4294967295;
    }
    let mut x = n;
    let mut y = x.div_ceil(2);
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    x
}

pub fn compute_sync_committee_period(epoch: u64) -> u64 {
    epoch / EPOCHS_PER_SYNC_COMMITTEE_PERIOD
}

/// Return a new ``ParticipationFlags`` adding ``flag_index`` to ``flags``.
pub fn add_flag(flags: u8, flag_index: u8) -> u8 {
    flags | (1 << flag_index)
}

/// Return whether ``flags`` has ``flag_index`` set.
pub fn has_flag(flags: u8, flag_index: u8) -> bool {
    flags & (1 << flag_index) != 0
}

pub fn xor(left: &B256, right: &B256) -> B256 {
    let mut out = B256::ZERO;
    for i in 0..32 {
        out[i] = left[i] ^ right[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shuffled_index_is_a_permutation() {
        let seed = B256::repeat_byte(0x42);
        for n in [1usize, 2, 5, 33, 100] {
            let mut seen = vec![false; n];
            for i in 0..n {
                let shuffled = compute_shuffled_index(i, n, seed).unwrap();
                assert!(!seen[shuffled], "duplicate output for n={n}");
                seen[shuffled] = true;
            }
            assert!(seen.iter().all(|&hit| hit));
        }
    }

    #[test]
    fn shuffled_index_rejects_out_of_range() {
        assert!(compute_shuffled_index(3, 3, B256::ZERO).is_err());
    }

    #[test]
    fn integer_squareroot_matches_floor_sqrt() {
        assert_eq!(integer_squareroot(0), 0);
        assert_eq!(integer_squareroot(1), 1);
        assert_eq!(integer_squareroot(31), 5);
        assert_eq!(integer_squareroot(32), 5);
        assert_eq!(integer_squareroot(36), 6);
        assert_eq!(integer_squareroot(u64::MAX), 4294967295);
    }

    #[test]
    fn sorted_and_unique() {
        assert!(is_sorted_and_unique(&[1, 2, 5]));
        assert!(!is_sorted_and_unique(&[1, 1, 5]));
        assert!(!is_sorted_and_unique(&[2, 1]));
    }
}
