use std::sync::Arc;

use alloy_primitives::B256;
use anyhow::ensure;
use ethereum_hashing::hash;

use crate::{
    constants::{
        MAX_COMMITTEES_PER_SLOT, SHUFFLE_ROUND_COUNT, SLOTS_PER_EPOCH, TARGET_COMMITTEE_SIZE,
    },
    misc::bytes_to_int64,
};

const SEED_SIZE: usize = 32;
const PIVOT_VIEW_SIZE: usize = SEED_SIZE + 1;
const TOTAL_SIZE: usize = PIVOT_VIEW_SIZE + 4;

fn set_position_window(buf: &mut [u8; TOTAL_SIZE], value: usize) {
    buf[PIVOT_VIEW_SIZE..].copy_from_slice(&((value >> 8) as u32).to_le_bytes());
}

/// Swap-or-not shuffle of an entire list in place, one hash per 256 positions per round instead
/// of one per index. Equivalent to mapping [crate::misc::compute_shuffled_index] over the list
/// when run with `forwards == false`.
///
/// It holds that:
///   shuffle_list(shuffle_list(l, s, true), s, false) == l
///   shuffle_list(shuffle_list(l, s, false), s, true) == l
pub fn shuffle_list(mut input: Vec<u64>, seed: &[u8], forwards: bool) -> anyhow::Result<Vec<u64>> {
    let list_size = input.len();

    ensure!(
        list_size <= 1 << 24,
        "Shuffling list size {list_size} exceeds 2^24"
    );
    if list_size < 2 {
        return Ok(input);
    }

    let mut buf = [0u8; TOTAL_SIZE];
    buf[..SEED_SIZE].copy_from_slice(seed);

    let mut round = if forwards { 0 } else { SHUFFLE_ROUND_COUNT - 1 };

    loop {
        buf[SEED_SIZE] = round;

        let pivot = bytes_to_int64(&hash(&buf[..PIVOT_VIEW_SIZE])[..8]) as usize % list_size;

        // First half: positions [0, pivot/2] mirror against [pivot/2, pivot].
        let mirror = (pivot + 1) >> 1;
        set_position_window(&mut buf, pivot);
        let mut source = hash(&buf);
        let mut byte_v = source[(pivot & 0xff) >> 3];

        for i in 0..mirror {
            let j = pivot - i;

            if j & 0xff == 0xff {
                set_position_window(&mut buf, j);
                source = hash(&buf);
            }
            if j & 0x07 == 0x07 {
                byte_v = source[(j & 0xff) >> 3];
            }

            if (byte_v >> (j & 0x07)) & 0x01 == 1 {
                input.swap(i, j);
            }
        }

        // Second half: positions (pivot, mirror) against (mirror, end].
        let mirror = (pivot + list_size + 1) >> 1;
        let end = list_size - 1;
        set_position_window(&mut buf, end);
        let mut source = hash(&buf);
        let mut byte_v = source[(end & 0xff) >> 3];

        for (loop_iter, i) in ((pivot + 1)..mirror).enumerate() {
            let j = end - loop_iter;

            if j & 0xff == 0xff {
                set_position_window(&mut buf, j);
                source = hash(&buf);
            }
            if j & 0x07 == 0x07 {
                byte_v = source[(j & 0xff) >> 3];
            }

            if (byte_v >> (j & 0x07)) & 0x01 == 1 {
                input.swap(i, j);
            }
        }

        if forwards {
            round += 1;
            if round == SHUFFLE_ROUND_COUNT {
                break;
            }
        } else {
            if round == 0 {
                break;
            }
            round -= 1;
        }
    }

    Ok(input)
}

/// Return the number of committees in each slot for the given number of active validators.
pub fn get_committee_count_per_slot(active_validator_count: u64) -> u64 {
    (active_validator_count / SLOTS_PER_EPOCH / TARGET_COMMITTEE_SIZE)
        .clamp(1, MAX_COMMITTEES_PER_SLOT)
}

/// The committee assignment of one epoch: the shuffled active-index list partitioned into
/// `SLOTS_PER_EPOCH x committees_per_slot` committees by proportional ranges. Immutable once
/// built; the epoch cache replaces it wholesale at each epoch boundary.
#[derive(Debug, Clone)]
pub struct EpochShuffling {
    pub epoch: u64,
    pub active_indices: Arc<Vec<u64>>,
    pub committees_per_slot: u64,
    /// `committees[slot_in_epoch][committee_index]` -> validator indices.
    pub committees: Vec<Vec<Arc<Vec<u64>>>>,
}

impl EpochShuffling {
    pub fn compute(
        epoch: u64,
        seed: B256,
        active_indices: Arc<Vec<u64>>,
    ) -> anyhow::Result<Self> {
        let shuffling = shuffle_list(active_indices.as_ref().clone(), seed.as_slice(), false)?;

        let committees_per_slot = get_committee_count_per_slot(active_indices.len() as u64);
        let committee_count = committees_per_slot * SLOTS_PER_EPOCH;
        let list_size = shuffling.len() as u64;

        let mut committees = Vec::with_capacity(SLOTS_PER_EPOCH as usize);
        for slot in 0..SLOTS_PER_EPOCH {
            let mut slot_committees = Vec::with_capacity(committees_per_slot as usize);
            for committee_index in 0..committees_per_slot {
                let index = slot * committees_per_slot + committee_index;
                let start = (list_size * index / committee_count) as usize;
                let end = (list_size * (index + 1) / committee_count) as usize;
                ensure!(
                    start <= end,
                    "Committee range start {start} is past its end {end}"
                );
                slot_committees.push(Arc::new(shuffling[start..end].to_vec()));
            }
            committees.push(slot_committees);
        }

        Ok(Self {
            epoch,
            active_indices,
            committees_per_slot,
            committees,
        })
    }

    pub fn get_committee(&self, slot: u64, committee_index: u64) -> Option<&Arc<Vec<u64>>> {
        self.committees
            .get((slot % SLOTS_PER_EPOCH) as usize)?
            .get(committee_index as usize)
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::misc::{compute_committee, compute_shuffled_index};

    #[test]
    fn batch_shuffle_agrees_with_single_index() {
        let seed = B256::repeat_byte(0x17);
        let indices = (100u64..187).collect::<Vec<_>>();

        let shuffled = shuffle_list(indices.clone(), seed.as_slice(), false).unwrap();
        for (i, value) in shuffled.iter().enumerate() {
            let single = compute_shuffled_index(i, indices.len(), seed).unwrap();
            assert_eq!(*value, indices[single]);
        }
    }

    #[test]
    fn forwards_and_backwards_invert() {
        let mut rng = rand::rng();
        let input = (0..500).map(|_| rng.random::<u64>()).collect::<Vec<_>>();
        let seed = B256::repeat_byte(0xab);

        let there = shuffle_list(input.clone(), seed.as_slice(), true).unwrap();
        let back = shuffle_list(there, seed.as_slice(), false).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn committee_count_is_clamped() {
        assert_eq!(get_committee_count_per_slot(0), 1);
        assert_eq!(get_committee_count_per_slot(4096), 1);
        assert_eq!(get_committee_count_per_slot(8192), 2);
        assert_eq!(get_committee_count_per_slot(u64::MAX / 2), 64);
    }

    #[test]
    fn epoch_shuffling_partition_matches_compute_committee() {
        let seed = B256::repeat_byte(0x03);
        let active = Arc::new((0u64..300).collect::<Vec<_>>());
        let shuffling = EpochShuffling::compute(5, seed, active.clone()).unwrap();

        let committee_count = shuffling.committees_per_slot * SLOTS_PER_EPOCH;
        for slot in 0..SLOTS_PER_EPOCH {
            for committee_index in 0..shuffling.committees_per_slot {
                let expected = compute_committee(
                    &active,
                    seed,
                    slot * shuffling.committees_per_slot + committee_index,
                    committee_count,
                )
                .unwrap();
                let actual = shuffling.get_committee(slot, committee_index).unwrap();
                assert_eq!(**actual, expected);
            }
        }
    }

    #[test]
    fn every_validator_sits_in_exactly_one_committee() {
        let active = Arc::new((0u64..1000).collect::<Vec<_>>());
        let shuffling = EpochShuffling::compute(0, B256::repeat_byte(9), active).unwrap();

        let mut seen = vec![0u32; 1000];
        for slot_committees in &shuffling.committees {
            for committee in slot_committees {
                for index in committee.iter() {
                    seen[*index as usize] += 1;
                }
            }
        }
        assert!(seen.iter().all(|&count| count == 1));
    }
}
