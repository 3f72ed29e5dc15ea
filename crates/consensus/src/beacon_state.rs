use std::sync::Arc;

use alloy_primitives::{B256, aliases::B32};
use anyhow::{anyhow, ensure};
use ethereum_hashing::hash_fixed;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ssz_derive::{Decode, Encode};
use ssz_types::{
    BitVector, FixedVector, VariableList,
    serde_utils::{quoted_u64_fixed_vec, quoted_u64_var_list},
    typenum::{U4, U2048, U8192, U65536, U16777216, U1099511627776},
};
use tree_hash_derive::TreeHash;

use crate::{
    beacon_block_header::BeaconBlockHeader,
    checkpoint::Checkpoint,
    constants::{
        DOMAIN_SYNC_COMMITTEE, EPOCHS_PER_HISTORICAL_VECTOR, GENESIS_EPOCH, MAX_EFFECTIVE_BALANCE,
        MAX_RANDOM_BYTE, MIN_SEED_LOOKAHEAD, SLOTS_PER_HISTORICAL_ROOT, SYNC_COMMITTEE_SIZE,
    },
    eth_1_data::Eth1Data,
    execution_payload_header::ExecutionPayloadHeader,
    fork::Fork,
    misc::{
        compute_domain, compute_epoch_at_slot, compute_shuffled_index,
        compute_start_slot_at_epoch,
    },
    state_transition::block::eth_aggregate_pubkeys,
    sync_committee::SyncCommittee,
    validator::Validator,
};

pub mod quoted_u8_var_list {
    use super::*;

    pub fn serialize<S>(
        value: &VariableList<u8, U1099511627776>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let string_vec: Vec<String> = value.iter().map(|v| v.to_string()).collect();
        string_vec.serialize(serializer)
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<VariableList<u8, U1099511627776>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string_vec: Vec<String> = Vec::deserialize(deserializer)?;
        let bytes = string_vec
            .into_iter()
            .map(|s| s.parse::<u8>().map_err(serde::de::Error::custom))
            .collect::<Result<Vec<_>, _>>()?;
        VariableList::new(bytes).map_err(|err| {
            serde::de::Error::custom(format!("Cannot create VariableList from bytes: {err:?}"))
        })
    }
}

/// The unified state schema: the superset of every supported fork. States that predate a fork
/// carry default-initialized later-fork fields; the fork schedule gates which processors touch
/// them.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, Encode, Decode, TreeHash, Default)]
pub struct BeaconState {
    // Versioning
    #[serde(with = "serde_utils::quoted_u64")]
    pub genesis_time: u64,
    pub genesis_validators_root: B256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: u64,
    pub fork: Fork,

    // History
    pub latest_block_header: BeaconBlockHeader,
    pub block_roots: FixedVector<B256, U8192>,
    pub state_roots: FixedVector<B256, U8192>,
    pub historical_roots: VariableList<B256, U16777216>,

    // Eth1
    pub eth1_data: Eth1Data,
    pub eth1_data_votes: VariableList<Eth1Data, U2048>,
    #[serde(with = "serde_utils::quoted_u64")]
    pub eth1_deposit_index: u64,

    // Registry
    pub validators: VariableList<Validator, U1099511627776>,
    #[serde(with = "quoted_u64_var_list")]
    pub balances: VariableList<u64, U1099511627776>,

    // Randomness
    pub randao_mixes: FixedVector<B256, U65536>,

    // Slashings
    #[serde(with = "quoted_u64_fixed_vec")]
    pub slashings: FixedVector<u64, U8192>,

    // Participation (altair+)
    #[serde(with = "quoted_u8_var_list")]
    pub previous_epoch_participation: VariableList<u8, U1099511627776>,
    #[serde(with = "quoted_u8_var_list")]
    pub current_epoch_participation: VariableList<u8, U1099511627776>,

    // Finality
    pub justification_bits: BitVector<U4>,
    pub previous_justified_checkpoint: Checkpoint,
    pub current_justified_checkpoint: Checkpoint,
    pub finalized_checkpoint: Checkpoint,

    // Inactivity (altair+)
    #[serde(with = "quoted_u64_var_list")]
    pub inactivity_scores: VariableList<u64, U1099511627776>,

    // Sync (altair+)
    pub current_sync_committee: Arc<SyncCommittee>,
    pub next_sync_committee: Arc<SyncCommittee>,

    // Execution (bellatrix+)
    pub latest_execution_payload_header: ExecutionPayloadHeader,
}

impl BeaconState {
    /// Return the current epoch.
    pub fn get_current_epoch(&self) -> u64 {
        compute_epoch_at_slot(self.slot)
    }

    /// Return the previous epoch (unless the current epoch is ``GENESIS_EPOCH``).
    pub fn get_previous_epoch(&self) -> u64 {
        let current_epoch = self.get_current_epoch();
        if current_epoch == GENESIS_EPOCH {
            GENESIS_EPOCH
        } else {
            current_epoch - 1
        }
    }

    /// Return the block root at the start of a recent ``epoch``.
    pub fn get_block_root(&self, epoch: u64) -> anyhow::Result<B256> {
        self.get_block_root_at_slot(compute_start_slot_at_epoch(epoch))
    }

    /// Return the block root at a recent ``slot``.
    pub fn get_block_root_at_slot(&self, slot: u64) -> anyhow::Result<B256> {
        ensure!(
            slot < self.slot && self.slot <= slot + SLOTS_PER_HISTORICAL_ROOT,
            "slot given was outside of block_roots range"
        );
        Ok(self.block_roots[(slot % SLOTS_PER_HISTORICAL_ROOT) as usize])
    }

    /// Return the randao mix at a recent ``epoch``.
    pub fn get_randao_mix(&self, epoch: u64) -> B256 {
        self.randao_mixes[(epoch % EPOCHS_PER_HISTORICAL_VECTOR) as usize]
    }

    /// Return the sequence of active validator indices at ``epoch``.
    pub fn get_active_validator_indices(&self, epoch: u64) -> Vec<u64> {
        self.validators
            .iter()
            .enumerate()
            .filter_map(|(i, validator)| validator.is_active_validator(epoch).then_some(i as u64))
            .collect()
    }

    /// Return the seed at ``epoch``.
    pub fn get_seed(&self, epoch: u64, domain_type: B32) -> B256 {
        let mix =
            self.get_randao_mix(epoch + EPOCHS_PER_HISTORICAL_VECTOR - MIN_SEED_LOOKAHEAD - 1);
        let epoch_with_index =
            [domain_type.as_slice(), &epoch.to_le_bytes(), mix.as_slice()].concat();
        B256::from(hash_fixed(&epoch_with_index))
    }

    /// Return the signature domain (fork version concatenated with domain type) of a message.
    pub fn get_domain(&self, domain_type: B32, epoch: Option<u64>) -> B256 {
        let epoch = epoch.unwrap_or_else(|| self.get_current_epoch());
        let fork_version = if epoch < self.fork.epoch {
            self.fork.previous_version
        } else {
            self.fork.current_version
        };
        compute_domain(
            domain_type,
            Some(fork_version),
            Some(self.genesis_validators_root),
        )
    }

    /// Increase the validator balance at index ``index`` by ``delta``.
    pub fn increase_balance(&mut self, index: u64, delta: u64) -> anyhow::Result<()> {
        let balance = self
            .balances
            .get_mut(index as usize)
            .ok_or_else(|| anyhow!("Validator index {index} out of bounds"))?;
        *balance += delta;
        Ok(())
    }

    /// Decrease the validator balance at index ``index`` by ``delta``, with underflow protection.
    pub fn decrease_balance(&mut self, index: u64, delta: u64) -> anyhow::Result<()> {
        let balance = self
            .balances
            .get_mut(index as usize)
            .ok_or_else(|| anyhow!("Validator index {index} out of bounds"))?;
        *balance = balance.saturating_sub(delta);
        Ok(())
    }

    /// Return the sync committee indices, with possible duplicates, for the next sync committee,
    /// by effective-balance rejection sampling over the shuffled active set.
    pub fn get_next_sync_committee_indices(&self) -> anyhow::Result<Vec<u64>> {
        let epoch = self.get_current_epoch() + 1;
        let active_validator_indices = self.get_active_validator_indices(epoch);
        let active_validator_count = active_validator_indices.len();
        ensure!(
            active_validator_count > 0,
            "No active validators to sample a sync committee from"
        );

        let seed = self.get_seed(epoch, DOMAIN_SYNC_COMMITTEE);
        let mut i: usize = 0;
        let mut sync_committee_indices = vec![];
        while (sync_committee_indices.len() as u64) < SYNC_COMMITTEE_SIZE {
            let shuffled_index =
                compute_shuffled_index(i % active_validator_count, active_validator_count, seed)?;
            let candidate_index = active_validator_indices[shuffled_index];

            let random_byte = {
                let seed_with_offset = [seed.as_slice(), &(i as u64 / 32).to_le_bytes()].concat();
                hash_fixed(&seed_with_offset)[i % 32] as u64
            };
            let effective_balance = self.validators[candidate_index as usize].effective_balance;
            if effective_balance * MAX_RANDOM_BYTE >= MAX_EFFECTIVE_BALANCE * random_byte {
                sync_committee_indices.push(candidate_index);
            }
            i += 1;
        }

        Ok(sync_committee_indices)
    }

    /// Return the next sync committee, with possible pubkey duplicates.
    pub fn get_next_sync_committee(&self) -> anyhow::Result<SyncCommittee> {
        let indices = self.get_next_sync_committee_indices()?;
        let pubkeys = indices
            .iter()
            .map(|&index| self.validators[index as usize].pubkey.clone())
            .collect::<Vec<_>>();
        let aggregate_pubkey = eth_aggregate_pubkeys(&pubkeys.iter().collect::<Vec<_>>())?;

        Ok(SyncCommittee {
            pubkeys: FixedVector::from(pubkeys),
            aggregate_pubkey,
        })
    }
}
