use std::{cmp::max, sync::Arc};

use alloy_primitives::B256;
use anyhow::{anyhow, bail, ensure};
use ethereum_hashing::hash;
use itertools::Itertools;

use crate::{
    attestation::Attestation,
    beacon_state::BeaconState,
    config::ChainConfig,
    constants::{
        BASE_REWARD_FACTOR, CHURN_LIMIT_QUOTIENT, DOMAIN_BEACON_ATTESTER, DOMAIN_BEACON_PROPOSER,
        EFFECTIVE_BALANCE_INCREMENT, FAR_FUTURE_EPOCH, MAX_EFFECTIVE_BALANCE, MAX_RANDOM_BYTE,
        MIN_PER_EPOCH_CHURN_LIMIT, PROPOSER_WEIGHT, SLOTS_PER_EPOCH, SYNC_COMMITTEE_SIZE,
        SYNC_REWARD_WEIGHT, WEIGHT_DENOMINATOR,
    },
    epoch_process::EpochProcess,
    fork_schedule::ForkName,
    indexed_attestation::IndexedAttestation,
    misc::{
        compute_activation_exit_epoch, compute_epoch_at_slot, compute_shuffled_index,
        compute_sync_committee_period, integer_squareroot,
    },
    pubkey_cache::PubkeyCache,
    shuffling::EpochShuffling,
    sync_committee::SyncCommittee,
};

/// Effective balances in increments, one byte per validator (32 ETH / 1 ETH increment fits
/// comfortably). Cloned copy-on-write before each epoch transition.
pub type EffectiveBalanceIncrements = Vec<u8>;

/// Per-epoch cache attached to a [BeaconState]. Created once by a full scan when a state is
/// first loaded, then advanced incrementally: [EpochContext::after_process_epoch] at each epoch
/// boundary and [EpochContext::add_pubkey] / [EpochContext::set_effective_balance] on deposits.
/// Cloning is cheap: shufflings and increments are shared snapshots and the pubkey registry is
/// shared by design.
#[derive(Debug, Clone)]
pub struct EpochContext {
    pub config: ChainConfig,
    pub pubkey_cache: PubkeyCache,

    pub previous_shuffling: Arc<EpochShuffling>,
    pub current_shuffling: Arc<EpochShuffling>,
    pub next_shuffling: Arc<EpochShuffling>,

    /// Proposer index for each slot of the current epoch.
    pub proposers: Vec<u64>,

    pub effective_balance_increments: Arc<EffectiveBalanceIncrements>,
    pub total_active_balance_increments: u64,

    pub base_reward_per_increment: u64,
    pub sync_participant_reward: u64,
    pub sync_proposer_reward: u64,

    pub churn_limit: u64,
    pub exit_queue_epoch: u64,
    pub exit_queue_churn: u64,

    pub current_sync_committee_indices: Arc<Vec<u64>>,
    pub next_sync_committee_indices: Arc<Vec<u64>>,

    pub epoch: u64,
    pub sync_period: u64,
}

impl EpochContext {
    pub fn new_from_state(config: ChainConfig, state: &BeaconState) -> anyhow::Result<Self> {
        let epoch = state.get_current_epoch();
        let previous_epoch = state.get_previous_epoch();
        let next_epoch = epoch + 1;

        let pubkey_cache = PubkeyCache::default();
        for (index, validator) in state.validators.iter().enumerate() {
            pubkey_cache.insert(validator.pubkey.clone(), index as u64)?;
        }

        let previous_shuffling = Arc::new(EpochShuffling::compute(
            previous_epoch,
            state.get_seed(previous_epoch, DOMAIN_BEACON_ATTESTER),
            Arc::new(state.get_active_validator_indices(previous_epoch)),
        )?);
        let current_shuffling = if previous_epoch == epoch {
            previous_shuffling.clone()
        } else {
            Arc::new(EpochShuffling::compute(
                epoch,
                state.get_seed(epoch, DOMAIN_BEACON_ATTESTER),
                Arc::new(state.get_active_validator_indices(epoch)),
            )?)
        };
        let next_shuffling = Arc::new(EpochShuffling::compute(
            next_epoch,
            state.get_seed(next_epoch, DOMAIN_BEACON_ATTESTER),
            Arc::new(state.get_active_validator_indices(next_epoch)),
        )?);

        let effective_balance_increments = Arc::new(
            state
                .validators
                .iter()
                .map(|validator| (validator.effective_balance / EFFECTIVE_BALANCE_INCREMENT) as u8)
                .collect::<Vec<_>>(),
        );

        let mut total_active_balance_increments = 0u64;
        for &index in current_shuffling.active_indices.iter() {
            total_active_balance_increments = total_active_balance_increments
                .checked_add(effective_balance_increments[index as usize] as u64)
                .ok_or_else(|| anyhow!("Total active balance overflows"))?;
        }
        // A zero active balance only happens on malformed states; floor it so reward math
        // stays divide-safe, as with the stake sums in the epoch transition.
        total_active_balance_increments = max(1, total_active_balance_increments);

        let base_reward_per_increment =
            compute_base_reward_per_increment(total_active_balance_increments);
        let (sync_participant_reward, sync_proposer_reward) =
            compute_sync_rewards(total_active_balance_increments, base_reward_per_increment);

        let active_count = current_shuffling.active_indices.len() as u64;
        let churn_limit = max(MIN_PER_EPOCH_CHURN_LIMIT, active_count / CHURN_LIMIT_QUOTIENT);

        let mut exit_queue_epoch = compute_activation_exit_epoch(epoch);
        for validator in state.validators.iter() {
            if validator.exit_epoch != FAR_FUTURE_EPOCH {
                exit_queue_epoch = max(exit_queue_epoch, validator.exit_epoch);
            }
        }
        let exit_queue_churn = state
            .validators
            .iter()
            .filter(|validator| validator.exit_epoch == exit_queue_epoch)
            .count() as u64;

        let fork = config.fork_at_epoch(epoch);
        let (current_sync_committee_indices, next_sync_committee_indices) = if fork
            >= ForkName::Altair
        {
            (
                Arc::new(sync_committee_indices(&pubkey_cache, &state.current_sync_committee)?),
                Arc::new(sync_committee_indices(&pubkey_cache, &state.next_sync_committee)?),
            )
        } else {
            (Arc::new(vec![]), Arc::new(vec![]))
        };

        let proposers = compute_proposers(
            state,
            epoch,
            &current_shuffling.active_indices,
            &effective_balance_increments,
        )?;

        Ok(Self {
            config,
            pubkey_cache,
            previous_shuffling,
            current_shuffling,
            next_shuffling,
            proposers,
            effective_balance_increments,
            total_active_balance_increments,
            base_reward_per_increment,
            sync_participant_reward,
            sync_proposer_reward,
            churn_limit,
            exit_queue_epoch,
            exit_queue_churn,
            current_sync_committee_indices,
            next_sync_committee_indices,
            epoch,
            sync_period: compute_sync_committee_period(epoch),
        })
    }

    /// The fork in effect for the epoch this context caches.
    pub fn fork(&self) -> ForkName {
        self.config.fork_at_epoch(self.epoch)
    }

    pub fn total_active_balance(&self) -> u64 {
        self.total_active_balance_increments * EFFECTIVE_BALANCE_INCREMENT
    }

    pub fn effective_balance(&self, validator_index: u64) -> u64 {
        self.effective_balance_increments
            .get(validator_index as usize)
            .map(|&increments| increments as u64 * EFFECTIVE_BALANCE_INCREMENT)
            .unwrap_or(0)
    }

    /// Registers a deposit-created validator in the shared registry and the increments array.
    pub fn add_pubkey(&mut self, pubkey: pharos_bls::PubKey, index: u64) -> anyhow::Result<()> {
        self.pubkey_cache.insert(pubkey, index)
    }

    pub fn set_effective_balance(&mut self, validator_index: u64, effective_balance: u64) {
        let increments = Arc::make_mut(&mut self.effective_balance_increments);
        let index = validator_index as usize;
        if index >= increments.len() {
            increments.resize(index + 1, 0);
        }
        increments[index] = (effective_balance / EFFECTIVE_BALANCE_INCREMENT) as u8;
    }

    /// Detaches the increments array from clones of this context before the epoch transition
    /// mutates it.
    pub fn before_epoch_transition(&mut self) {
        Arc::make_mut(&mut self.effective_balance_increments);
    }

    pub fn get_shuffling_at_epoch(&self, epoch: u64) -> anyhow::Result<&Arc<EpochShuffling>> {
        if epoch == self.previous_shuffling.epoch {
            Ok(&self.previous_shuffling)
        } else if epoch == self.current_shuffling.epoch {
            Ok(&self.current_shuffling)
        } else if epoch == self.next_shuffling.epoch {
            Ok(&self.next_shuffling)
        } else {
            bail!(
                "Requested shuffling at epoch {epoch}, only {} through {} are cached",
                self.previous_shuffling.epoch,
                self.next_shuffling.epoch
            )
        }
    }

    pub fn get_committee_count_per_slot(&self, epoch: u64) -> anyhow::Result<u64> {
        Ok(self.get_shuffling_at_epoch(epoch)?.committees_per_slot)
    }

    /// Return the beacon committee at ``slot`` for ``committee_index``.
    pub fn get_beacon_committee(
        &self,
        slot: u64,
        committee_index: u64,
    ) -> anyhow::Result<Arc<Vec<u64>>> {
        let shuffling = self.get_shuffling_at_epoch(compute_epoch_at_slot(slot))?;
        ensure!(
            committee_index < shuffling.committees_per_slot,
            "Committee index {committee_index} out of range ({} per slot)",
            shuffling.committees_per_slot
        );
        shuffling
            .get_committee(slot, committee_index)
            .cloned()
            .ok_or_else(|| anyhow!("No committee at slot {slot} index {committee_index}"))
    }

    pub fn get_beacon_proposer(&self, slot: u64) -> anyhow::Result<u64> {
        ensure!(
            compute_epoch_at_slot(slot) == self.epoch,
            "Proposer schedule only covers epoch {}, asked for slot {slot}",
            self.epoch
        );
        Ok(self.proposers[(slot % SLOTS_PER_EPOCH) as usize])
    }

    /// Return the set of attesting indices corresponding to ``data`` and ``bits``.
    pub fn get_attesting_indices(&self, attestation: &Attestation) -> anyhow::Result<Vec<u64>> {
        let committee = self.get_beacon_committee(attestation.data.slot, attestation.data.index)?;
        ensure!(
            attestation.aggregation_bits.len() == committee.len(),
            "Aggregation bits length {} doesn't match committee size {}",
            attestation.aggregation_bits.len(),
            committee.len()
        );
        Ok(committee
            .iter()
            .enumerate()
            .filter_map(|(position, &index)| {
                attestation
                    .aggregation_bits
                    .get(position)
                    .ok()
                    .and_then(|bit| bit.then_some(index))
            })
            .collect())
    }

    /// Return the indexed attestation corresponding to ``attestation``.
    pub fn get_indexed_attestation(
        &self,
        attestation: &Attestation,
    ) -> anyhow::Result<IndexedAttestation> {
        let attesting_indices = self
            .get_attesting_indices(attestation)?
            .into_iter()
            .sorted()
            .collect::<Vec<_>>();
        Ok(IndexedAttestation {
            attesting_indices: attesting_indices.into(),
            data: attestation.data.clone(),
            signature: attestation.signature.clone(),
        })
    }

    /// Rotates shufflings and recomputes the per-epoch derived values after ``process_epoch``
    /// ran on ``state``. The state still sits on the last slot of the old epoch.
    pub fn after_process_epoch(
        &mut self,
        state: &BeaconState,
        epoch_process: &EpochProcess,
    ) -> anyhow::Result<()> {
        let next_epoch = self.epoch + 1;
        let shuffling_epoch = next_epoch + 1;

        self.previous_shuffling = std::mem::replace(
            &mut self.current_shuffling,
            self.next_shuffling.clone(),
        );
        self.next_shuffling = Arc::new(EpochShuffling::compute(
            shuffling_epoch,
            state.get_seed(shuffling_epoch, DOMAIN_BEACON_ATTESTER),
            Arc::new(epoch_process.next_shuffling_active_indices.clone()),
        )?);

        self.total_active_balance_increments =
            max(1, epoch_process.next_epoch_total_active_balance_increments);
        self.base_reward_per_increment =
            compute_base_reward_per_increment(self.total_active_balance_increments);
        let (participant_reward, proposer_reward) = compute_sync_rewards(
            self.total_active_balance_increments,
            self.base_reward_per_increment,
        );
        self.sync_participant_reward = participant_reward;
        self.sync_proposer_reward = proposer_reward;

        let active_count = self.current_shuffling.active_indices.len() as u64;
        self.churn_limit = max(MIN_PER_EPOCH_CHURN_LIMIT, active_count / CHURN_LIMIT_QUOTIENT);

        let exit_queue_floor = compute_activation_exit_epoch(next_epoch);
        if exit_queue_floor > self.exit_queue_epoch {
            self.exit_queue_epoch = exit_queue_floor;
            self.exit_queue_churn = 0;
        }

        self.epoch = next_epoch;
        self.sync_period = compute_sync_committee_period(next_epoch);
        self.proposers = compute_proposers(
            state,
            next_epoch,
            &self.current_shuffling.active_indices,
            &self.effective_balance_increments,
        )?;
        Ok(())
    }

    /// Reloads the sync-committee index caches after the state rotated its committees at a sync
    /// period boundary.
    pub fn rotate_sync_committees(&mut self, state: &BeaconState) -> anyhow::Result<()> {
        self.current_sync_committee_indices = self.next_sync_committee_indices.clone();
        self.next_sync_committee_indices = Arc::new(sync_committee_indices(
            &self.pubkey_cache,
            &state.next_sync_committee,
        )?);
        Ok(())
    }

    /// Load both sync-committee index caches from the state (fork upgrade path).
    pub fn reload_sync_committees(&mut self, state: &BeaconState) -> anyhow::Result<()> {
        self.current_sync_committee_indices = Arc::new(sync_committee_indices(
            &self.pubkey_cache,
            &state.current_sync_committee,
        )?);
        self.next_sync_committee_indices = Arc::new(sync_committee_indices(
            &self.pubkey_cache,
            &state.next_sync_committee,
        )?);
        Ok(())
    }
}

/// `EFFECTIVE_BALANCE_INCREMENT * BASE_REWARD_FACTOR // integer_squareroot(total_active_balance)`
fn compute_base_reward_per_increment(total_active_balance_increments: u64) -> u64 {
    EFFECTIVE_BALANCE_INCREMENT * BASE_REWARD_FACTOR
        / integer_squareroot(total_active_balance_increments * EFFECTIVE_BALANCE_INCREMENT)
}

fn compute_sync_rewards(
    total_active_balance_increments: u64,
    base_reward_per_increment: u64,
) -> (u64, u64) {
    let total_base_rewards = base_reward_per_increment * total_active_balance_increments;
    let max_participant_rewards =
        total_base_rewards * SYNC_REWARD_WEIGHT / WEIGHT_DENOMINATOR / SLOTS_PER_EPOCH;
    let participant_reward = max_participant_rewards / SYNC_COMMITTEE_SIZE;
    let proposer_reward =
        participant_reward * PROPOSER_WEIGHT / (WEIGHT_DENOMINATOR - PROPOSER_WEIGHT);
    (participant_reward, proposer_reward)
}

fn sync_committee_indices(
    pubkey_cache: &PubkeyCache,
    committee: &SyncCommittee,
) -> anyhow::Result<Vec<u64>> {
    committee
        .pubkeys
        .iter()
        .map(|pubkey| {
            pubkey_cache
                .get_index(pubkey)
                .ok_or_else(|| anyhow!("Sync committee pubkey missing from registry"))
        })
        .collect()
}

/// Effective-balance rejection sampling over the shuffled active set.
pub fn compute_proposer_index(
    active_indices: &[u64],
    seed: B256,
    effective_balance_increments: &[u8],
) -> anyhow::Result<u64> {
    ensure!(!active_indices.is_empty(), "No active validators to propose");

    let total = active_indices.len();
    let max_effective_increments = MAX_EFFECTIVE_BALANCE / EFFECTIVE_BALANCE_INCREMENT;
    let mut i: usize = 0;
    loop {
        let shuffled_index = compute_shuffled_index(i % total, total, seed)?;
        let candidate_index = active_indices[shuffled_index];
        let random_byte = {
            let seed_with_offset =
                [seed.as_slice(), &(i as u64 / 32).to_le_bytes()].concat();
            hash(&seed_with_offset)[i % 32] as u64
        };
        let effective_increments =
            effective_balance_increments[candidate_index as usize] as u64;
        if effective_increments * MAX_RANDOM_BYTE >= max_effective_increments * random_byte {
            return Ok(candidate_index);
        }
        i += 1;
    }
}

fn compute_proposers(
    state: &BeaconState,
    epoch: u64,
    active_indices: &[u64],
    effective_balance_increments: &[u8],
) -> anyhow::Result<Vec<u64>> {
    let epoch_seed = state.get_seed(epoch, DOMAIN_BEACON_PROPOSER);
    let start_slot = epoch * SLOTS_PER_EPOCH;
    (start_slot..start_slot + SLOTS_PER_EPOCH)
        .map(|slot| {
            let seed_with_slot = [epoch_seed.as_slice(), &slot.to_le_bytes()].concat();
            compute_proposer_index(
                active_indices,
                B256::from(ethereum_hashing::hash_fixed(&seed_with_slot)),
                effective_balance_increments,
            )
        })
        .collect()
}
