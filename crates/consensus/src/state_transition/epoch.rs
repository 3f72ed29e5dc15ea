use std::{cmp::min, sync::Arc};

use anyhow::anyhow;
use tree_hash::TreeHash;

use crate::{
    attester_status::{
        FLAG_ELIGIBLE_ATTESTER, FLAG_PREV_HEAD_ATTESTER, FLAG_PREV_SOURCE_ATTESTER,
        FLAG_PREV_TARGET_ATTESTER, FLAG_UNSLASHED, has_markers,
    },
    cached_state::CachedBeaconState,
    checkpoint::Checkpoint,
    constants::{
        EFFECTIVE_BALANCE_INCREMENT, EPOCHS_PER_ETH1_VOTING_PERIOD,
        EPOCHS_PER_HISTORICAL_VECTOR, EPOCHS_PER_SLASHINGS_VECTOR,
        EPOCHS_PER_SYNC_COMMITTEE_PERIOD, GENESIS_EPOCH, HYSTERESIS_DOWNWARD_MULTIPLIER,
        HYSTERESIS_QUOTIENT, HYSTERESIS_UPWARD_MULTIPLIER, INACTIVITY_SCORE_BIAS,
        INACTIVITY_SCORE_RECOVERY_RATE, JUSTIFICATION_BITS_LENGTH, MAX_EFFECTIVE_BALANCE,
        MIN_EPOCHS_TO_INACTIVITY_PENALTY, PARTICIPATION_FLAG_WEIGHTS, SLOTS_PER_EPOCH,
        SLOTS_PER_HISTORICAL_ROOT, TIMELY_HEAD_FLAG_INDEX, TIMELY_SOURCE_FLAG_INDEX,
        TIMELY_TARGET_FLAG_INDEX, WEIGHT_DENOMINATOR,
    },
    epoch_process::EpochProcess,
    fork_schedule::ForkName,
    historical_batch::HistoricalBatch,
    misc::compute_activation_exit_epoch,
};

impl CachedBeaconState {
    /// The epoch transition, run on the last slot of each epoch. ``epoch_process`` is the
    /// single-pass registry snapshot made by
    /// [crate::epoch_process::before_process_epoch]; the effective-balance step writes the
    /// next-epoch total back into it for [crate::epoch_cache::EpochContext::after_process_epoch].
    pub fn process_epoch(&mut self, epoch_process: &mut EpochProcess) -> anyhow::Result<()> {
        self.process_justification_and_finalization(epoch_process)?;
        self.process_inactivity_updates(epoch_process)?;
        self.process_rewards_and_penalties(epoch_process)?;
        self.process_registry_updates(epoch_process)?;
        self.process_slashings(epoch_process)?;
        self.process_eth1_data_reset()?;
        self.process_effective_balance_updates(epoch_process)?;
        self.process_slashings_reset()?;
        self.process_randao_mixes_reset()?;
        self.process_historical_roots_update()?;
        self.process_participation_flag_updates()?;
        if self.context.fork() >= ForkName::Altair {
            self.process_sync_committee_updates()?;
        }

        Ok(())
    }

    pub fn process_justification_and_finalization(
        &mut self,
        epoch_process: &EpochProcess,
    ) -> anyhow::Result<()> {
        // Initial FFG checkpoint values have a `0x00` stub for `root` (i.e. the genesis block)
        // rather than the actual block root, so the target epochs of the first two epochs would
        // not match the recorded roots
        if epoch_process.current_epoch <= GENESIS_EPOCH + 1 {
            return Ok(());
        }

        self.weigh_justification_and_finalization(
            epoch_process.total_active_stake_increments,
            epoch_process.prev_target_unslashed_stake_increments,
            epoch_process.curr_target_unslashed_stake_increments,
        )
    }

    /// Updates the justification bitfield and checkpoints from the target attestation weights,
    /// then applies the four finalization rules against the pre-update checkpoints.
    pub fn weigh_justification_and_finalization(
        &mut self,
        total_active_increments: u64,
        previous_target_increments: u64,
        current_target_increments: u64,
    ) -> anyhow::Result<()> {
        let previous_epoch = self.state.get_previous_epoch();
        let current_epoch = self.state.get_current_epoch();
        let old_previous_justified = self.state.previous_justified_checkpoint;
        let old_current_justified = self.state.current_justified_checkpoint;
        let previous_target_root = self.state.get_block_root(previous_epoch)?;
        let current_target_root = self.state.get_block_root(current_epoch)?;

        // Process justifications
        self.state.previous_justified_checkpoint = self.state.current_justified_checkpoint;
        for i in (1..JUSTIFICATION_BITS_LENGTH).rev() {
            let bit = self
                .state
                .justification_bits
                .get(i - 1)
                .map_err(|err| anyhow!("Invalid justification bit: {err:?}"))?;
            self.state
                .justification_bits
                .set(i, bit)
                .map_err(|err| anyhow!("Invalid justification bit: {err:?}"))?;
        }
        self.state
            .justification_bits
            .set(0, false)
            .map_err(|err| anyhow!("Invalid justification bit: {err:?}"))?;

        if previous_target_increments * 3 >= total_active_increments * 2 {
            self.state.current_justified_checkpoint = Checkpoint {
                epoch: previous_epoch,
                root: previous_target_root,
            };
            self.state
                .justification_bits
                .set(1, true)
                .map_err(|err| anyhow!("Invalid justification bit: {err:?}"))?;
        }
        if current_target_increments * 3 >= total_active_increments * 2 {
            self.state.current_justified_checkpoint = Checkpoint {
                epoch: current_epoch,
                root: current_target_root,
            };
            self.state
                .justification_bits
                .set(0, true)
                .map_err(|err| anyhow!("Invalid justification bit: {err:?}"))?;
        }

        // Process finalizations
        let mut bits = [false; JUSTIFICATION_BITS_LENGTH];
        for (i, bit) in bits.iter_mut().enumerate() {
            *bit = self
                .state
                .justification_bits
                .get(i)
                .map_err(|err| anyhow!("Invalid justification bit: {err:?}"))?;
        }

        // The 2nd/3rd/4th most recent epochs are justified, the 2nd using the 4th as source
        if bits[1..4].iter().all(|&bit| bit)
            && old_previous_justified.epoch + 3 == current_epoch
        {
            self.state.finalized_checkpoint = old_previous_justified;
        }
        // The 2nd/3rd most recent epochs are justified, the 2nd using the 3rd as source
        if bits[1..3].iter().all(|&bit| bit)
            && old_previous_justified.epoch + 2 == current_epoch
        {
            self.state.finalized_checkpoint = old_previous_justified;
        }
        // The 1st/2nd/3rd most recent epochs are justified, the 1st using the 3rd as source
        if bits[0..3].iter().all(|&bit| bit) && old_current_justified.epoch + 2 == current_epoch {
            self.state.finalized_checkpoint = old_current_justified;
        }
        // The 1st/2nd most recent epochs are justified, the 1st using the 2nd as source
        if bits[0..2].iter().all(|&bit| bit) && old_current_justified.epoch + 1 == current_epoch {
            self.state.finalized_checkpoint = old_current_justified;
        }

        Ok(())
    }

    pub fn get_finality_delay(&self) -> u64 {
        self.state.get_previous_epoch() - self.state.finalized_checkpoint.epoch
    }

    pub fn is_in_inactivity_leak(&self) -> bool {
        self.get_finality_delay() > MIN_EPOCHS_TO_INACTIVITY_PENALTY
    }

    pub fn process_inactivity_updates(
        &mut self,
        epoch_process: &EpochProcess,
    ) -> anyhow::Result<()> {
        // Skip the genesis epoch as score updates are based on the previous epoch participation
        if epoch_process.current_epoch == GENESIS_EPOCH {
            return Ok(());
        }

        let in_leak = self.is_in_inactivity_leak();
        for (index, &status) in epoch_process.statuses.iter().enumerate() {
            if !has_markers(status, FLAG_ELIGIBLE_ATTESTER) {
                continue;
            }
            let score = self
                .state
                .inactivity_scores
                .get_mut(index)
                .ok_or_else(|| anyhow!("Inactivity score index {index} out of bounds"))?;
            if has_markers(status, FLAG_PREV_TARGET_ATTESTER | FLAG_UNSLASHED) {
                *score -= min(1, *score);
            } else {
                *score += INACTIVITY_SCORE_BIAS;
            }
            // Decrease the inactivity score of all eligible validators during a leak-free epoch
            if !in_leak {
                *score -= min(INACTIVITY_SCORE_RECOVERY_RATE, *score);
            }
        }

        Ok(())
    }

    /// Return the deltas for a given ``flag_index`` from the status bytes and the cached stake
    /// sums.
    pub fn get_flag_index_deltas(
        &self,
        epoch_process: &EpochProcess,
        flag_index: u8,
    ) -> anyhow::Result<(Vec<u64>, Vec<u64>)> {
        let mut rewards = vec![0; epoch_process.statuses.len()];
        let mut penalties = vec![0; epoch_process.statuses.len()];

        let weight = PARTICIPATION_FLAG_WEIGHTS[flag_index as usize];
        let (flag_marker, unslashed_participating_increments) = match flag_index {
            TIMELY_SOURCE_FLAG_INDEX => (
                FLAG_PREV_SOURCE_ATTESTER,
                epoch_process.prev_source_unslashed_stake_increments,
            ),
            TIMELY_TARGET_FLAG_INDEX => (
                FLAG_PREV_TARGET_ATTESTER,
                epoch_process.prev_target_unslashed_stake_increments,
            ),
            TIMELY_HEAD_FLAG_INDEX => (
                FLAG_PREV_HEAD_ATTESTER,
                epoch_process.prev_head_unslashed_stake_increments,
            ),
            _ => return Err(anyhow!("Unknown participation flag index {flag_index}")),
        };
        let active_increments = epoch_process.total_active_stake_increments;
        let in_leak = self.is_in_inactivity_leak();

        for (index, &status) in epoch_process.statuses.iter().enumerate() {
            if !has_markers(status, FLAG_ELIGIBLE_ATTESTER) {
                continue;
            }
            let base_reward = self.get_base_reward(index as u64);
            if has_markers(status, flag_marker | FLAG_UNSLASHED) {
                if !in_leak {
                    let reward_numerator =
                        base_reward * weight * unslashed_participating_increments;
                    rewards[index] += reward_numerator / (active_increments * WEIGHT_DENOMINATOR);
                }
            } else if flag_index != TIMELY_HEAD_FLAG_INDEX {
                penalties[index] += base_reward * weight / WEIGHT_DENOMINATOR;
            }
        }

        Ok((rewards, penalties))
    }

    /// Return the inactivity penalty deltas by considering timely target participation and
    /// inactivity scores.
    pub fn get_inactivity_penalty_deltas(
        &self,
        epoch_process: &EpochProcess,
    ) -> anyhow::Result<(Vec<u64>, Vec<u64>)> {
        let rewards = vec![0; epoch_process.statuses.len()];
        let mut penalties = vec![0; epoch_process.statuses.len()];
        let penalty_denominator = INACTIVITY_SCORE_BIAS
            * self.context.fork().parameters().inactivity_penalty_quotient;

        for (index, &status) in epoch_process.statuses.iter().enumerate() {
            if !has_markers(status, FLAG_ELIGIBLE_ATTESTER) {
                continue;
            }
            if !has_markers(status, FLAG_PREV_TARGET_ATTESTER | FLAG_UNSLASHED) {
                let penalty_numerator = self.context.effective_balance(index as u64)
                    * self.state.inactivity_scores[index];
                penalties[index] += penalty_numerator / penalty_denominator;
            }
        }

        Ok((rewards, penalties))
    }

    pub fn process_rewards_and_penalties(
        &mut self,
        epoch_process: &EpochProcess,
    ) -> anyhow::Result<()> {
        // No rewards are applied at the end of `GENESIS_EPOCH` because rewards are for work done
        // in the previous epoch
        if epoch_process.current_epoch == GENESIS_EPOCH {
            return Ok(());
        }

        let mut deltas = vec![];
        for flag_index in 0..PARTICIPATION_FLAG_WEIGHTS.len() {
            deltas.push(self.get_flag_index_deltas(epoch_process, flag_index as u8)?);
        }
        deltas.push(self.get_inactivity_penalty_deltas(epoch_process)?);

        for (rewards, penalties) in deltas {
            for index in 0..self.state.validators.len() {
                self.state.increase_balance(index as u64, rewards[index])?;
                self.state.decrease_balance(index as u64, penalties[index])?;
            }
        }

        Ok(())
    }

    pub fn process_registry_updates(
        &mut self,
        epoch_process: &EpochProcess,
    ) -> anyhow::Result<()> {
        let current_epoch = epoch_process.current_epoch;

        // Process activation eligibility and ejections
        for &index in &epoch_process.indices_eligible_for_activation_queue {
            self.state.validators[index as usize].activation_eligibility_epoch =
                current_epoch + 1;
        }
        for &index in &epoch_process.indices_to_eject {
            self.initiate_validator_exit(index)?;
        }

        // Dequeue validators for activation up to the churn limit, re-checking each candidate
        // against the finalized epoch the justification step may just have advanced
        let finalized_epoch = self.state.finalized_checkpoint.epoch;
        let activation_epoch = compute_activation_exit_epoch(current_epoch);
        let churn_limit = self.context.churn_limit;
        let mut activated = 0u64;
        for &index in &epoch_process.indices_eligible_for_activation {
            if activated >= churn_limit {
                break;
            }
            let validator = &mut self.state.validators[index as usize];
            if validator.is_eligible_for_activation(finalized_epoch) {
                validator.activation_epoch = activation_epoch;
                activated += 1;
            }
        }

        Ok(())
    }

    pub fn process_slashings(&mut self, epoch_process: &EpochProcess) -> anyhow::Result<()> {
        let total_balance = self.context.total_active_balance();
        let multiplier = self
            .context
            .fork()
            .parameters()
            .proportional_slashing_multiplier;
        let adjusted_total_slashing_balance =
            (self.state.slashings.iter().sum::<u64>() * multiplier).min(total_balance);

        for &index in &epoch_process.indices_to_slash {
            let effective_balance_increments =
                self.context.effective_balance_increments[index as usize] as u64;
            // The effective balance enters the numerator in increments to keep the product
            // within u64; the final multiply restores Gwei after the floor division.
            let penalty_numerator = effective_balance_increments * adjusted_total_slashing_balance;
            let penalty = penalty_numerator / total_balance * EFFECTIVE_BALANCE_INCREMENT;
            self.state.decrease_balance(index, penalty)?;
        }

        Ok(())
    }

    pub fn process_eth1_data_reset(&mut self) -> anyhow::Result<()> {
        let next_epoch = self.state.get_current_epoch() + 1;
        // Reset eth1 data votes
        if next_epoch % EPOCHS_PER_ETH1_VOTING_PERIOD == 0 {
            self.state.eth1_data_votes = Default::default();
        }

        Ok(())
    }

    pub fn process_effective_balance_updates(
        &mut self,
        epoch_process: &mut EpochProcess,
    ) -> anyhow::Result<()> {
        let hysteresis_increment = EFFECTIVE_BALANCE_INCREMENT / HYSTERESIS_QUOTIENT;
        let downward_threshold = hysteresis_increment * HYSTERESIS_DOWNWARD_MULTIPLIER;
        let upward_threshold = hysteresis_increment * HYSTERESIS_UPWARD_MULTIPLIER;
        let next_epoch = epoch_process.current_epoch + 1;

        let mut next_epoch_total_active_balance_increments = 0u64;
        for index in 0..self.state.validators.len() {
            let balance = self.state.balances[index];
            let validator = &mut self.state.validators[index];
            let previous_effective_balance = validator.effective_balance;
            if balance + downward_threshold < previous_effective_balance
                || previous_effective_balance + upward_threshold < balance
            {
                validator.effective_balance = min(
                    balance - balance % EFFECTIVE_BALANCE_INCREMENT,
                    MAX_EFFECTIVE_BALANCE,
                );
            }
            let effective_balance = validator.effective_balance;
            let active_next_epoch = validator.is_active_validator(next_epoch);
            if effective_balance != previous_effective_balance {
                self.context
                    .set_effective_balance(index as u64, effective_balance);
            }
            if active_next_epoch {
                next_epoch_total_active_balance_increments +=
                    effective_balance / EFFECTIVE_BALANCE_INCREMENT;
            }
        }
        epoch_process.next_epoch_total_active_balance_increments =
            next_epoch_total_active_balance_increments;

        Ok(())
    }

    pub fn process_slashings_reset(&mut self) -> anyhow::Result<()> {
        let next_epoch = self.state.get_current_epoch() + 1;
        // Reset slashings
        self.state.slashings[(next_epoch % EPOCHS_PER_SLASHINGS_VECTOR) as usize] = 0;

        Ok(())
    }

    pub fn process_randao_mixes_reset(&mut self) -> anyhow::Result<()> {
        let current_epoch = self.state.get_current_epoch();
        let next_epoch = current_epoch + 1;
        // Set randao mix
        self.state.randao_mixes[(next_epoch % EPOCHS_PER_HISTORICAL_VECTOR) as usize] =
            self.state.get_randao_mix(current_epoch);

        Ok(())
    }

    pub fn process_historical_roots_update(&mut self) -> anyhow::Result<()> {
        // Set historical root accumulator
        let next_epoch = self.state.get_current_epoch() + 1;
        if next_epoch % (SLOTS_PER_HISTORICAL_ROOT / SLOTS_PER_EPOCH) == 0 {
            let historical_batch = HistoricalBatch {
                block_roots: self.state.block_roots.clone(),
                state_roots: self.state.state_roots.clone(),
            };
            self.state
                .historical_roots
                .push(historical_batch.tree_hash_root())
                .map_err(|err| anyhow!("Historical roots list is full: {err:?}"))?;
        }

        Ok(())
    }

    pub fn process_participation_flag_updates(&mut self) -> anyhow::Result<()> {
        self.state.previous_epoch_participation =
            std::mem::take(&mut self.state.current_epoch_participation);
        self.state.current_epoch_participation =
            vec![0u8; self.state.validators.len()].into();

        Ok(())
    }

    pub fn process_sync_committee_updates(&mut self) -> anyhow::Result<()> {
        let next_epoch = self.state.get_current_epoch() + 1;
        if next_epoch % EPOCHS_PER_SYNC_COMMITTEE_PERIOD == 0 {
            let next_sync_committee = Arc::new(self.state.get_next_sync_committee()?);
            self.state.current_sync_committee = self.state.next_sync_committee.clone();
            self.state.next_sync_committee = next_sync_committee;
            self.context.rotate_sync_committees(&self.state)?;
        }

        Ok(())
    }
}
