use std::cmp::max;

use anyhow::{anyhow, ensure};

use crate::{
    beacon_state::BeaconState,
    constants::{
        EPOCHS_PER_SLASHINGS_VECTOR, FAR_FUTURE_EPOCH, MIN_VALIDATOR_WITHDRAWABILITY_DELAY,
        PROPOSER_REWARD_QUOTIENT, PROPOSER_WEIGHT, WEIGHT_DENOMINATOR,
        WHISTLEBLOWER_REWARD_QUOTIENT,
    },
    epoch_cache::EpochContext,
    fork_schedule::ForkName,
};

/// A [BeaconState] together with its [EpochContext]. All processors run against this pair so
/// cache reads stay explicit; cloning it is how callers speculate on candidate blocks.
#[derive(Debug, Clone)]
pub struct CachedBeaconState {
    pub state: BeaconState,
    pub context: EpochContext,
}

impl CachedBeaconState {
    pub fn new(state: BeaconState, context: EpochContext) -> Self {
        Self { state, context }
    }

    /// Per-validator base reward: effective-balance increments times the cached per-increment
    /// reward.
    pub fn get_base_reward(&self, validator_index: u64) -> u64 {
        let increments = self
            .context
            .effective_balance_increments
            .get(validator_index as usize)
            .copied()
            .unwrap_or(0) as u64;
        increments * self.context.base_reward_per_increment
    }

    /// Initiate the exit of the validator with index ``index``, consuming the cached exit-queue
    /// counters instead of rescanning the registry.
    pub fn initiate_validator_exit(&mut self, index: u64) -> anyhow::Result<()> {
        let validator = self
            .state
            .validators
            .get(index as usize)
            .ok_or_else(|| anyhow!("Validator index {index} out of bounds"))?;
        if validator.exit_epoch != FAR_FUTURE_EPOCH {
            return Ok(());
        }

        if self.context.exit_queue_churn >= self.context.churn_limit {
            self.context.exit_queue_epoch += 1;
            self.context.exit_queue_churn = 0;
        }
        self.context.exit_queue_churn += 1;

        let exit_queue_epoch = self.context.exit_queue_epoch;
        let validator = &mut self.state.validators[index as usize];
        validator.exit_epoch = exit_queue_epoch;
        validator.withdrawable_epoch = exit_queue_epoch + MIN_VALIDATOR_WITHDRAWABILITY_DELAY;
        Ok(())
    }

    /// Slash the validator with index ``slashed_index``.
    pub fn slash_validator(
        &mut self,
        slashed_index: u64,
        whistleblower_index: Option<u64>,
    ) -> anyhow::Result<()> {
        let epoch = self.state.get_current_epoch();
        self.initiate_validator_exit(slashed_index)?;

        let validator = self
            .state
            .validators
            .get_mut(slashed_index as usize)
            .ok_or_else(|| anyhow!("Validator index {slashed_index} out of bounds"))?;
        validator.slashed = true;
        validator.withdrawable_epoch = max(
            validator.withdrawable_epoch,
            epoch + EPOCHS_PER_SLASHINGS_VECTOR,
        );
        let effective_balance = validator.effective_balance;

        self.state.slashings[(epoch % EPOCHS_PER_SLASHINGS_VECTOR) as usize] += effective_balance;
        let fork = self.context.fork();
        self.state.decrease_balance(
            slashed_index,
            effective_balance / fork.parameters().min_slashing_penalty_quotient,
        )?;

        // Proposer and whistleblower rewards.
        let proposer_index = self.context.get_beacon_proposer(self.state.slot)?;
        let whistleblower_index = whistleblower_index.unwrap_or(proposer_index);
        let whistleblower_reward = effective_balance / WHISTLEBLOWER_REWARD_QUOTIENT;
        let proposer_reward = if fork >= ForkName::Altair {
            whistleblower_reward * PROPOSER_WEIGHT / WEIGHT_DENOMINATOR
        } else {
            whistleblower_reward / PROPOSER_REWARD_QUOTIENT
        };
        self.state.increase_balance(proposer_index, proposer_reward)?;
        self.state
            .increase_balance(whistleblower_index, whistleblower_reward - proposer_reward)?;
        Ok(())
    }

    /// Appends a deposit-created validator to every registry slice and the caches, keeping the
    /// state and context in lockstep.
    pub fn append_validator(
        &mut self,
        validator: crate::validator::Validator,
        balance: u64,
    ) -> anyhow::Result<()> {
        let index = self.state.validators.len() as u64;
        ensure!(
            self.state.balances.len() == index as usize,
            "Validator and balance registries out of sync"
        );

        let pubkey = validator.pubkey.clone();
        let effective_balance = validator.effective_balance;
        self.state
            .validators
            .push(validator)
            .map_err(|err| anyhow!("Validator registry is full: {err:?}"))?;
        self.state
            .balances
            .push(balance)
            .map_err(|err| anyhow!("Balance registry is full: {err:?}"))?;
        self.state
            .previous_epoch_participation
            .push(0)
            .map_err(|err| anyhow!("Participation registry is full: {err:?}"))?;
        self.state
            .current_epoch_participation
            .push(0)
            .map_err(|err| anyhow!("Participation registry is full: {err:?}"))?;
        self.state
            .inactivity_scores
            .push(0)
            .map_err(|err| anyhow!("Inactivity registry is full: {err:?}"))?;

        self.context.add_pubkey(pubkey, index)?;
        self.context.set_effective_balance(index, effective_balance);
        Ok(())
    }
}
