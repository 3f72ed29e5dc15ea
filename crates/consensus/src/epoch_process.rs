use std::cmp::max;

use anyhow::{anyhow, ensure};
use itertools::Itertools;

use crate::{
    attester_status::{
        FLAG_CURR_HEAD_ATTESTER, FLAG_CURR_SOURCE_ATTESTER, FLAG_CURR_TARGET_ATTESTER,
        FLAG_ELIGIBLE_ATTESTER, FLAG_PREV_HEAD_ATTESTER, FLAG_PREV_SOURCE_ATTESTER,
        FLAG_PREV_TARGET_ATTESTER, FLAG_UNSLASHED, has_markers,
    },
    beacon_state::BeaconState,
    constants::{
        EFFECTIVE_BALANCE_INCREMENT, EPOCHS_PER_SLASHINGS_VECTOR, FAR_FUTURE_EPOCH,
        TIMELY_HEAD_FLAG_INDEX, TIMELY_SOURCE_FLAG_INDEX, TIMELY_TARGET_FLAG_INDEX,
    },
    epoch_cache::EpochContext,
    misc::has_flag,
};

/// Ephemeral product of one linear pass over the validator registry, made at the start of an
/// epoch transition and consumed by the epoch sub-routines. Dropped when the transition is done.
#[derive(Debug)]
pub struct EpochProcess {
    pub current_epoch: u64,
    pub previous_epoch: u64,

    /// One status byte per validator, see [crate::attester_status].
    pub statuses: Vec<u8>,

    pub total_active_stake_increments: u64,
    pub prev_source_unslashed_stake_increments: u64,
    pub prev_target_unslashed_stake_increments: u64,
    pub prev_head_unslashed_stake_increments: u64,
    pub curr_target_unslashed_stake_increments: u64,

    /// Validators whose proportional slashing penalty lands this epoch.
    pub indices_to_slash: Vec<u64>,
    /// Validators entering the activation queue this epoch.
    pub indices_eligible_for_activation_queue: Vec<u64>,
    /// Queue candidates ordered by `(activation_eligibility_epoch, index)`; the registry update
    /// re-checks each against the (possibly just advanced) finalized epoch.
    pub indices_eligible_for_activation: Vec<u64>,
    pub indices_to_eject: Vec<u64>,

    /// Active validator set two epochs ahead, for the post-transition next shuffling.
    pub next_shuffling_active_indices: Vec<u64>,
    /// Filled in by the effective-balance update step, consumed by `after_process_epoch`.
    pub next_epoch_total_active_balance_increments: u64,
}

pub fn before_process_epoch(
    state: &BeaconState,
    context: &EpochContext,
) -> anyhow::Result<EpochProcess> {
    let current_epoch = state.get_current_epoch();
    let previous_epoch = state.get_previous_epoch();
    let slashing_epoch = current_epoch + EPOCHS_PER_SLASHINGS_VECTOR / 2;
    let shuffling_epoch = current_epoch + 2;

    let validator_count = state.validators.len();
    let mut statuses = vec![0u8; validator_count];
    let mut total_active_stake_increments = 0u64;
    let mut indices_to_slash = vec![];
    let mut indices_eligible_for_activation_queue = vec![];
    let mut activation_candidates = vec![];
    let mut indices_to_eject = vec![];
    let mut next_shuffling_active_indices = vec![];

    for (index, validator) in state.validators.iter().enumerate() {
        let mut status = 0u8;
        if !validator.slashed {
            status |= FLAG_UNSLASHED;
        } else if validator.withdrawable_epoch == slashing_epoch {
            indices_to_slash.push(index as u64);
        }

        let active_previous = validator.is_active_validator(previous_epoch);
        if active_previous
            || (validator.slashed && previous_epoch + 1 < validator.withdrawable_epoch)
        {
            status |= FLAG_ELIGIBLE_ATTESTER;
        }

        if validator.is_active_validator(current_epoch) {
            total_active_stake_increments = total_active_stake_increments
                .checked_add(context.effective_balance_increments[index] as u64)
                .ok_or_else(|| anyhow!("Total active stake overflows"))?;

            if validator.is_ejectable(current_epoch) {
                indices_to_eject.push(index as u64);
            }
        }

        if validator.is_eligible_for_activation_queue() {
            indices_eligible_for_activation_queue.push(index as u64);
        }
        if validator.activation_eligibility_epoch != FAR_FUTURE_EPOCH
            && validator.activation_epoch == FAR_FUTURE_EPOCH
        {
            activation_candidates.push((validator.activation_eligibility_epoch, index as u64));
        }

        if validator.is_active_validator(shuffling_epoch) {
            next_shuffling_active_indices.push(index as u64);
        }

        statuses[index] = status;
    }

    // The protocol's arithmetic assumes total stake in Gwei stays within the safe envelope;
    // breaching it is a configuration error, not a recoverable condition.
    ensure!(
        total_active_stake_increments
            .checked_mul(EFFECTIVE_BALANCE_INCREMENT)
            .is_some(),
        "Total active stake exceeds the safe range"
    );

    mark_participation(
        &mut statuses,
        &state.previous_epoch_participation,
        FLAG_PREV_SOURCE_ATTESTER,
        FLAG_PREV_TARGET_ATTESTER,
        FLAG_PREV_HEAD_ATTESTER,
    );
    mark_participation(
        &mut statuses,
        &state.current_epoch_participation,
        FLAG_CURR_SOURCE_ATTESTER,
        FLAG_CURR_TARGET_ATTESTER,
        FLAG_CURR_HEAD_ATTESTER,
    );

    let mut prev_source_unslashed_stake_increments = 0u64;
    let mut prev_target_unslashed_stake_increments = 0u64;
    let mut prev_head_unslashed_stake_increments = 0u64;
    let mut curr_target_unslashed_stake_increments = 0u64;
    for (index, &status) in statuses.iter().enumerate() {
        let increments = context.effective_balance_increments[index] as u64;
        if has_markers(status, FLAG_PREV_SOURCE_ATTESTER | FLAG_UNSLASHED) {
            prev_source_unslashed_stake_increments += increments;
        }
        if has_markers(status, FLAG_PREV_TARGET_ATTESTER | FLAG_UNSLASHED) {
            prev_target_unslashed_stake_increments += increments;
        }
        if has_markers(status, FLAG_PREV_HEAD_ATTESTER | FLAG_UNSLASHED) {
            prev_head_unslashed_stake_increments += increments;
        }
        if has_markers(status, FLAG_CURR_TARGET_ATTESTER | FLAG_UNSLASHED) {
            curr_target_unslashed_stake_increments += increments;
        }
    }

    let indices_eligible_for_activation = activation_candidates
        .into_iter()
        .sorted()
        .map(|(_, index)| index)
        .collect::<Vec<_>>();

    Ok(EpochProcess {
        current_epoch,
        previous_epoch,
        statuses,
        // Stake sums are floored at one increment so ratio computations never divide by zero.
        total_active_stake_increments: max(1, total_active_stake_increments),
        prev_source_unslashed_stake_increments: max(1, prev_source_unslashed_stake_increments),
        prev_target_unslashed_stake_increments: max(1, prev_target_unslashed_stake_increments),
        prev_head_unslashed_stake_increments: max(1, prev_head_unslashed_stake_increments),
        curr_target_unslashed_stake_increments: max(1, curr_target_unslashed_stake_increments),
        indices_to_slash,
        indices_eligible_for_activation_queue,
        indices_eligible_for_activation,
        indices_to_eject,
        next_shuffling_active_indices,
        next_epoch_total_active_balance_increments: 0,
    })
}

fn mark_participation(
    statuses: &mut [u8],
    participation: &[u8],
    source_marker: u8,
    target_marker: u8,
    head_marker: u8,
) {
    for (status, &flags) in statuses.iter_mut().zip(participation.iter()) {
        if has_flag(flags, TIMELY_SOURCE_FLAG_INDEX) {
            *status |= source_marker;
        }
        if has_flag(flags, TIMELY_TARGET_FLAG_INDEX) {
            *status |= target_marker;
        }
        if has_flag(flags, TIMELY_HEAD_FLAG_INDEX) {
            *status |= head_marker;
        }
    }
}
