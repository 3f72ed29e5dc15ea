//! Genesis-state construction from eth1 deposits, used by tests and devnet tooling.

use std::{collections::HashMap, sync::Arc};

use alloy_primitives::B256;
use anyhow::anyhow;
use pharos_merkle::{mix_in_length, padded_merkle_root};
use ssz_types::FixedVector;
use tracing::warn;
use tree_hash::TreeHash;

use crate::{
    beacon_state::BeaconState,
    cached_state::CachedBeaconState,
    config::ChainConfig,
    constants::{
        DEPOSIT_CONTRACT_TREE_DEPTH, EPOCHS_PER_HISTORICAL_VECTOR, GENESIS_EPOCH,
        MAX_EFFECTIVE_BALANCE,
    },
    deposit_data::DepositData,
    epoch_cache::EpochContext,
    eth_1_data::Eth1Data,
    fork::Fork,
    fork_schedule::ForkName,
    state_transition::block::{get_validator_from_deposit, is_valid_deposit_signature},
};

/// Builds the genesis state from the eth1 block the deposits were collected up to. Deposits with
/// an invalid proof-of-possession signature are skipped, exactly as in block processing.
pub fn initialize_beacon_state_from_eth1(
    config: ChainConfig,
    eth1_block_hash: B256,
    eth1_timestamp: u64,
    deposits: &[DepositData],
) -> anyhow::Result<CachedBeaconState> {
    let genesis_fork = config.fork_at_epoch(GENESIS_EPOCH);
    let fork_version = config.fork_version(genesis_fork);

    let deposit_leaves = deposits
        .iter()
        .map(|data| data.tree_hash_root())
        .collect::<Vec<_>>();
    let deposit_root = mix_in_length(
        padded_merkle_root(&deposit_leaves, DEPOSIT_CONTRACT_TREE_DEPTH)?,
        deposits.len() as u64,
    );

    let mut state = BeaconState {
        genesis_time: eth1_timestamp + config.genesis_delay,
        fork: Fork {
            previous_version: fork_version,
            current_version: fork_version,
            epoch: GENESIS_EPOCH,
        },
        eth1_data: Eth1Data {
            deposit_root,
            deposit_count: deposits.len() as u64,
            block_hash: eth1_block_hash,
        },
        randao_mixes: FixedVector::from(vec![
            eth1_block_hash;
            EPOCHS_PER_HISTORICAL_VECTOR as usize
        ]),
        ..Default::default()
    };

    // Process deposits
    let mut registry = HashMap::new();
    for data in deposits {
        state.eth1_deposit_index += 1;
        if let Some(&index) = registry.get(&data.pubkey) {
            state.increase_balance(index, data.amount)?;
            continue;
        }
        match is_valid_deposit_signature(
            &data.pubkey,
            data.withdrawal_credentials,
            data.amount,
            &data.signature,
        ) {
            Ok(true) => {}
            _ => {
                warn!(pubkey = ?data.pubkey, "skipping genesis deposit with invalid signature");
                continue;
            }
        }

        let index = state.validators.len() as u64;
        registry.insert(data.pubkey.clone(), index);
        state
            .validators
            .push(get_validator_from_deposit(
                data.pubkey.clone(),
                data.withdrawal_credentials,
                data.amount,
            ))
            .map_err(|err| anyhow!("Validator registry is full: {err:?}"))?;
        state
            .balances
            .push(data.amount)
            .map_err(|err| anyhow!("Balance registry is full: {err:?}"))?;
    }

    // Process activations
    for validator in state.validators.iter_mut() {
        if validator.effective_balance == MAX_EFFECTIVE_BALANCE {
            validator.activation_eligibility_epoch = GENESIS_EPOCH;
            validator.activation_epoch = GENESIS_EPOCH;
        }
    }

    let validator_count = state.validators.len();
    state.previous_epoch_participation = vec![0u8; validator_count].into();
    state.current_epoch_participation = vec![0u8; validator_count].into();
    state.inactivity_scores = vec![0u64; validator_count].into();

    // Set genesis validators root for domain separation and chain versioning
    state.genesis_validators_root = state.validators.tree_hash_root();

    // Fill in sync committees
    if genesis_fork >= ForkName::Altair {
        let sync_committee = Arc::new(state.get_next_sync_committee()?);
        state.current_sync_committee = sync_committee.clone();
        state.next_sync_committee = sync_committee;
    }

    let context = EpochContext::new_from_state(config, &state)?;
    Ok(CachedBeaconState::new(state, context))
}

pub fn is_valid_genesis_state(state: &BeaconState, config: &ChainConfig) -> bool {
    state.genesis_time >= config.min_genesis_time
        && state.get_active_validator_indices(GENESIS_EPOCH).len() as u64
            >= config.min_genesis_active_validator_count
}
