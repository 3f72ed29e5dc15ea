//! End-to-end exercises of the transition function on a small dev-config chain.

use alloy_primitives::B256;
use pharos_bls::{BlsSignature, PrivateKey, traits::Signable};
use pharos_consensus::{
    CachedBeaconState, ChainConfig, ForkName,
    attestation::Attestation,
    attestation_data::AttestationData,
    beacon_block::{BeaconBlock, SignedBeaconBlock},
    beacon_block_body::BeaconBlockBody,
    checkpoint::Checkpoint,
    constants::{
        DEPOSIT_CONTRACT_TREE_DEPTH, DOMAIN_BEACON_ATTESTER, DOMAIN_DEPOSIT, DOMAIN_RANDAO,
        EPOCHS_PER_SLASHINGS_VECTOR, MAX_EFFECTIVE_BALANCE, PARTICIPATION_FLAG_WEIGHTS,
        PROPOSER_WEIGHT, TIMELY_HEAD_FLAG_INDEX, TIMELY_SOURCE_FLAG_INDEX,
        TIMELY_TARGET_FLAG_INDEX, WEIGHT_DENOMINATOR,
    },
    deposit::Deposit,
    deposit_data::DepositData,
    deposit_message::DepositMessage,
    epoch_process::before_process_epoch,
    eth_1_data::Eth1Data,
    execution_engine::NoopEngine,
    execution_payload::ExecutionPayload,
    execution_payload_header::ExecutionPayloadHeader,
    genesis::{initialize_beacon_state_from_eth1, is_valid_genesis_state},
    misc::{compute_domain, compute_signing_root, has_flag},
    sync_aggregate::SyncAggregate,
};
use pharos_merkle::{mix_in_length, padded_merkle_root};
use ssz_types::{
    BitList, FixedVector,
    typenum::{U33, U2048},
};
use tree_hash::TreeHash;

const VALIDATOR_COUNT: u64 = 64;
const ETH1_BLOCK_HASH: B256 = B256::repeat_byte(0x42);

fn private_key(index: u64) -> PrivateKey {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&(index + 1).to_le_bytes());
    PrivateKey::new(B256::from(bytes))
}

fn signed_deposit_data(key: &PrivateKey, amount: u64) -> DepositData {
    let pubkey = key.public_key().unwrap();
    let withdrawal_credentials = B256::repeat_byte(0x0B);
    let message = DepositMessage {
        pubkey: pubkey.clone(),
        withdrawal_credentials,
        amount,
    };
    let domain = compute_domain(DOMAIN_DEPOSIT, None, None);
    let signing_root = compute_signing_root(message, domain);
    let signature = key.sign(signing_root.as_ref()).unwrap();

    DepositData {
        pubkey,
        withdrawal_credentials,
        amount,
        signature,
    }
}

fn genesis_deposits() -> Vec<DepositData> {
    (0..VALIDATOR_COUNT)
        .map(|index| signed_deposit_data(&private_key(index), MAX_EFFECTIVE_BALANCE))
        .collect()
}

fn genesis_state(config: ChainConfig) -> CachedBeaconState {
    initialize_beacon_state_from_eth1(config, ETH1_BLOCK_HASH, 0, &genesis_deposits()).unwrap()
}

/// Branch for leaf ``index`` of the deposit tree, with the List length mix-in as the 33rd
/// element.
fn deposit_proof(leaves: &[B256], index: u64) -> FixedVector<B256, U33> {
    let mut proof = vec![];
    let mut node = index;
    for level in 0..DEPOSIT_CONTRACT_TREE_DEPTH {
        let sibling = node ^ 1;
        let span = 1u64 << level;
        let start = (sibling.saturating_mul(span)).min(leaves.len() as u64) as usize;
        let end = (start + span as usize).min(leaves.len());
        proof.push(padded_merkle_root(&leaves[start..end], level).unwrap());
        node /= 2;
    }
    let mut count = [0u8; 32];
    count[..8].copy_from_slice(&(leaves.len() as u64).to_le_bytes());
    proof.push(B256::from(count));

    FixedVector::from(proof)
}

/// Points the state's eth1 data at a deposit tree extended with ``extra``.
fn extend_deposit_tree(state: &mut CachedBeaconState, extra: &DepositData) -> Vec<B256> {
    let mut leaves = genesis_deposits()
        .iter()
        .map(|data| data.tree_hash_root())
        .collect::<Vec<_>>();
    leaves.push(extra.tree_hash_root());
    state.state.eth1_data = Eth1Data {
        deposit_root: mix_in_length(
            padded_merkle_root(&leaves, DEPOSIT_CONTRACT_TREE_DEPTH).unwrap(),
            leaves.len() as u64,
        ),
        deposit_count: leaves.len() as u64,
        block_hash: ETH1_BLOCK_HASH,
    };
    leaves
}

#[test]
fn genesis_is_valid_with_monotonic_registry_indices() {
    let config = ChainConfig::dev();
    let cached = genesis_state(config);

    assert!(is_valid_genesis_state(&cached.state, &config));
    assert_eq!(cached.state.validators.len() as u64, VALIDATOR_COUNT);
    for (index, validator) in cached.state.validators.iter().enumerate() {
        assert_eq!(
            cached.context.pubkey_cache.get_index(&validator.pubkey),
            Some(index as u64)
        );
        assert_eq!(validator.effective_balance, MAX_EFFECTIVE_BALANCE);
    }
    assert_eq!(cached.context.fork(), ForkName::Bellatrix);
}

#[test]
fn deposit_with_valid_signature_creates_validator() {
    let mut cached = genesis_state(ChainConfig::dev());
    let data = signed_deposit_data(&private_key(VALIDATOR_COUNT), MAX_EFFECTIVE_BALANCE);
    let leaves = extend_deposit_tree(&mut cached, &data);

    let deposit = Deposit {
        proof: deposit_proof(&leaves, VALIDATOR_COUNT),
        data,
    };
    cached.process_deposit(&deposit).unwrap();

    assert_eq!(cached.state.validators.len() as u64, VALIDATOR_COUNT + 1);
    assert_eq!(cached.state.eth1_deposit_index, VALIDATOR_COUNT + 1);
    let new_validator = &cached.state.validators[VALIDATOR_COUNT as usize];
    assert_eq!(new_validator.effective_balance, MAX_EFFECTIVE_BALANCE);
    assert_eq!(
        cached.context.pubkey_cache.get_index(&new_validator.pubkey),
        Some(VALIDATOR_COUNT)
    );
    assert_eq!(
        cached.state.balances[VALIDATOR_COUNT as usize],
        MAX_EFFECTIVE_BALANCE
    );
}

#[test]
fn deposit_with_invalid_signature_is_skipped_but_consumes_index() {
    let mut cached = genesis_state(ChainConfig::dev());
    // Signed by the wrong key, so the proof of possession fails
    let mut data = signed_deposit_data(&private_key(VALIDATOR_COUNT), MAX_EFFECTIVE_BALANCE);
    data.signature = signed_deposit_data(&private_key(0), MAX_EFFECTIVE_BALANCE).signature;
    let leaves = extend_deposit_tree(&mut cached, &data);

    let deposit = Deposit {
        proof: deposit_proof(&leaves, VALIDATOR_COUNT),
        data,
    };
    cached.process_deposit(&deposit).unwrap();

    assert_eq!(cached.state.validators.len() as u64, VALIDATOR_COUNT);
    assert_eq!(cached.state.eth1_deposit_index, VALIDATOR_COUNT + 1);
}

#[test]
fn deposit_with_bad_proof_is_rejected() {
    let mut cached = genesis_state(ChainConfig::dev());
    let data = signed_deposit_data(&private_key(VALIDATOR_COUNT), MAX_EFFECTIVE_BALANCE);
    let leaves = extend_deposit_tree(&mut cached, &data);

    let mut proof = deposit_proof(&leaves, VALIDATOR_COUNT);
    proof[0] = B256::repeat_byte(0xFF);
    let deposit = Deposit { proof, data };

    assert!(cached.process_deposit(&deposit).is_err());
    assert_eq!(cached.state.eth1_deposit_index, VALIDATOR_COUNT);
}

#[test]
fn justification_bits_shift_and_justify_the_previous_target() {
    let mut cached = genesis_state(ChainConfig::dev());
    cached.process_slots(65).unwrap();

    // 0b1101
    cached.state.justification_bits.set(0, true).unwrap();
    cached.state.justification_bits.set(2, true).unwrap();
    cached.state.justification_bits.set(3, true).unwrap();
    let old_current_justified = cached.state.current_justified_checkpoint;

    // Previous-target supermajority, no current-target supermajority
    cached
        .weigh_justification_and_finalization(100, 67, 0)
        .unwrap();

    let bits = (0..4)
        .map(|i| cached.state.justification_bits.get(i).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(bits, vec![false, true, false, true], "0b1101 -> 0b1010");
    assert_eq!(cached.state.current_justified_checkpoint.epoch, 1);
    assert_eq!(
        cached.state.previous_justified_checkpoint,
        old_current_justified
    );
    assert_eq!(cached.state.finalized_checkpoint.epoch, 0);
}

#[test]
fn balances_floor_at_zero() {
    let mut cached = genesis_state(ChainConfig::dev());
    cached.state.decrease_balance(0, u64::MAX).unwrap();
    assert_eq!(cached.state.balances[0], 0);
}

#[test]
fn slashing_is_deterministic_across_clones() {
    let cached = genesis_state(ChainConfig::dev());
    let mut first = cached.clone();
    let mut second = cached.clone();

    first.slash_validator(5, None).unwrap();
    second.slash_validator(5, None).unwrap();

    assert_eq!(first.state, second.state);
    assert!(first.state.validators[5].slashed);
    assert!(first.state.balances[5] < MAX_EFFECTIVE_BALANCE);
}

#[test]
fn empty_slot_replay_is_idempotent() {
    let cached = genesis_state(ChainConfig::dev());
    let mut first = cached.clone();
    let mut second = cached.clone();

    first.process_slots(40).unwrap();
    second.process_slots(40).unwrap();

    assert_eq!(first.state, second.state);
    assert_eq!(first.state.slot, 40);
}

#[test]
fn fork_upgrades_fire_at_their_scheduled_epochs() {
    let config = ChainConfig {
        altair_fork_epoch: 1,
        bellatrix_fork_epoch: 2,
        ..ChainConfig::dev()
    };
    let mut cached = genesis_state(config);
    assert_eq!(cached.context.fork(), ForkName::Phase0);

    cached.process_slots(32).unwrap();
    assert_eq!(cached.state.fork.current_version, config.altair_fork_version);
    assert_eq!(cached.state.fork.epoch, 1);
    assert_eq!(
        cached.state.inactivity_scores.len() as u64,
        VALIDATOR_COUNT
    );
    assert_ne!(
        *cached.state.current_sync_committee,
        Default::default(),
        "sync committee should be sampled at the upgrade"
    );
    assert_eq!(cached.context.fork(), ForkName::Altair);

    cached.process_slots(64).unwrap();
    assert_eq!(
        cached.state.fork.current_version,
        config.bellatrix_fork_version
    );
    assert_eq!(
        cached.state.latest_execution_payload_header,
        ExecutionPayloadHeader::default()
    );
    assert_eq!(cached.context.fork(), ForkName::Bellatrix);
}

#[test]
fn attestation_in_the_window_sets_flags_and_pays_the_proposer() {
    let mut cached = genesis_state(ChainConfig::dev());
    cached.process_slots(2).unwrap();

    let data = AttestationData {
        slot: 1,
        index: 0,
        beacon_block_root: cached.state.get_block_root_at_slot(1).unwrap(),
        source: cached.state.current_justified_checkpoint,
        target: Checkpoint {
            epoch: 0,
            root: cached.state.get_block_root(0).unwrap(),
        },
    };
    let committee = cached.context.get_beacon_committee(1, 0).unwrap();
    let attester = committee[0];
    let mut aggregation_bits = BitList::<U2048>::with_capacity(committee.len()).unwrap();
    aggregation_bits.set(0, true).unwrap();

    let domain = cached
        .state
        .get_domain(DOMAIN_BEACON_ATTESTER, Some(data.target.epoch));
    let signature = private_key(attester)
        .sign(compute_signing_root(data.clone(), domain).as_ref())
        .unwrap();
    let attestation = Attestation {
        aggregation_bits,
        data,
        signature,
    };

    let proposer = cached.context.get_beacon_proposer(2).unwrap();
    let balance_before = cached.state.balances[proposer as usize];
    cached.process_attestation(&attestation).unwrap();

    // Inclusion delay 1 satisfies all three timeliness conditions
    let flags = cached.state.current_epoch_participation[attester as usize];
    assert!(has_flag(flags, TIMELY_SOURCE_FLAG_INDEX));
    assert!(has_flag(flags, TIMELY_TARGET_FLAG_INDEX));
    assert!(has_flag(flags, TIMELY_HEAD_FLAG_INDEX));

    let proposer_reward_denominator =
        (WEIGHT_DENOMINATOR - PROPOSER_WEIGHT) * WEIGHT_DENOMINATOR / PROPOSER_WEIGHT;
    let expected_reward = cached.get_base_reward(attester)
        * PARTICIPATION_FLAG_WEIGHTS.iter().sum::<u64>()
        / proposer_reward_denominator;
    assert!(expected_reward > 0);
    assert_eq!(
        cached.state.balances[proposer as usize] - balance_before,
        expected_reward
    );
}

#[test]
fn attestation_past_the_inclusion_window_is_rejected() {
    let mut cached = genesis_state(ChainConfig::dev());
    cached.process_slots(72).unwrap();

    // Inclusion delay 39, one epoch plus change after the attested slot
    let data = AttestationData {
        slot: 33,
        index: 0,
        beacon_block_root: cached.state.get_block_root_at_slot(33).unwrap(),
        source: cached.state.previous_justified_checkpoint,
        target: Checkpoint {
            epoch: 1,
            root: cached.state.get_block_root(1).unwrap(),
        },
    };
    let attestation = Attestation {
        aggregation_bits: BitList::<U2048>::with_capacity(1).unwrap(),
        data: data.clone(),
        signature: BlsSignature::infinity(),
    };
    assert!(cached.process_attestation(&attestation).is_err());

    // A matching target is not timely either once the delay exceeds an epoch
    let flag_indices = cached
        .get_attestation_participation_flag_indices(&data, 39)
        .unwrap();
    assert!(!flag_indices.contains(&TIMELY_TARGET_FLAG_INDEX));
}

#[test]
fn proportional_slashing_penalty_uses_per_validator_floor_division() {
    let mut cached = genesis_state(ChainConfig::dev());
    cached.state.validators[0].slashed = true;
    cached.state.validators[0].withdrawable_epoch = EPOCHS_PER_SLASHINGS_VECTOR / 2;
    cached.state.slashings[0] = 33_000_000_000;

    let epoch_process = before_process_epoch(&cached.state, &cached.context).unwrap();
    assert_eq!(epoch_process.indices_to_slash, vec![0]);
    cached.process_slashings(&epoch_process).unwrap();

    // 2048 ETH total stake, 99 ETH adjusted slashings at the x3 multiplier:
    // floor(32 * 99e9 / 2048e9) * 1e9 = 1 ETH
    assert_eq!(cached.state.balances[0], 31_000_000_000);
}

#[test]
fn block_processing_mixes_randao_and_stores_the_payload_header() {
    let mut cached = genesis_state(ChainConfig::dev());

    // Dry-run the slot advance on a clone to compute the fields the block must carry
    let mut lookahead = cached.clone();
    lookahead.process_slots(1).unwrap();
    let parent_root = lookahead.state.latest_block_header.tree_hash_root();
    let proposer_index = lookahead.context.get_beacon_proposer(1).unwrap();

    let randao_domain = lookahead.state.get_domain(DOMAIN_RANDAO, None);
    let randao_reveal = private_key(proposer_index)
        .sign(compute_signing_root(0u64, randao_domain).as_ref())
        .unwrap();

    let execution_payload = ExecutionPayload {
        prev_randao: lookahead.state.get_randao_mix(0),
        timestamp: lookahead.compute_timestamp_at_slot(1),
        block_hash: B256::repeat_byte(0x09),
        ..Default::default()
    };
    let block = BeaconBlock {
        slot: 1,
        proposer_index,
        parent_root,
        state_root: B256::ZERO,
        body: BeaconBlockBody {
            randao_reveal,
            eth1_data: cached.state.eth1_data.clone(),
            graffiti: B256::ZERO,
            proposer_slashings: Default::default(),
            attester_slashings: Default::default(),
            attestations: Default::default(),
            deposits: Default::default(),
            voluntary_exits: Default::default(),
            sync_aggregate: SyncAggregate::empty(),
            execution_payload,
        },
    };
    let signed_block = SignedBeaconBlock {
        message: block,
        signature: BlsSignature::infinity(),
    };

    let mix_before = cached.state.get_randao_mix(0);
    cached
        .state_transition(&signed_block, false, &NoopEngine)
        .unwrap();

    assert_eq!(cached.state.slot, 1);
    assert_eq!(cached.state.latest_block_header.slot, 1);
    assert_ne!(cached.state.get_randao_mix(0), mix_before);
    assert_eq!(
        cached.state.latest_execution_payload_header.block_hash,
        B256::repeat_byte(0x09)
    );
    assert_eq!(cached.state.eth1_data_votes.len(), 1);
}
