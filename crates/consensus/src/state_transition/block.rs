use std::cmp::max;

use alloy_primitives::B256;
use anyhow::{anyhow, ensure};
use ethereum_hashing::hash_fixed;
use pharos_bls::{
    AggregatePubKey, BlsSignature, PubKey,
    traits::{Aggregatable, Verifiable},
};
use pharos_merkle::is_valid_merkle_branch;
use tracing::warn;
use tree_hash::TreeHash;

use crate::{
    attestation::Attestation,
    attestation_data::AttestationData,
    attester_slashing::AttesterSlashing,
    beacon_block::BeaconBlock,
    beacon_block_body::BeaconBlockBody,
    cached_state::CachedBeaconState,
    constants::{
        DEPOSIT_CONTRACT_TREE_DEPTH, DOMAIN_BEACON_ATTESTER, DOMAIN_BEACON_PROPOSER,
        DOMAIN_DEPOSIT, DOMAIN_RANDAO, DOMAIN_SYNC_COMMITTEE, DOMAIN_VOLUNTARY_EXIT,
        EFFECTIVE_BALANCE_INCREMENT, EPOCHS_PER_ETH1_VOTING_PERIOD, EPOCHS_PER_HISTORICAL_VECTOR,
        FAR_FUTURE_EPOCH, MAX_DEPOSITS, MAX_EFFECTIVE_BALANCE, MIN_ATTESTATION_INCLUSION_DELAY,
        PARTICIPATION_FLAG_WEIGHTS, PROPOSER_WEIGHT, SHARD_COMMITTEE_PERIOD, SLOTS_PER_EPOCH,
        TIMELY_HEAD_FLAG_INDEX, TIMELY_SOURCE_FLAG_INDEX, TIMELY_TARGET_FLAG_INDEX,
        WEIGHT_DENOMINATOR,
    },
    deposit::Deposit,
    deposit_message::DepositMessage,
    execution_engine::ExecutionEngine,
    execution_payload_header::ExecutionPayloadHeader,
    fork_schedule::ForkName,
    indexed_attestation::IndexedAttestation,
    misc::{
        add_flag, compute_domain, compute_epoch_at_slot, compute_signing_root, has_flag,
        integer_squareroot, is_sorted_and_unique, xor,
    },
    proposer_slashing::ProposerSlashing,
    sync_aggregate::SyncAggregate,
    validator::Validator,
    voluntary_exit::SignedVoluntaryExit,
};

impl CachedBeaconState {
    pub fn process_block(
        &mut self,
        block: &BeaconBlock,
        execution_engine: &impl ExecutionEngine,
    ) -> anyhow::Result<()> {
        let fork = self.context.fork();

        self.process_block_header(block)?;
        if fork >= ForkName::Bellatrix {
            self.process_execution_payload(&block.body, execution_engine)?;
        }
        self.process_randao(&block.body)?;
        self.process_eth1_data(&block.body)?;
        self.process_operations(&block.body)?;
        if fork >= ForkName::Altair {
            self.process_sync_aggregate(&block.body.sync_aggregate)?;
        }

        Ok(())
    }

    pub fn process_block_header(&mut self, block: &BeaconBlock) -> anyhow::Result<()> {
        // Verify that the slots match
        ensure!(
            block.slot == self.state.slot,
            "Block slot {} does not match state slot {}",
            block.slot,
            self.state.slot
        );

        // Verify that the block is newer than latest block header
        ensure!(
            block.slot > self.state.latest_block_header.slot,
            "Block is not newer than latest block header"
        );

        // Verify that proposer index is the correct index
        let expected_proposer = self.context.get_beacon_proposer(block.slot)?;
        ensure!(
            block.proposer_index == expected_proposer,
            "Block proposer index {} does not match the schedule ({expected_proposer})",
            block.proposer_index
        );

        // Verify that the parent matches
        ensure!(
            block.parent_root == self.state.latest_block_header.tree_hash_root(),
            "Block parent root does not match latest block header root"
        );

        // Cache current block as the new latest block; the state root is filled in at the next
        // process_slot
        self.state.latest_block_header = block.block_header();
        self.state.latest_block_header.state_root = B256::default();

        // Verify proposer is not slashed
        let proposer = self
            .state
            .validators
            .get(block.proposer_index as usize)
            .ok_or_else(|| anyhow!("Invalid proposer index"))?;
        ensure!(!proposer.slashed, "Block proposer is slashed");

        Ok(())
    }

    pub fn process_execution_payload(
        &mut self,
        body: &BeaconBlockBody,
        execution_engine: &impl ExecutionEngine,
    ) -> anyhow::Result<()> {
        let payload = &body.execution_payload;

        // Verify consistency of the parent hash with respect to the previous execution payload
        // header. Before the first payload lands the stored header is all-default and the chain
        // of hashes has no anchor yet.
        if self.state.latest_execution_payload_header != ExecutionPayloadHeader::default() {
            ensure!(
                payload.parent_hash == self.state.latest_execution_payload_header.block_hash,
                "Execution payload parent hash mismatch"
            );
        }
        // Verify prev_randao
        ensure!(
            payload.prev_randao == self.state.get_randao_mix(self.state.get_current_epoch()),
            "Execution payload prev_randao mismatch"
        );
        // Verify timestamp
        ensure!(
            payload.timestamp == self.compute_timestamp_at_slot(self.state.slot),
            "Execution payload timestamp mismatch"
        );

        // Verify the execution payload is valid
        ensure!(
            execution_engine.notify_new_payload(payload)?,
            "Execution payload rejected by the execution engine"
        );

        // Cache execution payload header
        self.state.latest_execution_payload_header = payload.to_execution_payload_header();

        Ok(())
    }

    pub fn process_randao(&mut self, body: &BeaconBlockBody) -> anyhow::Result<()> {
        let epoch = self.state.get_current_epoch();

        // Verify RANDAO reveal
        let proposer_index = self.context.get_beacon_proposer(self.state.slot)?;
        let proposer = &self.state.validators[proposer_index as usize];
        let signing_root =
            compute_signing_root(epoch, self.state.get_domain(DOMAIN_RANDAO, None));
        ensure!(
            body.randao_reveal
                .verify(&proposer.pubkey, signing_root.as_ref())
                .map_err(|err| anyhow!("Invalid randao reveal: {err:?}"))?,
            "Randao reveal verification failed"
        );

        // Mix in RANDAO reveal
        let mix = xor(
            &self.state.get_randao_mix(epoch),
            &B256::from(hash_fixed(body.randao_reveal.to_bytes())),
        );
        self.state.randao_mixes[(epoch % EPOCHS_PER_HISTORICAL_VECTOR) as usize] = mix;

        Ok(())
    }

    pub fn process_eth1_data(&mut self, body: &BeaconBlockBody) -> anyhow::Result<()> {
        self.state
            .eth1_data_votes
            .push(body.eth1_data.clone())
            .map_err(|err| anyhow!("Eth1 data votes list is full: {err:?}"))?;

        let vote_count = self
            .state
            .eth1_data_votes
            .iter()
            .filter(|vote| **vote == body.eth1_data)
            .count() as u64;
        if vote_count * 2 > EPOCHS_PER_ETH1_VOTING_PERIOD * SLOTS_PER_EPOCH {
            self.state.eth1_data = body.eth1_data.clone();
        }

        Ok(())
    }

    pub fn process_operations(&mut self, body: &BeaconBlockBody) -> anyhow::Result<()> {
        // Verify that outstanding deposits are processed up to the maximum number of deposits
        let outstanding = self
            .state
            .eth1_data
            .deposit_count
            .saturating_sub(self.state.eth1_deposit_index);
        ensure!(
            body.deposits.len() as u64 == MAX_DEPOSITS.min(outstanding),
            "Block carries {} deposits, expected {}",
            body.deposits.len(),
            MAX_DEPOSITS.min(outstanding)
        );

        for proposer_slashing in body.proposer_slashings.iter() {
            self.process_proposer_slashing(proposer_slashing)?;
        }
        for attester_slashing in body.attester_slashings.iter() {
            self.process_attester_slashing(attester_slashing)?;
        }
        for attestation in body.attestations.iter() {
            self.process_attestation(attestation)?;
        }
        for deposit in body.deposits.iter() {
            self.process_deposit(deposit)?;
        }
        for voluntary_exit in body.voluntary_exits.iter() {
            self.process_voluntary_exit(voluntary_exit)?;
        }

        Ok(())
    }

    pub fn process_proposer_slashing(
        &mut self,
        proposer_slashing: &ProposerSlashing,
    ) -> anyhow::Result<()> {
        let header_1 = &proposer_slashing.signed_header_1.message;
        let header_2 = &proposer_slashing.signed_header_2.message;

        // Verify header slots match
        ensure!(header_1.slot == header_2.slot, "Header slots must match");

        // Verify header proposer indices match
        ensure!(
            header_1.proposer_index == header_2.proposer_index,
            "Proposer indices must match"
        );

        // Verify the headers are different
        ensure!(header_1 != header_2, "Headers must be different");

        // Get the proposer and verify they are slashable
        let proposer_index = header_1.proposer_index;
        let proposer = self
            .state
            .validators
            .get(proposer_index as usize)
            .ok_or_else(|| anyhow!("Invalid proposer index"))?;
        ensure!(
            proposer.is_slashable_validator(self.state.get_current_epoch()),
            "Proposer is not slashable"
        );

        // Verify signatures
        for signed_header in [
            &proposer_slashing.signed_header_1,
            &proposer_slashing.signed_header_2,
        ] {
            let domain = self.state.get_domain(
                DOMAIN_BEACON_PROPOSER,
                Some(compute_epoch_at_slot(signed_header.message.slot)),
            );
            let signing_root = compute_signing_root(&signed_header.message, domain);
            ensure!(
                signed_header
                    .signature
                    .verify(&proposer.pubkey, signing_root.as_ref())
                    .map_err(|err| anyhow!("Invalid header signature: {err:?}"))?,
                "Header signature verification failed"
            );
        }

        self.slash_validator(proposer_index, None)
    }

    pub fn process_attester_slashing(
        &mut self,
        attester_slashing: &AttesterSlashing,
    ) -> anyhow::Result<()> {
        let attestation_1 = &attester_slashing.attestation_1;
        let attestation_2 = &attester_slashing.attestation_2;

        ensure!(
            is_slashable_attestation_data(&attestation_1.data, &attestation_2.data),
            "Attestations are not slashable"
        );
        ensure!(
            self.is_valid_indexed_attestation(attestation_1)?,
            "First attestation is invalid"
        );
        ensure!(
            self.is_valid_indexed_attestation(attestation_2)?,
            "Second attestation is invalid"
        );

        let current_epoch = self.state.get_current_epoch();
        let mut intersection = attestation_1
            .attesting_indices
            .iter()
            .filter(|index| attestation_2.attesting_indices.contains(index))
            .copied()
            .collect::<Vec<_>>();
        intersection.sort_unstable();
        intersection.dedup();

        let mut slashed_any = false;
        for index in intersection {
            let validator = self
                .state
                .validators
                .get(index as usize)
                .ok_or_else(|| anyhow!("Invalid attesting index {index}"))?;
            if validator.is_slashable_validator(current_epoch) {
                self.slash_validator(index, None)?;
                slashed_any = true;
            }
        }

        ensure!(slashed_any, "No validator was slashed");
        Ok(())
    }

    /// Check if ``indexed_attestation`` is not empty, has sorted and unique indices and has a
    /// valid aggregate signature.
    pub fn is_valid_indexed_attestation(
        &self,
        indexed_attestation: &IndexedAttestation,
    ) -> anyhow::Result<bool> {
        let indices = indexed_attestation
            .attesting_indices
            .iter()
            .map(|&index| index as usize)
            .collect::<Vec<_>>();
        if indices.is_empty() || !is_sorted_and_unique(&indices) {
            return Ok(false);
        }

        let pubkeys = indices
            .iter()
            .map(|&index| {
                self.state
                    .validators
                    .get(index)
                    .map(|validator| &validator.pubkey)
                    .ok_or_else(|| anyhow!("Invalid attesting index {index}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let domain = self.state.get_domain(
            DOMAIN_BEACON_ATTESTER,
            Some(indexed_attestation.data.target.epoch),
        );
        let signing_root = compute_signing_root(indexed_attestation.data.clone(), domain);
        indexed_attestation
            .signature
            .fast_aggregate_verify(pubkeys, signing_root.as_ref())
            .map_err(|err| anyhow!("Invalid aggregate signature: {err:?}"))
    }

    /// Return the flag indices that are satisfied by an attestation.
    pub fn get_attestation_participation_flag_indices(
        &self,
        data: &AttestationData,
        inclusion_delay: u64,
    ) -> anyhow::Result<Vec<u8>> {
        let justified_checkpoint = if data.target.epoch == self.state.get_current_epoch() {
            self.state.current_justified_checkpoint
        } else {
            self.state.previous_justified_checkpoint
        };
        let is_matching_source = data.source == justified_checkpoint;
        let is_matching_target = is_matching_source
            && data.target.root == self.state.get_block_root(data.target.epoch)?;
        let is_matching_head = is_matching_target
            && data.beacon_block_root == self.state.get_block_root_at_slot(data.slot)?;
        ensure!(
            is_matching_source,
            "Attestation source does not match the justified checkpoint"
        );

        let mut participation_flag_indices = vec![];
        if is_matching_source && inclusion_delay <= integer_squareroot(SLOTS_PER_EPOCH) {
            participation_flag_indices.push(TIMELY_SOURCE_FLAG_INDEX);
        }
        if is_matching_target && inclusion_delay <= SLOTS_PER_EPOCH {
            participation_flag_indices.push(TIMELY_TARGET_FLAG_INDEX);
        }
        if is_matching_head && inclusion_delay == MIN_ATTESTATION_INCLUSION_DELAY {
            participation_flag_indices.push(TIMELY_HEAD_FLAG_INDEX);
        }

        Ok(participation_flag_indices)
    }

    pub fn process_attestation(&mut self, attestation: &Attestation) -> anyhow::Result<()> {
        let data = &attestation.data;
        let current_epoch = self.state.get_current_epoch();
        let previous_epoch = self.state.get_previous_epoch();

        ensure!(
            data.target.epoch == previous_epoch || data.target.epoch == current_epoch,
            "Attestation target epoch is neither previous nor current"
        );
        ensure!(
            data.target.epoch == compute_epoch_at_slot(data.slot),
            "Attestation target epoch does not match its slot"
        );
        ensure!(
            data.slot + MIN_ATTESTATION_INCLUSION_DELAY <= self.state.slot,
            "Attestation included before the minimum inclusion delay"
        );
        ensure!(
            self.state.slot <= data.slot + SLOTS_PER_EPOCH,
            "Attestation included after the one-epoch inclusion window"
        );
        ensure!(
            data.index < self.context.get_committee_count_per_slot(data.target.epoch)?,
            "Attestation committee index out of range"
        );

        let inclusion_delay = self.state.slot - data.slot;
        let participation_flag_indices =
            self.get_attestation_participation_flag_indices(data, inclusion_delay)?;

        // Verify signature
        let indexed_attestation = self.context.get_indexed_attestation(attestation)?;
        ensure!(
            self.is_valid_indexed_attestation(&indexed_attestation)?,
            "Attestation signature is invalid"
        );

        // Update epoch participation flags, crediting the proposer for every newly set flag
        let is_current_target = data.target.epoch == current_epoch;
        let mut proposer_reward_numerator = 0u64;
        for &index in indexed_attestation.attesting_indices.iter() {
            let base_reward = self.get_base_reward(index);
            let participation = if is_current_target {
                &mut self.state.current_epoch_participation
            } else {
                &mut self.state.previous_epoch_participation
            };
            let flags = participation
                .get_mut(index as usize)
                .ok_or_else(|| anyhow!("Participation index {index} out of bounds"))?;
            for (flag_index, &weight) in PARTICIPATION_FLAG_WEIGHTS.iter().enumerate() {
                if participation_flag_indices.contains(&(flag_index as u8))
                    && !has_flag(*flags, flag_index as u8)
                {
                    *flags = add_flag(*flags, flag_index as u8);
                    proposer_reward_numerator += base_reward * weight;
                }
            }
        }

        // Reward proposer
        let proposer_reward_denominator =
            (WEIGHT_DENOMINATOR - PROPOSER_WEIGHT) * WEIGHT_DENOMINATOR / PROPOSER_WEIGHT;
        let proposer_reward = proposer_reward_numerator / proposer_reward_denominator;
        let proposer_index = self.context.get_beacon_proposer(self.state.slot)?;
        self.state.increase_balance(proposer_index, proposer_reward)
    }

    pub fn process_deposit(&mut self, deposit: &Deposit) -> anyhow::Result<()> {
        // Verify the Merkle branch
        ensure!(
            is_valid_merkle_branch(
                deposit.data.tree_hash_root(),
                &deposit.proof,
                // Add 1 for the List length mix-in
                DEPOSIT_CONTRACT_TREE_DEPTH + 1,
                self.state.eth1_deposit_index,
                self.state.eth1_data.deposit_root,
            ),
            "Deposit merkle proof is invalid"
        );

        // Deposits must be processed in order
        self.state.eth1_deposit_index += 1;

        self.apply_deposit(
            deposit.data.pubkey.clone(),
            deposit.data.withdrawal_credentials,
            deposit.data.amount,
            deposit.data.signature.clone(),
        )
    }

    pub fn apply_deposit(
        &mut self,
        pubkey: PubKey,
        withdrawal_credentials: B256,
        amount: u64,
        signature: BlsSignature,
    ) -> anyhow::Result<()> {
        if let Some(index) = self.context.pubkey_cache.get_index(&pubkey) {
            return self.state.increase_balance(index, amount);
        }

        // Verify the deposit signature (proof of possession) which is not checked by the deposit
        // contract. An invalid signature burns the deposit: the index already advanced, the
        // registry is untouched.
        match is_valid_deposit_signature(&pubkey, withdrawal_credentials, amount, &signature) {
            Ok(true) => {}
            _ => {
                warn!(?pubkey, "skipping deposit with invalid signature");
                return Ok(());
            }
        }

        let validator = get_validator_from_deposit(pubkey, withdrawal_credentials, amount);
        self.append_validator(validator, amount)
    }

    pub fn process_voluntary_exit(
        &mut self,
        signed_voluntary_exit: &SignedVoluntaryExit,
    ) -> anyhow::Result<()> {
        let voluntary_exit = &signed_voluntary_exit.message;
        let current_epoch = self.state.get_current_epoch();

        let validator = self
            .state
            .validators
            .get(voluntary_exit.validator_index as usize)
            .ok_or_else(|| anyhow!("Invalid validator index"))?;

        // Verify the validator is active
        ensure!(
            validator.is_active_validator(current_epoch),
            "Validator is not active"
        );

        // Verify exit has not been initiated
        ensure!(
            validator.exit_epoch == FAR_FUTURE_EPOCH,
            "Exit has already been initiated"
        );

        // Exits must specify an epoch when they become valid; they are not valid before then
        ensure!(
            current_epoch >= voluntary_exit.epoch,
            "Exit is not yet valid"
        );

        // Verify the validator has been active long enough
        ensure!(
            current_epoch >= validator.activation_epoch + SHARD_COMMITTEE_PERIOD,
            "Validator has not been active long enough"
        );

        // Verify signature
        let domain = self
            .state
            .get_domain(DOMAIN_VOLUNTARY_EXIT, Some(voluntary_exit.epoch));
        let signing_root = compute_signing_root(voluntary_exit, domain);
        ensure!(
            signed_voluntary_exit
                .signature
                .verify(&validator.pubkey, signing_root.as_ref())
                .map_err(|err| anyhow!("Invalid exit signature: {err:?}"))?,
            "Exit signature verification failed"
        );

        // Initiate exit
        self.initiate_validator_exit(voluntary_exit.validator_index)
    }

    pub fn process_sync_aggregate(
        &mut self,
        sync_aggregate: &SyncAggregate,
    ) -> anyhow::Result<()> {
        let committee_indices = self.context.current_sync_committee_indices.clone();
        ensure!(
            sync_aggregate.sync_committee_bits.len() == committee_indices.len(),
            "Sync committee bits length mismatch"
        );

        // Verify sync committee aggregate signature signing over the previous slot block root
        let mut participant_pubkeys = vec![];
        for (position, &index) in committee_indices.iter().enumerate() {
            if sync_aggregate
                .sync_committee_bits
                .get(position)
                .map_err(|err| anyhow!("Invalid sync committee bit: {err:?}"))?
            {
                participant_pubkeys.push(&self.state.validators[index as usize].pubkey);
            }
        }
        let previous_slot = max(self.state.slot, 1) - 1;
        let domain = self.state.get_domain(
            DOMAIN_SYNC_COMMITTEE,
            Some(compute_epoch_at_slot(previous_slot)),
        );
        let signing_root = compute_signing_root(
            self.state.get_block_root_at_slot(previous_slot)?,
            domain,
        );
        ensure!(
            eth_fast_aggregate_verify(
                &participant_pubkeys,
                signing_root,
                &sync_aggregate.sync_committee_signature,
            )?,
            "Sync aggregate signature verification failed"
        );

        // Apply participant and proposer rewards
        let participant_reward = self.context.sync_participant_reward;
        let proposer_reward = self.context.sync_proposer_reward;
        let proposer_index = self.context.get_beacon_proposer(self.state.slot)?;
        let mut total_proposer_reward = 0u64;
        for (position, &participant_index) in committee_indices.iter().enumerate() {
            if sync_aggregate
                .sync_committee_bits
                .get(position)
                .map_err(|err| anyhow!("Invalid sync committee bit: {err:?}"))?
            {
                self.state
                    .increase_balance(participant_index, participant_reward)?;
                total_proposer_reward += proposer_reward;
            } else {
                self.state
                    .decrease_balance(participant_index, participant_reward)?;
            }
        }
        self.state
            .increase_balance(proposer_index, total_proposer_reward)
    }
}

/// Check if ``data_1`` and ``data_2`` are slashable according to Casper FFG rules.
pub fn is_slashable_attestation_data(data_1: &AttestationData, data_2: &AttestationData) -> bool {
    // Double vote
    (data_1 != data_2 && data_1.target.epoch == data_2.target.epoch)
        // Surround vote
        || (data_1.source.epoch < data_2.source.epoch
            && data_2.target.epoch < data_1.target.epoch)
}

pub fn get_validator_from_deposit(
    pubkey: PubKey,
    withdrawal_credentials: B256,
    amount: u64,
) -> Validator {
    Validator {
        pubkey,
        withdrawal_credentials,
        effective_balance: (amount - amount % EFFECTIVE_BALANCE_INCREMENT)
            .min(MAX_EFFECTIVE_BALANCE),
        slashed: false,
        activation_eligibility_epoch: FAR_FUTURE_EPOCH,
        activation_epoch: FAR_FUTURE_EPOCH,
        exit_epoch: FAR_FUTURE_EPOCH,
        withdrawable_epoch: FAR_FUTURE_EPOCH,
    }
}

pub fn is_valid_deposit_signature(
    pubkey: &PubKey,
    withdrawal_credentials: B256,
    amount: u64,
    signature: &BlsSignature,
) -> anyhow::Result<bool> {
    let deposit_message = DepositMessage {
        pubkey: pubkey.clone(),
        withdrawal_credentials,
        amount,
    };
    // Fork-agnostic domain since deposits are valid across forks
    let domain = compute_domain(DOMAIN_DEPOSIT, None, None);
    let signing_root = compute_signing_root(deposit_message, domain);

    signature
        .verify(pubkey, signing_root.as_ref())
        .map_err(|err| anyhow!("Invalid deposit signature: {err:?}"))
}

/// Wrapper to ``bls.FastAggregateVerify`` accepting the ``G2_POINT_AT_INFINITY`` signature when
/// ``pubkeys`` is empty.
pub fn eth_fast_aggregate_verify(
    pubkeys: &[&PubKey],
    message: B256,
    signature: &BlsSignature,
) -> anyhow::Result<bool> {
    if pubkeys.is_empty() && *signature == BlsSignature::infinity() {
        return Ok(true);
    }

    signature
        .fast_aggregate_verify(pubkeys, message.as_ref())
        .map_err(|err| anyhow!("Failed to verify fast aggregate: {err:?}"))
}

/// Return the aggregate public key for the public keys in ``pubkeys``.
pub fn eth_aggregate_pubkeys(pubkeys: &[&PubKey]) -> anyhow::Result<PubKey> {
    ensure!(!pubkeys.is_empty(), "Public keys list cannot be empty");
    let aggregate_pubkey = AggregatePubKey::aggregate(pubkeys)?;
    Ok(aggregate_pubkey.to_pubkey())
}
