//! Flat collection of every signature a block carries, so callers can verify them in one batch
//! pass (gossip validation, backfill) instead of interleaved with state mutation.

use std::cmp::max;

use alloy_primitives::B256;
use anyhow::anyhow;
use pharos_bls::{BlsSignature, PubKey, traits::Verifiable};

use crate::{
    beacon_block::SignedBeaconBlock,
    cached_state::CachedBeaconState,
    constants::{
        DOMAIN_BEACON_ATTESTER, DOMAIN_BEACON_PROPOSER, DOMAIN_RANDAO, DOMAIN_SYNC_COMMITTEE,
        DOMAIN_VOLUNTARY_EXIT,
    },
    fork_schedule::ForkName,
    indexed_attestation::IndexedAttestation,
    misc::{compute_epoch_at_slot, compute_signing_root},
};

/// One aggregate-verifiable unit: ``signature`` must be valid for ``signing_root`` under the
/// aggregate of ``pubkeys`` (a single pubkey for non-aggregate messages).
#[derive(Debug, Clone)]
pub struct SignatureSet {
    pub pubkeys: Vec<PubKey>,
    pub signing_root: B256,
    pub signature: BlsSignature,
}

impl CachedBeaconState {
    /// Collects the proposer, randao, slashing, attestation, exit, and sync-aggregate signatures
    /// of ``signed_block`` against this (pre-block, post-slot) state.
    pub fn block_signature_sets(
        &self,
        signed_block: &SignedBeaconBlock,
    ) -> anyhow::Result<Vec<SignatureSet>> {
        let block = &signed_block.message;
        let body = &block.body;
        let mut sets = vec![];

        let proposer = self
            .state
            .validators
            .get(block.proposer_index as usize)
            .ok_or_else(|| anyhow!("Invalid proposer index"))?;

        // Block proposal
        sets.push(SignatureSet {
            pubkeys: vec![proposer.pubkey.clone()],
            signing_root: compute_signing_root(
                block.clone(),
                self.state.get_domain(DOMAIN_BEACON_PROPOSER, None),
            ),
            signature: signed_block.signature.clone(),
        });

        // Randao reveal
        sets.push(SignatureSet {
            pubkeys: vec![proposer.pubkey.clone()],
            signing_root: compute_signing_root(
                self.state.get_current_epoch(),
                self.state.get_domain(DOMAIN_RANDAO, None),
            ),
            signature: body.randao_reveal.clone(),
        });

        // Proposer slashings: both headers
        for proposer_slashing in body.proposer_slashings.iter() {
            let slashed = self
                .state
                .validators
                .get(proposer_slashing.signed_header_1.message.proposer_index as usize)
                .ok_or_else(|| anyhow!("Invalid proposer index in slashing"))?;
            for signed_header in [
                &proposer_slashing.signed_header_1,
                &proposer_slashing.signed_header_2,
            ] {
                sets.push(SignatureSet {
                    pubkeys: vec![slashed.pubkey.clone()],
                    signing_root: compute_signing_root(
                        &signed_header.message,
                        self.state.get_domain(
                            DOMAIN_BEACON_PROPOSER,
                            Some(compute_epoch_at_slot(signed_header.message.slot)),
                        ),
                    ),
                    signature: signed_header.signature.clone(),
                });
            }
        }

        // Attester slashings: both indexed attestations
        for attester_slashing in body.attester_slashings.iter() {
            for indexed_attestation in [
                &attester_slashing.attestation_1,
                &attester_slashing.attestation_2,
            ] {
                sets.push(self.indexed_attestation_signature_set(indexed_attestation)?);
            }
        }

        // Attestations
        for attestation in body.attestations.iter() {
            let indexed_attestation = self.context.get_indexed_attestation(attestation)?;
            sets.push(self.indexed_attestation_signature_set(&indexed_attestation)?);
        }

        // Voluntary exits
        for signed_voluntary_exit in body.voluntary_exits.iter() {
            let voluntary_exit = &signed_voluntary_exit.message;
            let validator = self
                .state
                .validators
                .get(voluntary_exit.validator_index as usize)
                .ok_or_else(|| anyhow!("Invalid validator index in exit"))?;
            sets.push(SignatureSet {
                pubkeys: vec![validator.pubkey.clone()],
                signing_root: compute_signing_root(
                    voluntary_exit,
                    self.state
                        .get_domain(DOMAIN_VOLUNTARY_EXIT, Some(voluntary_exit.epoch)),
                ),
                signature: signed_voluntary_exit.signature.clone(),
            });
        }

        // Sync aggregate; an empty participant set with the infinity signature carries nothing
        // worth batching
        if self.context.fork() >= ForkName::Altair {
            let sync_aggregate = &body.sync_aggregate;
            let mut pubkeys = vec![];
            for (position, &index) in
                self.context.current_sync_committee_indices.iter().enumerate()
            {
                if sync_aggregate
                    .sync_committee_bits
                    .get(position)
                    .map_err(|err| anyhow!("Invalid sync committee bit: {err:?}"))?
                {
                    pubkeys.push(self.state.validators[index as usize].pubkey.clone());
                }
            }
            if !pubkeys.is_empty()
                || sync_aggregate.sync_committee_signature != BlsSignature::infinity()
            {
                let previous_slot = max(self.state.slot, 1) - 1;
                sets.push(SignatureSet {
                    pubkeys,
                    signing_root: compute_signing_root(
                        self.state.get_block_root_at_slot(previous_slot)?,
                        self.state.get_domain(
                            DOMAIN_SYNC_COMMITTEE,
                            Some(compute_epoch_at_slot(previous_slot)),
                        ),
                    ),
                    signature: sync_aggregate.sync_committee_signature.clone(),
                });
            }
        }

        Ok(sets)
    }

    fn indexed_attestation_signature_set(
        &self,
        indexed_attestation: &IndexedAttestation,
    ) -> anyhow::Result<SignatureSet> {
        let pubkeys = indexed_attestation
            .attesting_indices
            .iter()
            .map(|&index| {
                self.state
                    .validators
                    .get(index as usize)
                    .map(|validator| validator.pubkey.clone())
                    .ok_or_else(|| anyhow!("Invalid attesting index {index}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let domain = self.state.get_domain(
            DOMAIN_BEACON_ATTESTER,
            Some(indexed_attestation.data.target.epoch),
        );

        Ok(SignatureSet {
            pubkeys,
            signing_root: compute_signing_root(indexed_attestation.data.clone(), domain),
            signature: indexed_attestation.signature.clone(),
        })
    }
}

/// Verifies every set, short-circuiting on the first failure. An empty pubkey set only verifies
/// against the infinity signature.
pub fn verify_signature_sets(sets: &[SignatureSet]) -> anyhow::Result<bool> {
    for set in sets {
        let valid = match set.pubkeys.as_slice() {
            [] => set.signature == BlsSignature::infinity(),
            [pubkey] => set
                .signature
                .verify(pubkey, set.signing_root.as_ref())
                .map_err(|err| anyhow!("Signature verification failed: {err:?}"))?,
            pubkeys => {
                let refs = pubkeys.iter().collect::<Vec<_>>();
                set.signature
                    .fast_aggregate_verify(refs, set.signing_root.as_ref())
                    .map_err(|err| anyhow!("Aggregate verification failed: {err:?}"))?
            }
        };
        if !valid {
            return Ok(false);
        }
    }

    Ok(true)
}
