pub mod block;
pub mod epoch;
pub mod signature_sets;

use alloy_primitives::B256;
use anyhow::{anyhow, ensure};
use pharos_bls::traits::Verifiable;
use tracing::debug;
use tree_hash::TreeHash;

use crate::{
    beacon_block::SignedBeaconBlock,
    cached_state::CachedBeaconState,
    constants::{
        DOMAIN_BEACON_PROPOSER, GENESIS_SLOT, SECONDS_PER_SLOT, SLOTS_PER_EPOCH,
        SLOTS_PER_HISTORICAL_ROOT,
    },
    epoch_process::before_process_epoch,
    execution_engine::ExecutionEngine,
    fork::Fork,
    fork_schedule::ForkName,
    misc::compute_signing_root,
};

impl CachedBeaconState {
    /// Applies ``signed_block`` on top of this state, advancing through any empty slots first.
    /// With ``validate_result`` the proposer signature and the block's state root are checked;
    /// a syncing node replaying finalized blocks passes ``false``.
    pub fn state_transition(
        &mut self,
        signed_block: &SignedBeaconBlock,
        validate_result: bool,
        execution_engine: &impl ExecutionEngine,
    ) -> anyhow::Result<()> {
        let block = &signed_block.message;

        // Process slots (including those with no blocks) since block
        self.process_slots(block.slot)?;

        // Verify signature
        if validate_result {
            ensure!(
                self.verify_block_signature(signed_block)?,
                "Invalid block signature"
            );
        }

        // Process block
        self.process_block(block, execution_engine)?;

        // Verify state root
        if validate_result {
            ensure!(
                block.state_root == self.state.tree_hash_root(),
                "Block state root does not match the post-state root"
            );
        }

        Ok(())
    }

    pub fn process_slots(&mut self, slot: u64) -> anyhow::Result<()> {
        ensure!(
            self.state.slot < slot,
            "Requested slot {slot} is not beyond the state slot {}",
            self.state.slot
        );

        while self.state.slot < slot {
            self.process_slot()?;
            // Process epoch on the start slot of the next epoch
            if (self.state.slot + 1) % SLOTS_PER_EPOCH == 0 {
                self.context.before_epoch_transition();
                let mut epoch_process = before_process_epoch(&self.state, &self.context)?;
                self.process_epoch(&mut epoch_process)?;
                self.context
                    .after_process_epoch(&self.state, &epoch_process)?;
                debug!(
                    epoch = self.context.epoch,
                    fork = %self.context.fork(),
                    "epoch transition complete"
                );
            }
            self.state.slot += 1;
            if self.state.slot % SLOTS_PER_EPOCH == 0 {
                self.process_fork_upgrades()?;
            }
        }

        Ok(())
    }

    pub fn process_slot(&mut self) -> anyhow::Result<()> {
        // Cache state root
        let previous_state_root = self.state.tree_hash_root();
        self.state.state_roots[(self.state.slot % SLOTS_PER_HISTORICAL_ROOT) as usize] =
            previous_state_root;
        // Cache latest block header state root
        if self.state.latest_block_header.state_root == B256::default() {
            self.state.latest_block_header.state_root = previous_state_root;
        }
        // Cache block root
        let previous_block_root = self.state.latest_block_header.tree_hash_root();
        self.state.block_roots[(self.state.slot % SLOTS_PER_HISTORICAL_ROOT) as usize] =
            previous_block_root;

        Ok(())
    }

    pub fn verify_block_signature(
        &self,
        signed_block: &SignedBeaconBlock,
    ) -> anyhow::Result<bool> {
        let proposer = self
            .state
            .validators
            .get(signed_block.message.proposer_index as usize)
            .ok_or_else(|| anyhow!("Invalid proposer index"))?;
        let signing_root = compute_signing_root(
            signed_block.message.clone(),
            self.state.get_domain(DOMAIN_BEACON_PROPOSER, None),
        );

        signed_block
            .signature
            .verify(&proposer.pubkey, signing_root.as_ref())
            .map_err(|err| anyhow!("Invalid block signature: {err:?}"))
    }

    pub fn compute_timestamp_at_slot(&self, slot: u64) -> u64 {
        let slots_since_genesis = slot - GENESIS_SLOT;
        self.state.genesis_time + slots_since_genesis * SECONDS_PER_SLOT
    }

    /// Runs the scheduled upgrades whose fork epoch equals the freshly entered epoch. Called
    /// right after the slot counter crosses an epoch boundary.
    fn process_fork_upgrades(&mut self) -> anyhow::Result<()> {
        let epoch = self.state.get_current_epoch();
        let config = self.context.config;
        if epoch == config.altair_fork_epoch
            && self.state.fork.current_version != config.altair_fork_version
        {
            self.upgrade_to_altair()?;
        }
        if epoch == config.bellatrix_fork_epoch
            && self.state.fork.current_version != config.bellatrix_fork_version
        {
            self.upgrade_to_bellatrix()?;
        }
        Ok(())
    }

    fn upgrade_to_altair(&mut self) -> anyhow::Result<()> {
        let epoch = self.state.get_current_epoch();
        let config = self.context.config;
        self.state.fork = Fork {
            previous_version: self.state.fork.current_version,
            current_version: config.altair_fork_version,
            epoch,
        };

        let validator_count = self.state.validators.len();
        self.state.previous_epoch_participation = vec![0u8; validator_count].into();
        self.state.current_epoch_participation = vec![0u8; validator_count].into();
        self.state.inactivity_scores = vec![0u64; validator_count].into();

        // Both committees start from the upgrade-epoch sample; the regular rotation takes over
        // at the next sync period boundary.
        let sync_committee = std::sync::Arc::new(self.state.get_next_sync_committee()?);
        self.state.current_sync_committee = sync_committee.clone();
        self.state.next_sync_committee = sync_committee;
        self.context.reload_sync_committees(&self.state)?;

        debug!(epoch, fork = %ForkName::Altair, "fork upgrade applied");
        Ok(())
    }

    fn upgrade_to_bellatrix(&mut self) -> anyhow::Result<()> {
        let epoch = self.state.get_current_epoch();
        let config = self.context.config;
        self.state.fork = Fork {
            previous_version: self.state.fork.current_version,
            current_version: config.bellatrix_fork_version,
            epoch,
        };
        self.state.latest_execution_payload_header = Default::default();

        debug!(epoch, fork = %ForkName::Bellatrix, "fork upgrade applied");
        Ok(())
    }
}
