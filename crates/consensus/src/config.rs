use alloy_primitives::{aliases::B32, fixed_bytes};

use crate::{constants::GENESIS_FORK_VERSION, fork_schedule::ForkName};

/// Fork schedule and genesis parameters for a chain. Carried by value inside the epoch cache so
/// the transition function never reads global state.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ChainConfig {
    pub genesis_fork_version: B32,
    pub altair_fork_version: B32,
    pub altair_fork_epoch: u64,
    pub bellatrix_fork_version: B32,
    pub bellatrix_fork_epoch: u64,

    pub min_genesis_active_validator_count: u64,
    pub min_genesis_time: u64,
    pub genesis_delay: u64,
}

impl ChainConfig {
    pub fn mainnet() -> Self {
        Self {
            genesis_fork_version: GENESIS_FORK_VERSION,
            altair_fork_version: fixed_bytes!("0x01000000"),
            altair_fork_epoch: 74240,
            bellatrix_fork_version: fixed_bytes!("0x02000000"),
            bellatrix_fork_epoch: 144896,
            min_genesis_active_validator_count: 16384,
            min_genesis_time: 1606824000,
            genesis_delay: 604800,
        }
    }

    /// All forks active from genesis; small genesis floor. Used by tests and local devnets.
    pub fn dev() -> Self {
        Self {
            genesis_fork_version: GENESIS_FORK_VERSION,
            altair_fork_version: fixed_bytes!("0x01000000"),
            altair_fork_epoch: 0,
            bellatrix_fork_version: fixed_bytes!("0x02000000"),
            bellatrix_fork_epoch: 0,
            min_genesis_active_validator_count: 64,
            min_genesis_time: 0,
            genesis_delay: 0,
        }
    }

    /// The fork in effect at ``epoch``.
    pub fn fork_at_epoch(&self, epoch: u64) -> ForkName {
        if epoch >= self.bellatrix_fork_epoch {
            ForkName::Bellatrix
        } else if epoch >= self.altair_fork_epoch {
            ForkName::Altair
        } else {
            ForkName::Phase0
        }
    }

    pub fn fork_version(&self, fork: ForkName) -> B32 {
        match fork {
            ForkName::Phase0 => self.genesis_fork_version,
            ForkName::Altair => self.altair_fork_version,
            ForkName::Bellatrix => self.bellatrix_fork_version,
        }
    }

    pub fn fork_epoch(&self, fork: ForkName) -> u64 {
        match fork {
            ForkName::Phase0 => 0,
            ForkName::Altair => self.altair_fork_epoch,
            ForkName::Bellatrix => self.bellatrix_fork_epoch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_at_epoch_follows_schedule() {
        let config = ChainConfig::mainnet();
        assert_eq!(config.fork_at_epoch(0), ForkName::Phase0);
        assert_eq!(config.fork_at_epoch(74239), ForkName::Phase0);
        assert_eq!(config.fork_at_epoch(74240), ForkName::Altair);
        assert_eq!(config.fork_at_epoch(144896), ForkName::Bellatrix);
    }

    #[test]
    fn dev_config_is_bellatrix_from_genesis() {
        assert_eq!(ChainConfig::dev().fork_at_epoch(0), ForkName::Bellatrix);
    }
}
