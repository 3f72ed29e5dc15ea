use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol forks in activation order. Later forks are supersets of earlier ones, so ordering
/// comparisons express capability checks (`>= Altair`: participation flags, inactivity scores,
/// sync committees; `>= Bellatrix`: execution payloads).
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkName {
    Phase0,
    Altair,
    Bellatrix,
}

impl fmt::Display for ForkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkName::Phase0 => write!(f, "phase0"),
            ForkName::Altair => write!(f, "altair"),
            ForkName::Bellatrix => write!(f, "bellatrix"),
        }
    }
}

/// The per-fork arithmetic that differs while the surrounding pipeline stays identical.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ForkParameters {
    pub min_slashing_penalty_quotient: u64,
    pub proportional_slashing_multiplier: u64,
    pub inactivity_penalty_quotient: u64,
}

const PHASE0_PARAMETERS: ForkParameters = ForkParameters {
    min_slashing_penalty_quotient: 128,
    proportional_slashing_multiplier: 1,
    inactivity_penalty_quotient: 1 << 26,
};

const ALTAIR_PARAMETERS: ForkParameters = ForkParameters {
    min_slashing_penalty_quotient: 64,
    proportional_slashing_multiplier: 2,
    inactivity_penalty_quotient: 3 * (1 << 24),
};

const BELLATRIX_PARAMETERS: ForkParameters = ForkParameters {
    min_slashing_penalty_quotient: 32,
    proportional_slashing_multiplier: 3,
    inactivity_penalty_quotient: 1 << 24,
};

impl ForkName {
    pub fn parameters(&self) -> &'static ForkParameters {
        match self {
            ForkName::Phase0 => &PHASE0_PARAMETERS,
            ForkName::Altair => &ALTAIR_PARAMETERS,
            ForkName::Bellatrix => &BELLATRIX_PARAMETERS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_ordering_expresses_capabilities() {
        assert!(ForkName::Altair >= ForkName::Altair);
        assert!(ForkName::Bellatrix >= ForkName::Altair);
        assert!(ForkName::Phase0 < ForkName::Altair);
    }

    #[test]
    fn slashing_quotients_tighten_across_forks() {
        assert_eq!(
            ForkName::Phase0.parameters().min_slashing_penalty_quotient,
            128
        );
        assert_eq!(
            ForkName::Altair.parameters().min_slashing_penalty_quotient,
            64
        );
        assert_eq!(
            ForkName::Bellatrix
                .parameters()
                .min_slashing_penalty_quotient,
            32
        );
    }
}
