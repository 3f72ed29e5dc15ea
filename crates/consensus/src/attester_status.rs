//! Per-validator status markers collected in one pass at the start of an epoch transition.
//! Packing them into one byte keeps the status array cache-friendly for mainnet-sized registries.

pub const FLAG_PREV_SOURCE_ATTESTER: u8 = 1 << 0;
pub const FLAG_PREV_TARGET_ATTESTER: u8 = 1 << 1;
pub const FLAG_PREV_HEAD_ATTESTER: u8 = 1 << 2;
pub const FLAG_CURR_SOURCE_ATTESTER: u8 = 1 << 3;
pub const FLAG_CURR_TARGET_ATTESTER: u8 = 1 << 4;
pub const FLAG_CURR_HEAD_ATTESTER: u8 = 1 << 5;
pub const FLAG_UNSLASHED: u8 = 1 << 6;
/// Active in the previous epoch, or slashed and not yet withdrawable: counted for rewards and
/// penalties.
pub const FLAG_ELIGIBLE_ATTESTER: u8 = 1 << 7;

/// True iff every bit of ``markers`` is set in ``status``.
pub fn has_markers(status: u8, markers: u8) -> bool {
    status & markers == markers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_require_all_bits() {
        let status = FLAG_PREV_TARGET_ATTESTER | FLAG_UNSLASHED;
        assert!(has_markers(
            status,
            FLAG_PREV_TARGET_ATTESTER | FLAG_UNSLASHED
        ));
        assert!(!has_markers(
            status,
            FLAG_PREV_HEAD_ATTESTER | FLAG_UNSLASHED
        ));
        assert!(has_markers(status, FLAG_UNSLASHED));
    }
}
