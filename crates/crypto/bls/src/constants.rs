/// Domain separation tag for BLS signatures on the beacon chain, as defined by the
/// `BLS12381G2_XMD:SHA-256_SSWU_RO` ciphersuite with proof of possession.
pub const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";
