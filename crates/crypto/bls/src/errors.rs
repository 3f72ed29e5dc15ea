use thiserror::Error;

#[derive(Error, PartialEq, Debug)]
pub enum BLSError {
    #[error("signature bytes don't have the expected length")]
    InvalidByteLength,
    #[error("invalid hex string")]
    InvalidHexString,
    #[error("bytes don't encode a valid G1 point")]
    InvalidPublicKey,
    #[error("bytes don't encode a valid G2 point")]
    InvalidSignature,
    #[error("private key is not a canonical scalar")]
    InvalidPrivateKey,
}
