use crate::{AggregatePubKey, BlsSignature, PubKey};

pub trait Aggregatable {
    type Error;

    fn aggregate(pubkeys: &[&PubKey]) -> Result<AggregatePubKey, Self::Error>;
}

pub trait Verifiable {
    type Error;

    /// Verifies a BLS signature against a public key and message.
    ///
    /// Returns `Ok(true)` if the signature is valid, `Ok(false)` if verification fails, or `Err`
    /// if the signature or public key bytes don't decode to curve points.
    fn verify(&self, pubkey: &PubKey, message: &[u8]) -> Result<bool, Self::Error>;

    /// Verifies the signature against a message using an aggregate of multiple public keys.
    fn fast_aggregate_verify<'a, P>(&self, pubkeys: P, message: &[u8]) -> Result<bool, Self::Error>
    where
        P: AsRef<[&'a PubKey]>;
}

pub trait Signable {
    type Error;

    fn sign(&self, message: &[u8]) -> Result<BlsSignature, Self::Error>;
}
