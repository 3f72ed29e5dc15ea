use bls12_381::{
    G1Projective, G2Projective, Scalar,
    hash_to_curve::{ExpandMsgXmd, HashToCurve},
};
use group::Curve;
use ssz_types::FixedVector;

use crate::{
    BlsSignature, PrivateKey, PubKey, constants::DST, errors::BLSError, traits::Signable,
};

impl PrivateKey {
    fn scalar(&self) -> Result<Scalar, BLSError> {
        Scalar::from_bytes(self.inner.as_ref())
            .into_option()
            .ok_or(BLSError::InvalidPrivateKey)
    }

    /// Derives the public key on G1 from the private scalar.
    pub fn public_key(&self) -> Result<PubKey, BLSError> {
        let point = G1Projective::generator() * self.scalar()?;
        Ok(PubKey::from(point))
    }
}

impl Signable for PrivateKey {
    type Error = BLSError;

    fn sign(&self, message: &[u8]) -> Result<BlsSignature, Self::Error> {
        let hash_point = <G2Projective as HashToCurve<ExpandMsgXmd<sha2::Sha256>>>::hash_to_curve(
            message,
            DST,
        );

        let signature_point = hash_point * self.scalar()?;
        let signature_bytes = signature_point.to_affine().to_compressed();

        Ok(BlsSignature {
            inner: FixedVector::from(signature_bytes.to_vec()),
        })
    }
}
