use bls12_381::{
    G1Affine, G2Affine, G2Projective,
    hash_to_curve::{ExpandMsgXmd, HashToCurve},
    pairing,
};

use crate::{
    AggregatePubKey, BlsSignature, PubKey,
    constants::DST,
    errors::BLSError,
    traits::{Aggregatable, Verifiable},
};

impl TryFrom<&BlsSignature> for G2Affine {
    type Error = BLSError;

    fn try_from(value: &BlsSignature) -> Result<Self, Self::Error> {
        G2Affine::from_compressed(
            &value
                .to_bytes()
                .try_into()
                .map_err(|_| BLSError::InvalidByteLength)?,
        )
        .into_option()
        .ok_or(BLSError::InvalidSignature)
    }
}

impl BlsSignature {
    /// Aggregates signatures over the same message by summing their G2 points.
    pub fn aggregate(signatures: &[&BlsSignature]) -> Result<BlsSignature, BLSError> {
        let agg_point = signatures
            .iter()
            .try_fold(G2Projective::identity(), |acc, signature| {
                let point = G2Affine::try_from(*signature)?;
                Ok::<_, BLSError>(acc + G2Projective::from(point))
            })?;

        Ok(BlsSignature {
            inner: ssz_types::FixedVector::from(
                G2Affine::from(agg_point).to_compressed().to_vec(),
            ),
        })
    }
}

impl Verifiable for BlsSignature {
    type Error = BLSError;

    fn verify(&self, pubkey: &PubKey, message: &[u8]) -> Result<bool, BLSError> {
        let h = <G2Projective as HashToCurve<ExpandMsgXmd<sha2::Sha256>>>::hash_to_curve(
            message,
            DST,
        );

        let gt1 = pairing(&G1Affine::try_from(pubkey)?, &G2Affine::from(h));
        let gt2 = pairing(&G1Affine::generator(), &G2Affine::try_from(self)?);

        Ok(gt1 == gt2)
    }

    fn fast_aggregate_verify<'a, P>(&self, pubkeys: P, message: &[u8]) -> Result<bool, BLSError>
    where
        P: AsRef<[&'a PubKey]>,
    {
        let agg_pubkey = AggregatePubKey::aggregate(pubkeys.as_ref())?;

        let h = <G2Projective as HashToCurve<ExpandMsgXmd<sha2::Sha256>>>::hash_to_curve(
            message,
            DST,
        );

        let gt1 = pairing(
            &G1Affine::try_from(&agg_pubkey.to_pubkey())?,
            &G2Affine::from(h),
        );
        let gt2 = pairing(&G1Affine::generator(), &G2Affine::try_from(self)?);

        Ok(gt1 == gt2)
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::B256;

    use super::*;
    use crate::{PrivateKey, traits::Signable};

    fn key_from_u64(value: u64) -> PrivateKey {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&value.to_le_bytes());
        PrivateKey::new(B256::from(bytes))
    }

    #[test]
    fn sign_then_verify() {
        let private_key = key_from_u64(42);
        let pubkey = private_key.public_key().unwrap();
        let message = b"beacon block root";

        let signature = private_key.sign(message).unwrap();
        assert!(signature.verify(&pubkey, message).unwrap());
        assert!(!signature.verify(&pubkey, b"different message").unwrap());
    }

    #[test]
    fn fast_aggregate_verify_two_signers() {
        let keys = [key_from_u64(7), key_from_u64(11)];
        let pubkeys = keys
            .iter()
            .map(|key| key.public_key().unwrap())
            .collect::<Vec<_>>();
        let message = b"sync committee message";

        let signatures = keys
            .iter()
            .map(|key| key.sign(message).unwrap())
            .collect::<Vec<_>>();
        let aggregate = BlsSignature::aggregate(&signatures.iter().collect::<Vec<_>>()).unwrap();

        let pubkey_refs = pubkeys.iter().collect::<Vec<_>>();
        assert!(
            aggregate
                .fast_aggregate_verify(&pubkey_refs[..], message)
                .unwrap()
        );

        // Dropping one participant must invalidate the aggregate.
        assert!(
            !aggregate
                .fast_aggregate_verify(&pubkey_refs[..1], message)
                .unwrap()
        );
    }

    #[test]
    fn infinity_signature_decodes_to_identity() {
        let point = G2Affine::try_from(&BlsSignature::infinity()).unwrap();
        assert!(bool::from(point.is_identity()));
    }
}
