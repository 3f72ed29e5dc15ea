use bls12_381::{G1Affine, G1Projective};

use crate::{AggregatePubKey, PubKey, errors::BLSError, traits::Aggregatable};

impl Aggregatable for AggregatePubKey {
    type Error = BLSError;

    fn aggregate(pubkeys: &[&PubKey]) -> Result<Self, Self::Error> {
        let agg_point = pubkeys
            .iter()
            .try_fold(G1Projective::identity(), |acc, pubkey| {
                let point = G1Affine::try_from(*pubkey)?;
                Ok::<_, BLSError>(acc + G1Projective::from(point))
            })?;

        Ok(Self {
            inner: PubKey::from(agg_point),
        })
    }
}
