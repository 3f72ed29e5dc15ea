use std::hash::{Hash, Hasher};

use alloy_primitives::hex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ssz::Encode;
use ssz_derive::{Decode, Encode};
use ssz_types::{FixedVector, typenum::U96};
use tree_hash_derive::TreeHash;

#[derive(Debug, PartialEq, Clone, Encode, Decode, TreeHash, Default)]
pub struct BlsSignature {
    pub inner: FixedVector<u8, U96>,
}

impl Eq for BlsSignature {}

impl Hash for BlsSignature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl Serialize for BlsSignature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let val = format!("0x{}", hex::encode(self.inner.as_ssz_bytes()));
        serializer.serialize_str(&val)
    }
}

impl<'de> Deserialize<'de> for BlsSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let result: String = Deserialize::deserialize(deserializer)?;
        let result = hex::decode(&result).map_err(serde::de::Error::custom)?;
        let signature = FixedVector::from(result);
        Ok(Self { inner: signature })
    }
}

impl BlsSignature {
    pub fn to_bytes(&self) -> &[u8] {
        self.inner.iter().as_slice()
    }

    /// The compressed encoding of the point at infinity in G2. Used as the placeholder signature
    /// for sync aggregates with no participants.
    pub fn infinity() -> Self {
        let mut bytes = vec![0u8; 96];
        bytes[0] = 0xc0;
        Self {
            inner: FixedVector::from(bytes),
        }
    }
}
