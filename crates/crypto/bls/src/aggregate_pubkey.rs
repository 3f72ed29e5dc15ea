use crate::PubKey;

#[derive(Debug, PartialEq, Clone, Default)]
pub struct AggregatePubKey {
    pub inner: PubKey,
}

impl AggregatePubKey {
    pub fn to_pubkey(&self) -> PubKey {
        self.inner.clone()
    }
}
