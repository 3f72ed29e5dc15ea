use std::{collections::HashMap, sync::Arc};

use anyhow::ensure;
use parking_lot::RwLock;
use pharos_bls::PubKey;

#[derive(Debug, Default)]
struct Registry {
    pubkey_to_index: HashMap<PubKey, u64>,
    index_to_pubkey: Vec<PubKey>,
}

/// Append-only pubkey <-> validator-index registry, shared by every state cloned from a common
/// ancestor. Indices are assigned once and never reassigned, so concurrent readers on different
/// clones always agree; the deposit processor is the only writer.
#[derive(Debug, Clone, Default)]
pub struct PubkeyCache {
    registry: Arc<RwLock<Registry>>,
}

impl PubkeyCache {
    pub fn len(&self) -> usize {
        let registry = self.registry.read();
        debug_assert_eq!(
            registry.pubkey_to_index.len(),
            registry.index_to_pubkey.len()
        );
        registry.index_to_pubkey.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_index(&self, pubkey: &PubKey) -> Option<u64> {
        self.registry.read().pubkey_to_index.get(pubkey).copied()
    }

    pub fn get_pubkey(&self, index: u64) -> Option<PubKey> {
        self.registry.read().index_to_pubkey.get(index as usize).cloned()
    }

    /// Registers ``pubkey`` at the next free index, or returns the index it already holds.
    /// Fails if a caller tries to register a known pubkey under a different index.
    pub fn insert(&self, pubkey: PubKey, index: u64) -> anyhow::Result<()> {
        let mut registry = self.registry.write();
        if let Some(existing) = registry.pubkey_to_index.get(&pubkey) {
            ensure!(
                *existing == index,
                "Pubkey already registered at index {existing}, refusing to move it to {index}"
            );
            return Ok(());
        }
        ensure!(
            index as usize == registry.index_to_pubkey.len(),
            "Pubkey registry is append-only: expected index {}, got {index}",
            registry.index_to_pubkey.len()
        );
        registry.pubkey_to_index.insert(pubkey.clone(), index);
        registry.index_to_pubkey.push(pubkey);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ssz_types::FixedVector;

    use super::*;

    fn pubkey(byte: u8) -> PubKey {
        PubKey {
            inner: FixedVector::from(vec![byte; 48]),
        }
    }

    #[test]
    fn insert_is_append_only() {
        let cache = PubkeyCache::default();
        cache.insert(pubkey(1), 0).unwrap();
        cache.insert(pubkey(2), 1).unwrap();

        // Re-inserting at the same index is a no-op.
        cache.insert(pubkey(1), 0).unwrap();
        assert_eq!(cache.len(), 2);

        // Moving a pubkey or skipping an index is refused.
        assert!(cache.insert(pubkey(1), 5).is_err());
        assert!(cache.insert(pubkey(3), 7).is_err());
    }

    #[test]
    fn clones_share_the_registry() {
        let cache = PubkeyCache::default();
        let clone = cache.clone();
        cache.insert(pubkey(9), 0).unwrap();

        assert_eq!(clone.get_index(&pubkey(9)), Some(0));
        assert_eq!(clone.get_pubkey(0), Some(pubkey(9)));
    }
}
