//! Cardinality sketches for the histogram's per-domain distinct-client
//! counts: one HyperLogLog per address family, hashed
//! with a fixed seed so two sketches built independently for the same
//! window — one per minimiser worker, later merged by the collector —
//! serialise to identical bytes given identical input.
use std::collections::hash_map::DefaultHasher;
use std::hash::BuildHasherDefault;

use hyperloglogplus::{HyperLogLog, HyperLogLogPlus};

use crate::error::Result;

/// Precision 14 (2^14 registers) balances the ~0.8% standard error against
/// per-entry footprint; this is the same precision dnstap-style minimisers
/// commonly ship with.
const PRECISION: u8 = 14;

type Hasher = BuildHasherDefault<DefaultHasher>;
type Sketch = HyperLogLogPlus<Vec<u8>, Hasher>;

/// Separate v4/v6 sketches.
pub struct FamilySketch {
    v4: Sketch,
    v6: Sketch,
}

impl FamilySketch {
    pub fn new() -> Self {
        FamilySketch {
            v4: HyperLogLogPlus::new(PRECISION, Hasher::default()).expect("fixed precision is always valid"),
            v6: HyperLogLogPlus::new(PRECISION, Hasher::default()).expect("fixed precision is always valid"),
        }
    }

    pub fn insert_v4(&mut self, pseudonymised: &[u8]) {
        self.v4.insert(&pseudonymised.to_vec());
    }

    pub fn insert_v6(&mut self, pseudonymised: &[u8]) {
        self.v6.insert(&pseudonymised.to_vec());
    }

    pub fn count_v4(&mut self) -> u64 {
        self.v4.count().round() as u64
    }

    pub fn count_v6(&mut self) -> u64 {
        self.v6.count().round() as u64
    }

    pub fn merge(&mut self, other: &FamilySketch) -> Result<()> {
        self.v4.merge(&other.v4).map_err(|e| crate::error::Error::Other(format!("sketch merge: {e:?}")))?;
        self.v6.merge(&other.v6).map_err(|e| crate::error::Error::Other(format!("sketch merge: {e:?}")))?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        Ok((bincode::serialize(&self.v4)?, bincode::serialize(&self.v6)?))
    }
}

impl Default for FamilySketch {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic 64-bit hash used to bucket a client address into the
/// sketch without retaining the address itself past this call. Callers
/// pass the original (pre-pseudonymisation) client bytes, not the
/// anonymised ones — the sketch only needs a stable distinguishing hash,
/// and hashing before anonymisation avoids tying the cardinality count
/// to whichever key happens to be loaded at the time.
pub fn client_hash(client_address: &[u8]) -> u64 {
    murmur3::murmur3_x64_128(&mut std::io::Cursor::new(client_address), 0)
        .map(|h| h as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_grow_with_distinct_inserts() {
        let mut sketch = FamilySketch::new();
        for i in 0..500u32 {
            sketch.insert_v4(&i.to_be_bytes());
        }
        let count = sketch.count_v4();
        assert!(count > 400 && count < 600, "count {count} should approximate 500");
        assert_eq!(sketch.count_v6(), 0);
    }

    #[test]
    fn merge_combines_distinct_clients() {
        let mut a = FamilySketch::new();
        let mut b = FamilySketch::new();
        for i in 0..100u32 {
            a.insert_v4(&i.to_be_bytes());
        }
        for i in 100..200u32 {
            b.insert_v4(&i.to_be_bytes());
        }
        a.merge(&b).unwrap();
        let count = a.count_v4();
        assert!(count > 150 && count < 250);
    }

    #[test]
    fn client_hash_is_deterministic() {
        let ip = [192, 0, 2, 1];
        assert_eq!(client_hash(&ip), client_hash(&ip));
    }
}
