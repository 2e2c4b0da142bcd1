//! Prefix-preserving IP pseudonymisation.
//!
//! The anonymisation primitive itself (Crypto-PAn) is a collaborator — this
//! module only keys it from a passphrase via argon2, caches results, and
//! handles hot-swap on reconfiguration.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use argon2::Argon2;
use cryptopan::CryptoPAn;
use lru::LruCache;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// argon2id, time=1, memory=64 MiB, parallelism=4, 32-byte output.
fn derive_key(passphrase: &[u8], salt: &[u8]) -> Result<[u8; 32]> {
    let params = argon2::Params::new(64 * 1024, 1, 4, Some(32))
        .map_err(|e| Error::Kdf(e.to_string()))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut out = [0u8; 32];
    argon2
        .hash_password_into(passphrase, salt, &mut out)
        .map_err(|e| Error::Kdf(e.to_string()))?;
    Ok(out)
}

struct Primitive {
    inner: CryptoPAn,
}

impl Primitive {
    fn new(passphrase: &[u8], salt: &[u8]) -> Result<Self> {
        let key = derive_key(passphrase, salt)?;
        Ok(Primitive {
            inner: CryptoPAn::new(&key),
        })
    }

    fn anonymise(&self, ip: IpAddr) -> IpAddr {
        match ip {
            IpAddr::V4(v4) => IpAddr::V4(self.inner.anonymize_ip4(v4)),
            IpAddr::V6(v6) => IpAddr::V6(self.inner.anonymize_ip6(v6)),
        }
    }
}

struct State {
    primitive: Primitive,
    cache: LruCache<IpAddr, IpAddr>,
}

/// Shared, hot-swappable pseudonymiser. Cloning is cheap (`Arc` inside);
/// every minimiser worker holds a clone.
#[derive(Clone)]
pub struct Pseudonymiser {
    state: Arc<RwLock<State>>,
    metrics: Metrics,
}

impl Pseudonymiser {
    pub fn new(passphrase: &[u8], salt: &[u8], cache_entries: usize, metrics: Metrics) -> Result<Self> {
        let primitive = Primitive::new(passphrase, salt)?;
        let cache_entries = std::num::NonZeroUsize::new(cache_entries.max(1)).unwrap();
        Ok(Pseudonymiser {
            state: Arc::new(RwLock::new(State {
                primitive,
                cache: LruCache::new(cache_entries),
            })),
            metrics,
        })
    }

    /// Swap in a freshly-keyed primitive and a fresh (empty) cache, taking
    /// the exclusive lock for the duration of the swap only.
    pub async fn reconfigure(&self, passphrase: &[u8], salt: &[u8], cache_entries: usize) -> Result<()> {
        let primitive = Primitive::new(passphrase, salt)?;
        let cache_entries = std::num::NonZeroUsize::new(cache_entries.max(1)).unwrap();
        let mut guard = self.state.write().await;
        guard.primitive = primitive;
        guard.cache = LruCache::new(cache_entries);
        Ok(())
    }

    /// `anonymise(raw) -> (anonymised, ok)`. On any parse/anonymise
    /// failure, returns a same-length zero buffer and `ok = false`;
    /// callers continue the pipeline regardless.
    pub async fn anonymise(&self, raw: &[u8]) -> (Vec<u8>, bool) {
        let len = raw.len();
        let ip = match parse_ip(raw) {
            Some(ip) => ip,
            None => return (vec![0u8; len], false),
        };

        if let Some(hit) = self.cache_lookup(ip).await {
            return (ip_to_bytes(hit, len), true);
        }

        let anonymised = {
            let guard = self.state.read().await;
            guard.primitive.anonymise(ip)
        };
        let normalised = normalise(anonymised);

        {
            let mut guard = self.state.write().await;
            guard.cache.put(ip, normalised);
        }

        (ip_to_bytes(normalised, len), true)
    }

    async fn cache_lookup(&self, ip: IpAddr) -> Option<IpAddr> {
        let mut guard = self.state.write().await;
        let hit = guard.cache.get(&ip).copied();
        if hit.is_some() {
            self.metrics.pseudonymiser_cache_hits.inc();
        }
        hit
    }
}

fn parse_ip(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => Some(IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// v4-mapped-in-v6 addresses are unmapped to plain v4.
fn normalise(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        other => other,
    }
}

fn ip_to_bytes(ip: IpAddr, expected_len: usize) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) if expected_len == 4 => v4.octets().to_vec(),
        IpAddr::V6(v6) if expected_len == 16 => v6.octets().to_vec(),
        // family mismatch after unmapping: fall back to a zeroed buffer of
        // the length the caller expected rather than silently mixing
        // families.
        _ => vec![0u8; expected_len],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> Metrics {
        Metrics::new_for_test()
    }

    #[tokio::test]
    async fn preserves_address_family() {
        let p = Pseudonymiser::new(b"passphrase", b"saltsaltsaltsalt", 1024, metrics()).unwrap();

        let (v4, ok) = p.anonymise(&[192, 0, 2, 1]).await;
        assert!(ok);
        assert_eq!(v4.len(), 4);

        let v6_bytes = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1).octets();
        let (v6, ok) = p.anonymise(&v6_bytes).await;
        assert!(ok);
        assert_eq!(v6.len(), 16);
    }

    #[tokio::test]
    async fn unparseable_input_is_zeroed() {
        let p = Pseudonymiser::new(b"passphrase", b"saltsaltsaltsalt", 1024, metrics()).unwrap();
        let (out, ok) = p.anonymise(&[1, 2, 3]).await;
        assert!(!ok);
        assert_eq!(out, vec![0, 0, 0]);
    }

    #[tokio::test]
    async fn cache_is_consistent_across_repeated_lookups() {
        let p = Pseudonymiser::new(b"passphrase", b"saltsaltsaltsalt", 1024, metrics()).unwrap();
        let (first, _) = p.anonymise(&[10, 0, 0, 1]).await;
        let (second, _) = p.anonymise(&[10, 0, 0, 1]).await;
        assert_eq!(first, second);
    }
}
