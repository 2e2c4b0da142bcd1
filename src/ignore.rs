//! Client-IP ignore list: a set of CIDR
//! prefixes, reloaded wholesale and swapped in atomically.
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use ipnet::IpNet;
use tokio::sync::RwLock;

use crate::error::Result;

#[derive(Default, Clone)]
struct Prefixes(Vec<IpNet>);

impl Prefixes {
    fn contains(&self, ip: IpAddr) -> bool {
        self.0.iter().any(|net| net.contains(&ip))
    }
}

fn parse_prefixes(text: &str) -> Prefixes {
    Prefixes(
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| l.parse::<IpNet>().ok())
            .collect(),
    )
}

/// Shared, hot-reloadable ignore set. A raw address that fails to parse is
/// treated as ignored by the caller, not by this type.
pub struct IgnoreSet {
    path: Option<std::path::PathBuf>,
    prefixes: RwLock<Prefixes>,
}

impl IgnoreSet {
    pub fn empty() -> Arc<Self> {
        Arc::new(IgnoreSet { path: None, prefixes: RwLock::new(Prefixes::default()) })
    }

    pub fn load(path: &Path) -> Result<Arc<Self>> {
        let text = std::fs::read_to_string(path)?;
        Ok(Arc::new(IgnoreSet {
            path: Some(path.to_path_buf()),
            prefixes: RwLock::new(parse_prefixes(&text)),
        }))
    }

    pub async fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        let text = std::fs::read_to_string(path)?;
        let fresh = parse_prefixes(&text);
        *self.prefixes.write().await = fresh;
        Ok(())
    }

    pub async fn contains(&self, ip: IpAddr) -> bool {
        self.prefixes.read().await.contains(ip)
    }

    pub async fn is_empty(&self) -> bool {
        self.prefixes.read().await.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn matches_configured_prefixes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "10.0.0.0/8").unwrap();
        writeln!(file, "# a comment").unwrap();
        writeln!(file, "2001:db8::/32").unwrap();

        let set = IgnoreSet::load(file.path()).unwrap();
        assert!(set.contains("10.1.2.3".parse().unwrap()).await);
        assert!(set.contains("2001:db8::1".parse().unwrap()).await);
        assert!(!set.contains("192.0.2.1".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn reload_replaces_the_set_atomically() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "10.0.0.0/8").unwrap();
        let set = IgnoreSet::load(file.path()).unwrap();
        assert!(set.contains("10.1.1.1".parse().unwrap()).await);

        std::fs::write(file.path(), "192.0.2.0/24\n").unwrap();
        set.reload().await.unwrap();
        assert!(!set.contains("10.1.1.1".parse().unwrap()).await);
        assert!(set.contains("192.0.2.5".parse().unwrap()).await);
    }
}
