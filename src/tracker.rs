//! Well-known-domain tracker: an immutable, memory-mapped dictionary (an
//! `fst::Map` compact acyclic automaton) behind a reader/writer lock,
//! with stale-revision retry.
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use fst::Map as FstMap;
use memmap2::Mmap;
use tokio::sync::{mpsc, RwLock};

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::wire::enums::{QClass, QType, ResponseCode};
use crate::wire::frame::SocketFamily;

/// Bit flags for a histogram entry's `status` field.
pub const STATUS_WELL_KNOWN_EXACT: u8 = 0b01;
pub const STATUS_WELL_KNOWN_WILDCARD: u8 = 0b10;

/// The dictionary plus its reverse (index -> name) index, loaded from one
/// memory-mapped file revision.
pub struct Dictionary {
    map: FstMap<Mmap>,
    reverse: Vec<Box<str>>,
    pub modified: SystemTime,
}

impl Dictionary {
    pub fn load(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        let modified = file.metadata()?.modified()?;
        let mmap = unsafe { Mmap::map(&file)? };
        let map = FstMap::new(mmap).map_err(Error::Fst)?;

        let mut reverse: Vec<Box<str>> = Vec::new();
        let mut stream = map.stream();
        use fst::Streamer;
        while let Some((key, value)) = stream.next() {
            let idx = value as usize;
            if reverse.len() <= idx {
                reverse.resize(idx + 1, Box::from(""));
            }
            reverse[idx] = String::from_utf8_lossy(key).into_owned().into_boxed_str();
        }

        Ok(Dictionary { map, reverse, modified })
    }

    fn get(&self, key: &str) -> Option<u64> {
        self.map.get(key)
    }

    /// Resolve an index back to the name that produced it, for the writer.
    pub fn name_for(&self, index: u64) -> Option<&str> {
        self.reverse.get(index as usize).map(|s| s.as_ref())
    }
}

/// Result of `WellKnownTracker::lookup`.
#[derive(Debug, Clone, Copy)]
pub struct LookupHit {
    pub index: u64,
    pub suffix_match: bool,
    pub revision_time: SystemTime,
}

struct TrackerState {
    dictionary: Arc<Dictionary>,
    revision_time: SystemTime,
}

pub struct WellKnownTracker {
    path: PathBuf,
    state: RwLock<TrackerState>,
}

impl WellKnownTracker {
    pub fn load(path: PathBuf) -> Result<Self> {
        let dictionary = Dictionary::load(&path)?;
        let revision_time = dictionary.modified;
        Ok(WellKnownTracker {
            path,
            state: RwLock::new(TrackerState {
                dictionary: Arc::new(dictionary),
                revision_time,
            }),
        })
    }

    pub async fn current_dictionary(&self) -> Arc<Dictionary> {
        self.state.read().await.dictionary.clone()
    }

    pub async fn current_revision(&self) -> SystemTime {
        self.state.read().await.revision_time
    }

    /// `lookup(name) -> (index, suffix_match, revision_time)` under a read
    /// lock: exact match first, then progressively shorter dot-prefixed
    /// tails, longest tail wins.
    pub async fn lookup(&self, name: &str) -> Option<LookupHit> {
        let guard = self.state.read().await;
        let dict = &guard.dictionary;
        let revision_time = guard.revision_time;

        if let Some(index) = dict.get(name) {
            return Some(LookupHit { index, suffix_match: false, revision_time });
        }

        for tail in candidate_tails(name) {
            if let Some(index) = dict.get(&tail) {
                return Some(LookupHit { index, suffix_match: true, revision_time });
            }
        }

        None
    }

    /// Check the on-disk file's mtime; if changed, load the new revision
    /// and swap it in under the write lock. Returns `(rotated,
    /// old_dictionary)` — the caller releases `old_dictionary` only after
    /// the in-flight writer using it is done.
    pub async fn rotate(&self) -> Result<(bool, SystemTime, Option<Arc<Dictionary>>)> {
        let on_disk_modified = fs::metadata(&self.path).and_then(|m| m.modified()).ok();

        let current_modified = self.state.read().await.dictionary.modified;
        if on_disk_modified == Some(current_modified) {
            let rev = self.state.read().await.revision_time;
            return Ok((false, rev, None));
        }

        let new_dictionary = Dictionary::load(&self.path)?;
        let revision_time = new_dictionary.modified;

        let mut guard = self.state.write().await;
        let old = std::mem::replace(&mut guard.dictionary, Arc::new(new_dictionary));
        guard.revision_time = revision_time;
        Ok((true, revision_time, Some(old)))
    }
}

fn candidate_tails(name: &str) -> Vec<String> {
    let trimmed = name.trim_end_matches('.');
    let labels: Vec<&str> = trimmed.split('.').collect();
    if labels.len() <= 1 {
        return Vec::new();
    }
    (1..labels.len()).map(|i| format!(".{}.", labels[i..].join("."))).collect()
}

/// One classified hit, carrying everything the collector needs to
/// accumulate counters without re-touching the tracker.
#[derive(Debug, Clone)]
pub struct UpdateMsg {
    pub name: String,
    pub index: u64,
    pub suffix_match: bool,
    pub client_hash: u64,
    pub family: SocketFamily,
    pub response_code: ResponseCode,
    pub qtype: QType,
    pub qclass: QClass,
    pub revision_time: SystemTime,
}

const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Re-looks-up updates whose attached revision is stale against the
/// current dictionary revision. Runs as its own task so the collector
/// never blocks on tracker lookups.
pub async fn run_retryer(
    tracker: Arc<WellKnownTracker>,
    mut retry_rx: mpsc::Receiver<UpdateMsg>,
    resubmit_tx: mpsc::Sender<UpdateMsg>,
    metrics: Metrics,
) {
    // Per-message attempt counts; an update is re-queued to itself at most
    // MAX_RETRY_ATTEMPTS times via the channel, tracked here rather than on
    // the message so the message shape stays simple.
    let mut attempts: HashMap<String, u32> = HashMap::new();

    while let Some(update) = retry_rx.recv().await {
        let count = attempts.entry(update.name.clone()).or_insert(0);
        *count += 1;
        if *count > MAX_RETRY_ATTEMPTS {
            attempts.remove(&update.name);
            metrics.stale_revision_dropped_total.inc();
            continue;
        }

        match tracker.lookup(&update.name).await {
            Some(hit) => {
                attempts.remove(&update.name);
                metrics.stale_revision_retried_total.inc();
                let refreshed = UpdateMsg {
                    index: hit.index,
                    suffix_match: hit.suffix_match,
                    revision_time: hit.revision_time,
                    ..update
                };
                if resubmit_tx.send(refreshed).await.is_err() {
                    break;
                }
            }
            None => {
                attempts.remove(&update.name);
                metrics.stale_revision_dropped_total.inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_dictionary(entries: &[(&str, u64)], path: &Path) {
        let mut sorted: Vec<(&str, u64)> = entries.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        let mut builder = fst::MapBuilder::new(fs::File::create(path).unwrap()).unwrap();
        for (key, value) in sorted {
            builder.insert(key, value).unwrap();
        }
        builder.finish().unwrap();
    }

    #[tokio::test]
    async fn exact_and_suffix_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict.fst");
        build_dictionary(&[("www.exact.example.", 1), (".example.", 7)], &path);

        let tracker = WellKnownTracker::load(path).unwrap();

        let exact = tracker.lookup("www.exact.example.").await.unwrap();
        assert_eq!(exact.index, 1);
        assert!(!exact.suffix_match);

        let suffix = tracker.lookup("www.known.example.").await.unwrap();
        assert_eq!(suffix.index, 7);
        assert!(suffix.suffix_match);

        assert!(tracker.lookup("nowhere.invalid.").await.is_none());
    }

    #[tokio::test]
    async fn reverse_lookup_resolves_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict.fst");
        build_dictionary(&[(".example.", 7)], &path);

        let tracker = WellKnownTracker::load(path).unwrap();
        let dict = tracker.current_dictionary().await;
        assert_eq!(dict.name_for(7), Some(".example."));
    }

    #[tokio::test]
    async fn rotate_picks_up_new_file_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict.fst");
        build_dictionary(&[(".example.", 7)], &path);
        let tracker = WellKnownTracker::load(path.clone()).unwrap();

        let (rotated, _, _) = tracker.rotate().await.unwrap();
        assert!(!rotated, "no on-disk change yet");

        // Force a later mtime by recreating the file.
        std::thread::sleep(std::time::Duration::from_millis(10));
        build_dictionary(&[(".example.", 7), (".another.", 8)], &path);
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.flush().unwrap();

        let (rotated, _, old) = tracker.rotate().await.unwrap();
        assert!(rotated);
        assert!(old.is_some());
        assert!(tracker.lookup("x.another.").await.is_some());
    }
}
