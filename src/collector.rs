//! Aggregation collector: a single task owns the
//! histogram map and the cardinality sketches, so no locking is needed
//! around per-domain counters — every minimiser worker only ever sends
//! messages here.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::model::{HistogramEntry, HistogramSnapshot, SessionRecord};
use crate::tracker::{UpdateMsg, WellKnownTracker};
use crate::wire::frame::SocketFamily;

pub enum CollectorMsg {
    Update(UpdateMsg),
    Session(SessionRecord),
    Tick { start: SystemTime, stop: SystemTime },
}

/// Session records are batched and flushed either when the batch reaches
/// this size or at the next minute tick, whichever comes first.
const SESSION_BATCH_SIZE: usize = 256;

pub async fn run(
    mut rx: mpsc::Receiver<CollectorMsg>,
    tracker: Arc<WellKnownTracker>,
    histogram_tx: mpsc::Sender<HistogramSnapshot>,
    session_tx: Option<mpsc::Sender<Vec<SessionRecord>>>,
    retry_tx: mpsc::Sender<UpdateMsg>,
) {
    let mut histogram: HashMap<u64, HistogramEntry> = HashMap::new();
    let mut session_batch: Vec<SessionRecord> = Vec::new();
    let mut window_start = SystemTime::now();

    while let Some(msg) = rx.recv().await {
        match msg {
            CollectorMsg::Update(update) => {
                let current_revision = tracker.current_revision().await;
                if update.revision_time != current_revision {
                    // Dictionary rotated since this worker looked the name
                    // up; re-resolve before counting it against a stale
                    // (possibly reclaimed) index.
                    let _ = retry_tx.send(update).await;
                    continue;
                }

                let entry = histogram.entry(update.index).or_insert_with(|| HistogramEntry::new(update.index));
                entry.mark_match(update.suffix_match);
                entry.record(update.response_code, update.qtype, update.qclass);
                let hash_bytes = update.client_hash.to_be_bytes();
                match update.family {
                    SocketFamily::V4 => entry.client_sketch.insert_v4(&hash_bytes),
                    SocketFamily::V6 => entry.client_sketch.insert_v6(&hash_bytes),
                }
            }
            CollectorMsg::Session(record) => {
                session_batch.push(record);
                if session_batch.len() >= SESSION_BATCH_SIZE {
                    flush_sessions(&session_tx, &mut session_batch).await;
                }
            }
            CollectorMsg::Tick { start, stop } => {
                flush_sessions(&session_tx, &mut session_batch).await;

                let entries: Vec<HistogramEntry> = histogram.drain().map(|(_, v)| v).collect();
                // Entries above were indexed against whatever dictionary
                // was live during this window. If rotate() swaps in a new
                // one, the snapshot must keep the old dictionary to
                // resolve those indices — the new one numbers entries
                // differently.
                let (dictionary, dictionary_rotated) = match tracker.rotate().await {
                    Ok((true, _revision_time, Some(old))) => (old, true),
                    Ok(_) => (tracker.current_dictionary().await, false),
                    Err(e) => {
                        error!("rotating well-known dictionary: {e}");
                        (tracker.current_dictionary().await, false)
                    }
                };

                let snapshot = HistogramSnapshot { start: window_start, stop, entries, dictionary, dictionary_rotated };
                let _ = histogram_tx.send(snapshot).await;
                window_start = stop;
                let _ = start; // start of the just-closed window == window_start before this tick
            }
        }
    }
}

async fn flush_sessions(session_tx: &Option<mpsc::Sender<Vec<SessionRecord>>>, batch: &mut Vec<SessionRecord>) {
    if batch.is_empty() {
        return;
    }
    if let Some(tx) = session_tx {
        let drained = std::mem::take(batch);
        let _ = tx.send(drained).await;
    } else {
        batch.clear();
    }
}

/// Sleeps until the next wall-clock minute boundary and then sends a
/// `Tick` every minute thereafter, re-arming to the next boundary each
/// time rather than drifting on processing time.
pub async fn run_ticker(tx: mpsc::Sender<CollectorMsg>, cancel: CancellationToken) {
    loop {
        let now = SystemTime::now();
        let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
        let secs_into_minute = since_epoch.as_secs() % 60;
        let wait = Duration::from_secs(60 - secs_into_minute);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => return,
        }

        let stop = SystemTime::now();
        let start = stop - Duration::from_secs(60);
        if tx.send(CollectorMsg::Tick { start, stop }).await.is_err() {
            return;
        }
    }
}
