//! The minimiser worker pool: one task per configured
//! worker, each pulling raw frames off the shared input queue and
//! running them through unmarshal -> filter -> pseudonymise -> decode ->
//! classify -> dispatch.
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex};

use crate::collector::CollectorMsg;
use crate::first_seen::FirstSeenSet;
use crate::ignore::IgnoreSet;
use crate::metrics::Metrics;
use crate::model::{NewNameEvent, SessionRecord};
use crate::pseudonymise::Pseudonymiser;
use crate::publisher;
use crate::sketch::client_hash;
use crate::tracker::{UpdateMsg, WellKnownTracker};
use crate::wire::frame::{self, RecordKind};
use crate::wire::message::{decode_message, is_valid_domain_name, label_slots};

pub struct WorkerContext {
    pub tracker: Arc<WellKnownTracker>,
    pub first_seen: Arc<FirstSeenSet>,
    pub ignore: Arc<IgnoreSet>,
    pub pseudonymiser: Pseudonymiser,
    pub metrics: Metrics,
    pub collector_tx: mpsc::Sender<CollectorMsg>,
    pub new_name_tx: mpsc::Sender<NewNameEvent>,
    pub sessions_enabled: bool,
}

/// Runs `worker_count` identical workers pulling from the same receiver,
/// serialised behind a mutex — simple and sufficient since decoding a
/// frame vastly outweighs the lock's contention.
pub async fn run_pool(worker_count: usize, frame_rx: mpsc::Receiver<Vec<u8>>, ctx: Arc<WorkerContext>) {
    let shared_rx = Arc::new(Mutex::new(frame_rx));
    let mut handles = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let rx = shared_rx.clone();
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move { worker_loop(rx, ctx).await }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

async fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>, ctx: Arc<WorkerContext>) {
    loop {
        let frame_bytes = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(frame_bytes) = frame_bytes else { return };
        process_frame(&frame_bytes, &ctx).await;
    }
}

async fn process_frame(bytes: &[u8], ctx: &WorkerContext) {
    // 1. unmarshal
    let record = match frame::decode_frame(bytes) {
        Ok(r) => r,
        Err(_) => {
            ctx.metrics.decode_failures_total.inc();
            return;
        }
    };
    ctx.metrics.processed_total.inc();

    // 2. only response-side records carry the answer we classify against.
    if record.kind == RecordKind::Query {
        ctx.metrics.queries_skipped_total.inc();
        return;
    }
    let Some(response_message) = &record.response_message else {
        ctx.metrics.decode_failures_total.inc();
        return;
    };

    // 3. debug capture sink: no-op unless a capture path is configured;
    // none is wired up in this deployment.

    // 4. ignore-set check on the raw (pre-pseudonymisation) client
    // address — for a CLIENT_RESPONSE record that is query_address, the
    // side that originated the question. A parse failure only counts as
    // ignored when the ignore set is actually configured; with an empty
    // set there's nothing to match against.
    let raw_client_ip = parse_ip(&record.query_address);
    match raw_client_ip {
        Some(ip) if ctx.ignore.contains(ip).await => {
            ctx.metrics.ignored_client_total.inc();
            return;
        }
        None if !ctx.ignore.is_empty().await => {
            ctx.metrics.ignored_client_total.inc();
            return;
        }
        _ => {}
    }

    // 5. pseudonymise both addresses, keeping the original client bytes
    // around for the cardinality hash below.
    let original_client_address = record.query_address.clone();
    let (pseudo_query, _) = ctx.pseudonymiser.anonymise(&record.query_address).await;
    let (pseudo_response, _) = ctx.pseudonymiser.anonymise(&record.response_address).await;

    // 6. decode the DNS message itself, then reject structurally invalid
    // names before classification.
    let message = match decode_message(response_message) {
        Ok(m) => m,
        Err(_) => {
            ctx.metrics.decode_failures_total.inc();
            return;
        }
    };
    if !is_valid_domain_name(&message.qname) {
        ctx.metrics.decode_failures_total.inc();
        return;
    }

    // 7. truncate to the minute the response was seen in.
    let response_minute = record.response_time_us.map(truncate_to_minute_us);

    let qname = message.qname.clone();
    let qtype = message.qtype;
    let qclass = message.qclass;
    let response_code = message.header.flags.response_code;

    // 8. tracker lookup dispatch.
    match ctx.tracker.lookup(&qname).await {
        Some(hit) => {
            let family = record.family;
            let update = UpdateMsg {
                name: qname.clone(),
                index: hit.index,
                suffix_match: hit.suffix_match,
                client_hash: client_hash(&original_client_address),
                family,
                response_code,
                qtype,
                qclass,
                revision_time: hit.revision_time,
            };
            ctx.metrics.well_known_hits_total.inc();
            let _ = ctx.collector_tx.send(CollectorMsg::Update(update)).await;
        }
        None => {
            if let Ok(false) = ctx.first_seen.seen(&qname).await {
                let event = publisher::build_event(qname.clone(), qtype, qclass, 0, 0);
                match ctx.new_name_tx.try_send(event) {
                    Ok(()) => ctx.metrics.new_name_queued_total.inc(),
                    Err(_) => ctx.metrics.new_name_discarded_total.inc(),
                }
            }
        }
    }

    // 9. session record, only when enabled; blocking send so backpressure
    // propagates to the worker instead of silently dropping sessions.
    if ctx.sessions_enabled {
        let record = SessionRecord {
            query_address: pseudo_query,
            response_address: pseudo_response,
            query_port: record.query_port,
            response_port: record.response_port,
            label_slots: label_slots(&qname),
            identity: record.identity.clone(),
            transport: record.transport,
            qname,
            qtype,
            qclass,
            response_code,
            query_time_us: record.query_time_us,
            response_time_us: response_minute,
        };
        let _ = ctx.collector_tx.send(CollectorMsg::Session(record)).await;
    }
}

fn parse_ip(raw: &[u8]) -> Option<std::net::IpAddr> {
    match raw.len() {
        4 => Some(std::net::IpAddr::V4(std::net::Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            Some(std::net::IpAddr::V6(std::net::Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn truncate_to_minute_us(us: i64) -> i64 {
    let minute_us = 60_000_000;
    (us / minute_us) * minute_us
}

#[allow(dead_code)]
fn now_us() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_micros() as i64
}
