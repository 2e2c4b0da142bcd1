//! Prometheus metrics, served on `127.0.0.1:2112/metrics`.
//! `Registry` + typed counters/gauges + `TextEncoder`, the common
//! `prometheus` crate idiom for exposing a scrape endpoint.
use std::net::TcpListener;
use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::error::Result;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub processed_total: IntCounter,
    pub queries_skipped_total: IntCounter,
    pub ignored_client_total: IntCounter,
    pub decode_failures_total: IntCounter,
    pub well_known_hits_total: IntCounter,
    pub pseudonymiser_cache_hits: IntCounter,
    pub first_seen_cache_hits: IntCounter,
    pub first_seen_cache_evictions: IntCounter,
    pub new_name_queued_total: IntCounter,
    pub new_name_discarded_total: IntCounter,
    pub new_name_channel_len: IntGauge,
    pub stale_revision_retried_total: IntCounter,
    pub stale_revision_dropped_total: IntCounter,
    pub histogram_files_sent_total: IntCounter,
    pub histogram_files_failed_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        macro_rules! counter {
            ($name:literal, $help:literal) => {{
                let c = IntCounter::new($name, $help).unwrap();
                registry.register(Box::new(c.clone())).unwrap();
                c
            }};
        }
        macro_rules! gauge {
            ($name:literal, $help:literal) => {{
                let g = IntGauge::new($name, $help).unwrap();
                registry.register(Box::new(g.clone())).unwrap();
                g
            }};
        }

        Ok(Metrics {
            processed_total: counter!("dns_minimiser_processed_total", "transaction records processed"),
            queries_skipped_total: counter!("dns_minimiser_queries_skipped_total", "query-side records skipped"),
            ignored_client_total: counter!("dns_minimiser_ignored_client_total", "records dropped by the client ignore list"),
            decode_failures_total: counter!("dns_minimiser_decode_failures_total", "frame/DNS decode failures"),
            well_known_hits_total: counter!("dns_minimiser_well_known_hits_total", "responses matching the well-known dictionary"),
            pseudonymiser_cache_hits: counter!("dns_minimiser_pseudonymiser_cache_hits_total", "pseudonymiser LRU cache hits"),
            first_seen_cache_hits: counter!("dns_minimiser_first_seen_cache_hits_total", "first-seen recency cache hits"),
            first_seen_cache_evictions: counter!("dns_minimiser_first_seen_cache_evictions_total", "first-seen recency cache evictions"),
            new_name_queued_total: counter!("dns_minimiser_new_name_queued_total", "new-name events enqueued to the publisher"),
            new_name_discarded_total: counter!("dns_minimiser_new_name_discarded_total", "new-name events dropped because the publisher channel was full"),
            new_name_channel_len: gauge!("dns_minimiser_new_name_channel_len", "current depth of the new-name publisher channel"),
            stale_revision_retried_total: counter!("dns_minimiser_stale_revision_retried_total", "updates re-looked-up after a dictionary rotation"),
            stale_revision_dropped_total: counter!("dns_minimiser_stale_revision_dropped_total", "updates dropped after exhausting stale-revision retries"),
            histogram_files_sent_total: counter!("dns_minimiser_histogram_files_sent_total", "histogram files successfully uploaded"),
            histogram_files_failed_total: counter!("dns_minimiser_histogram_files_failed_total", "histogram upload attempts that did not get a 201"),
            registry,
        })
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        Metrics::new().expect("metrics registration never fails with fixed names")
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode(&families, &mut buffer).expect("prometheus text encoding is infallible for counters/gauges");
        buffer
    }
}

/// Spawns a blocking `tiny_http` server on its own OS thread; kept off the
/// async runtime since serving `/metrics` is plain text rendering, not a
/// hot path.
pub fn serve(metrics: Metrics, addr: &str) -> Result<()> {
    // Bind synchronously so a startup-time port conflict is fatal
    // immediately rather than surfacing later from the background thread.
    let listener = TcpListener::bind(addr).map_err(crate::error::Error::Io)?;
    let server = tiny_http::Server::from_listener(listener, None)
        .map_err(|e| crate::error::Error::Other(format!("metrics server: {e}")))?;
    let server = Arc::new(server);

    std::thread::Builder::new()
        .name("metrics".into())
        .spawn(move || {
            for request in server.incoming_requests() {
                let body = metrics.encode();
                let response = tiny_http::Response::from_data(body).with_header(
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"text/plain; version=0.0.4"[..])
                        .expect("static header is always valid"),
                );
                let _ = request.respond(response);
            }
        })
        .expect("spawning the metrics server thread");

    Ok(())
}
