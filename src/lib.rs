//! Pseudonymising DNS telemetry minimiser: classifies dnstap responses
//! against a well-known-domain dictionary, aggregates per-minute
//! histograms, and publishes first-seen names. See `config::Config` for
//! the external surface.
pub mod collector;
pub mod config;
pub mod error;
pub mod first_seen;
pub mod frame_source;
pub mod ignore;
pub mod metrics;
pub mod minimiser;
pub mod model;
pub mod pseudonymise;
pub mod publisher;
pub mod sender;
pub mod shutdown;
pub mod sketch;
pub mod tracker;
pub mod wire;
pub mod writer;

use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::Result;
use crate::first_seen::FirstSeenSet;
use crate::ignore::IgnoreSet;
use crate::metrics::Metrics;
use crate::minimiser::WorkerContext;
use crate::pseudonymise::Pseudonymiser;
use crate::tracker::WellKnownTracker;

const FRAME_QUEUE_DEPTH: usize = 4096;
const COLLECTOR_QUEUE_DEPTH: usize = 4096;
const RETRY_QUEUE_DEPTH: usize = 1024;
const HISTOGRAM_QUEUE_DEPTH: usize = 16;
const SESSION_QUEUE_DEPTH: usize = 16;

/// Wires every component together and runs until a shutdown signal
/// arrives, instantiated in dependency order.
pub async fn run(config: Config) -> Result<()> {
    let metrics = Metrics::new()?;
    metrics::serve(metrics.clone(), &config.metrics_addr)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let tracker = Arc::new(WellKnownTracker::load(config.well_known_domains.clone())?);

    let cryptopan_key = match &config.cryptopan_key_file {
        Some(path) => std::fs::read_to_string(path)?.trim().as_bytes().to_vec(),
        None => config.cryptopan_key.as_bytes().to_vec(),
    };
    let pseudonymiser = Pseudonymiser::new(
        &cryptopan_key,
        config.cryptopan_key_salt.as_bytes(),
        config.cryptopan_address_entries,
        metrics.clone(),
    )?;
    if let Some(path) = &config.cryptopan_key_file {
        spawn_key_watcher(
            path.clone(),
            pseudonymiser.clone(),
            config.cryptopan_key_salt.clone(),
            config.cryptopan_address_entries,
        );
    }

    let db = sled::Config::new().path(config.data_dir.join("qname_seen.sled")).open()?;
    let first_seen = FirstSeenSet::open(&db, config.qname_seen_entries, metrics.clone())?;

    let ignore = match &config.ignored_client_ip_file {
        Some(path) => IgnoreSet::load(path)?,
        None => IgnoreSet::empty(),
    };
    if let Some(path) = &config.ignored_client_ip_file {
        spawn_ignore_watcher(path.clone(), ignore.clone());
    }

    let cancel = shutdown::new();

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
    let (collector_tx, collector_rx) = mpsc::channel(COLLECTOR_QUEUE_DEPTH);
    let (retry_tx, retry_rx) = mpsc::channel::<crate::tracker::UpdateMsg>(RETRY_QUEUE_DEPTH);
    let (histogram_tx, mut histogram_rx) = mpsc::channel(HISTOGRAM_QUEUE_DEPTH);
    let (session_tx, mut session_rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
    let (new_name_tx, new_name_rx) = mpsc::channel(config.new_qname_buffer);

    // Stale-revision retries resubmit into the collector's own Update
    // path, so the retryer needs a way to turn a refreshed UpdateMsg back
    // into a CollectorMsg; bridge that here.
    let collector_tx_for_retry = collector_tx.clone();
    let (resubmit_tx, mut resubmit_rx) = mpsc::channel::<crate::tracker::UpdateMsg>(RETRY_QUEUE_DEPTH);
    tokio::spawn(async move {
        while let Some(update) = resubmit_rx.recv().await {
            if collector_tx_for_retry.send(collector::CollectorMsg::Update(update)).await.is_err() {
                break;
            }
        }
    });
    tokio::spawn(tracker::run_retryer(tracker.clone(), retry_rx, resubmit_tx, metrics.clone()));

    let ticker_tx = collector_tx.clone();
    tokio::spawn(collector::run(
        collector_rx,
        tracker.clone(),
        histogram_tx,
        if config.disable_session_files { None } else { Some(session_tx) },
        retry_tx,
    ));
    tokio::spawn(collector::run_ticker(ticker_tx, cancel.clone()));

    let data_dir = config.data_dir.clone();
    tokio::spawn(async move {
        while let Some(mut snapshot) = histogram_rx.recv().await {
            if let Err(e) = writer::write_histogram(&mut snapshot, &data_dir) {
                error!("writing histogram snapshot: {e}");
            }
        }
    });

    if !config.disable_session_files {
        let data_dir = config.data_dir.clone();
        tokio::spawn(async move {
            while let Some(batch) = session_rx.recv().await {
                let now = std::time::SystemTime::now();
                let start = now - std::time::Duration::from_secs(60);
                if let Err(e) = writer::write_sessions(&batch, &data_dir, start, now) {
                    error!("writing session batch: {e}");
                }
            }
        });
    } else {
        drop(session_rx);
    }

    if !config.disable_histogram_sender {
        if let (Some(url), Some(key_id), Some(key_file)) =
            (&config.http_url, &config.http_signing_key_id, &config.http_signing_key_file)
        {
            let key_pem = std::fs::read_to_string(key_file)?;
            let sender = sender::HttpSender::new(url.clone(), key_id.clone(), &key_pem, metrics.clone())?;
            tokio::spawn(sender::run(sender, config.data_dir.clone(), cancel.clone()));
        } else {
            warn!("histogram sender enabled but http-url/http-signing-key-id/http-signing-key-file incomplete; not starting it");
        }
    }
    tokio::spawn(writer::run_cleaner(
        config.data_dir.clone(),
        std::time::Duration::from_secs(12 * 3600),
        cancel.clone(),
    ));

    if !config.disable_mqtt {
        if let (Some(broker), Some(key_id), Some(key_file)) =
            (&config.mqtt_server, &config.mqtt_signing_key_id, &config.mqtt_signing_key_file)
        {
            let key_pem = std::fs::read(key_file)?;
            let (publisher, event_loop) = publisher::Publisher::connect(
                broker,
                &config.mqtt_client_id,
                config.mqtt_keepalive,
                config.mqtt_topic.clone(),
                key_id.clone(),
                &key_pem,
                metrics.clone(),
            )
            .await?;
            tokio::spawn(publisher::run(publisher, new_name_rx, event_loop));
        } else {
            warn!("MQTT publishing enabled but mqtt-server/mqtt-signing-key-id/mqtt-signing-key-file incomplete; not starting it");
            drop(new_name_rx);
        }
    } else {
        drop(new_name_rx);
    }

    let worker_ctx = Arc::new(WorkerContext {
        tracker: tracker.clone(),
        first_seen,
        ignore: ignore.clone(),
        pseudonymiser,
        metrics: metrics.clone(),
        collector_tx,
        new_name_tx,
        sessions_enabled: !config.disable_session_files,
    });

    let workers = tokio::spawn(minimiser::run_pool(config.minimiser_workers, frame_rx, worker_ctx));

    let source_metrics = metrics.clone();
    let source_cancel = cancel.clone();
    let source_cfg = config.clone();
    let source = tokio::spawn(async move { frame_source::run(&source_cfg, frame_tx, source_metrics, source_cancel).await });

    info!("dns-minimiser running with {} workers", config.minimiser_workers);
    shutdown::wait_for_signal(cancel).await;

    let _ = source.await;
    let _ = workers.await;

    Ok(())
}

/// Watches the ignore-list file with a 100ms debounce and reloads the set
/// on change. Runs the blocking `notify` watcher on its
/// own thread, since it isn't async, and bridges into the runtime with a
/// channel.
fn spawn_ignore_watcher(path: std::path::PathBuf, ignore: Arc<IgnoreSet>) {
    use notify_debouncer_mini::{new_debouncer, DebounceEventResult};

    let (tx, mut rx) = mpsc::channel::<()>(8);
    let watch_dir = path.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| std::path::PathBuf::from("."));

    std::thread::Builder::new()
        .name("ignore-watch".into())
        .spawn(move || {
            let mut debouncer = match new_debouncer(std::time::Duration::from_millis(100), move |res: DebounceEventResult| {
                if res.is_ok() {
                    let _ = tx.blocking_send(());
                }
            }) {
                Ok(d) => d,
                Err(e) => {
                    warn!("starting ignore-list watcher: {e}");
                    return;
                }
            };
            if let Err(e) = debouncer.watcher().watch(&watch_dir, notify::RecursiveMode::NonRecursive) {
                warn!("watching ignore-list directory {}: {e}", watch_dir.display());
                return;
            }
            // Park this thread; the debouncer's own background thread drives events.
            loop {
                std::thread::sleep(std::time::Duration::from_secs(3600));
            }
        })
        .expect("spawning ignore-list watcher thread");

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            if let Err(e) = ignore.reload().await {
                error!("reloading ignore list: {e}");
            }
        }
    });
}

/// Watches the pseudonymisation key file the same way
/// `spawn_ignore_watcher` watches the ignore list, calling
/// `Pseudonymiser::reconfigure` with the freshly-read passphrase on every
/// change.
fn spawn_key_watcher(path: std::path::PathBuf, pseudonymiser: Pseudonymiser, salt: String, cache_entries: usize) {
    use notify_debouncer_mini::{new_debouncer, DebounceEventResult};

    let (tx, mut rx) = mpsc::channel::<()>(8);
    let watch_dir = path.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| std::path::PathBuf::from("."));

    std::thread::Builder::new()
        .name("key-watch".into())
        .spawn(move || {
            let mut debouncer = match new_debouncer(std::time::Duration::from_millis(100), move |res: DebounceEventResult| {
                if res.is_ok() {
                    let _ = tx.blocking_send(());
                }
            }) {
                Ok(d) => d,
                Err(e) => {
                    warn!("starting pseudonymisation key watcher: {e}");
                    return;
                }
            };
            if let Err(e) = debouncer.watcher().watch(&watch_dir, notify::RecursiveMode::NonRecursive) {
                warn!("watching pseudonymisation key directory {}: {e}", watch_dir.display());
                return;
            }
            loop {
                std::thread::sleep(std::time::Duration::from_secs(3600));
            }
        })
        .expect("spawning pseudonymisation key watcher thread");

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    if let Err(e) = pseudonymiser.reconfigure(text.trim().as_bytes(), salt.as_bytes(), cache_entries).await {
                        error!("reconfiguring pseudonymiser: {e}");
                    }
                }
                Err(e) => error!("reading pseudonymisation key file {}: {e}", path.display()),
            }
        }
    });
}
