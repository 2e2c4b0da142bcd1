//! Histogram sender: sweeps the outbox every 10 seconds,
//! signs each file's content with an RFC 9421-style `Signature-Input`/
//! `Signature` pair over ECDSA P-256, and POSTs it. A `201 Created`
//! response moves the file to `sent/`; anything else leaves it in the
//! outbox for the next sweep.
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::metrics::Metrics;
use crate::writer::HISTOGRAM_BASE;

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const CONTENT_TYPE: &str = "application/vnd.apache.parquet";

pub struct HttpSender {
    client: Client,
    url: String,
    key_id: String,
    signing_key: SigningKey,
    metrics: Metrics,
}

impl HttpSender {
    pub fn new(url: String, key_id: String, signing_key_pem: &str, metrics: Metrics) -> Result<Self> {
        let signing_key = SigningKey::from_pkcs8_pem(signing_key_pem)
            .or_else(|_| SigningKey::from_sec1_pem(signing_key_pem))
            .map_err(|e| crate::error::Error::Other(format!("invalid ECDSA signing key: {e}")))?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(HttpSender { client, url, key_id, signing_key, metrics })
    }

    /// Builds the `Content-Digest`, `Signature-Input` and `Signature`
    /// headers for one request body, per RFC 9421's HTTP message
    /// signature scheme (`content-type`, `content-length` and
    /// `content-digest` covered, signed with ECDSA P-256).
    fn sign(&self, body: &[u8]) -> (String, String, String) {
        let digest = Sha256::digest(body);
        let content_digest = format!("sha-256=:{}:", BASE64.encode(digest));
        let content_length = body.len();

        let created = SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs();
        let signature_input = format!(
            "sig1=(\"content-type\" \"content-length\" \"content-digest\");created={created};keyid=\"{}\";alg=\"ecdsa-p256-sha256\"",
            self.key_id
        );

        let signature_base = format!(
            "\"content-type\": {CONTENT_TYPE}\n\"content-length\": {content_length}\n\"content-digest\": {content_digest}\n\"@signature-params\": {}",
            signature_input.trim_start_matches("sig1=")
        );

        let signature: Signature = self.signing_key.sign(signature_base.as_bytes());
        let signature_header = format!("sig1=:{}:", BASE64.encode(signature.to_der().as_bytes()));

        (content_digest, signature_input, signature_header)
    }

    async fn send_one(&self, path: &Path) -> Result<bool> {
        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        let (start, stop) = parse_timestamps(&filename);
        let body = tokio::fs::read(path).await?;

        let (content_digest, signature_input, signature) = self.sign(&body);
        let aggregate_interval = format_aggregate_interval(start, stop);

        let response = self
            .client
            .post(&self.url)
            .header("content-type", CONTENT_TYPE)
            .header("content-digest", content_digest)
            .header("signature-input", signature_input)
            .header("signature", signature)
            .header("aggregate-interval", aggregate_interval)
            .body(body)
            .send()
            .await?;

        Ok(response.status() == reqwest::StatusCode::CREATED)
    }
}

/// Parses `dns_histogram-<start>_<stop>.parquet` back into its two
/// timestamps, each `YYYY-MM-DDTHH-MM-SSZ` (colons swapped for dashes by
/// the writer).
fn parse_timestamps(filename: &str) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let stem = filename.trim_end_matches(".parquet");
    let Some(range) = stem.strip_prefix(&format!("{HISTOGRAM_BASE}-")) else {
        return (None, None);
    };
    let Some((start, stop)) = range.split_once('_') else { return (None, None) };
    (parse_shell_safe_timestamp(start), parse_shell_safe_timestamp(stop))
}

fn parse_shell_safe_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let rfc3339 = format!("{}:{}:{}", &s[..13], s.get(14..16)?, s.get(17..)?);
    DateTime::parse_from_rfc3339(&rfc3339).ok().map(|dt| dt.with_timezone(&Utc))
}

/// `<RFC3339-start>/PT<minutes>M`, per RFC 3339 / ISO 8601 durations.
fn format_aggregate_interval(start: Option<DateTime<Utc>>, stop: Option<DateTime<Utc>>) -> String {
    match (start, stop) {
        (Some(start), Some(stop)) => {
            let minutes = (stop - start).num_minutes().max(0);
            format!("{}/PT{minutes}M", start.to_rfc3339())
        }
        _ => "/PT0M".to_string(),
    }
}

pub async fn run(sender: HttpSender, data_dir: PathBuf, cancel: CancellationToken) {
    let outbox = crate::writer::outbox_dir(&data_dir);
    let sent = crate::writer::sent_dir(&data_dir);

    loop {
        if let Ok(true) = tokio::fs::try_exists(&outbox).await {
            if let Ok(mut entries) = tokio::fs::read_dir(&outbox).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                        continue;
                    }
                    let is_histogram_file =
                        path.file_stem().and_then(|s| s.to_str()).is_some_and(|s| s.starts_with(&format!("{HISTOGRAM_BASE}-")));
                    if !is_histogram_file {
                        continue;
                    }
                    match sender.send_one(&path).await {
                        Ok(true) => {
                            sender.metrics.histogram_files_sent_total.inc();
                            let _ = tokio::fs::create_dir_all(&sent).await;
                            if let Some(name) = path.file_name() {
                                let _ = tokio::fs::rename(&path, sent.join(name)).await;
                            }
                        }
                        _ => {
                            sender.metrics.histogram_files_failed_total.inc();
                        }
                    }
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_timestamps_from_filename() {
        let (start, stop) = parse_timestamps("dns_histogram-2026-07-26T15-00-00Z_2026-07-26T15-01-00Z.parquet");
        assert_eq!(start.unwrap().to_rfc3339(), "2026-07-26T15:00:00+00:00");
        assert_eq!(stop.unwrap().to_rfc3339(), "2026-07-26T15:01:00+00:00");
    }

    #[test]
    fn unparseable_filename_yields_none() {
        let (start, stop) = parse_timestamps("garbage.parquet");
        assert!(start.is_none() && stop.is_none());
    }

    #[test]
    fn aggregate_interval_reports_whole_minutes() {
        let (start, stop) = parse_timestamps("dns_histogram-2026-07-26T15-00-00Z_2026-07-26T15-05-00Z.parquet");
        let interval = format_aggregate_interval(start, stop);
        assert!(interval.ends_with("/PT5M"), "got {interval}");
    }
}
