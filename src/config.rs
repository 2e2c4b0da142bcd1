//! Layered configuration: a TOML file provides defaults,
//! environment variables override the file, and CLI flags override
//! everything — the precedence `clap`'s own `env` support gives us for
//! free between CLI and env; the file layer is merged in by hand before
//! `clap` resolves defaults.
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Parser, Debug, Clone)]
#[command(name = "dns-minimiser", about = "Pseudonymising DNS telemetry minimiser")]
pub struct CliArgs {
    #[arg(long, env = "DNS_MINIMISER_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    #[arg(long, env = "DNS_MINIMISER_CRYPTOPAN_KEY")]
    pub cryptopan_key: Option<String>,
    #[arg(long, env = "DNS_MINIMISER_CRYPTOPAN_KEY_SALT")]
    pub cryptopan_key_salt: Option<String>,
    #[arg(long, env = "DNS_MINIMISER_CRYPTOPAN_KEY_FILE")]
    pub cryptopan_key_file: Option<PathBuf>,
    #[arg(long, env = "DNS_MINIMISER_CRYPTOPAN_ADDRESS_ENTRIES")]
    pub cryptopan_address_entries: Option<usize>,

    #[arg(long, env = "DNS_MINIMISER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
    #[arg(long, env = "DNS_MINIMISER_WELL_KNOWN_DOMAINS")]
    pub well_known_domains: Option<PathBuf>,
    #[arg(long, env = "DNS_MINIMISER_IGNORED_CLIENT_IP_FILE")]
    pub ignored_client_ip_file: Option<PathBuf>,

    #[arg(long, env = "DNS_MINIMISER_QNAME_SEEN_ENTRIES")]
    pub qname_seen_entries: Option<usize>,
    #[arg(long, env = "DNS_MINIMISER_NEW_QNAME_BUFFER")]
    pub new_qname_buffer: Option<usize>,
    #[arg(long, env = "DNS_MINIMISER_WORKERS")]
    pub minimiser_workers: Option<usize>,

    #[arg(long, env = "DNS_MINIMISER_DISABLE_SESSION_FILES")]
    pub disable_session_files: bool,
    #[arg(long, env = "DNS_MINIMISER_DISABLE_HISTOGRAM_SENDER")]
    pub disable_histogram_sender: bool,
    #[arg(long, env = "DNS_MINIMISER_DISABLE_MQTT")]
    pub disable_mqtt: bool,

    #[arg(long, env = "DNS_MINIMISER_HTTP_URL")]
    pub http_url: Option<String>,
    #[arg(long, env = "DNS_MINIMISER_HTTP_SIGNING_KEY_ID")]
    pub http_signing_key_id: Option<String>,
    #[arg(long, env = "DNS_MINIMISER_HTTP_SIGNING_KEY_FILE")]
    pub http_signing_key_file: Option<PathBuf>,
    #[arg(long, env = "DNS_MINIMISER_HTTP_CA_FILE")]
    pub http_ca_file: Option<PathBuf>,
    #[arg(long, env = "DNS_MINIMISER_HTTP_CLIENT_CERT_FILE")]
    pub http_client_cert_file: Option<PathBuf>,
    #[arg(long, env = "DNS_MINIMISER_HTTP_CLIENT_KEY_FILE")]
    pub http_client_key_file: Option<PathBuf>,

    #[arg(long, env = "DNS_MINIMISER_MQTT_SERVER")]
    pub mqtt_server: Option<String>,
    #[arg(long, env = "DNS_MINIMISER_MQTT_CLIENT_ID")]
    pub mqtt_client_id: Option<String>,
    #[arg(long, env = "DNS_MINIMISER_MQTT_TOPIC")]
    pub mqtt_topic: Option<String>,
    #[arg(long, env = "DNS_MINIMISER_MQTT_KEEPALIVE_SECS")]
    pub mqtt_keepalive_secs: Option<u64>,
    #[arg(long, env = "DNS_MINIMISER_MQTT_SIGNING_KEY_ID")]
    pub mqtt_signing_key_id: Option<String>,
    #[arg(long, env = "DNS_MINIMISER_MQTT_SIGNING_KEY_FILE")]
    pub mqtt_signing_key_file: Option<PathBuf>,
    #[arg(long, env = "DNS_MINIMISER_MQTT_CA_FILE")]
    pub mqtt_ca_file: Option<PathBuf>,
    #[arg(long, env = "DNS_MINIMISER_MQTT_CLIENT_CERT_FILE")]
    pub mqtt_client_cert_file: Option<PathBuf>,
    #[arg(long, env = "DNS_MINIMISER_MQTT_CLIENT_KEY_FILE")]
    pub mqtt_client_key_file: Option<PathBuf>,

    #[arg(long, env = "DNS_MINIMISER_INPUT_UNIX")]
    pub input_unix: Option<PathBuf>,
    #[arg(long, env = "DNS_MINIMISER_INPUT_TCP")]
    pub input_tcp: Option<SocketAddr>,
    #[arg(long, env = "DNS_MINIMISER_INPUT_TLS")]
    pub input_tls: Option<SocketAddr>,
    #[arg(long, env = "DNS_MINIMISER_INPUT_TLS_CERT_FILE")]
    pub input_tls_cert_file: Option<PathBuf>,
    #[arg(long, env = "DNS_MINIMISER_INPUT_TLS_KEY_FILE")]
    pub input_tls_key_file: Option<PathBuf>,
    #[arg(long, env = "DNS_MINIMISER_INPUT_TLS_CA_FILE")]
    pub input_tls_ca_file: Option<PathBuf>,

    #[arg(long, env = "DNS_MINIMISER_METRICS_ADDR", default_value = "127.0.0.1:2112")]
    pub metrics_addr: String,
}

/// Mirrors `CliArgs`, all-optional, deserialised from the TOML config
/// file. Field names match the file's keys.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
struct FileConfig {
    cryptopan_key: Option<String>,
    cryptopan_key_salt: Option<String>,
    cryptopan_key_file: Option<PathBuf>,
    cryptopan_address_entries: Option<usize>,
    data_dir: Option<PathBuf>,
    well_known_domains: Option<PathBuf>,
    ignored_client_ip_file: Option<PathBuf>,
    qname_seen_entries: Option<usize>,
    new_qname_buffer: Option<usize>,
    minimiser_workers: Option<usize>,
    disable_session_files: Option<bool>,
    disable_histogram_sender: Option<bool>,
    disable_mqtt: Option<bool>,
    http_url: Option<String>,
    http_signing_key_id: Option<String>,
    http_signing_key_file: Option<PathBuf>,
    http_ca_file: Option<PathBuf>,
    http_client_cert_file: Option<PathBuf>,
    http_client_key_file: Option<PathBuf>,
    mqtt_server: Option<String>,
    mqtt_client_id: Option<String>,
    mqtt_topic: Option<String>,
    mqtt_keepalive_secs: Option<u64>,
    mqtt_signing_key_id: Option<String>,
    mqtt_signing_key_file: Option<PathBuf>,
    mqtt_ca_file: Option<PathBuf>,
    mqtt_client_cert_file: Option<PathBuf>,
    mqtt_client_key_file: Option<PathBuf>,
    input_unix: Option<PathBuf>,
    input_tcp: Option<SocketAddr>,
    input_tls: Option<SocketAddr>,
    input_tls_cert_file: Option<PathBuf>,
    input_tls_key_file: Option<PathBuf>,
    input_tls_ca_file: Option<PathBuf>,
}

/// The resolved, fully-defaulted configuration the rest of the crate
/// runs with.
#[derive(Debug, Clone)]
pub struct Config {
    pub cryptopan_key: String,
    pub cryptopan_key_salt: String,
    /// When set, the passphrase is read from this file instead of
    /// `cryptopan_key`, and reloaded whenever the file changes.
    pub cryptopan_key_file: Option<PathBuf>,
    pub cryptopan_address_entries: usize,
    pub data_dir: PathBuf,
    pub well_known_domains: PathBuf,
    pub ignored_client_ip_file: Option<PathBuf>,
    pub qname_seen_entries: usize,
    pub new_qname_buffer: usize,
    pub minimiser_workers: usize,
    pub disable_session_files: bool,
    pub disable_histogram_sender: bool,
    pub disable_mqtt: bool,
    pub http_url: Option<String>,
    pub http_signing_key_id: Option<String>,
    pub http_signing_key_file: Option<PathBuf>,
    pub http_ca_file: Option<PathBuf>,
    pub http_client_cert_file: Option<PathBuf>,
    pub http_client_key_file: Option<PathBuf>,
    pub mqtt_server: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_topic: String,
    pub mqtt_keepalive: Duration,
    pub mqtt_signing_key_id: Option<String>,
    pub mqtt_signing_key_file: Option<PathBuf>,
    pub mqtt_ca_file: Option<PathBuf>,
    pub mqtt_client_cert_file: Option<PathBuf>,
    pub mqtt_client_key_file: Option<PathBuf>,
    pub input_unix: Option<PathBuf>,
    pub input_tcp: Option<SocketAddr>,
    pub input_tls: Option<SocketAddr>,
    pub input_tls_cert_file: Option<PathBuf>,
    pub input_tls_key_file: Option<PathBuf>,
    pub input_tls_ca_file: Option<PathBuf>,
    pub metrics_addr: String,
}

macro_rules! resolve {
    ($cli:expr, $file:expr, $default:expr) => {
        $cli.or($file).unwrap_or($default)
    };
}

impl Config {
    pub fn load() -> Result<Self> {
        let cli = CliArgs::parse();
        Self::resolve(cli)
    }

    fn resolve(cli: CliArgs) -> Result<Self> {
        let file = match &cli.config_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str::<FileConfig>(&text)?
            }
            None => FileConfig::default(),
        };

        let cryptopan_key = cli
            .cryptopan_key
            .or(file.cryptopan_key)
            .ok_or_else(|| Error::Config("cryptopan-key is required".into()))?;
        let cryptopan_key_salt = cli
            .cryptopan_key_salt
            .or(file.cryptopan_key_salt)
            .ok_or_else(|| Error::Config("cryptopan-key-salt is required".into()))?;
        let data_dir = cli.data_dir.or(file.data_dir).ok_or_else(|| Error::Config("data-dir is required".into()))?;
        let well_known_domains = cli
            .well_known_domains
            .or(file.well_known_domains)
            .ok_or_else(|| Error::Config("well-known-domains is required".into()))?;

        let input_unix = cli.input_unix.or(file.input_unix);
        let input_tcp = cli.input_tcp.or(file.input_tcp);
        let input_tls = cli.input_tls.or(file.input_tls);
        let input_count = [input_unix.is_some(), input_tcp.is_some(), input_tls.is_some()].iter().filter(|b| **b).count();
        if input_count != 1 {
            return Err(Error::Config("exactly one of input-unix, input-tcp, input-tls must be set".into()));
        }

        Ok(Config {
            cryptopan_key,
            cryptopan_key_salt,
            cryptopan_key_file: cli.cryptopan_key_file.or(file.cryptopan_key_file),
            cryptopan_address_entries: resolve!(cli.cryptopan_address_entries, file.cryptopan_address_entries, 1_000_000),
            data_dir,
            well_known_domains,
            ignored_client_ip_file: cli.ignored_client_ip_file.or(file.ignored_client_ip_file),
            qname_seen_entries: resolve!(cli.qname_seen_entries, file.qname_seen_entries, 1_000_000),
            new_qname_buffer: resolve!(cli.new_qname_buffer, file.new_qname_buffer, 10_000),
            minimiser_workers: resolve!(cli.minimiser_workers, file.minimiser_workers, num_cpus_fallback()),
            disable_session_files: cli.disable_session_files || file.disable_session_files.unwrap_or(false),
            disable_histogram_sender: cli.disable_histogram_sender || file.disable_histogram_sender.unwrap_or(false),
            disable_mqtt: cli.disable_mqtt || file.disable_mqtt.unwrap_or(false),
            http_url: cli.http_url.or(file.http_url),
            http_signing_key_id: cli.http_signing_key_id.or(file.http_signing_key_id),
            http_signing_key_file: cli.http_signing_key_file.or(file.http_signing_key_file),
            http_ca_file: cli.http_ca_file.or(file.http_ca_file),
            http_client_cert_file: cli.http_client_cert_file.or(file.http_client_cert_file),
            http_client_key_file: cli.http_client_key_file.or(file.http_client_key_file),
            mqtt_server: cli.mqtt_server.or(file.mqtt_server),
            mqtt_client_id: resolve!(cli.mqtt_client_id, file.mqtt_client_id, "dns-minimiser".to_string()),
            mqtt_topic: resolve!(cli.mqtt_topic, file.mqtt_topic, "dns-minimiser/new-name".to_string()),
            mqtt_keepalive: Duration::from_secs(resolve!(cli.mqtt_keepalive_secs, file.mqtt_keepalive_secs, 30)),
            mqtt_signing_key_id: cli.mqtt_signing_key_id.or(file.mqtt_signing_key_id),
            mqtt_signing_key_file: cli.mqtt_signing_key_file.or(file.mqtt_signing_key_file),
            mqtt_ca_file: cli.mqtt_ca_file.or(file.mqtt_ca_file),
            mqtt_client_cert_file: cli.mqtt_client_cert_file.or(file.mqtt_client_cert_file),
            mqtt_client_key_file: cli.mqtt_client_key_file.or(file.mqtt_client_key_file),
            input_unix,
            input_tcp,
            input_tls,
            input_tls_cert_file: cli.input_tls_cert_file.or(file.input_tls_cert_file),
            input_tls_key_file: cli.input_tls_key_file.or(file.input_tls_key_file),
            input_tls_ca_file: cli.input_tls_ca_file.or(file.input_tls_ca_file),
            metrics_addr: cli.metrics_addr,
        })
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_input_sources() {
        let cli = CliArgs::parse_from([
            "dns-minimiser",
            "--cryptopan-key",
            "k",
            "--cryptopan-key-salt",
            "s",
            "--data-dir",
            "/tmp/data",
            "--well-known-domains",
            "/tmp/dict.fst",
        ]);
        assert!(Config::resolve(cli).is_err());
    }

    #[test]
    fn resolves_with_one_input_source() {
        let cli = CliArgs::parse_from([
            "dns-minimiser",
            "--cryptopan-key",
            "k",
            "--cryptopan-key-salt",
            "s",
            "--data-dir",
            "/tmp/data",
            "--well-known-domains",
            "/tmp/dict.fst",
            "--input-unix",
            "/tmp/dnstap.sock",
        ]);
        let config = Config::resolve(cli).unwrap();
        assert_eq!(config.input_unix, Some(PathBuf::from("/tmp/dnstap.sock")));
        assert_eq!(config.mqtt_client_id, "dns-minimiser");
    }
}
