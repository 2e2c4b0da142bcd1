//! Error types. `DNSError`/`DNSResult` are the original wire-decode
//! error (kept as-is, since `dns_derive`'s generated code names `DNSResult`
//! literally and expects it in scope); `Error`/`Result` is the crate-wide
//! error every other component returns, wrapping `DNSError` and every
//! external collaborator's error type.
use std::io;
use std::str;

#[derive(Debug)]
pub enum DNSError {
    Io(io::Error),
    FromUtf8(std::string::FromUtf8Error),
    Utf8(str::Utf8Error),
    DNS(String),
    DNSInternalError(InternalError),
}

#[derive(Debug)]
pub enum InternalError {
    DnsDomainNameTooLong,
    EmptyDomainName,
    InvalidQuestionCount,
}

impl DNSError {
    pub fn new(s: &str) -> Self {
        DNSError::DNS(String::from(s))
    }
}

impl std::fmt::Display for DNSError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for DNSError {}

/// A specific custom `Result` for wire (de)serialisation functions.
pub type DNSResult<T> = Result<T, DNSError>;

impl From<io::Error> for DNSError {
    fn from(err: io::Error) -> Self {
        DNSError::Io(err)
    }
}

impl From<String> for DNSError {
    fn from(err: String) -> Self {
        DNSError::DNS(err)
    }
}

impl From<std::string::FromUtf8Error> for DNSError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        DNSError::FromUtf8(err)
    }
}

impl From<str::Utf8Error> for DNSError {
    fn from(err: str::Utf8Error) -> Self {
        DNSError::Utf8(err)
    }
}

/// Crate-wide error. Every long-running component (tracker, collector,
/// writers, sender, publisher, config watcher) returns this.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("DNS wire decode error: {0}")]
    Dns(#[from] DNSError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("durable store error: {0}")]
    Sled(#[from] sled::Error),

    #[error("well-known dictionary error: {0}")]
    Fst(#[from] fst::Error),

    #[error("parquet encode error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid HTTP header value: {0}")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    MqttConnection(#[from] rumqttc::ConnectionError),

    #[error("JSON (de)serialisation error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JWS signing error: {0}")]
    Jws(#[from] jsonwebtoken::errors::Error),

    #[error("ECDSA error: {0}")]
    Ecdsa(#[from] p256::ecdsa::Error),

    #[error("key derivation error: {0}")]
    Kdf(String),

    #[error("pseudonymisation error: {0}")]
    Anonymise(String),

    #[error("file watch error: {0}")]
    Notify(#[from] notify::Error),

    #[error("invalid network prefix: {0}")]
    Ipnet(#[from] ipnet::AddrParseError),

    #[error("cardinality sketch (de)serialisation error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
