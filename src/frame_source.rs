//! Frame source: exactly one of a Unix
//! domain socket, plain TCP, or mutually-authenticated TLS listener,
//! decoding Frame Streams' big-endian 4-byte length-prefixed payloads and
//! feeding them into the bounded input queue the minimiser workers pull
//! from.
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::metrics::Metrics;

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder().big_endian().length_field_length(4).new_codec()
}

async fn pump<S>(framed: Framed<S, LengthDelimitedCodec>, frame_tx: mpsc::Sender<Vec<u8>>, metrics: Metrics)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    tokio::pin!(framed);
    loop {
        match tokio::time::timeout(RECEIVE_TIMEOUT, framed.next()).await {
            Ok(Some(Ok(bytes))) => {
                if frame_tx.send(bytes.to_vec()).await.is_err() {
                    return;
                }
            }
            Ok(Some(Err(_))) | Ok(None) => return,
            Err(_) => {
                metrics.decode_failures_total.inc();
                return;
            }
        }
    }
}

async fn run_unix(path: &Path, frame_tx: mpsc::Sender<Vec<u8>>, metrics: Metrics, cancel: CancellationToken) -> Result<()> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let framed = Framed::new(stream, codec());
                tokio::spawn(pump(framed, frame_tx.clone(), metrics.clone()));
            }
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

async fn run_tcp(addr: SocketAddr, frame_tx: mpsc::Sender<Vec<u8>>, metrics: Metrics, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let framed = Framed::new(stream, codec());
                tokio::spawn(pump(framed, frame_tx.clone(), metrics.clone()));
            }
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

async fn run_tls(
    addr: SocketAddr,
    acceptor: TlsAcceptor,
    frame_tx: mpsc::Sender<Vec<u8>>,
    metrics: Metrics,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let acceptor = acceptor.clone();
                let frame_tx = frame_tx.clone();
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    if let Ok(tls_stream) = acceptor.accept(stream).await {
                        let framed = Framed::new(tls_stream, codec());
                        pump(framed, frame_tx, metrics).await;
                    }
                });
            }
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

fn load_tls_acceptor(cert_file: &Path, key_file: &Path, ca_file: &Path) -> Result<TlsAcceptor> {
    let cert_pem = std::fs::read(cert_file)?;
    let key_pem = std::fs::read(key_file)?;
    let ca_pem = std::fs::read(ca_file)?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_pem.as_slice()).collect::<std::result::Result<_, _>>()?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())?
        .ok_or_else(|| crate::error::Error::Config("no private key found in input-tls-key-file".into()))?;

    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
        roots.add(cert?)?;
    }
    let client_auth = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots)).build().map_err(|e| {
        crate::error::Error::Config(format!("building client certificate verifier: {e}"))
    })?;

    let server_config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_auth)
        .with_single_cert(certs, key)
        .map_err(|e| crate::error::Error::Config(format!("building TLS server config: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Runs whichever single input source the config selected; validation at
/// load time guarantees exactly one of the three is set.
pub async fn run(config: &Config, frame_tx: mpsc::Sender<Vec<u8>>, metrics: Metrics, cancel: CancellationToken) -> Result<()> {
    if let Some(path) = &config.input_unix {
        return run_unix(path, frame_tx, metrics, cancel).await;
    }
    if let Some(addr) = config.input_tcp {
        return run_tcp(addr, frame_tx, metrics, cancel).await;
    }
    if let Some(addr) = config.input_tls {
        let cert_file = config
            .input_tls_cert_file
            .as_deref()
            .ok_or_else(|| crate::error::Error::Config("input-tls requires input-tls-cert-file".into()))?;
        let key_file = config
            .input_tls_key_file
            .as_deref()
            .ok_or_else(|| crate::error::Error::Config("input-tls requires input-tls-key-file".into()))?;
        let ca_file = config
            .input_tls_ca_file
            .as_deref()
            .ok_or_else(|| crate::error::Error::Config("input-tls requires input-tls-ca-file".into()))?;
        let acceptor = load_tls_acceptor(cert_file, key_file, ca_file)?;
        return run_tls(addr, acceptor, frame_tx, metrics, cancel).await;
    }
    Err(crate::error::Error::Config("no input source configured".into()))
}
