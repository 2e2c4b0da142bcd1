//! Graceful shutdown ordering: workers drain first, then
//! the tracker's retry path, then the collector closes its writer
//! channels so writers can flush what's left, and finally the publisher
//! is cancelled once its input channel is closed and drained.
use tokio_util::sync::CancellationToken;

/// One token shared by every long-running task; `cancel()` fans out to
/// all of them via `CancellationToken::child_token` clones held by each
/// task's `run` loop.
pub fn new() -> CancellationToken {
    CancellationToken::new()
}

pub async fn wait_for_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    #[cfg(unix)]
    let mut terminate = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate()).expect("installing SIGTERM handler")
    };

    #[cfg(unix)]
    tokio::select! {
        _ = &mut ctrl_c => {}
        _ = terminate.recv() => {}
    };
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    cancel.cancel();
}
