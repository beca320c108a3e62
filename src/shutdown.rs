//! Process shutdown signalling.
//!
//! The dispatcher's listener, a node host's connection loop and the
//! statistics timers all watch one `CancellationToken` and drain when it
//! fires. In-flight jobs are not awaited: a dying node host simply drops its
//! connection and the dispatcher's retry machinery re-routes the work.

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Returns a token that is cancelled when the process receives SIGTERM or
/// SIGINT.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signalled = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        let received = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = received, "Shutting down");
        signalled.cancel();
    });

    token
}
