//! Process-wide stop signal shared by the dispatcher and background loops.

use tokio::sync::watch;

/// New stop signal; `true` means stop.
#[must_use]
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolve once stop is signalled or the sender is gone.
pub async fn wait_for(rx: &mut watch::Receiver<bool>) {
    // A dropped sender means nobody can ask us to keep running.
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Signal stop on SIGINT or SIGTERM.
pub async fn listen_for_signals(tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl-C"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
    let _ = tx.send(true);
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::wildcard_imports)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_for_returns_after_stop() {
        let (tx, mut rx) = channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send(true).unwrap();
        });
        tokio::time::timeout(Duration::from_secs(5), wait_for(&mut rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_returns_when_sender_dropped() {
        let (tx, mut rx) = channel();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), wait_for(&mut rx))
            .await
            .unwrap();
    }
}
