//! Cooperative shutdown signaling
//!
//! A `watch` channel fans the shutdown flag out to every scheduler loop and
//! in-flight unit. The dispatcher listens for Ctrl-C/SIGTERM; worker
//! processes additionally treat EOF on stdin as a shutdown order, which is
//! how the dispatcher terminates them gracefully without signals.

use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::info;

/// Sending half of the shutdown flag
#[derive(Debug, Clone)]
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

/// Receiving half, cloned into every loop that must stop
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected controller/signal pair.
pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownController { tx }, ShutdownSignal { rx })
}

impl ShutdownController {
    /// Order every listener to stop. Idempotent.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl ShutdownSignal {
    /// Non-blocking check of the flag.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is ordered.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                // Controller dropped; treat as shutdown
                return;
            }
        }
    }
}

/// Trip the controller on Ctrl-C or SIGTERM.
pub fn spawn_signal_listener(controller: ShutdownController) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(_) => {
                        let _ = ctrl_c.await;
                        info!("Ctrl-C received, shutting down");
                        controller.trigger();
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => info!("Ctrl-C received, shutting down"),
                _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Ctrl-C received, shutting down");
        }

        controller.trigger();
    });
}

/// Trip the controller when stdin reaches EOF.
///
/// Worker processes are spawned with a piped stdin held open by the
/// dispatcher; the dispatcher closes its end to request a graceful stop.
pub fn spawn_stdin_watch(controller: ShutdownController) {
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 64];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        info!("Control pipe closed, shutting down");
        controller.trigger();
    });
}
