use std::process;

use tokio::sync::mpsc;
use tracing::{error, info};

/// Handle for graceful shutdown: Ctrl+C and SIGTERM resolve the same
/// channel, and in-flight work is allowed to drain before exit.
pub struct ShutdownManager {
    rx: mpsc::Receiver<()>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);

        let ctrl_c_tx = tx.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    let _ = ctrl_c_tx.send(()).await;
                }
                Err(err) => error!("error listening for ctrl+c: {err}"),
            }
        });

        #[cfg(unix)]
        {
            let term_tx = tx.clone();
            tokio::spawn(async move {
                let mut term_signal =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("failed to install SIGTERM handler");

                term_signal.recv().await;
                let _ = term_tx.send(()).await;
            });
        }

        ShutdownManager { rx }
    }

    /// Run the provided future to completion, or exit on a shutdown signal.
    pub async fn run_until_shutdown<F, T>(mut self, future: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            _ = self.rx.recv() => {
                info!("shutdown signal received");
                process::exit(0);
            }
            result = future => Some(result),
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
