use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tracing::warn;

use jobmill_engine::EngineStopper;

#[derive(Debug)]
pub struct ShutdownController {
    forced: AtomicU8,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            forced: AtomicU8::new(0),
        }
    }

    pub fn bump_forced(&self) -> u8 {
        self.forced.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Install the SIGINT/SIGTERM handler. The first signal requests a graceful
/// stop; a repeat signal exits the process immediately.
pub fn spawn_signal_handler(shutdown: Arc<ShutdownController>, stopper: EngineStopper) {
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).ok();
        loop {
            let name = tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if res.is_err() {
                        return;
                    }
                    "SIGINT"
                }
                _ = async {
                    match sigterm.as_mut() {
                        Some(sig) => {
                            sig.recv().await;
                        }
                        None => std::future::pending().await,
                    }
                } => "SIGTERM",
            };

            let n = shutdown.bump_forced();
            if n == 1 {
                warn!(
                    "{name} received. Shutting down gracefully (send again to exit immediately)..."
                );
                stopper.request_stop();
            } else {
                warn!("{name} received again. Exiting immediately.");
                std::process::exit(130);
            }
        }
    });
}
