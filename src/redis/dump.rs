//! Dump-signal listener.
//!
//! The producer flips per-kind entries in the `icinga:dump` hash to `wip`
//! while it reserialises its configuration, then back to `done`. Sync must
//! not start while any entry is `wip`, and a dump beginning mid-sync
//! invalidates everything read so far.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{RedisClient, DUMP_KEY};
use crate::error::Error;
use crate::Result;

/// Poll period for the dump-state hash.
const POLL_PERIOD: Duration = Duration::from_secs(1);

/// Observed dump state with an edge trigger for newly started dumps.
pub struct DumpSignals {
    wip: watch::Receiver<bool>,
    in_progress: CancellationToken,
}

impl DumpSignals {
    /// Start the listener under the given scope.
    pub fn start(
        client: RedisClient,
        token: CancellationToken,
    ) -> (DumpSignals, JoinHandle<Result<()>>) {
        let (tx, rx) = watch::channel(false);
        let in_progress = CancellationToken::new();
        let edge = in_progress.clone();

        let handle = tokio::spawn(async move {
            let mut baseline: Option<bool> = None;

            loop {
                let state = tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    state = client.hgetall(&token, DUMP_KEY) => state?,
                };
                let wip = state.values().any(|v| v == "wip");

                match baseline {
                    None => {
                        baseline = Some(wip);
                        if wip {
                            info!("Producer config dump already in progress");
                        }
                    }
                    Some(previous) => {
                        if wip && !previous {
                            // A new dump began after we started watching.
                            info!("Producer started a new config dump");
                            edge.cancel();
                        }
                        baseline = Some(wip);
                    }
                }

                let _ = tx.send(wip);
                debug!(wip, "Dump state polled");

                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(POLL_PERIOD) => {}
                }
            }
        });

        (DumpSignals { wip: rx, in_progress }, handle)
    }

    /// Resolves once no dump is in progress. Gates initial sync startup.
    pub async fn wait_done(&self) -> Result<()> {
        let mut rx = self.wip.clone();
        // The listener publishes at least one observation before long.
        while *rx.borrow() {
            rx.changed().await.map_err(|_| Error::Cancelled)?;
        }
        Ok(())
    }

    /// Token fired the first time a new dump begins after the listener
    /// started. Subscribers cancel their scope when it fires.
    pub fn in_progress(&self) -> CancellationToken {
        self.in_progress.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The listener itself needs live Redis; the edge/gate mechanics are
    // exercised through the watch/token plumbing they are built on.

    #[tokio::test]
    async fn wait_done_passes_when_no_dump_runs() {
        let (tx, rx) = watch::channel(false);
        let signals = DumpSignals {
            wip: rx,
            in_progress: CancellationToken::new(),
        };
        signals.wait_done().await.unwrap();
        drop(tx);
    }

    #[tokio::test]
    async fn wait_done_blocks_until_done() {
        let (tx, rx) = watch::channel(true);
        let signals = DumpSignals {
            wip: rx,
            in_progress: CancellationToken::new(),
        };

        let waiter = tokio::spawn(async move { signals.wait_done().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tx.send(false).unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_done_surfaces_listener_shutdown() {
        let (tx, rx) = watch::channel(true);
        let signals = DumpSignals {
            wip: rx,
            in_progress: CancellationToken::new(),
        };
        drop(tx);
        assert!(signals.wait_done().await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn in_progress_token_is_shared() {
        let token = CancellationToken::new();
        let (_, rx) = watch::channel(false);
        let signals = DumpSignals {
            wip: rx,
            in_progress: token.clone(),
        };

        let subscriber = signals.in_progress();
        assert!(!subscriber.is_cancelled());
        token.cancel();
        assert!(subscriber.is_cancelled());
    }
}
