//! Periodic job scheduling.

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Run `job` every `period` until shutdown.
///
/// The job runs inline, so a cycle that overruns its tick delays the next
/// one instead of overlapping it. The first tick fires immediately.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tracing::info!(job = name, interval_secs = period.as_secs(), "Periodic job starting");

        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    job().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!(job = name, "Periodic job received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    })
}
