use hexforge_engine::Engine;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSettings {
    pub interval: Duration,
    pub batch: usize,
    /// Stop pulling further batches in one tick once this much time has passed.
    pub budget: Duration,
}

/// Pull path: periodically run the completion handler for every due node,
/// in small batches so a burst of simultaneous completions cannot hog a tick.
pub async fn run_sweeper(engine: Engine, settings: SweepSettings) {
    let batch = settings.batch.max(1);
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let started = Instant::now();
        loop {
            let e = engine.clone();
            match tokio::task::spawn_blocking(move || e.sweep_due(batch)).await {
                Ok(Ok(report)) => {
                    if report.scanned > 0 {
                        debug!(?report, "sweep batch");
                    }
                    if report.scanned < batch || started.elapsed() >= settings.budget {
                        break;
                    }
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "sweep failed");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "sweep task panicked");
                    break;
                }
            }
            tokio::task::yield_now().await;
        }
    }
}
