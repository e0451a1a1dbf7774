use hexforge_engine::{Engine, RunOutcome, Scheduler};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerCommand {
    Schedule { node_id: String, fires_at_ms: i64 },
    Cancel { node_id: String },
}

/// Push path: forwards registrations to the task running [`run_timers`].
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<TimerCommand>,
}

impl TokioScheduler {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TimerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, node_id: &str, fires_at_ms: i64) {
        // A closed channel means the driver is gone; the sweep still covers the node.
        let _ = self.tx.send(TimerCommand::Schedule {
            node_id: node_id.to_string(),
            fires_at_ms,
        });
    }

    fn cancel(&self, node_id: &str) {
        let _ = self.tx.send(TimerCommand::Cancel {
            node_id: node_id.to_string(),
        });
    }
}

/// Owns one sleeping task per node; a new registration replaces the old one.
pub async fn run_timers(engine: Engine, mut rx: mpsc::UnboundedReceiver<TimerCommand>) {
    let mut timers: HashMap<String, JoinHandle<()>> = HashMap::new();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            TimerCommand::Schedule {
                node_id,
                fires_at_ms,
            } => {
                if let Some(old) = timers.remove(&node_id) {
                    old.abort();
                }
                let delay = u64::try_from(fires_at_ms.saturating_sub(engine.now())).unwrap_or(0);
                let handle = tokio::spawn(fire_after(
                    engine.clone(),
                    node_id.clone(),
                    Duration::from_millis(delay),
                ));
                timers.insert(node_id, handle);
            }
            TimerCommand::Cancel { node_id } => {
                if let Some(old) = timers.remove(&node_id) {
                    old.abort();
                }
            }
        }
        timers.retain(|_, h| !h.is_finished());
    }
    for (_, h) in timers {
        h.abort();
    }
}

async fn fire_after(engine: Engine, node_id: String, delay: Duration) {
    tokio::time::sleep(delay).await;
    // The handler may re-register this node, which aborts this task; the
    // blocking completion itself still runs to the end.
    let res = tokio::task::spawn_blocking(move || {
        let out = engine.complete_run(&node_id);
        match &out {
            Ok(RunOutcome::NotDue { completes_at }) => {
                debug!(node_id = %node_id, completes_at, "push timer fired early")
            }
            Ok(outcome) => debug!(node_id = %node_id, ?outcome, "push timer fired"),
            Err(err) => warn!(node_id = %node_id, error = %err, "push completion failed"),
        }
    })
    .await;
    if let Err(err) = res {
        warn!(error = %err, "push completion task panicked");
    }
}
