// agent/src/sys/refresher.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::DiscoveryHints;
use crate::sys::logs::AgentLog;
use crate::sys::traits::EnvironmentProvider;
use crate::sys::volatile::VolatileStore;

/// Handle on the background environment refresher.
pub struct RefresherHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RefresherHandle {
    /// Cooperative shutdown: the loop observes the signal at the top of its
    /// next iteration, never in the middle of a refresh.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

pub fn spawn_refresher(
    provider: Arc<dyn EnvironmentProvider>,
    hints: DiscoveryHints,
    store: Arc<VolatileStore>,
    period: Duration,
    log: AgentLog,
) -> RefresherHandle {
    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run(provider, hints, store, period, log, stop_rx));
    RefresherHandle { stop, task }
}

async fn run(
    provider: Arc<dyn EnvironmentProvider>,
    hints: DiscoveryHints,
    store: Arc<VolatileStore>,
    period: Duration,
    log: AgentLog,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => {}
            _ = ticker.tick() => {}
        }
        // A dropped handle counts as a stop request.
        if *stop.borrow() || stop.has_changed().is_err() {
            break;
        }
        refresh_once(provider.as_ref(), &hints, &store, &log).await;
    }
    log.debug("leaving environment refresher");
}

/// One unit of work: sample, then apply under the store lock. Returns the
/// drift verdict, or `None` when sampling failed.
pub async fn refresh_once(
    provider: &dyn EnvironmentProvider,
    hints: &DiscoveryHints,
    store: &VolatileStore,
    log: &AgentLog,
) -> Option<bool> {
    log.info("refreshing agent environment");
    match provider.sample(hints).await {
        Ok(snapshot) => {
            let changed = store.apply(snapshot);
            if changed {
                log.info("agent environment has changed");
            }
            Some(changed)
        }
        Err(e) => {
            log.error(format!("error obtaining new agent context: {}", e));
            None
        }
    }
}
