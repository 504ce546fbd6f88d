//! Reconciliation loop driver.
//!
//! One loop per resource type. The loop awaits each pass inline, so a
//! resource never has two passes in flight; ticks that fire during a pass
//! are skipped rather than queued.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::error::{Error, Result};
use crate::metadata::{ChangeDetector, MetadataClient};

/// Why a pass was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// The metadata snapshot moved to a new version.
    Changed(String),
    /// The periodic resync timer fired.
    Resync,
}

/// A resource kept in sync with the cluster topology.
#[async_trait]
pub trait Reconciler: Send {
    fn name(&self) -> &'static str;

    /// Runs one snapshot, diff, apply pass.
    async fn reconcile(&mut self, trigger: &Trigger) -> Result<()>;
}

/// Drives `reconciler` for the lifetime of the process.
///
/// The metadata version is polled every `check_interval`; each change
/// starts a pass. With `resync` set, a pass is also started on that period
/// regardless of metadata changes.
pub async fn watch<R: Reconciler>(
    client: Arc<dyn MetadataClient>,
    check_interval: Duration,
    resync: Option<Duration>,
    mut reconciler: R,
) {
    info!(
        "Starting {} reconciler (check every {:?}, resync {:?})",
        reconciler.name(),
        check_interval,
        resync
    );
    let mut detector = ChangeDetector::default();
    let mut check = ticker(check_interval);
    let mut resync = resync.map(ticker);

    loop {
        let trigger = tokio::select! {
            _ = check.tick() => match client.get_version().await {
                Ok(version) if detector.observe(&version) => Trigger::Changed(version),
                Ok(_) => continue,
                Err(e) => {
                    warn!("{}: failed to poll metadata version: {}", reconciler.name(), e);
                    continue;
                }
            },
            _ = tick_opt(&mut resync) => Trigger::Resync,
        };
        run_pass(&mut reconciler, &trigger).await;
    }
}

/// Runs a single pass and logs its outcome.
pub async fn run_pass<R: Reconciler>(reconciler: &mut R, trigger: &Trigger) {
    debug!("{}: pass started by {:?}", reconciler.name(), trigger);
    match reconciler.reconcile(trigger).await {
        Ok(()) => debug!("{}: pass completed", reconciler.name()),
        Err(Error::Partial(agg)) => {
            warn!("{}: pass completed with errors: {}", reconciler.name(), agg)
        }
        Err(e) => error!("{}: pass failed: {}", reconciler.name(), e),
    }
}

fn ticker(period: Duration) -> Interval {
    let mut t = interval(period);
    t.set_missed_tick_behavior(MissedTickBehavior::Skip);
    t
}

async fn tick_opt(t: &mut Option<Interval>) {
    match t {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::metadata::fake::FakeMetadata;

    struct Recorder {
        triggers: Arc<Mutex<Vec<Trigger>>>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Reconciler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn reconcile(&mut self, trigger: &Trigger) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.triggers.lock().unwrap().push(trigger.clone());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn passes_run_on_version_change_and_resync_one_at_a_time() {
        let meta = Arc::new(FakeMetadata::default());
        *meta.version.lock().unwrap() = "v1".into();
        let triggers = Arc::new(Mutex::new(Vec::new()));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let recorder = Recorder {
            triggers: triggers.clone(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: max_in_flight.clone(),
        };

        let client: Arc<dyn MetadataClient> = meta.clone();
        let handle = tokio::spawn(watch(
            client,
            Duration::from_millis(10),
            Some(Duration::from_millis(100)),
            recorder,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        *meta.version.lock().unwrap() = "v2".into();
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.abort();

        let seen = triggers.lock().unwrap().clone();
        let changes: Vec<&Trigger> = seen
            .iter()
            .filter(|t| matches!(t, Trigger::Changed(_)))
            .collect();
        assert_eq!(
            changes,
            vec![
                &Trigger::Changed("v1".into()),
                &Trigger::Changed("v2".into())
            ]
        );
        assert!(seen.contains(&Trigger::Resync));
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }
}
