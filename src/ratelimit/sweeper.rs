//! Background eviction of idle limiter entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::invitation::InvitationLimiter;
use super::registry::KeyedLimiterRegistry;

/// Default time between sweep passes.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Something holding per-key state that can be swept.
pub trait Sweepable: Send + Sync {
    /// Name used in log output.
    fn name(&self) -> &str;

    /// Evict idle entries, returning how many were removed.
    fn sweep(&self) -> usize;
}

impl Sweepable for KeyedLimiterRegistry {
    fn name(&self) -> &str {
        KeyedLimiterRegistry::name(self)
    }

    fn sweep(&self) -> usize {
        KeyedLimiterRegistry::sweep(self)
    }
}

impl Sweepable for InvitationLimiter {
    fn name(&self) -> &str {
        "invitation"
    }

    fn sweep(&self) -> usize {
        InvitationLimiter::sweep(self)
    }
}

/// Periodically sweeps a fixed set of registries.
pub struct IdleSweeper {
    interval: Duration,
    targets: Vec<Arc<dyn Sweepable>>,
}

impl std::fmt::Debug for IdleSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.targets.iter().map(|t| t.name()).collect();
        f.debug_struct("IdleSweeper")
            .field("interval", &self.interval)
            .field("targets", &names)
            .finish()
    }
}

impl IdleSweeper {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            targets: Vec::new(),
        }
    }

    pub fn register(&mut self, target: Arc<dyn Sweepable>) {
        self.targets.push(target);
    }

    pub fn with_target(mut self, target: Arc<dyn Sweepable>) -> Self {
        self.register(target);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one pass over every target, returning the total evicted.
    pub fn sweep_now(&self) -> usize {
        let mut total = 0;
        for target in &self.targets {
            let removed = target.sweep();
            if removed > 0 {
                debug!(registry = target.name(), removed, "Swept idle limiters");
            }
            total += removed;
        }
        total
    }

    /// Spawn the sweep loop on the current tokio runtime.
    ///
    /// The first pass runs one interval after start.
    pub fn start(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                interval_secs = self.interval.as_secs(),
                targets = self.targets.len(),
                "Idle sweeper started"
            );

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("Idle sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = self.sweep_now();
                        if removed > 0 {
                            info!(removed, "Idle sweep pass complete");
                        }
                    }
                }
            }
        });

        SweeperHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running [`IdleSweeper`].
///
/// Dropping the handle without calling [`SweeperHandle::shutdown`] also stops
/// the loop, since the shutdown channel closes.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweep loop and wait for it to exit.
    pub async fn shutdown(self) {
        if let Some(tx) = self.shutdown_tx {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "Idle sweeper task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::bucket::BucketLimits;
    use crate::ratelimit::invitation::INVITATION_EXPIRATION;
    use crate::ratelimit::key::LimiterKey;
    use crate::ratelimit::registry::DEFAULT_IDLE_AFTER;

    fn registry(clock: &ManualClock) -> Arc<KeyedLimiterRegistry> {
        Arc::new(KeyedLimiterRegistry::new(
            "client",
            BucketLimits::new(1.0, 1.0).unwrap(),
            Arc::new(clock.clone()),
        ))
    }

    #[test]
    fn test_sweep_now_covers_all_targets() {
        let clock = ManualClock::new();
        let clients = registry(&clock);
        let invitations = Arc::new(InvitationLimiter::new(20, 5, Arc::new(clock.clone())).unwrap());

        clients.allow(&LimiterKey::client("10.0.0.1"));
        invitations.check_user("alice");
        invitations.check_org("acme");

        let sweeper = IdleSweeper::new(DEFAULT_SWEEP_INTERVAL)
            .with_target(clients.clone())
            .with_target(invitations.clone());

        assert_eq!(sweeper.sweep_now(), 0);

        clock.advance(DEFAULT_IDLE_AFTER + Duration::from_secs(1));
        assert_eq!(sweeper.sweep_now(), 1);
        assert!(clients.is_empty());
        assert_eq!(invitations.stats().user_limiters_count, 1);

        clock.advance(INVITATION_EXPIRATION);
        assert_eq!(sweeper.sweep_now(), 2);
        assert_eq!(invitations.stats().user_limiters_count, 0);
        assert_eq!(invitations.stats().org_limiters_count, 0);
    }

    #[test]
    fn test_swept_invitation_starts_full() {
        let clock = ManualClock::new();
        let invitations = Arc::new(InvitationLimiter::new(1, 5, Arc::new(clock.clone())).unwrap());
        let sweeper = IdleSweeper::new(DEFAULT_SWEEP_INTERVAL).with_target(invitations.clone());

        assert!(invitations.check_user("alice"));
        assert!(!invitations.check_user("alice"));

        clock.advance(INVITATION_EXPIRATION + Duration::from_secs(1));
        assert_eq!(sweeper.sweep_now(), 1);
        assert_eq!(invitations.user_remaining("alice"), 1);
        assert!(invitations.check_user("alice"));
    }

    #[tokio::test]
    async fn test_background_sweep_and_shutdown() {
        let clock = ManualClock::new();
        let clients = registry(&clock);
        clients.allow(&LimiterKey::client("10.0.0.1"));
        clock.advance(DEFAULT_IDLE_AFTER + Duration::from_secs(1));

        let handle = IdleSweeper::new(Duration::from_millis(10))
            .with_target(clients.clone())
            .start();

        for _ in 0..200 {
            if clients.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(clients.is_empty());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_handle_stops_loop() {
        let handle = IdleSweeper::new(Duration::from_millis(10)).start();
        let SweeperHandle { shutdown_tx, task } = handle;
        drop(shutdown_tx);
        task.await.unwrap();
    }
}
