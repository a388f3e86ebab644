//! Process-wide heartbeat and rate-limit tick.
//!
//! One scheduler instance serves every live connection. It starts lazily on
//! the first connection's registration and its tick loop exits once the
//! registry empties, so a process with no open connections runs no
//! background task at all.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tokio::sync::Mutex;
use tokio::time::interval;

use crate::options::CloseCode;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const TICK_PERIOD: Duration = Duration::from_secs(1);

/// What the scheduler needs from a connection to tick it: whether it's owed
/// a ping or a forced close, and a reset hook for its rate-limit counters.
///
/// Implemented by the connection core; kept as a trait object here so the
/// scheduler doesn't need to be generic over the connection's stream type.
pub(crate) trait SchedulerTarget: Send + Sync {
    fn unanswered_pings(&self) -> u64;
    fn send_ping(&self) -> BoxFuture<'_, ()>;
    fn force_close(&self, code: CloseCode, reason: String) -> BoxFuture<'_, ()>;
    fn reset_throttle(&self);
}

struct Entry {
    target: std::sync::Arc<dyn SchedulerTarget>,
    expires_at: Instant,
    heartbeat_period: Duration,
    queued_ping_limit: u32,
}

pub(crate) struct Scheduler {
    registry: Mutex<IndexMap<u64, Entry>>,
}

impl Scheduler {
    fn new() -> Self {
        Self {
            registry: Mutex::new(IndexMap::new()),
        }
    }

    pub(crate) async fn register(
        &self,
        id: u64,
        target: std::sync::Arc<dyn SchedulerTarget>,
        heartbeat_period: Duration,
        queued_ping_limit: u32,
    ) {
        let mut registry = self.registry.lock().await;
        registry.insert(
            id,
            Entry {
                target,
                expires_at: Instant::now() + heartbeat_period,
                heartbeat_period,
                queued_ping_limit,
            },
        );
    }

    pub(crate) async fn deregister(&self, id: u64) {
        let mut registry = self.registry.lock().await;
        registry.shift_remove(&id);
    }

    /// Marks `id` as having just seen activity: moves it to the back of the
    /// insertion order with a refreshed expiry, so the oldest-first walk in
    /// `tick` sees it last.
    pub(crate) async fn touch(&self, id: u64) {
        let mut registry = self.registry.lock().await;
        if let Some(mut entry) = registry.shift_remove(&id) {
            entry.expires_at = Instant::now() + entry.heartbeat_period;
            registry.insert(id, entry);
        }
    }

    async fn tick(&self) {
        let now = Instant::now();
        let ids: Vec<u64> = {
            let registry = self.registry.lock().await;
            for entry in registry.values() {
                entry.target.reset_throttle();
            }
            registry.keys().copied().collect()
        };

        for id in ids {
            let action = {
                let registry = self.registry.lock().await;
                match registry.get(&id) {
                    None => continue,
                    Some(entry) => {
                        if entry.expires_at > now {
                            continue;
                        }
                        let unanswered = entry.target.unanswered_pings();
                        if unanswered > entry.queued_ping_limit as u64 {
                            Action::Close(entry.target.clone())
                        } else {
                            Action::Ping(entry.target.clone(), entry.heartbeat_period)
                        }
                    }
                }
            };

            match action {
                Action::Close(target) => {
                    target
                        .force_close(
                            CloseCode::POLICY_VIOLATION,
                            "Exceeded unanswered PING limit".to_string(),
                        )
                        .await;
                    self.deregister(id).await;
                }
                Action::Ping(target, period) => {
                    target.send_ping().await;
                    self.touch_with_period(id, period).await;
                }
            }
        }
    }

    async fn touch_with_period(&self, id: u64, period: Duration) {
        let mut registry = self.registry.lock().await;
        if let Some(mut entry) = registry.shift_remove(&id) {
            entry.expires_at = Instant::now() + period;
            registry.insert(id, entry);
        }
    }

    async fn is_empty(&self) -> bool {
        self.registry.lock().await.is_empty()
    }
}

enum Action {
    Close(std::sync::Arc<dyn SchedulerTarget>),
    Ping(std::sync::Arc<dyn SchedulerTarget>, Duration),
}

static GLOBAL: StdMutex<Option<Weak<Scheduler>>> = StdMutex::new(None);

/// Returns the live scheduler, spawning a fresh one (and its tick task) if
/// none is currently running.
pub(crate) fn acquire() -> std::sync::Arc<Scheduler> {
    let mut guard = GLOBAL.lock().unwrap();
    if let Some(weak) = guard.as_ref() {
        if let Some(scheduler) = weak.upgrade() {
            return scheduler;
        }
    }

    let scheduler = std::sync::Arc::new(Scheduler::new());
    *guard = Some(std::sync::Arc::downgrade(&scheduler));
    drop(guard);

    let weak = std::sync::Arc::downgrade(&scheduler);
    tokio::spawn(async move {
        let mut ticker = interval(TICK_PERIOD);
        loop {
            ticker.tick().await;
            let Some(scheduler) = weak.upgrade() else {
                return;
            };
            scheduler.tick().await;
            if scheduler.is_empty().await {
                return;
            }
        }
    });

    scheduler
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct FakeTarget {
        pings_sent: AtomicU64,
        closed: StdMutex<Option<CloseCode>>,
        pongs: AtomicU64,
    }

    impl SchedulerTarget for FakeTarget {
        fn unanswered_pings(&self) -> u64 {
            self.pings_sent.load(Ordering::SeqCst) - self.pongs.load(Ordering::SeqCst)
        }
        fn send_ping(&self) -> BoxFuture<'_, ()> {
            self.pings_sent.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
        fn force_close(&self, code: CloseCode, _reason: String) -> BoxFuture<'_, ()> {
            *self.closed.lock().unwrap() = Some(code);
            Box::pin(async {})
        }
        fn reset_throttle(&self) {}
    }

    #[tokio::test]
    async fn expired_entry_receives_a_ping_and_is_reinserted() {
        let scheduler = Scheduler::new();
        let target = Arc::new(FakeTarget {
            pings_sent: AtomicU64::new(0),
            closed: StdMutex::new(None),
            pongs: AtomicU64::new(0),
        });
        scheduler
            .register(1, target.clone(), Duration::from_secs(0), 3)
            .await;

        scheduler.tick().await;

        assert_eq!(target.pings_sent.load(Ordering::SeqCst), 1);
        assert!(target.closed.lock().unwrap().is_none());
        assert!(!scheduler.is_empty().await);
    }

    #[tokio::test]
    async fn exceeding_unanswered_ping_limit_forces_close_and_deregisters() {
        let scheduler = Scheduler::new();
        let target = Arc::new(FakeTarget {
            pings_sent: AtomicU64::new(5),
            closed: StdMutex::new(None),
            pongs: AtomicU64::new(0),
        });
        scheduler
            .register(1, target.clone(), Duration::from_secs(0), 2)
            .await;

        scheduler.tick().await;

        assert_eq!(target.closed.lock().unwrap().unwrap(), CloseCode::POLICY_VIOLATION);
        assert!(scheduler.is_empty().await);
    }

    #[tokio::test]
    async fn touch_defers_expiry_past_the_tick() {
        let scheduler = Scheduler::new();
        let target = Arc::new(FakeTarget {
            pings_sent: AtomicU64::new(0),
            closed: StdMutex::new(None),
            pongs: AtomicU64::new(0),
        });
        scheduler
            .register(1, target.clone(), Duration::from_secs(60), 3)
            .await;
        scheduler.touch(1).await;

        scheduler.tick().await;

        assert_eq!(target.pings_sent.load(Ordering::SeqCst), 0);
    }
}
