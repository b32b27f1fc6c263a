use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// A source of "now" for reconcilers.
///
/// All timestamp comparisons in the reconcilers go through a single
/// injected `Clock` so that tests can freeze and advance time deterministically
/// instead of racing the wall clock (see `kube_runtime::scheduler`'s use of
/// `tokio::time::{pause, advance}` for the equivalent idea applied to its
/// `DelayQueue`-based scheduler).
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock: the real wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock: holds a fixed instant that the test advances explicitly.
///
/// Mirrors `original_source`'s `freeze_time(...)` fixtures used throughout
/// `test_process_instances.py` / `test_process_runs.py`.
#[derive(Debug, Clone)]
pub struct TestClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    #[must_use]
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("TestClock mutex poisoned") = now;
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.now.lock().expect("TestClock mutex poisoned");
        *guard += delta;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("TestClock mutex poisoned")
    }
}
