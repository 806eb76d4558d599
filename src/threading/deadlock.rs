//! Stall detection for long polling loops.
//!
//! Rust can't capture the stack of another thread, so workers report what
//! they are doing to a [`ThreadRegistry`] and the watchdog dumps that instead.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// What a thread said it was doing, and since when.
#[derive(Debug, Clone)]
pub struct Activity {
    pub thread: String,
    pub label: String,
    pub since: Instant,
}

/// Shared map of live threads to their current activity.
#[derive(Debug, Clone, Default)]
pub struct ThreadRegistry {
    threads: Arc<Mutex<HashMap<ThreadId, Activity>>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the calling thread's activity.
    pub fn set(&self, label: impl Into<String>) {
        let current = thread::current();
        let activity = Activity {
            thread: current.name().unwrap_or("<unnamed>").to_string(),
            label: label.into(),
            since: Instant::now(),
        };
        self.threads.lock().unwrap().insert(current.id(), activity);
    }

    /// Forgets the calling thread.
    pub fn clear(&self) {
        self.threads.lock().unwrap().remove(&thread::current().id());
    }

    /// Every registered thread, sorted by name.
    pub fn snapshot(&self) -> Vec<Activity> {
        let mut list: Vec<_> = self.threads.lock().unwrap().values().cloned().collect();
        list.sort_by(|a, b| a.thread.cmp(&b.thread));
        list
    }

    fn dump(&self, stalled_for: Duration) -> String {
        let mut out = format!("No progress for {stalled_for:.1?}. Thread activity:");
        for activity in self.snapshot() {
            let _ = write!(
                out,
                "\n  {}: {} (for {:.1?})",
                activity.thread,
                activity.label,
                activity.since.elapsed()
            );
        }
        out
    }
}

struct Watch {
    last_ping: Instant,
    stopped: bool,
}

type Reporter = Box<dyn Fn(&str) + Send>;

const MIN_RECHECK: Duration = Duration::from_millis(1);

/// Watchdog expecting a [`DeadlockDetector::ping`] at least every `timeout`.
///
/// When pings stop it reports the registry once, then keeps checking at a
/// tenth of the timeout without reporting again until pings resume and stop
/// once more.
pub struct DeadlockDetector {
    shared: Arc<(Mutex<Watch>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl DeadlockDetector {
    /// Reports through `tracing::error!`.
    pub fn new(timeout: Duration, registry: ThreadRegistry) -> std::io::Result<Self> {
        Self::with_reporter(timeout, registry, |dump| {
            tracing::error!("Possible deadlock. {dump}");
        })
    }

    pub fn with_reporter(
        timeout: Duration,
        registry: ThreadRegistry,
        reporter: impl Fn(&str) + Send + 'static,
    ) -> std::io::Result<Self> {
        let shared = Arc::new((
            Mutex::new(Watch {
                last_ping: Instant::now(),
                stopped: false,
            }),
            Condvar::new(),
        ));

        let thread = {
            let shared = shared.clone();
            let reporter: Reporter = Box::new(reporter);
            thread::Builder::new()
                .name("deadlock-detector".to_string())
                .spawn(move || watch(&shared, timeout, &registry, &reporter))?
        };

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn ping(&self) {
        self.shared.0.lock().unwrap().last_ping = Instant::now();
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let (lock, cvar) = &*self.shared;
        lock.lock().unwrap().stopped = true;
        cvar.notify_all();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DeadlockDetector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn watch(
    shared: &(Mutex<Watch>, Condvar),
    timeout: Duration,
    registry: &ThreadRegistry,
    reporter: &Reporter,
) {
    let (lock, cvar) = shared;
    let recheck = (timeout / 10).max(MIN_RECHECK);
    let mut stale = false;
    let mut state = lock.lock().unwrap();

    while !state.stopped {
        let silent = state.last_ping.elapsed();

        if silent <= timeout {
            stale = false;
            state = cvar.wait_timeout(state, timeout - silent).unwrap().0;
            continue;
        }

        if !stale {
            stale = true;
            // Pings must not wait for the report.
            drop(state);
            reporter(&registry.dump(silent));
            state = lock.lock().unwrap();
            continue;
        }

        state = cvar.wait_timeout(state, recheck).unwrap().0;
    }
}
