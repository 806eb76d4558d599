use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::dispatch::{SchedulerApi, Task, TaskResult, TaskState, TriggeredShard};
use crate::error::{DispatchError, PoolError};
use crate::threading::{AutoRetryThreadPool, DeadlockDetector, PRIORITY_MED, TaskChannel, ThreadRegistry};

/// Longest uninterrupted sleep between polls, so a stop request is noticed.
const STOP_CHECK: Duration = Duration::from_millis(100);

/// How often a running task is polled: `initial + elapsed / ramp`, never
/// more than `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub ramp: f64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(15),
            ramp: 30.0,
        }
    }
}

impl PollPolicy {
    pub fn delay(&self, elapsed: Duration) -> Duration {
        (self.initial + elapsed.div_f64(self.ramp)).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct CollectOptions {
    /// Shards not done by then are given up on.
    pub timeout: Duration,
    pub poll: PollPolicy,
    /// Once set, no new polls start.
    pub should_stop: Arc<AtomicBool>,
    /// Shards polled at the same time.
    pub workers: usize,
    /// Reports the pollers' activity when no poll finished for this long.
    pub deadlock_timeout: Option<Duration>,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(80 * 60),
            poll: PollPolicy::default(),
            should_stop: Arc::new(AtomicBool::new(false)),
            workers: 16,
            deadlock_timeout: Some(Duration::from_secs(15 * 60)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardResult {
    pub shard_index: usize,
    pub task_id: String,
    pub state: TaskState,
    pub exit_code: Option<i64>,
    pub duration: Option<f64>,
    /// `None` when the output couldn't be fetched.
    pub output: Option<String>,
}

impl ShardResult {
    fn new(shard: &TriggeredShard, result: TaskResult, output: Option<String>) -> Self {
        Self {
            shard_index: shard.shard_index,
            task_id: shard.task_id.clone(),
            state: result.state,
            exit_code: result.exit_code,
            duration: result.duration,
            output,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectSummary {
    /// In completion order.
    pub results: Vec<ShardResult>,
    /// Shards that never finished, sorted.
    pub missing: Vec<usize>,
    /// First non-zero exit code among the results, else zero.
    pub exit_code: i64,
}

pub fn collect<S: SchedulerApi>(
    api: Arc<S>,
    shards: &[TriggeredShard],
    options: &CollectOptions,
) -> Result<CollectSummary, DispatchError> {
    collect_with(api, shards, options, |_| {})
}

/// Polls every shard until done, abandoned or out of time.
///
/// `on_result` sees each result as soon as it arrives. Shards without a
/// result end up in [`CollectSummary::missing`] and are reported as a
/// warning; they don't make the call fail.
pub fn collect_with<S, F>(
    api: Arc<S>,
    shards: &[TriggeredShard],
    options: &CollectOptions,
    mut on_result: F,
) -> Result<CollectSummary, DispatchError>
where
    S: SchedulerApi,
    F: FnMut(&ShardResult),
{
    if shards.is_empty() {
        return Ok(CollectSummary::default());
    }

    let deadline = Instant::now() + options.timeout;
    let registry = ThreadRegistry::new();

    let watchdog = match options.deadlock_timeout {
        Some(timeout) => Some(Arc::new(
            DeadlockDetector::new(timeout, registry.clone())
                .map_err(|err| DispatchError::Pool(PoolError::Spawn(err)))?,
        )),
        None => None,
    };

    let pool = AutoRetryThreadPool::<()>::new(
        "collect",
        1,
        options.workers.clamp(1, shards.len()),
        0,
        Some(registry.clone()),
    )?;
    let channel = TaskChannel::<Option<ShardResult>>::new();

    for shard in shards {
        let api = api.clone();
        let shard = shard.clone();
        let policy = options.poll;
        let should_stop = options.should_stop.clone();
        let watchdog = watchdog.clone();
        let registry = registry.clone();

        pool.add_task_with_channel(channel.sender(), PRIORITY_MED, move || {
            registry.set(format!("polling shard {} ({})", shard.shard_index, shard.task_id));
            let poller = Poller {
                policy,
                deadline,
                should_stop: should_stop.as_ref(),
                watchdog: watchdog.as_deref(),
            };
            Ok(poller.poll(&*api, &shard))
        })?;
    }

    let span = tracing::span!(Level::INFO, "collect");
    span.pb_set_length(shards.len() as u64);
    span.pb_set_style(&crate::utils::get_style_progress());
    span.pb_set_message("Collecting shards...");
    let _enter = span.enter();

    let mut summary = CollectSummary::default();

    for _ in shards {
        let result = match channel.pull(None) {
            Ok(message) => message,
            Err(err) => {
                tracing::error!("Lost track of a poller: {err}");
                break;
            }
        };
        span.pb_inc(1);

        if let Some(result) = result {
            on_result(&result);
            summary.results.push(result);
        }
    }

    summary.exit_code = summary
        .results
        .iter()
        .filter_map(|result| result.exit_code)
        .find(|&code| code != 0)
        .unwrap_or(0);

    let mut missing: Vec<usize> = shards
        .iter()
        .map(|shard| shard.shard_index)
        .filter(|index| {
            !summary
                .results
                .iter()
                .any(|result| result.shard_index == *index)
        })
        .collect();
    missing.sort_unstable();
    summary.missing = missing;

    if !summary.missing.is_empty() {
        let list: Vec<String> = summary.missing.iter().map(usize::to_string).collect();
        tracing::warn!(
            "Results missing for {} of {} shards: {}",
            summary.missing.len(),
            shards.len(),
            list.join(", ")
        );
    }

    Ok(summary)
}

struct Poller<'a> {
    policy: PollPolicy,
    deadline: Instant,
    should_stop: &'a AtomicBool,
    watchdog: Option<&'a DeadlockDetector>,
}

impl Poller<'_> {
    fn stopped(&self) -> bool {
        self.should_stop.load(Ordering::Relaxed)
    }

    fn poll<S: SchedulerApi + ?Sized>(&self, api: &S, shard: &TriggeredShard) -> Option<ShardResult> {
        let started = Instant::now();
        let mut task = Task {
            binary: shard.task_id.clone(),
            shard_index: shard.shard_index,
            priority: PRIORITY_MED,
            execution_number: 0,
            last_result: None,
        };

        while !self.stopped() {
            task.execution_number += 1;

            match api.result(&shard.task_id) {
                Ok(result) if result.state.is_done() => {
                    let output = match api.stdout(&shard.task_id) {
                        Ok(output) => Some(output),
                        Err(err) => {
                            tracing::warn!("Couldn't fetch output of shard {}: {err}", shard.shard_index);
                            None
                        }
                    };
                    return Some(ShardResult::new(shard, result, output));
                }
                Ok(result) if result.state.is_abandoned() => {
                    tracing::warn!(
                        "Shard {} ({}) ended as {:?}",
                        shard.shard_index,
                        shard.task_id,
                        result.state
                    );
                    return None;
                }
                Ok(result) => task.last_result = Some(result),
                Err(err) => {
                    tracing::warn!("Polling shard {} failed: {err}", shard.shard_index);
                }
            }

            if let Some(watchdog) = self.watchdog {
                watchdog.ping();
            }

            let now = Instant::now();
            if now >= self.deadline {
                break;
            }

            let delay = self.policy.delay(started.elapsed()).min(self.deadline - now);
            self.sleep(delay);
        }

        tracing::debug!(
            "Gave up on shard {} after {} polls, last state {:?}",
            task.shard_index,
            task.execution_number,
            task.last_result.map(|result| result.state)
        );
        None
    }

    fn sleep(&self, delay: Duration) {
        let until = Instant::now() + delay;

        loop {
            let now = Instant::now();
            if now >= until || self.stopped() {
                return;
            }
            thread::sleep((until - now).min(STOP_CHECK));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::dispatch::trigger::trigger_shards;
    use crate::dispatch::{Swarming, TaskProperties, TaskRequest};
    use crate::net::fake::{FakeServer, FakeTask};

    fn options(timeout: Duration) -> CollectOptions {
        CollectOptions {
            timeout,
            poll: PollPolicy {
                initial: Duration::from_millis(5),
                max: Duration::from_millis(20),
                ramp: 30.0,
            },
            deadlock_timeout: None,
            ..CollectOptions::default()
        }
    }

    fn trigger(fake: &Arc<FakeServer>, shards: usize) -> (Arc<Swarming<Arc<FakeServer>>>, Vec<TriggeredShard>) {
        let api = Arc::new(Swarming::new("https://swarm.test", fake.clone()));
        let request = TaskRequest::new("unit_tests", TaskProperties::default());
        let triggered = trigger_shards(&*api, &request, shards).unwrap();
        (api, triggered)
    }

    #[test]
    fn test_poll_delay() {
        let policy = PollPolicy::default();
        assert_eq!(policy.delay(Duration::ZERO), Duration::from_secs(1));
        assert_eq!(policy.delay(Duration::from_secs(60)), Duration::from_secs(3));
        assert_eq!(policy.delay(Duration::from_secs(3600)), Duration::from_secs(15));
    }

    #[test]
    fn test_one_shard_never_finishes() {
        let fake = FakeServer::new();
        fake.script_shard(2, FakeTask::new(&["PENDING", "RUNNING"], None, ""));
        let (api, shards) = trigger(&fake, 3);

        let summary = collect(api, &shards, &options(Duration::from_millis(300))).unwrap();

        assert_eq!(summary.results.len(), 2);
        assert_eq!(summary.missing, vec![2]);
        assert_eq!(summary.exit_code, 0);
        assert!(summary.results.iter().all(|r| r.state == TaskState::Completed));
        assert_eq!(
            summary.results.iter().find(|r| r.shard_index == 1).unwrap().output.as_deref(),
            Some("shard 1 ok\n")
        );
    }

    #[test]
    fn test_results_in_completion_order() {
        let fake = FakeServer::new();
        fake.script_shard(
            0,
            FakeTask::new(&["PENDING", "RUNNING", "RUNNING", "RUNNING", "COMPLETED"], Some(0), "slow"),
        );
        let (api, shards) = trigger(&fake, 2);

        let mut seen = Vec::new();
        let summary = collect_with(api, &shards, &options(Duration::from_secs(10)), |result| {
            seen.push(result.shard_index)
        })
        .unwrap();

        assert_eq!(seen, vec![1, 0]);
        assert!(summary.missing.is_empty());
    }

    #[test]
    fn test_first_failing_exit_code() {
        let fake = FakeServer::new();
        fake.script_shard(0, FakeTask::new(&["RUNNING", "COMPLETED"], Some(3), "boom"));
        fake.script_shard(1, FakeTask::new(&["RUNNING", "RUNNING", "RUNNING", "COMPLETED"], Some(7), "bang"));
        let (api, shards) = trigger(&fake, 3);

        let summary = collect(api, &shards, &options(Duration::from_secs(10))).unwrap();
        assert_eq!(summary.results.len(), 3);
        assert_eq!(summary.exit_code, 3);
    }

    #[test]
    fn test_abandoned_shard_is_missing() {
        let fake = FakeServer::new();
        fake.script_shard(0, FakeTask::new(&["PENDING", "EXPIRED"], None, ""));
        let (api, shards) = trigger(&fake, 2);

        let start = Instant::now();
        let summary = collect(api, &shards, &options(Duration::from_secs(10))).unwrap();

        assert_eq!(summary.missing, vec![0]);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_stop_flag_ends_polling() {
        let fake = FakeServer::new();
        fake.script_shard(0, FakeTask::new(&["RUNNING"], None, ""));
        let (api, shards) = trigger(&fake, 1);

        let options = options(Duration::from_secs(60));
        let stop = options.should_stop.clone();
        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            stop.store(true, Ordering::Relaxed);
        });

        let start = Instant::now();
        let summary = collect(api, &shards, &options).unwrap();
        setter.join().unwrap();

        assert_eq!(summary.missing, vec![0]);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
