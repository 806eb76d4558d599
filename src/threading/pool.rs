use std::any::Any;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::PoolError;
use crate::threading::PRIORITY_STOP;
use crate::threading::deadlock::ThreadRegistry;

pub(crate) type Job<T> = Box<dyn FnOnce() -> anyhow::Result<Vec<T>> + Send>;

enum Work<T> {
    Run(Job<T>),
    Stop,
}

struct Entry<T> {
    priority: u32,
    seq: u64,
    work: Work<T>,
}

impl<T> Entry<T> {
    fn key(&self) -> (u32, u64) {
        (self.priority, self.seq)
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

struct State<T> {
    queue: BinaryHeap<Reverse<Entry<T>>>,
    seq: u64,
    /// Tasks added and not finished yet. Poison tasks don't count.
    pending: usize,
    idle: usize,
    live: usize,
    outputs: Vec<T>,
    errors: VecDeque<anyhow::Error>,
    closed: bool,
}

pub(crate) struct Shared<T> {
    name: String,
    max_workers: usize,
    registry: Option<ThreadRegistry>,
    state: Mutex<State<T>>,
    work: Condvar,
    done: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable access to the queue, for tasks that enqueue follow-up work.
pub(crate) struct PoolHandle<T>(Arc<Shared<T>>);

impl<T> Clone for PoolHandle<T> {
    fn clone(&self) -> Self {
        PoolHandle(self.0.clone())
    }
}

impl<T: Send + 'static> PoolHandle<T> {
    pub(crate) fn add(&self, priority: u32, job: Job<T>) -> Result<(), PoolError> {
        let shared = &self.0;
        let mut state = shared.state.lock().unwrap();

        if state.closed {
            return Err(PoolError::Closed);
        }

        let seq = state.seq;
        state.seq += 1;
        state.pending += 1;
        state.queue.push(Reverse(Entry {
            priority,
            seq,
            work: Work::Run(job),
        }));

        if state.queue.len() > state.idle && state.live < shared.max_workers {
            match spawn_worker(shared.clone(), state.live) {
                Ok(handle) => {
                    state.live += 1;
                    shared.threads.lock().unwrap().push(handle);
                }
                // Someone is alive to eventually run the task.
                Err(err) if state.live > 0 => {
                    tracing::warn!("Couldn't grow pool {}: {err}", shared.name);
                }
                Err(err) => {
                    state.queue.pop();
                    state.pending -= 1;
                    return Err(PoolError::Spawn(err));
                }
            }
        }

        shared.work.notify_one();
        Ok(())
    }
}

/// A growable set of worker threads consuming one priority queue.
///
/// Lower priorities run first, equal priorities in submission order. A task
/// returns any number of outputs, collected by [`ThreadPool::join`]. Panics
/// inside a task are reported as task errors.
///
/// [`ThreadPool::join`] and [`ThreadPool::close`] must not be called from
/// inside a task.
pub struct ThreadPool<T: Send + 'static> {
    handle: PoolHandle<T>,
}

impl<T: Send + 'static> ThreadPool<T> {
    /// Starts `initial` workers, growing up to `max` on demand.
    pub fn new(name: impl Into<String>, initial: usize, max: usize) -> Result<Self, PoolError> {
        Self::with_registry(name, initial, max, None)
    }

    /// Like [`ThreadPool::new`], recording what every worker is doing.
    pub fn with_registry(
        name: impl Into<String>,
        initial: usize,
        max: usize,
        registry: Option<ThreadRegistry>,
    ) -> Result<Self, PoolError> {
        let max = max.max(1);
        let shared = Arc::new(Shared {
            name: name.into(),
            max_workers: max,
            registry,
            state: Mutex::new(State {
                queue: BinaryHeap::new(),
                seq: 0,
                pending: 0,
                idle: 0,
                live: 0,
                outputs: Vec::new(),
                errors: VecDeque::new(),
                closed: false,
            }),
            work: Condvar::new(),
            done: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        });

        for index in 0..initial.min(max) {
            let handle = spawn_worker(shared.clone(), index).map_err(PoolError::Spawn)?;
            shared.state.lock().unwrap().live += 1;
            shared.threads.lock().unwrap().push(handle);
        }

        Ok(Self {
            handle: PoolHandle(shared),
        })
    }

    pub(crate) fn handle(&self) -> PoolHandle<T> {
        self.handle.clone()
    }

    pub fn add_task<F>(&self, priority: u32, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() -> anyhow::Result<Vec<T>> + Send + 'static,
    {
        self.handle.add(priority, Box::new(task))
    }

    /// Number of tasks added and not finished yet.
    pub fn pending(&self) -> usize {
        self.handle.0.state.lock().unwrap().pending
    }

    /// Blocks until every task finished, then hands out the collected outputs.
    ///
    /// When some tasks failed, returns the earliest error. The other errors
    /// and all outputs stay around for the next call.
    pub fn join(&self) -> Result<Vec<T>, PoolError> {
        let shared = &self.handle.0;
        let mut state = shared.state.lock().unwrap();

        while state.pending > 0 {
            state = shared.done.wait(state).unwrap();
        }

        if let Some(err) = state.errors.pop_front() {
            return Err(PoolError::Task(err));
        }

        Ok(std::mem::take(&mut state.outputs))
    }

    /// Stops accepting tasks, lets queued ones finish and stops every worker.
    pub fn close(&self) {
        let shared = &self.handle.0;

        {
            let mut state = shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;

            for _ in 0..state.live {
                let seq = state.seq;
                state.seq += 1;
                state.queue.push(Reverse(Entry {
                    priority: PRIORITY_STOP,
                    seq,
                    work: Work::Stop,
                }));
            }
            shared.work.notify_all();
        }

        let threads = std::mem::take(&mut *shared.threads.lock().unwrap());
        for thread in threads {
            if thread.join().is_err() {
                tracing::error!("A worker of pool {} died", shared.name);
            }
        }
    }
}

impl<T: Send + 'static> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_worker<T: Send + 'static>(
    shared: Arc<Shared<T>>,
    index: usize,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("{}-{index}", shared.name))
        .spawn(move || worker(&shared))
}

fn worker<T: Send + 'static>(shared: &Shared<T>) {
    loop {
        let entry = {
            let mut state = shared.state.lock().unwrap();
            state.idle += 1;

            loop {
                if let Some(Reverse(entry)) = state.queue.pop() {
                    state.idle -= 1;
                    break entry;
                }
                state = shared.work.wait(state).unwrap();
            }
        };

        let job = match entry.work {
            Work::Run(job) => job,
            Work::Stop => {
                shared.state.lock().unwrap().live -= 1;
                if let Some(registry) = &shared.registry {
                    registry.clear();
                }
                return;
            }
        };

        if let Some(registry) = &shared.registry {
            registry.set(format!(
                "task #{} (priority {:#x})",
                entry.seq, entry.priority
            ));
        }

        let result = catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|panic| Err(panic_error(panic)));

        if let Some(registry) = &shared.registry {
            registry.set("idle");
        }

        let mut state = shared.state.lock().unwrap();
        match result {
            Ok(outputs) => state.outputs.extend(outputs),
            Err(err) => state.errors.push_back(err),
        }

        state.pending -= 1;
        if state.pending == 0 {
            shared.done.notify_all();
        }
    }
}

/// Turns a caught panic payload into a task error.
pub(crate) fn panic_error(panic: Box<dyn Any + Send>) -> anyhow::Error {
    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    };

    anyhow::anyhow!(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::mpsc;

    #[test]
    fn test_outputs_are_collected() {
        let pool = ThreadPool::new("test", 2, 4).unwrap();
        for i in 0..10u32 {
            pool.add_task(0, move || Ok(vec![i, i + 100])).unwrap();
        }

        let mut outputs = pool.join().unwrap();
        outputs.sort();
        assert_eq!(outputs.len(), 20);
        assert_eq!(outputs[0], 0);
        assert_eq!(outputs[19], 109);

        assert!(pool.join().unwrap().is_empty());
    }

    #[test]
    fn test_priority_then_fifo() {
        let pool = ThreadPool::new("test", 1, 1).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        pool.add_task(0, move || {
            gate_rx.recv().unwrap();
            Ok(vec!["gate"])
        })
        .unwrap();

        pool.add_task(300, || Ok(vec!["low-1"])).unwrap();
        pool.add_task(100, || Ok(vec!["high-1"])).unwrap();
        pool.add_task(300, || Ok(vec!["low-2"])).unwrap();
        pool.add_task(100, || Ok(vec!["high-2"])).unwrap();
        gate_tx.send(()).unwrap();

        assert_eq!(
            pool.join().unwrap(),
            ["gate", "high-1", "high-2", "low-1", "low-2"]
        );
    }

    #[test]
    fn test_grows_to_max() {
        let pool = ThreadPool::new("test", 0, 4).unwrap();
        let barrier = Arc::new(Barrier::new(4));

        for _ in 0..4 {
            let barrier = barrier.clone();
            pool.add_task(0, move || {
                barrier.wait();
                Ok(vec![()])
            })
            .unwrap();
        }

        assert_eq!(pool.join().unwrap().len(), 4);
    }

    #[test]
    fn test_errors_are_kept_for_next_join() {
        let pool = ThreadPool::new("test", 1, 1).unwrap();
        pool.add_task(0, || Ok(vec![1])).unwrap();
        pool.add_task(0, || anyhow::bail!("first")).unwrap();
        pool.add_task(0, || panic!("boom")).unwrap();

        let err = pool.join().unwrap_err();
        assert!(err.to_string().contains("first"));

        let err = pool.join().unwrap_err();
        assert!(err.to_string().contains("Task panicked: boom"));

        assert_eq!(pool.join().unwrap(), [1]);
    }

    #[test]
    fn test_closed_pool_rejects_tasks() {
        let pool = ThreadPool::<()>::new("test", 2, 2).unwrap();
        pool.add_task(0, || Ok(vec![()])).unwrap();
        pool.close();

        assert_eq!(pool.pending(), 0);
        assert!(matches!(pool.add_task(0, || Ok(vec![])), Err(PoolError::Closed)));
    }
}
