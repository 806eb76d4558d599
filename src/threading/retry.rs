use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::error::{PoolError, is_transient};
use crate::threading::channel::ChannelSender;
use crate::threading::deadlock::ThreadRegistry;
use crate::threading::pool::{PoolHandle, ThreadPool, panic_error};
use crate::threading::RETRY_MASK;

pub const DEFAULT_MAX_RETRIES: u32 = 5;

type Retryable = fn(&anyhow::Error) -> bool;
type Task<T> = Arc<dyn Fn() -> anyhow::Result<Vec<T>> + Send + Sync>;
type Sink = Arc<dyn Fn(anyhow::Error) + Send + Sync>;

/// A [`ThreadPool`] that runs failed tasks again when the failure is
/// transient.
///
/// Every retry goes back into the queue one priority step lower, so fresh
/// work at the same base priority runs first.
pub struct AutoRetryThreadPool<T: Send + 'static> {
    pool: ThreadPool<T>,
    max_retries: u32,
    retryable: Retryable,
}

impl<T: Send + 'static> AutoRetryThreadPool<T> {
    pub fn new(
        name: impl Into<String>,
        initial: usize,
        max: usize,
        max_retries: u32,
        registry: Option<ThreadRegistry>,
    ) -> Result<Self, PoolError> {
        assert!(max_retries <= RETRY_MASK, "at most {RETRY_MASK} retries");

        Ok(Self {
            pool: ThreadPool::with_registry(name, initial, max, registry)?,
            max_retries,
            retryable: is_transient,
        })
    }

    /// Replaces the check deciding which errors are worth another try.
    pub fn with_retryable(mut self, retryable: Retryable) -> Self {
        self.retryable = retryable;
        self
    }

    /// Queues a task whose outputs are collected by [`AutoRetryThreadPool::join`].
    ///
    /// # Panics
    /// When `priority` uses the retry bits.
    pub fn add_task<F>(&self, priority: u32, task: F) -> Result<(), PoolError>
    where
        F: Fn() -> anyhow::Result<Vec<T>> + Send + Sync + 'static,
    {
        assert_eq!(priority & RETRY_MASK, 0, "the low priority byte is reserved");
        schedule(
            self.pool.handle(),
            priority,
            self.max_retries,
            self.retryable,
            Arc::new(task),
            None,
        )
    }

    /// Queues a task whose result, or final error, goes to `channel`.
    ///
    /// # Panics
    /// When `priority` uses the retry bits.
    pub fn add_task_with_channel<R, F>(
        &self,
        channel: ChannelSender<R>,
        priority: u32,
        task: F,
    ) -> Result<(), PoolError>
    where
        R: Send + 'static,
        F: Fn() -> anyhow::Result<R> + Send + Sync + 'static,
    {
        assert_eq!(priority & RETRY_MASK, 0, "the low priority byte is reserved");

        let results = channel.clone();
        let task: Task<T> = Arc::new(move || {
            results.send(task()?);
            Ok(Vec::new())
        });
        let sink: Sink = Arc::new(move |err| channel.send_error(err));

        schedule(
            self.pool.handle(),
            priority,
            self.max_retries,
            self.retryable,
            task,
            Some(sink),
        )
    }

    pub fn join(&self) -> Result<Vec<T>, PoolError> {
        self.pool.join()
    }

    pub fn close(&self) {
        self.pool.close();
    }
}

fn schedule<T: Send + 'static>(
    handle: PoolHandle<T>,
    priority: u32,
    max_retries: u32,
    retryable: Retryable,
    task: Task<T>,
    sink: Option<Sink>,
) -> Result<(), PoolError> {
    let requeue = handle.clone();

    handle.add(
        priority,
        Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| task()))
                .unwrap_or_else(|panic| Err(panic_error(panic)));
            let err = match outcome {
                Ok(outputs) => return Ok(outputs),
                Err(err) => err,
            };

            let attempt = priority & RETRY_MASK;
            if retryable(&err) && attempt < max_retries {
                tracing::warn!("Retrying task (attempt {}): {err:#}", attempt + 1);

                let retried = schedule(
                    requeue,
                    priority + 1,
                    max_retries,
                    retryable,
                    task,
                    sink.clone(),
                );
                if retried.is_ok() {
                    return Ok(Vec::new());
                }
            }

            match sink {
                Some(sink) => {
                    sink(err);
                    Ok(Vec::new())
                }
                None => Err(err),
            }
        }),
    )
}
