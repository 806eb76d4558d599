use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use crate::error::ChannelError;

/// Longest single wait inside [`TaskChannel::pull`].
const POLL_SLICE: Duration = Duration::from_millis(100);

type Message<T> = Result<T, anyhow::Error>;

/// Single-consumer queue of task results and task errors.
pub struct TaskChannel<T> {
    tx: Sender<Message<T>>,
    rx: Receiver<Message<T>>,
    cancel: Option<Arc<AtomicBool>>,
}

/// Producer side of a [`TaskChannel`]; clone it into every task.
pub struct ChannelSender<T> {
    tx: Sender<Message<T>>,
}

impl<T> Clone for ChannelSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> ChannelSender<T> {
    pub fn send(&self, value: T) {
        if self.tx.send(Ok(value)).is_err() {
            tracing::debug!("Dropping a task result, nobody is listening");
        }
    }

    pub fn send_error(&self, err: anyhow::Error) {
        if let Err(mpsc::SendError(Err(err))) = self.tx.send(Err(err)) {
            tracing::debug!("Dropping a task error, nobody is listening: {err:#}");
        }
    }
}

impl<T> Default for TaskChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskChannel<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            cancel: None,
        }
    }

    /// Makes [`TaskChannel::pull`] give up once `cancel` is set.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn sender(&self) -> ChannelSender<T> {
        ChannelSender {
            tx: self.tx.clone(),
        }
    }

    /// Waits for the next result. `None` waits forever, in short slices so a
    /// cancellation is noticed quickly.
    pub fn pull(&self, timeout: Option<Duration>) -> Result<T, ChannelError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let slice = match deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(POLL_SLICE),
                None => POLL_SLICE,
            };

            match self.rx.recv_timeout(slice) {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => return Err(ChannelError::Task(err)),
                Err(RecvTimeoutError::Disconnected) => return Err(ChannelError::Disconnected),
                Err(RecvTimeoutError::Timeout) => {}
            }

            if self
                .cancel
                .as_ref()
                .is_some_and(|cancel| cancel.load(Ordering::Relaxed))
            {
                return Err(ChannelError::Cancelled);
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(ChannelError::Timeout);
            }
        }
    }
}
