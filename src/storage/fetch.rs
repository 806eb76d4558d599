use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::core::Digest;
use crate::error::{ChannelError, StorageError};
use crate::storage::cache::LocalCache;
use crate::storage::server::StorageApi;
use crate::storage::{Storage, fetch_verified, task_error};
use crate::threading::TaskChannel;

/// Context attached to a failed download so the queue knows which digest
/// is no longer in flight.
#[derive(Debug)]
struct Fetching(Digest);

impl fmt::Display for Fetching {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fetching {}", self.0)
    }
}

/// Downloads items into a [`LocalCache`] on the storage pool.
///
/// Fetched content is verified before it is cached, so a cache entry is
/// never corrupt. Completions are consumed through [`FetchQueue::wait`].
pub struct FetchQueue<'a, A: StorageApi, C: LocalCache> {
    storage: &'a Storage<A>,
    cache: Arc<C>,
    channel: TaskChannel<Digest>,
    pending: HashSet<Digest>,
    /// Completed but not yet returned by `wait`.
    ready: HashSet<Digest>,
}

impl<'a, A: StorageApi, C: LocalCache> FetchQueue<'a, A, C> {
    pub fn new(storage: &'a Storage<A>, cache: C) -> Self {
        Self {
            storage,
            cache: Arc::new(cache),
            channel: TaskChannel::new(),
            pending: HashSet::new(),
            ready: HashSet::new(),
        }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Starts fetching `digest` unless it is cached or already on its way.
    /// Returns whether a download was started.
    pub fn add(
        &mut self,
        digest: &Digest,
        size: Option<u64>,
        priority: u32,
    ) -> Result<bool, StorageError> {
        if self.pending.contains(digest) || self.ready.contains(digest) {
            return Ok(false);
        }

        if self.cache.contains(digest) {
            self.ready.insert(digest.clone());
            return Ok(false);
        }

        let api = self.storage.api.clone();
        let cache = self.cache.clone();
        let key = digest.clone();

        self.storage
            .pool
            .add_task_with_channel(self.channel.sender(), priority, move || {
                fetch_verified(&*api, &key, size)
                    .and_then(|content| Ok(cache.write(&key, &content)?))
                    .map(|()| key.clone())
                    .map_err(|err| anyhow::Error::new(err).context(Fetching(key.clone())))
            })?;

        self.pending.insert(digest.clone());
        Ok(true)
    }

    /// Puts content that is already at hand into the cache, as if it had
    /// been fetched.
    pub fn inject(&mut self, digest: &Digest, content: &[u8]) -> Result<(), StorageError> {
        let actual = self.storage.namespace().digest(content);
        if &actual != digest {
            return Err(StorageError::Integrity {
                digest: digest.clone(),
                message: format!("injected content hashes to {actual}"),
            });
        }

        self.cache.write(digest, content)?;
        self.ready.insert(digest.clone());
        Ok(())
    }

    /// Blocks until any digest of `wanted` is in the cache and returns it.
    ///
    /// Other completions seen meanwhile are kept for later calls. The first
    /// failed download is returned as an error and its digest may be added
    /// again.
    pub fn wait(&mut self, wanted: &HashSet<Digest>) -> Result<Digest, StorageError> {
        if let Some(digest) = self.ready.iter().find(|d| wanted.contains(*d)).cloned() {
            self.ready.remove(&digest);
            return Ok(digest);
        }

        if !wanted.iter().any(|digest| self.pending.contains(digest)) {
            return Err(StorageError::NotQueued);
        }

        loop {
            let digest = match self.channel.pull(None) {
                Ok(digest) => digest,
                Err(ChannelError::Task(err)) => {
                    if let Some(Fetching(digest)) = err.downcast_ref::<Fetching>() {
                        self.pending.remove(digest);
                    }
                    return Err(task_error(ChannelError::Task(err)));
                }
                Err(err) => return Err(err.into()),
            };
            self.pending.remove(&digest);

            if wanted.contains(&digest) {
                return Ok(digest);
            }
            self.ready.insert(digest);
        }
    }

    /// Downloads still in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
