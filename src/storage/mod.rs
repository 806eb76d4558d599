//! Access to the content-addressed store.
//!
//! [`Storage`] wraps a [`StorageApi`] with a retrying worker pool: existence
//! checks run in growing batches, uploads are deduplicated by digest and only
//! read the inputs the server is missing, and everything fetched is checked
//! against its digest before anyone sees it.

pub mod cache;
pub mod fetch;
pub mod server;

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{Digest, Namespace};
use crate::error::{ChannelError, MappingError, PoolError, StorageError, TransientIoError};
use crate::isolated::IsolatedBuild;
use crate::threading::{
    AutoRetryThreadPool, PRIORITY_HIGH, PRIORITY_MED, TaskChannel, ThreadRegistry,
};

pub use self::cache::{DiskCache, LocalCache, MemoryCache};
pub use self::fetch::FetchQueue;
pub use self::server::{IsolateServer, Item, PushState, StorageApi};

/// Sizes of the first `contains` batches. Later batches use the last size.
const CONTAINS_BATCHES: [usize; 6] = [20, 20, 50, 50, 50, 100];

/// Where the bytes of an item come from.
#[derive(Debug, Clone)]
pub enum Content {
    Bytes(Arc<Vec<u8>>),
    File(Utf8PathBuf),
}

impl Content {
    fn read(&self) -> Result<Vec<u8>, MappingError> {
        match self {
            Content::Bytes(bytes) => Ok(bytes.to_vec()),
            Content::File(path) => fs::read(path).map_err(|source| MappingError::Io {
                path: path.clone(),
                source,
            }),
        }
    }
}

impl From<Vec<u8>> for Content {
    fn from(bytes: Vec<u8>) -> Self {
        Content::Bytes(Arc::new(bytes))
    }
}

pub struct Storage<A: StorageApi> {
    api: Arc<A>,
    pool: AutoRetryThreadPool<()>,
}

impl<A: StorageApi> Storage<A> {
    pub fn new(api: A, workers: usize, max_retries: u32) -> Result<Self, PoolError> {
        Self::with_registry(api, workers, max_retries, None)
    }

    /// Like [`Storage::new`], with workers reporting to `registry`.
    pub fn with_registry(
        api: A,
        workers: usize,
        max_retries: u32,
        registry: Option<ThreadRegistry>,
    ) -> Result<Self, PoolError> {
        Ok(Self {
            api: Arc::new(api),
            pool: AutoRetryThreadPool::new("storage", 1, workers.max(1), max_retries, registry)?,
        })
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn namespace(&self) -> &Namespace {
        self.api.namespace()
    }

    /// Asks the server which of `items` it lacks.
    ///
    /// Duplicates are collapsed, then the largest and high priority items go
    /// first so their uploads can start early. A failed query fails the
    /// whole call.
    pub fn get_missing_items(
        &self,
        items: &[Item],
    ) -> Result<Vec<(Item, PushState)>, StorageError> {
        let mut unique: Vec<Item> = Vec::with_capacity(items.len());
        let mut seen = HashMap::new();

        for item in items {
            match seen.entry(item.clone()) {
                Entry::Occupied(entry) => {
                    let index: usize = *entry.get();
                    unique[index].high_priority |= item.high_priority;
                }
                Entry::Vacant(entry) => {
                    entry.insert(unique.len());
                    unique.push(item.clone());
                }
            }
        }

        unique.sort_by(|a, b| {
            b.high_priority
                .cmp(&a.high_priority)
                .then(b.size.cmp(&a.size))
        });

        let batches = split_batches(unique);
        let channel = TaskChannel::<Vec<(Item, PushState)>>::new();

        for batch in &batches {
            let api = self.api.clone();
            let batch = batch.clone();
            self.pool
                .add_task_with_channel(channel.sender(), PRIORITY_HIGH, move || {
                    api.contains(&batch)
                        .map_err(|err| MappingError::Contains(err).into())
                })?;
        }

        let mut missing = Vec::new();
        for _ in 0..batches.len() {
            missing.extend(channel.pull(None).map_err(task_error)?);
        }

        tracing::debug!(
            "{} of {} items missing from {}",
            missing.len(),
            items.len(),
            self.namespace().name()
        );

        Ok(missing)
    }

    /// Uploads whatever the server lacks among `items` and returns the items
    /// that were actually pushed.
    ///
    /// Items sharing a digest are pushed once, using whichever content came
    /// first. Contents are read only for items the server is missing.
    pub fn upload_items(&self, items: Vec<(Item, Content)>) -> Result<Vec<Item>, StorageError> {
        let mut contents = HashMap::new();
        let mut unique = Vec::new();

        for (item, content) in items {
            if let Entry::Vacant(entry) = contents.entry(item.digest.clone()) {
                entry.insert(content);
                unique.push(item);
            }
        }

        let missing = self.get_missing_items(&unique)?;
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let span = tracing::span!(Level::INFO, "upload");
        span.pb_set_length(missing.len() as u64);
        span.pb_set_style(&crate::utils::get_style_progress());
        span.pb_set_message("Uploading...");
        let _enter = span.enter();

        let channel = TaskChannel::<Item>::new();
        let mut total = 0;

        for (item, state) in missing {
            let Some(content) = contents.remove(&item.digest) else {
                continue;
            };

            let api = self.api.clone();
            let state = Mutex::new(state);
            let priority = if item.high_priority {
                PRIORITY_HIGH
            } else {
                PRIORITY_MED
            };

            self.pool
                .add_task_with_channel(channel.sender(), priority, move || {
                    let wire = api
                        .namespace()
                        .encode(&content.read()?)
                        .map_err(StorageError::from)?;
                    let mut state = state.lock().unwrap();
                    api.push(&item, &mut state, &wire)?;
                    Ok(item.clone())
                })?;
            total += 1;
        }

        let mut pushed = Vec::with_capacity(total);
        for _ in 0..total {
            let item = channel.pull(None).map_err(task_error)?;
            span.pb_inc(1);
            pushed.push(item);
        }

        tracing::info!(
            "Uploaded {} items ({} bytes)",
            pushed.len(),
            pushed.iter().map(|item| item.size).sum::<u64>()
        );

        Ok(pushed)
    }

    /// Uploads every input of `build`, then the `.isolated` file itself, and
    /// returns the digest of the latter.
    ///
    /// `build` must have been hashed with the namespace's algorithm.
    pub fn upload_tree(&self, build: &IsolatedBuild) -> Result<Digest, StorageError> {
        let json = build.isolated.to_json()?;
        let digest = self.namespace().digest(&json);

        let mut items: Vec<(Item, Content)> = build
            .inputs()
            .map(|(path, digest, size)| (Item::new(digest.clone(), size), Content::File(path)))
            .collect();

        items.push((
            Item::new(digest.clone(), json.len() as u64).high_priority(),
            Content::from(json),
        ));

        self.upload_items(items)?;
        Ok(digest)
    }

    /// Downloads one item and checks it against `digest` and, when known,
    /// `size`. Transient failures are retried on the pool.
    pub fn fetch(&self, digest: &Digest, size: Option<u64>) -> Result<Vec<u8>, StorageError> {
        let channel = TaskChannel::<Vec<u8>>::new();
        let api = self.api.clone();
        let key = digest.clone();

        self.pool
            .add_task_with_channel(channel.sender(), PRIORITY_HIGH, move || {
                Ok(fetch_verified(&*api, &key, size)?)
            })?;

        channel.pull(None).map_err(task_error)
    }
}

fn split_batches(items: Vec<Item>) -> Vec<Vec<Item>> {
    let last = CONTAINS_BATCHES[CONTAINS_BATCHES.len() - 1];
    let mut batches = Vec::new();
    let mut items = items.into_iter().peekable();

    while items.peek().is_some() {
        let size = CONTAINS_BATCHES.get(batches.len()).copied().unwrap_or(last);
        batches.push(items.by_ref().take(size).collect());
    }

    batches
}

/// Fetches, decodes and verifies one item.
pub(crate) fn fetch_verified<A: StorageApi + ?Sized>(
    api: &A,
    digest: &Digest,
    size: Option<u64>,
) -> Result<Vec<u8>, StorageError> {
    let integrity = |message: String| StorageError::Integrity {
        digest: digest.clone(),
        message,
    };

    let wire = api.fetch(digest, 0)?;
    let content = api
        .namespace()
        .decode(wire)
        .map_err(|err| integrity(format!("can't decompress: {err}")))?;

    if let Some(size) = size
        && content.len() as u64 != size
    {
        return Err(integrity(format!(
            "expected {size} bytes, got {}",
            content.len()
        )));
    }

    let actual = api.namespace().digest(&content);
    if &actual != digest {
        return Err(integrity(format!("content hashes to {actual}")));
    }

    Ok(content)
}

/// Recovers the typed error a pool task failed with.
pub(crate) fn task_error(err: ChannelError) -> StorageError {
    let ChannelError::Task(err) = err else {
        return StorageError::Channel(err);
    };

    let err = match err.downcast::<StorageError>() {
        Ok(err) => return err,
        Err(err) => err,
    };
    let err = match err.downcast::<MappingError>() {
        Ok(err) => return err.into(),
        Err(err) => err,
    };
    match err.downcast::<TransientIoError>() {
        Ok(err) => err.into(),
        Err(err) => StorageError::Channel(ChannelError::Task(err)),
    }
}
