use camino::Utf8PathBuf;
use thiserror::Error;

use crate::core::Digest;

pub use anyhow::Error as RuntimeError;

#[derive(Debug, Error)]
pub enum IsolateError {
    #[error("Manifest error:\n{0}")]
    Manifest(#[from] ManifestError),

    #[error("Mapping error:\n{0}")]
    Mapping(#[from] MappingError),

    #[error("Storage error:\n{0}")]
    Storage(#[from] StorageError),

    #[error("Dispatch error:\n{0}")]
    Dispatch(#[from] DispatchError),

    #[error("Configuration error:\n{0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't start command {command:?}.\n{source}")]
    Spawn {
        command: Vec<String>,
        #[source]
        source: std::io::Error,
    },

    #[error("Nothing to run: the .isolated file has no command")]
    NoCommand,
}

/// Malformed or ambiguous manifests. Always fatal for the whole operation.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Couldn't read manifest {path}.\n{source}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{location}: syntax error at byte {offset}: {message}")]
    Syntax {
        location: String,
        offset: usize,
        message: String,
    },

    #[error("{location}: invalid manifest structure.\n{source}")]
    Structure {
        location: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid condition `{expr}`: {message}")]
    Condition { expr: String, message: String },

    #[error("Include `{0}` must be a relative path")]
    AbsoluteInclude(String),

    #[error("Manifest {0} includes itself")]
    IncludeCycle(Utf8PathBuf),

    #[error("read_only must be 0, 1 or 2, got {0}")]
    ReadOnly(u8),

    #[error("Conditions compare {count} variables, at most {max} are supported")]
    TooManyVariables { count: usize, max: usize },

    #[error("Missing configuration variables: {}", .0.join(", "))]
    MissingVariables(Vec<String>),

    #[error("Undefined path variable `{variable}` in `{path}`")]
    UndefinedPathVariable { variable: String, path: String },

    #[error("Unsupported .isolated version `{0}`")]
    Version(String),

    #[error("Unknown hash algorithm `{0}`")]
    Algorithm(String),

    #[error("Path `{0}` in the .isolated file must stay inside its root")]
    UnsafePath(String),

    #[error("Invalid digest `{digest}` for `{path}`")]
    InvalidDigest { path: String, digest: String },
}

/// A referenced input doesn't map onto the filesystem or the store.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("Input file {0} doesn't exist")]
    NotFound(Utf8PathBuf),

    #[error("Input directory {0} must have a trailing slash")]
    MissingTrailingSlash(Utf8PathBuf),

    #[error("Input {0} has a trailing slash but is not a directory")]
    NotADirectory(Utf8PathBuf),

    #[error("Couldn't read {path}.\n{source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Couldn't query the content store for missing items.\n{0}")]
    Contains(#[source] NetError),

    #[error("Path {0} is not valid UTF-8")]
    PathFormat(#[from] camino::FromPathBufError),
}

/// Failures of the HTTP collaborator.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("Invalid response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl NetError {
    pub(crate) fn decode(url: impl Into<String>, message: impl ToString) -> Self {
        NetError::Decode {
            url: url.into(),
            message: message.to_string(),
        }
    }
}

/// Network or transfer failure that may succeed when tried again.
#[derive(Debug, Error)]
pub enum TransientIoError {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error("{0}")]
    Range(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Transient(#[from] TransientIoError),

    #[error("Content for {digest} is corrupted: {message}")]
    Integrity { digest: Digest, message: String },

    #[error("Local I/O failure.\n{0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("None of the awaited items is being fetched")]
    NotQueued,
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

impl From<NetError> for StorageError {
    fn from(err: NetError) -> Self {
        StorageError::Transient(TransientIoError::Net(err))
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Timed out waiting for a task result")]
    Timeout,

    #[error("Cancelled while waiting for a task result")]
    Cancelled,

    #[error("All senders are gone")]
    Disconnected,

    #[error(transparent)]
    Task(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Task failed:\n{0:#}")]
    Task(anyhow::Error),

    #[error("The worker pool is closed")]
    Closed,

    #[error("Couldn't spawn a worker thread.\n{0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to trigger shard {shard_index}.\n{source}")]
    Trigger {
        shard_index: usize,
        #[source]
        source: NetError,
    },

    #[error("Invalid task request: {0}")]
    Request(String),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read settings file {path}.\n{source}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Couldn't parse settings file {path}.\n{source}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Environment variable {name} has an invalid value `{value}`")]
    Env { name: &'static str, value: String },

    #[error("Couldn't build the HTTP client: {0}")]
    Client(String),

    #[error("No {0} configured")]
    Missing(&'static str),
}

/// Whether the auto-retry wrapper should try this failure again.
pub(crate) fn is_transient(err: &anyhow::Error) -> bool {
    if err.is::<TransientIoError>() {
        return true;
    }

    err.downcast_ref::<StorageError>()
        .is_some_and(StorageError::is_transient)
}
