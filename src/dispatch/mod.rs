//! Sharded task dispatch to the swarming scheduler.

pub mod collect;
pub mod trigger;

use serde::{Deserialize, Serialize};

use crate::error::NetError;
use crate::net::{Request, Transport, get_json, int_or_string, post_json};

pub use self::collect::{CollectOptions, CollectSummary, PollPolicy, ShardResult, collect, collect_with};
pub use self::trigger::{TriggeredShard, shard_request, trigger_shards};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringPair {
    pub key: String,
    pub value: String,
}

impl StringPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Points a task at an `.isolated` file in the content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesRef {
    pub isolated: String,
    pub isolatedserver: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProperties {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<StringPair>,
    #[serde(default)]
    pub env: Vec<StringPair>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs_ref: Option<FilesRef>,
    pub execution_timeout_secs: u64,
    pub io_timeout_secs: u64,
    #[serde(default)]
    pub idempotent: bool,
}

impl Default for TaskProperties {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            dimensions: Vec::new(),
            env: Vec::new(),
            extra_args: Vec::new(),
            inputs_ref: None,
            execution_timeout_secs: 3600,
            io_timeout_secs: 1200,
            idempotent: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub name: String,
    pub priority: u32,
    pub expiration_secs: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub properties: TaskProperties,
}

impl TaskRequest {
    pub fn new(name: impl Into<String>, properties: TaskProperties) -> Self {
        Self {
            name: name.into(),
            priority: 100,
            expiration_secs: 6 * 3600,
            tags: Vec::new(),
            user: None,
            properties,
        }
    }
}

/// Scheduler-side task states. Anything unrecognized maps to `Unknown` and
/// is polled like a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Running,
    Pending,
    Expired,
    TimedOut,
    BotDied,
    Canceled,
    Completed,
    #[serde(other)]
    Unknown,
}

impl TaskState {
    /// The task ran and its result can be collected.
    pub fn is_done(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::TimedOut)
    }

    /// The task will never produce a result.
    pub fn is_abandoned(self) -> bool {
        matches!(
            self,
            TaskState::Expired | TaskState::BotDied | TaskState::Canceled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskResult {
    pub state: TaskState,
    #[serde(default, deserialize_with = "int_or_string")]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub outputs_ref: Option<FilesRef>,
}

/// Local bookkeeping for one shard while it is being collected.
#[derive(Debug, Clone)]
pub struct Task {
    pub binary: String,
    pub shard_index: usize,
    pub priority: u32,
    /// Number of times the result was queried.
    pub execution_number: u32,
    pub last_result: Option<TaskResult>,
}

/// Operations of a task scheduler.
pub trait SchedulerApi: Send + Sync + 'static {
    /// Submits a task and returns its id.
    fn new_task(&self, request: &TaskRequest) -> Result<String, NetError>;

    fn result(&self, task_id: &str) -> Result<TaskResult, NetError>;

    fn stdout(&self, task_id: &str) -> Result<String, NetError>;

    fn cancel(&self, task_id: &str) -> Result<(), NetError>;

    /// Where a human can look at the task.
    fn view_url(&self, task_id: &str) -> String;
}

#[derive(Deserialize)]
struct NewTaskResponse {
    task_id: String,
}

#[derive(Deserialize)]
struct StdoutResponse {
    #[serde(default)]
    output: String,
}

/// The swarming server, reached through any [`Transport`].
pub struct Swarming<T> {
    server: String,
    transport: T,
}

impl<T: Transport> Swarming<T> {
    pub fn new(server: &str, transport: T) -> Self {
        Self {
            server: server.trim_end_matches('/').to_string(),
            transport,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/_ah/api/swarming/v1/{path}", self.server)
    }
}

impl<T: Transport + 'static> SchedulerApi for Swarming<T> {
    fn new_task(&self, request: &TaskRequest) -> Result<String, NetError> {
        let response: NewTaskResponse =
            post_json(&self.transport, &self.endpoint("tasks/new"), request)?;
        Ok(response.task_id)
    }

    fn result(&self, task_id: &str) -> Result<TaskResult, NetError> {
        get_json(&self.transport, &self.endpoint(&format!("task/{task_id}/result")))
    }

    fn stdout(&self, task_id: &str) -> Result<String, NetError> {
        let response: StdoutResponse =
            get_json(&self.transport, &self.endpoint(&format!("task/{task_id}/stdout")))?;
        Ok(response.output)
    }

    fn cancel(&self, task_id: &str) -> Result<(), NetError> {
        let url = self.endpoint(&format!("task/{task_id}/cancel"));
        self.transport
            .request(Request::json(url, &serde_json::json!({}))?)?;
        Ok(())
    }

    fn view_url(&self, task_id: &str) -> String {
        format!("{}/user/task/{task_id}", self.server)
    }
}
