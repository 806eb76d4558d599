//! In-memory store and scheduler servers for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};

use crate::core::Digest;
use crate::error::NetError;
use crate::net::{Method, Request, Response, Transport};

const GCS_UPLOAD: &str = "https://fake-gcs/upload/";
const GCS_BLOB: &str = "https://fake-gcs/blob/";

/// How a fake task answers polls. The last state repeats forever.
#[derive(Debug, Clone)]
pub(crate) struct FakeTask {
    pub states: VecDeque<&'static str>,
    pub exit_code: Option<i64>,
    pub output: String,
}

impl FakeTask {
    pub fn new(states: &[&'static str], exit_code: Option<i64>, output: &str) -> Self {
        Self {
            states: states.iter().copied().collect(),
            exit_code,
            output: output.to_string(),
        }
    }
}

#[derive(Default)]
struct State {
    log: Vec<String>,
    next_id: u64,
    failures: HashMap<String, usize>,

    blobs: HashMap<String, Vec<u8>>,
    tickets: HashMap<String, String>,
    staged: HashMap<String, Vec<u8>>,
    gs_threshold: Option<usize>,
    inline_threshold: usize,
    range_override: Option<Option<String>>,

    tasks: HashMap<String, FakeTask>,
    scripts: HashMap<usize, FakeTask>,
    trigger_failures: HashSet<usize>,
    canceled: Vec<String>,
}

#[derive(Default)]
pub(crate) struct FakeServer {
    state: Mutex<State>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        let server = Self::default();
        server.state.lock().unwrap().inline_threshold = usize::MAX;
        Arc::new(server)
    }

    /// Items at least this large get a signed upload URL.
    pub fn set_gs_threshold(&self, size: usize) {
        self.state.lock().unwrap().gs_threshold = Some(size);
    }

    /// Blobs larger than this are served through a redirect.
    pub fn set_inline_threshold(&self, size: usize) {
        self.state.lock().unwrap().inline_threshold = size;
    }

    /// Replaces the Content-Range of redirected fetches; `None` drops it.
    pub fn tamper_range(&self, header: Option<String>) {
        self.state.lock().unwrap().range_override = Some(header);
    }

    /// The next `times` requests whose URL contains `pattern` get a 500.
    pub fn fail_next(&self, pattern: &str, times: usize) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(pattern.to_string(), times);
    }

    pub fn insert(&self, digest: &Digest, content: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .blobs
            .insert(digest.to_string(), content.to_vec());
    }

    pub fn blob(&self, digest: &Digest) -> Option<Vec<u8>> {
        self.state.lock().unwrap().blobs.get(digest.as_str()).cloned()
    }

    /// Number of requests so far whose URL contains `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|line| line.contains(pattern))
            .count()
    }

    pub fn script_shard(&self, shard_index: usize, task: FakeTask) {
        self.state.lock().unwrap().scripts.insert(shard_index, task);
    }

    pub fn fail_trigger(&self, shard_index: usize) {
        self.state
            .lock()
            .unwrap()
            .trigger_failures
            .insert(shard_index);
    }

    pub fn canceled(&self) -> Vec<String> {
        self.state.lock().unwrap().canceled.clone()
    }
}

fn reply(value: Value) -> Result<Response, NetError> {
    Ok(Response {
        status: 200,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: value.to_string().into_bytes(),
    })
}

fn status(code: u16, url: &str) -> Result<Response, NetError> {
    Err(NetError::Status {
        status: code,
        url: url.to_string(),
    })
}

fn body(request: &Request) -> Value {
    request
        .body
        .as_deref()
        .and_then(|body| serde_json::from_slice(body).ok())
        .unwrap_or(Value::Null)
}

fn shard_index(request: &Value) -> usize {
    request["properties"]["env"]
        .as_array()
        .into_iter()
        .flatten()
        .find(|pair| pair["key"] == "GTEST_SHARD_INDEX")
        .and_then(|pair| pair["value"].as_str()?.parse().ok())
        .unwrap_or(0)
}

impl Transport for FakeServer {
    fn request(&self, request: Request) -> Result<Response, NetError> {
        let mut state = self.state.lock().unwrap();
        let url = request.url.clone();
        state.log.push(format!("{:?} {url}", request.method));

        if let Some(left) = state
            .failures
            .iter_mut()
            .find(|(pattern, left)| **left > 0 && url.contains(pattern.as_str()))
            .map(|(_, left)| left)
        {
            *left -= 1;
            return status(500, &url);
        }

        let json = body(&request);

        if url.ends_with("/preupload") {
            let items = json["items"].as_array().cloned().unwrap_or_default();
            let mut missing = Vec::new();

            for (index, item) in items.iter().enumerate() {
                let digest = item["digest"].as_str().unwrap_or_default().to_string();
                let size = item["size"].as_u64().unwrap_or_default() as usize;
                if state.blobs.contains_key(&digest) {
                    continue;
                }

                state.next_id += 1;
                let ticket = format!("ticket-{}", state.next_id);
                state.tickets.insert(ticket.clone(), digest);

                let mut entry = json!({"index": index.to_string(), "upload_ticket": ticket});
                if state.gs_threshold.is_some_and(|min| size >= min) {
                    entry["gs_upload_url"] = json!(format!("{GCS_UPLOAD}{ticket}"));
                }
                missing.push(entry);
            }

            return reply(json!({ "items": missing }));
        }

        if url.ends_with("/store_inline") {
            let ticket = json["upload_ticket"].as_str().unwrap_or_default();
            let Some(digest) = state.tickets.get(ticket).cloned() else {
                return status(400, &url);
            };
            let content = STANDARD
                .decode(json["content"].as_str().unwrap_or_default())
                .unwrap_or_default();
            state.blobs.insert(digest, content);
            return reply(json!({}));
        }

        if let Some(ticket) = url.strip_prefix(GCS_UPLOAD) {
            if request.method != Method::Put {
                return status(405, &url);
            }
            let content = request.body.clone().unwrap_or_default();
            state.staged.insert(ticket.to_string(), content);
            return reply(json!({}));
        }

        if url.ends_with("/finalize_gs_upload") {
            let ticket = json["upload_ticket"].as_str().unwrap_or_default().to_string();
            let (Some(digest), Some(content)) =
                (state.tickets.get(&ticket).cloned(), state.staged.remove(&ticket))
            else {
                return status(400, &url);
            };
            state.blobs.insert(digest, content);
            return reply(json!({}));
        }

        if url.ends_with("/retrieve") {
            let digest = json["digest"].as_str().unwrap_or_default();
            let offset = json["offset"].as_u64().unwrap_or_default() as usize;
            let Some(blob) = state.blobs.get(digest) else {
                return status(404, &url);
            };

            if blob.len() <= state.inline_threshold {
                let content = blob.get(offset..).unwrap_or_default();
                return reply(json!({ "content": STANDARD.encode(content) }));
            }
            return reply(json!({ "url": format!("{GCS_BLOB}{digest}") }));
        }

        if let Some(digest) = url.strip_prefix(GCS_BLOB) {
            let Some(blob) = state.blobs.get(digest).cloned() else {
                return status(404, &url);
            };

            let offset = request
                .headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("range"))
                .and_then(|(_, value)| value.strip_prefix("bytes=")?.strip_suffix('-')?.parse().ok())
                .unwrap_or(0usize);

            let range = state.range_override.clone().unwrap_or_else(|| {
                Some(format!("bytes {offset}-{}/{}", blob.len() - 1, blob.len()))
            });

            return Ok(Response {
                status: if offset > 0 { 206 } else { 200 },
                headers: range
                    .map(|range| vec![("content-range".to_string(), range)])
                    .unwrap_or_default(),
                body: blob.get(offset..).unwrap_or_default().to_vec(),
            });
        }

        if url.ends_with("/tasks/new") {
            let shard = shard_index(&json);
            if state.trigger_failures.contains(&shard) {
                return status(500, &url);
            }

            state.next_id += 1;
            let task_id = format!("task-{}", state.next_id);
            let task = state.scripts.get(&shard).cloned().unwrap_or_else(|| {
                FakeTask::new(&["COMPLETED"], Some(0), &format!("shard {shard} ok\n"))
            });
            state.tasks.insert(task_id.clone(), task);

            return reply(json!({ "task_id": task_id, "request": json }));
        }

        if let Some((_, rest)) = url.split_once("/task/") {
            let (task_id, action) = rest.split_once('/').unwrap_or((rest, ""));
            let task_id = task_id.to_string();

            if action == "cancel" {
                state.canceled.push(task_id);
                return reply(json!({ "ok": true }));
            }

            let Some(task) = state.tasks.get_mut(&task_id) else {
                return status(404, &url);
            };

            return match action {
                "result" => {
                    let current = if task.states.len() > 1 {
                        task.states.pop_front()
                    } else {
                        task.states.front().copied()
                    };
                    let current = current.unwrap_or("PENDING");

                    let mut result = json!({ "state": current, "task_id": task_id });
                    if current == "COMPLETED"
                        && let Some(code) = task.exit_code
                    {
                        result["exit_code"] = json!(code.to_string());
                        result["duration"] = json!(0.25);
                    }
                    reply(result)
                }
                "stdout" => reply(json!({ "output": task.output })),
                _ => status(404, &url),
            };
        }

        status(404, &url)
    }
}
