use std::fs;
use std::time::Duration;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::core::Namespace;
use crate::dispatch::{CollectOptions, PollPolicy};
use crate::error::ConfigError;

/// Everything the entry points need to know about their surroundings.
///
/// Built from defaults, then an optional JSON file, then the environment,
/// each layer overriding the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub isolate_server: Option<String>,
    pub namespace: String,
    pub swarming_server: Option<String>,
    /// Upper bound of worker threads per pool.
    pub workers: usize,
    /// Attempts after the first for transient store failures.
    pub max_retries: u32,
    pub poll: PollSettings,
    pub collect_timeout_secs: u64,
    /// `None` disables the watchdog.
    pub deadlock_timeout_secs: Option<u64>,
    pub http_timeout_secs: u64,
    pub http_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollSettings {
    pub initial_secs: f64,
    pub max_secs: f64,
    pub ramp: f64,
}

impl Default for PollSettings {
    fn default() -> Self {
        let policy = PollPolicy::default();
        Self {
            initial_secs: policy.initial.as_secs_f64(),
            max_secs: policy.max.as_secs_f64(),
            ramp: policy.ramp,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            isolate_server: None,
            namespace: Namespace::default().name().to_string(),
            swarming_server: None,
            workers: 16,
            max_retries: crate::threading::DEFAULT_MAX_RETRIES,
            poll: PollSettings::default(),
            collect_timeout_secs: 80 * 60,
            deadlock_timeout_secs: Some(15 * 60),
            http_timeout_secs: 60,
            http_retries: 3,
        }
    }
}

impl Settings {
    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let data = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overrides settings from `ISOLATE_SERVER`, `ISOLATE_NAMESPACE`,
    /// `SWARMING_SERVER` and `ISOSHARD_WORKERS`.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// [`Settings::apply_env`] with a custom variable lookup.
    pub fn apply_vars(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.is_empty());

        if let Some(server) = non_empty("ISOLATE_SERVER") {
            self.isolate_server = Some(server);
        }
        if let Some(namespace) = non_empty("ISOLATE_NAMESPACE") {
            self.namespace = namespace;
        }
        if let Some(server) = non_empty("SWARMING_SERVER") {
            self.swarming_server = Some(server);
        }
        if let Some(value) = non_empty("ISOSHARD_WORKERS") {
            self.workers = match value.parse() {
                Ok(workers) if workers > 0 => workers,
                _ => {
                    return Err(ConfigError::Env {
                        name: "ISOSHARD_WORKERS",
                        value,
                    });
                }
            };
        }

        Ok(self)
    }

    pub fn with_isolate_server(mut self, server: impl Into<String>) -> Self {
        self.isolate_server = Some(server.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_swarming_server(mut self, server: impl Into<String>) -> Self {
        self.swarming_server = Some(server.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.namespace.as_str())
    }

    pub fn isolate_server(&self) -> Result<&str, ConfigError> {
        self.isolate_server
            .as_deref()
            .ok_or(ConfigError::Missing("isolate server"))
    }

    pub fn swarming_server(&self) -> Result<&str, ConfigError> {
        self.swarming_server
            .as_deref()
            .ok_or(ConfigError::Missing("swarming server"))
    }

    pub fn poll_policy(&self) -> PollPolicy {
        let secs = |value: f64| Duration::try_from_secs_f64(value.max(0.0)).unwrap_or_default();
        PollPolicy {
            initial: secs(self.poll.initial_secs),
            max: secs(self.poll.max_secs),
            ramp: if self.poll.ramp > 0.0 { self.poll.ramp } else { 1.0 },
        }
    }

    pub fn collect_options(&self) -> CollectOptions {
        CollectOptions {
            timeout: Duration::from_secs(self.collect_timeout_secs),
            poll: self.poll_policy(),
            workers: self.workers,
            deadlock_timeout: self.deadlock_timeout_secs.map(Duration::from_secs),
            ..CollectOptions::default()
        }
    }

    #[cfg(feature = "http")]
    pub fn http_transport(&self) -> Result<crate::net::HttpTransport, ConfigError> {
        crate::net::HttpTransport::new(
            Duration::from_secs(self.http_timeout_secs),
            self.http_retries,
        )
    }

    /// Store client for the configured server and namespace.
    #[cfg(feature = "http")]
    pub fn isolate_client(
        &self,
    ) -> Result<crate::storage::IsolateServer<crate::net::HttpTransport>, ConfigError> {
        Ok(crate::storage::IsolateServer::new(
            self.isolate_server()?,
            self.namespace(),
            self.http_transport()?,
        ))
    }

    #[cfg(feature = "http")]
    pub fn swarming_client(
        &self,
    ) -> Result<crate::dispatch::Swarming<crate::net::HttpTransport>, ConfigError> {
        Ok(crate::dispatch::Swarming::new(
            self.swarming_server()?,
            self.http_transport()?,
        ))
    }
}
