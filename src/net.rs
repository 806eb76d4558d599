//! HTTP plumbing shared by the store and scheduler clients.

#[cfg(test)]
pub(crate) mod fake;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::NetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn json(url: impl Into<String>, body: &impl Serialize) -> Result<Self, NetError> {
        let url = url.into();
        let body = serde_json::to_vec(body).map_err(|err| NetError::decode(url.as_str(), err))?;

        Ok(Self::new(Method::Post, url)
            .header("Content-Type", "application/json; charset=utf-8")
            .body(body))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Something that can carry a [`Request`] to a server.
///
/// Implementations retry server-side (5xx) failures on their own; whatever
/// comes back as an error is final for this call. Non-2xx responses are
/// errors.
pub trait Transport: Send + Sync {
    fn request(&self, request: Request) -> Result<Response, NetError>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn request(&self, request: Request) -> Result<Response, NetError> {
        (**self).request(request)
    }
}

pub(crate) fn post_json<T, B, R>(transport: &T, url: &str, body: &B) -> Result<R, NetError>
where
    T: Transport + ?Sized,
    B: Serialize,
    R: DeserializeOwned,
{
    let response = transport.request(Request::json(url, body)?)?;
    serde_json::from_slice(&response.body).map_err(|err| NetError::decode(url, err))
}

pub(crate) fn get_json<T, R>(transport: &T, url: &str) -> Result<R, NetError>
where
    T: Transport + ?Sized,
    R: DeserializeOwned,
{
    let response = transport.request(Request::get(url))?;
    serde_json::from_slice(&response.body).map_err(|err| NetError::decode(url, err))
}

/// Cloud Endpoints send 64-bit integers as strings; accept both forms.
pub(crate) fn int_or_string<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Int(int)) => Ok(Some(int)),
        Some(Raw::Str(str)) => str.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[cfg(feature = "http")]
pub use self::http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use std::thread;
    use std::time::Duration;

    use super::{Method, Request, Response, Transport};
    use crate::error::{ConfigError, NetError};

    /// Blocking `reqwest` transport retrying 5xx responses and connection
    /// failures with a growing pause.
    #[derive(Clone)]
    pub struct HttpTransport {
        client: reqwest::blocking::Client,
        retries: u32,
    }

    impl HttpTransport {
        pub fn new(timeout: Duration, retries: u32) -> Result<Self, ConfigError> {
            let client = reqwest::blocking::Client::builder()
                .timeout(timeout)
                .user_agent(concat!("isoshard/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| ConfigError::Client(e.to_string()))?;

            Ok(Self { client, retries })
        }

        fn backoff(attempt: u32) -> Duration {
            Duration::from_millis(250 * 2u64.pow(attempt.min(6)))
        }
    }

    impl Transport for HttpTransport {
        fn request(&self, request: Request) -> Result<Response, NetError> {
            let url = request.url.clone();
            let mut attempt = 0;

            loop {
                let mut builder = match request.method {
                    Method::Get => self.client.get(&url),
                    Method::Post => self.client.post(&url),
                    Method::Put => self.client.put(&url),
                };
                for (name, value) in &request.headers {
                    builder = builder.header(name, value);
                }
                if let Some(body) = &request.body {
                    builder = builder.body(body.clone());
                }

                let response = match builder.send() {
                    Ok(response) => response,
                    Err(err) if attempt < self.retries && (err.is_connect() || err.is_timeout()) => {
                        attempt += 1;
                        tracing::debug!("Retrying {url} after {err}");
                        thread::sleep(Self::backoff(attempt));
                        continue;
                    }
                    Err(err) => {
                        return Err(NetError::Transport {
                            url,
                            message: err.to_string(),
                        });
                    }
                };

                let status = response.status();
                if status.is_server_error() && attempt < self.retries {
                    attempt += 1;
                    tracing::debug!("Retrying {url} after HTTP {status}");
                    thread::sleep(Self::backoff(attempt));
                    continue;
                }
                if !status.is_success() {
                    return Err(NetError::Status {
                        status: status.as_u16(),
                        url,
                    });
                }

                let headers = response
                    .headers()
                    .iter()
                    .filter_map(|(name, value)| {
                        Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
                    })
                    .collect();

                let body = response.bytes().map_err(|err| NetError::Transport {
                    url: url.clone(),
                    message: err.to_string(),
                })?;

                return Ok(Response {
                    status: status.as_u16(),
                    headers,
                    body: body.to_vec(),
                });
            }
        }
    }
}
