//! Client side of the content-addressed store protocol.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::core::{Digest, Namespace};
use crate::error::{NetError, StorageError, TransientIoError};
use crate::net::{Method, Request, Transport, int_or_string, post_json};

/// A unit of content to push or fetch. Two items are the same when digest and
/// size match, whatever their priority.
#[derive(Debug, Clone)]
pub struct Item {
    pub digest: Digest,
    pub size: u64,
    pub high_priority: bool,
}

impl Item {
    pub fn new(digest: Digest, size: u64) -> Self {
        Self {
            digest,
            size,
            high_priority: false,
        }
    }

    pub fn high_priority(mut self) -> Self {
        self.high_priority = true;
        self
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest && self.size == other.size
    }
}

impl Eq for Item {}

impl std::hash::Hash for Item {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
        self.size.hash(state);
    }
}

/// Upload handshake for one missing item, handed out by
/// [`StorageApi::contains`] and consumed by [`StorageApi::push`].
#[derive(Debug)]
pub struct PushState {
    upload_url: Option<String>,
    finalize_url: Option<String>,
    ticket: String,
    uploaded: bool,
    finalized: bool,
}

impl PushState {
    pub fn uploaded(&self) -> bool {
        self.uploaded
    }

    pub fn finalized(&self) -> bool {
        self.finalized
    }
}

/// Operations of a content-addressed store.
///
/// Contents passed to and returned from these methods are wire bytes: already
/// compressed when the namespace says so.
pub trait StorageApi: Send + Sync + 'static {
    fn namespace(&self) -> &Namespace;

    /// Returns the items the server doesn't have yet.
    fn contains(&self, items: &[Item]) -> Result<Vec<(Item, PushState)>, NetError>;

    /// Uploads one item. On failure `state` records how far it got, so a
    /// later call resumes instead of starting over.
    fn push(&self, item: &Item, state: &mut PushState, content: &[u8]) -> Result<(), StorageError>;

    fn fetch(&self, digest: &Digest, offset: u64) -> Result<Vec<u8>, StorageError>;
}

#[derive(Serialize)]
struct NamespaceRef<'a> {
    namespace: &'a str,
}

#[derive(Serialize)]
struct DigestEntry<'a> {
    digest: &'a str,
    is_isolated: bool,
    size: u64,
}

#[derive(Serialize)]
struct PreuploadRequest<'a> {
    items: Vec<DigestEntry<'a>>,
    namespace: NamespaceRef<'a>,
}

#[derive(Deserialize)]
struct PreuploadResponse {
    #[serde(default)]
    items: Vec<PreuploadStatus>,
}

#[derive(Deserialize)]
struct PreuploadStatus {
    #[serde(deserialize_with = "int_or_string")]
    index: Option<i64>,
    #[serde(default)]
    gs_upload_url: Option<String>,
    upload_ticket: String,
}

#[derive(Serialize)]
struct StoreInlineRequest<'a> {
    upload_ticket: &'a str,
    content: String,
}

#[derive(Serialize)]
struct FinalizeRequest<'a> {
    upload_ticket: &'a str,
}

#[derive(Serialize)]
struct RetrieveRequest<'a> {
    digest: &'a str,
    namespace: NamespaceRef<'a>,
    offset: u64,
}

#[derive(Deserialize)]
struct RetrieveResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// The isolate server, reached through any [`Transport`].
pub struct IsolateServer<T> {
    base: String,
    namespace: Namespace,
    transport: T,
}

impl<T: Transport> IsolateServer<T> {
    pub fn new(server: &str, namespace: Namespace, transport: T) -> Self {
        Self {
            base: format!(
                "{}/_ah/api/isolateservice/v1",
                server.trim_end_matches('/')
            ),
            namespace,
            transport,
        }
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{name}", self.base)
    }

    fn fetch_redirect(&self, url: &str, offset: u64) -> Result<Vec<u8>, StorageError> {
        let mut request = Request::get(url);
        if offset > 0 {
            request = request.header("Range", format!("bytes={offset}-"));
        }

        let response = self.transport.request(request)?;
        if offset == 0 && response.header("content-range").is_none() {
            return Ok(response.body);
        }

        let header = response
            .header("content-range")
            .ok_or_else(|| range_error(url, "missing Content-Range header"))?;

        let (start, end, total) = parse_content_range(header)
            .ok_or_else(|| range_error(url, &format!("malformed Content-Range `{header}`")))?;

        if start != offset {
            return Err(range_error(
                url,
                &format!("asked for offset {offset}, got a range starting at {start}"),
            ));
        }

        let expected = end + 1 - start;
        if end + 1 != total || response.body.len() as u64 != expected {
            return Err(range_error(
                url,
                &format!(
                    "incomplete range `{header}` with {} bytes of body",
                    response.body.len()
                ),
            ));
        }

        Ok(response.body)
    }
}

fn range_error(url: &str, message: &str) -> StorageError {
    StorageError::Transient(TransientIoError::Range(format!("{url}: {message}")))
}

/// Parses `bytes START-END/TOTAL`.
pub(crate) fn parse_content_range(header: &str) -> Option<(u64, u64, u64)> {
    let range = header.trim().strip_prefix("bytes ")?;
    let (span, total) = range.split_once('/')?;
    let (start, end) = span.split_once('-')?;

    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    let total = total.trim().parse().ok()?;

    (start <= end && end < total).then_some((start, end, total))
}

impl<T: Transport + 'static> StorageApi for IsolateServer<T> {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn contains(&self, items: &[Item]) -> Result<Vec<(Item, PushState)>, NetError> {
        let url = self.endpoint("preupload");
        let body = PreuploadRequest {
            items: items
                .iter()
                .map(|item| DigestEntry {
                    digest: item.digest.as_str(),
                    is_isolated: item.high_priority,
                    size: item.size,
                })
                .collect(),
            namespace: NamespaceRef {
                namespace: self.namespace.name(),
            },
        };

        let response: PreuploadResponse = post_json(&self.transport, &url, &body)?;

        response
            .items
            .into_iter()
            .map(|status| {
                let item = status
                    .index
                    .and_then(|index| items.get(usize::try_from(index).ok()?))
                    .ok_or_else(|| NetError::decode(url.as_str(), "missing item index"))?;

                let finalize_url = status
                    .gs_upload_url
                    .is_some()
                    .then(|| self.endpoint("finalize_gs_upload"));

                Ok((
                    item.clone(),
                    PushState {
                        upload_url: status.gs_upload_url,
                        finalize_url,
                        ticket: status.upload_ticket,
                        uploaded: false,
                        finalized: false,
                    },
                ))
            })
            .collect()
    }

    fn push(&self, item: &Item, state: &mut PushState, content: &[u8]) -> Result<(), StorageError> {
        if state.finalized {
            return Ok(());
        }

        let Some(upload_url) = state.upload_url.clone() else {
            let body = StoreInlineRequest {
                upload_ticket: &state.ticket,
                content: STANDARD.encode(content),
            };
            self.transport
                .request(Request::json(self.endpoint("store_inline"), &body)?)?;

            state.uploaded = true;
            state.finalized = true;
            return Ok(());
        };

        if !state.uploaded {
            let request = Request::new(Method::Put, upload_url)
                .header("Content-Type", "application/octet-stream")
                .body(content.to_vec());
            self.transport.request(request)?;
            state.uploaded = true;
        }

        if let Some(finalize_url) = &state.finalize_url {
            let body = FinalizeRequest {
                upload_ticket: &state.ticket,
            };
            self.transport
                .request(Request::json(finalize_url.as_str(), &body)?)?;
        }
        state.finalized = true;

        tracing::debug!("Pushed {} ({} bytes) via signed URL", item.digest, item.size);
        Ok(())
    }

    fn fetch(&self, digest: &Digest, offset: u64) -> Result<Vec<u8>, StorageError> {
        let url = self.endpoint("retrieve");
        let body = RetrieveRequest {
            digest: digest.as_str(),
            namespace: NamespaceRef {
                namespace: self.namespace.name(),
            },
            offset,
        };

        let response: RetrieveResponse = post_json(&self.transport, &url, &body)?;

        match (response.content, response.url) {
            (Some(content), _) => STANDARD
                .decode(content)
                .map_err(|err| NetError::decode(url.as_str(), err).into()),
            (None, Some(redirect)) => self.fetch_redirect(&redirect, offset),
            (None, None) => Err(NetError::decode(url, "neither content nor url").into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::core::HashAlgo;
    use crate::net::fake::FakeServer;

    fn server(fake: &Arc<FakeServer>) -> IsolateServer<Arc<FakeServer>> {
        IsolateServer::new("https://isolate.test/", Namespace::new("default"), fake.clone())
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 0-9/10"), Some((0, 9, 10)));
        assert_eq!(parse_content_range("bytes 5-9/10"), Some((5, 9, 10)));
        assert_eq!(parse_content_range("bytes 5-4/10"), None);
        assert_eq!(parse_content_range("bytes 0-10/10"), None);
        assert_eq!(parse_content_range("0-9/10"), None);
        assert_eq!(parse_content_range("bytes 0-9/*"), None);
    }

    #[test]
    fn test_contains_push_contains() {
        let fake = FakeServer::new();
        fake.set_gs_threshold(8);
        let api = server(&fake);

        let small = b"tiny".to_vec();
        let large = b"a rather larger blob".to_vec();
        let items: Vec<Item> = [&small, &large]
            .iter()
            .map(|c| Item::new(crate::core::digest(c, HashAlgo::Sha1), c.len() as u64))
            .collect();

        let missing = api.contains(&items).unwrap();
        assert_eq!(missing.len(), 2);

        for (item, mut state) in missing {
            let content = if item == items[0] { &small } else { &large };
            api.push(&item, &mut state, content).unwrap();
            assert!(state.uploaded() && state.finalized());
        }

        assert!(api.contains(&items).unwrap().is_empty());
        assert_eq!(fake.count("store_inline"), 1);
        assert_eq!(fake.count("finalize_gs_upload"), 1);
    }

    #[test]
    fn test_push_resumes_after_finalize_failure() {
        let fake = FakeServer::new();
        fake.set_gs_threshold(0);
        let api = server(&fake);

        let content = b"content".to_vec();
        let item = Item::new(crate::core::digest(&content, HashAlgo::Sha1), 7);
        let (_, mut state) = api.contains(&[item.clone()]).unwrap().pop().unwrap();

        fake.fail_next("finalize_gs_upload", 1);
        let err = api.push(&item, &mut state, &content).unwrap_err();
        assert!(err.is_transient());
        assert!(state.uploaded());
        assert!(!state.finalized());

        api.push(&item, &mut state, &content).unwrap();
        assert!(state.finalized());
        assert_eq!(fake.count("fake-gcs/upload"), 1);
    }

    #[test]
    fn test_fetch_inline_and_redirect() {
        let fake = FakeServer::new();
        fake.set_inline_threshold(4);
        let api = server(&fake);

        let small = crate::core::digest(b"abc", HashAlgo::Sha1);
        let large = crate::core::digest(b"0123456789", HashAlgo::Sha1);
        fake.insert(&small, b"abc");
        fake.insert(&large, b"0123456789");

        assert_eq!(api.fetch(&small, 0).unwrap(), b"abc");
        assert_eq!(api.fetch(&large, 0).unwrap(), b"0123456789");
        assert_eq!(api.fetch(&large, 4).unwrap(), b"456789");
    }

    #[test]
    fn test_fetch_rejects_bad_ranges() {
        let fake = FakeServer::new();
        fake.set_inline_threshold(0);
        let api = server(&fake);

        let digest = crate::core::digest(b"0123456789", HashAlgo::Sha1);
        fake.insert(&digest, b"0123456789");

        for header in [None, Some("bytes 4-9"), Some("bytes 3-9/10"), Some("bytes 4-8/10")] {
            fake.tamper_range(header.map(str::to_string));
            let err = api.fetch(&digest, 4).unwrap_err();
            assert!(
                matches!(err, StorageError::Transient(TransientIoError::Range(_))),
                "{header:?} should be rejected, got {err}"
            );
        }
    }
}
