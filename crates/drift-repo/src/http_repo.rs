//! HTTP repository client.
//!
//! Speaks a small REST protocol relative to a base URL:
//!
//! | Operation      | Request                 | Body                 |
//! |----------------|-------------------------|----------------------|
//! | `has_chunk`    | `HEAD chunk/<hex>`      |                      |
//! | `fetch_chunk`  | `GET chunk/<hex>`       | raw bytes (response) |
//! | `put_chunk`    | `PUT chunk/<hex>`       | raw bytes            |
//! | `fetch_stream` | `GET stream/<hex>`      | postcard manifest    |
//! | `put_stream`   | `PUT stream/<hex>`      | postcard manifest    |
//! | `fetch_tree`   | `GET tree/<hex>`        | postcard tree        |
//! | `put_tree`     | `PUT tree/<hex>`        | postcard tree        |
//!
//! Status mapping: 2xx success, 404 not found, 409 conflict, 422 digest
//! mismatch, 408/429/5xx transient, other 4xx rejected. Connection errors
//! and timeouts are transient.

use std::time::Duration;

use bytes::Bytes;
use drift_cas::{
    CasError, deserialize_stream, deserialize_tree, serialize_stream, serialize_tree,
};
use drift_types::{ChunkHash, Stream, StreamId, Tree, TreeId};
use reqwest::{StatusCode, Url};
use tracing::debug;

use crate::error::RepoError;
use crate::traits::Repository;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Repository reached over HTTP.
#[derive(Clone)]
pub struct HttpRepository {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpRepository {
    /// Create a client for the repository at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, RepoError> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    /// Create a client with a per-request timeout.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, RepoError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RepoError::Rejected(format!("failed to build HTTP client: {e}")))?;
        Self::with_client(http, base_url)
    }

    /// Create a client around an existing `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, base_url: &str) -> Result<Self, RepoError> {
        // A trailing slash makes `join` append instead of replacing the last segment.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| RepoError::Rejected(format!("invalid repository URL {base_url:?}: {e}")))?;
        Ok(Self { http, base_url })
    }

    /// The normalized base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, RepoError> {
        self.base_url
            .join(path)
            .map_err(|e| RepoError::Rejected(format!("failed to build URL for {path}: {e}")))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, RepoError> {
        req.send().await.map_err(transport_err)
    }
}

fn transport_err(e: reqwest::Error) -> RepoError {
    if e.is_builder() {
        RepoError::Rejected(e.to_string())
    } else {
        RepoError::Transient(e.to_string())
    }
}

/// Map a non-success response to an error. `not_found` is used for 404.
async fn status_err(response: reqwest::Response, not_found: RepoError, conflict: RepoError) -> RepoError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND => not_found,
        StatusCode::CONFLICT => conflict,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RepoError::Transient(format!("{status}: {body}"))
        }
        s if s.is_server_error() => RepoError::Transient(format!("{status}: {body}")),
        _ => RepoError::Rejected(format!("{status}: {body}")),
    }
}

#[async_trait::async_trait]
impl Repository for HttpRepository {
    async fn has_chunk(&self, hash: ChunkHash) -> Result<bool, RepoError> {
        let url = self.url(&format!("chunk/{hash}"))?;
        let response = self.send(self.http.head(url)).await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_err(
                response,
                RepoError::ChunkNotFound(hash),
                RepoError::Rejected(format!("unexpected conflict probing chunk {hash}")),
            )
            .await),
        }
    }

    async fn fetch_chunk(&self, hash: ChunkHash) -> Result<Bytes, RepoError> {
        let url = self.url(&format!("chunk/{hash}"))?;
        let response = self.send(self.http.get(url)).await?;
        if !response.status().is_success() {
            return Err(status_err(
                response,
                RepoError::ChunkNotFound(hash),
                RepoError::Rejected(format!("unexpected conflict fetching chunk {hash}")),
            )
            .await);
        }
        let data = response.bytes().await.map_err(transport_err)?;
        debug!(%hash, size = data.len(), "fetched chunk over http");
        Ok(data)
    }

    async fn put_chunk(&self, hash: ChunkHash, data: Bytes) -> Result<(), RepoError> {
        let url = self.url(&format!("chunk/{hash}"))?;
        let size = data.len();
        let response = self.send(self.http.put(url).body(data)).await?;
        let status = response.status();
        if status.is_success() {
            debug!(%hash, size, "uploaded chunk over http");
            return Ok(());
        }
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            return Err(RepoError::HashMismatch(hash));
        }
        Err(status_err(
            response,
            RepoError::Rejected(format!("chunk endpoint missing for {hash}")),
            RepoError::Rejected(format!("unexpected conflict uploading chunk {hash}")),
        )
        .await)
    }

    async fn fetch_stream(&self, id: StreamId) -> Result<Stream, RepoError> {
        let url = self.url(&format!("stream/{id}"))?;
        let response = self.send(self.http.get(url)).await?;
        if !response.status().is_success() {
            return Err(status_err(
                response,
                RepoError::StreamNotFound(id),
                RepoError::Rejected(format!("unexpected conflict fetching stream {id}")),
            )
            .await);
        }
        let body = response.bytes().await.map_err(transport_err)?;
        let stream = deserialize_stream(&body)?;
        if stream.id != id {
            return Err(CasError::StreamIdMismatch {
                claimed: id,
                actual: stream.id,
            }
            .into());
        }
        Ok(stream)
    }

    async fn put_stream(&self, stream: &Stream) -> Result<(), RepoError> {
        let url = self.url(&format!("stream/{}", stream.id))?;
        let body = serialize_stream(stream)?;
        let response = self.send(self.http.put(url).body(body)).await?;
        if response.status().is_success() {
            debug!(stream_id = %stream.id, "published stream over http");
            return Ok(());
        }
        Err(status_err(
            response,
            RepoError::Rejected(format!("stream endpoint missing for {}", stream.id)),
            RepoError::ImmutableConflict(stream.id),
        )
        .await)
    }

    async fn fetch_tree(&self, id: TreeId) -> Result<Tree, RepoError> {
        let url = self.url(&format!("tree/{id}"))?;
        let response = self.send(self.http.get(url)).await?;
        if !response.status().is_success() {
            return Err(status_err(
                response,
                RepoError::TreeNotFound(id),
                RepoError::Rejected(format!("unexpected conflict fetching tree {id}")),
            )
            .await);
        }
        let body = response.bytes().await.map_err(transport_err)?;
        let tree = deserialize_tree(&body)?;
        if tree.id != id {
            return Err(CasError::TreeIdMismatch {
                claimed: id,
                actual: tree.id,
            }
            .into());
        }
        Ok(tree)
    }

    async fn put_tree(&self, tree: &Tree) -> Result<(), RepoError> {
        let url = self.url(&format!("tree/{}", tree.id))?;
        let body = serialize_tree(tree)?;
        let response = self.send(self.http.put(url).body(body)).await?;
        if response.status().is_success() {
            debug!(tree_id = %tree.id, "published tree over http");
            return Ok(());
        }
        Err(status_err(
            response,
            RepoError::Rejected(format!("tree endpoint missing for {}", tree.id)),
            RepoError::Rejected(format!("tree {} refused as conflicting", tree.id)),
        )
        .await)
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use drift_cas::build_stream;
    use drift_types::FileMeta;
    use httpmock::Method::{GET, HEAD, PUT};
    use httpmock::MockServer;

    use super::*;

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    fn sample_stream() -> Stream {
        let hash = ChunkHash::from_data(b"http body");
        build_stream(
            64,
            vec![hash],
            FileMeta {
                size: 9,
                mode: 0o644,
                ..FileMeta::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_has_chunk_maps_head_status() {
        if !can_bind_localhost() {
            eprintln!("Skipping httpmock tests: cannot bind to localhost");
            return;
        }
        let server = MockServer::start_async().await;
        let present = ChunkHash::from_data(b"present");
        let absent = ChunkHash::from_data(b"absent");
        server
            .mock_async(|when, then| {
                when.method(HEAD).path(format!("/repo/chunk/{present}"));
                then.status(200);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(HEAD).path(format!("/repo/chunk/{absent}"));
                then.status(404);
            })
            .await;

        let repo = HttpRepository::new(&server.url("/repo")).unwrap();
        assert!(repo.has_chunk(present).await.unwrap());
        assert!(!repo.has_chunk(absent).await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_chunk_and_not_found() {
        if !can_bind_localhost() {
            return;
        }
        let server = MockServer::start_async().await;
        let hash = ChunkHash::from_data(b"payload");
        let missing = ChunkHash::from_data(b"missing");
        server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/chunk/{hash}"));
                then.status(200).body("payload");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/chunk/{missing}"));
                then.status(404);
            })
            .await;

        let repo = HttpRepository::new(&server.base_url()).unwrap();
        assert_eq!(
            repo.fetch_chunk(hash).await.unwrap(),
            Bytes::from_static(b"payload")
        );
        assert!(matches!(
            repo.fetch_chunk(missing).await,
            Err(RepoError::ChunkNotFound(h)) if h == missing
        ));
    }

    #[tokio::test]
    async fn test_put_chunk_status_mapping() {
        if !can_bind_localhost() {
            return;
        }
        let server = MockServer::start_async().await;
        let ok = ChunkHash::from_data(b"ok");
        let bad = ChunkHash::from_data(b"bad");
        let busy = ChunkHash::from_data(b"busy");
        let down = ChunkHash::from_data(b"down");
        let forbidden = ChunkHash::from_data(b"forbidden");

        let accepted = server
            .mock_async(|when, then| {
                when.method(PUT).path(format!("/chunk/{ok}"));
                then.status(201);
            })
            .await;
        for (hash, status) in [(bad, 422), (busy, 429), (down, 503), (forbidden, 403)] {
            server
                .mock_async(|when, then| {
                    when.method(PUT).path(format!("/chunk/{hash}"));
                    then.status(status).body("nope");
                })
                .await;
        }

        let repo = HttpRepository::new(&server.base_url()).unwrap();
        repo.put_chunk(ok, Bytes::from_static(b"ok")).await.unwrap();
        accepted.assert_async().await;

        let err = repo.put_chunk(bad, Bytes::from_static(b"bad")).await.unwrap_err();
        assert!(matches!(err, RepoError::HashMismatch(_)));

        let err = repo.put_chunk(busy, Bytes::from_static(b"busy")).await.unwrap_err();
        assert!(err.is_transient(), "429 must be transient: {err}");

        let err = repo.put_chunk(down, Bytes::from_static(b"down")).await.unwrap_err();
        assert!(err.is_transient(), "503 must be transient: {err}");

        let err = repo
            .put_chunk(forbidden, Bytes::from_static(b"forbidden"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_stream_roundtrip_and_conflict() {
        if !can_bind_localhost() {
            return;
        }
        let server = MockServer::start_async().await;
        let stream = sample_stream();
        let encoded = serialize_stream(&stream).unwrap();

        server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/stream/{}", stream.id));
                then.status(200).body(encoded.clone());
            })
            .await;
        let conflict = server
            .mock_async(|when, then| {
                when.method(PUT).path(format!("/stream/{}", stream.id));
                then.status(409);
            })
            .await;

        let repo = HttpRepository::new(&server.base_url()).unwrap();
        assert_eq!(repo.fetch_stream(stream.id).await.unwrap(), stream);
        assert!(repo.has_stream(stream.id).await.unwrap());

        let err = repo.put_stream(&stream).await.unwrap_err();
        assert!(matches!(err, RepoError::ImmutableConflict(id) if id == stream.id));
        conflict.assert_async().await;
    }

    #[tokio::test]
    async fn test_tree_put_and_fetch() {
        if !can_bind_localhost() {
            return;
        }
        let server = MockServer::start_async().await;
        let tree = drift_cas::build_tree(
            0o755,
            vec![drift_types::TreeEntry {
                path: "payload".into(),
                mode: 0o644,
                kind: drift_types::EntryKind::File(sample_stream().id),
            }],
        )
        .unwrap();
        let encoded = serialize_tree(&tree).unwrap();

        let put = server
            .mock_async(|when, then| {
                when.method(PUT).path(format!("/tree/{}", tree.id));
                then.status(201);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/tree/{}", tree.id));
                then.status(200).body(encoded.clone());
            })
            .await;
        let missing = TreeId::from_data(b"missing");
        server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/tree/{missing}"));
                then.status(404);
            })
            .await;

        let repo = HttpRepository::new(&server.base_url()).unwrap();
        repo.put_tree(&tree).await.unwrap();
        put.assert_async().await;
        assert_eq!(repo.fetch_tree(tree.id).await.unwrap(), tree);
        assert!(matches!(
            repo.fetch_tree(missing).await,
            Err(RepoError::TreeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_stream_missing() {
        if !can_bind_localhost() {
            return;
        }
        let server = MockServer::start_async().await;
        let id = StreamId::from_data(b"gone");
        server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/stream/{id}"));
                then.status(404);
            })
            .await;

        let repo = HttpRepository::new(&server.base_url()).unwrap();
        assert!(matches!(
            repo.fetch_stream(id).await,
            Err(RepoError::StreamNotFound(_))
        ));
        assert!(!repo.has_stream(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let repo = HttpRepository::with_timeout(
            &format!("http://127.0.0.1:{port}"),
            Duration::from_secs(2),
        )
        .unwrap();
        let err = repo
            .has_chunk(ChunkHash::from_data(b"anything"))
            .await
            .unwrap_err();
        assert!(err.is_transient(), "connection failure must be transient: {err}");
    }

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let repo = HttpRepository::new("http://example.com/drift").unwrap();
        assert_eq!(repo.base_url().as_str(), "http://example.com/drift/");
        assert!(HttpRepository::new("not a url").is_err());
    }
}
