//! HTTP remote client.
//!
//! [`HttpRemote`] speaks CBOR over any [`HttpClient`]; the actual HTTP
//! library is plugged in by the application (reqwest, hyper, a platform
//! bridge). Response status codes are mapped to [`RemoteError`] classes.

use crate::error::RemoteError;
use crate::remote::{Ack, InMemoryRemote, Mutation, PullBatch, RemoteClient};
use async_trait::async_trait;
use fitsync_core::codec::{from_cbor, to_cbor};
use fitsync_core::SyncCursor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Endpoint for pulling changes.
pub const PULL_PATH: &str = "/workouts/pull";
/// Endpoint for pushing one mutation.
pub const PUSH_PATH: &str = "/workouts/push";

/// Raw HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    /// True for 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// `Err` means no response was received at all (DNS, connect, reset).
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, String>;
}

/// Body of a pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Position to pull after.
    pub since: Option<SyncCursor>,
    /// Page size.
    pub limit: u32,
}

/// Remote client over HTTP with CBOR bodies.
pub struct HttpRemote<C: HttpClient> {
    base_url: String,
    client: C,
}

impl<C: HttpClient> HttpRemote<C> {
    /// Creates a client for the service at `base_url`.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_cbor<Req, Res>(&self, path: &str, request: &Req) -> Result<Res, RemoteError>
    where
        Req: Serialize + Sync,
        Res: DeserializeOwned,
    {
        let body = to_cbor(request)
            .map_err(|e| RemoteError::permanent(format!("failed to encode request: {e}")))?;

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url, body)
            .await
            .map_err(RemoteError::transient)?;

        if !response.is_success() {
            debug!(%url, status = response.status, "request failed");
            return Err(classify_status(response.status, &response.body));
        }

        // A garbled 2xx is treated like a dropped connection.
        from_cbor(&response.body)
            .map_err(|e| RemoteError::transient(format!("failed to decode response: {e}")))
    }
}

/// Maps a non-2xx status to an error class.
///
/// 408, 429 and 5xx are worth retrying; other statuses are not.
pub fn classify_status(status: u16, body: &[u8]) -> RemoteError {
    let detail = String::from_utf8_lossy(body);
    let message = if detail.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {detail}")
    };
    match status {
        408 | 429 | 500..=599 => RemoteError::Transient(message),
        _ => RemoteError::Permanent(message),
    }
}

#[async_trait]
impl<C: HttpClient> RemoteClient for HttpRemote<C> {
    async fn pull(
        &self,
        since: Option<&SyncCursor>,
        limit: u32,
    ) -> Result<PullBatch, RemoteError> {
        let request = PullRequest {
            since: since.cloned(),
            limit,
        };
        self.post_cbor(PULL_PATH, &request).await
    }

    async fn push(&self, mutation: &Mutation) -> Result<Ack, RemoteError> {
        self.post_cbor(PUSH_PATH, mutation).await
    }
}

/// Something that can answer HTTP requests in-process.
#[async_trait]
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST request.
    async fn handle_post(&self, path: &str, body: &[u8]) -> HttpResponse;
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, String> {
        let path = url
            .find("/workouts/")
            .map_or(url, |i| &url[i..]);
        Ok(self.server.handle_post(path, &body).await)
    }
}

fn respond<T: Serialize>(result: Result<T, RemoteError>) -> HttpResponse {
    match result.and_then(|value| to_cbor(&value).map_err(|e| RemoteError::permanent(e.to_string())))
    {
        Ok(body) => HttpResponse::new(200, body),
        Err(RemoteError::Transient(m)) => HttpResponse::new(503, m.into_bytes()),
        Err(RemoteError::Permanent(m)) => HttpResponse::new(422, m.into_bytes()),
    }
}

#[async_trait]
impl LoopbackServer for Arc<InMemoryRemote> {
    async fn handle_post(&self, path: &str, body: &[u8]) -> HttpResponse {
        match path {
            PULL_PATH => match from_cbor::<PullRequest>(body) {
                Ok(request) => respond(self.pull(request.since.as_ref(), request.limit).await),
                Err(e) => HttpResponse::new(400, e.to_string().into_bytes()),
            },
            PUSH_PATH => match from_cbor::<Mutation>(body) {
                Ok(mutation) => respond(self.push(&mutation).await),
                Err(e) => HttpResponse::new(400, e.to_string().into_bytes()),
            },
            _ => HttpResponse::new(404, Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitsync_core::{OpKind, Timestamp, WorkoutRecord};
    use parking_lot::Mutex;

    struct TestClient {
        response: Mutex<Result<HttpResponse, String>>,
        last_url: Mutex<Option<String>>,
    }

    impl TestClient {
        fn new(response: Result<HttpResponse, String>) -> Self {
            Self {
                response: Mutex::new(response),
                last_url: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl HttpClient for TestClient {
        async fn post(&self, url: &str, _body: Vec<u8>) -> Result<HttpResponse, String> {
            *self.last_url.lock() = Some(url.to_string());
            self.response.lock().clone()
        }
    }

    fn mutation() -> Mutation {
        let mut record =
            WorkoutRecord::new(Timestamp::from_millis(0), Timestamp::from_millis(1_000));
        record.revision = 1;
        Mutation {
            kind: OpKind::Create,
            record,
        }
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(503, b"").is_retryable());
        assert!(classify_status(500, b"").is_retryable());
        assert!(classify_status(429, b"slow down").is_retryable());
        assert!(classify_status(408, b"").is_retryable());
        assert!(!classify_status(400, b"").is_retryable());
        assert!(!classify_status(409, b"").is_retryable());
        assert!(!classify_status(422, b"").is_retryable());
        assert_eq!(classify_status(404, b"").message(), "HTTP 404");
        assert_eq!(classify_status(422, b"bad notes").message(), "HTTP 422: bad notes");
    }

    #[tokio::test]
    async fn network_error_is_transient() {
        let remote = HttpRemote::new(
            "https://api.example.com/",
            TestClient::new(Err("connection refused".into())),
        );
        assert_eq!(remote.base_url(), "https://api.example.com");
        let err = remote.push(&mutation()).await.unwrap_err();
        assert_eq!(err, RemoteError::transient("connection refused"));
        assert_eq!(
            remote.client.last_url.lock().as_deref(),
            Some("https://api.example.com/workouts/push")
        );
    }

    #[tokio::test]
    async fn garbled_success_is_transient() {
        let remote = HttpRemote::new(
            "https://api.example.com",
            TestClient::new(Ok(HttpResponse::new(200, vec![0xff, 0x00]))),
        );
        assert!(remote.pull(None, 10).await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn decodes_ack() {
        let mutation = mutation();
        let ack = Ack {
            id: mutation.record.id,
            revision: 1,
        };
        let remote = HttpRemote::new(
            "https://api.example.com",
            TestClient::new(Ok(HttpResponse::new(200, to_cbor(&ack).unwrap()))),
        );
        assert_eq!(remote.push(&mutation).await.unwrap(), ack);
    }

    #[tokio::test]
    async fn loopback_round_trip() {
        let server = Arc::new(InMemoryRemote::new());
        let remote = HttpRemote::new(
            "http://localhost",
            LoopbackClient::new(Arc::clone(&server)),
        );

        let mutation = mutation();
        remote.push(&mutation).await.unwrap();
        assert_eq!(server.get(mutation.record.id), Some(mutation.record.clone()));

        let page = remote.pull(None, 10).await.unwrap();
        assert_eq!(page.records, vec![mutation.record.clone()]);

        server.reject_next_pushes(1);
        let mut newer = mutation.clone();
        newer.record.revision = 2;
        assert!(!remote.push(&newer).await.unwrap_err().is_retryable());

        server.set_offline(true);
        assert!(remote.pull(None, 10).await.unwrap_err().is_retryable());
    }
}
