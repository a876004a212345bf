//! REST surface for session snapshots.
//!
//! Alongside the live socket, the sync service exposes a small HTTP
//! API: uploading a state snapshot (for handoff to a device that has
//! no socket yet), fetching session metadata, and a health probe.
//! [`SnapshotApi`] is the seam; tests implement it in-process.

use std::collections::BTreeMap;

use async_trait::async_trait;
use handover_types::{Session, SessionId};
use serde::Serialize;
use thiserror::Error;

/// Errors from the snapshot API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The HTTP request failed.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The server answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for the error log.
        body: String,
    },
}

/// Client-side view of the session REST endpoints.
#[async_trait]
pub trait SnapshotApi: Send + Sync {
    /// Upload a full state snapshot for a session.
    async fn upload_snapshot(
        &self,
        session_id: SessionId,
        tree: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), ApiError>;

    /// Fetch session metadata (status, expiry).
    async fn fetch_session(&self, session_id: SessionId) -> Result<Session, ApiError>;

    /// Probe service health.
    async fn health(&self) -> Result<bool, ApiError>;
}

#[derive(Serialize)]
struct SnapshotUpload<'a> {
    tree: &'a BTreeMap<String, serde_json::Value>,
}

/// HTTP implementation of [`SnapshotApi`].
pub struct HttpSnapshotApi {
    base_url: String,
    bearer: Option<String>,
    client: reqwest::Client,
}

impl HttpSnapshotApi {
    /// Create a client for the given base URL (no trailing slash).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            bearer: None,
            client: reqwest::Client::new(),
        }
    }

    /// Attach a bearer token to every request.
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

impl std::fmt::Debug for HttpSnapshotApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSnapshotApi")
            .field("base_url", &self.base_url)
            .field("bearer", &self.bearer.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[async_trait]
impl SnapshotApi for HttpSnapshotApi {
    async fn upload_snapshot(
        &self,
        session_id: SessionId,
        tree: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("/v1/sessions/{}/snapshot", session_id));
        let response = self
            .request(self.client.post(&url))
            .json(&SnapshotUpload { tree })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn fetch_session(&self, session_id: SessionId) -> Result<Session, ApiError> {
        let url = self.endpoint(&format!("/v1/sessions/{}", session_id));
        let response = self.request(self.client.get(&url)).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    async fn health(&self) -> Result<bool, ApiError> {
        let url = self.endpoint("/health");
        let response = self.request(self.client.get(&url)).send().await?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handover_types::{SessionStatus, Timestamp};
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Serve one canned HTTP response on a loopback socket, capturing
    /// the request head for assertions.
    async fn one_shot_server(
        status_line: &'static str,
        body: String,
    ) -> (String, tokio::sync::oneshot::Receiver<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let (request_tx, request_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
                if n == 0 || seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let response = format!(
                "{}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
            let _ = request_tx.send(String::from_utf8_lossy(&seen).into_owned());
        });

        (base_url, request_rx)
    }

    fn session() -> Session {
        Session {
            session_id: SessionId::new(),
            user_id: "user-1".into(),
            created_at: Timestamp::from_millis(0),
            expires_at: Timestamp::from_millis(u64::MAX),
            status: SessionStatus::Active,
        }
    }

    #[test]
    fn debug_redacts_bearer() {
        let api = HttpSnapshotApi::new("https://sync.test").with_bearer("secret-token");
        let debug = format!("{:?}", api);
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn snapshot_upload_builds_url_bearer_and_body() {
        let api = HttpSnapshotApi::new("https://sync.test").with_bearer("tok");
        let session_id = SessionId::new();
        let mut tree = BTreeMap::new();
        tree.insert("cart.total".to_string(), json!(42));

        let url = api.endpoint(&format!("/v1/sessions/{}/snapshot", session_id));
        let request = api
            .request(api.client.post(&url))
            .json(&SnapshotUpload { tree: &tree })
            .build()
            .unwrap();

        assert_eq!(
            request.url().as_str(),
            format!("https://sync.test/v1/sessions/{}/snapshot", session_id)
        );
        assert_eq!(request.headers()["authorization"], "Bearer tok");
        let body = request.body().unwrap().as_bytes().unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(decoded["tree"]["cart.total"], json!(42));
    }

    #[test]
    fn requests_without_bearer_omit_the_header() {
        let api = HttpSnapshotApi::new("https://sync.test");
        let request = api
            .request(api.client.get(api.endpoint("/health")))
            .build()
            .unwrap();
        assert!(request.headers().get("authorization").is_none());
    }

    #[tokio::test]
    async fn fetch_session_decodes_server_response() {
        let session = session();
        let body = serde_json::to_string(&session).unwrap();
        let (base_url, request_rx) = one_shot_server("HTTP/1.1 200 OK", body).await;

        let api = HttpSnapshotApi::new(base_url).with_bearer("tok");
        let fetched = api.fetch_session(session.session_id).await.unwrap();

        assert_eq!(fetched.session_id, session.session_id);
        assert_eq!(fetched.status, SessionStatus::Active);

        let request = request_rx.await.unwrap();
        assert!(request.starts_with(&format!("GET /v1/sessions/{} ", session.session_id)));
        assert!(request.contains("authorization: Bearer tok"));
    }

    #[tokio::test]
    async fn non_success_status_surfaces_code_and_body() {
        let (base_url, _request_rx) =
            one_shot_server("HTTP/1.1 404 Not Found", "{\"error\":\"no such session\"}".into())
                .await;

        let api = HttpSnapshotApi::new(base_url);
        let result = api.fetch_session(SessionId::new()).await;

        match result {
            Err(ApiError::Status { status, body }) => {
                assert_eq!(status, 404);
                assert!(body.contains("no such session"));
            }
            other => panic!("expected status error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn health_reflects_status() {
        let (base_url, _request_rx) = one_shot_server("HTTP/1.1 200 OK", "{}".into()).await;
        let api = HttpSnapshotApi::new(base_url);
        assert!(api.health().await.unwrap());
    }
}
