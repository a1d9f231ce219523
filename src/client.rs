use std::sync::Arc;

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::errors::SyncError;
use crate::session::Session;

/// Successful sync cycle: the exact upstream body plus the extracted
/// resumption token. `body` is the parsed form used by the EventSource
/// adapter for its cursor rewrite; `raw` goes out untouched on WebSocket.
#[derive(Debug, Clone)]
pub struct SyncSnapshot {
    pub raw: String,
    pub body: Map<String, Value>,
    pub next_batch: String,
}

#[derive(Debug, Deserialize)]
struct UpstreamErrorBody {
    errcode: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhoamiResponse {
    user_id: String,
}

/// Client for the homeserver sync API. One instance per accepted connection;
/// cheap to clone so the WebSocket reader task can issue presence updates
/// while the bridge loop owns the poll cycle.
#[derive(Clone)]
pub struct SyncClient {
    http: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
    poll_timeout_ms: u64,
    user_id: Arc<OnceCell<String>>,
}

impl SyncClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        access_token: Option<String>,
        poll_timeout_ms: u64,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            access_token,
            poll_timeout_ms,
            user_id: Arc::new(OnceCell::new()),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/_matrix/client/r0/{}",
            self.base_url.trim_end_matches('/'),
            path
        )
    }

    /// Issue one sync request. `initial` asks the upstream not to wait so the
    /// baseline snapshot comes back before the streaming handshake completes;
    /// every later cycle long-polls with the configured timeout. The session
    /// cursor (when present) is sent verbatim as `since`.
    pub async fn sync(&self, session: &Session, initial: bool) -> Result<SyncSnapshot, SyncError> {
        let timeout_ms = if initial { 0 } else { self.poll_timeout_ms };
        let mut request = self
            .http
            .get(self.endpoint("sync"))
            .query(&[("timeout", timeout_ms.to_string())]);
        if let Some(token) = &self.access_token {
            request = request.query(&[("access_token", token)]);
        }
        if let Some(cursor) = &session.cursor {
            request = request.query(&[("since", cursor)]);
        }
        if let Some(filter) = &session.filter {
            request = request.query(&[("filter", filter)]);
        }
        if let Some(presence) = &session.presence {
            request = request.query(&[("set_presence", presence)]);
        }

        let response = request.send().await.map_err(|err| {
            warn!(error = %err, "sync request failed before a response arrived");
            SyncError::Transport {
                status: 502,
                content_type: None,
                body: Bytes::new(),
            }
        })?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(String::from);
        let bytes = response.bytes().await.map_err(|err| {
            warn!(error = %err, "sync response body read failed");
            SyncError::Transport {
                status: status.as_u16(),
                content_type: content_type.clone(),
                body: Bytes::new(),
            }
        })?;

        if !status.is_success() {
            return Err(classify_failure(status.as_u16(), content_type, bytes));
        }

        let raw = String::from_utf8(bytes.to_vec())
            .map_err(|_| SyncError::internal("sync response is not valid UTF-8"))?;
        let body: Map<String, Value> = serde_json::from_str(&raw)
            .map_err(|_| SyncError::internal("sync response is not a JSON object"))?;
        let next_batch = body
            .get("next_batch")
            .and_then(Value::as_str)
            .filter(|batch| !batch.is_empty())
            .ok_or_else(|| SyncError::internal("sync response carries no next_batch"))?
            .to_string();

        debug!(next_batch = %next_batch, initial, "sync cycle completed");
        Ok(SyncSnapshot {
            raw,
            body,
            next_batch,
        })
    }

    /// One-shot presence update, decoupled from the sync cycle. Failures are
    /// logged and swallowed; a broken presence endpoint must not take the
    /// bridge down.
    pub async fn update_presence(&self, presence: &str) {
        if let Err(err) = self.try_update_presence(presence).await {
            warn!(presence, error = %err, "presence update failed; continuing");
        }
    }

    async fn try_update_presence(&self, presence: &str) -> anyhow::Result<()> {
        let user_id = self
            .user_id
            .get_or_try_init(|| self.whoami())
            .await?
            .clone();
        let encoded = utf8_percent_encode(&user_id, NON_ALPHANUMERIC).to_string();
        let mut request = self
            .http
            .put(self.endpoint(&format!("presence/{encoded}/status")))
            .json(&serde_json::json!({ "presence": presence }));
        if let Some(token) = &self.access_token {
            request = request.query(&[("access_token", token)]);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("presence endpoint returned {}", response.status());
        }
        debug!(presence, user_id = %user_id, "presence updated");
        Ok(())
    }

    async fn whoami(&self) -> anyhow::Result<String> {
        let mut request = self.http.get(self.endpoint("account/whoami"));
        if let Some(token) = &self.access_token {
            request = request.query(&[("access_token", token)]);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("whoami returned {}", response.status());
        }
        let whoami: WhoamiResponse = response.json().await?;
        Ok(whoami.user_id)
    }
}

fn classify_failure(status: u16, content_type: Option<String>, body: Bytes) -> SyncError {
    match serde_json::from_slice::<UpstreamErrorBody>(&body) {
        Ok(parsed) => SyncError::Business {
            status,
            content_type,
            body,
            code: parsed.errcode,
            message: parsed.error.unwrap_or_default(),
        },
        Err(_) => SyncError::Transport {
            status,
            content_type,
            body,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session(cursor: Option<&str>) -> Session {
        Session::new(cursor.map(String::from), None, None)
    }

    #[tokio::test]
    async fn initial_sync_returns_snapshot_with_cursor() {
        let server = MockServer::start().await;
        let body = r#"{"rooms":{"join":{}},"next_batch":"s72_1"}"#;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/r0/sync"))
            .and(query_param("timeout", "0"))
            .and(query_param("access_token", "tok"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
            .mount(&server)
            .await;

        let client = SyncClient::new(reqwest::Client::new(), server.uri(), Some("tok".into()), 30_000);
        let snapshot = client.sync(&session(None), true).await.expect("sync");
        assert_eq!(snapshot.next_batch, "s72_1");
        assert_eq!(snapshot.raw, body);
        assert!(snapshot.body.contains_key("rooms"));
    }

    #[tokio::test]
    async fn long_poll_carries_since_and_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/r0/sync"))
            .and(query_param("timeout", "30000"))
            .and(query_param("since", "s72_1"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"next_batch":"s72_2"}"#,
                "application/json",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = SyncClient::new(reqwest::Client::new(), server.uri(), None, 30_000);
        let snapshot = client.sync(&session(Some("s72_1")), false).await.expect("sync");
        assert_eq!(snapshot.next_batch, "s72_2");
    }

    #[tokio::test]
    async fn structured_upstream_error_classifies_as_business() {
        let server = MockServer::start().await;
        let body = r#"{"errcode":"M_UNKNOWN_TOKEN","error":"Invalid access token"}"#;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/r0/sync"))
            .respond_with(ResponseTemplate::new(401).set_body_raw(body, "application/json"))
            .mount(&server)
            .await;

        let client = SyncClient::new(reqwest::Client::new(), server.uri(), None, 30_000);
        let err = client.sync(&session(None), true).await.unwrap_err();
        match err {
            SyncError::Business {
                status,
                code,
                message,
                body: relayed,
                ..
            } => {
                assert_eq!(status, 401);
                assert_eq!(code, "M_UNKNOWN_TOKEN");
                assert_eq!(message, "Invalid access token");
                assert_eq!(&relayed[..], body.as_bytes());
            }
            other => panic!("expected business error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn undecodable_error_body_classifies_as_transport() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/r0/sync"))
            .respond_with(ResponseTemplate::new(502).set_body_raw("<h1>bad gateway</h1>", "text/html"))
            .mount(&server)
            .await;

        let client = SyncClient::new(reqwest::Client::new(), server.uri(), None, 30_000);
        let err = client.sync(&session(None), true).await.unwrap_err();
        match err {
            SyncError::Transport {
                status,
                content_type,
                body,
            } => {
                assert_eq!(status, 502);
                assert_eq!(content_type.as_deref(), Some("text/html"));
                assert_eq!(&body[..], b"<h1>bad gateway</h1>");
            }
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_next_batch_is_internal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/r0/sync"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(r#"{"rooms":{}}"#, "application/json"),
            )
            .mount(&server)
            .await;

        let client = SyncClient::new(reqwest::Client::new(), server.uri(), None, 30_000);
        let err = client.sync(&session(None), true).await.unwrap_err();
        assert!(matches!(err, SyncError::Internal(_)));
    }

    #[tokio::test]
    async fn network_failure_is_transport_without_body() {
        // nothing listens here
        let client = SyncClient::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1".to_string(),
            None,
            30_000,
        );
        let err = client.sync(&session(None), true).await.unwrap_err();
        match err {
            SyncError::Transport { status, body, .. } => {
                assert_eq!(status, 502);
                assert!(body.is_empty());
            }
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_presence_resolves_user_id_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/r0/account/whoami"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"user_id":"@alice:example.org"}"#,
                "application/json",
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path_regex("^/_matrix/client/r0/presence/.+/status$"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
            .expect(2)
            .mount(&server)
            .await;

        let client = SyncClient::new(reqwest::Client::new(), server.uri(), Some("tok".into()), 30_000);
        client.update_presence("online").await;
        client.update_presence("unavailable").await;
    }
}
