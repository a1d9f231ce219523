use axum::http::HeaderMap;
use serde::Deserialize;

/// Query parameters accepted by both streaming endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamQuery {
    pub access_token: Option<String>,
    pub since: Option<String>,
    pub filter: Option<String>,
    pub presence: Option<String>,
}

/// Per-connection sync state. Created when a streaming request is accepted,
/// dropped when the connection ends. The cursor is advanced only by the
/// bridge loop after a successful cycle.
#[derive(Debug, Clone)]
pub struct Session {
    pub cursor: Option<String>,
    pub filter: Option<String>,
    pub presence: Option<String>,
}

impl Session {
    pub fn new(cursor: Option<String>, filter: Option<String>, presence: Option<String>) -> Self {
        Self {
            cursor: cursor.filter(|c| !c.is_empty()),
            filter: filter.filter(|f| !f.is_empty()),
            presence: presence.filter(|p| !p.is_empty()),
        }
    }
}

/// Resolve the upstream credential: a bearer Authorization header wins over
/// the `access_token` query parameter.
pub fn resolve_access_token(headers: &HeaderMap, query: &StreamQuery) -> Option<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            let token = value.strip_prefix("Bearer ").unwrap_or(value);
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    query.access_token.clone().filter(|t| !t.is_empty())
}

/// Resolve the resumption cursor for the EventSource endpoint. A reconnecting
/// client sends its last delivered id in `Last-Event-ID`; that takes priority
/// over a `since` parameter so an automatic reconnect cannot be rewound by a
/// stale query string.
pub fn resolve_sse_cursor(headers: &HeaderMap, query: &StreamQuery) -> Option<String> {
    if let Some(value) = headers.get("last-event-id") {
        if let Ok(value) = value.to_str() {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    query.since.clone().filter(|s| !s.is_empty())
}
