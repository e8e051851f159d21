//! BFF proxy: `/api/sales/*` is forwarded to the gateway. Event-stream
//! endpoints are relayed byte-for-byte with a single upstream call; every
//! other call goes through the refresh-once retry wrapper.

use crate::constants::{
    ACCEL_BUFFERING_HEADER, MEETING_CHAT_PREFIX, MEETING_CHAT_SUFFIX, MSG_INTERNAL,
    MSG_NOT_AUTHENTICATED, MSG_NO_REFRESH_TOKEN, MSG_REAUTHENTICATE, MSG_REFRESH_FAILED,
    RELAY_CHANNEL_CAPACITY, SSE_ENDPOINT_SUFFIXES,
};
use crate::credentials::SessionCredentials;
use crate::logging::{RelayMetric, RelayOutcome};
use crate::main_helper::AppState;
use crate::sse::StreamEvent;
use crate::types::ObservedError;
use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Streaming,
    Buffered,
}

impl RouteKind {
    /// Only POSTs to the event-stream endpoints are streamed.
    pub fn classify(method: &Method, path: &str) -> Self {
        if *method != Method::POST {
            return RouteKind::Buffered;
        }
        let path = path.trim_matches('/');
        if SSE_ENDPOINT_SUFFIXES.iter().any(|s| path.ends_with(s)) || is_meeting_chat(path) {
            RouteKind::Streaming
        } else {
            RouteKind::Buffered
        }
    }
}

fn is_meeting_chat(path: &str) -> bool {
    path.strip_prefix(MEETING_CHAT_PREFIX)
        .and_then(|rest| rest.strip_suffix(MEETING_CHAT_SUFFIX))
        .map_or(false, |id| !id.is_empty() && !id.contains('/'))
}

pub fn upstream_url(gateway_url: &str, path: &str, query: Option<&str>) -> String {
    let mut url = format!(
        "{}/sales/{}",
        gateway_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(q);
    }
    url
}

fn json_error(status: StatusCode, msg: &str) -> Response {
    (status, Json(json!({ "error": msg }))).into_response()
}

fn append_cookies(response: &mut Response, cookies: Vec<HeaderValue>) {
    for cookie in cookies {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
}

fn upstream_request(
    client: &reqwest::Client,
    method: &Method,
    url: &str,
    token: &str,
    payload: Option<&Bytes>,
) -> reqwest::RequestBuilder {
    let mut request = client.request(method.clone(), url).bearer_auth(token);
    if let Some(body) = payload {
        request = request
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.clone());
    }
    request
}

/// Copies an upstream JSON reply. Non-JSON bodies become `{}` on success and
/// `{"error": <reason>}` otherwise; 204 stays bodyless.
pub async fn forward_json(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    if status == StatusCode::NO_CONTENT {
        return StatusCode::NO_CONTENT.into_response();
    }
    let reason = status.canonical_reason().unwrap_or("Unknown error");
    let bytes = match upstream.bytes().await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("Failed to read upstream body: {}", e);
            Bytes::new()
        }
    };
    let body = match serde_json::from_slice::<Value>(&bytes) {
        Ok(v) => v,
        Err(_) if status.is_success() => json!({}),
        Err(_) => json!({ "error": reason }),
    };
    (status, Json(body)).into_response()
}

pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(path): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let creds = SessionCredentials::from_headers(&headers);
    if creds.access_token().is_none() {
        tracing::debug!("No access token cookie on {} {}", method, path);
        return json_error(StatusCode::UNAUTHORIZED, MSG_NOT_AUTHENTICATED);
    }

    let target = upstream_url(&state.gateway_url, &path, uri.query());
    let payload = if method != Method::GET && !body.is_empty() {
        Some(body)
    } else {
        None
    };

    match RouteKind::classify(&method, &path) {
        RouteKind::Streaming => relay_stream(state, method, path, target, creds, payload).await,
        RouteKind::Buffered => relay_buffered(state, method, target, creds, payload).await,
    }
}

async fn relay_stream(
    state: Arc<AppState>,
    method: Method,
    path: String,
    target: String,
    creds: SessionCredentials,
    payload: Option<Bytes>,
) -> Response {
    let token = match creds.access_token() {
        Some(t) => t,
        None => return json_error(StatusCode::UNAUTHORIZED, MSG_NOT_AUTHENTICATED),
    };

    // no refresh here: an expired token surfaces as the upstream's 401
    let upstream = match upstream_request(&state.client, &method, &target, token, payload.as_ref())
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("[STREAM] Upstream connect failed for {}: {}", path, e);
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, MSG_INTERNAL);
        }
    };

    let status = upstream.status();
    tracing::info!("[STREAM] Upstream status: {}", status);
    if !status.is_success() {
        return forward_json(upstream).await;
    }

    let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
    let span = tracing::info_span!("relay", path = %path);
    tokio::spawn(pump_upstream(upstream, tx).instrument(span));

    let response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache, no-transform")
        .header(header::CONNECTION, "keep-alive")
        .header(ACCEL_BUFFERING_HEADER, "no")
        .body(Body::from_stream(ReceiverStream::new(rx)));

    match response {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("[STREAM] Failed to build stream response: {}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, MSG_INTERNAL)
        }
    }
}

/// Copies upstream chunks into the downstream channel in order. Stops as
/// soon as the downstream side goes away, dropping the upstream body.
async fn pump_upstream(
    upstream: reqwest::Response,
    tx: mpsc::Sender<std::result::Result<Bytes, std::io::Error>>,
) {
    let mut metric = RelayMetric::new();
    let body = upstream.bytes_stream();
    futures_util::pin_mut!(body);

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                metric.finish(RelayOutcome::Disconnected);
                break;
            }
            next = body.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                metric.record_chunk(bytes.len());
                if tx.send(Ok(bytes)).await.is_err() {
                    metric.finish(RelayOutcome::Disconnected);
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!("[STREAM] Upstream read failed mid-stream: {}", e);
                metric.finish(RelayOutcome::UpstreamError);
                let event = StreamEvent::Error {
                    error: Some("Upstream stream interrupted".to_string()),
                    stage: None,
                };
                match event.to_frame() {
                    Ok(frame) => {
                        let _ = tx.send(Ok(Bytes::from(frame))).await;
                    }
                    Err(e) => tracing::error!("Failed to encode error frame: {}", e),
                }
                break;
            }
            None => {
                metric.finish(RelayOutcome::Completed);
                break;
            }
        }
    }

    metric.log_summary();
}

async fn relay_buffered(
    state: Arc<AppState>,
    method: Method,
    target: String,
    mut creds: SessionCredentials,
    payload: Option<Bytes>,
) -> Response {
    let client = &state.client;
    let timeout = state.args.request_timeout();

    let result = state
        .refresher
        .execute(&mut creds, |token| {
            let request = upstream_request(client, &method, &target, &token, payload.as_ref())
                .timeout(timeout);
            async move { request.send().await.map_err(ObservedError::from) }
        })
        .await;

    let mut response = match result {
        Ok(upstream) => forward_json(upstream).await,
        Err(e) if e.is_unauthenticated() => {
            tracing::warn!("Re-authentication required: {}", e.inner);
            json_error(StatusCode::UNAUTHORIZED, MSG_REAUTHENTICATE)
        }
        Err(e) => {
            tracing::error!("Upstream call failed for {}: {}", target, e.inner);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, MSG_INTERNAL)
        }
    };

    if creds.is_rotated() {
        tracing::info!("Persisting rotated credentials");
        append_cookies(&mut response, creds.set_cookie_headers(&state.cookie_policy));
    }
    response
}

/// `POST /api/auth/refresh`
pub async fn refresh_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let creds = SessionCredentials::from_headers(&headers);
    let refresh_token = match creds.refresh_token() {
        Some(t) => t.to_string(),
        None => return json_error(StatusCode::UNAUTHORIZED, MSG_NO_REFRESH_TOKEN),
    };

    match state.refresher.refresh(&refresh_token).await {
        Ok(pair) => {
            let mut response = Json(json!({ "refreshed": true })).into_response();
            append_cookies(&mut response, state.cookie_policy.set_cookies(&pair));
            response
        }
        Err(e) => {
            tracing::warn!("Token refresh failed: {}", e.inner);
            let mut response = json_error(StatusCode::UNAUTHORIZED, MSG_REFRESH_FAILED);
            append_cookies(&mut response, state.cookie_policy.clear_cookies());
            response
        }
    }
}
