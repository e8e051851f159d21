use crate::constants::REQUEST_ID_HEADER;
use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use std::panic;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing::{info_span, Instrument};
use uuid::Uuid;

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Tags every request with an id (reusing the caller's `x-request-id` when
/// present) and runs it inside a `request` span.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = match req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => Uuid::new_v4().to_string(),
    };
    let header = HeaderValue::from_str(&request_id).ok();
    if let Some(val) = &header {
        req.headers_mut().insert(REQUEST_ID_HEADER, val.clone());
    }

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path()
    );
    let mut response = next.run(req).instrument(span).await;
    if let Some(val) = header {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Streaming,
    Completed,
    UpstreamError,
    Disconnected,
}

impl RelayOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RelayOutcome::Streaming => "streaming",
            RelayOutcome::Completed => "completed",
            RelayOutcome::UpstreamError => "upstream_error",
            RelayOutcome::Disconnected => "disconnected",
        }
    }
}

/// Per-stream counters, logged once when the relay ends.
#[derive(Debug)]
pub struct RelayMetric {
    pub chunks: usize,
    pub bytes: usize,
    pub outcome: RelayOutcome,
    started: Instant,
}

impl Default for RelayMetric {
    fn default() -> Self {
        Self {
            chunks: 0,
            bytes: 0,
            outcome: RelayOutcome::Streaming,
            started: Instant::now(),
        }
    }
}

impl RelayMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk(&mut self, len: usize) {
        self.chunks += 1;
        self.bytes += len;
    }

    pub fn finish(&mut self, outcome: RelayOutcome) {
        self.outcome = outcome;
    }

    /// The enclosing `relay` and `request` spans carry path and request id.
    pub fn log_summary(&self) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        match self.outcome {
            RelayOutcome::Completed | RelayOutcome::Disconnected => info!(
                chunks = self.chunks,
                bytes = self.bytes,
                outcome = self.outcome.as_str(),
                elapsed_ms,
                "[STREAM END]"
            ),
            _ => warn!(
                chunks = self.chunks,
                bytes = self.bytes,
                outcome = self.outcome.as_str(),
                elapsed_ms,
                "[STREAM END]"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use tower::ServiceExt;

    #[test]
    fn metric_counts_chunks_and_bytes() {
        let mut metric = RelayMetric::new();
        metric.record_chunk(10);
        metric.record_chunk(5);
        metric.finish(RelayOutcome::Completed);
        assert_eq!((metric.chunks, metric.bytes), (2, 15));
        assert_eq!(metric.outcome, RelayOutcome::Completed);
    }

    #[tokio::test]
    async fn request_id_is_echoed_or_generated() {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn(request_id_middleware));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(REQUEST_ID_HEADER, "req-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-123");

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let generated = response.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(Uuid::parse_str(generated).is_ok());
    }
}
