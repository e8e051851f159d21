//! Session credentials and the refresh-once retry wrapper.
//!
//! The wrapper never reads ambient state: callers hand it the request-scoped
//! [`SessionCredentials`] snapshot, and it rewrites that snapshot when a
//! refresh succeeds. Concurrent refreshes of the same refresh token share one
//! in-flight call.

use crate::constants::{
    ACCESS_TOKEN_COOKIE, ACCESS_TOKEN_MAX_AGE_SECS, MSG_NOT_AUTHENTICATED, MSG_NO_REFRESH_TOKEN,
    REFRESH_TOKEN_COOKIE, REFRESH_TOKEN_MAX_AGE_SECS,
};
use crate::types::{RelayError, Result};
use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

/// Attributes applied to both session cookies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CookiePolicy {
    pub secure: bool,
    pub access_max_age_secs: u64,
    pub refresh_max_age_secs: u64,
}

impl Default for CookiePolicy {
    fn default() -> Self {
        Self {
            secure: false,
            access_max_age_secs: ACCESS_TOKEN_MAX_AGE_SECS,
            refresh_max_age_secs: REFRESH_TOKEN_MAX_AGE_SECS,
        }
    }
}

impl CookiePolicy {
    pub fn secure(secure: bool) -> Self {
        Self {
            secure,
            ..Self::default()
        }
    }

    fn cookie(&self, name: &str, value: &str, max_age: u64) -> String {
        let secure = if self.secure { "; Secure" } else { "" };
        format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax{}; Max-Age={}",
            name, value, secure, max_age
        )
    }

    pub fn set_cookies(&self, pair: &CredentialPair) -> Vec<HeaderValue> {
        to_header_values(vec![
            self.cookie(
                ACCESS_TOKEN_COOKIE,
                &pair.access_token,
                self.access_max_age_secs,
            ),
            self.cookie(
                REFRESH_TOKEN_COOKIE,
                &pair.refresh_token,
                self.refresh_max_age_secs,
            ),
        ])
    }

    pub fn clear_cookies(&self) -> Vec<HeaderValue> {
        to_header_values(vec![
            format!("{}=; Path=/; HttpOnly; Max-Age=0", ACCESS_TOKEN_COOKIE),
            format!("{}=; Path=/; HttpOnly; Max-Age=0", REFRESH_TOKEN_COOKIE),
        ])
    }
}

fn to_header_values(cookies: Vec<String>) -> Vec<HeaderValue> {
    cookies
        .into_iter()
        .filter_map(|c| match HeaderValue::from_str(&c) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("Dropping unencodable Set-Cookie value: {}", e);
                None
            }
        })
        .collect()
}

/// Request-scoped copy of the caller's persisted credential pair.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SessionCredentials {
    access_token: Option<String>,
    refresh_token: Option<String>,
    rotated: bool,
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("rotated", &self.rotated)
            .finish()
    }
}

impl SessionCredentials {
    pub fn new(access_token: Option<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token,
            refresh_token,
            rotated: false,
        }
    }

    /// Reads both tokens from every `Cookie` header on the request.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut creds = Self::default();
        for value in headers.get_all(header::COOKIE) {
            let raw = match value.to_str() {
                Ok(s) => s,
                Err(_) => continue,
            };
            for pair in raw.split(';') {
                let (name, value) = match pair.trim().split_once('=') {
                    Some(kv) => kv,
                    None => continue,
                };
                if value.is_empty() {
                    continue;
                }
                match name {
                    ACCESS_TOKEN_COOKIE => creds.access_token = Some(value.to_string()),
                    REFRESH_TOKEN_COOKIE => creds.refresh_token = Some(value.to_string()),
                    _ => {}
                }
            }
        }
        creds
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// Replaces both tokens at once.
    pub fn rotate(&mut self, pair: &CredentialPair) {
        self.access_token = Some(pair.access_token.clone());
        self.refresh_token = Some(pair.refresh_token.clone());
        self.rotated = true;
    }

    pub fn is_rotated(&self) -> bool {
        self.rotated
    }

    /// `Set-Cookie` values persisting the rotated pair; empty if nothing changed.
    pub fn set_cookie_headers(&self, policy: &CookiePolicy) -> Vec<HeaderValue> {
        match (self.rotated, &self.access_token, &self.refresh_token) {
            (true, Some(access_token), Some(refresh_token)) => policy.set_cookies(&CredentialPair {
                access_token: access_token.clone(),
                refresh_token: refresh_token.clone(),
            }),
            _ => Vec::new(),
        }
    }
}

/// Anything whose HTTP status the wrapper can inspect.
pub trait UpstreamReply {
    fn status_code(&self) -> StatusCode;
}

impl UpstreamReply for reqwest::Response {
    fn status_code(&self) -> StatusCode {
        self.status()
    }
}

pub fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

/// Mints a new credential pair from a refresh token.
#[async_trait]
pub trait RefreshClient: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<CredentialPair>;
}

pub struct GatewayRefreshClient {
    client: reqwest::Client,
    url: String,
}

impl GatewayRefreshClient {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl RefreshClient for GatewayRefreshClient {
    async fn refresh(&self, refresh_token: &str) -> Result<CredentialPair> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| RelayError::Unauthenticated(format!("refresh request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!("Token refresh failed with status {}", status);
            return Err(RelayError::Unauthenticated(format!(
                "refresh rejected with status {}",
                status
            ))
            .into());
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Unauthenticated(format!("invalid refresh response: {}", e)))?;

        match (body.access_token, body.refresh_token) {
            (Some(access_token), Some(refresh_token))
                if !access_token.is_empty() && !refresh_token.is_empty() =>
            {
                Ok(CredentialPair {
                    access_token,
                    refresh_token,
                })
            }
            _ => {
                tracing::warn!("Token refresh response is missing tokens");
                Err(RelayError::Unauthenticated("refresh response missing tokens".into()).into())
            }
        }
    }
}

type SharedRefresh = Shared<BoxFuture<'static, std::result::Result<CredentialPair, String>>>;

/// In-flight refreshes keyed by refresh token, tagged with a flight number.
type FlightTable = Arc<Mutex<HashMap<String, (u64, SharedRefresh)>>>;

pub struct TokenRefresher {
    client: Arc<dyn RefreshClient>,
    in_flight: FlightTable,
    next_flight: AtomicU64,
}

impl TokenRefresher {
    pub fn new(client: Arc<dyn RefreshClient>) -> Self {
        Self {
            client,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_flight: AtomicU64::new(0),
        }
    }

    /// Refreshes `refresh_token`, joining an identical refresh already in
    /// flight. The refresh runs as its own task and drops its table entry
    /// when it settles, even if every caller has gone away.
    pub async fn refresh(&self, refresh_token: &str) -> Result<CredentialPair> {
        let flight = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(refresh_token) {
                Some((_, existing)) => {
                    tracing::debug!("Joining in-flight token refresh");
                    existing.clone()
                }
                None => {
                    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
                    let flight = self.spawn_flight(id, refresh_token.to_string());
                    in_flight.insert(refresh_token.to_string(), (id, flight.clone()));
                    flight
                }
            }
        };

        flight
            .await
            .map_err(|msg| RelayError::Unauthenticated(msg).into())
    }

    /// Number of refreshes still in flight.
    pub async fn pending_refreshes(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    fn spawn_flight(&self, id: u64, token: String) -> SharedRefresh {
        let client = Arc::clone(&self.client);
        let table = Arc::clone(&self.in_flight);
        let task = tokio::spawn(async move {
            let outcome = client
                .refresh(&token)
                .await
                .map_err(|e| e.inner.to_string());
            let mut in_flight = table.lock().await;
            if in_flight.get(&token).map_or(false, |(current, _)| *current == id) {
                in_flight.remove(&token);
            }
            outcome
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(format!("refresh task failed: {}", e)),
            }
        }
        .boxed()
        .shared()
    }

    /// Issues the call with the current access token; on 401/403 refreshes
    /// once, persists the new pair into `creds`, and issues it exactly once
    /// more. The second reply is returned whatever its status.
    pub async fn execute<F, Fut, R>(&self, creds: &mut SessionCredentials, mut issuer: F) -> Result<R>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<R>>,
        R: UpstreamReply,
    {
        let token = match creds.access_token() {
            Some(t) => t.to_string(),
            None => return Err(RelayError::Unauthenticated(MSG_NOT_AUTHENTICATED.into()).into()),
        };

        let first = issuer(token).await?;
        let status = first.status_code();
        if !is_auth_failure(status) {
            return Ok(first);
        }

        tracing::info!("Upstream answered {}, attempting token refresh", status);
        let refresh_token = match creds.refresh_token() {
            Some(t) => t.to_string(),
            None => return Err(RelayError::Unauthenticated(MSG_NO_REFRESH_TOKEN.into()).into()),
        };

        let pair = self.refresh(&refresh_token).await?;
        creds.rotate(&pair);

        tracing::info!("Retrying request with refreshed token");
        issuer(pair.access_token).await
    }
}
