use crate::constants::{DEFAULT_GATEWAY_URL, REFRESH_PATH};
use crate::credentials::{CookiePolicy, GatewayRefreshClient, TokenRefresher};
use crate::logging::request_id_middleware;
use crate::types::*;
use axum::{
    middleware,
    routing::{any, get, post},
    Router,
};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,
    /// Base URL of the upstream API gateway
    #[arg(long, env = "API_GATEWAY_URL", default_value = DEFAULT_GATEWAY_URL)]
    pub gateway_url: String,
    /// Defaults to `<gateway-url>/auth/refresh`
    #[arg(long, env = "AUTH_REFRESH_URL")]
    pub refresh_url: Option<String>,
    #[arg(long, env = "SECURE_COOKIES", default_value_t = false)]
    pub secure_cookies: bool,
    /// Total timeout for buffered calls; streams are never cut off
    #[arg(long, default_value_t = 30)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_body_size: usize,
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub log_json: bool,
}

impl Args {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub client: reqwest::Client,
    pub gateway_url: String,
    pub refresher: Arc<TokenRefresher>,
    pub cookie_policy: CookiePolicy,
    pub args: Arc<Args>,
}

impl AppState {
    pub fn new(args: Args) -> Result<Self> {
        // no total timeout here: it would cut long-lived event streams
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()?;

        let gateway_url = args.gateway_url.trim_end_matches('/').to_string();
        let refresh_url = match &args.refresh_url {
            Some(url) => url.clone(),
            None => format!("{}{}", gateway_url, REFRESH_PATH),
        };
        tracing::info!("Upstream gateway: {} (refresh: {})", gateway_url, refresh_url);

        let refresher = Arc::new(TokenRefresher::new(Arc::new(GatewayRefreshClient::new(
            client.clone(),
            refresh_url,
        ))));

        Ok(Self {
            client,
            gateway_url,
            refresher,
            cookie_policy: CookiePolicy::secure(args.secure_cookies),
            args: Arc::new(args),
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let max_body_size = state.args.max_body_size;
    Router::new()
        .route("/api/sales/*path", any(crate::relay::proxy_handler))
        .route("/api/auth/refresh", post(crate::relay::refresh_handler))
        .route("/health", get(crate::health::liveness))
        .layer(axum::extract::DefaultBodyLimit::max(max_body_size))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}
