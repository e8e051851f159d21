/// In-band thinking markers embedded in streamed text
pub const THINK_START: &str = "__THINK__";
pub const THINK_END: &str = "__THINK_END__";

/// Longest tail that may still hold the beginning of a marker.
pub const THINK_TAIL_LEN: usize = THINK_START.len() + THINK_END.len() - 1;

/// SSE framing
pub const SSE_DATA_PREFIX: &str = "data: ";

/// Path suffixes (below `/api/sales/`) whose POST responses are event streams
pub const SSE_ENDPOINT_SUFFIXES: &[&str] = &[
    "proposal-chat/stream",
    "proposal-pipeline/stream",
];

/// Meeting-minute chat streams live at `meeting-minutes/<id>/chat`
pub const MEETING_CHAT_PREFIX: &str = "meeting-minutes/";
pub const MEETING_CHAT_SUFFIX: &str = "/chat";

/// Fixed pipeline stages, indexed 0..=5
pub const STAGE_COUNT: usize = 6;
pub const STAGE_NAMES: [&str; STAGE_COUNT] = [
    "コンテキスト収集",
    "課題構造化 + BANT-C",
    "逆算プランニング",
    "アクションプラン詳細化",
    "原稿提案生成",
    "チェックリスト + まとめ",
];

/// Session cookies
pub const ACCESS_TOKEN_COOKIE: &str = "access_token";
pub const REFRESH_TOKEN_COOKIE: &str = "refresh_token";
pub const ACCESS_TOKEN_MAX_AGE_SECS: u64 = 15 * 60;
pub const REFRESH_TOKEN_MAX_AGE_SECS: u64 = 60 * 60 * 24 * 30;

/// Relay headers
pub const ACCEL_BUFFERING_HEADER: &str = "x-accel-buffering";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Upstream defaults
pub const DEFAULT_GATEWAY_URL: &str = "http://localhost:8888";
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Buffered chunks between the upstream reader and the downstream body
pub const RELAY_CHANNEL_CAPACITY: usize = 64;

/// User-facing messages
pub const MSG_NOT_AUTHENTICATED: &str = "Not authenticated";
pub const MSG_REAUTHENTICATE: &str = "Authentication failed. Please log in again.";
pub const MSG_NO_REFRESH_TOKEN: &str = "No refresh token";
pub const MSG_REFRESH_FAILED: &str = "Token refresh failed";
pub const MSG_INTERNAL: &str = "Internal server error";
