pub mod client;
pub mod constants;
pub mod credentials;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod redaction_layer;
pub mod reducer;
pub mod relay;
pub mod sse;
pub mod str_utils;
pub mod thinking;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
