//! Core of llm-translate-gateway: a local HTTP endpoint that turns `GET /?text=...`
//! into chat-completion calls against an OpenAI-compatible API.

pub mod config;
pub mod error;
pub mod gateway;
pub mod paths;

pub use config::{ConfigProvider, FileConfig, GatewaySettings, RetryMode, StaticConfig};
pub use error::CoreError;
pub use gateway::{GatewayState, HandlerError, Reply, RequestHandler};
pub use paths::{Layout, default_root, resolve_root};

// Daemon 模块
pub mod daemon {
    pub mod logging;

    // Serve command (gateway entry point)
    pub mod serve;
}

// Web / HTTP 模块
pub mod web {
    pub mod http;
}
