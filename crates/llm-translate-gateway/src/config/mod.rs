pub mod provider;
pub mod settings;

pub use provider::{ConfigProvider, FileConfig, StaticConfig};
pub use settings::{GatewaySettings, RetryMode, RetryPolicy, RetrySettings};
