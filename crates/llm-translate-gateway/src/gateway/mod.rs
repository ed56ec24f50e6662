//! Request pipeline: key rotation, client memory, glossary, prompting and the upstream call.

pub mod context;
pub mod glossary;
pub mod handler;
pub mod keys;
pub mod prompt;
pub mod rewrite;
pub mod upstream;
pub mod usage;

use std::{fmt, net::IpAddr};

use blake3::Hasher;

pub use context::{ContextStore, HistorySnapshot, Turn};
pub use glossary::{GlossaryError, GlossaryStore};
pub use handler::{GatewayState, HandlerError, Reply, RequestHandler};
pub use keys::KeyRotator;
pub use prompt::{ChatMessage, Role};
pub use rewrite::RewriteRules;
pub use upstream::{Completion, FailureKind, TokenUsage, TranslationClient, UpstreamError};
pub use usage::{UsageMeter, UsageTotals};

const CLIENT_ID_HEX_LEN: usize = 8;

/// Short stable token identifying a requester, derived from its address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    pub fn from_ip(ip: IpAddr) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(ip.to_string().as_bytes());
        let hex = hasher.finalize().to_hex().to_string();
        ClientId(hex[..CLIENT_ID_HEX_LEN].to_string())
    }

    /// Wrap an already derived identifier.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        ClientId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
