use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::upstream::TokenUsage;

/// Running token totals across all upstream calls of this process.
#[derive(Debug, Default)]
pub struct UsageMeter {
    prompt: AtomicU64,
    completion: AtomicU64,
    requests: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub requests: u64,
}

impl UsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, usage: Option<TokenUsage>) -> UsageTotals {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if let Some(usage) = usage {
            self.prompt.fetch_add(usage.prompt_tokens, Ordering::Relaxed);
            self.completion.fetch_add(usage.completion_tokens, Ordering::Relaxed);
        }
        self.totals()
    }

    pub fn totals(&self) -> UsageTotals {
        let prompt_tokens = self.prompt.load(Ordering::Relaxed);
        let completion_tokens = self.completion.load(Ordering::Relaxed);
        UsageTotals {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            requests: self.requests.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_reported_usage() {
        let meter = UsageMeter::new();
        meter.record(Some(TokenUsage { prompt_tokens: 10, completion_tokens: 4 }));
        meter.record(None);
        let totals = meter.record(Some(TokenUsage { prompt_tokens: 1, completion_tokens: 1 }));
        assert_eq!(
            totals,
            UsageTotals { prompt_tokens: 11, completion_tokens: 5, total_tokens: 16, requests: 3 }
        );
    }
}
