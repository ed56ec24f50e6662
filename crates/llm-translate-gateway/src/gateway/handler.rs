//! Per-request orchestration.
//!
//! A request moves through parse, key selection, context lookup, prompt
//! assembly, the upstream call (with its retry loop), post-processing and
//! the context commit. Errors exit early; [`HandlerError::is_fatal`] marks the
//! one outcome the owning server must react to by shutting down.

use std::{
    net::IpAddr,
    sync::{
        Arc, LazyLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

use super::{
    ClientId, ContextStore, GlossaryStore, KeyRotator, RewriteRules, TranslationClient,
    UsageMeter, prompt, upstream::{Completion, UpstreamError},
};
use crate::{
    config::{ConfigProvider, GatewaySettings, RetryPolicy},
    daemon::logging::LogSink,
};

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>.*?</think>").expect("valid think pattern"));
static TERM_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<tm>(.*?)</tm>").expect("valid term pattern"));

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no usable API key configured")]
    NoUsableKey,

    #[error("translation failed: {source}")]
    Upstream {
        #[source]
        source: UpstreamError,
    },

    #[error("upstream failed {attempts} times in a row: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: UpstreamError,
    },
}

impl HandlerError {
    /// Whether the server has to stop after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandlerError::RetriesExhausted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Blank input; nothing was sent upstream.
    Empty,
    Translated(String),
}

/// Shared state owned by the server and used by every request.
#[derive(Debug, Default)]
pub struct GatewayState {
    pub keys: KeyRotator,
    pub contexts: ContextStore,
    pub glossary: GlossaryStore,
    pub rewrite: RewriteRules,
    pub usage: UsageMeter,
    glossary_mode: AtomicBool,
}

impl GatewayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the glossary mode seen by the latest request.
    ///
    /// Returns `true` when the mode just switched from off to on.
    pub fn note_glossary_mode(&self, enabled: bool) -> bool {
        let was_enabled = self.glossary_mode.swap(enabled, Ordering::AcqRel);
        enabled && !was_enabled
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Postprocessed {
    pub text: String,
    /// Term pairs whose source side occurs in the request text.
    pub terms: Vec<(String, String)>,
}

/// Strip model markup from a raw completion.
///
/// With glossary mode on, `<tm>Source=Target</tm>` pairs are collected and
/// removed. Reasoning blocks are always removed before trimming.
pub fn postprocess(raw: &str, source: &str, glossary_enabled: bool) -> Postprocessed {
    let mut terms = Vec::new();
    let mut text = raw.to_string();
    if glossary_enabled {
        for captures in TERM_BLOCK.captures_iter(raw) {
            let Some((term, translation)) = captures[1].trim().split_once('=') else {
                continue;
            };
            let (term, translation) = (term.trim(), translation.trim());
            if !term.is_empty() && source.contains(term) {
                terms.push((term.to_string(), translation.to_string()));
            }
        }
        text = TERM_BLOCK.replace_all(&text, "").into_owned();
    }
    let text = THINK_BLOCK.replace_all(&text, "").trim().to_string();
    Postprocessed { text, terms }
}

#[derive(Clone)]
pub struct RequestHandler {
    config: Arc<dyn ConfigProvider>,
    state: Arc<GatewayState>,
    client: TranslationClient,
    log: LogSink,
}

impl RequestHandler {
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        state: Arc<GatewayState>,
        client: TranslationClient,
        log: LogSink,
    ) -> Self {
        Self { config, state, client, log }
    }

    pub fn settings(&self) -> Arc<GatewaySettings> {
        self.config.snapshot()
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }

    /// Translate `text` for the requester at `peer`.
    pub async fn handle(&self, peer: IpAddr, text: Option<&str>) -> Result<Reply, HandlerError> {
        let text = text.map(str::trim).unwrap_or_default();
        if text.is_empty() {
            return Ok(Reply::Empty);
        }

        let settings = self.config.snapshot();
        let Some(api_key) = self.state.keys.next(&settings.api_keys) else {
            self.log.error("Error: Invalid API Key, check the configured key list");
            return Err(HandlerError::NoUsableKey);
        };
        self.log.info(format!("Request received: {text}"));

        let glossary_enabled = settings.glossary_enabled;
        let switched_on = self.state.note_glossary_mode(glossary_enabled);
        let source = if glossary_enabled {
            self.prepare_glossary(&settings, switched_on);
            self.state.rewrite.pre_process(text)
        } else {
            text.to_string()
        };

        let client = ClientId::from_ip(peer);
        let history = self.state.contexts.get_or_create(&client, settings.context_len);
        debug!(client = %client, turns = history.turns.len(), "client context ready");

        let glossary_context = if glossary_enabled {
            let block = self.state.glossary.context_for(&source);
            if !block.is_empty() {
                self.log.info("Term matched: known glossary terms added to the prompt");
            }
            block
        } else {
            String::new()
        };

        let messages = prompt::build(&settings, &glossary_context, &history.turns, &source);
        let completion = self.call_upstream(&settings, &api_key, &messages).await?;
        let totals = self.state.usage.record(completion.usage);
        info!(
            prompt_tokens = totals.prompt_tokens,
            completion_tokens = totals.completion_tokens,
            total_tokens = totals.total_tokens,
            "token usage updated"
        );

        let processed = postprocess(&completion.text, &source, glossary_enabled);
        for (term, translation) in &processed.terms {
            match self.state.glossary.add(term, translation) {
                Ok(true) => self.log.info(format!("New term discovered: {term} = {translation}")),
                Ok(false) => {}
                Err(err) => self.log.warn(format!("Failed to save glossary term {term}: {err}")),
            }
        }
        let translated = if glossary_enabled {
            self.state.rewrite.post_process(&processed.text)
        } else {
            processed.text
        };

        self.state.contexts.append(
            &client,
            history.ticket,
            prompt::user_content(&settings, &source),
            translated.clone(),
        );
        self.log.info(format!("Translation: {translated}"));
        Ok(Reply::Translated(translated))
    }

    // Loads the glossary (and its rewrite rules) when the mode is switched on or the path changes.
    fn prepare_glossary(&self, settings: &GatewaySettings, switched_on: bool) {
        let Some(path) = settings.active_glossary_path() else {
            return;
        };
        let loaded = if switched_on {
            self.state.glossary.load(path).map(|_| true)
        } else {
            self.state.glossary.ensure_loaded(path)
        };
        match loaded {
            Ok(false) => {}
            Ok(true) => {
                if let Err(err) = self.state.rewrite.load_beside(path) {
                    self.log.warn(format!("Failed to load rewrite rules: {err}"));
                }
            }
            Err(err) => self.log.warn(format!("Failed to load glossary: {err}")),
        }
    }

    async fn call_upstream(
        &self,
        settings: &GatewaySettings,
        api_key: &str,
        messages: &[prompt::ChatMessage],
    ) -> Result<Completion, HandlerError> {
        let policy = settings.retry_policy();
        let max_attempts = policy.max_attempts();
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = self
                .client
                .translate(
                    &settings.base_url,
                    api_key,
                    &settings.model,
                    messages,
                    settings.temperature,
                    settings.request_timeout(),
                )
                .await
                .and_then(|completion| match policy {
                    RetryPolicy::Bounded { timeout, .. } if started.elapsed() > timeout => {
                        Err(UpstreamError::Timeout { elapsed: started.elapsed() })
                    }
                    _ => Ok(completion),
                });

            let err = match result {
                Ok(completion) => return Ok(completion),
                Err(err) => err,
            };

            match policy {
                RetryPolicy::Disabled => {
                    self.log.error(format!("Network request failed: {err}"));
                    return Err(HandlerError::Upstream { source: err });
                }
                RetryPolicy::Bounded { delay, .. } => {
                    if attempt >= max_attempts {
                        self.log.error(format!(
                            "Retry limit reached, stopping the server: {err}"
                        ));
                        return Err(HandlerError::RetriesExhausted { attempts: attempt, source: err });
                    }
                    self.log.warn(format!(
                        "Request failed, retrying {attempt}/{max_attempts}: {err}"
                    ));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
