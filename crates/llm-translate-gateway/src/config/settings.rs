use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CoreError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_PORT: u16 = 6800;
const DEFAULT_MAX_THREADS: usize = 8;
const DEFAULT_CONTEXT_LEN: usize = 5;
const DEFAULT_TEMPERATURE: f64 = 1.0;
const DEFAULT_SYSTEM_PROMPT: &str = "你是一个游戏翻译模型，可以流畅通顺地将任意的游戏文本翻译成简体中文，\
并联系上下文正确使用人称代词，不要进行任何额外的格式修改，不擅自添加原文中没有的代词。\
你的回答只有翻译文本！不允许回答翻译文本之外的内容！不允许解释你是怎么样翻译的！\
如果游戏文本是一个字母或符号回答原文本即可！";
const DEFAULT_PRE_PROMPT: &str = "将下面的文本翻译成简体中文：";

/// How the request handler reacts to a failed upstream call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    /// A failed call is reported to the requester as HTTP 500.
    #[default]
    None,
    /// Failed calls are retried; exhausting the attempts stops the server.
    Bounded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrySettings {
    pub mode: RetryMode,
    pub max_attempts: u32,
    /// Pause between attempts.
    pub delay_ms: u64,
    /// Budget measured from the first attempt; a slower success counts as a failure.
    pub timeout_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { mode: RetryMode::None, max_attempts: 5, delay_ms: 5_000, timeout_ms: 60_000 }
    }
}

/// Retry behaviour resolved from [`RetrySettings`] for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Disabled,
    Bounded { max_attempts: u32, delay: Duration, timeout: Duration },
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::Disabled => 1,
            RetryPolicy::Bounded { max_attempts, .. } => (*max_attempts).max(1),
        }
    }
}

/// Snapshot of every setting the request pipeline consumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewaySettings {
    /// Base URL of the OpenAI-compatible API (without `/chat/completions`).
    pub base_url: String,
    /// Comma separated API keys, rotated per request.
    pub api_keys: String,
    pub model: String,
    pub port: u16,
    /// Advisory cap on concurrently handled requests.
    pub max_threads: usize,
    pub system_prompt: String,
    /// Text prepended verbatim to every request.
    pub pre_prompt: String,
    pub temperature: f64,
    /// Number of (request, translation) turns replayed per client.
    pub context_len: usize,
    pub glossary_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub glossary_path: Option<PathBuf>,
    /// Transport timeout applied to each upstream call.
    pub request_timeout_ms: u64,
    pub retry: RetrySettings,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_keys: String::new(),
            model: DEFAULT_MODEL.to_string(),
            port: DEFAULT_PORT,
            max_threads: DEFAULT_MAX_THREADS,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            pre_prompt: DEFAULT_PRE_PROMPT.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            context_len: DEFAULT_CONTEXT_LEN,
            glossary_enabled: false,
            glossary_path: None,
            request_timeout_ms: 60_000,
            retry: RetrySettings::default(),
        }
    }
}

impl GatewaySettings {
    /// Load from a TOML file and validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|source| CoreError::ReadConfig { path: path.to_path_buf(), source })?;
        let mut settings: GatewaySettings = toml_edit::de::from_str(&content)
            .map_err(|source| CoreError::ParseToml { path: path.to_path_buf(), source })?;

        settings.base_url = settings.base_url.trim().to_string();
        settings.model = settings.model.trim().to_string();
        if let Some(glossary) = settings.glossary_path.take() {
            settings.glossary_path =
                (!glossary.as_os_str().is_empty()).then(|| resolve_relative(path, glossary));
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Persist to TOML format.
    pub fn to_toml_string(&self) -> Result<String> {
        toml_edit::ser::to_string_pretty(self)
            .map_err(|source| CoreError::SerialiseToml { source }.into())
    }

    /// Validate invariants (parsable url, model present, temperature range).
    pub fn validate(&self) -> Result<()> {
        let base_url = self.base_url.trim();
        if base_url.is_empty() {
            return Err(CoreError::BaseUrlEmpty.into());
        }
        Url::parse(base_url).map_err(|source| CoreError::BaseUrlInvalid {
            url: base_url.to_string(),
            source,
        })?;
        if self.model.trim().is_empty() {
            return Err(CoreError::ModelNameEmpty.into());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(CoreError::TemperatureOutOfRange { value: self.temperature }.into());
        }
        if self.port == 0 {
            return Err(CoreError::PortZero.into());
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self.retry.mode {
            RetryMode::None => RetryPolicy::Disabled,
            RetryMode::Bounded => RetryPolicy::Bounded {
                max_attempts: self.retry.max_attempts,
                delay: Duration::from_millis(self.retry.delay_ms),
                timeout: Duration::from_millis(self.retry.timeout_ms),
            },
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Glossary file to use when glossary mode is on.
    pub fn active_glossary_path(&self) -> Option<&Path> {
        if !self.glossary_enabled {
            return None;
        }
        self.glossary_path.as_deref()
    }
}

// Relative glossary paths are taken relative to the config file.
fn resolve_relative(config_path: &Path, glossary: PathBuf) -> PathBuf {
    if glossary.is_absolute() {
        return glossary;
    }
    match config_path.parent() {
        Some(parent) => parent.join(glossary),
        None => glossary,
    }
}
