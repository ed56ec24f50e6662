//! Filesystem layout helpers for llm-translate-gateway.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::Result;

use crate::{config::GatewaySettings, error::CoreError};

/// Environment variable that overrides the default root directory.
const ROOT_ENV_KEY: &str = "LLM_GATEWAY_ROOT";
const DEFAULT_ROOT_DIRNAME: &str = ".llm-translate-gateway";
const CONFIG_FILENAME: &str = "gateway.toml";
const GLOSSARY_FILENAME: &str = "_Substitutions.txt";

/// Descriptor for the on-disk directory structure.
#[derive(Clone, Debug)]
pub struct Layout {
    root: PathBuf,
    config_dir: PathBuf,
    logs_dir: PathBuf,
    glossary_dir: PathBuf,
}

impl Layout {
    /// Construct a new layout without touching the filesystem.
    pub fn new(root: PathBuf) -> Self {
        let config_dir = root.join("config");
        let logs_dir = root.join("logs");
        let glossary_dir = root.join("glossary");

        Self { root, config_dir, logs_dir, glossary_dir }
    }

    /// Ensure that all directories exist on disk.
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.root(), self.config_dir(), self.logs_dir(), self.glossary_dir()] {
            if !dir.exists() {
                fs::create_dir_all(dir).map_err(|source| CoreError::CreateDirectory {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    /// Root directory path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Top-level config directory.
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Directory that stores tracing output and the status log.
    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Directory holding the default glossary and its rewrite rules.
    pub fn glossary_dir(&self) -> &Path {
        &self.glossary_dir
    }

    /// Path to the gateway settings file.
    pub fn config_path(&self) -> PathBuf {
        self.config_dir().join(CONFIG_FILENAME)
    }

    /// Path to the human-readable status log written by the log sink.
    pub fn status_log_path(&self) -> PathBuf {
        self.logs_dir().join("status.log")
    }

    /// Directory receiving the rolling tracing files.
    pub fn tracing_log_dir(&self) -> PathBuf {
        self.logs_dir().join("gateway")
    }

    /// Glossary file used when the settings do not name one.
    pub fn default_glossary_path(&self) -> PathBuf {
        self.glossary_dir().join(GLOSSARY_FILENAME)
    }

    /// Load the gateway settings, falling back to defaults when no file exists.
    pub fn load_settings(&self) -> Result<GatewaySettings> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(GatewaySettings::default());
        }
        GatewaySettings::from_file(&path)
    }

    /// Write default settings unless a config file already exists.
    ///
    /// Returns `true` when a new file was written.
    pub fn write_default_settings(&self) -> Result<bool> {
        let path = self.config_path();
        if path.exists() {
            return Ok(false);
        }
        let mut settings = GatewaySettings::default();
        settings.glossary_path = Some(self.default_glossary_path());
        let toml = settings.to_toml_string()?;
        fs::write(&path, toml).map_err(|source| CoreError::WriteConfig { path, source })?;
        Ok(true)
    }
}

/// Determine the default root directory for the gateway.
pub fn default_root() -> Result<PathBuf> {
    if let Ok(value) = env::var(ROOT_ENV_KEY) {
        if !value.trim().is_empty() {
            return Ok(PathBuf::from(value));
        }
    }

    let home = user_home_dir().ok_or(CoreError::HomeDirectoryUnknown)?;
    Ok(home.join(DEFAULT_ROOT_DIRNAME))
}

/// Resolve a user supplied root (expanding `~`) or fall back to [`default_root`].
pub fn resolve_root(root_override: Option<PathBuf>) -> Result<PathBuf> {
    match root_override {
        Some(path) => expand_tilde(path),
        None => default_root(),
    }
}

fn expand_tilde(path: PathBuf) -> Result<PathBuf> {
    if let Some(str_path) = path.to_str() {
        if let Some(stripped) = str_path.strip_prefix('~') {
            let home = user_home_dir().ok_or(CoreError::HomeDirectoryUnknown)?;
            if stripped.is_empty() {
                return Ok(home);
            }
            let stripped = stripped.strip_prefix('/').unwrap_or(stripped);
            return Ok(home.join(stripped));
        }
    }
    Ok(path)
}

fn user_home_dir() -> Option<PathBuf> {
    if let Ok(home) = env::var("HOME") {
        if !home.is_empty() {
            return Some(PathBuf::from(home));
        }
    }

    if let Ok(profile) = env::var("USERPROFILE") {
        if !profile.is_empty() {
            return Some(PathBuf::from(profile));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn writes_default_settings_once() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path().to_path_buf());
        layout.ensure().unwrap();

        assert!(layout.write_default_settings().unwrap());
        assert!(!layout.write_default_settings().unwrap());

        let settings = layout.load_settings().unwrap();
        assert_eq!(settings.port, 6800);
        assert_eq!(settings.glossary_path, Some(layout.default_glossary_path()));
    }

    #[test]
    fn missing_config_loads_defaults() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path().join("nowhere"));
        let settings = layout.load_settings().unwrap();
        assert_eq!(settings.context_len, 5);
    }
}
