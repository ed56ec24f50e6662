use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::SystemTime,
};

use anyhow::Result;
use tracing::{info, warn};

use super::GatewaySettings;

/// Source of the settings snapshot captured at the start of every request.
pub trait ConfigProvider: Send + Sync {
    fn snapshot(&self) -> Arc<GatewaySettings>;
}

/// Provider that always hands out the same snapshot.
#[derive(Debug, Clone)]
pub struct StaticConfig {
    settings: Arc<GatewaySettings>,
}

impl StaticConfig {
    pub fn new(settings: GatewaySettings) -> Self {
        Self { settings: Arc::new(settings) }
    }
}

impl ConfigProvider for StaticConfig {
    fn snapshot(&self) -> Arc<GatewaySettings> {
        self.settings.clone()
    }
}

/// Provider backed by a TOML file, re-read whenever its modification time changes.
///
/// A file that stops parsing keeps the last good snapshot in service.
#[derive(Debug)]
pub struct FileConfig {
    path: PathBuf,
    state: RwLock<FileConfigState>,
}

#[derive(Debug)]
struct FileConfigState {
    settings: Arc<GatewaySettings>,
    modified: Option<SystemTime>,
}

impl FileConfig {
    /// Load the file once; failure here is a startup error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let modified = modified_at(&path);
        let settings = GatewaySettings::from_file(&path)?;
        Ok(Self {
            path,
            state: RwLock::new(FileConfigState { settings: Arc::new(settings), modified }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn refresh(&self) -> Option<Arc<GatewaySettings>> {
        let modified = modified_at(&self.path);
        {
            let state = self.state.read().unwrap_or_else(|poison| poison.into_inner());
            if state.modified == modified {
                return None;
            }
        }

        let mut state = self.state.write().unwrap_or_else(|poison| poison.into_inner());
        if state.modified == modified {
            return Some(state.settings.clone());
        }
        state.modified = modified;
        match GatewaySettings::from_file(&self.path) {
            Ok(settings) => {
                info!(path = %self.path.display(), "gateway settings reloaded");
                state.settings = Arc::new(settings);
            }
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to reload gateway settings, keeping previous snapshot"
                );
            }
        }
        Some(state.settings.clone())
    }
}

impl ConfigProvider for FileConfig {
    fn snapshot(&self) -> Arc<GatewaySettings> {
        if let Some(settings) = self.refresh() {
            return settings;
        }
        self.state.read().unwrap_or_else(|poison| poison.into_inner()).settings.clone()
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}
