//! Self-extending term glossary backed by a `key=value` text file.

use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use thiserror::Error;
use tracing::{debug, info};

const CONTEXT_HEADER: &str = "【已知术语/Known Terms】:";

#[derive(Debug, Error)]
pub enum GlossaryError {
    #[error("failed to read glossary file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to append to glossary file {path}")]
    Append {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Default)]
struct GlossaryState {
    path: Option<PathBuf>,
    terms: BTreeMap<String, String>,
}

/// Known source terms and their translations.
///
/// Entries are never overwritten: the first translation recorded for a term wins.
#[derive(Debug, Default)]
pub struct GlossaryStore {
    state: Mutex<GlossaryState>,
}

impl GlossaryStore {
    /// Store with no backing file; [`GlossaryStore::add`] is a no-op until [`GlossaryStore::load`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the in-memory terms with the contents of `path`.
    ///
    /// A missing file is an empty glossary; the path still becomes the backing
    /// file so the first discovered term creates it.
    pub fn load(&self, path: &Path) -> Result<usize, GlossaryError> {
        let terms = read_terms(path)?;
        let count = terms.len();
        let mut state = self.lock();
        state.path = Some(path.to_path_buf());
        state.terms = terms;
        info!(path = %path.display(), terms = count, "glossary loaded");
        Ok(count)
    }

    /// Load `path` unless it is already the backing file. Returns `true` when a load happened.
    pub fn ensure_loaded(&self, path: &Path) -> Result<bool, GlossaryError> {
        if self.lock().path.as_deref() == Some(path) {
            return Ok(false);
        }
        self.load(path)?;
        Ok(true)
    }

    /// Prompt block listing every known term that occurs in `text`, or `""`.
    ///
    /// Matching is plain substring containment, so a short term also matches
    /// inside longer words.
    pub fn context_for(&self, text: &str) -> String {
        let state = self.lock();
        let found: Vec<String> = state
            .terms
            .iter()
            .filter(|(term, _)| text.contains(term.as_str()))
            .map(|(term, translation)| format!("{term} = {translation}"))
            .collect();
        if found.is_empty() {
            return String::new();
        }
        format!("{CONTEXT_HEADER}\n{}\n", found.join("\n"))
    }

    /// Record a newly discovered term. Returns `true` when it was persisted.
    ///
    /// The file line is written before the in-memory insert, under the same lock.
    pub fn add(&self, term: &str, translation: &str) -> Result<bool, GlossaryError> {
        let term = term.trim();
        let translation = translation.trim();
        if !is_storable(term) || !is_storable(translation) {
            return Ok(false);
        }

        let mut state = self.lock();
        let Some(path) = state.path.clone() else {
            return Ok(false);
        };
        if state.terms.contains_key(term) {
            return Ok(false);
        }

        append_line(&path, term, translation)
            .map_err(|source| GlossaryError::Append { path: path.clone(), source })?;
        state.terms.insert(term.to_string(), translation.to_string());
        debug!(term, translation, "glossary term appended");
        Ok(true)
    }

    pub fn get(&self, term: &str) -> Option<String> {
        self.lock().terms.get(term).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GlossaryState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

fn is_storable(value: &str) -> bool {
    !value.is_empty() && !value.contains('=') && !value.contains(['\n', '\r'])
}

fn read_terms(path: &Path) -> Result<BTreeMap<String, String>, GlossaryError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => return Err(GlossaryError::Read { path: path.to_path_buf(), source }),
    };

    let mut terms = BTreeMap::new();
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            continue;
        }
        terms.entry(key.to_string()).or_insert_with(|| value.to_string());
    }
    Ok(terms)
}

fn append_line(path: &Path, term: &str, translation: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{term}={translation}")
}
