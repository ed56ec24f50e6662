//! Regex rewrite rules applied around the model call in glossary mode.
//!
//! Rules live next to the glossary file in `_Preprocessors.txt` (applied to
//! the incoming text) and `_Postprocessors.txt` (applied to the final
//! translation). Each line is `pattern=replacement`; blank lines and lines
//! starting with `;` are ignored, as are patterns that fail to compile.

use std::{
    fs, io,
    path::Path,
    sync::RwLock,
};

use regex::Regex;
use tracing::{debug, warn};

use crate::error::CoreError;

const PRE_RULES_FILENAME: &str = "_Preprocessors.txt";
const POST_RULES_FILENAME: &str = "_Postprocessors.txt";

#[derive(Debug, Clone)]
struct RewriteRule {
    pattern: Regex,
    replacement: String,
}

impl RewriteRule {
    fn apply(&self, text: &str) -> String {
        self.pattern.replace_all(text, self.replacement.as_str()).into_owned()
    }
}

#[derive(Debug, Default)]
struct RuleSets {
    pre: Vec<RewriteRule>,
    post: Vec<RewriteRule>,
}

#[derive(Debug, Default)]
pub struct RewriteRules {
    rules: RwLock<RuleSets>,
}

impl RewriteRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load both rule files from the directory containing `glossary_path`.
    pub fn load_beside(&self, glossary_path: &Path) -> Result<(), CoreError> {
        let dir = glossary_path.parent().map(Path::to_path_buf).unwrap_or_default();
        let pre = read_rules(&dir.join(PRE_RULES_FILENAME))?;
        let post = read_rules(&dir.join(POST_RULES_FILENAME))?;
        debug!(dir = %dir.display(), pre = pre.len(), post = post.len(), "rewrite rules loaded");

        let mut rules = self.rules.write().unwrap_or_else(|poison| poison.into_inner());
        *rules = RuleSets { pre, post };
        Ok(())
    }

    pub fn pre_process(&self, text: &str) -> String {
        let rules = self.rules.read().unwrap_or_else(|poison| poison.into_inner());
        apply_all(&rules.pre, text)
    }

    pub fn post_process(&self, text: &str) -> String {
        let rules = self.rules.read().unwrap_or_else(|poison| poison.into_inner());
        apply_all(&rules.post, text)
    }

    pub fn counts(&self) -> (usize, usize) {
        let rules = self.rules.read().unwrap_or_else(|poison| poison.into_inner());
        (rules.pre.len(), rules.post.len())
    }
}

fn apply_all(rules: &[RewriteRule], text: &str) -> String {
    rules.iter().fold(text.to_string(), |acc, rule| rule.apply(&acc))
}

fn read_rules(path: &Path) -> Result<Vec<RewriteRule>, CoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(CoreError::ReadRules { path: path.to_path_buf(), source }),
    };

    let mut rules = Vec::new();
    for line in content.lines() {
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        let Some((pattern, replacement)) = line.split_once('=') else {
            continue;
        };
        match Regex::new(pattern) {
            Ok(pattern) => rules.push(RewriteRule { pattern, replacement: replacement.to_string() }),
            Err(err) => {
                warn!(path = %path.display(), pattern, error = %err, "skipping invalid rewrite rule")
            }
        }
    }
    Ok(rules)
}
