use std::sync::Mutex;

/// Round-robin cursor over the configured API keys.
///
/// The key list is re-parsed on every call so edits to the settings apply
/// without a restart; only the cursor survives between calls.
#[derive(Debug, Default)]
pub struct KeyRotator {
    cursor: Mutex<usize>,
}

impl KeyRotator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the next key from a comma separated list, or `None` when it holds no usable key.
    pub fn next(&self, raw_keys: &str) -> Option<String> {
        let keys = parse_keys(raw_keys);
        if keys.is_empty() {
            return None;
        }

        let mut cursor = self.cursor.lock().unwrap_or_else(|poison| poison.into_inner());
        if *cursor >= keys.len() {
            *cursor = 0;
        }
        let key = keys[*cursor].to_string();
        *cursor = (*cursor + 1) % keys.len();
        Some(key)
    }
}

/// Split a raw key string into trimmed, non-empty keys.
pub fn parse_keys(raw_keys: &str) -> Vec<&str> {
    raw_keys.split(',').map(str::trim).filter(|key| !key.is_empty()).collect()
}

/// Shorten a key for display (`...abcd`).
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 4 {
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("...{tail}")
    } else {
        key.to_string()
    }
}
