use serde::{Deserialize, Serialize};

use super::context::Turn;
use crate::config::GatewaySettings;

const TERM_INSTRUCTION: &str = "【Instruction】:\n\
If you find NEW proper nouns (names, places) that are not listed in Known Terms, \
append them after the translation as <tm>Original=Translated</tm>, one pair per tag.\n\
Only extract proper nouns, no verbs or common nouns.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// The user message sent for `text`: pre-prompt and text joined without a separator.
pub fn user_content(settings: &GatewaySettings, text: &str) -> String {
    format!("{}{}", settings.pre_prompt, text)
}

/// Assemble the message list for one translation call.
pub fn build(
    settings: &GatewaySettings,
    glossary_context: &str,
    history: &[Turn],
    text: &str,
) -> Vec<ChatMessage> {
    let mut system = settings.system_prompt.clone();
    if settings.glossary_enabled {
        if !glossary_context.is_empty() {
            system.push_str("\n\n");
            system.push_str(glossary_context);
        }
        system.push_str("\n\n");
        system.push_str(TERM_INSTRUCTION);
    }

    let mut messages = Vec::with_capacity(history.len() * 2 + 2);
    messages.push(ChatMessage::system(system));
    for turn in history {
        messages.push(ChatMessage::user(turn.request.clone()));
        messages.push(ChatMessage::assistant(turn.response.clone()));
    }
    messages.push(ChatMessage::user(user_content(settings, text)));
    messages
}
