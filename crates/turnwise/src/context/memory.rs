//! Persistent-memory records and their prompt rendering.
//!
//! The memory store itself lives outside this crate. The engine only receives
//! `{type, content}` records and renders them into the system prompt, either
//! as a Markdown section or as compact `[type] content` lines.

use serde::{Deserialize, Serialize};

fn default_kind() -> String {
    "note".into()
}

/// One memory entry as supplied by the external store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Memory {
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub content: String,
}

impl Memory {
    pub fn new(kind: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            content: content.into(),
        }
    }
}

/// Render memories as a system-prompt section. Empty input renders nothing.
pub fn format_memories(memories: &[Memory], compact: bool) -> String {
    if memories.is_empty() {
        return String::new();
    }
    let mut section = if compact {
        String::from("\n\nMemories:\n")
    } else {
        String::from("\n\n## Persistent Memories\n\n")
    };
    for memory in memories {
        let line = if compact {
            format!("[{}] {}\n", memory.kind, memory.content)
        } else {
            format!("- **{}**: {}\n", title_case(&memory.kind), memory.content)
        };
        section.push_str(&line);
    }
    section
}

/// `user_preference` → `User Preference`.
fn title_case(kind: &str) -> String {
    kind.split(['_', ' '])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
