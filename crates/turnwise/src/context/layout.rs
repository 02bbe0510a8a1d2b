//! Message assembly: stable prefix first, volatile dialogue after.
//!
//! Every request is laid out in three layers:
//! 1. **System prompt**: base prompt plus task summary and memories.
//!    Optionally tagged as cacheable.
//! 2. **Stable system messages**: explicit system notices and mounted-file
//!    notices. Mount notices are optionally tagged as cacheable.
//! 3. **Dialogue**: finalized turns rendered from history, then the
//!    in-progress turn.
//!
//! The boundary between layers 2 and 3 is the cache breakpoint. When cache
//! hints are on, [`ContextAssembler::build`] records a [`CacheMetadata`] so a
//! later [`is_cache_valid`](ContextAssembler::is_cache_valid) can tell whether
//! resending would still hit the provider's prefix cache. The metadata is
//! advisory and never feeds back into state.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::budget::TokenEstimator;
use super::memory::{Memory, format_memories};
use super::mounts::is_mount_notice;
use super::truncation::turns_to_messages;
use super::turn::Turn;
use crate::Message;
use crate::config::ContextMode;

/// Hex characters kept from each SHA-256 digest.
const HASH_LEN: usize = 16;

/// Truncated SHA-256 hex digest of `content`.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
        .chars()
        .take(HASH_LEN)
        .collect()
}

/// Hash of the stable system-message layer, order-sensitive.
pub fn stable_layer_hash(messages: &[Message]) -> String {
    let joined: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    content_hash(&joined.join("\u{1e}"))
}

/// Base prompt followed by the task summary and memory sections.
pub fn compose_system_prompt(
    base: &str,
    task_summary: &str,
    memories: &[Memory],
    compact_memories: bool,
) -> String {
    let mut prompt = base.to_string();
    if !task_summary.is_empty() {
        prompt.push_str("\n\n## Current Tasks\n\n");
        prompt.push_str(task_summary);
    }
    prompt.push_str(&format_memories(memories, compact_memories));
    prompt
}

/// Identity of the stable prefix at build time.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CacheMetadata {
    pub system_prompt_hash: String,
    pub stable_layer_hash: String,
    /// Index of the first dialogue message.
    pub cache_breakpoint_index: usize,
}

/// Everything one build needs, borrowed from the manager.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyInput<'a> {
    /// Fully composed system prompt (see [`compose_system_prompt`]).
    pub system_prompt: &'a str,
    pub stable_messages: &'a [Message],
    /// Finalized turns, already truncated as the mode requires.
    pub history: &'a [Turn],
    pub active: &'a [Message],
    pub mode: ContextMode,
    pub cache_hints: bool,
}

/// Output of [`ContextAssembler::build`].
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    pub messages: Vec<Message>,
    /// Present when cache hints were requested.
    pub cache: Option<CacheMetadata>,
    breakpoint: usize,
    history_end: usize,
}

impl AssembledContext {
    /// Number of messages in the stable prefix (layers 1 and 2).
    pub fn stable_len(&self) -> usize {
        self.breakpoint
    }

    /// Per-layer token breakdown.
    pub fn breakdown(&self, estimator: &dyn TokenEstimator) -> ContextBreakdown {
        let (prefix, rest) = self.messages.split_at(self.breakpoint);
        let (history, active) = rest.split_at(self.history_end - self.breakpoint);
        let prefix_tokens = estimator.count(prefix);
        let history_tokens = estimator.count(history);
        let active_tokens = estimator.count(active);
        ContextBreakdown {
            prefix_tokens,
            history_tokens,
            active_tokens,
            total_tokens: prefix_tokens + history_tokens + active_tokens,
        }
    }
}

/// Per-layer breakdown of estimated token usage.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBreakdown {
    /// System prompt plus stable system messages.
    pub prefix_tokens: usize,
    /// Finalized turn history, including any placeholder.
    pub history_tokens: usize,
    /// The in-progress turn.
    pub active_tokens: usize,
    pub total_tokens: usize,
}

/// Orders layers and tracks the last cache metadata.
#[derive(Debug, Default)]
pub struct ContextAssembler {
    last_metadata: Option<CacheMetadata>,
}

impl ContextAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(&mut self, input: AssemblyInput<'_>) -> AssembledContext {
        let mut messages =
            Vec::with_capacity(1 + input.stable_messages.len() + input.history.len() * 3);

        if !input.system_prompt.is_empty() {
            let system = Message::system(input.system_prompt);
            messages.push(if input.cache_hints { system.cached() } else { system });
        }
        for msg in input.stable_messages {
            let msg = msg.clone();
            messages.push(if input.cache_hints && is_mount_notice(&msg.content) {
                msg.cached()
            } else {
                msg
            });
        }
        let breakpoint = messages.len();

        messages.extend(turns_to_messages(input.history));
        let history_end = messages.len();
        messages.extend(input.active.iter().cloned());

        let cache = input.cache_hints.then(|| CacheMetadata {
            system_prompt_hash: content_hash(input.system_prompt),
            stable_layer_hash: stable_layer_hash(input.stable_messages),
            cache_breakpoint_index: breakpoint,
        });
        if let Some(meta) = &cache {
            self.last_metadata = Some(meta.clone());
        }

        debug!(
            mode = %input.mode,
            messages = messages.len(),
            breakpoint,
            "assembled context"
        );

        AssembledContext {
            messages,
            cache,
            breakpoint,
            history_end,
        }
    }

    /// Whether `prompt` and `stable_messages` hash the same as the last
    /// build with cache hints. False if there was no such build.
    pub fn is_cache_valid(&self, prompt: &str, stable_messages: &[Message]) -> bool {
        let Some(last) = &self.last_metadata else {
            return false;
        };
        let valid = content_hash(prompt) == last.system_prompt_hash
            && stable_layer_hash(stable_messages) == last.stable_layer_hash;
        if !valid {
            debug!("cache prefix changed since last build");
        }
        valid
    }

    pub fn last_metadata(&self) -> Option<&CacheMetadata> {
        self.last_metadata.as_ref()
    }

    pub fn reset(&mut self) {
        self.last_metadata = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageRole;
    use crate::context::budget::CharRatioEstimator;
    use crate::context::mounts::mount_notice;
    use crate::context::turn::TurnLog;

    fn input<'a>(
        prompt: &'a str,
        stable: &'a [Message],
        history: &'a [Turn],
        active: &'a [Message],
        cache_hints: bool,
    ) -> AssemblyInput<'a> {
        AssemblyInput {
            system_prompt: prompt,
            stable_messages: stable,
            history,
            active,
            mode: ContextMode::SmartTruncation,
            cache_hints,
        }
    }

    fn one_turn() -> Vec<Turn> {
        let mut log = TurnLog::new();
        log.start_turn("hello").unwrap();
        log.add_assistant_message("hi").unwrap();
        vec![log.complete_turn(None).unwrap()]
    }

    #[test]
    fn hash_is_sixteen_hex_chars() {
        let hash = content_hash("abc");
        assert_eq!(hash, "ba7816bf8f01cfea");
        assert_eq!(content_hash("abc"), hash);
        assert_ne!(content_hash("abd"), hash);
    }

    #[test]
    fn layers_are_ordered_and_breakpoint_recorded() {
        let stable = vec![
            Message::system(mount_notice("a.rs", "fn a() {}")),
            Message::system("Project uses edition 2024"),
        ];
        let history = one_turn();
        let active = vec![Message::user("next question")];

        let mut assembler = ContextAssembler::new();
        let built = assembler.build(input("sys", &stable, &history, &active, true));

        let roles: Vec<MessageRole> = built.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [
                MessageRole::System,
                MessageRole::System,
                MessageRole::System,
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::User,
            ]
        );
        let meta = built.cache.as_ref().unwrap();
        assert_eq!(meta.cache_breakpoint_index, 3);
        assert_eq!(built.stable_len(), 3);

        assert!(built.messages[0].is_cacheable());
        assert!(built.messages[1].is_cacheable());
        // Plain system notices are not tagged.
        assert!(!built.messages[2].is_cacheable());
        assert!(!built.messages[3].is_cacheable());
    }

    #[test]
    fn no_hints_no_metadata_no_tags() {
        let stable = vec![Message::system(mount_notice("a.rs", "x"))];
        let mut assembler = ContextAssembler::new();
        let built = assembler.build(input("sys", &stable, &[], &[], false));
        assert!(built.cache.is_none());
        assert!(built.messages.iter().all(|m| !m.is_cacheable()));
        assert!(!assembler.is_cache_valid("sys", &stable));
    }

    #[test]
    fn cache_validity_tracks_both_layers() {
        let stable = vec![Message::system(mount_notice("a.rs", "v1"))];
        let mut assembler = ContextAssembler::new();
        assembler.build(input("sys", &stable, &[], &[], true));

        assert!(assembler.is_cache_valid("sys", &stable));
        assert!(!assembler.is_cache_valid("sys v2", &stable));
        let changed = vec![Message::system(mount_notice("a.rs", "v2"))];
        assert!(!assembler.is_cache_valid("sys", &changed));
    }

    #[test]
    fn empty_prompt_is_omitted() {
        let mut assembler = ContextAssembler::new();
        let built = assembler.build(input("", &[], &one_turn(), &[], true));
        assert_eq!(built.messages[0].role, MessageRole::User);
        assert_eq!(built.cache.unwrap().cache_breakpoint_index, 0);
    }

    #[test]
    fn compose_appends_tasks_then_memories() {
        let prompt = compose_system_prompt(
            "Base.",
            "- [ ] write tests",
            &[Memory::new("note", "be brief")],
            true,
        );
        assert_eq!(
            prompt,
            "Base.\n\n## Current Tasks\n\n- [ ] write tests\n\nMemories:\n[note] be brief\n"
        );
        assert_eq!(compose_system_prompt("Base.", "", &[], false), "Base.");
    }

    #[test]
    fn breakdown_splits_by_layer() {
        let history = one_turn();
        let active = vec![Message::user("x".repeat(35))];
        let mut assembler = ContextAssembler::new();
        let built = assembler.build(input(&"s".repeat(70), &[], &history, &active, false));

        let breakdown = built.breakdown(&CharRatioEstimator::default());
        assert_eq!(breakdown.prefix_tokens, 20);
        assert_eq!(breakdown.active_tokens, 10);
        assert!(breakdown.history_tokens > 0);
        assert_eq!(
            breakdown.total_tokens,
            breakdown.prefix_tokens + breakdown.history_tokens + breakdown.active_tokens
        );
    }
}
