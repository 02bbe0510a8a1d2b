//! The context manager: one owner for turns, mounts, memories and mode.
//!
//! [`ContextManager`] is the only writer of conversation state. It delegates
//! turn bookkeeping to [`TurnLog`], sizing to [`TokenBudget`], eviction to
//! [`TruncationEngine`] and serialization to [`ContextAssembler`]; none of
//! those keep a second copy of history.
//!
//! Eviction timing depends on the mode:
//!
//! - **Smart truncation** checks the smart threshold after every
//!   [`complete_turn`](ContextManager::complete_turn).
//! - **Cache optimized** checks the higher cache threshold lazily, on the
//!   next [`start_turn`](ContextManager::start_turn), so the prefix built for
//!   the previous request stays cacheable as long as possible.
//!
//! In both cases the trigger is measured on the whole assembled context and
//! the truncation target is what remains for history after the stable
//! prefix.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::budget::{CharRatioEstimator, ContextUsage, TokenBudget, TokenEstimator};
use super::layout::{
    AssembledContext, AssemblyInput, CacheMetadata, ContextAssembler, ContextBreakdown,
    compose_system_prompt, content_hash,
};
use super::memory::Memory;
use super::mounts::{MountTable, MountedFile, mount_notice, normalize_path};
use super::state::StateStats;
use super::truncation::TruncationEngine;
use super::turn::{FileOperation, Turn, TurnLog, TurnSummary};
use crate::Message;
use crate::config::{ContextConfig, ContextMode};
use crate::error::{ContextError, Result};

/// Summary recorded on a turn that was still open when context was cleared.
const CLEARED_TURN_SUMMARY: &str = "Context cleared";

/// Result of [`ContextManager::add_system_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Identical content was already present; nothing changed.
    Duplicate,
}

/// What [`ContextManager::clear_context_with`] keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearOptions {
    pub keep_memories: bool,
    pub keep_mounted_files: bool,
}

impl Default for ClearOptions {
    fn default() -> Self {
        Self {
            keep_memories: true,
            keep_mounted_files: false,
        }
    }
}

/// Thresholds of the budget in effect.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub effective_max_tokens: usize,
    pub cache_threshold: usize,
    pub smart_threshold: usize,
    pub target_after_truncation: usize,
}

impl From<TokenBudget> for Thresholds {
    fn from(budget: TokenBudget) -> Self {
        Self {
            effective_max_tokens: budget.effective_max_tokens(),
            cache_threshold: budget.cache_threshold(),
            smart_threshold: budget.smart_threshold(),
            target_after_truncation: budget.target_after_truncation(),
        }
    }
}

/// Point-in-time statistics.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ContextStats {
    pub mode: ContextMode,
    pub model: String,
    pub max_tokens: usize,
    pub thresholds: Thresholds,
    pub usage: ContextUsage,
    pub breakdown: ContextBreakdown,
    /// Finalized turns, including a placeholder if present.
    pub turn_count: usize,
    pub turns_started: usize,
    pub active_turn: Option<String>,
    pub compressed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_state: Option<StateStats>,
    pub system_messages: usize,
    pub mounted_files: usize,
    pub mounted_tokens: usize,
    /// Files registered by tools; mounts are counted separately.
    pub files_in_context: usize,
    pub memories: usize,
    pub cache_valid: bool,
}

/// Serializable snapshot of everything the manager holds.
#[derive(Serialize, Debug, Clone)]
pub struct ContextExport {
    pub exported_at: chrono::DateTime<Utc>,
    pub mode: ContextMode,
    pub model: String,
    pub memories: Vec<Memory>,
    pub task_summary: String,
    pub system_messages: Vec<String>,
    pub mounted_files: Vec<PathBuf>,
    pub turns: Vec<Turn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_turn: Option<Turn>,
    pub stats: ContextStats,
}

/// Orchestrates the turn log, truncation and assembly.
pub struct ContextManager {
    config: ContextConfig,
    estimator: Box<dyn TokenEstimator>,
    engine: TruncationEngine,
    assembler: ContextAssembler,
    turn_log: TurnLog,
    /// Finalized turns; the only stored history.
    turns: Vec<Turn>,
    system_messages: Vec<Message>,
    system_hashes: HashSet<String>,
    mounts: MountTable,
    /// Files registered by tools. Mounted files are answered from `mounts`.
    files_in_context: BTreeSet<PathBuf>,
    memories: Vec<Memory>,
    task_summary: String,
}

impl std::fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextManager")
            .field("mode", &self.config.mode)
            .field("model", &self.config.model)
            .field("turns", &self.turns.len())
            .field("active", &self.turn_log.is_active())
            .field("mounts", &self.mounts.len())
            .finish_non_exhaustive()
    }
}

impl ContextManager {
    /// Like [`new`](Self::new), but rejects a config that fails
    /// [`ContextConfig::validate`].
    pub fn try_new(config: ContextConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config))
    }

    /// Manager with the default [`CharRatioEstimator`]. The compression
    /// strategy is fixed here from `use_structured_state`.
    ///
    /// The config is taken as is; builder-made configs are not validated
    /// here (see [`try_new`](Self::try_new)).
    pub fn new(config: ContextConfig) -> Self {
        let engine = TruncationEngine::from_config(&config);
        Self {
            config,
            estimator: Box::new(CharRatioEstimator::default()),
            engine,
            assembler: ContextAssembler::new(),
            turn_log: TurnLog::new(),
            turns: Vec::new(),
            system_messages: Vec::new(),
            system_hashes: HashSet::new(),
            mounts: MountTable::new(),
            files_in_context: BTreeSet::new(),
            memories: Vec::new(),
            task_summary: String::new(),
        }
    }

    /// Replace the token estimator.
    pub fn with_estimator(mut self, estimator: impl TokenEstimator + 'static) -> Self {
        self.estimator = Box::new(estimator);
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    // ── Mode and model ─────────────────────────────────────────────

    pub fn mode(&self) -> ContextMode {
        self.config.mode
    }

    /// Switch modes. Leaving cache-optimized mode applies smart truncation
    /// immediately.
    pub fn set_mode(&mut self, mode: ContextMode) {
        let previous = self.config.mode;
        self.config.mode = mode;
        if previous != mode {
            info!("Context mode: {previous} → {mode}");
        }
        if previous == ContextMode::CacheOptimized && mode == ContextMode::SmartTruncation {
            self.truncate_if_needed(ContextMode::SmartTruncation);
        }
    }

    /// Change the active model. Thresholds follow on the next computation.
    pub fn set_model(&mut self, model: impl Into<String>) {
        self.config.model = model.into();
        info!(
            "Context model: {} ({} tokens)",
            self.config.model,
            self.config.max_tokens()
        );
    }

    pub fn set_extended_context(&mut self, enabled: bool) {
        self.config.use_extended_context = enabled;
        debug!(enabled, max_tokens = self.config.max_tokens(), "extended context toggled");
    }

    /// Budget for the model and buffer configured right now.
    pub fn budget(&self) -> TokenBudget {
        TokenBudget::for_config(&self.config)
    }

    // ── Prompt inputs ──────────────────────────────────────────────

    pub fn set_memories(&mut self, memories: Vec<Memory>) {
        self.memories = memories;
    }

    pub fn memories(&self) -> &[Memory] {
        &self.memories
    }

    /// Text injected as a `## Current Tasks` section of the system prompt.
    pub fn set_task_summary(&mut self, summary: impl Into<String>) {
        self.task_summary = summary.into();
    }

    /// System prompt as it would be sent now.
    pub fn system_prompt(&self) -> String {
        compose_system_prompt(
            &self.config.system_prompt,
            &self.task_summary,
            &self.memories,
            self.config.compact_memory_format,
        )
    }

    /// Append a stable system message unless identical content is present.
    pub fn add_system_message(&mut self, content: impl Into<String>) -> AddOutcome {
        let content = content.into();
        if !self.system_hashes.insert(content_hash(&content)) {
            debug!("duplicate system message ignored");
            return AddOutcome::Duplicate;
        }
        self.system_messages.push(Message::system(content));
        AddOutcome::Added
    }

    /// Explicit system messages followed by mount notices.
    pub fn stable_messages(&self) -> Vec<Message> {
        let mut stable = self.system_messages.clone();
        stable.extend(self.mounts.notices());
        stable
    }

    // ── Mounted files ──────────────────────────────────────────────

    /// Mount (or re-mount) a file. It reports as in context while mounted.
    pub fn mount_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref();
        let normalized = normalize_path(path);
        let display_path = path.display().to_string();
        let content = content.into();
        let token_count = self
            .estimator
            .count(&[Message::system(mount_notice(&display_path, &content))]);

        let added = self.mounts.mount(MountedFile {
            path: normalized.clone(),
            display_path,
            content,
            token_count,
            refreshed_at: Utc::now(),
        });
        info!(
            "{} {} (~{token_count} tokens)",
            if added { "Mounted" } else { "Re-mounted" },
            normalized.display()
        );
    }

    /// Returns false if the path was not mounted.
    pub fn unmount_file(&mut self, path: impl AsRef<Path>) -> bool {
        let normalized = normalize_path(path);
        let removed = self.mounts.unmount(&normalized).is_some();
        if removed {
            info!("Unmounted {}", normalized.display());
        }
        removed
    }

    /// Whether a tool should skip re-emitting this file.
    pub fn is_file_in_context(&self, path: impl AsRef<Path>) -> bool {
        let normalized = normalize_path(path);
        self.files_in_context.contains(&normalized) || self.mounts.contains(&normalized)
    }

    /// Register a file a tool emitted. Ignored unless file dedup is on.
    pub fn add_file_to_context(&mut self, path: impl AsRef<Path>) {
        if self.config.deduplicate_file_content {
            self.files_in_context.insert(normalize_path(path));
        }
    }

    /// Forget tool-registered files. Mounted files stay in context.
    pub fn clear_file_tracking(&mut self) {
        self.files_in_context.clear();
    }

    pub fn mounted_files(&self) -> impl Iterator<Item = &MountedFile> {
        self.mounts.iter()
    }

    /// Re-read a mounted file from disk.
    ///
    /// Returns `Ok(false)` if the path is not mounted, or if the file is gone
    /// (it is unmounted). Other read failures are errors.
    pub fn refresh_mounted_file(&mut self, path: impl AsRef<Path>) -> Result<bool> {
        let normalized = normalize_path(path);
        if !self.mounts.contains(&normalized) {
            return Ok(false);
        }
        let content = match std::fs::read_to_string(&normalized) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Mounted file {} no longer exists; unmounting", normalized.display());
                self.unmount_file(&normalized);
                return Ok(false);
            }
            Err(e) => return Err(ContextError::io(normalized, e)),
        };

        let estimator = &self.estimator;
        if let Some(file) = self.mounts.get_mut(&normalized) {
            file.token_count =
                estimator.count(&[Message::system(mount_notice(&file.display_path, &content))]);
            file.content = content;
            file.refreshed_at = Utc::now();
            debug!(path = %normalized.display(), tokens = file.token_count, "mounted file refreshed");
        }
        Ok(true)
    }

    // ── Turns ──────────────────────────────────────────────────────

    /// Open a turn. In cache-optimized mode this is where a deferred
    /// eviction check runs.
    pub fn start_turn(&mut self, user_message: impl Into<String>) -> Result<String> {
        if let Some(active) = self.turn_log.current() {
            return Err(ContextError::TurnAlreadyActive {
                turn_id: active.id.clone(),
            });
        }
        if self.config.mode == ContextMode::CacheOptimized {
            self.truncate_if_needed(ContextMode::CacheOptimized);
        }
        self.turn_log.start_turn(user_message)
    }

    pub fn add_assistant_message(&mut self, content: impl Into<String>) -> Result<()> {
        self.turn_log.add_assistant_message(content)
    }

    pub fn add_tool_call(&mut self, tool: impl Into<String>, args: serde_json::Value) -> Result<()> {
        self.turn_log.add_tool_call(tool, args)
    }

    pub fn add_tool_response(
        &mut self,
        tool: impl Into<String>,
        result: impl Into<String>,
    ) -> Result<()> {
        self.turn_log.add_tool_response(tool, result)
    }

    pub fn track_file_operation(&mut self, op: FileOperation, path: &str) {
        self.turn_log.track_file_operation(op, path);
    }

    /// Finalize the active turn and append it to history. Smart-truncation
    /// mode evicts right away when over threshold.
    pub fn complete_turn(&mut self, summary: Option<String>) -> Result<Turn> {
        let turn = self.turn_log.complete_turn(summary)?;
        info!("Turn {} completed: {}", turn.id, turn.summary_text());
        self.turns.push(turn.clone());
        if self.config.mode == ContextMode::SmartTruncation {
            self.truncate_if_needed(ContextMode::SmartTruncation);
        }
        Ok(turn)
    }

    pub fn is_turn_active(&self) -> bool {
        self.turn_log.is_active()
    }

    pub fn active_turn(&self) -> Option<&Turn> {
        self.turn_log.current()
    }

    /// Finalized history, oldest first.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    // ── Eviction ───────────────────────────────────────────────────

    fn truncate_if_needed(&mut self, mode: ContextMode) {
        if self.turns.is_empty() {
            return;
        }
        let budget = self.budget();
        let threshold = budget.threshold(mode);

        let prompt = self.system_prompt();
        let stable = self.stable_messages();
        let active = self.turn_log.active_messages();
        let built = ContextAssembler::new().build(self.assembly_input(&prompt, &stable, &active));
        let breakdown = built.breakdown(self.estimator.as_ref());
        if breakdown.total_tokens <= threshold {
            return;
        }

        let target = budget
            .target_after_truncation()
            .saturating_sub(breakdown.prefix_tokens + breakdown.active_tokens);
        info!(
            "Context ~{} tokens over {mode} threshold {threshold}; truncating history to ~{target}",
            breakdown.total_tokens
        );
        let outcome = self.engine.run(&self.turns, target, self.estimator.as_ref());
        if outcome.changed() {
            self.turns = outcome.turns;
        }
    }

    // ── Assembly ───────────────────────────────────────────────────

    fn assembly_input<'a>(
        &'a self,
        prompt: &'a str,
        stable: &'a [Message],
        active: &'a [Message],
    ) -> AssemblyInput<'a> {
        AssemblyInput {
            system_prompt: prompt,
            stable_messages: stable,
            history: &self.turns,
            active,
            mode: self.config.mode,
            cache_hints: self.config.enable_cache_hints,
        }
    }

    /// Assemble the request and record cache metadata.
    pub fn build_context(&mut self) -> AssembledContext {
        let prompt = self.system_prompt();
        let stable = self.stable_messages();
        let active = self.turn_log.active_messages();
        let input = AssemblyInput {
            system_prompt: &prompt,
            stable_messages: &stable,
            history: &self.turns,
            active: &active,
            mode: self.config.mode,
            cache_hints: self.config.enable_cache_hints,
        };
        self.assembler.build(input)
    }

    /// Ordered messages for the LLM transport.
    pub fn get_context_for_api(&mut self) -> Vec<Message> {
        self.build_context().messages
    }

    /// Metadata from the last build with cache hints.
    pub fn cache_metadata(&self) -> Option<&CacheMetadata> {
        self.assembler.last_metadata()
    }

    /// Whether the current stable prefix matches the last cached build.
    pub fn is_cache_valid(&self) -> bool {
        self.assembler
            .is_cache_valid(&self.system_prompt(), &self.stable_messages())
    }

    // ── Statistics and export ──────────────────────────────────────

    pub fn usage(&self) -> ContextUsage {
        self.context_stats().usage
    }

    pub fn context_stats(&self) -> ContextStats {
        let budget = self.budget();
        let prompt = self.system_prompt();
        let stable = self.stable_messages();
        let active = self.turn_log.active_messages();
        let built = ContextAssembler::new().build(self.assembly_input(&prompt, &stable, &active));
        let estimate = self.estimator.estimate(&built.messages);

        let placeholder = self.turns.first().filter(|t| t.is_placeholder());
        let compressed_state = placeholder.and_then(|t| match &t.summary {
            Some(TurnSummary::State(state)) => Some(state.stats()),
            _ => None,
        });

        ContextStats {
            mode: self.config.mode,
            model: self.config.model.clone(),
            max_tokens: budget.max_tokens(),
            thresholds: budget.into(),
            usage: budget.usage(
                &estimate,
                self.config.context_warning_threshold,
                self.config.critical_threshold,
            ),
            breakdown: built.breakdown(self.estimator.as_ref()),
            turn_count: self.turns.len(),
            turns_started: self.turn_log.turns_started(),
            active_turn: self.turn_log.current().map(|t| t.id.clone()),
            compressed: placeholder.is_some(),
            compressed_state,
            system_messages: self.system_messages.len(),
            mounted_files: self.mounts.len(),
            mounted_tokens: self.mounts.total_tokens(),
            files_in_context: self.files_in_context.len(),
            memories: self.memories.len(),
            cache_valid: self.is_cache_valid(),
        }
    }

    pub fn export_context(&self) -> ContextExport {
        ContextExport {
            exported_at: Utc::now(),
            mode: self.config.mode,
            model: self.config.model.clone(),
            memories: self.memories.clone(),
            task_summary: self.task_summary.clone(),
            system_messages: self
                .system_messages
                .iter()
                .map(|m| m.content.clone())
                .collect(),
            mounted_files: self.mounts.iter().map(|f| f.path.clone()).collect(),
            turns: self.turns.clone(),
            active_turn: self.turn_log.current().cloned(),
            stats: self.context_stats(),
        }
    }

    // ── Clearing ───────────────────────────────────────────────────

    /// Clear history and system messages; mounts are cleared too.
    pub fn clear_context(&mut self, keep_memories: bool) {
        self.clear_context_with(ClearOptions {
            keep_memories,
            keep_mounted_files: false,
        });
    }

    /// Clear history and system messages. An open turn is closed first.
    pub fn clear_context_with(&mut self, options: ClearOptions) {
        if self.turn_log.is_active()
            && let Ok(turn) = self
                .turn_log
                .complete_turn(Some(CLEARED_TURN_SUMMARY.to_string()))
        {
            debug!(turn_id = %turn.id, "closed active turn before clearing");
        }
        let dropped = self.turns.len();
        self.turns.clear();
        self.system_messages.clear();
        self.system_hashes.clear();
        if !options.keep_memories {
            self.memories.clear();
        }
        if !options.keep_mounted_files {
            self.mounts.clear();
            self.files_in_context.clear();
        }
        self.assembler.reset();
        info!(
            "Context cleared: {dropped} turns dropped (memories kept: {}, mounts kept: {})",
            options.keep_memories, options.keep_mounted_files
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageRole;
    use crate::context::budget::TokenEstimate;
    use serde_json::json;

    fn bytes(messages: &[Message]) -> TokenEstimate {
        TokenEstimate {
            total: messages.iter().map(|m| m.content.len()).sum(),
            by_role: Default::default(),
        }
    }

    /// Window of 1000 tokens, no buffer: smart threshold 700, cache 900,
    /// target 630.
    fn small_config() -> ContextConfig {
        ContextConfig::default()
            .with_model("tiny")
            .with_model_limit("tiny", 1000)
            .with_token_buffer(0.0)
    }

    fn run_turn(ctx: &mut ContextManager, request: &str, body: usize) -> Turn {
        ctx.start_turn(request).unwrap();
        ctx.add_assistant_message("a".repeat(body)).unwrap();
        ctx.complete_turn(None).unwrap()
    }

    #[test]
    fn system_messages_are_deduplicated() {
        let mut ctx = ContextManager::new(ContextConfig::default());
        assert_eq!(ctx.add_system_message("X"), AddOutcome::Added);
        assert_eq!(ctx.add_system_message("X"), AddOutcome::Duplicate);
        assert_eq!(ctx.stable_messages().len(), 1);
    }

    #[test]
    fn start_while_active_is_rejected() {
        let mut ctx = ContextManager::new(ContextConfig::default());
        ctx.start_turn("one").unwrap();
        let err = ctx.start_turn("two").unwrap_err();
        assert!(err.is_programmer_error());
        assert!(ctx.add_tool_call("grep", json!({"pattern": "x"})).is_ok());
    }

    #[test]
    fn appends_while_idle_are_rejected() {
        let mut ctx = ContextManager::new(ContextConfig::default());
        assert!(ctx.add_assistant_message("hi").is_err());
        assert!(ctx.add_tool_response("grep", "x").is_err());
        assert!(ctx.complete_turn(None).is_err());
    }

    #[test]
    fn smart_mode_truncates_after_completion() {
        let mut ctx = ContextManager::new(small_config()).with_estimator(bytes);
        for i in 0..6 {
            run_turn(&mut ctx, &format!("request {i}"), 150);
        }
        assert!(ctx.turns()[0].is_placeholder());
        assert!(ctx.context_stats().usage.estimated_tokens <= 700);
        assert_eq!(ctx.turns().last().map(|t| t.id.as_str()), Some("turn_006"));
    }

    #[test]
    fn cache_mode_defers_until_next_start() {
        let config = small_config().with_mode(ContextMode::CacheOptimized);
        let mut ctx = ContextManager::new(config).with_estimator(bytes);
        for i in 0..6 {
            run_turn(&mut ctx, &format!("request {i}"), 150);
        }
        // 6 × 159 = 954 > 900, but nothing runs until the next start_turn.
        assert_eq!(ctx.turns().len(), 6);
        assert!(!ctx.turns()[0].is_placeholder());

        ctx.start_turn("request 6").unwrap();
        assert!(ctx.turns()[0].is_placeholder());
    }

    #[test]
    fn switching_to_smart_truncates_immediately() {
        let config = small_config().with_mode(ContextMode::CacheOptimized);
        let mut ctx = ContextManager::new(config).with_estimator(bytes);
        for i in 0..5 {
            run_turn(&mut ctx, &format!("request {i}"), 150);
        }
        assert_eq!(ctx.turns().len(), 5);
        ctx.set_mode(ContextMode::SmartTruncation);
        assert!(ctx.turns()[0].is_placeholder());
    }

    #[test]
    fn model_switch_changes_budget_immediately() {
        let mut ctx = ContextManager::new(ContextConfig::default().with_model("grok-4"));
        let before = ctx.budget().smart_threshold();
        ctx.set_extended_context(true);
        assert!(ctx.budget().smart_threshold() > before);
        ctx.set_model("unknown-model");
        assert_eq!(ctx.budget().max_tokens(), 128_000);
    }

    #[test]
    fn mounted_files_are_in_context_and_cacheable() {
        let config = ContextConfig::default()
            .with_system_prompt("sys")
            .with_cache_hints(true);
        let mut ctx = ContextManager::new(config);
        ctx.mount_file("./src/lib.rs", "pub mod a;");
        assert!(ctx.is_file_in_context("src/lib.rs"));

        let built = ctx.build_context();
        assert_eq!(built.cache.as_ref().unwrap().cache_breakpoint_index, 2);
        assert!(built.messages[1].content.starts_with("User added file './src/lib.rs'"));
        assert!(built.messages[1].is_cacheable());
        assert!(ctx.is_cache_valid());

        ctx.mount_file("src/lib.rs", "pub mod b;");
        assert!(!ctx.is_cache_valid());
        assert_eq!(ctx.mounted_files().count(), 1);

        assert!(ctx.unmount_file("src/lib.rs"));
        assert!(!ctx.unmount_file("src/lib.rs"));
        assert!(!ctx.is_file_in_context("src/lib.rs"));
    }

    #[test]
    fn file_tracking_respects_dedup_flag() {
        let mut config = ContextConfig::default();
        config.deduplicate_file_content = false;
        let mut ctx = ContextManager::new(config);
        ctx.add_file_to_context("a.rs");
        assert!(!ctx.is_file_in_context("a.rs"));

        let mut ctx = ContextManager::new(ContextConfig::default());
        ctx.add_file_to_context("a.rs");
        ctx.mount_file("b.rs", "b");
        ctx.clear_file_tracking();
        assert!(!ctx.is_file_in_context("a.rs"));
        assert!(ctx.is_file_in_context("b.rs"));
    }

    #[test]
    fn refresh_reads_disk_and_unmounts_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "v1").unwrap();

        let mut ctx = ContextManager::new(ContextConfig::default());
        assert!(!ctx.refresh_mounted_file(&path).unwrap());

        ctx.mount_file(&path, "v1");
        std::fs::write(&path, "version two").unwrap();
        assert!(ctx.refresh_mounted_file(&path).unwrap());
        let file = ctx.mounted_files().next().unwrap();
        assert_eq!(file.content, "version two");

        std::fs::remove_file(&path).unwrap();
        assert!(!ctx.refresh_mounted_file(&path).unwrap());
        assert_eq!(ctx.mounted_files().count(), 0);
        assert!(!ctx.is_file_in_context(&path));
    }

    #[test]
    fn clear_closes_active_turn_and_resets_state() {
        let mut ctx = ContextManager::new(ContextConfig::default());
        ctx.set_memories(vec![Memory::new("note", "keep me")]);
        ctx.add_system_message("notice");
        ctx.mount_file("a.rs", "a");
        run_turn(&mut ctx, "first", 10);
        ctx.start_turn("dangling").unwrap();

        ctx.clear_context(true);
        assert!(!ctx.is_turn_active());
        assert!(ctx.turns().is_empty());
        assert_eq!(ctx.memories().len(), 1);
        assert_eq!(ctx.mounted_files().count(), 0);
        // Hashes were reset, so the same notice is accepted again.
        assert_eq!(ctx.add_system_message("notice"), AddOutcome::Added);

        ctx.clear_context(false);
        assert!(ctx.memories().is_empty());
    }

    #[test]
    fn clear_can_keep_mounts() {
        let mut ctx = ContextManager::new(ContextConfig::default());
        ctx.mount_file("a.rs", "a");
        ctx.clear_context_with(ClearOptions {
            keep_memories: true,
            keep_mounted_files: true,
        });
        assert!(ctx.is_file_in_context("a.rs"));
    }

    #[test]
    fn unmount_keeps_tool_registration() {
        let mut ctx = ContextManager::new(ContextConfig::default());
        ctx.mount_file("a.rs", "a");
        ctx.add_file_to_context("./a.rs");
        assert!(ctx.unmount_file("a.rs"));
        assert!(ctx.is_file_in_context("a.rs"));
        assert_eq!(ctx.context_stats().files_in_context, 1);

        ctx.mount_file("b.rs", "b");
        assert_eq!(ctx.context_stats().files_in_context, 1);
        assert!(ctx.unmount_file("b.rs"));
        assert!(!ctx.is_file_in_context("b.rs"));
    }

    #[test]
    fn try_new_rejects_invalid_config() {
        let err = ContextManager::try_new(ContextConfig::default().with_token_buffer(1.0))
            .unwrap_err();
        assert!(matches!(err, ContextError::InvalidConfig(_)));
        assert!(!err.is_programmer_error());
        assert!(ContextManager::try_new(ContextConfig::default()).is_ok());
    }

    #[test]
    fn context_includes_active_turn_after_history() {
        let config = ContextConfig::default().with_system_prompt("sys");
        let mut ctx = ContextManager::new(config);
        ctx.set_task_summary("- ship it");
        ctx.set_memories(vec![Memory::new("user_preference", "short answers")]);
        run_turn(&mut ctx, "first", 5);
        ctx.start_turn("second").unwrap();
        ctx.add_tool_call("read_file", json!({"path": "x.rs"})).unwrap();
        ctx.add_tool_response("read_file", "fn x() {}").unwrap();

        let messages = ctx.get_context_for_api();
        assert!(messages[0].content.contains("## Current Tasks\n\n- ship it"));
        assert!(messages[0].content.contains("- **User Preference**: short answers"));
        let roles: Vec<MessageRole> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [
                MessageRole::System,
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::User,
                MessageRole::Tool,
            ]
        );
        assert!(ctx.cache_metadata().is_none());
    }

    #[test]
    fn stats_and_export_are_serializable() {
        let config = ContextConfig::default().with_structured_state(true);
        let mut ctx = ContextManager::new(config);
        run_turn(&mut ctx, "Add logging. Then test.", 20);
        ctx.start_turn("next").unwrap();

        let stats = ctx.context_stats();
        assert_eq!(stats.turn_count, 1);
        assert_eq!(stats.turns_started, 2);
        assert_eq!(stats.active_turn.as_deref(), Some("turn_002"));
        assert!(!stats.compressed);

        let export = serde_json::to_value(ctx.export_context()).unwrap();
        assert_eq!(export["mode"], "smart_truncation");
        assert_eq!(export["turns"][0]["id"], "turn_001");
        assert_eq!(export["active_turn"]["id"], "turn_002");
    }
}
