//! Turns and the turn log state machine.
//!
//! A [`Turn`] is one user request → assistant response cycle: the ordered
//! [`Event`]s plus metadata derived from them (files touched, tools used)
//! and a summary written at completion.
//!
//! [`TurnLog`] holds at most one active turn:
//!
//! ```text
//!   Idle ──start_turn──▶ Active ──complete_turn──▶ Idle (returns Turn)
//!                          │  ▲
//!                          └──┘ add_assistant_message / add_tool_call / add_tool_response
//! ```
//!
//! Starting a turn while one is active, or appending while idle, returns a
//! [`ContextError`] instead of queuing or dropping data.
//!
//! File paths are recorded from two sources. Tool-call arguments with a
//! well-known key (`path`, `file_path`, `file`) are classified by tool name.
//! Read-tool output is also scanned for `File: <path>` lines; that scan is
//! soft telemetry and nothing in eviction depends on it.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::state::ContextState;
use crate::Message;
use crate::error::{ContextError, Result};

/// Id of the placeholder produced by text-digest compression.
pub const COMPRESSED_HISTORY_ID: &str = "compressed_history";
/// Id of the placeholder produced by structured-state compression.
pub const COMPRESSED_STATE_ID: &str = "compressed_state";

/// First line of a rendered text-digest placeholder.
pub const HISTORY_DIGEST_HEADER: &str = "[Context Summary - Prior Conversation]";
/// First line of a rendered structured-state placeholder.
pub const STATE_DIGEST_HEADER: &str = "[Context State - Prior Work]";

/// Characters of the user request quoted in an automatic summary.
const AUTO_SUMMARY_PREVIEW_CHARS: usize = 50;

const PATH_ARG_KEYS: [&str; 3] = ["path", "file_path", "file"];

static FILE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:File|Reading file):\s*(\S.*?)\s*$").expect("file line pattern is valid")
});

/// True for the two reserved placeholder ids.
pub fn is_placeholder_id(id: &str) -> bool {
    id == COMPRESSED_HISTORY_ID || id == COMPRESSED_STATE_ID
}

// ── Events ─────────────────────────────────────────────────────────

/// A single entry in a turn. Immutable once appended.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    UserMessage {
        content: String,
    },
    AssistantMessage {
        content: String,
    },
    ToolCall {
        tool: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    ToolResponse {
        tool: String,
        result: String,
    },
}

impl Event {
    /// Message form of this event. Tool calls have none; the response
    /// carries the tool name.
    pub fn to_message(&self) -> Option<Message> {
        match self {
            Event::UserMessage { content } => Some(Message::user(content.as_str())),
            Event::AssistantMessage { content } => Some(Message::assistant_text(content.as_str())),
            Event::ToolCall { .. } => None,
            Event::ToolResponse { tool, result } => {
                Some(Message::tool_result(tool.as_str(), result.as_str()))
            }
        }
    }
}

/// Kind of file access recorded on a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    Read,
    Create,
    Modify,
}

impl FileOperation {
    /// Classify a file tool by name.
    pub fn for_tool(tool: &str) -> Option<Self> {
        match tool {
            "read_file" | "read_multiple_files" => Some(FileOperation::Read),
            "create_file" | "create_multiple_files" | "write_file" => Some(FileOperation::Create),
            "edit_file" => Some(FileOperation::Modify),
            _ => None,
        }
    }
}

impl std::fmt::Display for FileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileOperation::Read => write!(f, "read"),
            FileOperation::Create => write!(f, "create"),
            FileOperation::Modify => write!(f, "modify"),
        }
    }
}

// ── Turn ───────────────────────────────────────────────────────────

/// Summary attached to a finalized turn.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TurnSummary {
    Text(String),
    State(ContextState),
}

impl TurnSummary {
    /// Plain-text rendering (the digest for structured summaries).
    pub fn render(&self) -> String {
        match self {
            TurnSummary::Text(text) => text.clone(),
            TurnSummary::State(state) => state.to_digest(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Turn {
    pub id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub events: Vec<Event>,
    #[serde(default)]
    pub files_read: BTreeSet<String>,
    #[serde(default)]
    pub files_modified: BTreeSet<String>,
    #[serde(default)]
    pub files_created: BTreeSet<String>,
    #[serde(default)]
    pub tools_used: BTreeSet<String>,
    #[serde(default)]
    pub summary: Option<TurnSummary>,
}

impl Turn {
    fn open(id: String, user_message: String) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            ended_at: None,
            events: vec![Event::UserMessage {
                content: user_message,
            }],
            files_read: BTreeSet::new(),
            files_modified: BTreeSet::new(),
            files_created: BTreeSet::new(),
            tools_used: BTreeSet::new(),
            summary: None,
        }
    }

    /// A compressed placeholder spanning `started_at..ended_at`.
    pub fn placeholder(
        id: &str,
        summary: TurnSummary,
        started_at: DateTime<Utc>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: id.to_string(),
            started_at,
            ended_at,
            events: Vec::new(),
            files_read: BTreeSet::new(),
            files_modified: BTreeSet::new(),
            files_created: BTreeSet::new(),
            tools_used: BTreeSet::new(),
            summary: Some(summary),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        is_placeholder_id(&self.id)
    }

    /// Content of the opening user message.
    pub fn user_message(&self) -> Option<&str> {
        self.events.iter().find_map(|e| match e {
            Event::UserMessage { content } => Some(content.as_str()),
            _ => None,
        })
    }

    /// Rendered summary, or an empty string for unfinished turns.
    pub fn summary_text(&self) -> String {
        self.summary.as_ref().map(TurnSummary::render).unwrap_or_default()
    }

    /// Messages for this turn. A placeholder renders as one assistant
    /// message carrying its digest.
    pub fn to_messages(&self) -> Vec<Message> {
        if self.is_placeholder() {
            let header = match self.summary {
                Some(TurnSummary::State(_)) => STATE_DIGEST_HEADER,
                _ => HISTORY_DIGEST_HEADER,
            };
            return vec![Message::assistant_text(format!(
                "{header}\n{}",
                self.summary_text()
            ))];
        }
        self.events.iter().filter_map(Event::to_message).collect()
    }

    pub fn to_record(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    pub fn from_record(record: serde_json::Value) -> Result<Self> {
        serde_json::from_value(record).map_err(ContextError::MalformedRecord)
    }

    fn record_file(&mut self, op: FileOperation, path: &str) {
        let path = path.trim();
        if path.is_empty() {
            return;
        }
        let set = match op {
            FileOperation::Read => &mut self.files_read,
            FileOperation::Create => &mut self.files_created,
            FileOperation::Modify => &mut self.files_modified,
        };
        if set.insert(path.to_string()) {
            trace!(turn_id = %self.id, %op, path, "file recorded");
        }
    }

    /// One-line digest: request preview, tools, and changed files.
    fn auto_summary(&self) -> String {
        let mut parts = Vec::new();

        if let Some(request) = self.user_message() {
            let preview: String = request.chars().take(AUTO_SUMMARY_PREVIEW_CHARS).collect();
            if request.chars().count() > AUTO_SUMMARY_PREVIEW_CHARS {
                parts.push(format!("User: {preview}..."));
            } else {
                parts.push(format!("User: {preview}"));
            }
        }
        if !self.tools_used.is_empty() {
            parts.push(format!("Tools used: {}", join(&self.tools_used)));
        }
        if !self.files_modified.is_empty() {
            parts.push(format!("Modified: {}", join(&self.files_modified)));
        }
        if !self.files_created.is_empty() {
            parts.push(format!("Created: {}", join(&self.files_created)));
        }

        if parts.is_empty() {
            "Turn completed".to_string()
        } else {
            parts.join("; ")
        }
    }
}

fn join(set: &BTreeSet<String>) -> String {
    set.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// Paths named in tool arguments: `path`/`file_path`/`file` strings, plus
/// `paths` and `files` arrays for the multi-file tools.
fn paths_from_args(args: &serde_json::Value) -> Vec<String> {
    let Some(obj) = args.as_object() else {
        return Vec::new();
    };
    let mut paths = Vec::new();
    for key in PATH_ARG_KEYS {
        if let Some(p) = obj.get(key).and_then(|v| v.as_str())
            && !p.is_empty()
        {
            paths.push(p.to_string());
        }
    }
    for key in ["paths", "files"] {
        for item in obj.get(key).and_then(|v| v.as_array()).into_iter().flatten() {
            let path = item
                .as_str()
                .or_else(|| PATH_ARG_KEYS.iter().find_map(|k| item.get(*k)?.as_str()));
            if let Some(p) = path
                && !p.is_empty()
            {
                paths.push(p.to_string());
            }
        }
    }
    paths
}

// ── TurnLog ────────────────────────────────────────────────────────

/// Records the in-progress turn.
#[derive(Debug, Default)]
pub struct TurnLog {
    current: Option<Turn>,
    counter: usize,
}

impl TurnLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new turn with the user's message. Returns its id.
    pub fn start_turn(&mut self, user_message: impl Into<String>) -> Result<String> {
        if let Some(active) = &self.current {
            return Err(ContextError::TurnAlreadyActive {
                turn_id: active.id.clone(),
            });
        }
        self.counter += 1;
        let id = format!("turn_{:03}", self.counter);
        debug!(turn_id = %id, "turn started");
        self.current = Some(Turn::open(id.clone(), user_message.into()));
        Ok(id)
    }

    fn active_mut(&mut self, operation: &'static str) -> Result<&mut Turn> {
        self.current
            .as_mut()
            .ok_or_else(|| ContextError::no_active_turn(operation))
    }

    pub fn add_assistant_message(&mut self, content: impl Into<String>) -> Result<()> {
        let turn = self.active_mut("add_assistant_message")?;
        turn.events.push(Event::AssistantMessage {
            content: content.into(),
        });
        Ok(())
    }

    pub fn add_tool_call(&mut self, tool: impl Into<String>, args: serde_json::Value) -> Result<()> {
        let tool = tool.into();
        let turn = self.active_mut("add_tool_call")?;
        if let Some(op) = FileOperation::for_tool(&tool) {
            for path in paths_from_args(&args) {
                turn.record_file(op, &path);
            }
        }
        turn.tools_used.insert(tool.clone());
        turn.events.push(Event::ToolCall { tool, args });
        Ok(())
    }

    pub fn add_tool_response(
        &mut self,
        tool: impl Into<String>,
        result: impl Into<String>,
    ) -> Result<()> {
        let (tool, result) = (tool.into(), result.into());
        let turn = self.active_mut("add_tool_response")?;
        if FileOperation::for_tool(&tool) == Some(FileOperation::Read) {
            for caps in FILE_LINE_RE.captures_iter(&result) {
                if let Some(path) = caps.get(1) {
                    turn.record_file(FileOperation::Read, path.as_str());
                }
            }
        }
        turn.events.push(Event::ToolResponse { tool, result });
        Ok(())
    }

    /// Record a file access on the active turn. No-op while idle.
    pub fn track_file_operation(&mut self, op: FileOperation, path: &str) {
        if let Some(turn) = self.current.as_mut() {
            turn.record_file(op, path);
        }
    }

    /// Finalize the active turn. Without a (non-blank) summary an automatic
    /// one is derived.
    pub fn complete_turn(&mut self, summary: Option<String>) -> Result<Turn> {
        let mut turn = self
            .current
            .take()
            .ok_or_else(|| ContextError::no_active_turn("complete_turn"))?;
        let summary = summary
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| turn.auto_summary());
        turn.summary = Some(TurnSummary::Text(summary));
        turn.ended_at = Some(Utc::now());
        debug!(turn_id = %turn.id, events = turn.events.len(), "turn completed");
        Ok(turn)
    }

    pub fn current(&self) -> Option<&Turn> {
        self.current.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    /// Messages of the in-progress turn (empty while idle).
    pub fn active_messages(&self) -> Vec<Message> {
        self.current
            .as_ref()
            .map(Turn::to_messages)
            .unwrap_or_default()
    }

    /// Number of turns started so far.
    pub fn turns_started(&self) -> usize {
        self.counter
    }
}
