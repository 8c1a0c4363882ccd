use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamEventKind {
    TextDelta,
    ToolCall,
    ToolResult,
    Status,
    Error,
    Done,
}

impl StreamEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamEventKind::TextDelta => "TEXT_DELTA",
            StreamEventKind::ToolCall => "TOOL_CALL",
            StreamEventKind::ToolResult => "TOOL_RESULT",
            StreamEventKind::Status => "STATUS",
            StreamEventKind::Error => "ERROR",
            StreamEventKind::Done => "DONE",
        }
    }
}

/// One entry of a run's ordered progress log. `sequence` starts at 0 and is
/// assigned by the store at append time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub run_id: String,
    pub sequence: u64,
    pub kind: StreamEventKind,
    #[serde(default)]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl StreamEvent {
    pub fn is_done(&self) -> bool {
        self.kind == StreamEventKind::Done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlSignal {
    Stop,
}

impl ControlSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlSignal::Stop => "STOP",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "STOP" => Some(ControlSignal::Stop),
            _ => None,
        }
    }
}
