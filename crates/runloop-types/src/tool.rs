use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Tools in one category share a circuit breaker and a default timeout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolCategory(String);

impl ToolCategory {
    pub const NETWORK_LOOKUP: &'static str = "network-lookup";
    pub const SANDBOXED_EXECUTION: &'static str = "sandboxed-execution";
    pub const FILE_IO: &'static str = "file-io";
    pub const GENERAL: &'static str = "general";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn network_lookup() -> Self {
        Self::new(Self::NETWORK_LOOKUP)
    }

    pub fn sandboxed_execution() -> Self {
        Self::new(Self::SANDBOXED_EXECUTION)
    }

    pub fn file_io() -> Self {
        Self::new(Self::FILE_IO)
    }

    pub fn general() -> Self {
        Self::new(Self::GENERAL)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ToolCategory {
    fn default() -> Self {
        Self::general()
    }
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tool call as emitted by the model, after its streamed arguments were
/// assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub output: String,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub metadata: Value,
}

fn default_true() -> bool {
    true
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
            metadata: Value::Null,
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: false,
            metadata: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolInvocationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl ToolInvocationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolInvocationStatus::Pending => "PENDING",
            ToolInvocationStatus::Running => "RUNNING",
            ToolInvocationStatus::Succeeded => "SUCCEEDED",
            ToolInvocationStatus::Failed => "FAILED",
            ToolInvocationStatus::TimedOut => "TIMED_OUT",
        }
    }
}

/// The gateway's record of one tool call. Folded into a tool message once
/// the result is appended to the run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub run_id: String,
    pub call_id: String,
    pub tool_name: String,
    pub category: ToolCategory,
    pub arguments: Value,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub timeout_budget: Duration,
    pub status: ToolInvocationStatus,
    #[serde(default)]
    pub result: Option<ToolOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl ToolInvocation {
    pub fn pending(
        run_id: impl Into<String>,
        call: &ToolCallRequest,
        category: ToolCategory,
        timeout_budget: Duration,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            category,
            arguments: call.arguments.clone(),
            started_at: Utc::now(),
            timeout_budget,
            status: ToolInvocationStatus::Pending,
            result: None,
            error_code: None,
            elapsed_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolInvocationStatus::Succeeded
    }

    /// Text handed back to the model as the tool message content.
    pub fn result_text(&self) -> String {
        match (&self.status, &self.result) {
            (_, Some(output)) => output.output.clone(),
            (ToolInvocationStatus::TimedOut, None) => format!(
                "tool `{}` timed out after {} ms",
                self.tool_name,
                self.timeout_budget.as_millis()
            ),
            (_, None) => format!("tool `{}` produced no result", self.tool_name),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
