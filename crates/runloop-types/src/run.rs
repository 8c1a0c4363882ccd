use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A queued request to execute one run. Immutable once enqueued; a requeue
/// produces a new value with a bumped `attempt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_id: String,
    pub thread_id: String,
    pub account_id: String,
    pub idempotency_key: String,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempt: u32,
}

impl RunRequest {
    pub fn new(
        thread_id: impl Into<String>,
        account_id: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            account_id: account_id.into(),
            idempotency_key: idempotency_key.into(),
            enqueued_at: Utc::now(),
            attempt: 0,
        }
    }

    pub fn requeued(&self) -> Self {
        Self {
            enqueued_at: Utc::now(),
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Initializing,
    Executing,
    ToolRunning,
    Stopping,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Initializing => "initializing",
            RunStatus::Executing => "executing",
            RunStatus::ToolRunning => "tool_running",
            RunStatus::Stopping => "stopping",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped
        )
    }

    /// Whether the orchestrator state machine permits `self -> next`.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Queued, Initializing)
                | (Queued, Failed)
                | (Initializing, Executing)
                | (Initializing, Failed)
                | (Executing, ToolRunning)
                | (Executing, Completed)
                | (Executing, Stopping)
                | (Executing, Failed)
                | (ToolRunning, Executing)
                | (ToolRunning, Stopping)
                | (ToolRunning, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub thread_id: String,
    pub account_id: String,
    #[serde(default)]
    pub idempotency_key: String,
    pub status: RunStatus,
    pub iteration_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn queued(request: &RunRequest) -> Self {
        let now = Utc::now();
        Self {
            run_id: request.run_id.clone(),
            thread_id: request.thread_id.clone(),
            account_id: request.account_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            status: RunStatus::Queued,
            iteration_count: 0,
            last_error: None,
            error_code: None,
            attempt: request.attempt,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The request for this run's current attempt.
    pub fn request(&self) -> RunRequest {
        RunRequest {
            run_id: self.run_id.clone(),
            thread_id: self.thread_id.clone(),
            account_id: self.account_id.clone(),
            idempotency_key: self.idempotency_key.clone(),
            enqueued_at: Utc::now(),
            attempt: self.attempt,
        }
    }

    /// The request that re-enqueues this run for another attempt.
    pub fn retry_request(&self) -> RunRequest {
        self.request().requeued()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        let all = [
            RunStatus::Queued,
            RunStatus::Initializing,
            RunStatus::Executing,
            RunStatus::ToolRunning,
            RunStatus::Stopping,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Stopped,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn stop_is_only_reachable_through_stopping() {
        assert!(!RunStatus::Executing.can_transition_to(RunStatus::Stopped));
        assert!(RunStatus::Executing.can_transition_to(RunStatus::Stopping));
        assert!(RunStatus::Stopping.can_transition_to(RunStatus::Stopped));
    }

    #[test]
    fn requeue_bumps_attempt_and_keeps_identity() {
        let request = RunRequest::new("thread-1", "acct-1", "key-1");
        let again = request.requeued();
        assert_eq!(again.run_id, request.run_id);
        assert_eq!(again.attempt, 1);
    }

    #[test]
    fn status_serializes_snake_case() {
        let raw = serde_json::to_string(&RunStatus::ToolRunning).expect("serialize");
        assert_eq!(raw, "\"tool_running\"");
    }
}
