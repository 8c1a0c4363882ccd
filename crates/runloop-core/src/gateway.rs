use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use runloop_observability::{emit_event, short_hash, ObservabilityEvent, ProcessKind};
use runloop_tools::{missing_required_arguments, ToolRegistry};
use runloop_types::{ToolCallRequest, ToolCategory, ToolInvocation, ToolInvocationStatus, ToolOutput};

use crate::circuit_breaker::{Admission, CircuitBreaker, CircuitSnapshot};
use crate::config::GatewayConfig;
use crate::error::RunError;

/// Every tool call goes through here: category timeout, circuit breaker and
/// conversion of hangs, errors and panics into a structured invocation.
pub struct ToolExecutionGateway {
    registry: ToolRegistry,
    config: GatewayConfig,
    breakers: RwLock<BTreeMap<ToolCategory, Arc<CircuitBreaker>>>,
}

impl ToolExecutionGateway {
    pub fn new(registry: ToolRegistry, config: GatewayConfig) -> Self {
        Self {
            registry,
            config,
            breakers: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn breaker(&self, category: &ToolCategory) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(category) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .entry(category.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    category.clone(),
                    self.config.policy_for(category),
                ))
            })
            .clone()
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        self.breakers
            .read()
            .values()
            .map(|breaker| breaker.snapshot())
            .collect()
    }

    /// Manually closes a category's breaker. Returns false for categories
    /// that have not been used yet.
    pub fn reset(&self, category: &ToolCategory) -> bool {
        match self.breakers.read().get(category) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub async fn is_parallel_safe(&self, tool_name: &str) -> bool {
        self.registry
            .get(tool_name)
            .await
            .is_some_and(|tool| tool.parallel_safe())
    }

    pub async fn invoke(&self, run_id: &str, call: &ToolCallRequest) -> ToolInvocation {
        let Some(tool) = self.registry.get(&call.name).await else {
            let mut invocation = ToolInvocation::pending(
                run_id,
                call,
                ToolCategory::general(),
                self.config.default.timeout(),
            );
            return finish_rejected(
                &mut invocation,
                "UNKNOWN_TOOL",
                format!("Unknown tool: {}", call.name),
            );
        };

        let category = tool.category();
        let policy = self.config.policy_for(&category);
        let mut invocation = ToolInvocation::pending(run_id, call, category.clone(), policy.timeout());

        let missing = missing_required_arguments(&tool.schema(), &call.arguments);
        if !missing.is_empty() {
            return finish_rejected(
                &mut invocation,
                "INVALID_ARGUMENTS",
                format!("missing required arguments: {}", missing.join(", ")),
            );
        }

        let breaker = self.breaker(&category);
        let trial = match breaker.try_acquire() {
            Admission::Allowed { trial } => trial,
            Admission::Rejected { retry_after } => {
                let err = RunError::ToolUnavailable {
                    category: category.to_string(),
                };
                let message = format!("{err}; retry in {} s", retry_after.as_secs().max(1));
                return finish_rejected(&mut invocation, err.code(), message);
            }
        };

        invocation.status = ToolInvocationStatus::Running;
        let args_hash = short_hash(&call.arguments.to_string());
        emit_event(
            Level::DEBUG,
            ProcessKind::Worker,
            ObservabilityEvent::new("tool.started", "gateway")
                .run(run_id)
                .tool(&call.name, category.as_str())
                .detail(&args_hash),
        );

        let cancel = CancellationToken::new();
        let started = Instant::now();
        let mut handle = {
            let tool = tool.clone();
            let args = call.arguments.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { tool.execute_with_cancel(args, cancel).await })
        };
        let outcome = tokio::time::timeout(policy.timeout(), &mut handle).await;
        invocation.elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(Ok(output))) => {
                // A tool reporting its own failure still answered; the breaker
                // only counts the tool breaking.
                breaker.record_success(trial);
                invocation.status = if output.success {
                    ToolInvocationStatus::Succeeded
                } else {
                    ToolInvocationStatus::Failed
                };
                invocation.result = Some(output);
            }
            Ok(Ok(Err(err))) => {
                breaker.record_failure(trial);
                invocation.status = ToolInvocationStatus::Failed;
                invocation.error_code = Some("TOOL_ERROR".to_string());
                invocation.result = Some(ToolOutput::failed(format!(
                    "tool `{}` failed: {err}",
                    call.name
                )));
            }
            Ok(Err(join_err)) => {
                breaker.record_failure(trial);
                invocation.status = ToolInvocationStatus::Failed;
                invocation.error_code = Some("TOOL_PANIC".to_string());
                invocation.result = Some(ToolOutput::failed(format!(
                    "tool `{}` crashed: {join_err}",
                    call.name
                )));
            }
            Err(_) => {
                cancel.cancel();
                handle.abort();
                breaker.record_failure(trial);
                let err = RunError::ToolTimeout {
                    tool: call.name.clone(),
                    timeout_ms: policy.timeout_ms,
                };
                invocation.status = ToolInvocationStatus::TimedOut;
                invocation.error_code = Some(err.code().to_string());
                invocation.result = Some(ToolOutput::failed(err.to_string()));
            }
        }

        let level = match invocation.status {
            ToolInvocationStatus::TimedOut => Level::WARN,
            ToolInvocationStatus::Failed if invocation.error_code.is_some() => Level::WARN,
            _ => Level::INFO,
        };
        let elapsed = format!("elapsed_ms={}", invocation.elapsed_ms);
        emit_event(
            level,
            ProcessKind::Worker,
            ObservabilityEvent::new("tool.finished", "gateway")
                .run(run_id)
                .tool(&call.name, category.as_str())
                .status(invocation.status.as_str())
                .error_code(invocation.error_code.as_deref().unwrap_or(""))
                .detail(&elapsed),
        );
        invocation
    }
}

/// Failures decided before the tool runs. They never touch the breaker.
fn finish_rejected(invocation: &mut ToolInvocation, code: &str, message: String) -> ToolInvocation {
    invocation.status = ToolInvocationStatus::Failed;
    invocation.error_code = Some(code.to_string());
    invocation.result = Some(ToolOutput::failed(message.clone()));
    emit_event(
        Level::WARN,
        ProcessKind::Worker,
        ObservabilityEvent::new("tool.rejected", "gateway")
            .run(&invocation.run_id)
            .tool(&invocation.tool_name, invocation.category.as_str())
            .error_code(code)
            .detail(&message),
    );
    invocation.clone()
}
