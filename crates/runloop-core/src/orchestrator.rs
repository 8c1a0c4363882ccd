use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use runloop_observability::{emit_event, ObservabilityEvent, ProcessKind};
use runloop_providers::{classify_provider_error, ChatMessage, ProviderErrorKind, ProviderRegistry, StreamChunk};
use runloop_tools::{validate_tool_schemas, ToolRegistry};
use runloop_types::{
    ControlSignal, Message, RunState, RunStatus, StreamEventKind, ToolCallRequest, ToolCategory,
    ToolInvocation, ToolInvocationStatus, ToolOutput, ToolSchema,
};

use crate::config::RunloopConfig;
use crate::error::RunError;
use crate::event_stream::EventStream;
use crate::gateway::ToolExecutionGateway;
use crate::persistence::RunPersistence;
use crate::retry::ModelRetryPolicy;
use crate::run_lock::{LockHeartbeat, RunLockManager};
use crate::store::SharedStore;

/// Process-wide handles every run shares. Built once and passed explicitly.
#[derive(Clone)]
pub struct RunServices {
    pub config: Arc<RunloopConfig>,
    pub store: Arc<dyn SharedStore>,
    pub events: EventStream,
    pub locks: RunLockManager,
    pub gateway: Arc<ToolExecutionGateway>,
    pub providers: ProviderRegistry,
    pub persistence: Arc<dyn RunPersistence>,
}

impl RunServices {
    pub fn new(
        config: RunloopConfig,
        store: Arc<dyn SharedStore>,
        tools: ToolRegistry,
        providers: ProviderRegistry,
        persistence: Arc<dyn RunPersistence>,
    ) -> Self {
        let attempts = config.store_retry_attempts;
        Self {
            events: EventStream::new(store.clone(), config.stream.clone(), attempts),
            locks: RunLockManager::new(store.clone(), attempts),
            gateway: Arc::new(ToolExecutionGateway::new(tools, config.gateway.clone())),
            config: Arc::new(config),
            store,
            providers,
            persistence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Completed,
    Stopped,
}

#[derive(Debug, Default)]
struct TurnOutcome {
    text: String,
    tool_calls: Vec<ToolCallRequest>,
    interrupted: bool,
}

impl TurnOutcome {
    fn interrupted(text: String) -> Self {
        Self {
            text,
            tool_calls: Vec::new(),
            interrupted: true,
        }
    }
}

enum TurnError {
    /// `published` is set once any delta of the attempt reached readers.
    Provider {
        kind: ProviderErrorKind,
        message: String,
        published: bool,
    },
    Fatal(RunError),
}

impl TurnError {
    fn provider(err: &anyhow::Error, published: bool) -> Self {
        TurnError::Provider {
            kind: classify_provider_error(err),
            message: err.to_string(),
            published,
        }
    }

    fn timeout(after: Duration, published: bool) -> Self {
        TurnError::Provider {
            kind: ProviderErrorKind::Timeout,
            message: format!("model turn exceeded {} ms", after.as_millis()),
            published,
        }
    }
}

#[derive(Debug)]
struct PendingCall {
    id: String,
    name: String,
    args: String,
}

/// Streamed tool calls in the order the model first mentioned them.
#[derive(Debug, Default)]
struct PendingCalls {
    order: Vec<PendingCall>,
    index: HashMap<String, usize>,
}

impl PendingCalls {
    fn entry(&mut self, id: &str) -> &mut PendingCall {
        let slot = match self.index.get(id) {
            Some(slot) => *slot,
            None => {
                self.index.insert(id.to_string(), self.order.len());
                self.order.push(PendingCall {
                    id: id.to_string(),
                    name: String::new(),
                    args: String::new(),
                });
                self.order.len() - 1
            }
        };
        &mut self.order[slot]
    }

    fn start(&mut self, id: &str, name: String) {
        let call = self.entry(id);
        if call.name.is_empty() {
            call.name = name;
        }
    }

    fn push_args(&mut self, id: &str, delta: &str) {
        self.entry(id).args.push_str(delta);
    }

    fn finish(self) -> Vec<ToolCallRequest> {
        self.order
            .into_iter()
            .filter(|call| !call.name.trim().is_empty())
            .map(|call| ToolCallRequest {
                arguments: parse_arguments(&call.name, &call.args),
                id: call.id,
                name: call.name.trim().to_string(),
            })
            .collect()
    }
}

fn parse_arguments(tool: &str, raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(tool, error = %err, "tool arguments are not valid JSON");
            json!({ "_raw": trimmed })
        }
    }
}

/// Drives one run from QUEUED to a terminal state while holding its lock.
pub struct RunOrchestrator {
    services: RunServices,
    state: RunState,
    heartbeat: LockHeartbeat,
    lost: CancellationToken,
    stop: CancellationToken,
    history: Vec<Message>,
    tools: Vec<ToolSchema>,
    retry: ModelRetryPolicy,
    control_watcher: Option<JoinHandle<()>>,
}

impl RunOrchestrator {
    pub fn new(services: RunServices, state: RunState, heartbeat: LockHeartbeat) -> Self {
        let retry = ModelRetryPolicy::new(services.config.model_retry.clone());
        Self {
            lost: heartbeat.lost_token(),
            stop: CancellationToken::new(),
            services,
            state,
            heartbeat,
            history: Vec::new(),
            tools: Vec::new(),
            retry,
            control_watcher: None,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Requests a stop without going through the control channel.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub async fn run(mut self) -> RunState {
        let result = self.drive().await;
        self.conclude(result).await
    }

    async fn drive(&mut self) -> Result<Ending, RunError> {
        self.transition(RunStatus::Initializing)
            .await
            .map_err(setup_failure)?;
        self.initialize().await?;
        self.transition(RunStatus::Executing)
            .await
            .map_err(setup_failure)?;
        self.watch_control().await.map_err(setup_failure)?;

        let max_iterations = self.services.config.orchestrator.max_iterations;
        let completion_tool = self.services.config.orchestrator.completion_tool.clone();
        loop {
            self.poll_control().await;
            if self.stop.is_cancelled() {
                return self.begin_stop().await;
            }
            if self.state.iteration_count >= max_iterations {
                return Err(RunError::CapExceeded { max_iterations });
            }

            let turn = self.model_turn().await?;
            self.state.iteration_count += 1;
            self.heartbeat
                .report(self.state.status, self.state.iteration_count);
            if !turn.text.is_empty() || !turn.tool_calls.is_empty() {
                let message = Message::assistant(
                    self.state.thread_id.clone(),
                    self.state.run_id.clone(),
                    turn.text,
                    turn.tool_calls.clone(),
                );
                self.append_message(message).await?;
            }
            if turn.interrupted {
                return self.begin_stop().await;
            }
            if turn.tool_calls.is_empty() {
                return Ok(Ending::Completed);
            }

            let (done_calls, calls): (Vec<_>, Vec<_>) = turn
                .tool_calls
                .into_iter()
                .partition(|call| call.name == completion_tool);
            self.transition(RunStatus::ToolRunning).await?;
            self.dispatch_batch(&calls).await?;
            for call in &done_calls {
                let message = Message::tool_result(
                    self.state.thread_id.clone(),
                    self.state.run_id.clone(),
                    call.id.clone(),
                    "run marked complete",
                );
                self.append_message(message).await?;
            }
            self.poll_control().await;
            if self.stop.is_cancelled() {
                return self.begin_stop().await;
            }
            self.transition(RunStatus::Executing).await?;
            if !done_calls.is_empty() {
                return Ok(Ending::Completed);
            }
        }
    }

    async fn initialize(&mut self) -> Result<(), RunError> {
        let timeout = self.services.config.orchestrator.persistence_timeout();
        let load = self
            .services
            .persistence
            .load_thread_messages(&self.state.thread_id);
        self.history = match tokio::time::timeout(timeout, load).await {
            Ok(Ok(history)) => history,
            Ok(Err(err)) => return Err(RunError::Setup(format!("loading thread history: {err}"))),
            Err(_) => return Err(RunError::Setup("loading thread history timed out".to_string())),
        };

        let mut tools = self.services.gateway.registry().list().await;
        validate_tool_schemas(&tools).map_err(|err| RunError::Setup(err.to_string()))?;
        let completion_tool = &self.services.config.orchestrator.completion_tool;
        if !completion_tool.is_empty() && !tools.iter().any(|tool| &tool.name == completion_tool) {
            tools.push(ToolSchema {
                name: completion_tool.clone(),
                description: "Call once the task is finished to end the run.".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": { "summary": { "type": "string" } }
                }),
            });
        }
        self.tools = tools;
        Ok(())
    }

    async fn watch_control(&mut self) -> Result<(), RunError> {
        if let Some(ControlSignal::Stop) = self
            .services
            .events
            .pending_control(&self.state.run_id)
            .await?
        {
            self.stop.cancel();
            return Ok(());
        }
        let events = self.services.events.clone();
        let run_id = self.state.run_id.clone();
        let stop = self.stop.clone();
        let backoff = self.services.config.stream.tail_poll();
        // Lives until conclude aborts it; store outages only delay it.
        self.control_watcher = Some(tokio::spawn(async move {
            loop {
                match events.wait_for_control(&run_id).await {
                    Ok(ControlSignal::Stop) => {
                        emit_event(
                            Level::INFO,
                            ProcessKind::Worker,
                            ObservabilityEvent::new("run.stop_requested", "orchestrator").run(&run_id),
                        );
                        stop.cancel();
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(run_id = %run_id, error = %err, "control watch failed, retrying");
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }));
        Ok(())
    }

    /// Direct read of the control key, independent of the watcher task.
    async fn poll_control(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        match self.services.events.pending_control(&self.state.run_id).await {
            Ok(Some(ControlSignal::Stop)) => self.stop.cancel(),
            Ok(None) => {}
            Err(err) => tracing::debug!(run_id = %self.state.run_id, error = %err, "control check failed"),
        }
    }

    async fn begin_stop(&mut self) -> Result<Ending, RunError> {
        self.transition(RunStatus::Stopping).await?;
        Ok(Ending::Stopped)
    }

    async fn model_turn(&mut self) -> Result<TurnOutcome, RunError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let (kind, message, published) = match self.stream_turn().await {
                Ok(outcome) => return Ok(outcome),
                Err(TurnError::Fatal(err)) => return Err(err),
                Err(TurnError::Provider {
                    kind,
                    message,
                    published,
                }) => (kind, message, published),
            };

            let retry = !published && self.retry.should_retry(kind, attempts);
            emit_event(
                if retry { Level::WARN } else { Level::ERROR },
                ProcessKind::Worker,
                ObservabilityEvent::new("model.error", "orchestrator")
                    .run(&self.state.run_id)
                    .status(if retry { "retrying" } else { "failed" })
                    .error_code(kind.as_str())
                    .detail(&message),
            );
            if !retry {
                return Err(RunError::ModelProvider {
                    kind: kind.as_str().to_string(),
                    message,
                });
            }

            let delay = self.retry.delay_for(kind, attempts - 1);
            tokio::select! {
                _ = self.lost.cancelled() => return Err(self.lock_lost()),
                _ = self.stop.cancelled() => return Ok(TurnOutcome::interrupted(String::new())),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One streamed model attempt. Text deltas are published as they arrive.
    async fn stream_turn(&self) -> Result<TurnOutcome, TurnError> {
        let config = &self.services.config.orchestrator;
        let budget = config.model_turn_timeout();
        let deadline = Instant::now() + budget;
        let cancel = CancellationToken::new();
        let _cancel_on_exit = cancel.clone().drop_guard();

        let open = self.services.providers.stream_for_provider(
            config.provider_id.as_deref(),
            config.model_id.as_deref(),
            self.chat_messages(),
            Some(self.tools.clone()),
            cancel.clone(),
        );
        let mut stream = tokio::select! {
            biased;
            _ = self.lost.cancelled() => return Err(TurnError::Fatal(self.lock_lost())),
            _ = self.stop.cancelled() => return Ok(TurnOutcome::interrupted(String::new())),
            _ = tokio::time::sleep_until(deadline) => return Err(TurnError::timeout(budget, false)),
            opened = open => opened.map_err(|err| TurnError::provider(&err, false))?,
        };

        let mut text = String::new();
        let mut calls = PendingCalls::default();
        let mut published = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.lost.cancelled() => return Err(TurnError::Fatal(self.lock_lost())),
                _ = self.stop.cancelled() => return Ok(TurnOutcome::interrupted(text)),
                _ = tokio::time::sleep_until(deadline) => return Err(TurnError::timeout(budget, published)),
                next = stream.next() => next,
            };
            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => return Err(TurnError::provider(&err, published)),
            };
            match chunk {
                StreamChunk::TextDelta(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    self.publish(StreamEventKind::TextDelta, json!({ "delta": delta }))
                        .await
                        .map_err(TurnError::Fatal)?;
                    published = true;
                    text.push_str(&delta);
                }
                StreamChunk::ToolCallStart { id, name } => calls.start(&id, name),
                StreamChunk::ToolCallDelta { id, args_delta } => calls.push_args(&id, &args_delta),
                StreamChunk::ToolCallEnd { .. } => {}
                StreamChunk::Done { .. } => break,
            }
        }

        Ok(TurnOutcome {
            text,
            tool_calls: calls.finish(),
            interrupted: false,
        })
    }

    fn chat_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        if let Some(system) = self
            .services
            .config
            .orchestrator
            .system_prompt
            .as_deref()
            .filter(|prompt| !prompt.trim().is_empty())
        {
            messages.push(ChatMessage::new("system", system));
        }
        messages.extend(self.history.iter().map(ChatMessage::from));
        messages
    }

    /// Runs a batch in emitted order. Consecutive parallel-safe calls run
    /// together; nothing new starts once a stop was requested.
    async fn dispatch_batch(&mut self, calls: &[ToolCallRequest]) -> Result<(), RunError> {
        let gateway = self.services.gateway.clone();
        let mut next = 0;
        while next < calls.len() {
            self.poll_control().await;
            if self.stop.is_cancelled() {
                for call in &calls[next..] {
                    self.record_result(skipped_invocation(&self.state.run_id, call))
                        .await?;
                }
                break;
            }

            let mut end = next + 1;
            if gateway.is_parallel_safe(&calls[next].name).await {
                while end < calls.len() && gateway.is_parallel_safe(&calls[end].name).await {
                    end += 1;
                }
            }
            let group = &calls[next..end];
            for call in group {
                self.publish(
                    StreamEventKind::ToolCall,
                    json!({
                        "call_id": call.id,
                        "tool": call.name,
                        "arguments": call.arguments,
                    }),
                )
                .await?;
            }

            let run_id = self.state.run_id.clone();
            let invocations = join_all(group.iter().map(|call| gateway.invoke(&run_id, call)));
            let invocations = tokio::select! {
                _ = self.lost.cancelled() => return Err(self.lock_lost()),
                invocations = invocations => invocations,
            };
            for invocation in invocations {
                self.record_result(invocation).await?;
            }
            next = end;
        }
        Ok(())
    }

    async fn record_result(&mut self, invocation: ToolInvocation) -> Result<(), RunError> {
        let output = invocation.result_text();
        let message = Message::tool_result(
            self.state.thread_id.clone(),
            self.state.run_id.clone(),
            invocation.call_id.clone(),
            output.clone(),
        );
        self.append_message(message).await?;
        self.publish(
            StreamEventKind::ToolResult,
            json!({
                "call_id": invocation.call_id,
                "tool": invocation.tool_name,
                "category": invocation.category,
                "status": invocation.status,
                "error_code": invocation.error_code,
                "elapsed_ms": invocation.elapsed_ms,
                "output": output,
            }),
        )
        .await?;
        Ok(())
    }

    async fn transition(&mut self, next: RunStatus) -> Result<(), RunError> {
        self.ensure_lock()?;
        let from = self.state.status;
        if !from.can_transition_to(next) {
            tracing::warn!(run_id = %self.state.run_id, %from, to = %next, "ignoring illegal run transition");
            return Ok(());
        }
        self.state.status = next;
        self.state.updated_at = Utc::now();
        self.heartbeat.report(next, self.state.iteration_count);
        emit_event(
            Level::INFO,
            ProcessKind::Worker,
            ObservabilityEvent::new("run.transition", "orchestrator")
                .run(&self.state.run_id)
                .thread(&self.state.thread_id)
                .status(next.as_str())
                .detail(from.as_str()),
        );
        self.persist_state().await?;
        self.publish(
            StreamEventKind::Status,
            json!({ "status": next, "iteration": self.state.iteration_count }),
        )
        .await?;
        Ok(())
    }

    fn ensure_lock(&self) -> Result<(), RunError> {
        if self.lost.is_cancelled() {
            return Err(self.lock_lost());
        }
        Ok(())
    }

    fn lock_lost(&self) -> RunError {
        RunError::LockLost {
            run_id: self.state.run_id.clone(),
        }
    }

    async fn publish(&self, kind: StreamEventKind, payload: Value) -> Result<u64, RunError> {
        self.ensure_lock()?;
        self.services
            .events
            .publish(&self.state.run_id, kind, payload)
            .await
    }

    async fn persist_state(&self) -> Result<(), RunError> {
        self.ensure_lock()?;
        let timeout = self.services.config.orchestrator.persistence_timeout();
        match tokio::time::timeout(timeout, self.services.persistence.save_run_state(&self.state)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(RunError::infra(format!("save run state: {err}"))),
            Err(_) => Err(RunError::infra("save run state timed out")),
        }
    }

    async fn append_message(&mut self, message: Message) -> Result<(), RunError> {
        self.ensure_lock()?;
        let timeout = self.services.config.orchestrator.persistence_timeout();
        match tokio::time::timeout(timeout, self.services.persistence.append_message(&message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(RunError::infra(format!("append message: {err}"))),
            Err(_) => return Err(RunError::infra("append message timed out")),
        }
        self.history.push(message);
        Ok(())
    }

    fn settle(&mut self, status: RunStatus, error: Option<&RunError>) {
        if !self.state.status.can_transition_to(status) {
            tracing::warn!(
                run_id = %self.state.run_id,
                from = %self.state.status,
                to = %status,
                "forcing terminal status"
            );
        }
        self.state.status = status;
        self.state.updated_at = Utc::now();
        if let Some(err) = error {
            self.state.last_error = Some(err.to_string());
            self.state.error_code = Some(err.code().to_string());
        }
    }

    async fn conclude(mut self, result: Result<Ending, RunError>) -> RunState {
        if let Some(watcher) = self.control_watcher.take() {
            watcher.abort();
        }

        // Another worker may own the run now: touch nothing shared.
        if self.lost.is_cancelled() || matches!(result, Err(RunError::LockLost { .. })) {
            let err = self.lock_lost();
            self.settle(RunStatus::Failed, Some(&err));
            emit_event(
                Level::ERROR,
                ProcessKind::Worker,
                ObservabilityEvent::new("run.abandoned", "orchestrator")
                    .run(&self.state.run_id)
                    .status(RunStatus::Failed.as_str())
                    .error_code(err.code()),
            );
            let _ = self.heartbeat.stop().await;
            return self.state;
        }

        let (status, error) = match result {
            Ok(Ending::Completed) => (RunStatus::Completed, None),
            Ok(Ending::Stopped) => (RunStatus::Stopped, None),
            Err(err) => (RunStatus::Failed, Some(err)),
        };
        self.settle(status, error.as_ref());
        let detail = error.as_ref().map(|err| err.to_string()).unwrap_or_default();
        emit_event(
            if error.is_some() { Level::WARN } else { Level::INFO },
            ProcessKind::Worker,
            ObservabilityEvent::new("run.finished", "orchestrator")
                .run(&self.state.run_id)
                .thread(&self.state.thread_id)
                .status(status.as_str())
                .error_code(error.as_ref().map(|err| err.code()).unwrap_or(""))
                .detail(&detail),
        );

        if let Err(err) = self.persist_state().await {
            tracing::warn!(run_id = %self.state.run_id, error = %err, "final run state not persisted");
        }
        self.publish_terminal(error.as_ref()).await;
        if let Err(err) = self
            .services
            .events
            .finish(&self.state.run_id, status.as_str())
            .await
        {
            tracing::warn!(run_id = %self.state.run_id, error = %err, "stream retention not shortened");
        }

        // With the store unreachable the lock is left to expire.
        let abandon = matches!(error, Some(RunError::TransientInfra(_)));
        if let Some(lock) = self.heartbeat.stop().await {
            if !abandon {
                if let Err(err) = self.services.locks.release(&lock).await {
                    tracing::warn!(run_id = %lock.run_id, error = %err, "lock release failed");
                }
            }
        }
        self.state
    }

    /// STATUS (or ERROR) followed by DONE, always the last two entries.
    async fn publish_terminal(&self, error: Option<&RunError>) {
        let status = self.state.status;
        let iterations = self.state.iteration_count;
        let (kind, payload) = match error {
            Some(err) => (
                StreamEventKind::Error,
                json!({ "error_code": err.code(), "message": err.to_string() }),
            ),
            None => (
                StreamEventKind::Status,
                json!({ "status": status, "iteration": iterations }),
            ),
        };
        if let Err(err) = self.publish(kind, payload).await {
            tracing::warn!(run_id = %self.state.run_id, error = %err, "terminal event not published");
        }
        let done = json!({
            "status": status,
            "iterations": iterations,
            "error_code": error.map(|err| err.code()),
        });
        if let Err(err) = self.publish(StreamEventKind::Done, done).await {
            tracing::warn!(run_id = %self.state.run_id, error = %err, "DONE not published");
        }
    }
}

/// Store failures before the first model turn still release the lock.
fn setup_failure(err: RunError) -> RunError {
    match err {
        RunError::TransientInfra(detail) => RunError::Setup(detail),
        other => other,
    }
}

fn skipped_invocation(run_id: &str, call: &ToolCallRequest) -> ToolInvocation {
    let mut invocation = ToolInvocation::pending(run_id, call, ToolCategory::general(), Duration::ZERO);
    invocation.status = ToolInvocationStatus::Failed;
    invocation.error_code = Some("RUN_STOPPING".to_string());
    invocation.result = Some(ToolOutput::failed("not executed: the run is stopping"));
    invocation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::store::MemoryStore;
    use futures::FutureExt;
    use runloop_providers::{Provider, ProviderError, ScriptStep, ScriptedProvider, ScriptedTurn};
    use runloop_tools::FnTool;
    use runloop_types::{RunRequest, StreamEvent};

    struct Harness {
        services: RunServices,
        provider: Arc<ScriptedProvider>,
        store: Arc<MemoryStore>,
    }

    async fn harness(config: RunloopConfig, turns: Vec<ScriptedTurn>, tools: Vec<FnTool>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new(turns));
        let registry = ToolRegistry::new();
        for tool in tools {
            registry.register(Arc::new(tool)).await.expect("register");
        }
        let services = RunServices::new(
            config,
            store.clone(),
            registry,
            ProviderRegistry::with_providers(vec![provider.clone() as Arc<dyn Provider>], None),
            Arc::new(MemoryPersistence::new()),
        );
        Harness {
            services,
            provider,
            store,
        }
    }

    async fn start(h: &Harness) -> (RunRequest, RunOrchestrator) {
        let request = RunRequest::new("thread-1", "acct", "key");
        h.services
            .persistence
            .append_message(&Message::user("thread-1", "hi"))
            .await
            .expect("seed");
        let lock = h
            .services
            .locks
            .acquire(&request.run_id, "worker-test", Duration::from_secs(30))
            .await
            .expect("lock");
        let heartbeat = h.services.locks.start_heartbeat(lock, Duration::from_secs(10));
        let orchestrator = RunOrchestrator::new(h.services.clone(), RunState::queued(&request), heartbeat);
        (request, orchestrator)
    }

    async fn events(h: &Harness, run_id: &str) -> Vec<StreamEvent> {
        h.services.events.read(run_id, None, 1_000).await.expect("read")
    }

    fn echo_tool(name: &str) -> FnTool {
        FnTool::new(name, "echo", json!({"type": "object"}), |args, _| {
            async move { Ok(ToolOutput::ok(args.to_string())) }.boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn text_only_turn_completes_and_releases_lock() {
        let h = harness(RunloopConfig::default(), vec![ScriptedTurn::text("hello there")], vec![]).await;
        let (request, orchestrator) = start(&h).await;
        let state = orchestrator.run().await;

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.iteration_count, 1);
        let events = events(&h, &request.run_id).await;
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StreamEventKind::Status,
                StreamEventKind::Status,
                StreamEventKind::TextDelta,
                StreamEventKind::Status,
                StreamEventKind::Done,
            ]
        );
        assert!(!h.services.locks.is_locked(&request.run_id).await.expect("locked"));
        let thread = h
            .services
            .persistence
            .load_thread_messages("thread-1")
            .await
            .expect("thread");
        assert_eq!(thread.last().map(|m| m.content.as_str()), Some("hello there"));
        assert_eq!(h.provider.requests()[0].len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_tool_ends_run_after_batch() {
        let h = harness(
            RunloopConfig::default(),
            vec![ScriptedTurn::tool_calls(&[
                ("c1", "echo", json!({"x": 1})),
                ("c2", "complete", json!({"summary": "done"})),
            ])],
            vec![echo_tool("echo")],
        )
        .await;
        let (request, orchestrator) = start(&h).await;
        let state = orchestrator.run().await;
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(h.provider.remaining_turns(), 0);
        let results: Vec<_> = events(&h, &request.run_id)
            .await
            .into_iter()
            .filter(|e| e.kind == StreamEventKind::ToolResult)
            .collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].payload["tool"], "echo");
    }

    #[tokio::test(start_paused = true)]
    async fn iteration_cap_fails_run() {
        let mut config = RunloopConfig::default();
        config.orchestrator.max_iterations = 2;
        let turns = (0..3)
            .map(|i| ScriptedTurn::tool_call(&format!("c{i}"), "echo", json!({})))
            .collect();
        let h = harness(config, turns, vec![echo_tool("echo")]).await;
        let (request, orchestrator) = start(&h).await;
        let state = orchestrator.run().await;

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.error_code.as_deref(), Some("CAP_EXCEEDED"));
        let events = events(&h, &request.run_id).await;
        let tail: Vec<_> = events.iter().rev().take(2).map(|e| e.kind).collect();
        assert_eq!(tail, vec![StreamEventKind::Done, StreamEventKind::Error]);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_errors_retry_before_any_delta() {
        let h = harness(
            RunloopConfig::default(),
            vec![
                ScriptedTurn::open_error(ProviderError::from_status(503, "overloaded")),
                ScriptedTurn::text("recovered"),
            ],
            vec![],
        )
        .await;
        let (_, orchestrator) = start(&h).await;
        let state = orchestrator.run().await;
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(h.provider.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_published_delta_is_not_retried() {
        let h = harness(
            RunloopConfig::default(),
            vec![
                ScriptedTurn::steps(vec![
                    ScriptStep::Chunk(StreamChunk::TextDelta("partial".to_string())),
                    ScriptStep::Fail(ProviderError::from_status(500, "boom")),
                ]),
                ScriptedTurn::text("never used"),
            ],
            vec![],
        )
        .await;
        let (_, orchestrator) = start(&h).await;
        let state = orchestrator.run().await;
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.error_code.as_deref(), Some("MODEL_PROVIDER"));
        assert_eq!(h.provider.remaining_turns(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn authentication_failure_fails_immediately() {
        let h = harness(
            RunloopConfig::default(),
            vec![ScriptedTurn::open_error(ProviderError::from_status(401, "bad key"))],
            vec![],
        )
        .await;
        let (_, orchestrator) = start(&h).await;
        let state = orchestrator.run().await;
        assert_eq!(state.status, RunStatus::Failed);
        assert!(state
            .last_error
            .as_deref()
            .is_some_and(|err| err.contains("AUTHENTICATION")));
    }

    #[tokio::test(start_paused = true)]
    async fn lock_loss_abandons_without_publishing_terminal_events() {
        let mut config = RunloopConfig::default();
        config.store_retry_attempts = 1;
        let h = harness(config, vec![ScriptedTurn::hang()], vec![]).await;
        let (request, orchestrator) = start(&h).await;
        let store = h.store.clone();
        let breaker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            store.set_unavailable(true);
        });
        let state = orchestrator.run().await;
        breaker.await.expect("join");

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.error_code.as_deref(), Some("LOCK_LOST"));
        h.store.set_unavailable(false);
        let events = events(&h, &request.run_id).await;
        assert!(events.iter().all(|e| !e.is_done()));
        let persisted = h
            .services
            .persistence
            .load_run_state(&request.run_id)
            .await
            .expect("load")
            .expect("state");
        assert_eq!(persisted.status, RunStatus::Executing);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_after_store_outage_still_stops_the_run() {
        let slow = FnTool::new("slow", "sleeps", json!({"type": "object"}), |_, _| {
            async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok(ToolOutput::ok("slept"))
            }
            .boxed()
        });
        let turns = vec![
            ScriptedTurn::tool_call("c1", "slow", json!({})),
            ScriptedTurn::tool_call("c2", "slow", json!({})),
            ScriptedTurn::text("finished"),
        ];
        let h = harness(RunloopConfig::default(), turns, vec![slow]).await;
        let (request, orchestrator) = start(&h).await;
        let run = tokio::spawn(orchestrator.run());

        tokio::time::sleep(Duration::from_millis(900)).await;
        h.store.set_unavailable(true);
        tokio::time::sleep(Duration::from_millis(400)).await;
        h.store.set_unavailable(false);
        tokio::time::sleep(Duration::from_millis(700)).await;
        let delivered = h
            .services
            .events
            .signal_control(&request.run_id, ControlSignal::Stop)
            .await
            .expect("signal");
        assert!(delivered);

        let state = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("run ends")
            .expect("join");
        assert_eq!(state.status, RunStatus::Stopped);
        assert_eq!(h.provider.remaining_turns(), 2);
    }

    #[test]
    fn pending_calls_keep_first_mention_order() {
        let mut calls = PendingCalls::default();
        calls.start("b", "second".to_string());
        calls.push_args("a", "{\"q\":");
        calls.start("a", "first".to_string());
        calls.push_args("a", "1}");
        calls.push_args("b", "not json");
        let calls = calls.finish();
        assert_eq!(calls[0].name, "second");
        assert_eq!(calls[0].arguments, json!({"_raw": "not json"}));
        assert_eq!(calls[1].name, "first");
        assert_eq!(calls[1].arguments, json!({"q": 1}));
    }
}
