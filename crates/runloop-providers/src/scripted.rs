use std::collections::VecDeque;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use runloop_types::{ModelInfo, ProviderInfo, ToolSchema};

use crate::{ChatMessage, ChunkStream, Provider, ProviderError, ProviderErrorKind, StreamChunk};

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Chunk(StreamChunk),
    Delay(Duration),
    /// Fails the stream mid-turn.
    Fail(ProviderError),
    /// Never produces another chunk; ends only when the caller cancels.
    Hang,
}

/// One model turn. `open_error` makes `stream` itself fail before any chunk.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    steps: Vec<ScriptStep>,
    open_error: Option<ProviderError>,
}

impl ScriptedTurn {
    pub fn steps(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            open_error: None,
        }
    }

    pub fn text(text: &str) -> Self {
        Self::steps(vec![
            ScriptStep::Chunk(StreamChunk::TextDelta(text.to_string())),
            ScriptStep::Chunk(done("stop")),
        ])
    }

    pub fn tool_call(id: &str, name: &str, args: Value) -> Self {
        Self::tool_calls(&[(id, name, args)])
    }

    pub fn tool_calls(calls: &[(&str, &str, Value)]) -> Self {
        let mut steps = Vec::new();
        for (id, name, args) in calls {
            steps.push(ScriptStep::Chunk(StreamChunk::ToolCallStart {
                id: id.to_string(),
                name: name.to_string(),
            }));
            steps.push(ScriptStep::Chunk(StreamChunk::ToolCallDelta {
                id: id.to_string(),
                args_delta: args.to_string(),
            }));
            steps.push(ScriptStep::Chunk(StreamChunk::ToolCallEnd { id: id.to_string() }));
        }
        steps.push(ScriptStep::Chunk(done("tool_calls")));
        Self::steps(steps)
    }

    pub fn open_error(err: ProviderError) -> Self {
        Self {
            steps: Vec::new(),
            open_error: Some(err),
        }
    }

    pub fn hang() -> Self {
        Self::steps(vec![ScriptStep::Hang])
    }

    /// Prepends a text delta, as models often narrate before calling tools.
    pub fn with_text(mut self, text: &str) -> Self {
        self.steps
            .insert(0, ScriptStep::Chunk(StreamChunk::TextDelta(text.to_string())));
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.steps.insert(0, ScriptStep::Delay(delay));
        self
    }
}

fn done(reason: &str) -> StreamChunk {
    StreamChunk::Done {
        finish_reason: reason.to_string(),
        usage: None,
    }
}

/// Plays back a fixed sequence of turns and records what it was sent.
#[derive(Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_turn(&self, turn: ScriptedTurn) {
        self.turns.lock().push_back(turn);
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().clone()
    }

    pub fn remaining_turns(&self) -> usize {
        self.turns.lock().len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "scripted".to_string(),
            name: "Scripted".to_string(),
            models: vec![ModelInfo {
                id: "scripted-1".to_string(),
                provider_id: "scripted".to_string(),
                display_name: "Scripted Model".to_string(),
                context_window: 8192,
            }],
        }
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        _model_override: Option<&str>,
        _tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        self.requests.lock().push(messages);
        let Some(turn) = self.turns.lock().pop_front() else {
            return Err(ProviderError::new(
                ProviderErrorKind::RequestFailed,
                "scripted provider has no turns left",
            )
            .into());
        };
        if let Some(err) = turn.open_error {
            return Err(err.into());
        }

        let steps = turn.steps;
        let stream = try_stream! {
            for step in steps {
                match step {
                    ScriptStep::Chunk(chunk) => yield chunk,
                    ScriptStep::Delay(delay) => {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                yield done("cancelled");
                                break;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    ScriptStep::Fail(err) => {
                        Err::<(), _>(err)?;
                    }
                    ScriptStep::Hang => {
                        cancel.cancelled().await;
                        yield done("cancelled");
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
