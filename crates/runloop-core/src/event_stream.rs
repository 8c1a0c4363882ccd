use std::sync::Arc;

use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

use runloop_types::{ControlSignal, StreamEvent, StreamEventKind};

use crate::config::StreamConfig;
use crate::error::RunError;
use crate::store::{retry_store, SharedStore};

const TAIL_BATCH: usize = 256;

pub(crate) fn events_key(run_id: &str) -> String {
    format!("runloop:run:{run_id}:events")
}

fn events_channel(run_id: &str) -> String {
    format!("runloop:run:{run_id}:events:notify")
}

fn control_key(run_id: &str) -> String {
    format!("runloop:run:{run_id}:control")
}

fn control_channel(run_id: &str) -> String {
    format!("runloop:run:{run_id}:control:notify")
}

/// Outlives the log so late readers learn the run is over.
fn finished_key(run_id: &str) -> String {
    format!("runloop:run:{run_id}:finished")
}

/// Error code of the event that closes a tail whose DONE is out of reach.
pub const STREAM_EXPIRED_CODE: &str = "STREAM_EXPIRED";

/// What the log stores per entry; the sequence is the log position.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEvent {
    kind: StreamEventKind,
    payload: Value,
    created_at: DateTime<Utc>,
}

/// Per-run ordered progress log plus the out-of-band control channel.
#[derive(Clone)]
pub struct EventStream {
    store: Arc<dyn SharedStore>,
    config: StreamConfig,
    retry_attempts: u32,
}

impl EventStream {
    pub fn new(store: Arc<dyn SharedStore>, config: StreamConfig, retry_attempts: u32) -> Self {
        Self {
            store,
            config,
            retry_attempts,
        }
    }

    pub async fn publish(
        &self,
        run_id: &str,
        kind: StreamEventKind,
        payload: Value,
    ) -> Result<u64, RunError> {
        let record = StoredEvent {
            kind,
            payload,
            created_at: Utc::now(),
        };
        let raw = serde_json::to_string(&record).map_err(RunError::infra)?;
        let key = events_key(run_id);
        let seq = retry_store(self.retry_attempts, "stream_append", || {
            self.store
                .stream_append(&key, &raw, self.config.max_len, self.config.ttl())
        })
        .await?;

        // Readers fall back to polling, so a lost wakeup only costs latency.
        if let Err(err) = self
            .store
            .publish(&events_channel(run_id), &seq.to_string())
            .await
        {
            tracing::debug!(run_id, seq, error = %err, "event notify failed");
        }
        Ok(seq)
    }

    /// Events with sequence greater than `after`, oldest first.
    pub async fn read(
        &self,
        run_id: &str,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<StreamEvent>, RunError> {
        read_batch(&*self.store, self.retry_attempts, run_id, after, limit).await
    }

    /// Lazily follows a run's log starting after `after`. Ends once the DONE
    /// event has been yielded, or with a STREAM_EXPIRED error event when the
    /// run finished but its DONE is no longer ahead of the reader.
    /// Restartable: pass the last sequence seen.
    pub fn tail(
        &self,
        run_id: &str,
        after: Option<u64>,
    ) -> impl Stream<Item = Result<StreamEvent, RunError>> + Send + 'static {
        let store = self.store.clone();
        let attempts = self.retry_attempts;
        let poll = self.config.tail_poll();
        let run_id = run_id.to_string();

        try_stream! {
            let channel = events_channel(&run_id);
            let mut wakeups = retry_store(attempts, "subscribe", || store.subscribe(&channel)).await?;
            let mut cursor = after;

            'tail: loop {
                let batch = read_batch(&*store, attempts, &run_id, cursor, TAIL_BATCH).await?;
                if batch.is_empty() {
                    // The marker is written after DONE, so an empty batch here
                    // means DONE was pruned or already behind the cursor.
                    let finished = finished_key(&run_id);
                    if let Some(status) = retry_store(attempts, "finished_get", || store.get(&finished)).await? {
                        yield expired_event(&run_id, cursor, &status);
                        break 'tail;
                    }
                    match tokio::time::timeout(poll, wakeups.recv()).await {
                        Ok(Err(RecvError::Closed)) => {
                            wakeups = retry_store(attempts, "subscribe", || store.subscribe(&channel)).await?;
                        }
                        Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) | Err(_) => {}
                    }
                    continue;
                }
                for event in batch {
                    let expected = cursor.map_or(0, |c| c + 1);
                    if event.sequence > expected {
                        tracing::warn!(
                            run_id = %run_id,
                            expected,
                            resumed_at = event.sequence,
                            "events trimmed from retention before they were read"
                        );
                    }
                    cursor = Some(event.sequence);
                    let done = event.is_done();
                    yield event;
                    if done {
                        break 'tail;
                    }
                }
            }
        }
    }

    /// Records a control signal and notifies watchers. Returns false when the
    /// signal was already pending, making repeated calls no-ops.
    pub async fn signal_control(&self, run_id: &str, signal: ControlSignal) -> Result<bool, RunError> {
        let key = control_key(run_id);
        let first = retry_store(self.retry_attempts, "control_set", || {
            self.store
                .set_if_absent(&key, signal.as_str(), Some(self.config.ttl()))
        })
        .await?;
        if first {
            let channel = control_channel(run_id);
            retry_store(self.retry_attempts, "control_publish", || {
                self.store.publish(&channel, signal.as_str())
            })
            .await?;
        }
        Ok(first)
    }

    pub async fn pending_control(&self, run_id: &str) -> Result<Option<ControlSignal>, RunError> {
        let key = control_key(run_id);
        let raw = retry_store(self.retry_attempts, "control_get", || self.store.get(&key)).await?;
        Ok(raw.as_deref().and_then(ControlSignal::parse))
    }

    /// Resolves with the first control signal for the run, including one sent
    /// before this call. Polls as a fallback for missed notifications.
    pub async fn wait_for_control(&self, run_id: &str) -> Result<ControlSignal, RunError> {
        let channel = control_channel(run_id);
        let mut rx = retry_store(self.retry_attempts, "control_subscribe", || {
            self.store.subscribe(&channel)
        })
        .await?;
        loop {
            if let Some(signal) = self.pending_control(run_id).await? {
                return Ok(signal);
            }
            match tokio::time::timeout(self.config.tail_poll(), rx.recv()).await {
                Ok(Ok(raw)) => {
                    if let Some(signal) = ControlSignal::parse(&raw) {
                        return Ok(signal);
                    }
                }
                Ok(Err(RecvError::Closed)) => {
                    rx = retry_store(self.retry_attempts, "control_subscribe", || {
                        self.store.subscribe(&channel)
                    })
                    .await?;
                }
                Ok(Err(RecvError::Lagged(_))) | Err(_) => {}
            }
        }
    }

    /// Marks the run finished with `status` and starts the terminal grace
    /// period after which the run's log and control key disappear. Call only
    /// after DONE was published.
    pub async fn finish(&self, run_id: &str, status: &str) -> Result<(), RunError> {
        let grace = self.config.terminal_grace();
        let marker_ttl = self.config.ttl().max(grace);
        let finished = finished_key(run_id);
        let events = events_key(run_id);
        let control = control_key(run_id);
        retry_store(self.retry_attempts, "finished_set", || {
            self.store.set(&finished, status, Some(marker_ttl))
        })
        .await?;
        retry_store(self.retry_attempts, "stream_expire", || self.store.expire(&events, grace)).await?;
        retry_store(self.retry_attempts, "control_expire", || self.store.expire(&control, grace)).await?;
        Ok(())
    }
}

/// Closing event for a reader whose run finished beyond the reach of the
/// retained log.
pub fn expired_event(run_id: &str, after: Option<u64>, status: &str) -> StreamEvent {
    StreamEvent {
        run_id: run_id.to_string(),
        sequence: after.map_or(0, |c| c + 1),
        kind: StreamEventKind::Error,
        payload: serde_json::json!({
            "error_code": STREAM_EXPIRED_CODE,
            "status": status,
            "message": "run finished; its remaining events are no longer retained",
        }),
        created_at: Utc::now(),
    }
}

async fn read_batch(
    store: &dyn SharedStore,
    attempts: u32,
    run_id: &str,
    after: Option<u64>,
    limit: usize,
) -> Result<Vec<StreamEvent>, RunError> {
    let key = events_key(run_id);
    let raw = retry_store(attempts, "stream_range", || store.stream_range(&key, after, limit)).await?;
    let mut events = Vec::with_capacity(raw.len());
    for (sequence, payload) in raw {
        match serde_json::from_str::<StoredEvent>(&payload) {
            Ok(stored) => events.push(StreamEvent {
                run_id: run_id.to_string(),
                sequence,
                kind: stored.kind,
                payload: stored.payload,
                created_at: stored.created_at,
            }),
            Err(err) => tracing::warn!(run_id, sequence, error = %err, "skipping undecodable event"),
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    fn stream_with(config: StreamConfig) -> (Arc<MemoryStore>, EventStream) {
        let store = Arc::new(MemoryStore::new());
        let events = EventStream::new(store.clone(), config, 3);
        (store, events)
    }

    #[tokio::test]
    async fn sequences_start_at_zero_without_gaps() {
        let (_, events) = stream_with(StreamConfig::default());
        for expected in 0..4 {
            let seq = events
                .publish("r1", StreamEventKind::TextDelta, json!({"text": expected}))
                .await
                .expect("publish");
            assert_eq!(seq, expected);
        }
        let other = events
            .publish("r2", StreamEventKind::Status, json!({}))
            .await
            .expect("publish");
        assert_eq!(other, 0);
    }

    #[tokio::test]
    async fn resumed_tail_sees_exactly_later_events() {
        let (_, events) = stream_with(StreamConfig::default());
        for i in 0..3 {
            events
                .publish("r1", StreamEventKind::TextDelta, json!({"text": i}))
                .await
                .expect("publish");
        }
        let reader = {
            let events = events.clone();
            tokio::spawn(async move {
                events
                    .tail("r1", Some(1))
                    .map(|e| e.expect("event").sequence)
                    .collect::<Vec<_>>()
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        events
            .publish("r1", StreamEventKind::TextDelta, json!({"text": 3}))
            .await
            .expect("publish");
        events
            .publish("r1", StreamEventKind::Done, json!({"status": "completed"}))
            .await
            .expect("publish");

        let seen = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("tail finished")
            .expect("join");
        assert_eq!(seen, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn tail_skips_over_trimmed_events() {
        let config = StreamConfig {
            max_len: 2,
            ..StreamConfig::default()
        };
        let (_, events) = stream_with(config);
        for _ in 0..3 {
            events
                .publish("r1", StreamEventKind::TextDelta, json!({}))
                .await
                .expect("publish");
        }
        events
            .publish("r1", StreamEventKind::Done, json!({}))
            .await
            .expect("publish");
        let seen = events
            .tail("r1", None)
            .map(|e| e.expect("event").sequence)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(seen, vec![2, 3]);
    }

    #[tokio::test]
    async fn control_signal_is_idempotent_and_seen_late() {
        let (_, events) = stream_with(StreamConfig::default());
        assert!(events
            .signal_control("r1", ControlSignal::Stop)
            .await
            .expect("signal"));
        assert!(!events
            .signal_control("r1", ControlSignal::Stop)
            .await
            .expect("signal"));
        let signal = tokio::time::timeout(Duration::from_secs(1), events.wait_for_control("r1"))
            .await
            .expect("pending signal resolves immediately")
            .expect("signal");
        assert_eq!(signal, ControlSignal::Stop);
    }

    #[tokio::test]
    async fn waiting_watcher_wakes_on_signal() {
        let (_, events) = stream_with(StreamConfig::default());
        let watcher = {
            let events = events.clone();
            tokio::spawn(async move { events.wait_for_control("r1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        events
            .signal_control("r1", ControlSignal::Stop)
            .await
            .expect("signal");
        let signal = tokio::time::timeout(Duration::from_millis(500), watcher)
            .await
            .expect("woken")
            .expect("join")
            .expect("signal");
        assert_eq!(signal, ControlSignal::Stop);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_stream_expires_after_grace() {
        let config = StreamConfig {
            terminal_grace_ms: 1_000,
            ..StreamConfig::default()
        };
        let (_, events) = stream_with(config);
        events
            .publish("r1", StreamEventKind::Done, json!({}))
            .await
            .expect("publish");
        events.finish("r1", "completed").await.expect("finish");
        assert_eq!(events.read("r1", None, 10).await.expect("read").len(), 1);
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert!(events.read("r1", None, 10).await.expect("read").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tail_of_pruned_stream_ends_with_expiry_error() {
        let config = StreamConfig {
            terminal_grace_ms: 1_000,
            ..StreamConfig::default()
        };
        let (_, events) = stream_with(config);
        events
            .publish("r1", StreamEventKind::TextDelta, json!({"delta": "hi"}))
            .await
            .expect("publish");
        events
            .publish("r1", StreamEventKind::Done, json!({}))
            .await
            .expect("publish");
        events.finish("r1", "completed").await.expect("finish");
        tokio::time::advance(Duration::from_secs(5)).await;

        let seen = tokio::time::timeout(
            Duration::from_secs(3_600),
            events.tail("r1", None).collect::<Vec<_>>(),
        )
        .await
        .expect("tail ends");
        assert_eq!(seen.len(), 1);
        let closing = seen[0].as_ref().expect("event");
        assert_eq!(closing.kind, StreamEventKind::Error);
        assert_eq!(closing.payload["error_code"], STREAM_EXPIRED_CODE);
        assert_eq!(closing.payload["status"], "completed");
    }

    #[tokio::test]
    async fn tail_resumed_past_done_ends_immediately() {
        let (_, events) = stream_with(StreamConfig::default());
        events
            .publish("r1", StreamEventKind::Status, json!({}))
            .await
            .expect("publish");
        let done = events
            .publish("r1", StreamEventKind::Done, json!({}))
            .await
            .expect("publish");
        events.finish("r1", "stopped").await.expect("finish");

        let seen = tokio::time::timeout(
            Duration::from_secs(1),
            events.tail("r1", Some(done)).collect::<Vec<_>>(),
        )
        .await
        .expect("tail ends");
        assert_eq!(seen.len(), 1);
        let closing = seen[0].as_ref().expect("event");
        assert_eq!(closing.sequence, done + 1);
        assert_eq!(closing.payload["error_code"], STREAM_EXPIRED_CODE);
    }

    #[tokio::test]
    async fn publish_fails_with_transient_infra_when_store_is_down() {
        let (store, events) = stream_with(StreamConfig::default());
        store.set_unavailable(true);
        let err = events
            .publish("r1", StreamEventKind::Status, json!({}))
            .await
            .expect_err("outage");
        assert_eq!(err.code(), "TRANSIENT_INFRA");
    }
}
