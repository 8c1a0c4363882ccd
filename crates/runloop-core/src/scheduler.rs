use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use runloop_observability::{emit_event, ObservabilityEvent, ProcessKind};
use runloop_types::{ControlSignal, RunRequest, RunState, RunStatus, StreamEventKind};

use crate::config::ReclaimPolicy;
use crate::error::{RunError, LOCK_EXPIRED_CODE};
use crate::orchestrator::{RunOrchestrator, RunServices};
use crate::run_lock::LockError;
use crate::store::retry_store;

pub const RUN_QUEUE: &str = "runloop:queue:runs";

const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

fn idempotency_key(account_id: &str, key: &str) -> String {
    format!("runloop:idempotency:{account_id}:{key}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub run_id: String,
    /// True when the idempotency key was already used; nothing was enqueued.
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Finished(RunState),
    /// Another holder owns the run's lock.
    AlreadyHeld,
    Skipped { reason: String },
}

/// Producer and consumer side of the run queue.
#[derive(Clone)]
pub struct RunScheduler {
    services: RunServices,
    worker_id: String,
}

impl RunScheduler {
    pub fn new(services: RunServices, worker_id: impl Into<String>) -> Self {
        Self {
            services,
            worker_id: worker_id.into(),
        }
    }

    pub fn services(&self) -> &RunServices {
        &self.services
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn attempts(&self) -> u32 {
        self.services.config.store_retry_attempts
    }

    /// Creates and enqueues a run. Repeating an idempotency key returns the
    /// run created by its first use.
    pub async fn submit_run(
        &self,
        thread_id: &str,
        account_id: &str,
        idempotency_key_value: &str,
    ) -> Result<Submission, RunError> {
        let request = RunRequest::new(thread_id, account_id, idempotency_key_value);
        let key = idempotency_key(account_id, idempotency_key_value);
        let store = &self.services.store;
        let first = retry_store(self.attempts(), "idempotency_set", || {
            store.set_if_absent(&key, &request.run_id, Some(IDEMPOTENCY_TTL))
        })
        .await?;
        if !first {
            let existing = retry_store(self.attempts(), "idempotency_get", || store.get(&key)).await?;
            if let Some(run_id) = existing {
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    ObservabilityEvent::new("run.submit_duplicate", "scheduler")
                        .run(&run_id)
                        .thread(thread_id),
                );
                return Ok(Submission {
                    run_id,
                    duplicate: true,
                });
            }
            // The earlier mapping expired between the two calls.
            retry_store(self.attempts(), "idempotency_set", || {
                store.set(&key, &request.run_id, Some(IDEMPOTENCY_TTL))
            })
            .await?;
        }

        let state = RunState::queued(&request);
        self.save_state(&state).await?;
        self.enqueue(&request).await?;
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("run.submitted", "scheduler")
                .run(&request.run_id)
                .thread(thread_id)
                .status(RunStatus::Queued.as_str()),
        );
        Ok(Submission {
            run_id: request.run_id,
            duplicate: false,
        })
    }

    /// Run id an idempotency key already maps to, if any.
    pub async fn find_submission(
        &self,
        account_id: &str,
        idempotency_key_value: &str,
    ) -> Result<Option<String>, RunError> {
        let key = idempotency_key(account_id, idempotency_key_value);
        let store = &self.services.store;
        retry_store(self.attempts(), "idempotency_get", || store.get(&key)).await
    }

    pub async fn enqueue(&self, request: &RunRequest) -> Result<(), RunError> {
        let raw = serde_json::to_string(request).map_err(RunError::infra)?;
        let store = &self.services.store;
        retry_store(self.attempts(), "queue_push", || store.queue_push(RUN_QUEUE, &raw)).await
    }

    pub async fn queue_depth(&self) -> Result<usize, RunError> {
        let store = &self.services.store;
        retry_store(self.attempts(), "queue_len", || store.queue_len(RUN_QUEUE)).await
    }

    /// Pops the next request, waiting up to `wait` for one.
    pub async fn claim_next(&self, wait: Duration) -> Result<Option<RunRequest>, RunError> {
        let store = &self.services.store;
        let raw = retry_store(self.attempts(), "queue_pop", || store.queue_pop(RUN_QUEUE, wait)).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str::<RunRequest>(&raw) {
            Ok(request) => Ok(Some(request)),
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable run request");
                Ok(None)
            }
        }
    }

    /// Takes the run's lock and drives it to a terminal state. Refuses when
    /// the lock is held elsewhere or the run is no longer waiting.
    pub async fn start_claimed(&self, request: RunRequest) -> Result<StartOutcome, RunError> {
        let config = &self.services.config;
        let locks = &self.services.locks;
        let lock = match locks
            .acquire(&request.run_id, &self.worker_id, config.lock.ttl())
            .await
        {
            Ok(lock) => lock,
            Err(LockError::AlreadyHeld { .. }) => return Ok(StartOutcome::AlreadyHeld),
            Err(LockError::Expired { run_id }) => return Err(RunError::LockLost { run_id }),
            Err(LockError::Store(err)) => return Err(err),
        };

        let mut state = match self.load_state(&request.run_id).await {
            Ok(Some(state)) => state,
            Ok(None) => RunState::queued(&request),
            Err(err) => {
                // Initialization reports the persistence failure as FAILED.
                tracing::warn!(run_id = %request.run_id, error = %err, "run state unavailable at claim");
                RunState::queued(&request)
            }
        };
        if state.status != RunStatus::Queued {
            let reason = format!("run is {}", state.status);
            locks.release(&lock).await?;
            emit_event(
                Level::INFO,
                ProcessKind::Worker,
                ObservabilityEvent::new("run.claim_skipped", "scheduler")
                    .run(&request.run_id)
                    .worker(&self.worker_id)
                    .detail(&reason),
            );
            return Ok(StartOutcome::Skipped { reason });
        }
        state.attempt = request.attempt;

        emit_event(
            Level::INFO,
            ProcessKind::Worker,
            ObservabilityEvent::new("run.claimed", "scheduler")
                .run(&request.run_id)
                .thread(&request.thread_id)
                .worker(&self.worker_id),
        );
        let heartbeat = locks.start_heartbeat(lock, config.lock.renew_interval());
        let orchestrator = RunOrchestrator::new(self.services.clone(), state, heartbeat);
        Ok(StartOutcome::Finished(orchestrator.run().await))
    }

    /// Sends STOP. Returns false for unknown or terminal runs and for runs
    /// already asked to stop.
    pub async fn stop_run(&self, run_id: &str) -> Result<bool, RunError> {
        match self.load_state(run_id).await? {
            Some(state) if !state.is_terminal() => {
                self.services
                    .events
                    .signal_control(run_id, ControlSignal::Stop)
                    .await
            }
            _ => Ok(false),
        }
    }

    /// Re-enqueues runs persisted as QUEUED, for a process whose store
    /// started empty. Extra queue entries are skipped at claim time.
    pub async fn requeue_persisted(&self) -> Result<usize, RunError> {
        let timeout = self.services.config.orchestrator.persistence_timeout();
        let unfinished = match tokio::time::timeout(timeout, self.services.persistence.list_unfinished_runs()).await {
            Ok(result) => result.map_err(RunError::infra)?,
            Err(_) => return Err(RunError::infra("listing unfinished runs timed out")),
        };
        let mut requeued = 0;
        for state in unfinished.iter().filter(|s| s.status == RunStatus::Queued) {
            self.enqueue(&state.request()).await?;
            requeued += 1;
        }
        if requeued > 0 {
            tracing::info!(requeued, "re-enqueued persisted runs");
        }
        Ok(requeued)
    }

    pub async fn run_state(&self, run_id: &str) -> Result<Option<RunState>, RunError> {
        self.load_state(run_id).await
    }

    async fn load_state(&self, run_id: &str) -> Result<Option<RunState>, RunError> {
        let timeout = self.services.config.orchestrator.persistence_timeout();
        match tokio::time::timeout(timeout, self.services.persistence.load_run_state(run_id)).await {
            Ok(result) => result.map_err(RunError::infra),
            Err(_) => Err(RunError::infra("load run state timed out")),
        }
    }

    async fn save_state(&self, state: &RunState) -> Result<(), RunError> {
        let timeout = self.services.config.orchestrator.persistence_timeout();
        match tokio::time::timeout(timeout, self.services.persistence.save_run_state(state)).await {
            Ok(result) => result.map_err(RunError::infra),
            Err(_) => Err(RunError::infra("save run state timed out")),
        }
    }
}

/// Claims runs with bounded concurrency until shut down.
pub struct Worker {
    scheduler: RunScheduler,
    concurrency: usize,
    poll: Duration,
}

impl Worker {
    pub fn new(scheduler: RunScheduler) -> Self {
        let worker = &scheduler.services.config.worker;
        let concurrency = worker.concurrency.max(1);
        let poll = Duration::from_millis(worker.claim_poll_ms.max(1));
        Self {
            scheduler,
            concurrency,
            poll,
        }
    }

    /// Stops claiming once `shutdown` fires, then waits for in-flight runs.
    pub async fn run(&self, shutdown: CancellationToken) {
        let slots = Arc::new(Semaphore::new(self.concurrency));
        let worker_id = self.scheduler.worker_id().to_string();
        emit_event(
            Level::INFO,
            ProcessKind::Worker,
            ObservabilityEvent::new("worker.started", "worker")
                .worker(&worker_id)
                .detail(&format!("concurrency={}", self.concurrency)),
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let claimed = tokio::select! {
                _ = shutdown.cancelled() => break,
                claimed = self.scheduler.claim_next(self.poll) => claimed,
            };
            match claimed {
                Ok(Some(request)) => {
                    let scheduler = self.scheduler.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let run_id = request.run_id.clone();
                        match scheduler.start_claimed(request).await {
                            Ok(StartOutcome::Finished(state)) => {
                                tracing::debug!(run_id = %run_id, status = %state.status, "run finished")
                            }
                            Ok(StartOutcome::AlreadyHeld) => {
                                tracing::info!(run_id = %run_id, "run already claimed elsewhere")
                            }
                            Ok(StartOutcome::Skipped { reason }) => {
                                tracing::info!(run_id = %run_id, reason = %reason, "claim skipped")
                            }
                            Err(err) => {
                                tracing::error!(run_id = %run_id, error = %err, "run could not start")
                            }
                        }
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    drop(permit);
                    tracing::warn!(worker_id = %worker_id, error = %err, "claim failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll) => {}
                    }
                }
            }
        }

        let _ = slots.acquire_many(self.concurrency as u32).await;
        emit_event(
            Level::INFO,
            ProcessKind::Worker,
            ObservabilityEvent::new("worker.stopped", "worker").worker(&worker_id),
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub failed: usize,
    pub requeued: usize,
    pub purged: usize,
}

/// Recovers runs whose holder vanished without reaching a terminal state.
pub struct Reaper {
    scheduler: RunScheduler,
    holder_id: String,
}

impl Reaper {
    pub fn new(scheduler: RunScheduler) -> Self {
        let holder_id = format!("{}:reaper", scheduler.worker_id());
        Self {
            scheduler,
            holder_id,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let interval = Duration::from_millis(self.services().config.reaper.interval_ms.max(1));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match self.sweep().await {
                Ok(report) if report.failed + report.requeued > 0 => {
                    tracing::info!(failed = report.failed, requeued = report.requeued, "reaper reclaimed runs")
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "reaper sweep failed"),
            }
        }
    }

    fn services(&self) -> &RunServices {
        self.scheduler.services()
    }

    pub async fn sweep(&self) -> Result<ReapReport, RunError> {
        let services = self.services();
        let config = &services.config;
        let stale_after = chrono::Duration::milliseconds(config.reaper.stale_after_ms as i64);
        let timeout = config.orchestrator.persistence_timeout();
        let unfinished = match tokio::time::timeout(timeout, services.persistence.list_unfinished_runs()).await {
            Ok(result) => result.map_err(RunError::infra)?,
            Err(_) => return Err(RunError::infra("listing unfinished runs timed out")),
        };

        let mut report = ReapReport::default();
        for candidate in unfinished {
            if Utc::now() - candidate.updated_at < stale_after {
                continue;
            }
            if services.locks.is_locked(&candidate.run_id).await? {
                continue;
            }
            let lock = match services
                .locks
                .acquire(&candidate.run_id, &self.holder_id, config.lock.ttl())
                .await
            {
                Ok(lock) => lock,
                Err(LockError::Store(err)) => return Err(err),
                Err(_) => continue,
            };

            let outcome = self.reclaim(&candidate.run_id).await;
            if let Err(err) = services.locks.release(&lock).await {
                tracing::warn!(run_id = %candidate.run_id, error = %err, "reaper lock release failed");
            }
            match outcome? {
                Some(true) => report.requeued += 1,
                Some(false) => report.failed += 1,
                None => {}
            }
        }

        let store = &services.store;
        report.purged = retry_store(config.store_retry_attempts, "purge_expired", || store.purge_expired()).await?;
        Ok(report)
    }

    /// Some(true) when requeued, Some(false) when failed, None when the run
    /// finished in the meantime.
    async fn reclaim(&self, run_id: &str) -> Result<Option<bool>, RunError> {
        let services = self.services();
        let Some(mut state) = self.scheduler.load_state(run_id).await? else {
            return Ok(None);
        };
        if state.is_terminal() {
            return Ok(None);
        }
        if state.status == RunStatus::Queued {
            // Popped by a worker that never took the lock. The refreshed
            // timestamp keeps one queue entry per stale window.
            state.updated_at = Utc::now();
            self.scheduler.save_state(&state).await?;
            self.scheduler.enqueue(&state.request()).await?;
            self.log_reclaim(run_id, "requeued_waiting");
            return Ok(Some(true));
        }
        let previous = state.status;

        if let ReclaimPolicy::Requeue { max_attempts } = services.config.reaper.policy {
            if state.attempt.saturating_add(1) < max_attempts {
                let request = state.retry_request();
                state.status = RunStatus::Queued;
                state.attempt = request.attempt;
                state.updated_at = Utc::now();
                state.last_error = Some(format!("lock expired while {previous}; requeued"));
                state.error_code = Some(LOCK_EXPIRED_CODE.to_string());
                self.scheduler.save_state(&state).await?;
                services
                    .events
                    .publish(
                        run_id,
                        StreamEventKind::Status,
                        json!({ "status": RunStatus::Queued, "attempt": state.attempt, "requeued": true }),
                    )
                    .await?;
                self.scheduler.enqueue(&request).await?;
                self.log_reclaim(run_id, "requeued");
                return Ok(Some(true));
            }
        }

        state.status = RunStatus::Failed;
        state.updated_at = Utc::now();
        state.last_error = Some(format!("lock expired while {previous}; run abandoned"));
        state.error_code = Some(LOCK_EXPIRED_CODE.to_string());
        self.scheduler.save_state(&state).await?;
        let events = &services.events;
        events
            .publish(
                run_id,
                StreamEventKind::Error,
                json!({ "error_code": LOCK_EXPIRED_CODE, "message": state.last_error }),
            )
            .await?;
        events
            .publish(
                run_id,
                StreamEventKind::Done,
                json!({
                    "status": RunStatus::Failed,
                    "iterations": state.iteration_count,
                    "error_code": LOCK_EXPIRED_CODE,
                }),
            )
            .await?;
        events.finish(run_id, RunStatus::Failed.as_str()).await?;
        self.log_reclaim(run_id, "failed");
        Ok(Some(false))
    }

    fn log_reclaim(&self, run_id: &str, outcome: &str) {
        emit_event(
            Level::WARN,
            ProcessKind::Worker,
            ObservabilityEvent::new("run.reclaimed", "reaper")
                .run(run_id)
                .worker(&self.holder_id)
                .status(outcome)
                .error_code(LOCK_EXPIRED_CODE),
        );
    }
}
