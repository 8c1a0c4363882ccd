use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use runloop_observability::{emit_event, ObservabilityEvent, ProcessKind};
use runloop_types::RunStatus;

use crate::error::RunError;
use crate::store::{retry_store, SharedStore};

pub(crate) fn lock_key(run_id: &str) -> String {
    format!("runloop:run:{run_id}:lock")
}

pub(crate) fn heartbeat_key(run_id: &str) -> String {
    format!("runloop:run:{run_id}:heartbeat")
}

/// Proof of exclusive ownership of a run. The store holds `token` under the
/// run's lock key until release or expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunLock {
    pub run_id: String,
    pub holder_id: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    ttl: Duration,
}

impl RunLock {
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("run {run_id} is already locked")]
    AlreadyHeld { run_id: String },

    #[error("lock for run {run_id} expired or is held by someone else")]
    Expired { run_id: String },

    #[error(transparent)]
    Store(#[from] RunError),
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero())
}

#[derive(Clone)]
pub struct RunLockManager {
    store: Arc<dyn SharedStore>,
    retry_attempts: u32,
}

impl RunLockManager {
    pub fn new(store: Arc<dyn SharedStore>, retry_attempts: u32) -> Self {
        Self {
            store,
            retry_attempts,
        }
    }

    /// Atomic test-and-set: succeeds only when no live lock exists for the run.
    pub async fn acquire(&self, run_id: &str, holder_id: &str, ttl: Duration) -> Result<RunLock, LockError> {
        let token = format!("{holder_id}:{}", Uuid::new_v4());
        let key = lock_key(run_id);
        let acquired = retry_store(self.retry_attempts, "lock_acquire", || {
            self.store.set_if_absent(&key, &token, Some(ttl))
        })
        .await?;
        if !acquired {
            emit_event(
                Level::INFO,
                ProcessKind::Worker,
                ObservabilityEvent::new("lock.contended", "run_lock")
                    .run(run_id)
                    .worker(holder_id),
            );
            return Err(LockError::AlreadyHeld {
                run_id: run_id.to_string(),
            });
        }
        emit_event(
            Level::INFO,
            ProcessKind::Worker,
            ObservabilityEvent::new("lock.acquired", "run_lock")
                .run(run_id)
                .worker(holder_id),
        );
        Ok(RunLock {
            run_id: run_id.to_string(),
            holder_id: holder_id.to_string(),
            token,
            acquired_at: Utc::now(),
            expires_at: expiry(ttl),
            ttl,
        })
    }

    pub async fn renew(&self, lock: &mut RunLock) -> Result<(), LockError> {
        let key = lock_key(&lock.run_id);
        let renewed = retry_store(self.retry_attempts, "lock_renew", || {
            self.store.compare_and_expire(&key, &lock.token, lock.ttl)
        })
        .await?;
        if !renewed {
            return Err(LockError::Expired {
                run_id: lock.run_id.clone(),
            });
        }
        lock.expires_at = expiry(lock.ttl);
        Ok(())
    }

    /// Returns false when the lock had already expired or changed hands.
    pub async fn release(&self, lock: &RunLock) -> Result<bool, RunError> {
        let key = lock_key(&lock.run_id);
        let released = retry_store(self.retry_attempts, "lock_release", || {
            self.store.compare_and_delete(&key, &lock.token)
        })
        .await?;
        let _ = self.store.delete(&heartbeat_key(&lock.run_id)).await;
        emit_event(
            Level::INFO,
            ProcessKind::Worker,
            ObservabilityEvent::new("lock.released", "run_lock")
                .run(&lock.run_id)
                .worker(&lock.holder_id)
                .status(if released { "released" } else { "already_gone" }),
        );
        Ok(released)
    }

    pub async fn is_locked(&self, run_id: &str) -> Result<bool, RunError> {
        let key = lock_key(run_id);
        let holder = retry_store(self.retry_attempts, "lock_get", || self.store.get(&key)).await?;
        Ok(holder.is_some())
    }

    /// Renews `lock` every `interval` until stopped. A failed renewal cancels
    /// the returned heartbeat's `lost` token and ends the task.
    pub fn start_heartbeat(&self, lock: RunLock, interval: Duration) -> LockHeartbeat {
        let lost = CancellationToken::new();
        let stop = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(HeartbeatStatus {
            status: RunStatus::Initializing,
            iteration: 0,
        });
        let handle = tokio::spawn(heartbeat_loop(
            self.clone(),
            lock,
            interval,
            status_rx,
            lost.clone(),
            stop.clone(),
        ));
        LockHeartbeat {
            lost,
            stop,
            status_tx,
            handle,
        }
    }

    async fn write_heartbeat(&self, lock: &RunLock, status: HeartbeatStatus) {
        let payload = json!({
            "holder_id": lock.holder_id,
            "status": status.status,
            "iteration": status.iteration,
            "timestamp": Utc::now(),
        })
        .to_string();
        if let Err(err) = self
            .store
            .set(&heartbeat_key(&lock.run_id), &payload, Some(lock.ttl))
            .await
        {
            tracing::debug!(run_id = %lock.run_id, error = %err, "heartbeat write failed");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatStatus {
    pub status: RunStatus,
    pub iteration: u32,
}

pub struct LockHeartbeat {
    lost: CancellationToken,
    stop: CancellationToken,
    status_tx: watch::Sender<HeartbeatStatus>,
    handle: JoinHandle<RunLock>,
}

impl LockHeartbeat {
    /// Cancelled once the lock can no longer be renewed.
    pub fn lost_token(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    pub fn report(&self, status: RunStatus, iteration: u32) {
        let _ = self.status_tx.send(HeartbeatStatus { status, iteration });
    }

    /// Stops renewing and hands the lock back for release.
    pub async fn stop(self) -> Option<RunLock> {
        self.stop.cancel();
        self.handle.await.ok()
    }
}

async fn heartbeat_loop(
    manager: RunLockManager,
    mut lock: RunLock,
    interval: Duration,
    status_rx: watch::Receiver<HeartbeatStatus>,
    lost: CancellationToken,
    stop: CancellationToken,
) -> RunLock {
    let initial = *status_rx.borrow();
    manager.write_heartbeat(&lock, initial).await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        match manager.renew(&mut lock).await {
            Ok(()) => {
                let status = *status_rx.borrow();
                manager.write_heartbeat(&lock, status).await;
            }
            Err(err) => {
                let detail = err.to_string();
                emit_event(
                    Level::ERROR,
                    ProcessKind::Worker,
                    ObservabilityEvent::new("lock.lost", "run_lock")
                        .run(&lock.run_id)
                        .worker(&lock.holder_id)
                        .error_code("LOCK_LOST")
                        .detail(&detail),
                );
                lost.cancel();
                break;
            }
        }
    }
    lock
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> (Arc<MemoryStore>, RunLockManager) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), RunLockManager::new(store, 1))
    }

    #[tokio::test(start_paused = true)]
    async fn second_acquire_is_rejected_until_expiry() {
        let (_, locks) = manager();
        let ttl = Duration::from_secs(3);
        let first = locks.acquire("r1", "worker-a", ttl).await.expect("acquire");
        let err = locks
            .acquire("r1", "worker-b", ttl)
            .await
            .expect_err("held");
        assert_eq!(err, LockError::AlreadyHeld { run_id: "r1".to_string() });

        tokio::time::advance(Duration::from_secs(4)).await;
        let second = locks.acquire("r1", "worker-b", ttl).await.expect("expired lock is free");
        assert_ne!(first.token, second.token);

        let mut stale = first;
        assert_eq!(
            locks.renew(&mut stale).await,
            Err(LockError::Expired { run_id: "r1".to_string() })
        );
        assert!(!locks.release(&stale).await.expect("release"));
        assert!(locks.is_locked("r1").await.expect("holder"));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_lock_alive_past_ttl() {
        let (store, locks) = manager();
        let ttl = Duration::from_secs(3);
        let lock = locks.acquire("r1", "worker-a", ttl).await.expect("acquire");
        let heartbeat = locks.start_heartbeat(lock, Duration::from_secs(1));
        heartbeat.report(RunStatus::Executing, 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!heartbeat.is_lost());
        let beat = store
            .get(&heartbeat_key("r1"))
            .await
            .expect("get")
            .expect("heartbeat written");
        assert!(beat.contains("\"executing\""));

        let lock = heartbeat.stop().await.expect("lock back");
        assert!(locks.release(&lock).await.expect("release"));
        assert!(!locks.is_locked("r1").await.expect("holder"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_renewal_cancels_lost_token() {
        let (store, locks) = manager();
        let lock = locks
            .acquire("r1", "worker-a", Duration::from_secs(3))
            .await
            .expect("acquire");
        let heartbeat = locks.start_heartbeat(lock, Duration::from_secs(1));
        let lost = heartbeat.lost_token();

        store.set_unavailable(true);
        tokio::time::timeout(Duration::from_secs(5), lost.cancelled())
            .await
            .expect("lock loss detected");
        assert!(heartbeat.is_lost());
    }
}
