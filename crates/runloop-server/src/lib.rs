use std::time::{SystemTime, UNIX_EPOCH};

use runloop_core::{RunScheduler, RunServices};
use tokio_util::sync::CancellationToken;

mod http;

pub use http::{app_router, serve};

/// Handles shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    scheduler: RunScheduler,
    shutdown: CancellationToken,
    started_at_ms: u64,
}

impl AppState {
    pub fn new(scheduler: RunScheduler) -> Self {
        Self {
            scheduler,
            shutdown: CancellationToken::new(),
            started_at_ms: now_ms(),
        }
    }

    /// Ties the server's lifetime to an outer token. Open event streams end
    /// when it fires.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn scheduler(&self) -> &RunScheduler {
        &self.scheduler
    }

    pub fn services(&self) -> &RunServices {
        self.scheduler.services()
    }

    pub fn uptime_ms(&self) -> u64 {
        now_ms().saturating_sub(self.started_at_ms)
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
