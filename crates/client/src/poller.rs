//! Timer-driven status polling.
//!
//! [`poll_status`] spawns a task that fetches `GET /status/{id}` on a
//! fixed interval and hands each outcome to a callback. The fetch is
//! awaited inside the loop, so at most one request is in flight and a
//! slow response delays the next tick instead of overlapping it.
//!
//! The loop stops on its own when:
//! - a terminal status is observed,
//! - the status endpoint answers not-found or unauthorized,
//! - `error_threshold` consecutive fetches fail,
//! - `max_attempts` ticks pass without a terminal status.
//!
//! The last three end with a [`PollEvent::Failed`] carrying a
//! classified [`ErrorInfo`].

use std::sync::Arc;
use std::time::Duration;

use sitetrack_core::job::ErrorInfo;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::{AnalysisBackend, FetchFailure, StatusReport};

/// Default period between status fetches.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default tick budget (10 minutes at the default interval).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 300;

/// Consecutive transient failures tolerated before giving up.
pub const DEFAULT_ERROR_THRESHOLD: u32 = 5;

/// Tunables for one polling loop.
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
    pub error_threshold: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
        }
    }
}

impl PollConfig {
    /// Tick period actually used; a zero interval means the default.
    pub fn effective_interval(&self) -> Duration {
        if self.interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            self.interval
        }
    }
}

/// What the poller reports through its callback.
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    /// A successful fetch.
    Status(StatusReport),
    /// A transient fetch failure; polling continues.
    Degraded {
        consecutive_errors: u32,
        error: String,
    },
    /// Polling stopped without a terminal status. No further events follow.
    Failed(ErrorInfo),
}

/// Cancellation handle for a running poll loop.
pub struct PollHandle {
    job_id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Stop polling. Safe to call any number of times.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(job_id = %self.job_id, "Cancelling status polling");
            self.cancel.cancel();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Wait for the loop to exit.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Start polling `job_id` with a fresh cancellation token.
pub fn poll_status<F>(
    backend: Arc<dyn AnalysisBackend>,
    job_id: impl Into<String>,
    config: PollConfig,
    on_update: F,
) -> PollHandle
where
    F: FnMut(PollEvent) + Send + 'static,
{
    poll_status_until(backend, job_id, config, CancellationToken::new(), on_update)
}

/// Start polling `job_id`, stopping when `cancel` fires.
pub fn poll_status_until<F>(
    backend: Arc<dyn AnalysisBackend>,
    job_id: impl Into<String>,
    config: PollConfig,
    cancel: CancellationToken,
    on_update: F,
) -> PollHandle
where
    F: FnMut(PollEvent) + Send + 'static,
{
    let job_id = job_id.into();
    let task = tokio::spawn(run_poll_loop(
        backend,
        job_id.clone(),
        config,
        cancel.clone(),
        on_update,
    ));
    PollHandle {
        job_id,
        cancel,
        task,
    }
}

async fn run_poll_loop<F>(
    backend: Arc<dyn AnalysisBackend>,
    job_id: String,
    config: PollConfig,
    cancel: CancellationToken,
    mut on_update: F,
) where
    F: FnMut(PollEvent) + Send + 'static,
{
    let period = config.effective_interval();
    if config.interval.is_zero() {
        tracing::warn!(
            job_id = %job_id,
            fallback_ms = period.as_millis() as u64,
            "Zero poll interval configured; using default",
        );
    }
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempts: u32 = 0;
    let mut consecutive_errors: u32 = 0;

    tracing::debug!(
        job_id = %job_id,
        interval_ms = period.as_millis() as u64,
        max_attempts = config.max_attempts,
        "Status polling started",
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        attempts += 1;
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = backend.status(&job_id) => result,
        };

        match fetched {
            Ok(report) => {
                consecutive_errors = 0;
                let terminal = report.status.is_terminal();
                on_update(PollEvent::Status(report));
                if terminal {
                    tracing::debug!(job_id = %job_id, attempts, "Polling observed terminal status");
                    break;
                }
            }
            Err(e) => match e.classify() {
                FetchFailure::NotFound => {
                    tracing::warn!(job_id = %job_id, "Status polling: job not found");
                    on_update(PollEvent::Failed(ErrorInfo::not_found(&job_id)));
                    break;
                }
                FetchFailure::Unauthorized => {
                    tracing::warn!(job_id = %job_id, "Status polling: unauthorized");
                    on_update(PollEvent::Failed(ErrorInfo::unauthorized()));
                    break;
                }
                FetchFailure::Transient => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        job_id = %job_id,
                        consecutive_errors,
                        error = %e,
                        "Status fetch failed",
                    );
                    if consecutive_errors >= config.error_threshold {
                        on_update(PollEvent::Failed(ErrorInfo::connection_lost(
                            consecutive_errors,
                        )));
                        break;
                    }
                    on_update(PollEvent::Degraded {
                        consecutive_errors,
                        error: e.to_string(),
                    });
                }
            },
        }

        if attempts >= config.max_attempts {
            tracing::warn!(job_id = %job_id, attempts, "Status polling timed out");
            on_update(PollEvent::Failed(ErrorInfo::poll_timeout(attempts)));
            break;
        }
    }

    tracing::debug!(job_id = %job_id, attempts, "Status polling stopped");
}
