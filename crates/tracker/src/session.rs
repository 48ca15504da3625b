//! Tracking session: the single owner of tracked job state.
//!
//! [`TrackingSession`] spawns one actor task that owns the
//! [`JobTracker`], the [`ResultCache`] and every observer (streaming
//! channels and poll loops). Observers never touch job state; they send
//! their events into the actor's queue, and the actor feeds them to the
//! reducer one at a time in arrival order. Public calls are queued the
//! same way, so there is never a gap between reading a handle and
//! writing it.
//!
//! A second task runs the list reconciliation loop. It fetches the
//! authoritative list outside the actor and hands the listing back
//! through the queue, where the staleness fence is applied against the
//! handles as they are at that moment.
//!
//! Changes are published on a broadcast channel (see [`TrackerEvent`])
//! and as a `watch` snapshot of every tracked handle.
//!
//! Dropping the session, or calling [`TrackingSession::shutdown`],
//! cancels the master token, which stops every channel, poll loop and
//! the reconciler, including reconnects waiting out their delay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sitetrack_client::api::{AnalysisApi, AnalysisBackend, ApiError, SearchQuery};
use sitetrack_client::channel::{ChannelEvent, EventKind, TransportChannel};
use sitetrack_client::client::{ChannelKind, StreamClient};
use sitetrack_client::poller::{poll_status_until, PollEvent, PollHandle};
use sitetrack_client::protocol::StreamMessage;
use sitetrack_core::error::CoreError;
use sitetrack_core::job::{
    ContactState, ErrorInfo, FailureKind, IdKind, JobHandle, JobStatus, JobUpdate,
    PROVISIONAL_ID_PREFIX,
};
use sitetrack_core::request::AnalysisRequest;
use sitetrack_core::result::{Attachment, CachedResult};
use sitetrack_core::types::JobId;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cache::{Observed, ResultCache};
use crate::config::{TrackerConfig, UpdateMode, DEFAULT_RECONCILE_INTERVAL};
use crate::events::{RetireReason, TrackerEvent};
use crate::reconciler::{self, Listing};
use crate::tracker::{Applied, JobTracker, Rekey, TrackerError};

/// Broadcast channel capacity for tracker events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long shutdown waits for each background task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Errors returned by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid request: {0}")]
    Validation(#[from] CoreError),

    #[error("Submission failed: {0}")]
    Submission(#[source] ApiError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("Result for job {0} is not ready yet")]
    NotReady(JobId),

    #[error("Result for job {id} is unavailable: {source}")]
    ResultUnavailable {
        id: JobId,
        #[source]
        source: ApiError,
    },

    #[error("Tracking session has shut down")]
    Closed,
}

/// How far a cancellation reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelScope {
    /// Stop observing locally; the server keeps working.
    Local,
    /// Also ask the server to cancel the job.
    Remote,
}

/// A completed job's payload.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub id: JobId,
    pub payload: serde_json::Value,
    pub attachments: Vec<Attachment>,
    /// Served from the result cache without a request.
    pub from_cache: bool,
}

impl From<CachedResult> for JobResult {
    fn from(cached: CachedResult) -> Self {
        Self {
            id: cached.id,
            payload: cached.payload,
            attachments: cached.attachments,
            from_cache: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Actor inputs
// ---------------------------------------------------------------------------

/// Everything the actor consumes, from callers and observers alike.
enum Input {
    BeginSubmission {
        site_name: String,
        reply: oneshot::Sender<JobHandle>,
    },
    ConfirmSubmission {
        provisional_id: JobId,
        canonical_id: JobId,
        status: Option<JobStatus>,
        reply: oneshot::Sender<Result<JobHandle, TrackerError>>,
    },
    RejectSubmission {
        provisional_id: JobId,
        error: ErrorInfo,
    },
    Track {
        id: JobId,
        site_name: Option<String>,
        reply: oneshot::Sender<JobHandle>,
    },
    WatchBatch {
        batch_id: String,
    },
    Cancel {
        id: JobId,
        reply: oneshot::Sender<Result<JobHandle, TrackerError>>,
    },
    Dismiss {
        id: JobId,
        reply: oneshot::Sender<Result<JobHandle, TrackerError>>,
    },
    LookupResult {
        id: JobId,
        reply: oneshot::Sender<Option<CachedResult>>,
    },
    StoreResult {
        result: JobResult,
        /// The server reported the job completed.
        completed: bool,
    },
    Stream {
        job_id: JobId,
        event: ChannelEvent,
    },
    Poll {
        job_id: JobId,
        event: PollEvent,
    },
    Batch {
        batch_id: String,
        event: ChannelEvent,
    },
    Listing(Listing),
    SweepFailedSubmissions,
}

// ---------------------------------------------------------------------------
// TrackingSession
// ---------------------------------------------------------------------------

/// Handle to a running tracking session.
///
/// Owned by the UI context that created it. All methods are cheap
/// queue round-trips to the actor, except where noted.
pub struct TrackingSession {
    inputs: mpsc::UnboundedSender<Input>,
    events: broadcast::Sender<TrackerEvent>,
    jobs: watch::Receiver<Vec<JobHandle>>,
    backend: Arc<dyn AnalysisBackend>,
    /// Master cancellation token -- cancelled on shutdown or drop.
    cancel: CancellationToken,
    actor: Option<JoinHandle<()>>,
    reconciler: Option<JoinHandle<()>>,
}

impl TrackingSession {
    /// Start a session talking to the HTTP API at `config.api_url`.
    pub fn start(config: TrackerConfig) -> Self {
        let backend = Arc::new(AnalysisApi::new(config.api_url.clone()));
        Self::with_backend(config, backend)
    }

    /// Start a session over any [`AnalysisBackend`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_backend(config: TrackerConfig, backend: Arc<dyn AnalysisBackend>) -> Self {
        let (inputs, input_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (jobs_tx, jobs) = watch::channel(Vec::new());
        let cancel = CancellationToken::new();

        tracing::info!(
            api_url = %config.api_url,
            ws_url = %config.ws_url,
            mode = ?config.update_mode,
            "Starting tracking session",
        );

        let reconciler = tokio::spawn(run_reconciler(
            Arc::clone(&backend),
            inputs.clone(),
            jobs.clone(),
            config.reconcile_interval,
            config.reconcile_page_size,
            cancel.child_token(),
        ));

        let actor = SessionActor {
            stream_client: StreamClient::new(config.ws_url.clone()),
            cache: ResultCache::new(config.cache_ttl, config.cache_capacity),
            config,
            backend: Arc::clone(&backend),
            tracker: JobTracker::new(),
            observers: HashMap::new(),
            batches: HashMap::new(),
            inputs: inputs.clone(),
            events: events.clone(),
            jobs_tx,
            cancel: cancel.clone(),
        };
        let actor = tokio::spawn(actor.run(input_rx));

        Self {
            inputs,
            events,
            jobs,
            backend,
            cancel,
            actor: Some(actor),
            reconciler: Some(reconciler),
        }
    }

    /// Subscribe to tracker events.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    /// Consistent snapshot of every tracked handle, in tracking order.
    pub fn jobs(&self) -> Vec<JobHandle> {
        self.jobs.borrow().clone()
    }

    /// Watch the tracked set change.
    pub fn job_changes(&self) -> watch::Receiver<Vec<JobHandle>> {
        self.jobs.clone()
    }

    /// Validate and submit `request`.
    ///
    /// A provisional handle is visible immediately. On success it is
    /// rekeyed to the server id and observed; the rekeyed handle is
    /// returned. On failure it is failed in place (and retired on the
    /// next reconcile tick) and the error is returned. Validation errors
    /// are returned before anything is tracked or sent.
    ///
    /// The submission runs on its own task, so dropping this future
    /// still settles the provisional handle.
    pub async fn submit(&self, request: AnalysisRequest) -> Result<JobHandle, SessionError> {
        request.validate()?;

        let task = tokio::spawn(run_submission(
            Arc::clone(&self.backend),
            self.inputs.clone(),
            request,
            self.cancel.child_token(),
        ));
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "Submission task did not finish");
                Err(SessionError::Closed)
            }
        }
    }

    /// Start observing a job whose canonical id is already known.
    pub async fn track(
        &self,
        id: impl Into<JobId>,
        site_name: Option<String>,
    ) -> Result<JobHandle, SessionError> {
        let id = id.into();
        self.request(|reply| Input::Track {
            id,
            site_name,
            reply,
        })
        .await
    }

    /// Open a streaming channel for a batch and republish its progress.
    pub fn watch_batch(&self, batch_id: impl Into<String>) -> Result<(), SessionError> {
        self.send(Input::WatchBatch {
            batch_id: batch_id.into(),
        })
    }

    /// Stop observing `id` and remove it from the tracked set.
    ///
    /// With [`CancelScope::Remote`] the server is also asked to cancel a
    /// canonical job; failure of that request is logged, not returned.
    pub async fn cancel(&self, id: &str, scope: CancelScope) -> Result<(), SessionError> {
        let id = id.to_string();
        let handle = self
            .request(|reply| Input::Cancel { id, reply })
            .await??;

        if scope == CancelScope::Remote && handle.id_kind == IdKind::Canonical {
            match self.backend.cancel(&handle.id).await {
                Ok(()) => tracing::info!(job_id = %handle.id, "Remote cancellation requested"),
                Err(e) => {
                    tracing::warn!(job_id = %handle.id, error = %e, "Remote cancellation failed")
                }
            }
        }
        Ok(())
    }

    /// Remove a finished job from the tracked set.
    pub async fn dismiss(&self, id: &str) -> Result<JobHandle, SessionError> {
        let id = id.to_string();
        Ok(self.request(|reply| Input::Dismiss { id, reply }).await??)
    }

    /// Fetch the completed payload of `id`.
    ///
    /// Served from the cache when possible; otherwise from the results
    /// endpoint, falling back to the full-record endpoint for retained
    /// analyses the results endpoint no longer knows.
    ///
    /// A payload cached from a tracked completion carries no artifact
    /// list, so the first lookup still asks the service and caches what
    /// it returns. If that request fails the observed payload is served.
    pub async fn result(&self, id: &str) -> Result<JobResult, SessionError> {
        let key = id.to_string();
        let cached = self
            .request(|reply| Input::LookupResult { id: key, reply })
            .await?;

        let fetched = match cached {
            Some(cached) if cached.is_authoritative() => {
                tracing::debug!(job_id = id, "Result cache hit");
                return Ok(cached.into());
            }
            Some(observed) => match fetch_result(self.backend.as_ref(), id).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    tracing::warn!(job_id = id, error = %e, "Serving tracked result without artifacts");
                    return Ok(observed.into());
                }
            },
            None => fetch_result(self.backend.as_ref(), id).await?,
        };

        let (result, completed) = fetched;
        self.send(Input::StoreResult {
            result: result.clone(),
            completed,
        })?;
        Ok(result)
    }

    /// Stop every observer and background task.
    ///
    /// Cancels the master token, then waits up to 5 seconds per task
    /// for a clean exit.
    pub async fn shutdown(mut self) {
        tracing::info!("Shutting down tracking session");
        self.cancel.cancel();
        for task in [self.actor.take(), self.reconciler.take()]
            .into_iter()
            .flatten()
        {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await;
        }
        tracing::info!("Tracking session shut down");
    }

    // ---- private helpers ----

    fn send(&self, input: Input) -> Result<(), SessionError> {
        send_input(&self.inputs, input)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Input,
    ) -> Result<T, SessionError> {
        ask(&self.inputs, make).await
    }
}

fn send_input(inputs: &mpsc::UnboundedSender<Input>, input: Input) -> Result<(), SessionError> {
    inputs.send(input).map_err(|_| SessionError::Closed)
}

/// Queue `make(reply)` and wait for the actor's answer.
async fn ask<T>(
    inputs: &mpsc::UnboundedSender<Input>,
    make: impl FnOnce(oneshot::Sender<T>) -> Input,
) -> Result<T, SessionError> {
    let (tx, rx) = oneshot::channel();
    send_input(inputs, make(tx))?;
    rx.await.map_err(|_| SessionError::Closed)
}

/// Begin, send and settle one submission.
///
/// Every path that got a provisional handle ends in a confirm or a
/// reject, unless the session itself is shutting down.
async fn run_submission(
    backend: Arc<dyn AnalysisBackend>,
    inputs: mpsc::UnboundedSender<Input>,
    request: AnalysisRequest,
    cancel: CancellationToken,
) -> Result<JobHandle, SessionError> {
    let site_name = request.site_name.trim().to_string();
    let provisional = ask(&inputs, |reply| Input::BeginSubmission { site_name, reply }).await?;

    let submitted = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(SessionError::Closed),
        submitted = backend.submit(&request) => submitted,
    };

    match submitted {
        Ok(response) => {
            tracing::info!(
                provisional_id = %provisional.id,
                job_id = %response.job_id,
                "Analysis submitted",
            );
            let handle = ask(&inputs, |reply| Input::ConfirmSubmission {
                provisional_id: provisional.id,
                canonical_id: response.job_id,
                status: response.status,
                reply,
            })
            .await??;
            Ok(handle)
        }
        Err(e) => {
            tracing::warn!(provisional_id = %provisional.id, error = %e, "Analysis submission failed");
            let error = ErrorInfo::new(
                FailureKind::SubmissionFailed,
                format!("Could not start analysis: {e}"),
            );
            send_input(
                &inputs,
                Input::RejectSubmission {
                    provisional_id: provisional.id,
                    error,
                },
            )?;
            Err(SessionError::Submission(e))
        }
    }
}

/// Read the completed payload of `id` from the service.
///
/// Returns the result and whether the service reported it completed.
/// Falls back to the full-record endpoint for retained analyses the
/// results endpoint no longer knows.
async fn fetch_result(
    backend: &dyn AnalysisBackend,
    id: &str,
) -> Result<(JobResult, bool), SessionError> {
    let unavailable = |source| SessionError::ResultUnavailable {
        id: id.to_string(),
        source,
    };
    match backend.results(id).await {
        Ok(response) => {
            if matches!(
                response.status,
                Some(JobStatus::Pending | JobStatus::Processing | JobStatus::GettingReady)
            ) {
                return Err(SessionError::NotReady(id.to_string()));
            }
            let completed = response.status == Some(JobStatus::Completed);
            let result = JobResult {
                id: id.to_string(),
                payload: response.result,
                attachments: response.attachments,
                from_cache: false,
            };
            Ok((result, completed))
        }
        Err(e) if e.is_not_found() => {
            tracing::debug!(job_id = id, "No results envelope; fetching full record");
            let payload = backend.analysis(id).await.map_err(unavailable)?;
            let result = JobResult {
                id: id.to_string(),
                payload,
                attachments: Vec::new(),
                from_cache: false,
            };
            // Only finished analyses are retained as full records.
            Ok((result, true))
        }
        Err(e) => Err(unavailable(e)),
    }
}

impl Drop for TrackingSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Observers attached to one job.
#[derive(Default)]
struct Observers {
    channel: Option<TransportChannel>,
    poller: Option<PollHandle>,
}

impl Observers {
    fn stop(mut self) {
        if let Some(channel) = self.channel.as_mut() {
            channel.disconnect();
        }
        if let Some(poller) = self.poller.as_ref() {
            poller.cancel();
        }
    }

    fn poller_alive(&self) -> bool {
        self.poller.as_ref().is_some_and(|p| !p.is_finished())
    }
}

struct SessionActor {
    config: TrackerConfig,
    backend: Arc<dyn AnalysisBackend>,
    stream_client: StreamClient,
    tracker: JobTracker,
    cache: ResultCache,
    observers: HashMap<JobId, Observers>,
    batches: HashMap<String, TransportChannel>,
    /// Cloned into every observer callback.
    inputs: mpsc::UnboundedSender<Input>,
    events: broadcast::Sender<TrackerEvent>,
    jobs_tx: watch::Sender<Vec<JobHandle>>,
    cancel: CancellationToken,
}

impl SessionActor {
    async fn run(mut self, mut input_rx: mpsc::UnboundedReceiver<Input>) {
        loop {
            let input = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                input = input_rx.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            };
            self.handle(input);
        }

        for (_, observers) in self.observers.drain() {
            observers.stop();
        }
        for (_, mut channel) in self.batches.drain() {
            channel.disconnect();
        }
        tracing::debug!("Tracking session actor exited");
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::BeginSubmission { site_name, reply } => {
                let handle =
                    reconciler::begin_submission(&mut self.tracker, Some(site_name), Utc::now());
                self.publish_handle(handle.clone());
                let _ = reply.send(handle);
            }
            Input::ConfirmSubmission {
                provisional_id,
                canonical_id,
                status,
                reply,
            } => {
                let outcome = self.confirm_submission(&provisional_id, &canonical_id, status);
                let _ = reply.send(outcome);
            }
            Input::RejectSubmission {
                provisional_id,
                error,
            } => {
                match reconciler::reject_submission(
                    &mut self.tracker,
                    &provisional_id,
                    error,
                    Utc::now(),
                ) {
                    Ok(handle) => self.publish_handle(handle),
                    Err(e) => tracing::debug!(provisional_id = %provisional_id, error = %e, "Rejected submission no longer tracked"),
                }
            }
            Input::Track {
                id,
                site_name,
                reply,
            } => {
                let handle = self
                    .tracker
                    .track_canonical(id.clone(), site_name, Utc::now())
                    .clone();
                self.publish_handle(handle.clone());
                if !handle.is_terminal() {
                    self.observe(&id);
                }
                let _ = reply.send(self.tracker.get(&id).cloned().unwrap_or(handle));
            }
            Input::WatchBatch { batch_id } => self.watch_batch(batch_id),
            Input::Cancel { id, reply } => {
                let outcome = self.retire(&id, RetireReason::Cancelled);
                let _ = reply.send(outcome.ok_or(TrackerError::UnknownJob(id)));
            }
            Input::Dismiss { id, reply } => {
                let outcome = self.tracker.dismiss(&id);
                if outcome.is_ok() {
                    self.stop_observing(&id);
                    self.emit(TrackerEvent::JobRetired {
                        id,
                        reason: RetireReason::Dismissed,
                    });
                    self.publish_snapshot();
                }
                let _ = reply.send(outcome);
            }
            Input::LookupResult { id, reply } => {
                let cached = self.cache.get(&id, Utc::now()).cloned();
                let _ = reply.send(cached);
            }
            Input::StoreResult { result, completed } => self.store_result(result, completed),
            Input::Stream { job_id, event } => self.on_stream_event(&job_id, event),
            Input::Poll { job_id, event } => self.on_poll_event(&job_id, event),
            Input::Batch { batch_id, event } => self.on_batch_event(&batch_id, event),
            Input::Listing(listing) => {
                for id in reconciler::reconcile(&mut self.tracker, &listing) {
                    self.stop_observing(&id);
                    self.emit(TrackerEvent::JobRetired {
                        id,
                        reason: RetireReason::Listed,
                    });
                }
                self.publish_snapshot();
            }
            Input::SweepFailedSubmissions => {
                for id in reconciler::sweep_failed_submissions(&mut self.tracker) {
                    self.emit(TrackerEvent::JobRetired {
                        id,
                        reason: RetireReason::SubmissionFailed,
                    });
                }
                self.publish_snapshot();
            }
        }
    }

    // ---- submissions ----

    fn confirm_submission(
        &mut self,
        provisional_id: &str,
        canonical_id: &str,
        status: Option<JobStatus>,
    ) -> Result<JobHandle, TrackerError> {
        let now = Utc::now();
        let rekey = reconciler::confirm_submission(
            &mut self.tracker,
            provisional_id,
            canonical_id,
            now,
        )?;
        if rekey == Rekey::Merged {
            tracing::debug!(provisional_id, canonical_id, "Submission confirmed onto tracked job");
        }
        self.emit(TrackerEvent::JobRekeyed {
            provisional: provisional_id.to_string(),
            canonical: canonical_id.to_string(),
        });

        // The submit response may already be ahead of `pending`. A
        // terminal status there carries no payload; the observers fetch
        // the full terminal state instead.
        if let Some(status) = status.filter(|s| *s != JobStatus::Pending && !s.is_terminal()) {
            let update = JobUpdate {
                status: Some(status),
                ..Default::default()
            };
            let _ = self.tracker.apply(canonical_id, update, now);
        }

        let handle = self
            .tracker
            .get(canonical_id)
            .cloned()
            .ok_or_else(|| TrackerError::UnknownJob(canonical_id.to_string()))?;
        self.publish_handle(handle);
        if !self.tracker.get(canonical_id).is_some_and(JobHandle::is_terminal) {
            self.observe(canonical_id);
        }
        self.tracker
            .get(canonical_id)
            .cloned()
            .ok_or_else(|| TrackerError::UnknownJob(canonical_id.to_string()))
    }

    // ---- observers ----

    /// Attach the observers the update mode asks for. No-op if `id`
    /// already has observers.
    fn observe(&mut self, id: &str) {
        if self.observers.contains_key(id) {
            return;
        }
        let mode = self.config.update_mode;
        let observers = Observers {
            channel: mode.uses_stream().then(|| self.open_job_channel(id)),
            poller: mode.polls_eagerly().then(|| self.start_poller(id)),
        };
        self.observers.insert(id.to_string(), observers);
        if mode == UpdateMode::Poll {
            self.set_contact(id, ContactState::Polling);
        }
    }

    fn open_job_channel(&self, id: &str) -> TransportChannel {
        let mut channel = TransportChannel::new(
            self.stream_client.clone(),
            self.config.channel.clone(),
            self.cancel.clone(),
        );
        let tx = self.inputs.clone();
        let job_id = id.to_string();
        channel.on(EventKind::All, move |event| {
            let _ = tx.send(Input::Stream {
                job_id: job_id.clone(),
                event: event.clone(),
            });
        });
        channel.connect(id, ChannelKind::Job);
        channel
    }

    fn start_poller(&self, id: &str) -> PollHandle {
        let tx = self.inputs.clone();
        let job_id = id.to_string();
        poll_status_until(
            Arc::clone(&self.backend),
            id,
            self.config.poll.clone(),
            self.cancel.child_token(),
            move |event| {
                let _ = tx.send(Input::Poll {
                    job_id: job_id.clone(),
                    event,
                });
            },
        )
    }

    fn stop_observing(&mut self, id: &str) {
        if let Some(observers) = self.observers.remove(id) {
            tracing::debug!(job_id = id, "Stopping job observers");
            observers.stop();
        }
    }

    fn on_stream_event(&mut self, id: &str, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => self.set_contact(id, ContactState::Live),
            ChannelEvent::Message(StreamMessage::Connected { .. }) => {
                tracing::debug!(job_id = id, "Streaming subscription acknowledged");
            }
            ChannelEvent::Message(message) => match message.to_job_update() {
                Some(update) => self.apply_update(id, update),
                None => tracing::debug!(
                    job_id = id,
                    msg_type = message.type_name(),
                    "Ignoring non-job message",
                ),
            },
            ChannelEvent::Reconnecting { attempt, .. } => {
                self.set_contact(id, ContactState::Reconnecting { attempt })
            }
            ChannelEvent::Failed(err) => self.on_stream_failed(id, err.attempts()),
        }
    }

    fn on_stream_failed(&mut self, id: &str, attempts: u32) {
        let Some(observers) = self.observers.get_mut(id) else {
            return;
        };
        if let Some(mut channel) = observers.channel.take() {
            channel.disconnect();
        }
        let poller_alive = observers.poller_alive();

        if poller_alive {
            tracing::info!(job_id = id, "Streaming gave up; polling continues");
            self.set_contact(id, ContactState::Polling);
        } else if self.config.update_mode == UpdateMode::StreamWithPollFallback {
            tracing::info!(job_id = id, attempts, "Streaming gave up; falling back to polling");
            let poller = self.start_poller(id);
            if let Some(observers) = self.observers.get_mut(id) {
                observers.poller = Some(poller);
            }
            self.set_contact(id, ContactState::Polling);
        } else {
            tracing::warn!(job_id = id, attempts, "Streaming gave up with no other update path");
            self.fail_job(id, ErrorInfo::transport(attempts));
        }
    }

    fn on_poll_event(&mut self, id: &str, event: PollEvent) {
        let stream_alive = self
            .observers
            .get(id)
            .is_some_and(|o| o.channel.is_some());

        match event {
            PollEvent::Status(report) => {
                if !stream_alive {
                    self.set_contact(id, ContactState::Polling);
                }
                self.apply_update(id, report.to_job_update());
            }
            PollEvent::Degraded {
                consecutive_errors, ..
            } => {
                if !stream_alive {
                    self.set_contact(
                        id,
                        ContactState::Reconnecting {
                            attempt: consecutive_errors,
                        },
                    );
                }
            }
            PollEvent::Failed(info) => {
                if let Some(observers) = self.observers.get_mut(id) {
                    observers.poller = None;
                }
                if stream_alive {
                    tracing::warn!(job_id = id, error = %info.message, "Polling stopped; streaming continues");
                } else {
                    self.fail_job(id, info);
                }
            }
        }
    }

    // ---- batches ----

    fn watch_batch(&mut self, batch_id: String) {
        if self.batches.contains_key(&batch_id) {
            return;
        }
        let mut channel = TransportChannel::new(
            self.stream_client.clone(),
            self.config.channel.clone(),
            self.cancel.clone(),
        );
        let tx = self.inputs.clone();
        let id = batch_id.clone();
        channel.on(EventKind::All, move |event| {
            let _ = tx.send(Input::Batch {
                batch_id: id.clone(),
                event: event.clone(),
            });
        });
        channel.connect(batch_id.as_str(), ChannelKind::Batch);
        tracing::info!(batch_id = %batch_id, "Watching batch");
        self.batches.insert(batch_id, channel);
    }

    fn on_batch_event(&mut self, batch_id: &str, event: ChannelEvent) {
        let finished = match event {
            ChannelEvent::Message(StreamMessage::BatchProgress {
                completed,
                total,
                message,
                ..
            }) => {
                self.emit(TrackerEvent::BatchProgress {
                    batch_id: batch_id.to_string(),
                    completed,
                    total,
                    message,
                });
                false
            }
            ChannelEvent::Message(StreamMessage::BatchComplete { results, .. }) => {
                self.emit(TrackerEvent::BatchCompleted {
                    batch_id: batch_id.to_string(),
                    results,
                });
                true
            }
            ChannelEvent::Message(StreamMessage::Error { message, .. }) => {
                self.emit(TrackerEvent::BatchFailed {
                    batch_id: batch_id.to_string(),
                    message: message.unwrap_or_else(|| "Batch failed".to_string()),
                });
                true
            }
            ChannelEvent::Failed(err) => {
                self.emit(TrackerEvent::BatchFailed {
                    batch_id: batch_id.to_string(),
                    message: err.to_string(),
                });
                true
            }
            other => {
                tracing::trace!(batch_id, event = ?other.kind(), "Batch channel event");
                false
            }
        };

        if finished {
            if let Some(mut channel) = self.batches.remove(batch_id) {
                channel.disconnect();
            }
        }
    }

    // ---- state changes ----

    fn apply_update(&mut self, id: &str, update: JobUpdate) {
        match self.tracker.apply(id, update, Utc::now()) {
            Ok(Applied::Changed) => self.after_change(id),
            Ok(Applied::Unchanged | Applied::Frozen) => {}
            Err(e) => tracing::debug!(job_id = id, error = %e, "Dropping update for untracked job"),
        }
    }

    fn set_contact(&mut self, id: &str, contact: ContactState) {
        if let Ok(Applied::Changed) = self.tracker.set_contact(id, contact, Utc::now()) {
            self.after_change(id);
        }
    }

    /// Fail a job every update path has given up on.
    fn fail_job(&mut self, id: &str, error: ErrorInfo) {
        let _ = self.tracker.set_contact(id, ContactState::Lost, Utc::now());
        self.apply_update(id, JobUpdate::failed(error));
    }

    /// Publish a mutated handle; tear down observers and cache the
    /// payload once it is terminal.
    fn after_change(&mut self, id: &str) {
        let Some(handle) = self.tracker.get(id).cloned() else {
            return;
        };
        if handle.is_terminal() {
            self.stop_observing(id);
            if let (JobStatus::Completed, Some(payload)) = (handle.status, &handle.result) {
                self.cache
                    .put(Observed::from(&handle), payload.clone(), Utc::now());
            }
        }
        self.publish_handle(handle);
    }

    fn store_result(&mut self, result: JobResult, completed: bool) {
        let now = Utc::now();
        let observed = match self.tracker.get(&result.id) {
            Some(handle) => Observed::from(handle),
            None if completed && !result.id.starts_with(PROVISIONAL_ID_PREFIX) => Observed {
                id: &result.id,
                id_kind: IdKind::Canonical,
                status: JobStatus::Completed,
            },
            None => return,
        };
        self.cache
            .put_fetched(observed, result.payload, result.attachments, now);
    }

    fn retire(&mut self, id: &str, reason: RetireReason) -> Option<JobHandle> {
        self.stop_observing(id);
        let handle = self.tracker.remove(id)?;
        tracing::info!(job_id = id, ?reason, "Job retired from tracking");
        self.emit(TrackerEvent::JobRetired {
            id: id.to_string(),
            reason,
        });
        self.publish_snapshot();
        Some(handle)
    }

    // ---- publishing ----

    fn emit(&self, event: TrackerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_handle(&self, handle: JobHandle) {
        self.emit(TrackerEvent::JobChanged(handle));
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        self.jobs_tx.send_replace(self.tracker.snapshot());
    }
}

// ---------------------------------------------------------------------------
// Reconciler loop
// ---------------------------------------------------------------------------

/// Periodically sweep failed submissions and fetch the authoritative
/// list while canonical jobs are in flight.
///
/// The fetch runs here, outside the actor, so updates keep flowing
/// while it is pending.
async fn run_reconciler(
    backend: Arc<dyn AnalysisBackend>,
    inputs: mpsc::UnboundedSender<Input>,
    jobs: watch::Receiver<Vec<JobHandle>>,
    interval: Duration,
    page_size: u32,
    cancel: CancellationToken,
) {
    let interval = if interval.is_zero() {
        tracing::warn!("Zero reconcile interval configured; using default");
        DEFAULT_RECONCILE_INTERVAL
    } else {
        interval
    };
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let (in_flight, has_failed_submissions) = {
            let jobs = jobs.borrow();
            let in_flight: Vec<JobId> = jobs
                .iter()
                .filter(|h| h.is_canonical() && !h.is_terminal())
                .map(|h| h.id.clone())
                .collect();
            let failed = jobs
                .iter()
                .any(|h| !h.is_canonical() && h.status == JobStatus::Failed);
            (in_flight, failed)
        };

        if has_failed_submissions && inputs.send(Input::SweepFailedSubmissions).is_err() {
            break;
        }
        if in_flight.is_empty() {
            continue;
        }

        let query = SearchQuery {
            filter: Some(serde_json::json!({ "job_ids": in_flight })),
            limit: page_size,
            offset: 0,
        };
        let issued_at = Utc::now();
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = backend.search(&query) => result,
        };

        match fetched {
            Ok(page) => {
                tracing::debug!(
                    tracked = in_flight.len(),
                    listed = page.items.len(),
                    "Fetched authoritative list",
                );
                let listing = Listing {
                    issued_at,
                    records: page.items,
                };
                if inputs.send(Input::Listing(listing)).is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!(error = %e, "List fetch for reconciliation failed"),
        }
    }

    tracing::debug!("Reconciler loop exited");
}
