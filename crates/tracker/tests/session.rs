//! Integration tests for `TrackingSession`.
//!
//! A fake [`AnalysisBackend`] scripts the REST side. Polling-only tests
//! run on a paused clock; streaming tests run against an in-process
//! WebSocket server on real time.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use sitetrack_client::api::{
    AnalysisBackend, ApiError, ListRecord, ResultsResponse, SearchPage, SearchQuery, StatusReport,
    SubmitResponse,
};
use sitetrack_client::channel::ChannelConfig;
use sitetrack_client::poller::PollConfig;
use sitetrack_client::reconnect::ReconnectConfig;
use sitetrack_core::job::{ContactState, FailureKind, IdKind, JobHandle, JobStatus};
use sitetrack_core::request::{AnalysisRequest, Coordinate};
use sitetrack_core::result::Attachment;
use sitetrack_tracker::config::{TrackerConfig, UpdateMode};
use sitetrack_tracker::events::{RetireReason, TrackerEvent};
use sitetrack_tracker::session::{CancelScope, SessionError, TrackingSession};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;

// ---------------------------------------------------------------------------
// Fake backend
// ---------------------------------------------------------------------------

type Scripted<T> = Result<T, ApiError>;

#[derive(Default)]
struct FakeBackend {
    submit: Mutex<Option<Scripted<SubmitResponse>>>,
    statuses: Mutex<HashMap<String, VecDeque<Scripted<StatusReport>>>>,
    status_calls: Mutex<HashMap<String, u32>>,
    results: Mutex<Option<Scripted<ResultsResponse>>>,
    analysis: Mutex<Option<Scripted<serde_json::Value>>>,
    listed: Mutex<Vec<ListRecord>>,
    search_calls: AtomicU32,
    submit_calls: AtomicU32,
    submit_delay: Duration,
    cancelled: Mutex<Vec<String>>,
}

impl FakeBackend {
    fn submitting(self, response: Scripted<SubmitResponse>) -> Self {
        *self.submit.lock().unwrap() = Some(response);
        self
    }

    fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    fn with_results(self, response: ResultsResponse) -> Self {
        *self.results.lock().unwrap() = Some(Ok(response));
        self
    }

    fn with_statuses(self, job_id: &str, script: Vec<Scripted<StatusReport>>) -> Self {
        self.statuses
            .lock()
            .unwrap()
            .insert(job_id.to_string(), script.into());
        self
    }

    fn listing(self, records: Vec<ListRecord>) -> Self {
        *self.listed.lock().unwrap() = records;
        self
    }

    fn status_calls(&self, job_id: &str) -> u32 {
        self.status_calls
            .lock()
            .unwrap()
            .get(job_id)
            .copied()
            .unwrap_or(0)
    }
}

fn http_error<T>(status: u16) -> Scripted<T> {
    Err(ApiError::Api {
        status,
        body: "scripted".into(),
    })
}

fn report(status: JobStatus, progress: f64) -> Scripted<StatusReport> {
    Ok(StatusReport {
        status,
        progress: Some(progress),
        message: None,
        result: None,
        error: None,
    })
}

fn completed_report(result: serde_json::Value) -> Scripted<StatusReport> {
    Ok(StatusReport {
        status: JobStatus::Completed,
        progress: Some(100.0),
        message: None,
        result: Some(result),
        error: None,
    })
}

fn listed(id: &str, status: JobStatus) -> ListRecord {
    ListRecord {
        id: id.into(),
        status: Some(status),
        site_name: None,
        updated_at: None,
    }
}

#[async_trait]
impl AnalysisBackend for FakeBackend {
    async fn submit(&self, _request: &AnalysisRequest) -> Result<SubmitResponse, ApiError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }
        self.submit.lock().unwrap().take().unwrap_or_else(|| {
            Ok(SubmitResponse {
                job_id: "J1".into(),
                status: Some(JobStatus::Pending),
            })
        })
    }

    async fn status(&self, job_id: &str) -> Result<StatusReport, ApiError> {
        *self
            .status_calls
            .lock()
            .unwrap()
            .entry(job_id.to_string())
            .or_default() += 1;
        self.statuses
            .lock()
            .unwrap()
            .get_mut(job_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| report(JobStatus::Processing, 50.0))
    }

    async fn results(&self, _job_id: &str) -> Result<ResultsResponse, ApiError> {
        self.results
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| http_error(404))
    }

    async fn analysis(&self, _analysis_id: &str) -> Result<serde_json::Value, ApiError> {
        self.analysis
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| http_error(404))
    }

    async fn search(&self, _query: &SearchQuery) -> Result<SearchPage, ApiError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let items = self.listed.lock().unwrap().clone();
        Ok(SearchPage {
            total: Some(items.len() as u64),
            items,
        })
    }

    async fn cancel(&self, job_id: &str) -> Result<(), ApiError> {
        self.cancelled.lock().unwrap().push(job_id.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn poll_config() -> TrackerConfig {
    TrackerConfig {
        update_mode: UpdateMode::Poll,
        poll: PollConfig {
            interval: Duration::from_secs(1),
            max_attempts: 50,
            error_threshold: 5,
        },
        reconcile_interval: Duration::from_secs(600),
        ..TrackerConfig::default()
    }
}

fn site_outline() -> Vec<Coordinate> {
    vec![
        Coordinate::new(51.50, -0.12),
        Coordinate::new(51.50, -0.10),
        Coordinate::new(51.52, -0.10),
        Coordinate::new(51.52, -0.12),
    ]
}

fn acme_request() -> AnalysisRequest {
    AnalysisRequest::polygon("Acme Site", site_outline())
}

async fn next_event(rx: &mut broadcast::Receiver<TrackerEvent>) -> TrackerEvent {
    tokio::time::timeout(Duration::from_secs(120), rx.recv())
        .await
        .expect("timed out waiting for tracker event")
        .expect("event channel closed")
}

/// Collect events until `stop` matches, returning all of them.
async fn events_until(
    rx: &mut broadcast::Receiver<TrackerEvent>,
    stop: impl Fn(&TrackerEvent) -> bool,
) -> Vec<TrackerEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = stop(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn is_terminal_change(event: &TrackerEvent, id: &str) -> bool {
    matches!(event, TrackerEvent::JobChanged(h) if h.id == id && h.is_terminal())
}

fn changes(events: &[TrackerEvent]) -> Vec<&JobHandle> {
    events
        .iter()
        .filter_map(|e| match e {
            TrackerEvent::JobChanged(h) => Some(h),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Test: submission lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn submit_rekeys_and_runs_to_completion() {
    let backend = Arc::new(FakeBackend::default().with_statuses(
        "J1",
        vec![
            report(JobStatus::Pending, 0.0),
            report(JobStatus::Processing, 40.0),
            report(JobStatus::Processing, 80.0),
            completed_report(json!({"risk_score": 0.42})),
        ],
    ));
    let session = TrackingSession::with_backend(poll_config(), backend.clone());
    let mut events = session.subscribe();

    let handle = session.submit(acme_request()).await.expect("submit ok");
    assert_eq!(handle.id, "J1");
    assert_eq!(handle.id_kind, IdKind::Canonical);
    assert_eq!(handle.status, JobStatus::Pending);
    assert_eq!(session.jobs().len(), 1);

    let seen = events_until(&mut events, |e| is_terminal_change(e, "J1")).await;

    let first = changes(&seen)[0];
    assert_eq!(first.id_kind, IdKind::Provisional);
    assert_eq!(first.status, JobStatus::GettingReady);
    assert_eq!(first.site_name.as_deref(), Some("Acme Site"));

    let provisional_id = first.id.clone();
    let rekey_at = seen
        .iter()
        .position(|e| matches!(e, TrackerEvent::JobRekeyed { canonical, .. } if canonical == "J1"))
        .expect("rekey event");
    assert_matches!(
        &seen[rekey_at],
        TrackerEvent::JobRekeyed { provisional, .. } if *provisional == provisional_id
    );
    // Nothing is published under the provisional id after the rekey.
    assert!(seen[rekey_at..]
        .iter()
        .all(|e| e.job_id() != Some(provisional_id.as_str())));

    let progress: Vec<u8> = changes(&seen[rekey_at..])
        .iter()
        .map(|h| h.progress)
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(progress.last(), Some(&100));

    let done = session.jobs().pop().expect("still tracked");
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result, Some(json!({"risk_score": 0.42})));
    assert_eq!(session.jobs().len(), 1);

    let result = session.result("J1").await.expect("cached result");
    assert!(result.from_cache);
    assert_eq!(result.payload["risk_score"], 0.42);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_submission_is_shown_then_retired() {
    let backend = Arc::new(FakeBackend::default().submitting(http_error(503)));
    let config = TrackerConfig {
        reconcile_interval: Duration::from_secs(5),
        ..poll_config()
    };
    let session = TrackingSession::with_backend(config, backend.clone());
    let mut events = session.subscribe();

    let err = session.submit(acme_request()).await.unwrap_err();
    assert_matches!(err, SessionError::Submission(_));

    let seen = events_until(&mut events, |e| {
        matches!(e, TrackerEvent::JobRetired { reason: RetireReason::SubmissionFailed, .. })
    })
    .await;
    let failed = changes(&seen)
        .into_iter()
        .find(|h| h.status == JobStatus::Failed)
        .expect("failure shown before retirement");
    assert_eq!(failed.id_kind, IdKind::Provisional);
    assert_eq!(
        failed.error.as_ref().map(|e| e.kind),
        Some(FailureKind::SubmissionFailed)
    );
    assert!(session.jobs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn zero_reconcile_interval_still_sweeps() {
    let backend = Arc::new(FakeBackend::default().submitting(http_error(500)));
    let config = TrackerConfig {
        reconcile_interval: Duration::ZERO,
        ..poll_config()
    };
    let session = TrackingSession::with_backend(config, backend.clone());
    let mut events = session.subscribe();

    assert!(session.submit(acme_request()).await.is_err());
    events_until(&mut events, |e| {
        matches!(e, TrackerEvent::JobRetired { reason: RetireReason::SubmissionFailed, .. })
    })
    .await;
    assert!(session.jobs().is_empty());

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn abandoned_submit_still_settles_provisional_handle() {
    let backend = Arc::new(FakeBackend::default().with_submit_delay(Duration::from_secs(3)));
    let session = TrackingSession::with_backend(poll_config(), backend.clone());
    let mut events = session.subscribe();

    let abandoned =
        tokio::time::timeout(Duration::from_secs(1), session.submit(acme_request())).await;
    assert!(abandoned.is_err(), "caller gave up before the response");
    assert_eq!(session.jobs()[0].status, JobStatus::GettingReady);

    events_until(&mut events, |e| {
        matches!(e, TrackerEvent::JobRekeyed { canonical, .. } if canonical == "J1")
    })
    .await;

    let jobs = session.jobs();
    assert_eq!(jobs.len(), 1, "no provisional handle left behind");
    assert_eq!(jobs[0].id, "J1");
    assert_eq!(jobs[0].id_kind, IdKind::Canonical);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn terminal_submit_status_waits_for_full_state() {
    let backend = Arc::new(
        FakeBackend::default()
            .submitting(Ok(SubmitResponse {
                job_id: "J1".into(),
                status: Some(JobStatus::Completed),
            }))
            .with_statuses("J1", vec![completed_report(json!({"risk_score": 0.9}))]),
    );
    let session = TrackingSession::with_backend(poll_config(), backend.clone());
    let mut events = session.subscribe();

    let handle = session.submit(acme_request()).await.unwrap();
    assert!(!handle.is_terminal());

    events_until(&mut events, |e| is_terminal_change(e, "J1")).await;
    let done = session.jobs().pop().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result, Some(json!({"risk_score": 0.9})));
    assert_eq!(backend.status_calls("J1"), 1);

    let result = session.result("J1").await.unwrap();
    assert_eq!(result.payload["risk_score"], 0.9);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_request_never_reaches_network() {
    let backend = Arc::new(FakeBackend::default());
    let session = TrackingSession::with_backend(poll_config(), backend.clone());
    let mut events = session.subscribe();

    let request = AnalysisRequest::polygon("   ", site_outline());
    let err = session.submit(request).await.unwrap_err();

    assert_matches!(err, SessionError::Validation(_));
    assert_eq!(backend.submit_calls.load(Ordering::SeqCst), 0);
    assert!(session.jobs().is_empty());
    assert_matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty));
}

// ---------------------------------------------------------------------------
// Test: polling failures
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn not_found_on_first_poll_fails_immediately() {
    let backend = Arc::new(FakeBackend::default().with_statuses("J2", vec![http_error(404)]));
    let session = TrackingSession::with_backend(poll_config(), backend.clone());
    let mut events = session.subscribe();

    session.track("J2", None).await.unwrap();
    events_until(&mut events, |e| is_terminal_change(e, "J2")).await;

    let job = session.jobs().pop().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.kind, FailureKind::NotFound);
    assert!(error.message.contains("not found"));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(backend.status_calls("J2"), 1);
}

#[tokio::test(start_paused = true)]
async fn consecutive_errors_fail_with_connection_lost() {
    let backend = Arc::new(FakeBackend::default().with_statuses(
        "J3",
        vec![
            http_error(503),
            http_error(502),
            http_error(503),
            http_error(500),
            http_error(503),
        ],
    ));
    let session = TrackingSession::with_backend(poll_config(), backend.clone());
    let mut events = session.subscribe();

    session.track("J3", None).await.unwrap();
    let seen = events_until(&mut events, |e| is_terminal_change(e, "J3")).await;

    assert!(
        changes(&seen)
            .iter()
            .any(|h| matches!(h.contact, ContactState::Reconnecting { .. })),
        "retrying is visible before the failure"
    );
    let job = session.jobs().pop().unwrap();
    let error = job.error.unwrap();
    assert_eq!(error.kind, FailureKind::ConnectionLost);
    assert!(error.message.starts_with("Connection lost"));
    assert!(!error.message.contains("Timed out"));
    assert_eq!(job.contact, ContactState::Lost);
    assert_eq!(backend.status_calls("J3"), 5);
}

#[tokio::test(start_paused = true)]
async fn poll_budget_exhaustion_fails_with_timeout() {
    let backend = Arc::new(FakeBackend::default());
    let config = TrackerConfig {
        poll: PollConfig {
            interval: Duration::from_secs(1),
            max_attempts: 3,
            error_threshold: 5,
        },
        ..poll_config()
    };
    let session = TrackingSession::with_backend(config, backend.clone());
    let mut events = session.subscribe();

    session.track("J8", None).await.unwrap();
    events_until(&mut events, |e| is_terminal_change(e, "J8")).await;

    let job = session.jobs().pop().unwrap();
    assert_eq!(job.error.unwrap().kind, FailureKind::PollTimeout);
    assert_eq!(backend.status_calls("J8"), 3);
}

// ---------------------------------------------------------------------------
// Test: reconciliation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn listed_job_is_retired_from_tracking() {
    let backend = Arc::new(
        FakeBackend::default().listing(vec![listed("J4", JobStatus::Processing)]),
    );
    let config = TrackerConfig {
        reconcile_interval: Duration::from_secs(5),
        ..poll_config()
    };
    let session = TrackingSession::with_backend(config, backend.clone());
    let mut events = session.subscribe();

    session.track("J4", Some("Harbour".into())).await.unwrap();
    session.track("J9", None).await.unwrap();

    events_until(&mut events, |e| {
        matches!(e, TrackerEvent::JobRetired { id, reason: RetireReason::Listed } if id == "J4")
    })
    .await;

    let ids: Vec<_> = session.jobs().into_iter().map(|h| h.id).collect();
    assert_eq!(ids, vec!["J9".to_string()]);
    assert!(backend.search_calls.load(Ordering::SeqCst) >= 1);

    // Observation of the retired job stops.
    let calls = backend.status_calls("J4");
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(backend.status_calls("J4"), calls);
}

// ---------------------------------------------------------------------------
// Test: cancellation, dismissal and results
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn remote_cancel_stops_polling_and_deletes() {
    let backend = Arc::new(FakeBackend::default());
    let session = TrackingSession::with_backend(poll_config(), backend.clone());
    let mut events = session.subscribe();

    session.track("J5", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    session.cancel("J5", CancelScope::Remote).await.unwrap();

    events_until(&mut events, |e| {
        matches!(e, TrackerEvent::JobRetired { reason: RetireReason::Cancelled, .. })
    })
    .await;
    assert_eq!(*backend.cancelled.lock().unwrap(), vec!["J5".to_string()]);
    assert!(session.jobs().is_empty());

    let calls = backend.status_calls("J5");
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(backend.status_calls("J5"), calls);

    assert_matches!(
        session.cancel("J5", CancelScope::Local).await,
        Err(SessionError::Tracker(_))
    );
}

#[tokio::test(start_paused = true)]
async fn dismiss_only_removes_finished_jobs() {
    let backend = Arc::new(
        FakeBackend::default().with_statuses("J6", vec![completed_report(json!({"ok": true}))]),
    );
    let session = TrackingSession::with_backend(poll_config(), backend.clone());
    let mut events = session.subscribe();

    session.track("J6", None).await.unwrap();
    session.track("J7", None).await.unwrap();
    events_until(&mut events, |e| is_terminal_change(e, "J6")).await;

    assert_matches!(session.dismiss("J7").await, Err(SessionError::Tracker(_)));
    let dismissed = session.dismiss("J6").await.unwrap();
    assert_eq!(dismissed.status, JobStatus::Completed);
    assert_eq!(session.jobs().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn result_falls_back_to_full_record_and_caches() {
    let backend = Arc::new(FakeBackend::default());
    *backend.analysis.lock().unwrap() = Some(Ok(json!({"site_name": "Old Mill"})));
    let session = TrackingSession::with_backend(poll_config(), backend.clone());

    let first = session.result("A9").await.unwrap();
    assert!(!first.from_cache);
    assert_eq!(first.payload["site_name"], "Old Mill");

    let second = session.result("A9").await.unwrap();
    assert!(second.from_cache);
}

#[tokio::test(start_paused = true)]
async fn tracked_completion_result_includes_attachments() {
    let report_pdf = Attachment {
        name: "report.pdf".into(),
        url: "https://files.example/J6/report.pdf".into(),
        content_type: Some("application/pdf".into()),
    };
    let backend = Arc::new(
        FakeBackend::default()
            .with_statuses("J6", vec![completed_report(json!({"risk_score": 0.3}))])
            .with_results(ResultsResponse {
                status: Some(JobStatus::Completed),
                result: json!({"risk_score": 0.3}),
                attachments: vec![report_pdf.clone()],
            }),
    );
    let session = TrackingSession::with_backend(poll_config(), backend.clone());
    let mut events = session.subscribe();

    session.track("J6", None).await.unwrap();
    events_until(&mut events, |e| is_terminal_change(e, "J6")).await;

    let first = session.result("J6").await.unwrap();
    assert!(!first.from_cache);
    assert_eq!(first.attachments, vec![report_pdf.clone()]);

    let second = session.result("J6").await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.attachments, vec![report_pdf]);
    assert_eq!(second.payload["risk_score"], 0.3);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unfinished_result_is_not_ready() {
    let backend = Arc::new(FakeBackend::default());
    *backend.results.lock().unwrap() = Some(Ok(ResultsResponse {
        status: Some(JobStatus::Processing),
        result: serde_json::Value::Null,
        attachments: Vec::new(),
    }));
    let session = TrackingSession::with_backend(poll_config(), backend.clone());

    assert_matches!(session.result("J1").await, Err(SessionError::NotReady(_)));
}

// ---------------------------------------------------------------------------
// Test: streaming and fallback
// ---------------------------------------------------------------------------

fn stream_config(ws_url: String, mode: UpdateMode) -> TrackerConfig {
    TrackerConfig {
        ws_url,
        update_mode: mode,
        channel: ChannelConfig {
            keepalive_interval: Duration::from_secs(30),
            reconnect: ReconnectConfig {
                base_delay: Duration::from_millis(10),
                max_attempts: 2,
            },
        },
        poll: PollConfig {
            interval: Duration::from_millis(20),
            max_attempts: 100,
            error_threshold: 5,
        },
        reconcile_interval: Duration::from_secs(600),
        ..TrackerConfig::default()
    }
}

#[tokio::test]
async fn streamed_updates_drive_job_to_completion() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_url = format!("ws://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        for frame in [
            r#"{"type":"connected","job_id":"J1"}"#,
            r#"{"type":"progress","job_id":"J1","progress":30,"message":"Fetching imagery"}"#,
            "pong",
            r#"{"type":"progress","job_id":"J1","progress":250}"#,
            r#"{"type":"complete","job_id":"J1","result":{"parcels":12}}"#,
        ] {
            ws.send(Message::Text(frame.to_string())).await.unwrap();
        }
        while ws.next().await.is_some() {}
    });

    let backend = Arc::new(FakeBackend::default());
    let session = TrackingSession::with_backend(
        stream_config(ws_url, UpdateMode::Stream),
        backend.clone(),
    );
    let mut events = session.subscribe();

    session.track("J1", None).await.unwrap();
    let seen = events_until(&mut events, |e| is_terminal_change(e, "J1")).await;

    let handles = changes(&seen);
    assert!(handles.iter().any(|h| h.contact == ContactState::Live));
    assert!(handles.iter().all(|h| h.progress <= 100));
    let done = handles.last().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result, Some(json!({"parcels": 12})));
    assert_eq!(backend.status_calls("J1"), 0);

    session.shutdown().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
}

#[tokio::test]
async fn stream_completion_freezes_job_while_polling_runs() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_url = format!("ws://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Text(r#"{"type":"connected","job_id":"J1"}"#.to_string()))
            .await
            .unwrap();
        // Let a few polls land first.
        tokio::time::sleep(Duration::from_millis(100)).await;
        ws.send(Message::Text(
            r#"{"type":"complete","job_id":"J1","result":{"parcels":7}}"#.to_string(),
        ))
        .await
        .unwrap();
        while ws.next().await.is_some() {}
    });

    // Status polls keep answering `processing` throughout.
    let backend = Arc::new(FakeBackend::default());
    let session = TrackingSession::with_backend(
        stream_config(ws_url, UpdateMode::Both),
        backend.clone(),
    );
    let mut events = session.subscribe();

    session.track("J1", None).await.unwrap();
    let seen = events_until(&mut events, |e| is_terminal_change(e, "J1")).await;

    let handles = changes(&seen);
    assert!(handles.iter().any(|h| h.status == JobStatus::Processing));
    let done = handles.last().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result, Some(json!({"parcels": 7})));

    // An in-flight poll may still land; after that polling is over.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let calls = backend.status_calls("J1");
    assert!(calls >= 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.status_calls("J1"), calls);

    let job = session.jobs().pop().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(json!({"parcels": 7})));
    assert_eq!(job.progress, 100);

    session.shutdown().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
}

#[tokio::test]
async fn dead_stream_falls_back_to_polling() {
    // Bind and drop to get a port nobody listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let backend = Arc::new(FakeBackend::default().with_statuses(
        "J1",
        vec![
            report(JobStatus::Processing, 60.0),
            completed_report(json!({"ok": true})),
        ],
    ));
    let session = TrackingSession::with_backend(
        stream_config(ws_url, UpdateMode::StreamWithPollFallback),
        backend.clone(),
    );
    let mut events = session.subscribe();

    session.track("J1", None).await.unwrap();
    let seen = events_until(&mut events, |e| is_terminal_change(e, "J1")).await;

    let handles = changes(&seen);
    assert!(handles
        .iter()
        .any(|h| matches!(h.contact, ContactState::Reconnecting { .. })));
    assert!(handles.iter().any(|h| h.contact == ContactState::Polling));
    assert_eq!(handles.last().unwrap().status, JobStatus::Completed);
    assert!(backend.status_calls("J1") >= 2);

    session.shutdown().await;
}

#[tokio::test]
async fn dead_stream_without_fallback_fails_with_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let backend = Arc::new(FakeBackend::default());
    let session = TrackingSession::with_backend(
        stream_config(ws_url, UpdateMode::Stream),
        backend.clone(),
    );
    let mut events = session.subscribe();

    session.track("J1", None).await.unwrap();
    events_until(&mut events, |e| is_terminal_change(e, "J1")).await;

    let job = session.jobs().pop().unwrap();
    assert_eq!(job.error.unwrap().kind, FailureKind::Transport);
    assert_eq!(job.contact, ContactState::Lost);
    assert_eq!(backend.status_calls("J1"), 0);

    session.shutdown().await;
}

#[tokio::test]
async fn batch_progress_is_republished() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_url = format!("ws://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        for frame in [
            r#"{"type":"connected","batch_id":"B1"}"#,
            r#"{"type":"batch_progress","batch_id":"B1","completed":1,"total":3}"#,
            r#"{"type":"batch_complete","batch_id":"B1","results":[1,2,3]}"#,
        ] {
            ws.send(Message::Text(frame.to_string())).await.unwrap();
        }
        while ws.next().await.is_some() {}
    });

    let session = TrackingSession::with_backend(
        stream_config(ws_url, UpdateMode::Stream),
        Arc::new(FakeBackend::default()),
    );
    let mut events = session.subscribe();
    session.watch_batch("B1").unwrap();

    assert_matches!(
        next_event(&mut events).await,
        TrackerEvent::BatchProgress { completed: 1, total: 3, .. }
    );
    assert_matches!(
        next_event(&mut events).await,
        TrackerEvent::BatchCompleted { batch_id, .. } if batch_id == "B1"
    );
    assert!(session.jobs().is_empty());

    session.shutdown().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
}
