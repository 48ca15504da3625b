//! `sitetrack` -- submit site analyses and follow them to completion.
//!
//! Talks to the analysis service configured through the environment
//! (see [`TrackerConfig::from_env`]); a `.env` file is honoured.
//!
//! # Environment variables
//!
//! | Variable            | Default                 | Description              |
//! |---------------------|-------------------------|--------------------------|
//! | `SITETRACK_API_URL` | `http://localhost:8000` | REST base URL            |
//! | `SITETRACK_WS_URL`  | `ws://localhost:8000`   | Streaming base URL       |
//! | `RUST_LOG`          | `sitetrack=info,...`    | Log filter               |

mod args;
mod output;

use std::collections::HashSet;

use anyhow::Context;
use clap::Parser;
use sitetrack_core::job::JobStatus;
use sitetrack_tracker::config::TrackerConfig;
use sitetrack_tracker::events::TrackerEvent;
use sitetrack_tracker::session::TrackingSession;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::args::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "sitetrack=info,sitetrack_tracker=info,sitetrack_client=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = TrackerConfig::from_env();
    if let Some(mode) = cli.mode {
        config.update_mode = mode;
    }

    let session = TrackingSession::start(config);
    let mut events = session.subscribe();

    let outcome = match &cli.command {
        Command::Submit { .. } => {
            let request = cli
                .command
                .to_request()
                .context("submit needs --polygon or --point with --radius")?;
            let handle = session.submit(request).await?;
            println!("{}", output::render(&TrackerEvent::JobChanged(handle.clone()), cli.json));
            let finished = follow_jobs(&mut events, [handle.id.clone()].into(), cli.json).await;
            print_completed_results(&session, &finished).await
        }
        Command::Watch { job_ids } => {
            for id in job_ids {
                session.track(id.as_str(), None).await?;
            }
            let finished = follow_jobs(&mut events, job_ids.iter().cloned().collect(), cli.json).await;
            print_completed_results(&session, &finished).await
        }
        Command::Batch { batch_id } => {
            session.watch_batch(batch_id.as_str())?;
            follow_batch(&mut events, cli.json).await;
            Ok(())
        }
        Command::Result { job_id } => {
            let result = session.result(job_id).await?;
            println!("{}", serde_json::to_string_pretty(&result.payload)?);
            Ok(())
        }
    };

    session.shutdown().await;
    outcome
}

/// Print events until every job in `pending` is terminal or retired.
///
/// Returns the ids that finished `completed`.
async fn follow_jobs(
    events: &mut broadcast::Receiver<TrackerEvent>,
    mut pending: HashSet<String>,
    json: bool,
) -> Vec<String> {
    let mut completed = Vec::new();
    while !pending.is_empty() {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted; stopping");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        match &event {
            TrackerEvent::JobChanged(handle) if handle.is_terminal() => {
                if pending.remove(&handle.id) && handle.status == JobStatus::Completed {
                    completed.push(handle.id.clone());
                }
            }
            TrackerEvent::JobRetired { id, .. } => {
                pending.remove(id);
            }
            _ => {}
        }
        if event.job_id().is_some() {
            println!("{}", output::render(&event, json));
        }
    }
    completed
}

async fn follow_batch(events: &mut broadcast::Receiver<TrackerEvent>, json: bool) {
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        println!("{}", output::render(&event, json));
        if matches!(
            event,
            TrackerEvent::BatchCompleted { .. } | TrackerEvent::BatchFailed { .. }
        ) {
            break;
        }
    }
}

async fn print_completed_results(session: &TrackingSession, ids: &[String]) -> anyhow::Result<()> {
    for id in ids {
        let result = session
            .result(id)
            .await
            .with_context(|| format!("fetching result of {id}"))?;
        println!("{}", serde_json::to_string_pretty(&result.payload)?);
    }
    Ok(())
}
