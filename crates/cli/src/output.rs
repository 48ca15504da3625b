//! Rendering of tracker events for the terminal.

use sitetrack_core::job::{ContactState, JobHandle};
use sitetrack_tracker::events::TrackerEvent;

/// One line describing `event`, either human-readable or JSON.
pub fn render(event: &TrackerEvent, json: bool) -> String {
    if json {
        return serde_json::to_string(event)
            .unwrap_or_else(|e| format!(r#"{{"event":"unrenderable","error":"{e}"}}"#));
    }
    match event {
        TrackerEvent::JobChanged(handle) => render_handle(handle),
        TrackerEvent::JobRekeyed {
            provisional,
            canonical,
        } => format!("{provisional} -> {canonical}"),
        TrackerEvent::JobRetired { id, reason } => format!("{id} retired ({reason:?})"),
        TrackerEvent::BatchProgress {
            batch_id,
            completed,
            total,
            message,
        } => match message {
            Some(message) => format!("batch {batch_id} {completed}/{total} {message}"),
            None => format!("batch {batch_id} {completed}/{total}"),
        },
        TrackerEvent::BatchCompleted { batch_id, .. } => format!("batch {batch_id} completed"),
        TrackerEvent::BatchFailed { batch_id, message } => {
            format!("batch {batch_id} failed: {message}")
        }
    }
}

fn render_handle(handle: &JobHandle) -> String {
    let mut line = format!("{} {:>3}% {}", handle.id, handle.progress, handle.status);
    if let Some(name) = &handle.site_name {
        line.push_str(&format!(" [{name}]"));
    }
    match handle.contact {
        ContactState::Reconnecting { attempt } => {
            line.push_str(&format!(" (reconnecting, attempt {attempt})"))
        }
        ContactState::Polling => line.push_str(" (polling)"),
        ContactState::Lost => line.push_str(" (lost)"),
        ContactState::Idle | ContactState::Live => {}
    }
    if let Some(error) = &handle.error {
        line.push_str(&format!(": {}", error.message));
    } else if let Some(message) = &handle.message {
        line.push_str(&format!(": {message}"));
    }
    line
}
