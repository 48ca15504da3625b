//! Job tracking for site analyses.
//!
//! [`session::TrackingSession`] is the entry point: it owns the
//! [`tracker::JobTracker`] reducer, the [`cache::ResultCache`] and the
//! streaming and polling observers of every tracked job, and runs the
//! [`reconciler`] against the authoritative job list.

pub mod cache;
pub mod config;
pub mod events;
pub mod reconciler;
pub mod session;
pub mod tracker;
