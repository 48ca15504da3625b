//! Domain types and pure logic for tracking site-analysis jobs.
//!
//! Everything in this crate is I/O free: the job handle and its status
//! machine vocabulary, request validation, failure classification and
//! the stream message-type constants shared by the client and tracker.

pub mod error;
pub mod job;
pub mod request;
pub mod result;
pub mod stream_events;
pub mod types;
