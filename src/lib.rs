//! logtap core: the ingestion pipeline of a log and event shipping agent.
//!
//! Sources tail files and platform event logs, parse records into
//! [`event::Envelope`]s, and push them through bounded buffers toward
//! sinks. Sinks acknowledge delivered batches to the
//! [`bookmarks::BookmarkManager`], which persists per-source progress so a
//! restart neither re-ships nor drops data beyond the at-least-once
//! contract.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate tracing;

pub mod bookmarks;
pub mod event;
pub mod pipeline;
pub mod sinks;
pub mod sources;

pub use event::{Envelope, EnvelopeFormat, LogRecord};
