//! # HLS Client Core
//!
//! `hls-client-core` is the adaptive segment scheduling core of an HLS
//! client: the state machine that decides which media fragment to fetch
//! next, when to fetch it, and how to feed parsed output into a downstream
//! buffer sink — across quality switches, live edge drift, encryption key
//! loads, and transient load failures.
//!
//! Playlist parsing, HTTP fetching, transmuxing, and buffer I/O are
//! collaborators supplied by the embedding application through the traits
//! in [`api`] and the events in [`events`]. The core is single-threaded
//! and cooperative: a 100 ms tick drives it, collaborator completions
//! re-enter between ticks, and emitted events are drained from the
//! scheduler's own queue.
//!
//! ## Usage
//!
//! ```ignore
//! let config = StreamConfig::default();
//! let mut scheduler = StreamScheduler::new(config, loader, transmuxer)?;
//!
//! scheduler.handle_event(Event::ManifestParsed { levels });
//! scheduler.attach_media(media);
//! scheduler.start_load(None);
//!
//! loop {
//!     scheduler.tick();
//!     for event in scheduler.drain_events() {
//!         route_to_collaborators(event);
//!     }
//!     sleep(TICK_INTERVAL);
//! }
//! ```
//!
//! With tokio, `run_ticker` drives the tick loop from a task while the
//! application delivers events from its own context.

pub(crate) mod error;
pub(crate) mod gap;

pub mod api;
pub mod buffer;
pub mod config;
pub mod events;
pub mod fragment;
pub mod level;
pub mod media;
pub mod scheduler;
pub mod types;

#[cfg(test)]
pub(crate) mod tests;

pub use config::StreamConfig;
pub use error::{ErrorDetails, HlsClientError, Result};
pub use events::{Event, EventBus};
pub use scheduler::{run_ticker, SchedulerState, StreamScheduler, TICK_INTERVAL};
