//! Game asset server.
//!
//! Serves static files and a configured set of remote assets. Remote assets
//! are fetched from their origin on first request, streamed to the requester
//! while being written to a local cache, and served from disk afterwards.
//! Concurrent requests for the same uncached asset share one download.

pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod logging;
pub mod server;
pub mod source;
