//! HTTP API module.
//!
//! This module provides the HTTP server, request/response types and the
//! progress event stream.

pub mod logs;
pub mod server;
pub mod types;

pub use logs::{publish_progress, EventBroadcaster, ImportEvent, EVENT_BROADCASTER};
pub use server::{router, start_server, AppState};
pub use types::*;
