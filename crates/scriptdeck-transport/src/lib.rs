//! Transport layer for script runs.
//!
//! Provides:
//! - Wire protocol (event-stream frames, JSON requests)
//! - HTTP router with SSE run streaming (feature: http)

pub mod protocol;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::{ApiError, router};
pub use protocol::{CancelMessage, Frame, FrameDecoder, RenameMessage};
