//! Script run orchestration and storage.
//!
//! Provides:
//! - `ExecutionSession` - One run from spawn to terminal event
//! - `RunCoordinator` - Start, cancel and track runs; history and last result
//! - `spawn_repeating` - Caller-side auto-repeat
//! - Storage implementations (memory, SQLite)

pub mod manager;
pub mod repeat;
pub mod session;
pub mod storage;

pub use manager::{ActiveRun, CancelOutcome, CoordinatorError, RunCoordinator, RunHandle};
pub use repeat::{RepeatEvent, RepeatHandle, spawn_repeating};
pub use session::{ExecutionSession, FinishedSession, SessionOutcome, StatusCell};
