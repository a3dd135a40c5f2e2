//! Events produced by an execution session.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

pub const EV_OUTPUT: &str = "output";
pub const EV_ERROR: &str = "error";
pub const EV_DONE: &str = "done";
pub const EV_CANCELLED: &str = "cancelled";

/// Payload of the `done` event.
pub const DONE_MESSAGE: &str = "Script execution completed";
/// Payload of the `cancelled` event.
pub const CANCELLED_MESSAGE: &str = "Script execution cancelled";

/// Event kind as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Output,
    Error,
    Done,
    Cancelled,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Output => EV_OUTPUT,
            Self::Error => EV_ERROR,
            Self::Done => EV_DONE,
            Self::Cancelled => EV_CANCELLED,
        }
    }

    /// `done` and `cancelled` end a stream.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown event kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            EV_OUTPUT => Ok(Self::Output),
            EV_ERROR => Ok(Self::Error),
            EV_DONE => Ok(Self::Done),
            EV_CANCELLED => Ok(Self::Cancelled),
            other => Err(UnknownEventKind(other.to_string())),
        }
    }
}

/// One tagged event of a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RunEvent {
    /// Text the process wrote to standard output.
    Output(String),
    /// Text the process wrote to standard error, or an engine diagnostic.
    Error(String),
    /// The run finished (or never started); nothing follows.
    Done,
    /// The run was cancelled; nothing follows.
    Cancelled,
}

impl RunEvent {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Output(_) => EventKind::Output,
            Self::Error(_) => EventKind::Error,
            Self::Done => EventKind::Done,
            Self::Cancelled => EventKind::Cancelled,
        }
    }

    /// Text carried on the wire for this event.
    #[must_use]
    pub fn payload(&self) -> &str {
        match self {
            Self::Output(s) | Self::Error(s) => s,
            Self::Done => DONE_MESSAGE,
            Self::Cancelled => CANCELLED_MESSAGE,
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    /// Rebuild an event from its wire kind and payload.
    #[must_use]
    pub fn from_parts(kind: EventKind, payload: String) -> Self {
        match kind {
            EventKind::Output => Self::Output(payload),
            EventKind::Error => Self::Error(payload),
            EventKind::Done => Self::Done,
            EventKind::Cancelled => Self::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            EventKind::Output,
            EventKind::Error,
            EventKind::Done,
            EventKind::Cancelled,
        ] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("stdout".parse::<EventKind>().is_err());
    }

    #[test]
    fn terminal_events() {
        assert!(RunEvent::Done.is_terminal());
        assert!(RunEvent::Cancelled.is_terminal());
        assert!(!RunEvent::Error("boom".into()).is_terminal());
        assert_eq!(RunEvent::Done.payload(), DONE_MESSAGE);
    }
}
