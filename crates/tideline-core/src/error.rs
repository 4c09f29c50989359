use std::fmt;

use crate::crypto::DecryptionError;
use crate::event::EventError;
use crate::sync::{AccumulateError, RoomMergeError};
use crate::timeline::{SegmentError, SourceError, WindowError};

/// Machine-readable error codes surfaced to embedders and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    InvalidConfigValue,
    CheckpointUnreadable,
    MalformedDelta,
    RoomRejected,
    MalformedEvent,
    RoomNotFound,
    EventNotFound,
    SegmentNotFound,
    LiveSegmentRemoval,
    PaginationFailed,
    DecryptionFailed,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::InvalidConfigValue => "E1002",
            Self::CheckpointUnreadable => "E1003",
            Self::MalformedDelta => "E2001",
            Self::RoomRejected => "E2002",
            Self::MalformedEvent => "E2003",
            Self::RoomNotFound => "E3001",
            Self::EventNotFound => "E3002",
            Self::SegmentNotFound => "E3003",
            Self::LiveSegmentRemoval => "E3004",
            Self::PaginationFailed => "E4001",
            Self::DecryptionFailed => "E4002",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::InvalidConfigValue => "Invalid config value",
            Self::CheckpointUnreadable => "Checkpoint could not be read",
            Self::MalformedDelta => "Malformed sync delta",
            Self::RoomRejected => "Room entry rejected",
            Self::MalformedEvent => "Malformed event",
            Self::RoomNotFound => "Room not found",
            Self::EventNotFound => "Event not found",
            Self::SegmentNotFound => "Timeline segment not found",
            Self::LiveSegmentRemoval => "Live segment cannot be removed",
            Self::PaginationFailed => "Pagination request failed",
            Self::DecryptionFailed => "Decryption failed",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in tideline/config.toml and retry."),
            Self::InvalidConfigValue => Some("Limits must be greater than zero."),
            Self::CheckpointUnreadable => {
                Some("Re-create the checkpoint with `tide replay --checkpoint`.")
            }
            Self::MalformedDelta => Some("Every delta needs a non-empty next_batch token."),
            Self::RoomRejected => Some("Inspect the room entry; other rooms were still applied."),
            Self::MalformedEvent => Some("Events need both an event_id and a type."),
            Self::RoomNotFound => Some("List rooms with `tide inspect`."),
            Self::EventNotFound => None,
            Self::SegmentNotFound => None,
            Self::LiveSegmentRemoval => Some("Reset the live segment instead of removing it."),
            Self::PaginationFailed => Some("Retry pagination; the window keeps what it has."),
            Self::DecryptionFailed => None,
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl From<&AccumulateError> for ErrorCode {
    fn from(err: &AccumulateError) -> Self {
        match err {
            AccumulateError::MissingNextBatch => Self::MalformedDelta,
            AccumulateError::CorruptCheckpoint(_) => Self::CheckpointUnreadable,
        }
    }
}

impl From<&RoomMergeError> for ErrorCode {
    fn from(_: &RoomMergeError) -> Self {
        Self::RoomRejected
    }
}

impl From<&EventError> for ErrorCode {
    fn from(_: &EventError) -> Self {
        Self::MalformedEvent
    }
}

impl From<&SegmentError> for ErrorCode {
    fn from(err: &SegmentError) -> Self {
        match err {
            SegmentError::NotFound(_) => Self::SegmentNotFound,
            SegmentError::LiveSegment(_) => Self::LiveSegmentRemoval,
        }
    }
}

impl From<&SourceError> for ErrorCode {
    fn from(err: &SourceError) -> Self {
        match err {
            SourceError::NotFound { .. } => Self::EventNotFound,
            SourceError::Transport(_) | SourceError::Unavailable(_) => Self::PaginationFailed,
        }
    }
}

impl From<&WindowError> for ErrorCode {
    fn from(err: &WindowError) -> Self {
        match err {
            WindowError::EventNotFound { .. } => Self::EventNotFound,
            WindowError::Fetch(source) => source.into(),
            WindowError::Segment(segment) => segment.into(),
        }
    }
}

impl From<&DecryptionError> for ErrorCode {
    fn from(_: &DecryptionError) -> Self {
        Self::DecryptionFailed
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorCode;
    use std::collections::HashSet;

    const ALL: [ErrorCode; 13] = [
        ErrorCode::ConfigParseError,
        ErrorCode::InvalidConfigValue,
        ErrorCode::CheckpointUnreadable,
        ErrorCode::MalformedDelta,
        ErrorCode::RoomRejected,
        ErrorCode::MalformedEvent,
        ErrorCode::RoomNotFound,
        ErrorCode::EventNotFound,
        ErrorCode::SegmentNotFound,
        ErrorCode::LiveSegmentRemoval,
        ErrorCode::PaginationFailed,
        ErrorCode::DecryptionFailed,
        ErrorCode::InternalUnexpected,
    ];

    #[test]
    fn all_codes_are_unique() {
        let mut seen = HashSet::new();
        for code in ALL {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn typed_errors_map_to_codes() {
        use crate::sync::AccumulateError;
        use crate::timeline::{SourceError, WindowError};

        assert_eq!(
            ErrorCode::from(&AccumulateError::MissingNextBatch),
            ErrorCode::MalformedDelta
        );
        let err = WindowError::Fetch(SourceError::Transport("reset".into()));
        assert_eq!(ErrorCode::from(&err), ErrorCode::PaginationFailed);
    }

    #[test]
    fn display_matches_code() {
        assert_eq!(ErrorCode::RoomRejected.to_string(), "E2002");
    }

    #[test]
    fn code_format_is_machine_friendly() {
        for code in ALL {
            let s = code.code();
            assert_eq!(s.len(), 5);
            assert!(s.starts_with('E'));
            assert!(s.chars().skip(1).all(|c| c.is_ascii_digit()));
        }
    }
}
