//! Board error types

use crate::types::{Direction, Serial, TransportFailure};
use nix::errno::Errno;
use thiserror::Error;

/// Errors surfaced by board operations
///
/// `Busy`, `NotRequested`, `AlreadyPending` and `NoData` are transient and
/// meant to be retried by the caller. `Disconnected` and `NotFound` end the
/// session. The attach-time variants only fail the attach attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoardError {
    /// Zero-length or otherwise malformed request
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Channel already has a request in flight
    #[error("{0} channel busy")]
    Busy(Direction),

    /// Board was unplugged
    #[error("Board disconnected")]
    Disconnected,

    /// No board resolves for the handle
    #[error("Board not found")]
    NotFound,

    /// Retrieval without a preceding read request
    #[error("No read was requested")]
    NotRequested,

    /// A previous read was requested and never retrieved
    #[error("A previous read is still pending retrieval")]
    AlreadyPending,

    /// Read completed without data
    #[error("Read completed with no data")]
    NoData,

    /// Lower layer rejected the request
    #[error("Transport error: {0}")]
    Transport(TransportFailure),

    /// Serial number descriptor is unreadable or not numeric
    #[error("Invalid serial number '{raw}': {reason}")]
    InvalidSerial { raw: String, reason: String },

    /// A board with this serial is already attached
    #[error("Board {0} is already attached")]
    DuplicateSerial(Serial),

    /// Serial does not fit in the registry
    #[error("Serial {serial} out of range (capacity {capacity})")]
    SerialOutOfRange { serial: Serial, capacity: usize },

    /// Interface lacks a bulk endpoint in this direction
    #[error("No bulk {0} endpoint found")]
    MissingEndpoint(Direction),

    /// Payload could not be copied in full
    #[error("Copied {copied} of {requested} bytes")]
    PartialCopy { copied: usize, requested: usize },

    /// Session was released
    #[error("Session is closed")]
    SessionClosed,
}

impl BoardError {
    /// Whether the caller should simply retry later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BoardError::Busy(_)
                | BoardError::NotRequested
                | BoardError::AlreadyPending
                | BoardError::NoData
        )
    }

    /// POSIX errno equivalent, for character-device style consumers
    pub fn as_errno(&self) -> Errno {
        match self {
            BoardError::InvalidArgument(_) => Errno::EINVAL,
            BoardError::Busy(_) => Errno::EBUSY,
            BoardError::Disconnected | BoardError::NotFound => Errno::ENODEV,
            BoardError::NotRequested => Errno::EAGAIN,
            BoardError::AlreadyPending => Errno::EALREADY,
            BoardError::NoData => Errno::ENODATA,
            BoardError::Transport(TransportFailure::NoMemory) => Errno::ENOMEM,
            BoardError::Transport(TransportFailure::NoDevice) => Errno::ENODEV,
            BoardError::Transport(_) => Errno::EIO,
            BoardError::InvalidSerial { .. } => Errno::EINVAL,
            BoardError::DuplicateSerial(_) => Errno::EEXIST,
            BoardError::SerialOutOfRange { .. } => Errno::ERANGE,
            BoardError::MissingEndpoint(_) => Errno::ENODEV,
            BoardError::PartialCopy { .. } => Errno::EFAULT,
            BoardError::SessionClosed => Errno::EBADF,
        }
    }

    /// Raw errno value of [`BoardError::as_errno`] on this platform
    pub fn errno(&self) -> i32 {
        self.as_errno() as i32
    }
}

/// Type alias for board results
pub type Result<T> = std::result::Result<T, BoardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BoardError::Busy(Direction::In);
        assert_eq!(err.to_string(), "read channel busy");

        let err = BoardError::DuplicateSerial(Serial(7));
        assert!(err.to_string().contains("#7"));

        let err = BoardError::PartialCopy {
            copied: 1024,
            requested: 2000,
        };
        assert!(err.to_string().contains("1024 of 2000"));
    }

    #[test]
    fn test_transient_errors() {
        assert!(BoardError::Busy(Direction::Out).is_transient());
        assert!(BoardError::NoData.is_transient());
        assert!(!BoardError::Disconnected.is_transient());
        assert!(!BoardError::Transport(TransportFailure::Io).is_transient());
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(BoardError::Busy(Direction::In).as_errno(), Errno::EBUSY);
        assert_eq!(BoardError::Disconnected.as_errno(), Errno::ENODEV);
        assert_eq!(BoardError::AlreadyPending.as_errno(), Errno::EALREADY);
        assert_eq!(BoardError::NoData.as_errno(), Errno::ENODATA);
        assert_eq!(
            BoardError::InvalidArgument("zero length").errno(),
            Errno::EINVAL as i32
        );
        assert_eq!(
            BoardError::Transport(TransportFailure::NoMemory).errno(),
            Errno::ENOMEM as i32
        );
    }
}
