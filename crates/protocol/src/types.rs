//! Board and transfer type definitions
//!
//! This module defines the identifiers, directions and completion statuses
//! used by the transfer engine, along with the snapshots reported to
//! consumers when they list or inspect boards.

use crate::error::BoardError;
use crate::packets::MAX_SERIAL_LENGTH;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Board serial number
///
/// Read once from the device's serial number string descriptor at attach time
/// and used as the board's registry key. Stable for the board's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Serial(pub u32);

impl Serial {
    /// Parse a serial number string descriptor
    ///
    /// The descriptor must be non-empty, at most `MAX_SERIAL_LENGTH` characters
    /// long and made only of ASCII decimal digits.
    pub fn parse(raw: &str) -> Result<Self, BoardError> {
        let invalid = |reason: &str| BoardError::InvalidSerial {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Err(invalid("empty serial number"));
        }
        if raw.len() > MAX_SERIAL_LENGTH {
            return Err(invalid("serial number too long"));
        }

        let mut value: u32 = 0;
        for c in raw.chars() {
            let digit = c
                .to_digit(10)
                .ok_or_else(|| invalid(&format!("non numeral digit '{}'", c.escape_default())))?;
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add(digit))
                .ok_or_else(|| invalid("serial number overflows u32"))?;
        }

        Ok(Serial(value))
    }

    /// Registry slot index for this serial
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Bulk transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host (bulk IN)
    In,
    /// Host to device (bulk OUT)
    Out,
}

impl Direction {
    /// Derive the direction from an endpoint address (bit 7 set = IN)
    pub fn from_endpoint(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "read"),
            Direction::Out => write!(f, "write"),
        }
    }
}

/// Final status of a submitted transfer request
///
/// Reported by the transport when a request completes. `Cancelled` is the
/// expected outcome of an unlink issued by release or disconnect and is not
/// an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Request finished and moved `actual_length` bytes
    Completed,
    /// Request was unlinked locally before it finished
    Cancelled,
    /// Request exceeded the configured transfer timeout
    TimedOut,
    /// Endpoint halted
    Stall,
    /// Device returned more data than requested
    Overflow,
    /// Device went away mid-transfer
    NoDevice,
    /// Any other bus-level failure
    Failed,
}

impl TransferStatus {
    /// True if the request completed normally
    pub fn is_success(self) -> bool {
        self == TransferStatus::Completed
    }

    /// True if the request was cancelled from this side
    pub fn is_local_cancel(self) -> bool {
        self == TransferStatus::Cancelled
    }
}

/// Reason a transport rejected a submission or a descriptor read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportFailure {
    /// Device is gone
    NoDevice,
    /// Transport has no room for another request on this endpoint
    Busy,
    /// Out of transfer resources
    NoMemory,
    /// Endpoint halted
    Pipe,
    /// Insufficient permissions
    Access,
    /// Operation timed out
    Timeout,
    /// Input/output error
    Io,
    /// Anything else, with the lower layer's message
    Other(String),
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFailure::NoDevice => write!(f, "no such device"),
            TransportFailure::Busy => write!(f, "endpoint busy"),
            TransportFailure::NoMemory => write!(f, "out of transfer resources"),
            TransportFailure::Pipe => write!(f, "endpoint stalled"),
            TransportFailure::Access => write!(f, "access denied"),
            TransportFailure::Timeout => write!(f, "timed out"),
            TransportFailure::Io => write!(f, "input/output error"),
            TransportFailure::Other(message) => write!(f, "{}", message),
        }
    }
}

/// Attached board information
///
/// Returned when listing boards. Bus position is only known for boards
/// attached through libusb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardInfo {
    /// Board serial number
    pub serial: Serial,
    /// Bus number, if known
    pub bus_number: Option<u8>,
    /// Device address on the bus, if known
    pub device_address: Option<u8>,
    /// Bulk IN endpoint address
    pub in_endpoint: u8,
    /// Bulk OUT endpoint address
    pub out_endpoint: u8,
    /// Bulk IN max packet size
    pub in_packet_size: usize,
    /// Bulk OUT max packet size
    pub out_packet_size: usize,
}

/// Point-in-time view of a board's transfer state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardStatus {
    pub serial: Serial,
    pub present: bool,
    pub read_busy: bool,
    pub write_busy: bool,
    pub session_open: bool,
    pub read_requested: bool,
    /// Bytes moved by the last completed read
    pub bytes_read: usize,
    /// Bytes moved by the last completed write
    pub bytes_written: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serial() {
        assert_eq!(Serial::parse("0").unwrap(), Serial(0));
        assert_eq!(Serial::parse("42").unwrap(), Serial(42));
        assert_eq!(Serial::parse("0098").unwrap(), Serial(98));
    }

    #[test]
    fn test_parse_serial_rejects_non_digits() {
        assert!(Serial::parse("").is_err());
        assert!(Serial::parse("12a").is_err());
        assert!(Serial::parse(" 12").is_err());
        assert!(Serial::parse("-1").is_err());
    }

    #[test]
    fn test_parse_serial_rejects_overflow() {
        assert!(Serial::parse("4294967295").is_ok());
        assert!(Serial::parse("4294967296").is_err());
        assert!(Serial::parse("12345678901").is_err());
    }

    #[test]
    fn test_direction_from_endpoint() {
        assert_eq!(Direction::from_endpoint(0x81), Direction::In);
        assert_eq!(Direction::from_endpoint(0x02), Direction::Out);
    }

    #[test]
    fn test_transfer_status_classes() {
        assert!(TransferStatus::Completed.is_success());
        assert!(TransferStatus::Cancelled.is_local_cancel());
        assert!(!TransferStatus::Stall.is_success());
        assert!(!TransferStatus::NoDevice.is_local_cancel());
    }

    #[test]
    fn test_board_status_serializes() {
        let status = BoardStatus {
            serial: Serial(3),
            present: true,
            read_busy: false,
            write_busy: true,
            session_open: true,
            read_requested: false,
            bytes_read: 0,
            bytes_written: 64,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"write_busy\":true"));
    }
}
