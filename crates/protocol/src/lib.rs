//! Shared types for the BRL USB board driver
//!
//! This crate holds the plain data that every layer of the driver agrees on:
//! board serial numbers, transfer directions and completion statuses, the
//! error taxonomy surfaced to consumers, and the board's packet opcodes.
//!
//! # Example
//!
//! ```
//! use protocol::{BoardError, Serial};
//!
//! let serial = Serial::parse("7").unwrap();
//! assert_eq!(serial, Serial(7));
//!
//! let err = Serial::parse("7a").unwrap_err();
//! assert!(matches!(err, BoardError::InvalidSerial { .. }));
//! ```

pub mod error;
pub mod packets;
pub mod types;

pub use error::{BoardError, Result};
pub use packets::{
    DAC_RESET, DAC_RESET_ACK, DAC_WRITE, ENC_READ, ENC_REQ, ENC_RESET, ENC_RESET_ACK, ENC_VEL,
    ENCDAC_RESET, ENCDAC_RESET_ACK, ESTOP_ACK, MAX_BOARDS, MAX_SERIAL_LENGTH, USB_MAX_IN_LEN,
    USB_MAX_OUT_LEN,
};
pub use types::{
    BoardInfo, BoardStatus, Direction, Serial, TransferStatus, TransportFailure,
};
