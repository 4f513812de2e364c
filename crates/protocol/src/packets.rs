//! Board packet opcodes and size limits
//!
//! The first byte of every packet exchanged with the encoder/DAC board is one
//! of these opcodes. The driver treats payloads as opaque bytes; only the reset
//! maintenance sequence looks at them.

/// OUT: reset encoders
pub const ENC_RESET: u8 = 0x01;
/// OUT: request an encoder packet
pub const ENC_REQ: u8 = 0x02;
/// IN: encoder counts
pub const ENC_READ: u8 = 0x03;
/// IN: encoder counts and velocity
pub const ENC_VEL: u8 = 0x04;
/// OUT: reset DACs
pub const DAC_RESET: u8 = 0x05;
/// OUT: DAC value packet
pub const DAC_WRITE: u8 = 0x06;
/// OUT: reset encoders and DACs
pub const ENCDAC_RESET: u8 = 0x07;
/// IN: emergency stop acknowledged
pub const ESTOP_ACK: u8 = 0x08;
/// IN: encoder reset acknowledged
pub const ENC_RESET_ACK: u8 = 0x09;
/// IN: DAC reset acknowledged
pub const DAC_RESET_ACK: u8 = 0x0A;
/// IN: encoder and DAC reset acknowledged
pub const ENCDAC_RESET_ACK: u8 = 0x0B;

/// Largest OUT packet the board accepts
pub const USB_MAX_OUT_LEN: usize = 512;
/// Largest IN packet the board produces
pub const USB_MAX_IN_LEN: usize = 512;

/// Longest serial number string read from the device descriptor
pub const MAX_SERIAL_LENGTH: usize = 10;
/// Number of registry slots; serial numbers must be below this
pub const MAX_BOARDS: usize = 99;
