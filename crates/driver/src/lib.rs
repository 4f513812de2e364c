//! Bulk transfer driver for BRL encoder/DAC boards
//!
//! Boards attach over USB with one bulk IN and one bulk OUT endpoint. Each
//! board is addressed by the decimal serial number in its string descriptor.
//! Consumers open a [`usb::Session`] on a board, submit fire-and-forget
//! writes, and read through a two-phase request/retrieve protocol.

pub mod config;
pub mod usb;
