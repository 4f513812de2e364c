//! Common utilities for the BRL USB driver
//!
//! This crate provides functionality shared between the driver library and
//! its command-line front end: error handling, logging setup, and the async
//! channel bridge used to talk to the dedicated USB worker thread.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{UsbBridge, UsbCommand, UsbEvent, UsbWorker, create_usb_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
