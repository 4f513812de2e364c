//! USB subsystem
//!
//! Bulk transfer engine for encoder/DAC boards.
//!
//! This module implements:
//! - Per-board single-slot read and write channels
//! - The serial-indexed board registry
//! - Consumer sessions (open, request read, read, write, ioctl, release)
//! - Board discovery, hot-plug and teardown on a dedicated worker thread
//!
//! Everything above [`transport::Transport`] is independent of libusb, so
//! the engine runs against [`mock::MockTransport`] in tests.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod channel;
pub mod completion;
pub mod device;
pub mod manager;
pub mod mock;
pub mod probe;
pub mod registry;
pub mod reset;
pub mod session;
pub mod transfers;
pub mod transport;
pub mod worker;

// Re-export public types
pub use device::{BoardDevice, DeviceOptions};
pub use manager::BoardManager;
pub use registry::DeviceRegistry;
pub use reset::{ResetReport, ResetSequence};
pub use session::{IoctlCommand, IoctlReply, Session};
pub use transfers::UsbTransport;
pub use transport::{Endpoints, Transport};
pub use worker::{UsbWorkerThread, spawn_usb_worker};

/// Lock a mutex, recovering the data if a holder panicked
///
/// Every critical section in the engine leaves its data consistent at each
/// step, so a poisoned lock is still safe to use.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
