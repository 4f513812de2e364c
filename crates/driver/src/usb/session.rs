//! Consumer sessions
//!
//! A [`Session`] is what a consumer holds between open and release. It exposes
//! the board's operations:
//!
//! - `write` stages the payload in a per-session buffer, submits it and
//!   returns at once. Completion is only observable through `bytes_written`
//!   or a later `Busy`.
//! - Reading is split in two. `request_read` submits the IN request and
//!   registers a destination; `read` retrieves the completed data. Retrieval
//!   may wait up to `read_wait` for the completion, then polls: it never
//!   blocks beyond that.
//!
//! ```text
//! Idle --request_read--> Requested --completion--> Completed --read--> Idle
//!                  release / disconnect: back to Idle, data dropped
//! ```

use crate::usb::device::BoardDevice;
use crate::usb::lock;
use crate::usb::registry::DeviceRegistry;
use crate::usb::reset::{self, ResetReport};
use protocol::{BoardError, Direction, Serial};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Raw ioctl code: run the reset sequence
pub const IOCTL_RESET: u32 = 10;
/// Raw ioctl code: request a read, argument is the length
pub const IOCTL_REQUEST_READ: u32 = 11;
/// Raw ioctl code: byte count of the last completed read
pub const IOCTL_BYTES_READ: u32 = 12;
/// Raw ioctl code: byte count of the last completed write
pub const IOCTL_BYTES_WRITTEN: u32 = 13;

/// Control commands beyond read and write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCommand {
    RequestRead { length: usize },
    Reset,
    BytesRead,
    BytesWritten,
}

impl IoctlCommand {
    /// Decode a raw ioctl code and argument
    pub fn from_raw(code: u32, arg: u64) -> Result<Self, BoardError> {
        match code {
            IOCTL_RESET => Ok(IoctlCommand::Reset),
            IOCTL_REQUEST_READ => {
                let length = usize::try_from(arg)
                    .map_err(|_| BoardError::InvalidArgument("read length too large"))?;
                Ok(IoctlCommand::RequestRead { length })
            }
            IOCTL_BYTES_READ => Ok(IoctlCommand::BytesRead),
            IOCTL_BYTES_WRITTEN => Ok(IoctlCommand::BytesWritten),
            _ => Err(BoardError::InvalidArgument("unknown ioctl")),
        }
    }
}

/// Reply to an [`IoctlCommand`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoctlReply {
    /// Read request accepted for this many bytes
    Accepted(usize),
    /// Reset sequence ran
    Reset(ResetReport),
    /// Byte count query answer
    Count(usize),
}

/// An open board
pub struct Session {
    device: Arc<BoardDevice>,
    write_buffer: Mutex<Vec<u8>>,
    released: AtomicBool,
}

impl Session {
    /// Open the board with `serial`
    pub fn open(registry: &DeviceRegistry, serial: Serial) -> Result<Self, BoardError> {
        let device = registry.get(serial).ok_or(BoardError::NotFound)?;
        Self::from_device(device)
    }

    /// Open a board already resolved by the caller
    pub fn from_device(device: Arc<BoardDevice>) -> Result<Self, BoardError> {
        if !device.is_present() {
            return Err(BoardError::NotFound);
        }

        // Another board may have taken this bus position since attach
        match device
            .transport()
            .read_serial_string()
            .map(|raw| Serial::parse(&raw))
        {
            Ok(Ok(serial)) if serial == device.serial() => {}
            Ok(Ok(serial)) => warn!(
                "Board {} now reports serial {}, keeping {}",
                device.serial(),
                serial,
                device.serial()
            ),
            Ok(Err(e)) => warn!("Board {} serial re-read failed: {}", device.serial(), e),
            Err(e) => warn!("Board {} serial unreadable on open: {}", device.serial(), e),
        }

        if device.is_session_open() {
            debug!("Board {} opened while another session is open", device.serial());
        }
        device.open_session();
        info!("Board {} session opened", device.serial());

        let write_buffer = vec![0u8; device.options().write_buffer_len];
        Ok(Self {
            device,
            write_buffer: Mutex::new(write_buffer),
            released: AtomicBool::new(false),
        })
    }

    pub fn serial(&self) -> Serial {
        self.device.serial()
    }

    pub fn device(&self) -> &Arc<BoardDevice> {
        &self.device
    }

    /// Start a read of up to `length` bytes
    ///
    /// Fails with `Busy` while the previous read is in flight. If a previous
    /// read completed but was never retrieved, its data is discarded and the
    /// call fails with `AlreadyPending`; the next request goes through.
    pub fn request_read(&self, length: usize) -> Result<usize, BoardError> {
        self.check_open()?;
        self.device.request_read(length, thread::current())
    }

    /// Retrieve the data of the last requested read into `out`
    ///
    /// Returns the number of bytes copied.
    pub fn read(&self, out: &mut [u8]) -> Result<usize, BoardError> {
        self.check_open()?;
        let device = &self.device;

        if out.is_empty() {
            return Err(BoardError::InvalidArgument("zero-length read buffer"));
        }
        if !device.is_present() {
            return Err(BoardError::Disconnected);
        }
        if !device.is_read_requested() {
            return Err(BoardError::NotRequested);
        }

        if device.read_channel().is_busy() {
            self.wait_for_read();
        }
        device.retrieve_read(out)
    }

    /// Submit `payload` to the board
    ///
    /// Returns the number of bytes accepted, which is the payload clamped to
    /// the OUT packet size.
    pub fn write(&self, payload: &[u8]) -> Result<usize, BoardError> {
        self.check_open()?;

        let mut staging = lock(&self.write_buffer);
        if payload.len() > staging.len() {
            warn!(
                "Board {} write of {} bytes exceeds {} byte staging buffer",
                self.serial(),
                payload.len(),
                staging.len()
            );
            return Err(BoardError::PartialCopy {
                copied: staging.len(),
                requested: payload.len(),
            });
        }
        staging[..payload.len()].copy_from_slice(payload);

        self.device
            .submit(Direction::Out, Some(&staging[..payload.len()]), payload.len())
    }

    /// Run a control command
    pub fn ioctl(&self, command: IoctlCommand) -> Result<IoctlReply, BoardError> {
        debug!("Board {} ioctl {:?}", self.serial(), command);
        match command {
            IoctlCommand::RequestRead { length } => {
                self.request_read(length).map(IoctlReply::Accepted)
            }
            IoctlCommand::Reset => self.reset().map(IoctlReply::Reset),
            IoctlCommand::BytesRead => {
                self.check_open()?;
                Ok(IoctlReply::Count(self.device.bytes_read()))
            }
            IoctlCommand::BytesWritten => {
                self.check_open()?;
                Ok(IoctlReply::Count(self.device.bytes_written()))
            }
        }
    }

    /// Run the encoder/DAC reset sequence with the board's configured timing
    pub fn reset(&self) -> Result<ResetReport, BoardError> {
        self.check_open()?;
        let sequence = self.device.options().reset.clone();
        Ok(reset::run(self, &sequence))
    }

    /// Byte count of the last completed read
    pub fn bytes_read(&self) -> usize {
        self.device.bytes_read()
    }

    /// Byte count of the last completed write
    pub fn bytes_written(&self) -> usize {
        self.device.bytes_written()
    }

    /// Close the session and leave both channels idle
    ///
    /// Always succeeds. Calling it again does nothing.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let device = &self.device;
        device.close_session();
        device.quiesce();
        device.clear_read_state();
        device.clear_waiter();

        info!("Board {} session released", device.serial());
    }

    fn check_open(&self) -> Result<(), BoardError> {
        if self.released.load(Ordering::Acquire) || !self.device.is_session_open() {
            return Err(BoardError::SessionClosed);
        }
        Ok(())
    }

    /// Park until the read completes, the board goes away, or `read_wait`
    /// elapses
    fn wait_for_read(&self) {
        let device = &self.device;
        let wait = device.options().read_wait;
        if wait.is_zero() {
            return;
        }

        let deadline = Instant::now() + wait;
        device.set_waiter(thread::current());
        while device.read_channel().is_busy() && device.is_present() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
        device.clear_waiter();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("serial", &self.serial())
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}
