//! Per-board transfer state
//!
//! [`BoardDevice`] aggregates the read and write [`TransferChannel`]s of one
//! attached board with its presence flag and the session-level read state.
//!
//! The device lock guards `present` and every decision to submit or unlink a
//! request. Critical sections are short and never wait on a completion, since
//! completions may need to run (on another thread, or inline inside the
//! transport) while the lock is held. Completion handling therefore touches
//! only the channel, the read target and the waiter slot, never the lock.

use crate::usb::channel::{TransferChannel, hex_dump};
use crate::usb::completion;
use crate::usb::lock;
use crate::usb::reset::ResetSequence;
use crate::usb::transport::{CompletionFn, Endpoints, SubmitError, Transport};
use protocol::{BoardError, BoardInfo, BoardStatus, Direction, Serial};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Timing and sizing knobs applied to every attached board
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Bounded wait before the first retrieval poll (zero disables it)
    pub read_wait: Duration,
    /// Pause before unlinking a busy channel on release
    pub cancel_settle: Duration,
    /// Bound on waiting for unlinked requests to complete
    pub cancel_timeout: Duration,
    /// Per-session write staging buffer size
    pub write_buffer_len: usize,
    /// Reset maintenance sequence
    pub reset: ResetSequence,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            read_wait: Duration::from_millis(10),
            cancel_settle: Duration::from_millis(5),
            cancel_timeout: Duration::from_millis(100),
            write_buffer_len: 1024,
            reset: ResetSequence::default(),
        }
    }
}

struct Presence {
    present: bool,
}

/// One attached board
pub struct BoardDevice {
    serial: Serial,
    transport: Arc<dyn Transport>,
    endpoints: Endpoints,
    options: DeviceOptions,
    lock: Mutex<Presence>,
    read: TransferChannel,
    write: TransferChannel,
    session_open: AtomicBool,
    read_requested: AtomicBool,
    /// Thread to unpark when a read completes
    waiter: Mutex<Option<Thread>>,
    /// Destination registered by the read request; filled by the completion
    read_target: Mutex<Option<Vec<u8>>>,
}

impl BoardDevice {
    /// Create the state for a freshly attached board
    pub fn new(serial: Serial, transport: Arc<dyn Transport>, options: DeviceOptions) -> Arc<Self> {
        let endpoints = transport.endpoints();

        Arc::new(Self {
            serial,
            endpoints,
            options,
            lock: Mutex::new(Presence { present: true }),
            read: TransferChannel::new(
                Direction::In,
                endpoints.in_address,
                endpoints.in_packet_size,
            ),
            write: TransferChannel::new(
                Direction::Out,
                endpoints.out_address,
                endpoints.out_packet_size,
            ),
            session_open: AtomicBool::new(false),
            read_requested: AtomicBool::new(false),
            waiter: Mutex::new(None),
            read_target: Mutex::new(None),
            transport,
        })
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// False once disconnect has begun
    pub fn is_present(&self) -> bool {
        lock(&self.lock).present
    }

    pub fn channel(&self, direction: Direction) -> &TransferChannel {
        match direction {
            Direction::In => &self.read,
            Direction::Out => &self.write,
        }
    }

    pub fn read_channel(&self) -> &TransferChannel {
        &self.read
    }

    pub fn write_channel(&self) -> &TransferChannel {
        &self.write
    }

    /// Bytes moved by the most recent completed read (0 while in flight)
    pub fn bytes_read(&self) -> usize {
        self.read.bytes_transferred()
    }

    /// Bytes moved by the most recent completed write (0 while in flight)
    pub fn bytes_written(&self) -> usize {
        self.write.bytes_transferred()
    }

    pub fn is_session_open(&self) -> bool {
        self.session_open.load(Ordering::Acquire)
    }

    pub fn is_read_requested(&self) -> bool {
        self.read_requested.load(Ordering::Acquire)
    }

    pub fn status(&self) -> BoardStatus {
        BoardStatus {
            serial: self.serial,
            present: self.is_present(),
            read_busy: self.read.is_busy(),
            write_busy: self.write.is_busy(),
            session_open: self.is_session_open(),
            read_requested: self.is_read_requested(),
            bytes_read: self.bytes_read(),
            bytes_written: self.bytes_written(),
        }
    }

    pub fn info(&self) -> BoardInfo {
        let position = self.transport.bus_position();
        BoardInfo {
            serial: self.serial,
            bus_number: position.map(|(bus, _)| bus),
            device_address: position.map(|(_, address)| address),
            in_endpoint: self.endpoints.in_address,
            out_endpoint: self.endpoints.out_address,
            in_packet_size: self.endpoints.in_packet_size,
            out_packet_size: self.endpoints.out_packet_size,
        }
    }

    /// Submit a single bulk request on one channel
    ///
    /// Checks presence, session, length and busy in that order under the
    /// device lock, clamps `length` to the channel buffer and hands the
    /// request to the transport. Returns the number of bytes requested from
    /// the transport.
    pub(crate) fn submit(
        self: &Arc<Self>,
        direction: Direction,
        payload: Option<&[u8]>,
        length: usize,
    ) -> Result<usize, BoardError> {
        let flags = lock(&self.lock);
        self.submit_locked(&flags, direction, payload, length)
    }

    fn submit_locked(
        self: &Arc<Self>,
        flags: &Presence,
        direction: Direction,
        payload: Option<&[u8]>,
        length: usize,
    ) -> Result<usize, BoardError> {
        if !flags.present {
            debug!("Board {} unplugged, refusing {}", self.serial, direction);
            return Err(BoardError::Disconnected);
        }
        // Release clears this before quiescing under the same lock
        if !self.is_session_open() {
            debug!("Board {} session closed, refusing {}", self.serial, direction);
            return Err(BoardError::SessionClosed);
        }
        if length == 0 {
            return Err(BoardError::InvalidArgument("zero-length transfer"));
        }

        let channel = self.channel(direction);
        let request = channel.begin(payload, length).inspect_err(|_| {
            debug!("Board {} {} already in progress", self.serial, direction);
        })?;
        let accepted = request.length;

        let device = Arc::clone(self);
        let on_complete: CompletionFn =
            Box::new(move |outcome| completion::dispatch(&device, direction, outcome));

        match self.transport.submit(request, on_complete) {
            Ok(()) => {
                trace!(
                    "Board {} submitted {} of {} bytes",
                    self.serial, direction, accepted
                );
                Ok(accepted)
            }
            Err(SubmitError { buffer, failure }) => {
                channel.rollback(buffer);
                warn!(
                    "Board {} failed submitting {} request: {}",
                    self.serial, direction, failure
                );
                Err(BoardError::Transport(failure))
            }
        }
    }

    /// Initiate phase of the read protocol
    ///
    /// The busy and pending checks, the destination registration, the
    /// submission and the pending mark form one step under the device lock,
    /// so a concurrent request can never replace an unretrieved destination.
    /// `waiter` is unparked when the read completes.
    pub(crate) fn request_read(
        self: &Arc<Self>,
        length: usize,
        waiter: Thread,
    ) -> Result<usize, BoardError> {
        let flags = lock(&self.lock);
        if !flags.present {
            return Err(BoardError::Disconnected);
        }
        if !self.is_session_open() {
            return Err(BoardError::SessionClosed);
        }
        if self.read.is_busy() {
            return Err(BoardError::Busy(Direction::In));
        }
        if self.is_read_requested() {
            debug!(
                "Board {} discarding unretrieved read before new request",
                self.serial
            );
            self.clear_read_state();
            return Err(BoardError::AlreadyPending);
        }

        self.set_waiter(waiter);
        self.register_read_target(length.min(self.read.capacity()));

        match self.submit_locked(&flags, Direction::In, None, length) {
            Ok(accepted) => {
                self.read_requested.store(true, Ordering::Release);
                Ok(accepted)
            }
            Err(e) => {
                self.clear_waiter();
                self.clear_read_state();
                Err(e)
            }
        }
    }

    /// Retrieve phase of the read protocol
    ///
    /// Non-blocking. Copies the completed read into `out` and returns the
    /// protocol to idle.
    pub(crate) fn retrieve_read(&self, out: &mut [u8]) -> Result<usize, BoardError> {
        let flags = lock(&self.lock);
        if !flags.present {
            return Err(BoardError::Disconnected);
        }
        if !self.is_read_requested() {
            return Err(BoardError::NotRequested);
        }
        if self.read.is_busy() {
            return Err(BoardError::Busy(Direction::In));
        }

        let available = self.bytes_read();
        if available == 0 {
            debug!("Board {} read completed with no data", self.serial);
            self.clear_read_state();
            return Err(BoardError::NoData);
        }

        self.take_read_data(out, available)
            .ok_or(BoardError::NotRequested)
    }

    /// Tear the board down after it was unplugged or the driver is stopping
    ///
    /// Unlinks any in-flight request and clears `present` under the lock, so
    /// no submission can start afterwards. Unlinked requests still complete
    /// later and are drained by the completion handler. Returns false if the
    /// board was already disconnected.
    pub fn disconnect(&self) -> bool {
        {
            let mut flags = lock(&self.lock);
            if !flags.present {
                return false;
            }
            self.unlink_busy();
            flags.present = false;
        }

        self.read_requested.store(false, Ordering::Release);
        lock(&self.read_target).take();
        // A parked reader must notice the board is gone
        self.wake_waiter();

        info!("Board {} disconnected", self.serial);
        true
    }

    /// Leave both channels idle, unlinking whatever is still in flight
    ///
    /// Used by session release. Waits briefly before unlinking, then up to
    /// `cancel_timeout` for the cancellations to land.
    pub(crate) fn quiesce(&self) {
        let _flags = lock(&self.lock);

        for channel in [&self.read, &self.write] {
            if !channel.is_busy() {
                continue;
            }
            thread::sleep(self.options.cancel_settle);
            if channel.is_busy() {
                debug!(
                    "Board {} unlinking in-flight {}",
                    self.serial,
                    channel.direction()
                );
                self.transport.cancel(channel.direction());
            }
        }

        let deadline = Instant::now() + self.options.cancel_timeout;
        while (self.read.is_busy() || self.write.is_busy()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        if self.read.is_busy() || self.write.is_busy() {
            warn!(
                "Board {} still busy after {:?} (read={}, write={})",
                self.serial,
                self.options.cancel_timeout,
                self.read.is_busy(),
                self.write.is_busy()
            );
        }
    }

    fn unlink_busy(&self) {
        for channel in [&self.read, &self.write] {
            if channel.is_busy() {
                debug!(
                    "Board {} unlinking in-flight {}",
                    self.serial,
                    channel.direction()
                );
                self.transport.cancel(channel.direction());
            }
        }
    }

    pub(crate) fn open_session(&self) {
        self.session_open.store(true, Ordering::Release);
        self.read_requested.store(false, Ordering::Release);
    }

    pub(crate) fn close_session(&self) {
        self.session_open.store(false, Ordering::Release);
    }

    /// Register a fresh destination for the next read completion
    pub(crate) fn register_read_target(&self, length: usize) {
        *lock(&self.read_target) = Some(Vec::with_capacity(length));
    }

    /// Drop any registered destination and return the protocol to idle
    pub(crate) fn clear_read_state(&self) {
        self.read_requested.store(false, Ordering::Release);
        lock(&self.read_target).take();
    }

    /// Copy completed read data out of the registered destination
    ///
    /// Returns the number of bytes copied into `out`, or `None` if no
    /// destination was registered. The destination is released either way.
    pub(crate) fn take_read_data(&self, out: &mut [u8], available: usize) -> Option<usize> {
        let target = lock(&self.read_target).take();
        self.read_requested.store(false, Ordering::Release);
        let target = target?;
        let count = available.min(target.len()).min(out.len());
        out[..count].copy_from_slice(&target[..count]);
        Some(count)
    }

    /// Called from the completion context with the transport-filled bytes
    pub(crate) fn deliver_read(&self, data: &[u8]) {
        match lock(&self.read_target).as_mut() {
            Some(target) => {
                target.clear();
                target.extend_from_slice(data);
                trace!("Board {} read data: {}", self.serial, hex_dump(data));
            }
            None => {
                trace!(
                    "Board {} dropped {} read bytes with no destination",
                    self.serial,
                    data.len()
                );
            }
        }
    }

    pub(crate) fn set_waiter(&self, thread: Thread) {
        *lock(&self.waiter) = Some(thread);
    }

    pub(crate) fn clear_waiter(&self) {
        lock(&self.waiter).take();
    }

    /// Wake whoever waits for the read, exactly once per registration
    pub(crate) fn wake_waiter(&self) {
        if let Some(thread) = lock(&self.waiter).take() {
            thread.unpark();
        }
    }
}

impl std::fmt::Debug for BoardDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardDevice")
            .field("serial", &self.serial)
            .field("present", &self.is_present())
            .field("read_busy", &self.read.is_busy())
            .field("write_busy", &self.write.is_busy())
            .finish()
    }
}
