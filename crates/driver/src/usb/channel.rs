//! Single-slot bulk transfer channel
//!
//! One [`TransferChannel`] per direction per board. It owns a buffer sized to
//! the endpoint's max packet size and allows at most one request in flight:
//! `busy` is raised exactly once at submission and lowered exactly once at
//! completion. There is no queue; a second submission while busy is refused.

use crate::usb::lock;
use crate::usb::transport::TransferRequest;
use protocol::{BoardError, Direction};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::{trace, warn};

/// One direction of bulk I/O for one board
pub struct TransferChannel {
    direction: Direction,
    endpoint: u8,
    capacity: usize,
    /// Raised from submission until the completion callback runs
    busy: AtomicBool,
    /// Bytes moved by the last completed request; 0 while in flight
    bytes_transferred: AtomicUsize,
    /// `None` while the transport owns the buffer
    buffer: Mutex<Option<Vec<u8>>>,
    submitted: AtomicU64,
    completed: AtomicU64,
}

impl TransferChannel {
    pub fn new(direction: Direction, endpoint: u8, capacity: usize) -> Self {
        Self {
            direction,
            endpoint,
            capacity,
            busy: AtomicBool::new(false),
            bytes_transferred: AtomicUsize::new(0),
            buffer: Mutex::new(Some(vec![0u8; capacity])),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Buffer size; requests are clamped to this
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock-free busy check
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Byte count of the last completed request
    ///
    /// Only meaningful while the channel is idle.
    pub fn bytes_transferred(&self) -> usize {
        self.bytes_transferred.load(Ordering::Acquire)
    }

    /// (submitted, completed) request counters
    pub fn counters(&self) -> (u64, u64) {
        (
            self.submitted.load(Ordering::Relaxed),
            self.completed.load(Ordering::Relaxed),
        )
    }

    /// Claim the channel and build a request for the transport
    ///
    /// `length` must be non-zero. For OUT, `payload[..length]` (after clamping)
    /// is copied into the channel buffer. On success the channel is busy and
    /// the returned request owns the buffer.
    pub(crate) fn begin(
        &self,
        payload: Option<&[u8]>,
        length: usize,
    ) -> Result<TransferRequest, BoardError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BoardError::Busy(self.direction));
        }

        let Some(mut buffer) = lock(&self.buffer).take() else {
            // Idle channel without its buffer means a completion was lost
            warn!(
                "{} channel on endpoint {:#04x} idle without buffer, reallocating",
                self.direction, self.endpoint
            );
            return self.begin_with(vec![0u8; self.capacity], payload, length);
        };
        buffer.resize(self.capacity, 0);
        self.begin_with(buffer, payload, length)
    }

    fn begin_with(
        &self,
        mut buffer: Vec<u8>,
        payload: Option<&[u8]>,
        length: usize,
    ) -> Result<TransferRequest, BoardError> {
        let mut length = length.min(self.capacity);
        if let Some(payload) = payload {
            length = length.min(payload.len());
            buffer[..length].copy_from_slice(&payload[..length]);
            trace!(
                "{} ep {:#04x} payload: {}",
                self.direction,
                self.endpoint,
                hex_dump(&buffer[..length])
            );
        }

        self.bytes_transferred.store(0, Ordering::Release);
        self.submitted.fetch_add(1, Ordering::Relaxed);

        Ok(TransferRequest {
            direction: self.direction,
            endpoint: self.endpoint,
            buffer,
            length,
        })
    }

    /// Undo [`begin`](Self::begin) after the transport refused the request
    pub(crate) fn rollback(&self, buffer: Vec<u8>) {
        *lock(&self.buffer) = Some(buffer);
        self.submitted.fetch_sub(1, Ordering::Relaxed);
        self.busy.store(false, Ordering::Release);
    }

    /// Record a completion: take the buffer back, store the count, go idle
    pub(crate) fn finish(&self, buffer: Vec<u8>, actual_length: usize) {
        *lock(&self.buffer) = Some(buffer);
        self.bytes_transferred
            .store(actual_length, Ordering::Release);
        self.completed.fetch_add(1, Ordering::Relaxed);

        if !self.busy.swap(false, Ordering::AcqRel) {
            warn!(
                "{} completion on endpoint {:#04x} while channel was idle",
                self.direction, self.endpoint
            );
        }
    }
}

/// Hex dump for trace-level packet logging
pub(crate) fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
