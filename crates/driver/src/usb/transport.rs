//! Transport seam
//!
//! The transfer engine never moves bytes itself. It hands a buffer to a
//! [`Transport`] as an in-flight request and later receives it back through a
//! completion callback, which may run on any thread. Cancellation is
//! cooperative: the transport is asked to abort and still reports the request
//! as completed, with [`TransferStatus::Cancelled`].

use protocol::{Direction, TransferStatus, TransportFailure};
use std::fmt;

/// Bulk endpoint pair discovered at attach time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub in_address: u8,
    pub in_packet_size: usize,
    pub out_address: u8,
    pub out_packet_size: usize,
}

impl Endpoints {
    /// Endpoint address for a direction
    pub fn address(&self, direction: Direction) -> u8 {
        match direction {
            Direction::In => self.in_address,
            Direction::Out => self.out_address,
        }
    }

    /// Max packet size (and so channel buffer size) for a direction
    pub fn packet_size(&self, direction: Direction) -> usize {
        match direction {
            Direction::In => self.in_packet_size,
            Direction::Out => self.out_packet_size,
        }
    }
}

/// A request handed to the transport
///
/// The transport owns `buffer` until it invokes the completion callback.
/// Only `buffer[..length]` takes part in the transfer.
pub struct TransferRequest {
    pub direction: Direction,
    pub endpoint: u8,
    pub buffer: Vec<u8>,
    pub length: usize,
}

impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("direction", &self.direction)
            .field("endpoint", &format_args!("{:#04x}", self.endpoint))
            .field("length", &self.length)
            .finish()
    }
}

/// What the transport reports when a request finishes
pub struct TransferOutcome {
    pub status: TransferStatus,
    /// The request's buffer, returned to its channel
    pub buffer: Vec<u8>,
    /// Bytes actually moved; IN data lives in `buffer[..actual_length]`
    pub actual_length: usize,
}

impl TransferOutcome {
    /// Outcome for a request that was unlinked before moving any data
    pub fn cancelled(buffer: Vec<u8>) -> Self {
        Self {
            status: TransferStatus::Cancelled,
            buffer,
            actual_length: 0,
        }
    }
}

/// Completion callback; runs exactly once per accepted request
pub type CompletionFn = Box<dyn FnOnce(TransferOutcome) + Send + 'static>;

/// Submission rejected by the transport
///
/// Carries the buffer back so the channel can restore it.
pub struct SubmitError {
    pub buffer: Vec<u8>,
    pub failure: TransportFailure,
}

impl fmt::Debug for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitError")
            .field("failure", &self.failure)
            .finish()
    }
}

/// Per-device transport used by the transfer engine
pub trait Transport: Send + Sync {
    /// Bulk endpoints used by this device
    fn endpoints(&self) -> Endpoints;

    /// Read the serial number string descriptor
    ///
    /// Needs a live bus transaction, so it fails once the device is unplugged.
    fn read_serial_string(&self) -> Result<String, TransportFailure>;

    /// Start a request; `on_complete` fires later, possibly on another thread
    fn submit(&self, request: TransferRequest, on_complete: CompletionFn)
    -> Result<(), SubmitError>;

    /// Ask the transport to abort the in-flight request for a direction
    ///
    /// Best effort. The completion callback still fires afterwards.
    fn cancel(&self, direction: Direction);

    /// Bus position, if the transport knows it
    fn bus_position(&self) -> Option<(u8, u8)> {
        None
    }
}
