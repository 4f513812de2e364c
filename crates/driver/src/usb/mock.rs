//! Scripted transport for tests and dry runs
//!
//! [`MockTransport`] accepts at most one request per direction and keeps it
//! until the caller completes it explicitly. Cancellation completes the
//! request inline with `Cancelled` (the way a kill-style unlink does), unless
//! deferred cancellation is enabled, in which case the request stays in flight
//! until [`MockTransport::complete`] is called.

use crate::usb::lock;
use crate::usb::transport::{
    CompletionFn, Endpoints, SubmitError, TransferOutcome, TransferRequest, Transport,
};
use protocol::{Direction, TransferStatus, TransportFailure};
use std::sync::{Arc, Mutex};

/// Default endpoints: full-speed style 64 byte bulk pair
pub const MOCK_ENDPOINTS: Endpoints = Endpoints {
    in_address: 0x86,
    in_packet_size: 64,
    out_address: 0x02,
    out_packet_size: 64,
};

struct InFlight {
    request: TransferRequest,
    on_complete: CompletionFn,
}

#[derive(Default)]
struct MockState {
    serial: Option<String>,
    read: Option<InFlight>,
    write: Option<InFlight>,
    submits: [usize; 2],
    cancels: [usize; 2],
    fail_next: Option<TransportFailure>,
    deferred_cancel: bool,
    auto_complete: bool,
    read_reply: Vec<u8>,
    written: Vec<Vec<u8>>,
}

impl MockState {
    fn slot(&mut self, direction: Direction) -> &mut Option<InFlight> {
        match direction {
            Direction::In => &mut self.read,
            Direction::Out => &mut self.write,
        }
    }
}

fn index(direction: Direction) -> usize {
    match direction {
        Direction::In => 0,
        Direction::Out => 1,
    }
}

/// In-memory transport
pub struct MockTransport {
    endpoints: Endpoints,
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Transport reporting `serial` with the default endpoints
    pub fn new(serial: &str) -> Arc<Self> {
        Self::with_endpoints(serial, MOCK_ENDPOINTS)
    }

    pub fn with_endpoints(serial: &str, endpoints: Endpoints) -> Arc<Self> {
        Arc::new(Self {
            endpoints,
            state: Mutex::new(MockState {
                serial: Some(serial.to_string()),
                ..MockState::default()
            }),
        })
    }

    /// Make serial reads fail, as after the board is unplugged
    pub fn unplug(&self) {
        lock(&self.state).serial = None;
    }

    /// Reject the next submission with `failure`
    pub fn fail_next_submit(&self, failure: TransportFailure) {
        lock(&self.state).fail_next = Some(failure);
    }

    /// Keep cancelled requests in flight until completed explicitly
    pub fn set_deferred_cancel(&self, deferred: bool) {
        lock(&self.state).deferred_cancel = deferred;
    }

    /// Complete every request inline as soon as it is submitted
    ///
    /// Writes move their full length; reads return `read_reply` (truncated
    /// to the requested length).
    pub fn set_auto_complete(&self, enabled: bool, read_reply: &[u8]) {
        let mut state = lock(&self.state);
        state.auto_complete = enabled;
        state.read_reply = read_reply.to_vec();
    }

    /// Finish the in-flight request for `direction`
    ///
    /// For IN, `data` is copied into the request buffer and becomes the
    /// actual length. For OUT, the actual length is `data.len()` clamped to
    /// the request. Returns false if nothing was in flight.
    pub fn complete(&self, direction: Direction, status: TransferStatus, data: &[u8]) -> bool {
        let Some(in_flight) = lock(&self.state).slot(direction).take() else {
            return false;
        };
        Self::finish(in_flight, status, data);
        true
    }

    /// Finish the in-flight read with `data`
    pub fn complete_read(&self, data: &[u8]) -> bool {
        self.complete(Direction::In, TransferStatus::Completed, data)
    }

    /// Finish the in-flight write, reporting its full length as sent
    pub fn complete_write(&self) -> bool {
        let Some(in_flight) = lock(&self.state).write.take() else {
            return false;
        };
        let sent = in_flight.request.buffer[..in_flight.request.length].to_vec();
        Self::finish(in_flight, TransferStatus::Completed, &sent);
        true
    }

    pub fn is_in_flight(&self, direction: Direction) -> bool {
        lock(&self.state).slot(direction).is_some()
    }

    /// Length of the in-flight request, if any
    pub fn in_flight_length(&self, direction: Direction) -> Option<usize> {
        lock(&self.state)
            .slot(direction)
            .as_ref()
            .map(|f| f.request.length)
    }

    pub fn submit_count(&self, direction: Direction) -> usize {
        lock(&self.state).submits[index(direction)]
    }

    pub fn cancel_count(&self, direction: Direction) -> usize {
        lock(&self.state).cancels[index(direction)]
    }

    /// Every OUT payload accepted so far, in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.state).written.clone()
    }

    fn finish(in_flight: InFlight, status: TransferStatus, data: &[u8]) {
        let InFlight {
            request,
            on_complete,
        } = in_flight;
        let mut buffer = request.buffer;
        let actual_length = data.len().min(request.length);
        if request.direction == Direction::In {
            buffer[..actual_length].copy_from_slice(&data[..actual_length]);
        }
        on_complete(TransferOutcome {
            status,
            buffer,
            actual_length,
        });
    }
}

impl Transport for MockTransport {
    fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    fn read_serial_string(&self) -> Result<String, TransportFailure> {
        lock(&self.state).serial.clone().ok_or(TransportFailure::NoDevice)
    }

    fn submit(
        &self,
        request: TransferRequest,
        on_complete: CompletionFn,
    ) -> Result<(), SubmitError> {
        let direction = request.direction;
        let mut state = lock(&self.state);

        if let Some(failure) = state.fail_next.take() {
            return Err(SubmitError {
                buffer: request.buffer,
                failure,
            });
        }
        if state.slot(direction).is_some() {
            return Err(SubmitError {
                buffer: request.buffer,
                failure: TransportFailure::Busy,
            });
        }

        state.submits[index(direction)] += 1;
        if direction == Direction::Out {
            state
                .written
                .push(request.buffer[..request.length].to_vec());
        }

        let in_flight = InFlight {
            request,
            on_complete,
        };
        if !state.auto_complete {
            *state.slot(direction) = Some(in_flight);
            return Ok(());
        }

        let reply = match direction {
            Direction::In => state.read_reply.clone(),
            Direction::Out => in_flight.request.buffer[..in_flight.request.length].to_vec(),
        };
        drop(state);
        Self::finish(in_flight, TransferStatus::Completed, &reply);
        Ok(())
    }

    fn cancel(&self, direction: Direction) {
        let mut state = lock(&self.state);
        state.cancels[index(direction)] += 1;
        if state.deferred_cancel {
            return;
        }
        let in_flight = state.slot(direction).take();
        drop(state);

        if let Some(in_flight) = in_flight {
            Self::finish(in_flight, TransferStatus::Cancelled, &[]);
        }
    }
}
