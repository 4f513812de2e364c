//! libusb-backed transport
//!
//! [`UsbTransport`] runs each bulk request on a dedicated thread per
//! endpoint, using rusb's synchronous bulk calls in short slices. The
//! cancellation flag is checked between slices, so an unlinked request
//! completes with `Cancelled` within one slice timeout.

use crate::usb::probe::OpenedBoard;
use crate::usb::transport::{
    CompletionFn, Endpoints, SubmitError, TransferOutcome, TransferRequest, Transport,
};
use async_channel::{Receiver, Sender, TrySendError};
use protocol::{Direction, TransferStatus, TransportFailure};
use rusb::{Context, DeviceHandle};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Timing of bulk requests on real hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTiming {
    /// Length of one blocking bulk call; bounds cancellation latency
    pub slice_timeout: Duration,
    /// Give up with `TimedOut` after this long; `None` waits forever
    pub transfer_timeout: Option<Duration>,
}

impl Default for TransferTiming {
    fn default() -> Self {
        Self {
            slice_timeout: Duration::from_millis(50),
            transfer_timeout: None,
        }
    }
}

struct Job {
    request: TransferRequest,
    on_complete: CompletionFn,
}

/// Request feed and cancel flag for one endpoint thread
struct EndpointWorker {
    jobs: Sender<Job>,
    cancel: Arc<AtomicBool>,
}

impl EndpointWorker {
    fn spawn(
        direction: Direction,
        handle: Arc<DeviceHandle<Context>>,
        timing: TransferTiming,
        label: &str,
    ) -> std::io::Result<Self> {
        let (jobs, queue) = async_channel::bounded(1);
        let cancel = Arc::new(AtomicBool::new(false));

        let flag = cancel.clone();
        thread::Builder::new()
            .name(format!("{}-{}", label, direction))
            .spawn(move || run_endpoint(direction, handle, queue, flag, timing))?;

        Ok(Self { jobs, cancel })
    }
}

/// Transport for one physical board
pub struct UsbTransport {
    handle: Arc<DeviceHandle<Context>>,
    endpoints: Endpoints,
    interface: u8,
    serial_index: Option<u8>,
    bus_position: (u8, u8),
    kernel_driver_detached: bool,
    read: EndpointWorker,
    write: EndpointWorker,
}

impl UsbTransport {
    /// Take ownership of an opened board and start its endpoint threads
    pub fn new(board: OpenedBoard, timing: TransferTiming) -> std::io::Result<Arc<Self>> {
        let OpenedBoard {
            handle,
            endpoints,
            interface,
            serial_index,
            bus_position,
            kernel_driver_detached,
        } = board;
        let handle = Arc::new(handle);
        let label = format!("brl-{}.{}", bus_position.0, bus_position.1);

        let read = EndpointWorker::spawn(Direction::In, handle.clone(), timing, &label)?;
        let write = EndpointWorker::spawn(Direction::Out, handle.clone(), timing, &label)?;

        Ok(Arc::new(Self {
            handle,
            endpoints,
            interface,
            serial_index,
            bus_position,
            kernel_driver_detached,
            read,
            write,
        }))
    }

    fn worker(&self, direction: Direction) -> &EndpointWorker {
        match direction {
            Direction::In => &self.read,
            Direction::Out => &self.write,
        }
    }
}

impl Transport for UsbTransport {
    fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    fn read_serial_string(&self) -> Result<String, TransportFailure> {
        let index = self
            .serial_index
            .ok_or_else(|| TransportFailure::Other("no serial number descriptor".to_string()))?;
        self.handle
            .read_string_descriptor_ascii(index)
            .map_err(map_rusb_error)
    }

    fn submit(&self, request: TransferRequest, on_complete: CompletionFn) -> Result<(), SubmitError> {
        let worker = self.worker(request.direction);
        // A cancel aimed at the previous request must not hit this one
        worker.cancel.store(false, Ordering::Release);

        match worker.jobs.try_send(Job {
            request,
            on_complete,
        }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => Err(SubmitError {
                buffer: job.request.buffer,
                failure: TransportFailure::Busy,
            }),
            Err(TrySendError::Closed(job)) => Err(SubmitError {
                buffer: job.request.buffer,
                failure: TransportFailure::NoDevice,
            }),
        }
    }

    fn cancel(&self, direction: Direction) {
        trace!(
            "Cancel requested on {:?} {}",
            self.bus_position, direction
        );
        self.worker(direction).cancel.store(true, Ordering::Release);
    }

    fn bus_position(&self) -> Option<(u8, u8)> {
        Some(self.bus_position)
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        // Endpoint threads exit on their own once the job senders are gone;
        // joining here could run on one of those threads.
        if let Err(e) = self.handle.release_interface(self.interface) {
            debug!("Failed to release interface {}: {}", self.interface, e);
        }
        if self.kernel_driver_detached
            && let Err(e) = self.handle.attach_kernel_driver(self.interface)
        {
            debug!(
                "Could not reattach kernel driver to interface {}: {}",
                self.interface, e
            );
        }
    }
}

fn run_endpoint(
    direction: Direction,
    handle: Arc<DeviceHandle<Context>>,
    queue: Receiver<Job>,
    cancel: Arc<AtomicBool>,
    timing: TransferTiming,
) {
    while let Ok(Job {
        request,
        on_complete,
    }) = queue.recv_blocking()
    {
        let outcome = perform(&handle, request, &cancel, timing);
        on_complete(outcome);
    }
    debug!("{} endpoint thread stopped", direction);
}

/// Run one bulk request to completion, cancellation or failure
fn perform(
    handle: &DeviceHandle<Context>,
    request: TransferRequest,
    cancel: &AtomicBool,
    timing: TransferTiming,
) -> TransferOutcome {
    let TransferRequest {
        direction,
        endpoint,
        mut buffer,
        length,
    } = request;
    let length = length.min(buffer.len());
    let started = Instant::now();

    loop {
        if cancel.load(Ordering::Acquire) {
            return TransferOutcome::cancelled(buffer);
        }

        // Requests never exceed one max packet, so a timed-out OUT slice
        // has sent nothing and is safe to retry
        let result = match direction {
            Direction::In => handle.read_bulk(endpoint, &mut buffer[..length], timing.slice_timeout),
            Direction::Out => handle.write_bulk(endpoint, &buffer[..length], timing.slice_timeout),
        };

        match result {
            Ok(actual_length) => {
                return TransferOutcome {
                    status: TransferStatus::Completed,
                    buffer,
                    actual_length,
                };
            }
            Err(rusb::Error::Timeout) => {
                if let Some(limit) = timing.transfer_timeout
                    && started.elapsed() >= limit
                {
                    return TransferOutcome {
                        status: TransferStatus::TimedOut,
                        buffer,
                        actual_length: 0,
                    };
                }
            }
            Err(e) => {
                warn!("Bulk {} on endpoint {:#04x} failed: {}", direction, endpoint, e);
                return TransferOutcome {
                    status: map_transfer_status(e),
                    buffer,
                    actual_length: 0,
                };
            }
        }
    }
}

/// Map rusb::Error to a submission failure
pub fn map_rusb_error(err: rusb::Error) -> TransportFailure {
    match err {
        rusb::Error::NoDevice | rusb::Error::NotFound => TransportFailure::NoDevice,
        rusb::Error::Busy => TransportFailure::Busy,
        rusb::Error::NoMem => TransportFailure::NoMemory,
        rusb::Error::Pipe => TransportFailure::Pipe,
        rusb::Error::Access => TransportFailure::Access,
        rusb::Error::Timeout => TransportFailure::Timeout,
        rusb::Error::Io => TransportFailure::Io,
        _ => TransportFailure::Other(err.to_string()),
    }
}

/// Map rusb::Error from a running bulk call to a completion status
pub fn map_transfer_status(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::Timeout => TransferStatus::TimedOut,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::Overflow => TransferStatus::Overflow,
        rusb::Error::NoDevice => TransferStatus::NoDevice,
        rusb::Error::Interrupted => TransferStatus::Cancelled,
        _ => TransferStatus::Failed,
    }
}
