//! Completion dispatch
//!
//! Runs in whatever context the transport completes requests in. It must not
//! block and must not assume the board is still present: requests unlinked by
//! disconnect still complete here after `present` has gone false.

use crate::usb::device::BoardDevice;
use crate::usb::transport::TransferOutcome;
use protocol::Direction;
use tracing::{debug, trace, warn};

/// Record a finished request on its channel and wake any reader
pub(crate) fn dispatch(device: &BoardDevice, direction: Direction, outcome: TransferOutcome) {
    let TransferOutcome {
        status,
        buffer,
        actual_length,
    } = outcome;
    let actual_length = actual_length.min(buffer.len());

    if status.is_success() {
        trace!(
            "Board {} {} completed: {} bytes",
            device.serial(),
            direction,
            actual_length
        );
    } else if status.is_local_cancel() {
        // Unlinks from release/disconnect are expected
        debug!("Board {} {} cancelled", device.serial(), direction);
    } else {
        warn!(
            "Board {} nonzero {} bulk status: {:?}",
            device.serial(),
            direction,
            status
        );
    }

    let channel = device.channel(direction);
    match direction {
        Direction::In => {
            device.deliver_read(&buffer[..actual_length]);
            channel.finish(buffer, actual_length);
            device.wake_waiter();
        }
        Direction::Out => {
            // Writes are fire-and-forget; nobody waits on them
            channel.finish(buffer, actual_length);
        }
    }
}
