//! Encoder/DAC reset maintenance sequence
//!
//! The board needs a write, a one-byte read request and a second write, with
//! settling time between them, to reset its encoders and DACs. Every step is
//! best effort: a failed step is logged and the sequence carries on.

use crate::usb::session::Session;
use protocol::{BoardError, ENCDAC_RESET, ENCDAC_RESET_ACK, USB_MAX_OUT_LEN};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timing and content of the reset sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetSequence {
    /// Settling time before and after each step
    pub step_delay: Duration,
    /// Extra wait when a previous write is still in flight
    pub busy_backoff: Duration,
    /// Byte the reset packet is filled with
    pub fill_byte: u8,
    /// Reset packet length (clamped to the OUT packet size on submission)
    pub packet_len: usize,
    /// First byte the board answers with when the reset took
    pub ack_byte: u8,
}

impl Default for ResetSequence {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(10),
            busy_backoff: Duration::from_millis(10),
            fill_byte: ENCDAC_RESET,
            packet_len: USB_MAX_OUT_LEN,
            ack_byte: ENCDAC_RESET_ACK,
        }
    }
}

/// Result of each reset step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetReport {
    pub first_write: Result<usize, BoardError>,
    pub read_request: Result<usize, BoardError>,
    pub second_write: Result<usize, BoardError>,
    /// `Some(true)` if the board answered with the ack byte, `None` if no
    /// answer could be retrieved
    pub acknowledged: Option<bool>,
}

impl ResetReport {
    /// True if every step was accepted
    pub fn all_steps_accepted(&self) -> bool {
        self.first_write.is_ok() && self.read_request.is_ok() && self.second_write.is_ok()
    }
}

/// Run the write → read → write sequence against the session's board
pub(crate) fn run(session: &Session, sequence: &ResetSequence) -> ResetReport {
    let serial = session.serial();
    let packet = vec![sequence.fill_byte; sequence.packet_len];

    thread::sleep(sequence.step_delay);
    if session.device().write_channel().is_busy() {
        thread::sleep(sequence.busy_backoff);
    }

    let first_write = step(serial, "write", session.write(&packet));
    thread::sleep(sequence.step_delay);

    let read_request = step(serial, "read request", session.request_read(1));
    thread::sleep(sequence.step_delay);

    let second_write = step(serial, "write", session.write(&packet));
    thread::sleep(sequence.step_delay);

    let acknowledged = if read_request.is_ok() {
        let mut answer = [0u8; 1];
        match session.read(&mut answer) {
            Ok(_) if answer[0] == sequence.ack_byte => Some(true),
            Ok(_) => {
                warn!(
                    "Board {} answered reset with {:#04x}, expected {:#04x}",
                    serial, answer[0], sequence.ack_byte
                );
                Some(false)
            }
            Err(e) => {
                debug!("Board {} reset answer not retrieved: {}", serial, e);
                None
            }
        }
    } else {
        None
    };

    info!(
        "Board {} reset sequence finished (acknowledged: {:?})",
        serial, acknowledged
    );

    ResetReport {
        first_write,
        read_request,
        second_write,
        acknowledged,
    }
}

fn step(
    serial: protocol::Serial,
    name: &str,
    result: Result<usize, BoardError>,
) -> Result<usize, BoardError> {
    if let Err(e) = &result {
        warn!("Board {} reset {} failed: {}", serial, name, e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sequence_matches_board() {
        let sequence = ResetSequence::default();
        assert_eq!(sequence.fill_byte, 0x07);
        assert_eq!(sequence.ack_byte, 0x0B);
        assert_eq!(sequence.packet_len, 512);
        assert_eq!(sequence.step_delay, Duration::from_millis(10));
    }

    #[test]
    fn test_report_all_steps_accepted() {
        let report = ResetReport {
            first_write: Ok(64),
            read_request: Ok(1),
            second_write: Err(BoardError::Busy(protocol::Direction::Out)),
            acknowledged: None,
        };
        assert!(!report.all_steps_accepted());
    }
}
