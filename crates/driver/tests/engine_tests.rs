//! Transfer engine integration tests
//!
//! Drive the registry, sessions and completion path end to end against the
//! scripted transport:
//! - Read request/retrieve protocol
//! - Single-slot write channel
//! - Registry attach/detach
//! - Disconnect while requests are in flight
//! - Release, reset and ioctl
//!
//! Run with: `cargo test -p driver --test engine_tests`

use driver::usb::mock::MockTransport;
use driver::usb::{DeviceOptions, DeviceRegistry, IoctlCommand, IoctlReply, Session};
use protocol::{BoardError, Direction, Serial, TransferStatus};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn fast_options() -> DeviceOptions {
    DeviceOptions {
        read_wait: Duration::ZERO,
        cancel_settle: Duration::from_millis(1),
        cancel_timeout: Duration::from_millis(50),
        ..DeviceOptions::default()
    }
}

fn board(serial: &str) -> (Arc<MockTransport>, DeviceRegistry, Session) {
    board_with(serial, fast_options())
}

fn board_with(serial: &str, options: DeviceOptions) -> (Arc<MockTransport>, DeviceRegistry, Session) {
    let registry = DeviceRegistry::new(99, options);
    let transport = MockTransport::new(serial);
    let serial = registry.attach(transport.clone()).unwrap();
    let session = Session::open(&registry, serial).unwrap();
    (transport, registry, session)
}

mod read_protocol {
    use super::*;

    #[test]
    fn test_request_complete_retrieve() {
        let (transport, _registry, session) = board("7");
        let payload: Vec<u8> = (0..16).collect();

        assert_eq!(session.request_read(16).unwrap(), 16);
        assert!(transport.complete_read(&payload));

        let mut out = [0u8; 32];
        assert_eq!(session.read(&mut out).unwrap(), 16);
        assert_eq!(&out[..16], payload.as_slice());
        assert_eq!(session.bytes_read(), 16);
        assert!(!session.device().is_read_requested());
    }

    #[test]
    fn test_retrieve_before_completion_is_busy() {
        let (transport, _registry, session) = board("7");
        session.request_read(8).unwrap();

        let mut out = [0u8; 8];
        assert_eq!(
            session.read(&mut out).unwrap_err(),
            BoardError::Busy(Direction::In)
        );

        transport.complete_read(&[1, 2, 3]);
        assert_eq!(session.read(&mut out).unwrap(), 3);
        assert_eq!(&out[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_retrieve_without_request() {
        let (_transport, _registry, session) = board("7");
        let mut out = [0u8; 8];
        assert_eq!(session.read(&mut out).unwrap_err(), BoardError::NotRequested);
    }

    #[test]
    fn test_request_while_busy() {
        let (transport, _registry, session) = board("7");
        session.request_read(8).unwrap();

        assert_eq!(
            session.request_read(8).unwrap_err(),
            BoardError::Busy(Direction::In)
        );
        assert_eq!(transport.submit_count(Direction::In), 1);
    }

    #[test]
    fn test_unretrieved_read_is_discarded() {
        let (transport, _registry, session) = board("7");
        session.request_read(4).unwrap();
        transport.complete_read(&[9, 9, 9, 9]);

        assert_eq!(
            session.request_read(4).unwrap_err(),
            BoardError::AlreadyPending
        );

        // The stale data is gone and the next request goes through
        let mut out = [0u8; 4];
        assert_eq!(session.read(&mut out).unwrap_err(), BoardError::NotRequested);
        assert_eq!(session.request_read(4).unwrap(), 4);
        transport.complete_read(&[1, 2, 3, 4]);
        assert_eq!(session.read(&mut out).unwrap(), 4);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_empty_completion_is_no_data() {
        let (transport, _registry, session) = board("7");
        session.request_read(8).unwrap();
        transport.complete_read(&[]);

        let mut out = [0u8; 8];
        assert_eq!(session.read(&mut out).unwrap_err(), BoardError::NoData);
        assert_eq!(session.read(&mut out).unwrap_err(), BoardError::NotRequested);
    }

    #[test]
    fn test_failed_completion_is_no_data() {
        let (transport, _registry, session) = board("7");
        session.request_read(8).unwrap();
        transport.complete(Direction::In, TransferStatus::Stall, &[]);

        let mut out = [0u8; 8];
        assert_eq!(session.read(&mut out).unwrap_err(), BoardError::NoData);
    }

    #[test]
    fn test_request_clamped_to_packet_size() {
        let (transport, _registry, session) = board("7");
        assert_eq!(session.request_read(500).unwrap(), 64);
        assert_eq!(transport.in_flight_length(Direction::In), Some(64));
    }

    #[test]
    fn test_retrieve_into_smaller_buffer() {
        let (transport, _registry, session) = board("7");
        session.request_read(8).unwrap();
        transport.complete_read(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut out = [0u8; 3];
        assert_eq!(session.read(&mut out).unwrap(), 3);
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn test_bounded_wait_picks_up_completion() {
        let options = DeviceOptions {
            read_wait: Duration::from_secs(2),
            ..fast_options()
        };
        let (transport, _registry, session) = board_with("7", options);
        session.request_read(4).unwrap();

        let completer = {
            let transport = transport.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                transport.complete_read(&[4, 3, 2, 1]);
            })
        };

        let mut out = [0u8; 4];
        assert_eq!(session.read(&mut out).unwrap(), 4);
        assert_eq!(out, [4, 3, 2, 1]);
        completer.join().unwrap();
    }

    #[test]
    fn test_bounded_wait_gives_up() {
        let options = DeviceOptions {
            read_wait: Duration::from_millis(20),
            ..fast_options()
        };
        let (_transport, _registry, session) = board_with("7", options);
        session.request_read(4).unwrap();

        let mut out = [0u8; 4];
        assert_eq!(
            session.read(&mut out).unwrap_err(),
            BoardError::Busy(Direction::In)
        );
        assert!(session.device().is_read_requested());
    }
}

mod write_path {
    use super::*;

    #[test]
    fn test_write_busy_until_completion() {
        let (transport, _registry, session) = board("7");
        let payload = [0xa5u8; 64];

        assert_eq!(session.write(&payload).unwrap(), 64);
        assert_eq!(
            session.write(&payload).unwrap_err(),
            BoardError::Busy(Direction::Out)
        );

        assert!(transport.complete_write());
        assert_eq!(session.bytes_written(), 64);
        assert_eq!(session.write(&payload).unwrap(), 64);
        assert_eq!(transport.written().len(), 2);
    }

    #[test]
    fn test_write_reports_clamped_length() {
        let (transport, _registry, session) = board("7");
        let payload = [1u8; 100];

        assert_eq!(session.write(&payload).unwrap(), 64);
        assert_eq!(transport.written()[0], vec![1u8; 64]);
    }

    #[test]
    fn test_zero_length_write() {
        let (_transport, _registry, session) = board("7");
        assert_eq!(
            session.write(&[]).unwrap_err(),
            BoardError::InvalidArgument("zero-length transfer")
        );
    }

    #[test]
    fn test_bytes_written_zero_while_in_flight() {
        let (transport, _registry, session) = board("7");
        session.write(&[1, 2, 3]).unwrap();
        transport.complete_write();
        assert_eq!(session.bytes_written(), 3);

        session.write(&[4]).unwrap();
        assert_eq!(session.bytes_written(), 0);
    }
}

mod registry {
    use super::*;

    #[test]
    fn test_duplicate_serial() {
        let registry = DeviceRegistry::default();
        registry.attach(MockTransport::new("7")).unwrap();

        assert_eq!(
            registry.attach(MockTransport::new("7")).unwrap_err(),
            BoardError::DuplicateSerial(Serial(7))
        );

        assert!(registry.detach(Serial(7)).is_some());
        assert_eq!(registry.attach(MockTransport::new("7")).unwrap(), Serial(7));
    }

    #[test]
    fn test_list_active_tracks_attach_and_detach() {
        let registry = DeviceRegistry::default();
        registry.attach(MockTransport::new("5")).unwrap();
        registry.attach(MockTransport::new("2")).unwrap();

        assert_eq!(registry.list_active(), vec![Serial(2), Serial(5)]);

        registry.detach(Serial(5));
        assert_eq!(registry.list_active(), vec![Serial(2)]);

        // Double detach is a no-op
        assert!(registry.detach(Serial(5)).is_none());
        assert_eq!(registry.board_count(), 1);
    }

    #[test]
    fn test_statuses_reflect_sessions() {
        let (transport, registry, session) = board("3");
        session.write(&[1, 2]).unwrap();

        let statuses = registry.statuses();
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].session_open);
        assert!(statuses[0].write_busy);

        transport.complete_write();
        let statuses = registry.statuses();
        assert!(!statuses[0].write_busy);
        assert_eq!(statuses[0].bytes_written, 2);
    }

    #[test]
    fn test_board_info() {
        let (_transport, registry, _session) = board("3");
        let boards = registry.boards();

        assert_eq!(boards.len(), 1);
        assert_eq!(boards[0].serial, Serial(3));
        assert_eq!(boards[0].in_endpoint, 0x86);
        assert_eq!(boards[0].out_endpoint, 0x02);
        assert_eq!(boards[0].bus_number, None);
    }
}

mod disconnect {
    use super::*;

    #[test]
    fn test_disconnect_with_pending_read() {
        let (transport, registry, session) = board("7");
        session.request_read(8).unwrap();
        let device = session.device().clone();

        assert!(registry.disconnect(Serial(7)).is_some());

        assert_eq!(transport.cancel_count(Direction::In), 1);
        assert!(!device.read_channel().is_busy());
        assert_eq!(device.read_channel().counters(), (1, 1));
        assert_eq!(device.bytes_read(), 0);
        assert!(registry.list_active().is_empty());

        let mut out = [0u8; 8];
        assert_eq!(session.read(&mut out).unwrap_err(), BoardError::Disconnected);
    }

    #[test]
    fn test_deferred_cancellation_drains() {
        let (transport, registry, session) = board("7");
        transport.set_deferred_cancel(true);
        session.request_read(8).unwrap();
        let device = session.device().clone();

        registry.disconnect(Serial(7));
        assert!(device.read_channel().is_busy());

        assert!(transport.complete(Direction::In, TransferStatus::Cancelled, &[]));
        assert!(!device.read_channel().is_busy());
        assert_eq!(device.read_channel().counters(), (1, 1));
    }

    #[test]
    fn test_every_submission_after_disconnect_fails() {
        let (_transport, registry, session) = board("7");
        registry.disconnect(Serial(7));

        for _ in 0..3 {
            assert_eq!(session.write(&[1]).unwrap_err(), BoardError::Disconnected);
            assert_eq!(
                session.request_read(4).unwrap_err(),
                BoardError::Disconnected
            );
        }
    }

    #[test]
    fn test_disconnect_wakes_waiting_reader() {
        let options = DeviceOptions {
            read_wait: Duration::from_secs(5),
            ..fast_options()
        };
        let (transport, registry, session) = board_with("7", options);
        transport.set_deferred_cancel(true);
        session.request_read(4).unwrap();

        let registry = Arc::new(registry);
        let unplug = {
            let registry = registry.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                registry.disconnect(Serial(7));
            })
        };

        let mut out = [0u8; 4];
        assert_eq!(session.read(&mut out).unwrap_err(), BoardError::Disconnected);
        unplug.join().unwrap();
    }

    #[test]
    fn test_open_after_disconnect() {
        let (_transport, registry, _session) = board("7");
        registry.disconnect(Serial(7));
        assert_eq!(
            Session::open(&registry, Serial(7)).unwrap_err(),
            BoardError::NotFound
        );
    }
}

mod release {
    use super::*;

    #[test]
    fn test_release_quiesces_both_channels() {
        let (transport, _registry, session) = board("7");
        session.request_read(8).unwrap();
        session.write(&[1, 2, 3]).unwrap();
        let device = session.device().clone();

        session.release();

        assert!(!device.read_channel().is_busy());
        assert!(!device.write_channel().is_busy());
        assert!(!device.is_session_open());
        assert!(!device.is_read_requested());
        assert_eq!(transport.cancel_count(Direction::In), 1);
        assert_eq!(transport.cancel_count(Direction::Out), 1);
    }

    #[test]
    fn test_release_twice() {
        let (transport, _registry, session) = board("7");
        session.request_read(8).unwrap();

        session.release();
        session.release();

        assert_eq!(transport.cancel_count(Direction::In), 1);
    }

    #[test]
    fn test_release_with_idle_channels_does_not_cancel() {
        let (transport, _registry, session) = board("7");
        session.release();
        assert_eq!(transport.cancel_count(Direction::In), 0);
        assert_eq!(transport.cancel_count(Direction::Out), 0);
    }

    #[test]
    fn test_release_returns_when_cancel_never_lands() {
        let (transport, _registry, session) = board("7");
        transport.set_deferred_cancel(true);
        session.write(&[1]).unwrap();

        session.release();
        assert!(session.device().write_channel().is_busy());

        transport.complete(Direction::Out, TransferStatus::Cancelled, &[]);
        assert!(!session.device().write_channel().is_busy());
    }

    #[test]
    fn test_drop_releases() {
        let (transport, registry, session) = board("7");
        session.request_read(8).unwrap();
        drop(session);

        let device = registry.get(Serial(7)).unwrap();
        assert!(!device.is_session_open());
        assert!(!device.read_channel().is_busy());
        assert_eq!(transport.cancel_count(Direction::In), 1);
    }

    #[test]
    fn test_reopen_after_release() {
        let (transport, registry, session) = board("7");
        session.release();

        let session = Session::open(&registry, Serial(7)).unwrap();
        session.write(&[5]).unwrap();
        assert!(transport.is_in_flight(Direction::Out));
    }
}

mod maintenance {
    use super::*;

    #[test]
    fn test_reset_sequence_acknowledged() {
        let (transport, _registry, session) = board("7");
        transport.set_auto_complete(true, &[0x0b]);

        let report = session.reset().unwrap();

        assert!(report.all_steps_accepted());
        assert_eq!(report.first_write, Ok(64));
        assert_eq!(report.read_request, Ok(1));
        assert_eq!(report.acknowledged, Some(true));

        let written = transport.written();
        assert_eq!(written.len(), 2);
        assert!(written.iter().all(|packet| packet == &vec![0x07u8; 64]));
    }

    #[test]
    fn test_reset_unexpected_answer() {
        let (transport, _registry, session) = board("7");
        transport.set_auto_complete(true, &[0x00]);

        let report = session.reset().unwrap();
        assert_eq!(report.acknowledged, Some(false));
    }

    #[test]
    fn test_reset_is_best_effort() {
        let (_transport, _registry, session) = board("7");

        // Nothing completes, so the second write finds the channel busy
        let report = session.reset().unwrap();

        assert!(report.first_write.is_ok());
        assert!(report.read_request.is_ok());
        assert_eq!(
            report.second_write,
            Err(BoardError::Busy(Direction::Out))
        );
        assert_eq!(report.acknowledged, None);
    }

    #[test]
    fn test_raw_ioctls() {
        let (transport, _registry, session) = board("7");

        let command = IoctlCommand::from_raw(11, 8).unwrap();
        assert_eq!(session.ioctl(command).unwrap(), IoctlReply::Accepted(8));
        transport.complete_read(&[1, 2]);

        let command = IoctlCommand::from_raw(12, 0).unwrap();
        assert_eq!(session.ioctl(command).unwrap(), IoctlReply::Count(2));

        assert_eq!(
            IoctlCommand::from_raw(0x4004, 0).unwrap_err(),
            BoardError::InvalidArgument("unknown ioctl")
        );
    }
}
