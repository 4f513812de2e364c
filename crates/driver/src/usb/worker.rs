//! USB worker thread
//!
//! Dedicated thread that owns the libusb context. Runs the libusb event
//! loop, turns hot-plug notifications into attach and disconnect, and answers
//! commands from the Tokio runtime over async channels.
//!
//! Bulk transfers do not go through this thread. Sessions submit directly
//! on the registry's boards; each board's transport has its own endpoint
//! threads.

use crate::usb::manager::{BoardManager, ManagerSettings};
use crate::usb::registry::DeviceRegistry;
use common::{UsbCommand, UsbWorker};
use rusb::UsbContext;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound on one libusb event wait, so commands are picked up promptly
const EVENT_POLL: Duration = Duration::from_millis(100);

/// USB worker thread
pub struct UsbWorkerThread {
    manager: BoardManager,
    worker: UsbWorker,
}

impl UsbWorkerThread {
    /// Create the manager and attach every board already plugged in
    pub fn new(
        worker: UsbWorker,
        registry: Arc<DeviceRegistry>,
        settings: ManagerSettings,
    ) -> Result<Self, rusb::Error> {
        let mut manager = BoardManager::new(registry, settings, worker.event_tx.clone())?;
        manager.initialize()?;

        Ok(Self { manager, worker })
    }

    /// Run the event loop until a Shutdown command arrives
    ///
    /// Each turn handles at most one command, waits for libusb events, then
    /// processes forwarded hot-plug events (or rescans without hot-plug).
    /// Every board is disconnected before returning.
    pub fn run(mut self) -> Result<(), rusb::Error> {
        info!("USB worker thread started");

        loop {
            match self.worker.try_recv_command() {
                Some(UsbCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None => {}
            }

            match self.manager.context().handle_events(Some(EVENT_POLL)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(EVENT_POLL);
                }
            }

            self.manager.process_hotplug();
            self.manager.maybe_rescan();
        }

        self.manager.shutdown();
        info!("USB worker thread stopped");
        Ok(())
    }

    /// Handle a command, keeping the thread alive if the handler panics
    fn handle_command(&mut self, cmd: UsbCommand) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: UsbCommand) {
        match cmd {
            UsbCommand::ListBoards { response } => {
                let boards = self.manager.list_boards();
                debug!("Listing {} board(s)", boards.len());
                let _ = response.send(boards);
            }

            UsbCommand::BoardStatus { response } => {
                let _ = response.send(self.manager.statuses());
            }

            UsbCommand::Rescan { response } => {
                let count = match self.manager.rescan() {
                    Ok(count) => count,
                    Err(e) => {
                        warn!("Bus rescan failed: {}", e);
                        self.manager.registry().board_count()
                    }
                };
                let _ = response.send(count);
            }

            UsbCommand::Shutdown => {
                // Handled in the main loop
            }
        }
    }
}

/// Spawn the USB worker thread
///
/// The thread runs until a Shutdown command is received or the libusb
/// context cannot be created.
pub fn spawn_usb_worker(
    worker: UsbWorker,
    registry: Arc<DeviceRegistry>,
    settings: ManagerSettings,
) -> std::io::Result<std::thread::JoinHandle<Result<(), rusb::Error>>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || {
            let worker_thread = UsbWorkerThread::new(worker, registry, settings)?;
            worker_thread.run()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::create_usb_bridge;

    #[test]
    fn test_usb_worker_creation() {
        let (_bridge, worker) = create_usb_bridge();
        let registry = Arc::new(DeviceRegistry::default());

        // May fail without USB access
        match UsbWorkerThread::new(worker, registry, ManagerSettings::default()) {
            Ok(_) => {}
            Err(e) => eprintln!("USB worker creation failed (expected without permissions): {}", e),
        }
    }
}
