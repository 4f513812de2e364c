//! Async channel bridge between Tokio runtime and USB thread

use async_channel::{Receiver, Sender, bounded};
use protocol::{BoardInfo, BoardStatus, Serial};

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum UsbCommand {
    /// List all attached boards
    ListBoards {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<Vec<BoardInfo>>,
    },

    /// Snapshot the transfer state of every attached board
    BoardStatus {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<Vec<BoardStatus>>,
    },

    /// Re-enumerate the bus and attach any new boards
    Rescan {
        /// Channel to send the number of attached boards back
        response: tokio::sync::oneshot::Sender<usize>,
    },

    /// Disconnect every board and stop the USB thread
    Shutdown,
}

/// Board lifecycle events from the USB thread
#[derive(Debug, Clone)]
pub enum UsbEvent {
    /// Board attached and registered
    BoardAttached {
        /// Board information
        board: BoardInfo,
    },

    /// Board removed from the registry
    BoardDetached {
        /// Serial of the removed board
        serial: Serial,
    },

    /// A matching device could not be attached
    AttachFailed {
        /// Bus number of the device
        bus_number: u8,
        /// Device address on the bus
        device_address: u8,
        /// Why the attach failed
        reason: String,
    },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Ask the USB thread for the attached boards
    pub async fn list_boards(&self) -> crate::Result<Vec<BoardInfo>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send_command(UsbCommand::ListBoards { response: tx })
            .await?;
        rx.await.map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Ask the USB thread for a status snapshot of every board
    pub async fn board_status(&self) -> crate::Result<Vec<BoardStatus>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send_command(UsbCommand::BoardStatus { response: tx })
            .await?;
        rx.await.map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Ask the USB thread to re-enumerate; returns the attached board count
    pub async fn rescan(&self) -> crate::Result<usize> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send_command(UsbCommand::Rescan { response: tx }).await?;
        rx.await.map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Ask the USB thread to disconnect every board and stop
    pub async fn shutdown(&self) -> crate::Result<()> {
        self.send_command(UsbCommand::Shutdown).await
    }
}

/// Handle for USB thread (blocking)
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<UsbCommand>,
    /// Event sender (public for the USB worker thread and device manager)
    pub event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<UsbCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Send an event to Tokio runtime (blocking)
    pub fn send_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(64);
    let (event_tx, event_rx) = bounded(256);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}
