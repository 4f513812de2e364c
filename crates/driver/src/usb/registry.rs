//! Board registry
//!
//! Fixed-capacity table mapping serial number to [`BoardDevice`]. Slot `n`
//! holds the board whose serial is `n`, so listing walks the table in
//! ascending serial order. One registry is shared (behind an `Arc`) by the
//! device manager, the USB worker and every session.
//!
//! Mutation is a short critical section on the table only. Per-board work
//! (reading the serial, tearing a board down) happens outside it.

use crate::usb::device::{BoardDevice, DeviceOptions};
use crate::usb::lock;
use crate::usb::transport::Transport;
use protocol::{BoardError, BoardInfo, BoardStatus, MAX_BOARDS, Serial};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Registry of attached boards
pub struct DeviceRegistry {
    slots: Mutex<Vec<Option<Arc<BoardDevice>>>>,
    live: AtomicUsize,
    options: DeviceOptions,
}

impl DeviceRegistry {
    /// Registry with `capacity` slots; boards get `options`
    pub fn new(capacity: usize, options: DeviceOptions) -> Self {
        Self {
            slots: Mutex::new(vec![None; capacity]),
            live: AtomicUsize::new(0),
            options,
        }
    }

    /// Number of slots (serials must be below this)
    pub fn capacity(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Number of attached boards
    pub fn board_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.board_count() == 0
    }

    /// Register a newly discovered board
    ///
    /// Reads and parses the serial number through the transport, then claims
    /// the slot for it. Fails with `InvalidSerial` if the descriptor is
    /// unreadable or not numeric, `SerialOutOfRange` if it does not fit, and
    /// `DuplicateSerial` if the slot is already active.
    pub fn attach(&self, transport: Arc<dyn Transport>) -> Result<Serial, BoardError> {
        let raw = transport
            .read_serial_string()
            .map_err(|failure| BoardError::InvalidSerial {
                raw: String::new(),
                reason: format!("unreadable serial descriptor: {}", failure),
            })?;
        let serial = Serial::parse(&raw)?;

        let device = BoardDevice::new(serial, transport, self.options.clone());

        let mut slots = lock(&self.slots);
        let capacity = slots.len();
        let slot = slots
            .get_mut(serial.index())
            .ok_or(BoardError::SerialOutOfRange { serial, capacity })?;
        if slot.is_some() {
            return Err(BoardError::DuplicateSerial(serial));
        }
        *slot = Some(device);
        let count = self.live.fetch_add(1, Ordering::AcqRel) + 1;
        drop(slots);

        info!("USB board {} attached ({} active)", serial, count);
        Ok(serial)
    }

    /// Deactivate the slot for `serial`
    ///
    /// Returns the removed board, or `None` if no board was active there.
    /// Detaching twice is tolerated.
    pub fn detach(&self, serial: Serial) -> Option<Arc<BoardDevice>> {
        let removed = lock(&self.slots)
            .get_mut(serial.index())
            .and_then(Option::take);

        match removed {
            Some(device) => {
                let count = self.live.fetch_sub(1, Ordering::AcqRel) - 1;
                info!("USB board {} detached ({} active)", serial, count);
                Some(device)
            }
            None => {
                debug!("Detach of inactive board {} ignored", serial);
                None
            }
        }
    }

    /// Detach the single active board whose serial can no longer be read
    ///
    /// Used when a board disappears and its bus position was never mapped
    /// to a serial. Serial reads need the bus, so they run outside the table
    /// lock; a board that vanished is the one whose read now fails.
    pub fn detach_unreadable(&self) -> Option<Arc<BoardDevice>> {
        let gone = self.find_unreadable()?;
        self.remove(&gone)
    }

    /// Full teardown of the board whose serial can no longer be read:
    /// disconnect, then deregister
    pub fn disconnect_unreadable(&self) -> Option<Arc<BoardDevice>> {
        let gone = self.find_unreadable()?;
        gone.disconnect();
        self.remove(&gone)
    }

    fn find_unreadable(&self) -> Option<Arc<BoardDevice>> {
        let candidates: Vec<Arc<BoardDevice>> = lock(&self.slots).iter().flatten().cloned().collect();

        candidates
            .into_iter()
            .find(|device| device.transport().read_serial_string().is_err())
    }

    /// Drop `gone` from its slot, unless the slot was reused meanwhile
    fn remove(&self, gone: &Arc<BoardDevice>) -> Option<Arc<BoardDevice>> {
        let removed = {
            let mut slots = lock(&self.slots);
            match slots.get_mut(gone.serial().index()) {
                Some(slot) if slot.as_ref().is_some_and(|d| Arc::ptr_eq(d, gone)) => slot.take(),
                _ => None,
            }
        };

        if removed.is_some() {
            let count = self.live.fetch_sub(1, Ordering::AcqRel) - 1;
            info!(
                "USB board {} removed from system ({} active)",
                gone.serial(),
                count
            );
        }
        removed
    }

    /// Full teardown of one board: disconnect, then deregister
    pub fn disconnect(&self, serial: Serial) -> Option<Arc<BoardDevice>> {
        let device = lock(&self.slots).get(serial.index())?.clone()?;
        device.disconnect();
        self.detach(serial)
    }

    /// Tear down every attached board (driver unload)
    pub fn disconnect_all(&self) -> usize {
        let serials = self.list_active();
        let mut count = 0;
        for serial in serials {
            if self.disconnect(serial).is_some() {
                count += 1;
            }
        }
        if count > 0 {
            info!("Disconnected {} board(s)", count);
        }
        count
    }

    /// Look up an attached, present board
    pub fn get(&self, serial: Serial) -> Option<Arc<BoardDevice>> {
        let device = lock(&self.slots).get(serial.index())?.clone()?;
        if !device.is_present() {
            warn!("Board {} is being torn down", serial);
            return None;
        }
        Some(device)
    }

    /// Serials of all attached boards, ascending
    pub fn list_active(&self) -> Vec<Serial> {
        lock(&self.slots)
            .iter()
            .flatten()
            .map(|device| device.serial())
            .collect()
    }

    /// Board information for every attached board
    pub fn boards(&self) -> Vec<BoardInfo> {
        self.devices().iter().map(|device| device.info()).collect()
    }

    /// Transfer state of every attached board
    pub fn statuses(&self) -> Vec<BoardStatus> {
        self.devices().iter().map(|device| device.status()).collect()
    }

    fn devices(&self) -> Vec<Arc<BoardDevice>> {
        lock(&self.slots).iter().flatten().cloned().collect()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(MAX_BOARDS, DeviceOptions::default())
    }
}
