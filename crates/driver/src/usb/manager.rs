//! Board manager
//!
//! Handles board enumeration, hot-plug events and teardown. Runs on the USB
//! worker thread and feeds the shared [`DeviceRegistry`].
//!
//! libusb forbids opening devices from inside a hot-plug callback, so the
//! callback only forwards the event; [`BoardManager::process_hotplug`] does
//! the actual work on the next turn of the worker loop. Without hot-plug
//! support the bus is rescanned on an interval instead.

use crate::usb::probe::{self, BoardFilter};
use crate::usb::registry::DeviceRegistry;
use crate::usb::transfers::{TransferTiming, UsbTransport};
use async_channel::{Receiver, Sender};
use common::UsbEvent;
use protocol::{BoardError, BoardInfo, BoardStatus, Serial};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Discovery settings
#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    pub filter: BoardFilter,
    pub timing: TransferTiming,
    /// Rescan period when libusb has no hot-plug support
    pub rescan_interval: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            filter: BoardFilter::default(),
            timing: TransferTiming::default(),
            rescan_interval: Duration::from_millis(1000),
        }
    }
}

enum HotplugEvent {
    Arrived(Device<Context>),
    Left { bus: u8, address: u8 },
}

/// Board manager
///
/// Owns the libusb context and the bus position to serial mapping.
pub struct BoardManager {
    context: Context,
    registry: Arc<DeviceRegistry>,
    settings: ManagerSettings,
    /// (bus, address) -> serial of every board we attached
    positions: HashMap<(u8, u8), Serial>,
    hotplug_tx: Sender<HotplugEvent>,
    hotplug_rx: Receiver<HotplugEvent>,
    _hotplug_registration: Option<Registration<Context>>,
    event_sender: Sender<UsbEvent>,
    last_rescan: Instant,
}

impl BoardManager {
    /// Create a new board manager
    pub fn new(
        registry: Arc<DeviceRegistry>,
        settings: ManagerSettings,
        event_sender: Sender<UsbEvent>,
    ) -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        let (hotplug_tx, hotplug_rx) = async_channel::bounded(64);

        Ok(Self {
            context,
            registry,
            settings,
            positions: HashMap::new(),
            hotplug_tx,
            hotplug_rx,
            _hotplug_registration: None,
            event_sender,
            last_rescan: Instant::now(),
        })
    }

    /// Enumerate present boards and register hot-plug callbacks
    pub fn initialize(&mut self) -> Result<(), rusb::Error> {
        self.enumerate()?;

        if rusb::has_hotplug() {
            self.register_hotplug()?;
        } else {
            warn!(
                "libusb has no hot-plug support, rescanning every {:?}",
                self.settings.rescan_interval
            );
        }

        info!(
            "Board manager initialized with {} board(s)",
            self.registry.board_count()
        );
        Ok(())
    }

    fn enumerate(&mut self) -> Result<(), rusb::Error> {
        let devices = self.context.devices()?;
        for device in devices.iter() {
            if self.settings.filter.matches_device(&device) {
                self.handle_arrived(device);
            }
        }
        Ok(())
    }

    fn register_hotplug(&mut self) -> Result<(), rusb::Error> {
        let callback = HotplugForwarder {
            events: self.hotplug_tx.clone(),
        };

        let registration = HotplugBuilder::new()
            .vendor_id(self.settings.filter.vendor_id)
            .product_id(self.settings.filter.product_id)
            .enumerate(false) // We already enumerated
            .register(&self.context, Box::new(callback))?;

        self._hotplug_registration = Some(registration);
        debug!("Hot-plug callbacks registered");
        Ok(())
    }

    /// Attach a newly seen board
    pub fn handle_arrived(&mut self, device: Device<Context>) {
        let key = (device.bus_number(), device.address());
        if self.positions.contains_key(&key) {
            return;
        }

        match self.attach(&device) {
            Ok(serial) => {
                self.positions.insert(key, serial);
                if let Some(board) = self.registry.get(serial).map(|d| d.info()) {
                    self.send_event(UsbEvent::BoardAttached { board });
                }
            }
            Err(e) => {
                warn!(
                    "Failed to attach board at bus {} address {}: {}",
                    key.0, key.1, e
                );
                self.send_event(UsbEvent::AttachFailed {
                    bus_number: key.0,
                    device_address: key.1,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn attach(&self, device: &Device<Context>) -> Result<Serial, BoardError> {
        let opened = probe::open_board(device, self.settings.filter.interface)?;
        let transport = UsbTransport::new(opened, self.settings.timing)
            .map_err(|e| BoardError::Transport(protocol::TransportFailure::Other(e.to_string())))?;
        self.registry.attach(transport)
    }

    /// Tear down the board that was at (`bus`, `address`)
    pub fn handle_left(&mut self, bus: u8, address: u8) {
        let serial = match self.positions.remove(&(bus, address)) {
            Some(serial) => self.registry.disconnect(serial).map(|_| serial),
            None => {
                // Position never mapped; find the board that stopped answering
                self.registry.disconnect_unreadable().map(|device| {
                    let serial = device.serial();
                    self.positions.retain(|_, s| *s != serial);
                    serial
                })
            }
        };

        match serial {
            Some(serial) => self.send_event(UsbEvent::BoardDetached { serial }),
            None => debug!(
                "Removal at bus {} address {} matched no board",
                bus, address
            ),
        }
    }

    /// Drain forwarded hot-plug events
    pub fn process_hotplug(&mut self) {
        while let Ok(event) = self.hotplug_rx.try_recv() {
            match event {
                HotplugEvent::Arrived(device) => self.handle_arrived(device),
                HotplugEvent::Left { bus, address } => self.handle_left(bus, address),
            }
        }
    }

    /// Rescan if hot-plug is unavailable and the interval has passed
    pub fn maybe_rescan(&mut self) {
        if self._hotplug_registration.is_some()
            || self.last_rescan.elapsed() < self.settings.rescan_interval
        {
            return;
        }
        if let Err(e) = self.rescan() {
            warn!("Bus rescan failed: {}", e);
        }
    }

    /// Re-enumerate the bus: attach new boards, tear down vanished ones
    ///
    /// Returns the number of attached boards afterwards.
    pub fn rescan(&mut self) -> Result<usize, rusb::Error> {
        self.last_rescan = Instant::now();
        let devices = self.context.devices()?;

        let mut seen = HashSet::new();
        let mut arrived = Vec::new();
        for device in devices.iter() {
            if !self.settings.filter.matches_device(&device) {
                continue;
            }
            let key = (device.bus_number(), device.address());
            seen.insert(key);
            if !self.positions.contains_key(&key) {
                arrived.push(device);
            }
        }

        let gone: Vec<(u8, u8)> = self
            .positions
            .keys()
            .filter(|key| !seen.contains(key))
            .copied()
            .collect();
        for (bus, address) in gone {
            self.handle_left(bus, address);
        }
        for device in arrived {
            self.handle_arrived(device);
        }

        Ok(self.registry.board_count())
    }

    /// Every attached board
    pub fn list_boards(&self) -> Vec<BoardInfo> {
        self.registry.boards()
    }

    /// Transfer state of every attached board
    pub fn statuses(&self) -> Vec<BoardStatus> {
        self.registry.statuses()
    }

    /// Disconnect every board (driver unload)
    pub fn shutdown(&mut self) {
        self._hotplug_registration = None;
        let count = self.registry.disconnect_all();
        self.positions.clear();
        info!("Board manager stopped, {} board(s) disconnected", count);
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    fn send_event(&self, event: UsbEvent) {
        if let Err(e) = self.event_sender.try_send(event) {
            error!("Failed to send board event: {}", e);
        }
    }
}

/// Hot-plug callback handler
///
/// Only forwards events to the worker loop.
struct HotplugForwarder {
    events: Sender<HotplugEvent>,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug: board arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        if let Err(e) = self.events.try_send(HotplugEvent::Arrived(device)) {
            warn!("Dropped hot-plug arrival: {}", e);
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug: board left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let event = HotplugEvent::Left {
            bus: device.bus_number(),
            address: device.address(),
        };
        if let Err(e) = self.events.try_send(event) {
            warn!("Dropped hot-plug removal: {}", e);
        }
    }
}
