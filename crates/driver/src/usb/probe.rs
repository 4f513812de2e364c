//! Board discovery
//!
//! Decides whether a USB device is one of our boards, opens it, claims the
//! bulk interface and locates its endpoint pair.

use crate::usb::transfers::map_rusb_error;
use crate::usb::transport::Endpoints;
use protocol::{BoardError, Direction};
use rusb::{Context, Device, DeviceHandle, TransferType};
use tracing::{debug, warn};

/// Which devices are boards, and which interface carries the bulk pipes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardFilter {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
}

impl Default for BoardFilter {
    fn default() -> Self {
        Self {
            vendor_id: 0x04b4,
            product_id: 0x4000,
            interface: 0,
        }
    }
}

impl BoardFilter {
    /// Check a VID/PID pair against the filter
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }

    /// Check a device's descriptor against the filter
    pub fn matches_device(&self, device: &Device<Context>) -> bool {
        device
            .device_descriptor()
            .map(|desc| self.matches(desc.vendor_id(), desc.product_id()))
            .unwrap_or(false)
    }
}

/// Endpoint as far as discovery cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSummary {
    pub address: u8,
    pub bulk: bool,
    pub max_packet_size: usize,
}

/// Pick the first bulk IN and first bulk OUT endpoint
///
/// Anything else on the interface (interrupt, isochronous, extra bulk pipes)
/// is ignored.
pub fn find_bulk_endpoints(endpoints: &[EndpointSummary]) -> Result<Endpoints, BoardError> {
    let first = |direction: Direction| {
        endpoints
            .iter()
            .find(|ep| ep.bulk && Direction::from_endpoint(ep.address) == direction)
            .ok_or(BoardError::MissingEndpoint(direction))
    };

    let bulk_in = first(Direction::In)?;
    let bulk_out = first(Direction::Out)?;

    Ok(Endpoints {
        in_address: bulk_in.address,
        in_packet_size: bulk_in.max_packet_size,
        out_address: bulk_out.address,
        out_packet_size: bulk_out.max_packet_size,
    })
}

/// An opened board with its interface claimed
pub struct OpenedBoard {
    pub handle: DeviceHandle<Context>,
    pub endpoints: Endpoints,
    pub interface: u8,
    /// String descriptor index of the serial number
    pub serial_index: Option<u8>,
    pub bus_position: (u8, u8),
    /// A kernel driver was detached and should be reattached on close
    pub kernel_driver_detached: bool,
}

/// Open `device`, claim `interface` and find its bulk endpoints
pub fn open_board(device: &Device<Context>, interface: u8) -> Result<OpenedBoard, BoardError> {
    let bus_position = (device.bus_number(), device.address());
    let descriptor = device.device_descriptor().map_err(transport_error)?;

    let handle = device.open().map_err(|e| {
        warn!(
            "Failed to open device at bus {} address {}: {}",
            bus_position.0, bus_position.1, e
        );
        transport_error(e)
    })?;

    let kernel_driver_detached = match handle.kernel_driver_active(interface) {
        Ok(true) => {
            debug!("Detaching kernel driver from interface {}", interface);
            handle.detach_kernel_driver(interface).map_err(transport_error)?;
            true
        }
        Ok(false) => false,
        Err(e) => {
            debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            );
            false
        }
    };

    handle.claim_interface(interface).map_err(|e| {
        warn!("Failed to claim interface {}: {}", interface, e);
        transport_error(e)
    })?;

    let endpoints = match interface_endpoints(device, interface)
        .and_then(|summaries| find_bulk_endpoints(&summaries))
    {
        Ok(endpoints) => endpoints,
        Err(e) => {
            if let Err(release) = handle.release_interface(interface) {
                debug!("Failed to release interface {}: {}", interface, release);
            }
            return Err(e);
        }
    };

    debug!(
        "Board at bus {} address {}: bulk in {:#04x} ({} bytes), bulk out {:#04x} ({} bytes)",
        bus_position.0,
        bus_position.1,
        endpoints.in_address,
        endpoints.in_packet_size,
        endpoints.out_address,
        endpoints.out_packet_size
    );

    Ok(OpenedBoard {
        handle,
        endpoints,
        interface,
        serial_index: descriptor.serial_number_string_index(),
        bus_position,
        kernel_driver_detached,
    })
}

/// Endpoints of the first alternate setting of `interface`
fn interface_endpoints(
    device: &Device<Context>,
    interface: u8,
) -> Result<Vec<EndpointSummary>, BoardError> {
    let config = device.active_config_descriptor().map_err(transport_error)?;

    let setting = config
        .interfaces()
        .find(|iface| iface.number() == interface)
        .and_then(|iface| iface.descriptors().next())
        .ok_or(BoardError::InvalidArgument("interface not present on device"))?;

    Ok(setting
        .endpoint_descriptors()
        .map(|ep| EndpointSummary {
            address: ep.address(),
            bulk: ep.transfer_type() == TransferType::Bulk,
            max_packet_size: usize::from(ep.max_packet_size()),
        })
        .collect())
}

fn transport_error(e: rusb::Error) -> BoardError {
    BoardError::Transport(map_rusb_error(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(address: u8, bulk: bool, size: usize) -> EndpointSummary {
        EndpointSummary {
            address,
            bulk,
            max_packet_size: size,
        }
    }

    #[test]
    fn test_filter_matches_exact_pair() {
        let filter = BoardFilter::default();
        assert!(filter.matches(0x04b4, 0x4000));
        assert!(!filter.matches(0x04b4, 0x4001));
        assert!(!filter.matches(0x1234, 0x4000));
    }

    #[test]
    fn test_first_bulk_pair_wins() {
        let endpoints = [
            ep(0x81, false, 8),
            ep(0x86, true, 512),
            ep(0x02, true, 512),
            ep(0x88, true, 64),
            ep(0x04, true, 64),
        ];

        let found = find_bulk_endpoints(&endpoints).unwrap();
        assert_eq!(found.in_address, 0x86);
        assert_eq!(found.in_packet_size, 512);
        assert_eq!(found.out_address, 0x02);
        assert_eq!(found.out_packet_size, 512);
    }

    #[test]
    fn test_missing_endpoint() {
        assert_eq!(
            find_bulk_endpoints(&[ep(0x86, true, 64)]).unwrap_err(),
            BoardError::MissingEndpoint(Direction::Out)
        );
        assert_eq!(
            find_bulk_endpoints(&[ep(0x81, false, 8), ep(0x02, true, 64)]).unwrap_err(),
            BoardError::MissingEndpoint(Direction::In)
        );
    }
}
