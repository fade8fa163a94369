//! Narrow USB access capability interface
//!
//! The engine never talks to a transport directly; everything it needs
//! from the host is behind [`UsbAccess`]: enumerate, read hub descriptors
//! and port status, set/clear hub port features, driver-level reset, and
//! the kernel authorization toggle. The Linux backend implements it over
//! rusb and sysfs; tests use the deterministic fake in
//! [`crate::test_utils`].

use crate::addr::PortAddress;
use crate::error::Result;
use bitflags::bitflags;
use std::sync::Arc;
use std::time::Duration;

/// USB device class code for hubs.
pub const CLASS_HUB: u8 = 0x09;

/// Hub class port feature selectors (USB 2.0 table 11-17).
pub const PORT_FEAT_ENABLE: u16 = 1;
pub const PORT_FEAT_RESET: u16 = 4;
pub const PORT_FEAT_POWER: u16 = 8;

bitflags! {
    /// Raw wPortStatus bits (USB 2.0 table 11-21).
    ///
    /// USB 3 hubs repurpose bit 9 as the port power bit; the topology
    /// layer picks the right one based on the hub's USB level.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RawPortStatus: u16 {
        const CONNECTION  = 0x0001;
        const ENABLE      = 0x0002;
        const SUSPEND     = 0x0004;
        const OVERCURRENT = 0x0008;
        const RESET       = 0x0010;
        const POWER       = 0x0100;
        const POWER_SS    = 0x0200;
    }
}

/// The interesting prefix of the hub class descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubDescriptor {
    /// bNbrPorts
    pub num_ports: u8,
    /// wHubCharacteristics; bits 1:0 carry the power switching mode
    pub characteristics: u16,
}

/// One enumerated device, detached from any live handle.
///
/// Snapshots hold these as plain data; backends re-locate the actual
/// device by `(bus, address)` when a primitive runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDevice {
    pub bus: u8,
    /// Device address on the bus (re-assigned on every enumeration).
    pub address: u8,
    /// Hub port chain from the root; empty for root hubs.
    pub port_chain: Vec<u8>,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    /// Major of bcdUSB: 1, 2 or 3.
    pub usb_level: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    /// Kernel driver names bound to the device's interfaces.
    pub interfaces: Vec<String>,
}

impl RawDevice {
    pub fn is_hub(&self) -> bool {
        self.class == CLASS_HUB
    }

    /// The device's topological address; fails only on out-of-spec
    /// enumeration data (zero bus or port number).
    pub fn port_address(&self) -> Result<PortAddress> {
        PortAddress::new(self.bus, self.port_chain.clone())
    }
}

/// Host USB access capability.
///
/// All control-transfer style calls are bounded by the given timeout and
/// surface expiry as [`crate::ControlError::Timeout`].
pub trait UsbAccess: Send + Sync {
    /// Enumerate every visible device. A device that fails to describe
    /// itself mid-enumeration is skipped, not fatal.
    fn enumerate(&self) -> Result<Vec<RawDevice>>;

    /// Read the hub class descriptor of an enumerated hub.
    fn hub_descriptor(&self, hub: &RawDevice, timeout: Duration) -> Result<HubDescriptor>;

    /// Read one port's status bits from its hub. Ports count from 1.
    fn port_status(&self, hub: &RawDevice, port: u8, timeout: Duration) -> Result<RawPortStatus>;

    /// SET_FEATURE on a hub port.
    fn set_port_feature(
        &self,
        hub: &RawDevice,
        port: u8,
        feature: u16,
        timeout: Duration,
    ) -> Result<()>;

    /// CLEAR_FEATURE on a hub port.
    fn clear_port_feature(
        &self,
        hub: &RawDevice,
        port: u8,
        feature: u16,
        timeout: Duration,
    ) -> Result<()>;

    /// Ask the bound driver to re-initialize the device without a power
    /// cycle.
    fn reset_device(&self, device: &RawDevice, timeout: Duration) -> Result<()>;

    /// Toggle the kernel's device-model authorization for the device.
    /// Works on any host that exposes it, independent of hub power
    /// switching.
    fn set_authorized(&self, device: &RawDevice, authorized: bool) -> Result<()>;

    /// Serial tty names per port address (serial-over-USB adapters).
    fn serial_ports(&self) -> Vec<(PortAddress, String)>;
}

impl<T: UsbAccess + ?Sized> UsbAccess for Arc<T> {
    fn enumerate(&self) -> Result<Vec<RawDevice>> {
        (**self).enumerate()
    }
    fn hub_descriptor(&self, hub: &RawDevice, timeout: Duration) -> Result<HubDescriptor> {
        (**self).hub_descriptor(hub, timeout)
    }
    fn port_status(&self, hub: &RawDevice, port: u8, timeout: Duration) -> Result<RawPortStatus> {
        (**self).port_status(hub, port, timeout)
    }
    fn set_port_feature(
        &self,
        hub: &RawDevice,
        port: u8,
        feature: u16,
        timeout: Duration,
    ) -> Result<()> {
        (**self).set_port_feature(hub, port, feature, timeout)
    }
    fn clear_port_feature(
        &self,
        hub: &RawDevice,
        port: u8,
        feature: u16,
        timeout: Duration,
    ) -> Result<()> {
        (**self).clear_port_feature(hub, port, feature, timeout)
    }
    fn reset_device(&self, device: &RawDevice, timeout: Duration) -> Result<()> {
        (**self).reset_device(device, timeout)
    }
    fn set_authorized(&self, device: &RawDevice, authorized: bool) -> Result<()> {
        (**self).set_authorized(device, authorized)
    }
    fn serial_ports(&self) -> Vec<(PortAddress, String)> {
        (**self).serial_ports()
    }
}

impl<T: UsbAccess + ?Sized> UsbAccess for Box<T> {
    fn enumerate(&self) -> Result<Vec<RawDevice>> {
        (**self).enumerate()
    }
    fn hub_descriptor(&self, hub: &RawDevice, timeout: Duration) -> Result<HubDescriptor> {
        (**self).hub_descriptor(hub, timeout)
    }
    fn port_status(&self, hub: &RawDevice, port: u8, timeout: Duration) -> Result<RawPortStatus> {
        (**self).port_status(hub, port, timeout)
    }
    fn set_port_feature(
        &self,
        hub: &RawDevice,
        port: u8,
        feature: u16,
        timeout: Duration,
    ) -> Result<()> {
        (**self).set_port_feature(hub, port, feature, timeout)
    }
    fn clear_port_feature(
        &self,
        hub: &RawDevice,
        port: u8,
        feature: u16,
        timeout: Duration,
    ) -> Result<()> {
        (**self).clear_port_feature(hub, port, feature, timeout)
    }
    fn reset_device(&self, device: &RawDevice, timeout: Duration) -> Result<()> {
        (**self).reset_device(device, timeout)
    }
    fn set_authorized(&self, device: &RawDevice, authorized: bool) -> Result<()> {
        (**self).set_authorized(device, authorized)
    }
    fn serial_ports(&self) -> Vec<(PortAddress, String)> {
        (**self).serial_ports()
    }
}
