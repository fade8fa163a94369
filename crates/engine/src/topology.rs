//! Topology snapshotting
//!
//! One capture is a single point-in-time read of the host: every bus,
//! every hub's ports, every enumerated device. The result is immutable;
//! a command's effect is observed by taking a new snapshot.

use crate::addr::PortAddress;
use crate::backend::{HubDescriptor, RawDevice, RawPortStatus, UsbAccess};
use crate::capability::CapabilityMask;
use crate::error::Result;
use bitflags::bitflags;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

bitflags! {
    /// Decoded per-port status.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u8 {
        const POWERED   = 1 << 0;
        const CONNECTED = 1 << 1;
        const ENABLED   = 1 << 2;
        const RESETTING = 1 << 3;
        const SUSPENDED = 1 << 4;
    }
}

impl StatusFlags {
    /// Decode raw wPortStatus bits. USB 3 hubs report port power in a
    /// different bit than USB 1/2 hubs.
    pub fn from_raw(raw: RawPortStatus, usb_level: u8) -> Self {
        let mut flags = StatusFlags::empty();
        let powered = if usb_level >= 3 {
            raw.contains(RawPortStatus::POWER_SS)
        } else {
            raw.contains(RawPortStatus::POWER)
        };
        if powered {
            flags |= StatusFlags::POWERED;
        }
        if raw.contains(RawPortStatus::CONNECTION) {
            flags |= StatusFlags::CONNECTED;
        }
        if raw.contains(RawPortStatus::ENABLE) {
            flags |= StatusFlags::ENABLED;
        }
        if raw.contains(RawPortStatus::RESET) {
            flags |= StatusFlags::RESETTING;
        }
        if raw.contains(RawPortStatus::SUSPEND) {
            flags |= StatusFlags::SUSPENDED;
        }
        flags
    }

    /// Single-letter rendering, `PCERS` order.
    pub fn letters(&self) -> String {
        let mut out = String::new();
        for (bit, letter) in [
            (StatusFlags::POWERED, 'P'),
            (StatusFlags::CONNECTED, 'C'),
            (StatusFlags::ENABLED, 'E'),
            (StatusFlags::RESETTING, 'R'),
            (StatusFlags::SUSPENDED, 'S'),
        ] {
            if self.contains(bit) {
                out.push(letter);
            }
        }
        out
    }
}

/// Descriptor data of a device enumerated at a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    /// Major of bcdUSB.
    pub usb_level: u8,
    /// Bus device address at capture time; transient, informational only.
    pub device_address: u8,
    /// Serial tty names bound to the device.
    pub tty_names: Vec<String>,
    /// Kernel driver names bound to the device's interfaces.
    pub interfaces: Vec<String>,
}

impl DeviceInfo {
    fn from_raw(raw: &RawDevice, tty_names: Vec<String>) -> Self {
        Self {
            vendor_id: raw.vendor_id,
            product_id: raw.product_id,
            manufacturer: raw.manufacturer.clone(),
            product: raw.product.clone(),
            serial: raw.serial.clone(),
            usb_level: raw.usb_level,
            device_address: raw.address,
            tty_names,
            interfaces: raw.interfaces.clone(),
        }
    }
}

/// Hub descriptor data kept on hub nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubInfo {
    pub num_ports: u8,
    pub characteristics: u16,
}

impl From<HubDescriptor> for HubInfo {
    fn from(d: HubDescriptor) -> Self {
        Self {
            num_ports: d.num_ports,
            characteristics: d.characteristics,
        }
    }
}

/// One point in the topology tree. Never mutated after capture.
#[derive(Debug, Clone)]
pub struct TopologyNode {
    pub address: PortAddress,
    pub flags: StatusFlags,
    /// The device enumerated at this chain, if any.
    pub device: Option<RawDevice>,
    pub tty_names: Vec<String>,
    /// Present when the device here is a hub whose descriptor was read.
    pub hub: Option<HubInfo>,
    /// Capability of this point, derived from the enclosing hub.
    pub capability: CapabilityMask,
}

impl TopologyNode {
    fn empty(address: PortAddress) -> Self {
        Self {
            address,
            flags: StatusFlags::empty(),
            device: None,
            tty_names: Vec::new(),
            hub: None,
            capability: CapabilityMask::none(),
        }
    }
}

/// Immutable tree of everything discovered in one enumeration pass,
/// keyed by address so iteration is already in listing order.
#[derive(Debug)]
pub struct TopologySnapshot {
    nodes: BTreeMap<PortAddress, TopologyNode>,
    taken_at: Instant,
}

impl TopologySnapshot {
    /// Enumerate the host and build the tree. Individual descriptor or
    /// port-status read failures degrade the affected node (unknown
    /// device, `RESETTING` status) instead of failing the capture; only
    /// a failed enumeration itself is an error.
    pub fn capture<B: UsbAccess + ?Sized>(backend: &B, timeout: Duration) -> Result<Self> {
        let mut nodes: BTreeMap<PortAddress, TopologyNode> = BTreeMap::new();

        for device in backend.enumerate()? {
            let address = match device.port_address() {
                Ok(address) => address,
                Err(err) => {
                    tracing::debug!(%err, "skipping device with out-of-spec port chain");
                    continue;
                }
            };
            let node = nodes
                .entry(address.clone())
                .or_insert_with(|| TopologyNode::empty(address));
            node.device = Some(device);
        }

        let hubs: Vec<(PortAddress, RawDevice)> = nodes
            .values()
            .filter_map(|n| {
                let device = n.device.as_ref()?;
                device.is_hub().then(|| (n.address.clone(), device.clone()))
            })
            .collect();

        for (hub_addr, hub_dev) in hubs {
            let descriptor = match backend.hub_descriptor(&hub_dev, timeout) {
                Ok(d) => d,
                Err(err) => {
                    tracing::debug!(hub = %hub_addr, %err, "hub descriptor read failed");
                    continue;
                }
            };
            let mask = CapabilityMask::from_hub(descriptor.characteristics, hub_dev.usb_level);
            if let Some(node) = nodes.get_mut(&hub_addr) {
                node.hub = Some(descriptor.into());
            }
            for port in 1..=descriptor.num_ports {
                let child_addr = hub_addr.child(port);
                let flags = match backend.port_status(&hub_dev, port, timeout) {
                    Ok(raw) => StatusFlags::from_raw(raw, hub_dev.usb_level),
                    // device mid-enumeration; degrade, don't abort
                    Err(err) => {
                        tracing::debug!(port = %child_addr, %err, "port status read failed");
                        StatusFlags::RESETTING
                    }
                };
                let node = nodes
                    .entry(child_addr.clone())
                    .or_insert_with(|| TopologyNode::empty(child_addr));
                node.flags = flags;
                node.capability = mask;
            }
        }

        for (address, name) in backend.serial_ports() {
            if let Some(node) = nodes.get_mut(&address) {
                node.tty_names.push(name);
            }
        }
        for node in nodes.values_mut() {
            node.tty_names.sort();
        }

        Ok(Self {
            nodes,
            taken_at: Instant::now(),
        })
    }

    pub fn get(&self, address: &PortAddress) -> Option<&TopologyNode> {
        self.nodes.get(address)
    }

    /// Nodes in depth-first order: buses ascending, ports ascending.
    pub fn nodes(&self) -> impl Iterator<Item = &TopologyNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn age(&self) -> Duration {
        self.taken_at.elapsed()
    }

    /// Public listing view of every node.
    pub fn entries(&self) -> Vec<crate::dispatch::PortEntry> {
        self.nodes
            .values()
            .map(|node| crate::dispatch::PortEntry {
                address: node.address.clone(),
                flags: node.flags,
                device: node
                    .device
                    .as_ref()
                    .map(|raw| DeviceInfo::from_raw(raw, node.tty_names.clone())),
                is_hub: node.device.as_ref().is_some_and(RawDevice::is_hub),
            })
            .collect()
    }
}
