//! Deterministic fake USB backend for tests
//!
//! Scripted topology, mutable port power state so commands are visible
//! in the next capture, and a primitive call log with start/finish
//! instants for overlap assertions across crates.

use crate::addr::PortAddress;
use crate::backend::{
    CLASS_HUB, HubDescriptor, PORT_FEAT_ENABLE, PORT_FEAT_POWER, RawDevice, RawPortStatus,
    UsbAccess,
};
use crate::error::{ControlError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One recorded backend actuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimitiveCall {
    SetFeature {
        hub: PortAddress,
        port: u8,
        feature: u16,
    },
    ClearFeature {
        hub: PortAddress,
        port: u8,
        feature: u16,
    },
    Reset {
        address: PortAddress,
    },
    SetAuthorized {
        address: PortAddress,
        authorized: bool,
    },
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub call: PrimitiveCall,
    pub started: Instant,
    pub finished: Instant,
}

impl CallRecord {
    /// True when the two actuation windows intersect.
    pub fn overlaps(&self, other: &CallRecord) -> bool {
        self.started < other.finished && other.started < self.finished
    }
}

struct FakeHub {
    descriptor: HubDescriptor,
    status: HashMap<u8, RawPortStatus>,
    broken_ports: HashSet<u8>,
}

#[derive(Default)]
struct FakeState {
    devices: Vec<RawDevice>,
    hubs: HashMap<PortAddress, FakeHub>,
    ttys: Vec<(PortAddress, String)>,
    calls: Vec<CallRecord>,
    fail_next: Option<ControlError>,
    authorized_off: HashSet<PortAddress>,
}

/// Scripted [`UsbAccess`] implementation.
pub struct FakeUsb {
    state: Mutex<FakeState>,
    /// Sleep inserted into every actuating primitive, outside the
    /// fake's own lock, so engine-level serialization is what the call
    /// log measures.
    primitive_delay: Duration,
}

impl Default for FakeUsb {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a plain (non-hub) scripted device.
pub fn fake_device(bus: u8, chain: &[u8], vendor_id: u16, product_id: u16) -> RawDevice {
    RawDevice {
        bus,
        address: 10 + chain.len() as u8,
        port_chain: chain.to_vec(),
        vendor_id,
        product_id,
        class: 0x00,
        usb_level: 2,
        manufacturer: Some("Fake Labs".to_string()),
        product: Some(format!("Widget {vendor_id:04x}")),
        serial: Some(format!("FW{product_id:04}")),
        interfaces: vec!["fake_driver".to_string()],
    }
}

/// Builder for a scripted hub device.
pub fn fake_hub_device(bus: u8, chain: &[u8], usb_level: u8) -> RawDevice {
    RawDevice {
        bus,
        address: 1 + chain.len() as u8,
        port_chain: chain.to_vec(),
        vendor_id: 0x05e3,
        product_id: 0x0608,
        class: CLASS_HUB,
        usb_level,
        manufacturer: None,
        product: Some("Hub".to_string()),
        serial: None,
        interfaces: vec!["hub".to_string()],
    }
}

impl FakeUsb {
    pub fn new() -> Self {
        Self::with_primitive_delay(Duration::ZERO)
    }

    pub fn with_primitive_delay(primitive_delay: Duration) -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            primitive_delay,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_device(&self, device: RawDevice) {
        self.lock().devices.push(device);
    }

    /// Add a hub device plus its scripted descriptor; all its ports
    /// start powered.
    pub fn add_hub(&self, device: RawDevice, num_ports: u8, characteristics: u16) {
        let address = device.port_address().unwrap();
        let mut status = HashMap::new();
        for port in 1..=num_ports {
            status.insert(port, RawPortStatus::POWER | RawPortStatus::POWER_SS);
        }
        let mut state = self.lock();
        state.devices.push(device);
        state.hubs.insert(
            address,
            FakeHub {
                descriptor: HubDescriptor {
                    num_ports,
                    characteristics,
                },
                status,
                broken_ports: HashSet::new(),
            },
        );
    }

    /// Overwrite one port's raw status bits.
    pub fn set_port_bits(&self, hub: &PortAddress, port: u8, bits: RawPortStatus) {
        if let Some(h) = self.lock().hubs.get_mut(hub) {
            h.status.insert(port, bits);
        }
    }

    /// Make status reads for one port fail (device mid-enumeration).
    pub fn break_port_status(&self, hub: &PortAddress, port: u8) {
        if let Some(h) = self.lock().hubs.get_mut(hub) {
            h.broken_ports.insert(port);
        }
    }

    pub fn add_tty(&self, address: PortAddress, name: &str) {
        self.lock().ttys.push((address, name.to_string()));
    }

    /// The next actuating primitive fails with this error (once).
    pub fn fail_next_primitive(&self, err: ControlError) {
        self.lock().fail_next = Some(err);
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.clone()
    }

    pub fn is_authorized(&self, address: &PortAddress) -> bool {
        !self.lock().authorized_off.contains(address)
    }

    /// Runs one actuation: consume any injected failure, sleep outside
    /// the state lock, apply `effect`, record the window.
    fn actuate(
        &self,
        call: PrimitiveCall,
        effect: impl FnOnce(&mut FakeState),
    ) -> Result<()> {
        let started = Instant::now();
        if let Some(err) = self.lock().fail_next.take() {
            return Err(err);
        }
        if !self.primitive_delay.is_zero() {
            std::thread::sleep(self.primitive_delay);
        }
        let mut state = self.lock();
        effect(&mut state);
        state.calls.push(CallRecord {
            call,
            started,
            finished: Instant::now(),
        });
        Ok(())
    }
}

fn apply_power(state: &mut FakeState, hub: &PortAddress, port: u8, on: bool) {
    let Some(h) = state.hubs.get_mut(hub) else {
        return;
    };
    let ganged = h.descriptor.characteristics & 0x0003 == 0;
    let bits = RawPortStatus::POWER | RawPortStatus::POWER_SS;
    let ports: Vec<u8> = if ganged {
        h.status.keys().copied().collect()
    } else {
        vec![port]
    };
    for p in ports {
        let entry = h.status.entry(p).or_default();
        if on {
            *entry |= bits;
        } else {
            *entry &= !bits;
        }
    }
}

impl UsbAccess for FakeUsb {
    fn enumerate(&self) -> Result<Vec<RawDevice>> {
        Ok(self.lock().devices.clone())
    }

    fn hub_descriptor(&self, hub: &RawDevice, _timeout: Duration) -> Result<HubDescriptor> {
        let address = hub.port_address()?;
        self.lock()
            .hubs
            .get(&address)
            .map(|h| h.descriptor)
            .ok_or_else(|| ControlError::PrimitiveFailure(format!("no scripted hub at {address}")))
    }

    fn port_status(&self, hub: &RawDevice, port: u8, _timeout: Duration) -> Result<RawPortStatus> {
        let address = hub.port_address()?;
        let state = self.lock();
        let h = state
            .hubs
            .get(&address)
            .ok_or_else(|| ControlError::PrimitiveFailure(format!("no scripted hub at {address}")))?;
        if h.broken_ports.contains(&port) {
            return Err(ControlError::PrimitiveFailure("port status read failed".into()));
        }
        Ok(h.status.get(&port).copied().unwrap_or_default())
    }

    fn set_port_feature(
        &self,
        hub: &RawDevice,
        port: u8,
        feature: u16,
        _timeout: Duration,
    ) -> Result<()> {
        let address = hub.port_address()?;
        let call = PrimitiveCall::SetFeature {
            hub: address.clone(),
            port,
            feature,
        };
        self.actuate(call, |state| {
            if feature == PORT_FEAT_POWER {
                apply_power(state, &address, port, true);
            }
        })
    }

    fn clear_port_feature(
        &self,
        hub: &RawDevice,
        port: u8,
        feature: u16,
        _timeout: Duration,
    ) -> Result<()> {
        let address = hub.port_address()?;
        let call = PrimitiveCall::ClearFeature {
            hub: address.clone(),
            port,
            feature,
        };
        self.actuate(call, |state| match feature {
            PORT_FEAT_POWER => apply_power(state, &address, port, false),
            PORT_FEAT_ENABLE => {
                if let Some(h) = state.hubs.get_mut(&address) {
                    let entry = h.status.entry(port).or_default();
                    *entry &= !RawPortStatus::ENABLE;
                }
            }
            _ => {}
        })
    }

    fn reset_device(&self, device: &RawDevice, _timeout: Duration) -> Result<()> {
        let address = device.port_address()?;
        self.actuate(PrimitiveCall::Reset { address }, |_| {})
    }

    fn set_authorized(&self, device: &RawDevice, authorized: bool) -> Result<()> {
        let address = device.port_address()?;
        let call = PrimitiveCall::SetAuthorized {
            address: address.clone(),
            authorized,
        };
        self.actuate(call, |state| {
            if authorized {
                state.authorized_off.remove(&address);
            } else {
                state.authorized_off.insert(address.clone());
            }
        })
    }

    fn serial_ports(&self) -> Vec<(PortAddress, String)> {
        let mut ttys = self.lock().ttys.clone();
        ttys.sort();
        ttys
    }
}
