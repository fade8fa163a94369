//! Linux USB backend
//!
//! rusb for enumeration, descriptors and hub class control transfers;
//! sysfs for the kernel authorization toggle, bound driver names and
//! serial tty discovery. Devices are re-located by `(bus, address)` when
//! a primitive runs, so snapshots never hold live handles.

use crate::addr::PortAddress;
use crate::backend::{HubDescriptor, RawDevice, RawPortStatus, UsbAccess};
use crate::error::{ControlError, Result};
use rusb::{Context, Device, Direction, Recipient, RequestType, UsbContext, request_type};
use std::fs;
use std::path::Path;
use std::time::Duration;

const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";

// standard requests
const REQ_GET_STATUS: u8 = 0x00;
const REQ_CLEAR_FEATURE: u8 = 0x01;
const REQ_SET_FEATURE: u8 = 0x03;
const REQ_GET_DESCRIPTOR: u8 = 0x06;

// hub descriptor types
const DT_HUB: u16 = 0x29;
const DT_SUPERSPEED_HUB: u16 = 0x2a;

fn map_rusb(err: rusb::Error) -> ControlError {
    match err {
        rusb::Error::Timeout => ControlError::Timeout,
        other => ControlError::PrimitiveFailure(other.to_string()),
    }
}

/// The kernel's name for a device directory: `usbN` for root hubs,
/// `bus-p1.p2...` otherwise (unpadded).
fn sysfs_name(device: &RawDevice) -> String {
    if device.port_chain.is_empty() {
        format!("usb{}", device.bus)
    } else {
        let chain: Vec<String> = device.port_chain.iter().map(u8::to_string).collect();
        format!("{}-{}", device.bus, chain.join("."))
    }
}

fn clean_string(s: String) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

pub struct LinuxUsb {
    context: Context,
}

impl LinuxUsb {
    /// Fails when no USB context can be opened at all; that is the one
    /// fatal startup condition.
    pub fn new() -> Result<Self> {
        let context = Context::new()
            .map_err(|e| ControlError::PrimitiveFailure(format!("cannot open usb context: {e}")))?;
        Ok(Self { context })
    }

    fn open(&self, raw: &RawDevice) -> Result<rusb::DeviceHandle<Context>> {
        let devices = self.context.devices().map_err(map_rusb)?;
        for device in devices.iter() {
            if device.bus_number() == raw.bus && device.address() == raw.address {
                return device.open().map_err(map_rusb);
            }
        }
        Err(ControlError::PrimitiveFailure(format!(
            "device {:03}/{:03} no longer enumerated",
            raw.bus, raw.address
        )))
    }

    fn read_device(device: &Device<Context>) -> Result<RawDevice> {
        let descriptor = device.device_descriptor().map_err(map_rusb)?;
        let port_chain = device.port_numbers().unwrap_or_default();

        let (manufacturer, product, serial) = match device.open() {
            Ok(handle) => (
                handle
                    .read_manufacturer_string_ascii(&descriptor)
                    .ok()
                    .and_then(clean_string),
                handle
                    .read_product_string_ascii(&descriptor)
                    .ok()
                    .and_then(clean_string),
                handle
                    .read_serial_number_string_ascii(&descriptor)
                    .ok()
                    .and_then(clean_string),
            ),
            // no access is fine; ids and topology still identify the port
            Err(_) => (None, None, None),
        };

        let mut raw = RawDevice {
            bus: device.bus_number(),
            address: device.address(),
            port_chain,
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            class: descriptor.class_code(),
            usb_level: descriptor.usb_version().major(),
            manufacturer,
            product,
            serial,
            interfaces: Vec::new(),
        };
        raw.interfaces = interface_drivers(&raw);
        Ok(raw)
    }
}

/// Bound kernel driver names for every interface of the device,
/// read from the interface directories next to the device in sysfs.
fn interface_drivers(device: &RawDevice) -> Vec<String> {
    let prefix = format!("{}:", sysfs_name(device));
    let mut drivers = Vec::new();
    let Ok(entries) = fs::read_dir(SYSFS_USB_DEVICES) else {
        return drivers;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) {
            continue;
        }
        if let Ok(target) = fs::read_link(entry.path().join("driver"))
            && let Some(driver) = target.file_name()
        {
            drivers.push(driver.to_string_lossy().into_owned());
        }
    }
    drivers.sort();
    drivers.dedup();
    drivers
}

impl UsbAccess for LinuxUsb {
    fn enumerate(&self) -> Result<Vec<RawDevice>> {
        let devices = self.context.devices().map_err(map_rusb)?;
        let mut out = Vec::new();
        for device in devices.iter() {
            match Self::read_device(&device) {
                Ok(raw) => out.push(raw),
                Err(err) => tracing::debug!(
                    bus = device.bus_number(),
                    addr = device.address(),
                    %err,
                    "skipping device mid-enumeration"
                ),
            }
        }
        Ok(out)
    }

    fn hub_descriptor(&self, hub: &RawDevice, timeout: Duration) -> Result<HubDescriptor> {
        let handle = self.open(hub)?;
        let descriptor_type = if hub.usb_level >= 3 {
            DT_SUPERSPEED_HUB
        } else {
            DT_HUB
        };
        let mut buf = [0u8; 9];
        let rt = request_type(Direction::In, RequestType::Class, Recipient::Device);
        let n = handle
            .read_control(
                rt,
                REQ_GET_DESCRIPTOR,
                descriptor_type << 8,
                0,
                &mut buf,
                timeout,
            )
            .map_err(map_rusb)?;
        if n < 5 {
            return Err(ControlError::PrimitiveFailure(format!(
                "short hub descriptor: {n} bytes"
            )));
        }
        Ok(HubDescriptor {
            num_ports: buf[2],
            characteristics: u16::from_le_bytes([buf[3], buf[4]]),
        })
    }

    fn port_status(&self, hub: &RawDevice, port: u8, timeout: Duration) -> Result<RawPortStatus> {
        let handle = self.open(hub)?;
        let mut buf = [0u8; 4];
        let rt = request_type(Direction::In, RequestType::Class, Recipient::Other);
        let n = handle
            .read_control(rt, REQ_GET_STATUS, 0, u16::from(port), &mut buf, timeout)
            .map_err(map_rusb)?;
        if n < 2 {
            return Err(ControlError::PrimitiveFailure(format!(
                "short port status: {n} bytes"
            )));
        }
        Ok(RawPortStatus::from_bits_retain(u16::from_le_bytes([
            buf[0], buf[1],
        ])))
    }

    fn set_port_feature(
        &self,
        hub: &RawDevice,
        port: u8,
        feature: u16,
        timeout: Duration,
    ) -> Result<()> {
        let handle = self.open(hub)?;
        let rt = request_type(Direction::Out, RequestType::Class, Recipient::Other);
        handle
            .write_control(rt, REQ_SET_FEATURE, feature, u16::from(port), &[], timeout)
            .map_err(map_rusb)?;
        Ok(())
    }

    fn clear_port_feature(
        &self,
        hub: &RawDevice,
        port: u8,
        feature: u16,
        timeout: Duration,
    ) -> Result<()> {
        let handle = self.open(hub)?;
        let rt = request_type(Direction::Out, RequestType::Class, Recipient::Other);
        handle
            .write_control(rt, REQ_CLEAR_FEATURE, feature, u16::from(port), &[], timeout)
            .map_err(map_rusb)?;
        Ok(())
    }

    fn reset_device(&self, device: &RawDevice, _timeout: Duration) -> Result<()> {
        self.open(device)?.reset().map_err(map_rusb)
    }

    fn set_authorized(&self, device: &RawDevice, authorized: bool) -> Result<()> {
        let path = Path::new(SYSFS_USB_DEVICES)
            .join(sysfs_name(device))
            .join("authorized");
        if !path.exists() {
            return Err(ControlError::UnsupportedByHost("usb device authorization"));
        }
        fs::write(&path, if authorized { "1" } else { "0" }).map_err(|e| {
            ControlError::PrimitiveFailure(format!("write {}: {e}", path.display()))
        })
    }

    fn serial_ports(&self) -> Vec<(PortAddress, String)> {
        let mut out = Vec::new();
        let Ok(entries) = fs::read_dir(SYSFS_USB_DEVICES) else {
            return out;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            // interface directories look like "1-1.4:1.0"
            let Some((device_part, _)) = name.split_once(':') else {
                continue;
            };
            let Ok(address) = device_part.parse::<PortAddress>() else {
                continue;
            };
            let tty_dir = entry.path().join("tty");
            if let Ok(ttys) = fs::read_dir(&tty_dir) {
                for tty in ttys.flatten() {
                    out.push((address.clone(), tty.file_name().to_string_lossy().into_owned()));
                }
            }
        }
        out.sort();
        out
    }
}
