//! Topology & Control Engine for usbwatch
//!
//! Builds an addressable tree of USB buses, hubs and devices from raw
//! enumeration data, resolves per-port control capabilities from the
//! enclosing hub's characteristics, and dispatches reset/power/disable
//! commands against a per-port lock so concurrent front-ends never race
//! on the same physical port.

pub mod addr;
pub mod backend;
pub mod capability;
pub mod dispatch;
pub mod error;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod render;
pub mod test_utils;
pub mod topology;

pub use addr::PortAddress;
pub use backend::{HubDescriptor, RawDevice, RawPortStatus, UsbAccess};
pub use capability::{CapabilityMask, PowerSwitching};
pub use dispatch::{Command, Effect, Engine, Outcome, PortEntry};
pub use error::{ControlError, Result};
#[cfg(target_os = "linux")]
pub use linux::LinuxUsb;
pub use render::{render_entry, render_listing};
pub use topology::{DeviceInfo, HubInfo, StatusFlags, TopologyNode, TopologySnapshot};
