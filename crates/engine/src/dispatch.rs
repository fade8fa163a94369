//! Command dispatcher
//!
//! Serializes commands per physical port, validates them against the
//! capability resolved for the target, and drives the matching backend
//! primitive. Commands to different ports run in parallel; two commands
//! to the same port never overlap, no matter which front-end issued them.

use crate::addr::PortAddress;
use crate::backend::{PORT_FEAT_ENABLE, PORT_FEAT_POWER, PORT_FEAT_RESET, UsbAccess};
use crate::error::{ControlError, Result};
use crate::topology::{DeviceInfo, StatusFlags, TopologySnapshot};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default bound on a single control transfer or driver reset.
pub const DEFAULT_USB_TIMEOUT: Duration = Duration::from_millis(5000);

/// How long a captured snapshot may serve `list` before recapture.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(1000);

/// The five control primitives plus the kernel-level power-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Ask the bound driver to reinitialize the device.
    SoftReset,
    /// Have the upstream hub toggle the port's connection state.
    HardReset,
    /// Disable the port at the upstream hub.
    Disable,
    /// Switch hub port power on.
    PowerUp,
    /// Switch hub port power off.
    PowerDown,
    /// Logically remove power at the kernel device-model level; works
    /// even on hubs without physical power switching.
    Off,
}

impl Command {
    /// Wire name shared by the CLI flags, HTTP routes and INDI words.
    pub fn name(&self) -> &'static str {
        match self {
            Command::SoftReset => "reset",
            Command::HardReset => "hard",
            Command::Disable => "disable",
            Command::PowerUp => "up",
            Command::PowerDown => "down",
            Command::Off => "off",
        }
    }

    pub fn from_name(name: &str) -> Option<Command> {
        match name {
            "reset" => Some(Command::SoftReset),
            "hard" => Some(Command::HardReset),
            "disable" => Some(Command::Disable),
            "up" => Some(Command::PowerUp),
            "down" => Some(Command::PowerDown),
            "off" => Some(Command::Off),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a successful command actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Applied,
    /// The hub only switches power for all ports at once; sibling ports
    /// were affected too. A user-visible side effect, not an error.
    AppliedGanged,
}

/// Result of one dispatch, success or typed failure, with the address
/// and command kept for context.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub address: PortAddress,
    pub command: Command,
    pub result: Result<Effect>,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// One row of a listing.
#[derive(Debug, Clone)]
pub struct PortEntry {
    pub address: PortAddress,
    pub flags: StatusFlags,
    pub device: Option<DeviceInfo>,
    pub is_hub: bool,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // port locks guard no data; recover from a panicked holder instead
    // of bricking the port for the rest of the process
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The Topology & Control Engine.
///
/// Process-wide state: the per-address lock table lives for the life of
/// the process, keyed by value. Entries for addresses no longer present
/// in the topology are harmless to retain.
pub struct Engine<B> {
    backend: B,
    locks: Mutex<HashMap<PortAddress, Arc<Mutex<()>>>>,
    cache: Mutex<Option<Arc<TopologySnapshot>>>,
    timeout: Duration,
    cache_ttl: Duration,
}

impl<B: UsbAccess> Engine<B> {
    pub fn new(backend: B) -> Self {
        Self::with_tuning(backend, DEFAULT_USB_TIMEOUT, DEFAULT_CACHE_TTL)
    }

    pub fn with_tuning(backend: B, timeout: Duration, cache_ttl: Duration) -> Self {
        Self {
            backend,
            locks: Mutex::new(HashMap::new()),
            cache: Mutex::new(None),
            timeout,
            cache_ttl,
        }
    }

    /// Ordered listing of every discovered point in the topology.
    /// Never takes a port lock; safe concurrently with any command.
    pub fn list(&self) -> Result<Vec<PortEntry>> {
        Ok(self.cached_snapshot()?.entries())
    }

    /// Run one command against one address. Infallible at the type
    /// level: every failure comes back as a typed error inside the
    /// outcome, and the port lock is released on every path.
    pub fn execute(&self, address: &PortAddress, command: Command) -> Outcome {
        let lock = self.port_lock(address);
        let result = {
            let _held = relock(&lock);
            tracing::debug!(%address, %command, "dispatching");
            self.run_locked(address, command)
        };
        // the hardware just changed; listings must not serve the old state
        *relock(&self.cache) = None;
        match &result {
            Ok(effect) => tracing::info!(%address, %command, ?effect, "command applied"),
            Err(err) => tracing::warn!(%address, %command, %err, "command failed"),
        }
        Outcome {
            address: address.clone(),
            command,
            result,
        }
    }

    /// Insert-if-absent under the table's own short-held lock; never
    /// held during primitive execution.
    fn port_lock(&self, address: &PortAddress) -> Arc<Mutex<()>> {
        let mut table = relock(&self.locks);
        table.entry(address.clone()).or_default().clone()
    }

    fn cached_snapshot(&self) -> Result<Arc<TopologySnapshot>> {
        if let Some(snapshot) = relock(&self.cache)
            .as_ref()
            .filter(|s| s.age() < self.cache_ttl)
            .cloned()
        {
            return Ok(snapshot);
        }
        let snapshot = Arc::new(TopologySnapshot::capture(&self.backend, self.timeout)?);
        *relock(&self.cache) = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Runs with the port lock held. The snapshot is captured fresh here
    /// so it can never predate a still-in-flight operation on this port.
    fn run_locked(&self, address: &PortAddress, command: Command) -> Result<Effect> {
        let snapshot = TopologySnapshot::capture(&self.backend, self.timeout)?;
        let node = snapshot
            .get(address)
            .ok_or_else(|| ControlError::AddressNotFound(address.clone()))?;

        match command {
            Command::SoftReset => {
                let device = node
                    .device
                    .as_ref()
                    .ok_or_else(|| ControlError::NoDeviceBound(address.clone()))?;
                self.backend.reset_device(device, self.timeout)?;
                Ok(Effect::Applied)
            }
            Command::Off => {
                let device = node
                    .device
                    .as_ref()
                    .ok_or_else(|| ControlError::NoDeviceBound(address.clone()))?;
                self.backend.set_authorized(device, false)?;
                Ok(Effect::Applied)
            }
            Command::HardReset | Command::Disable | Command::PowerUp | Command::PowerDown => {
                let unsupported = || ControlError::UnsupportedByHub {
                    address: address.clone(),
                    operation: command.name(),
                };
                let (hub_addr, port) = address.split_hub().ok_or_else(unsupported)?;
                let mask = node.capability;
                let allowed = match command {
                    Command::HardReset => mask.can_hard_reset,
                    Command::Disable => mask.can_disable,
                    _ => mask.can_power_switch(),
                };
                if !allowed {
                    return Err(unsupported());
                }
                let hub_dev = snapshot
                    .get(&hub_addr)
                    .and_then(|n| n.device.as_ref())
                    .ok_or_else(unsupported)?;
                match command {
                    Command::HardReset => {
                        self.backend
                            .set_port_feature(hub_dev, port, PORT_FEAT_RESET, self.timeout)?
                    }
                    Command::Disable => {
                        self.backend
                            .clear_port_feature(hub_dev, port, PORT_FEAT_ENABLE, self.timeout)?
                    }
                    Command::PowerUp => {
                        self.backend
                            .set_port_feature(hub_dev, port, PORT_FEAT_POWER, self.timeout)?
                    }
                    _ => self
                        .backend
                        .clear_port_feature(hub_dev, port, PORT_FEAT_POWER, self.timeout)?,
                }
                let ganged_power = matches!(command, Command::PowerUp | Command::PowerDown)
                    && mask.is_ganged();
                if ganged_power {
                    Ok(Effect::AppliedGanged)
                } else {
                    Ok(Effect::Applied)
                }
            }
        }
    }
}
