//! Canonical port-path addressing
//!
//! A [`PortAddress`] names a physical point in the USB topology as the bus
//! number followed by the chain of hub port numbers leading to it, e.g.
//! `1-01.04.02`. The bus alone (`1`) addresses the bus root. Addresses are
//! pure values: they stay valid across device re-plugs and bus renumbering
//! of the devices *below* them.

use crate::error::ControlError;
use std::fmt;
use std::str::FromStr;

/// Bus number plus ordered hub port chain.
///
/// The derived `Ord` is lexicographic over `[bus, port1, port2, ...]`,
/// which is exactly the depth-first, buses-ascending, ports-ascending
/// order required of listings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortAddress {
    bus: u8,
    ports: Vec<u8>,
}

impl PortAddress {
    /// Build an address from raw components. Bus and every port must be
    /// non-zero; hardware numbers both from 1.
    pub fn new(bus: u8, ports: Vec<u8>) -> Result<Self, ControlError> {
        if bus == 0 || ports.contains(&0) {
            let mut text = bus.to_string();
            for (i, p) in ports.iter().enumerate() {
                text.push(if i == 0 { '-' } else { '.' });
                text.push_str(&p.to_string());
            }
            return Err(ControlError::InvalidAddress(text));
        }
        Ok(Self { bus, ports })
    }

    /// Address of a bus root.
    pub fn bus_root(bus: u8) -> Result<Self, ControlError> {
        Self::new(bus, Vec::new())
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn ports(&self) -> &[u8] {
        &self.ports
    }

    /// True for bus-root addresses (no enclosing hub).
    pub fn is_bus_root(&self) -> bool {
        self.ports.is_empty()
    }

    /// The port number on the enclosing hub, if any.
    pub fn port(&self) -> Option<u8> {
        self.ports.last().copied()
    }

    /// Address of the enclosing hub, `None` at the bus root.
    pub fn parent(&self) -> Option<PortAddress> {
        self.split_hub().map(|(hub, _)| hub)
    }

    /// Split into (enclosing hub address, port number on that hub).
    pub fn split_hub(&self) -> Option<(PortAddress, u8)> {
        let (&port, rest) = self.ports.split_last()?;
        Some((
            PortAddress {
                bus: self.bus,
                ports: rest.to_vec(),
            },
            port,
        ))
    }

    /// Address of the given port below this one.
    pub fn child(&self, port: u8) -> PortAddress {
        let mut ports = self.ports.clone();
        ports.push(port);
        PortAddress {
            bus: self.bus,
            ports,
        }
    }
}

fn parse_component(text: &str) -> Result<u8, ControlError> {
    let invalid = || ControlError::InvalidAddress(text.to_string());
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let value: u8 = text.parse().map_err(|_| invalid())?;
    if value == 0 {
        return Err(invalid());
    }
    Ok(value)
}

impl FromStr for PortAddress {
    type Err = ControlError;

    /// Parses `bus` or `bus-port.port...`. Leading zeros are accepted on
    /// input (`1-01.04` equals `1-1.4`); zero or non-numeric components
    /// are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (bus_text, chain) = match s.split_once('-') {
            Some((bus, chain)) => (bus, Some(chain)),
            None => (s, None),
        };
        let bus = parse_component(bus_text)
            .map_err(|_| ControlError::InvalidAddress(s.to_string()))?;
        let mut ports = Vec::new();
        if let Some(chain) = chain {
            for part in chain.split('.') {
                ports.push(
                    parse_component(part)
                        .map_err(|_| ControlError::InvalidAddress(s.to_string()))?,
                );
            }
        }
        Ok(PortAddress { bus, ports })
    }
}

impl fmt::Display for PortAddress {
    /// Canonical form: bus unpadded, ports zero-padded to two digits,
    /// matching the listing output (`1-01.04.02`).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bus)?;
        for (i, port) in self.ports.iter().enumerate() {
            let sep = if i == 0 { '-' } else { '.' };
            write!(f, "{sep}{port:02}")?;
        }
        Ok(())
    }
}
