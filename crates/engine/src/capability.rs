//! Per-port capability resolution
//!
//! What a port can actually do is a property of the hub above it, read
//! from the hub descriptor at snapshot time. A tagged record, recomputed
//! on every capture: a hub can in principle be swapped for one with
//! different characteristics at the same physical chain.

/// Power switching mode from wHubCharacteristics bits 1:0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerSwitching {
    /// Each port has its own power switch.
    PerPort,
    /// One switch for the whole hub; acting on one port affects its
    /// siblings. Reported, not refused.
    Ganged,
    /// No power switching at all.
    #[default]
    None,
}

/// Control operations the enclosing hub supports for a port.
///
/// Bus-root nodes carry the empty mask: with no hub above them, only a
/// soft reset is ever possible there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilityMask {
    pub power_switching: PowerSwitching,
    /// CLEAR_FEATURE(PORT_ENABLE) exists only through USB 2; USB 3
    /// removed per-port disable.
    pub can_disable: bool,
    /// Every addressable hub can drive PORT_RESET.
    pub can_hard_reset: bool,
}

impl CapabilityMask {
    /// Derive the mask for all ports of a hub from its descriptor
    /// characteristics and USB level.
    pub fn from_hub(characteristics: u16, usb_level: u8) -> Self {
        let power_switching = match characteristics & 0x0003 {
            0b00 => PowerSwitching::Ganged,
            0b01 => PowerSwitching::PerPort,
            _ => PowerSwitching::None,
        };
        Self {
            power_switching,
            can_disable: usb_level < 3,
            can_hard_reset: true,
        }
    }

    /// Empty mask: nothing beyond soft reset.
    pub const fn none() -> Self {
        Self {
            power_switching: PowerSwitching::None,
            can_disable: false,
            can_hard_reset: false,
        }
    }

    pub fn can_power_switch(&self) -> bool {
        self.power_switching != PowerSwitching::None
    }

    pub fn is_ganged(&self) -> bool {
        self.power_switching == PowerSwitching::Ganged
    }
}
