//! Engine error taxonomy
//!
//! Every failure a command can hit is one of these variants; front-ends
//! translate them into their own vocabulary but never extend the set.

use crate::addr::PortAddress;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("invalid usb port location {0:?}")]
    InvalidAddress(String),

    #[error("bad usb port location, port {0} not found")]
    AddressNotFound(PortAddress),

    #[error("usb device at {0} not enumerated or plugged in, use the hub-level commands")]
    NoDeviceBound(PortAddress),

    #[error("hub above {address} does not support {operation}")]
    UnsupportedByHub {
        address: PortAddress,
        operation: &'static str,
    },

    #[error("host kernel does not expose {0}")]
    UnsupportedByHost(&'static str),

    #[error("usb operation timed out")]
    Timeout,

    #[error("usb primitive failed: {0}")]
    PrimitiveFailure(String),
}

pub type Result<T> = std::result::Result<T, ControlError>;
