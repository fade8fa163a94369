//! usbwatch front-ends
//!
//! Three surfaces over one engine: the command line, the REST control
//! endpoint and the INDI protocol server. All of them translate a
//! request into one `list` or `execute` call and render the result in
//! their own vocabulary; none invents failure causes of its own.

pub mod config;
pub mod http;
pub mod indi;
pub mod logging;

use engine::{Engine, UsbAccess};
use std::sync::Arc;

/// Engine handle shared by every front-end in the process.
pub type SharedEngine = Arc<Engine<Box<dyn UsbAccess>>>;
