//! Textual listing rendering
//!
//! Format: `<address> [<flags>] <vendor:product> <ttyname...> - <product> (<serial>)`.
//! Hub devices are suppressed; their ports appear instead.

use crate::dispatch::PortEntry;

/// Render one listing row.
pub fn render_entry(entry: &PortEntry) -> String {
    let address = entry.address.to_string();
    let flags = format!("[{}]", entry.flags.letters());

    let mut vidpid = String::new();
    let mut description = String::new();
    if let Some(device) = &entry.device {
        vidpid = format!("{:04x}:{:04x}", device.vendor_id, device.product_id);
        let mut product = device.product.clone().unwrap_or_else(|| "?".to_string());
        if let Some(serial) = &device.serial {
            product = format!("{product} ({serial})");
        }
        if let Some(manufacturer) = &device.manufacturer {
            product = format!("{manufacturer} {product}");
        }
        if device.tty_names.is_empty() {
            description = product;
        } else {
            description = format!("{} - {product}", device.tty_names.join(" "));
        }
    }

    let line = format!("{address:<13} {flags:<5} {vidpid} {description}");
    line.trim_end().to_string()
}

/// Render the full listing, one row per non-hub entry.
pub fn render_listing(entries: &[PortEntry]) -> String {
    entries
        .iter()
        .filter(|e| !e.is_hub)
        .map(render_entry)
        .collect::<Vec<_>>()
        .join("\n")
}
