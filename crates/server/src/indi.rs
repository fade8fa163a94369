//! INDI protocol server
//!
//! Exposes the port listing as a single text vector property named
//! `PORT` on a device derived from the hostname. Each listing row is
//! one text element; writing a command word (`reset`, `hard`,
//! `disable`, `up`, `down`, `off`) into an element runs that command
//! against the row's port. Property state and message carry the
//! outcome back, so the control panel of any INDI client doubles as a
//! crude front panel for the USB tree.

use crate::SharedEngine;
use anyhow::{Context, Result};
use engine::{Command, Effect, PortAddress, render_entry};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast};

pub const PROPERTY_NAME: &str = "PORT";
pub const GROUP: &str = "Main Control";

/// A client that never completes an element gets cut off here.
const MAX_BUFFER: usize = 64 * 1024;

/// INDI device name: `USBWATCH_<HOSTNAME>` with the short hostname
/// uppercased, so one client can tell several controllers apart.
pub fn device_name() -> String {
    let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname").unwrap_or_default();
    let short = hostname
        .trim()
        .split('.')
        .next()
        .unwrap_or("")
        .to_uppercase();
    if short.is_empty() {
        "USBWATCH".to_string()
    } else {
        format!("USBWATCH_{short}")
    }
}

/// The one property this server publishes.
pub struct PortProperty {
    engine: SharedEngine,
    device: String,
    state: &'static str,
    message: Option<String>,
    values: Vec<String>,
}

impl PortProperty {
    pub fn new(engine: SharedEngine) -> Self {
        Self {
            engine,
            device: device_name(),
            state: "Idle",
            message: None,
            values: Vec::new(),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Re-render the property values from a fresh listing.
    pub async fn refresh(&mut self) {
        let engine = self.engine.clone();
        match tokio::task::spawn_blocking(move || engine.list()).await {
            Ok(Ok(entries)) => {
                self.values = entries
                    .iter()
                    .filter(|e| !e.is_hub)
                    .map(render_entry)
                    .collect();
            }
            Ok(Err(err)) => {
                tracing::warn!(%err, "topology capture failed");
                self.state = "Alert";
                self.message = Some(err.to_string());
            }
            Err(err) => {
                tracing::error!(%err, "listing task failed");
            }
        }
    }

    /// Handle a client write to the property: at most one element may
    /// carry a command word, the row it names provides the address.
    pub async fn apply(&mut self, texts: Vec<(String, String)>) {
        self.state = "Alert";
        self.message = None;

        let commands: Vec<(String, String)> = texts
            .into_iter()
            .filter(|(_, value)| !value.trim().is_empty())
            .collect();
        if commands.is_empty() {
            self.state = "Ok";
            self.refresh().await;
            return;
        }
        if commands.len() > 1 {
            self.message = Some("too many commands, erase those not needed".to_string());
            return;
        }

        let (name, value) = &commands[0];
        let word = value.trim();
        let Some(command) = Command::from_name(word) else {
            self.message = Some(format!("command '{word}' not recognized"));
            return;
        };
        let row = match name.parse::<usize>() {
            Ok(index) if index >= 1 && index <= self.values.len() => &self.values[index - 1],
            _ => {
                self.message = Some(format!("no port entry named '{name}'"));
                return;
            }
        };
        let address: PortAddress = match row.split_whitespace().next().unwrap_or("").parse() {
            Ok(address) => address,
            Err(err) => {
                self.message = Some(err.to_string());
                return;
            }
        };

        let engine = self.engine.clone();
        let target = address.clone();
        let outcome =
            match tokio::task::spawn_blocking(move || engine.execute(&target, command)).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(%address, %command, %err, "dispatch task failed");
                    self.message = Some("internal error".to_string());
                    return;
                }
            };
        match outcome.result {
            Ok(effect) => {
                self.state = "Ok";
                if effect == Effect::AppliedGanged {
                    self.message =
                        Some("hub switches power for all ports at once".to_string());
                }
                self.refresh().await;
            }
            Err(err) => {
                self.message = Some(err.to_string());
            }
        }
    }

    pub fn def_xml(&self) -> Result<String> {
        vector(
            &self.device,
            self.state,
            self.message.as_deref(),
            &self.values,
            true,
        )
    }

    pub fn set_xml(&self) -> Result<String> {
        vector(
            &self.device,
            self.state,
            self.message.as_deref(),
            &self.values,
            false,
        )
    }
}

/// Serialize the property as a `defTextVector` or `setTextVector`.
/// Elements are numbered from 1 in listing order.
fn vector(
    device: &str,
    state: &str,
    message: Option<&str>,
    values: &[String],
    define: bool,
) -> Result<String> {
    let (tag, item) = if define {
        ("defTextVector", "defText")
    } else {
        ("setTextVector", "oneText")
    };

    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
    let mut root = BytesStart::new(tag);
    root.push_attribute(("device", device));
    root.push_attribute(("name", PROPERTY_NAME));
    if define {
        root.push_attribute(("label", "USB ports"));
        root.push_attribute(("group", GROUP));
        root.push_attribute(("perm", "rw"));
    }
    root.push_attribute(("state", state));
    if let Some(message) = message {
        root.push_attribute(("message", message));
    }
    writer.write_event(Event::Start(root))?;
    for (i, value) in values.iter().enumerate() {
        let number = (i + 1).to_string();
        let mut child = BytesStart::new(item);
        child.push_attribute(("name", number.as_str()));
        if define {
            child.push_attribute(("label", number.as_str()));
        }
        writer.write_event(Event::Start(child))?;
        writer.write_event(Event::Text(BytesText::new(value)))?;
        writer.write_event(Event::End(BytesEnd::new(item)))?;
    }
    writer.write_event(Event::End(BytesEnd::new(tag)))?;

    let mut out =
        String::from_utf8(writer.into_inner()).context("vector serialization not UTF-8")?;
    out.push('\n');
    Ok(out)
}

/// Messages this server reacts to; everything else is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndiMessage {
    GetProperties,
    NewTextVector {
        device: String,
        name: String,
        texts: Vec<(String, String)>,
    },
}

fn attr(start: &BytesStart<'_>, name: &str) -> Option<String> {
    start
        .try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

/// Parse one complete top-level element into a message.
pub fn parse_message(xml: &str) -> Option<IndiMessage> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event().ok()? {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"getProperties" => {
                return Some(IndiMessage::GetProperties);
            }
            Event::Start(e) if e.name().as_ref() == b"newTextVector" => {
                let device = attr(&e, "device")?;
                let name = attr(&e, "name")?;
                let texts = parse_texts(&mut reader)?;
                return Some(IndiMessage::NewTextVector {
                    device,
                    name,
                    texts,
                });
            }
            Event::Eof => return None,
            _ => {}
        }
    }
}

fn parse_texts(reader: &mut Reader<&[u8]>) -> Option<Vec<(String, String)>> {
    let mut texts = Vec::new();
    let mut current: Option<(String, String)> = None;
    loop {
        match reader.read_event().ok()? {
            Event::Start(e) if e.name().as_ref() == b"oneText" => {
                current = Some((attr(&e, "name")?, String::new()));
            }
            Event::Text(t) => {
                if let Some((_, value)) = current.as_mut() {
                    value.push_str(&t.unescape().ok()?);
                }
            }
            Event::End(e) if e.name().as_ref() == b"oneText" => {
                if let Some(text) = current.take() {
                    texts.push(text);
                }
            }
            Event::End(e) if e.name().as_ref() == b"newTextVector" => return Some(texts),
            Event::Eof => return None,
            _ => {}
        }
    }
}

/// Pull the first complete top-level element off the stream buffer.
/// Returns `None` when more bytes are needed; hopeless garbage clears
/// the buffer.
pub fn extract_element(buffer: &mut String) -> Option<String> {
    let mut reader = Reader::from_str(buffer);
    let mut depth = 0usize;
    let mut end = None;
    let mut broken = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => depth += 1,
            Ok(Event::End(_)) => {
                if depth <= 1 {
                    end = Some(reader.buffer_position() as usize);
                    break;
                }
                depth -= 1;
            }
            Ok(Event::Empty(_)) if depth == 0 => {
                end = Some(reader.buffer_position() as usize);
                break;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => {
                broken = true;
                break;
            }
        }
    }

    if let Some(end) = end {
        let element: String = buffer.drain(..end).collect();
        return Some(element);
    }
    if broken || buffer.len() > MAX_BUFFER {
        buffer.clear();
    }
    None
}

/// Bind and serve until the process exits.
pub async fn serve(engine: SharedEngine, bind: String) -> Result<()> {
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind INDI server on {bind}"))?;
    tracing::info!("INDI server listening on {bind}");
    serve_listener(listener, engine).await
}

/// Accept loop over an already-bound listener.
pub async fn serve_listener(listener: TcpListener, engine: SharedEngine) -> Result<()> {
    let property = Arc::new(Mutex::new(PortProperty::new(engine)));
    property.lock().await.refresh().await;

    // def/set updates fan out to every connected client
    let (updates, _) = broadcast::channel::<String>(64);

    loop {
        let (stream, peer) = listener.accept().await.context("INDI accept failed")?;
        tracing::debug!(%peer, "INDI client connected");
        tokio::spawn(handle_client(stream, property.clone(), updates.clone()));
    }
}

async fn handle_client(
    stream: TcpStream,
    property: Arc<Mutex<PortProperty>>,
    updates: broadcast::Sender<String>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut rx = updates.subscribe();

    let forward = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(text) => {
                    if writer.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "slow INDI client skipped updates");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut buffer = String::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));

        while let Some(element) = extract_element(&mut buffer) {
            match parse_message(&element) {
                Some(IndiMessage::GetProperties) => {
                    let mut prop = property.lock().await;
                    prop.refresh().await;
                    publish(&updates, prop.def_xml());
                }
                Some(IndiMessage::NewTextVector {
                    device,
                    name,
                    texts,
                }) => {
                    let mut prop = property.lock().await;
                    if device == prop.device() && name == PROPERTY_NAME {
                        prop.apply(texts).await;
                        // def carries the refreshed rows, set the outcome
                        publish(&updates, prop.def_xml());
                        publish(&updates, prop.set_xml());
                    }
                }
                None => {}
            }
        }
    }

    forward.abort();
    tracing::debug!("INDI client disconnected");
}

fn publish(updates: &broadcast::Sender<String>, xml: Result<String>) {
    match xml {
        // send only fails with zero subscribers, which is fine
        Ok(xml) => {
            let _ = updates.send(xml);
        }
        Err(err) => tracing::error!(%err, "property serialization failed"),
    }
}
