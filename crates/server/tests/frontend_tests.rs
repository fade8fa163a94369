//! Front-end integration tests over the scripted fake backend.
//!
//! Both servers run on ephemeral ports against the same engine the
//! binary would build, exercised with raw sockets the way curl and an
//! INDI client would talk to them.

use engine::test_utils::{FakeUsb, PrimitiveCall, fake_device, fake_hub_device};
use engine::{Engine, PortAddress, RawPortStatus, UsbAccess};
use server::{SharedEngine, http, indi};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const ACTIVE: u16 = 0x0103; // POWER | ENABLE | CONNECTION

fn addr(text: &str) -> PortAddress {
    text.parse().unwrap()
}

/// Two-port root hub on bus 1 with an FTDI adapter on port 1.
fn small_topology(characteristics: u16) -> (Arc<FakeUsb>, SharedEngine) {
    let fake = Arc::new(FakeUsb::new());
    fake.add_hub(fake_hub_device(1, &[], 2), 2, characteristics);
    fake.add_device(fake_device(1, &[1], 0x0403, 0x6001));
    fake.set_port_bits(&addr("1"), 1, RawPortStatus::from_bits_retain(ACTIVE));
    fake.add_tty(addr("1-1"), "ttyUSB0");

    let backend: Box<dyn UsbAccess> = Box::new(fake.clone());
    let engine = Arc::new(Engine::with_tuning(
        backend,
        Duration::from_millis(200),
        Duration::ZERO,
    ));
    (fake, engine)
}

async fn start_http(engine: SharedEngine) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bound = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, http::router(engine)).await.unwrap();
    });
    bound
}

/// One raw HTTP/1.1 exchange, connection closed after the response.
async fn request(server: &str, method: &str, path: &str, body: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(server).await.unwrap();
    let req = format!(
        "{method} {path} HTTP/1.1\r\nHost: {server}\r\nConnection: close\r\n\
         Content-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw).to_string();
    let status: u16 = text.split_whitespace().nth(1).unwrap().parse().unwrap();
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn http_listing_shows_devices_not_hubs() {
    let (_fake, engine) = small_topology(0x0001);
    let server = start_http(engine).await;

    let (status, body) = request(&server, "GET", "/", "").await;
    assert_eq!(status, 200);
    assert!(body.contains("1-01          [PCE] 0403:6001 ttyUSB0"));
    assert!(body.contains("1-02"));
    assert!(!body.contains("Hub"), "hub rows must be suppressed");
}

#[tokio::test]
async fn http_command_applies_and_returns_fresh_listing() {
    let (fake, engine) = small_topology(0x0001);
    let server = start_http(engine).await;

    let (status, body) = request(&server, "POST", "/down", "1-1").await;
    assert_eq!(status, 200);
    // POWER flag gone in the listing that came back
    assert!(body.contains("1-01          [CE]"));
    assert!(matches!(
        fake.calls().last().unwrap().call,
        PrimitiveCall::ClearFeature { feature: 8, .. }
    ));
}

#[tokio::test]
async fn http_rejects_malformed_location() {
    let (fake, engine) = small_topology(0x0001);
    let server = start_http(engine).await;

    let (status, body) = request(&server, "POST", "/reset", "zero-0").await;
    assert_eq!(status, 400);
    assert!(body.contains("invalid usb port location"));
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn http_reports_capability_gate_as_client_error() {
    // no power switching at all
    let (fake, engine) = small_topology(0x0002);
    let server = start_http(engine).await;

    let (status, body) = request(&server, "POST", "/down", "1-1").await;
    assert_eq!(status, 400);
    assert!(body.contains("does not support down"));
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn http_unknown_route_is_not_found() {
    let (_fake, engine) = small_topology(0x0001);
    let server = start_http(engine).await;

    let (status, _) = request(&server, "POST", "/on", "1-1").await;
    assert_eq!(status, 404);
}

async fn start_indi(engine: SharedEngine) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bound = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let _ = indi::serve_listener(listener, engine).await;
    });
    bound
}

async fn read_until(stream: &mut TcpStream, marker: &str) -> String {
    let mut text = String::new();
    let mut chunk = [0u8; 1024];
    tokio::time::timeout(Duration::from_secs(5), async {
        while !text.contains(marker) {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before {marker}");
            text.push_str(&String::from_utf8_lossy(&chunk[..n]));
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {marker}"));
    text
}

#[tokio::test]
async fn indi_defines_property_and_runs_command() {
    let (fake, engine) = small_topology(0x0001);
    let server = start_indi(engine).await;
    let mut stream = TcpStream::connect(&server).await.unwrap();

    stream
        .write_all(b"<getProperties version='1.7'/>")
        .await
        .unwrap();
    let def = read_until(&mut stream, "</defTextVector>").await;
    assert!(def.contains("name=\"PORT\""));
    assert!(def.contains("group=\"Main Control\""));
    assert!(def.contains("0403:6001"));

    // element 1 is the FTDI row; write the command word into it
    let device = indi::device_name();
    let new = format!(
        "<newTextVector device=\"{device}\" name=\"PORT\">\
         <oneText name=\"1\">down</oneText>\
         </newTextVector>"
    );
    stream.write_all(new.as_bytes()).await.unwrap();
    let set = read_until(&mut stream, "</setTextVector>").await;
    assert!(set.contains("state=\"Ok\""));
    assert!(matches!(
        fake.calls().last().unwrap().call,
        PrimitiveCall::ClearFeature { feature: 8, .. }
    ));
}

#[tokio::test]
async fn indi_rejects_multiple_commands_at_once() {
    let (fake, engine) = small_topology(0x0001);
    let server = start_indi(engine).await;
    let mut stream = TcpStream::connect(&server).await.unwrap();

    stream
        .write_all(b"<getProperties version='1.7'/>")
        .await
        .unwrap();
    read_until(&mut stream, "</defTextVector>").await;

    let device = indi::device_name();
    let new = format!(
        "<newTextVector device=\"{device}\" name=\"PORT\">\
         <oneText name=\"1\">down</oneText>\
         <oneText name=\"2\">up</oneText>\
         </newTextVector>"
    );
    stream.write_all(new.as_bytes()).await.unwrap();
    let set = read_until(&mut stream, "</setTextVector>").await;
    assert!(set.contains("state=\"Alert\""));
    assert!(set.contains("too many commands"));
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn indi_ignores_vectors_for_other_devices() {
    let (fake, engine) = small_topology(0x0001);
    let server = start_indi(engine).await;
    let mut stream = TcpStream::connect(&server).await.unwrap();

    stream
        .write_all(
            b"<newTextVector device=\"SOMEONE_ELSE\" name=\"PORT\">\
              <oneText name=\"1\">down</oneText></newTextVector>\
              <getProperties version='1.7'/>",
        )
        .await
        .unwrap();
    // the getProperties still answers, the foreign vector did nothing
    read_until(&mut stream, "</defTextVector>").await;
    assert!(fake.calls().is_empty());
}
