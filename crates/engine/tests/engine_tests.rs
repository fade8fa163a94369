//! Engine integration tests against the scripted fake backend.
//!
//! Covers listing order and stability, capability gating, per-port
//! mutual exclusion, lock release after failures, and the observable
//! effect of power commands on the next snapshot.

use engine::test_utils::{CallRecord, FakeUsb, PrimitiveCall, fake_device, fake_hub_device};
use engine::{
    Command, ControlError, Effect, Engine, PortAddress, RawPortStatus, StatusFlags, UsbAccess,
    render_listing,
};
use std::sync::Arc;
use std::time::Duration;

fn addr(text: &str) -> PortAddress {
    text.parse().unwrap()
}

const ACTIVE: u16 = 0x0103; // POWER | ENABLE | CONNECTION

/// Root hub on bus 1 with a hub chain below it:
/// 1 (root, 4 ports) -> 1-01 (hub) -> 1-01.04 (hub) -> 1-01.04.02 (hub)
/// with an FTDI adapter at 1-01.04.02.04. All hubs are USB 2, per-port
/// power switching unless a test rebuilds its own topology.
fn deep_topology() -> Arc<FakeUsb> {
    let fake = Arc::new(FakeUsb::new());
    fake.add_hub(fake_hub_device(1, &[], 2), 4, 0x0001);
    fake.add_hub(fake_hub_device(1, &[1], 2), 4, 0x0001);
    fake.add_hub(fake_hub_device(1, &[1, 4], 2), 4, 0x0001);
    fake.add_hub(fake_hub_device(1, &[1, 4, 2], 2), 4, 0x0001);
    fake.add_device(fake_device(1, &[1, 4, 2, 4], 0x0403, 0x6001));
    for (hub, port) in [("1", 1u8), ("1-1", 4), ("1-1.4", 2), ("1-1.4.2", 4)] {
        fake.set_port_bits(&addr(hub), port, RawPortStatus::from_bits_retain(ACTIVE));
    }
    fake.add_tty(addr("1-1.4.2.4"), "ttyUSB0");
    fake
}

fn engine_over(fake: &Arc<FakeUsb>) -> Engine<Arc<FakeUsb>> {
    Engine::with_tuning(fake.clone(), Duration::from_millis(200), Duration::ZERO)
}

#[test]
fn listing_is_ordered_and_stable() {
    let fake = deep_topology();
    let engine = engine_over(&fake);

    let first = engine.list().unwrap();
    let second = engine.list().unwrap();

    let addrs: Vec<String> = first.iter().map(|e| e.address.to_string()).collect();
    let mut sorted = addrs.clone();
    sorted.sort();
    assert_eq!(addrs, sorted, "listing must be depth-first ordered");
    assert_eq!(
        addrs,
        second
            .iter()
            .map(|e| e.address.to_string())
            .collect::<Vec<_>>()
    );
    // every hub port appears, including the empty ones
    assert!(addrs.contains(&"1-01.02".to_string()));
    assert!(addrs.contains(&"1-01.04.02.04".to_string()));
}

#[test]
fn listing_carries_device_details() {
    let fake = deep_topology();
    let engine = engine_over(&fake);
    let entries = engine.list().unwrap();

    let dev = entries
        .iter()
        .find(|e| e.address == addr("1-1.4.2.4"))
        .unwrap();
    let info = dev.device.as_ref().unwrap();
    assert_eq!(info.vendor_id, 0x0403);
    assert_eq!(info.tty_names, ["ttyUSB0"]);
    assert!(dev.flags.contains(StatusFlags::POWERED | StatusFlags::CONNECTED));

    let text = render_listing(&entries);
    assert!(text.contains("1-01.04.02.04 [PCE] 0403:6001 ttyUSB0"));
    // hub rows are suppressed
    assert!(!text.contains("Hub"));
}

#[test]
fn power_down_succeeds_and_clears_flag() {
    let fake = deep_topology();
    let engine = engine_over(&fake);
    let target = addr("1-01.04.02.04");

    let outcome = engine.execute(&target, Command::PowerDown);
    assert_eq!(outcome.result, Ok(Effect::Applied));

    let entries = engine.list().unwrap();
    let entry = entries.iter().find(|e| e.address == target).unwrap();
    assert!(
        !entry.flags.contains(StatusFlags::POWERED),
        "P flag must be gone after power down"
    );
}

#[test]
fn absent_address_is_not_found() {
    let fake = deep_topology();
    let engine = engine_over(&fake);
    let ghost = addr("9-01");

    let outcome = engine.execute(&ghost, Command::SoftReset);
    assert_eq!(outcome.result, Err(ControlError::AddressNotFound(ghost)));
}

#[test]
fn soft_reset_requires_a_device() {
    let fake = deep_topology();
    let engine = engine_over(&fake);
    // port exists (its hub reports it) but nothing is plugged in
    let empty = addr("1-01.02");

    let outcome = engine.execute(&empty, Command::SoftReset);
    assert_eq!(outcome.result, Err(ControlError::NoDeviceBound(empty)));
    assert!(fake.calls().is_empty());
}

#[test]
fn gating_blocks_primitive_when_hub_lacks_capability() {
    let fake = Arc::new(FakeUsb::new());
    // no power switching at all (characteristics bits 1:0 = 0b10)
    fake.add_hub(fake_hub_device(1, &[], 2), 2, 0x0002);
    fake.add_device(fake_device(1, &[1], 0x1234, 0x5678));
    let engine = engine_over(&fake);

    for command in [Command::PowerDown, Command::PowerUp] {
        let outcome = engine.execute(&addr("1-1"), command);
        assert!(matches!(
            outcome.result,
            Err(ControlError::UnsupportedByHub { .. })
        ));
    }
    assert!(
        fake.calls().is_empty(),
        "a disallowed primitive must never be invoked"
    );
}

#[test]
fn usb3_hub_cannot_disable() {
    let fake = Arc::new(FakeUsb::new());
    fake.add_hub(fake_hub_device(3, &[], 3), 2, 0x0001);
    fake.add_device(fake_device(3, &[2], 0x1111, 0x2222));
    let engine = engine_over(&fake);

    let outcome = engine.execute(&addr("3-2"), Command::Disable);
    assert!(matches!(
        outcome.result,
        Err(ControlError::UnsupportedByHub { .. })
    ));
    // hard reset is still available on the same hub
    let outcome = engine.execute(&addr("3-2"), Command::HardReset);
    assert_eq!(outcome.result, Ok(Effect::Applied));
}

#[test]
fn bus_root_only_soft_resets() {
    let fake = deep_topology();
    let engine = engine_over(&fake);

    let outcome = engine.execute(&addr("1"), Command::HardReset);
    assert!(matches!(
        outcome.result,
        Err(ControlError::UnsupportedByHub { .. })
    ));
    let outcome = engine.execute(&addr("1"), Command::SoftReset);
    assert_eq!(outcome.result, Ok(Effect::Applied));
}

#[test]
fn ganged_power_switching_is_reported() {
    let fake = Arc::new(FakeUsb::new());
    fake.add_hub(fake_hub_device(1, &[], 2), 4, 0x0000);
    fake.add_device(fake_device(1, &[3], 0x1234, 0x5678));
    let engine = engine_over(&fake);

    let outcome = engine.execute(&addr("1-3"), Command::PowerUp);
    assert_eq!(outcome.result, Ok(Effect::AppliedGanged));

    // the fake models the hardware quirk: siblings switch too
    let outcome = engine.execute(&addr("1-3"), Command::PowerDown);
    assert_eq!(outcome.result, Ok(Effect::AppliedGanged));
    let entries = engine.list().unwrap();
    for port in ["1-01", "1-02", "1-03", "1-04"] {
        let entry = entries.iter().find(|e| e.address == addr(port)).unwrap();
        assert!(!entry.flags.contains(StatusFlags::POWERED), "{port}");
    }
}

#[test]
fn off_uses_kernel_authorization() {
    let fake = deep_topology();
    let engine = engine_over(&fake);
    let target = addr("1-01.04.02.04");

    let outcome = engine.execute(&target, Command::Off);
    assert_eq!(outcome.result, Ok(Effect::Applied));
    assert!(!fake.is_authorized(&target));
    assert!(matches!(
        fake.calls().last().unwrap().call,
        PrimitiveCall::SetAuthorized {
            authorized: false,
            ..
        }
    ));
}

#[test]
fn hard_reset_targets_the_parent_hub() {
    let fake = deep_topology();
    let engine = engine_over(&fake);

    let outcome = engine.execute(&addr("1-01.04.02.04"), Command::HardReset);
    assert_eq!(outcome.result, Ok(Effect::Applied));
    match &fake.calls()[0].call {
        PrimitiveCall::SetFeature { hub, port, feature } => {
            assert_eq!(*hub, addr("1-1.4.2"));
            assert_eq!(*port, 4);
            assert_eq!(*feature, 4); // PORT_RESET
        }
        other => panic!("unexpected primitive {other:?}"),
    }
}

#[test]
fn timeout_surfaces_and_lock_is_released() {
    let fake = deep_topology();
    let engine = engine_over(&fake);
    let target = addr("1-01.04.02.04");

    fake.fail_next_primitive(ControlError::Timeout);
    let outcome = engine.execute(&target, Command::PowerDown);
    assert_eq!(outcome.result, Err(ControlError::Timeout));

    // the same address must still be serviceable afterwards
    let outcome = engine.execute(&target, Command::PowerDown);
    assert_eq!(outcome.result, Ok(Effect::Applied));
}

#[test]
fn lock_released_after_validation_failure() {
    let fake = deep_topology();
    let engine = engine_over(&fake);
    let empty = addr("1-01.02");

    let outcome = engine.execute(&empty, Command::SoftReset);
    assert!(outcome.result.is_err());
    let outcome = engine.execute(&empty, Command::PowerDown);
    assert_eq!(outcome.result, Ok(Effect::Applied));
}

fn actuation_windows(calls: &[CallRecord]) -> (&CallRecord, &CallRecord) {
    assert_eq!(calls.len(), 2, "expected exactly two primitive calls");
    (&calls[0], &calls[1])
}

#[test]
fn same_address_commands_never_overlap() {
    let fake = Arc::new(FakeUsb::with_primitive_delay(Duration::from_millis(80)));
    fake.add_hub(fake_hub_device(1, &[], 2), 2, 0x0001);
    fake.add_device(fake_device(1, &[1], 0x1234, 0x5678));
    let engine = Arc::new(engine_over(&fake));
    let target = addr("1-1");

    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = engine.clone();
        let target = target.clone();
        handles.push(std::thread::spawn(move || {
            engine.execute(&target, Command::PowerDown)
        }));
    }
    for handle in handles {
        assert!(handle.join().unwrap().is_success());
    }

    let calls = fake.calls();
    let (a, b) = actuation_windows(&calls);
    assert!(
        !a.overlaps(b),
        "two commands to the same port overlapped in primitive invocation"
    );
}

#[test]
fn different_addresses_run_in_parallel() {
    let fake = Arc::new(FakeUsb::with_primitive_delay(Duration::from_millis(200)));
    fake.add_hub(fake_hub_device(1, &[], 2), 2, 0x0001);
    fake.add_device(fake_device(1, &[1], 0x1111, 0x0001));
    fake.add_device(fake_device(1, &[2], 0x2222, 0x0002));
    let engine = Arc::new(engine_over(&fake));

    let mut handles = Vec::new();
    for target in [addr("1-1"), addr("1-2")] {
        let engine = engine.clone();
        handles.push(std::thread::spawn(move || {
            engine.execute(&target, Command::PowerDown)
        }));
    }
    for handle in handles {
        assert!(handle.join().unwrap().is_success());
    }

    let calls = fake.calls();
    let (a, b) = actuation_windows(&calls);
    assert!(
        a.overlaps(b),
        "commands to unrelated ports must not serialize against each other"
    );
}

#[test]
fn broken_port_status_degrades_to_resetting() {
    let fake = Arc::new(FakeUsb::new());
    fake.add_hub(fake_hub_device(1, &[], 2), 2, 0x0001);
    fake.break_port_status(&addr("1"), 2);
    let engine = engine_over(&fake);

    let entries = engine.list().unwrap();
    let broken = entries.iter().find(|e| e.address == addr("1-2")).unwrap();
    assert_eq!(broken.flags, StatusFlags::RESETTING);
    // the rest of the capture is unaffected
    assert!(entries.iter().any(|e| e.address == addr("1-1")));
}

#[test]
fn list_serves_cached_snapshot_within_ttl() {
    let fake = deep_topology();
    let engine = Engine::with_tuning(
        fake.clone(),
        Duration::from_millis(200),
        Duration::from_secs(60),
    );

    let before = engine.list().unwrap();
    assert!(!before.is_empty());
    // hardware changes behind the engine's back...
    fake.set_port_bits(&addr("1-1.4.2"), 4, RawPortStatus::empty());
    let cached = engine.list().unwrap();
    let entry = cached
        .iter()
        .find(|e| e.address == addr("1-1.4.2.4"))
        .unwrap();
    assert!(
        entry.flags.contains(StatusFlags::POWERED),
        "second list within the TTL must come from the cache"
    );

    // ...but a command invalidates the cache on completion
    let outcome = engine.execute(&addr("1-01.04.02.04"), Command::HardReset);
    assert!(outcome.is_success());
    let fresh = engine.list().unwrap();
    let entry = fresh
        .iter()
        .find(|e| e.address == addr("1-1.4.2.4"))
        .unwrap();
    assert_eq!(entry.flags, StatusFlags::empty());
}

#[test]
fn snapshot_capture_is_deterministic() {
    let fake = deep_topology();
    let a = engine::TopologySnapshot::capture(fake.as_ref(), Duration::from_millis(200)).unwrap();
    let b = engine::TopologySnapshot::capture(fake.as_ref(), Duration::from_millis(200)).unwrap();
    let addrs_a: Vec<_> = a.nodes().map(|n| n.address.clone()).collect();
    let addrs_b: Vec<_> = b.nodes().map(|n| n.address.clone()).collect();
    assert_eq!(addrs_a, addrs_b);
    assert_eq!(a.len(), b.len());
}

#[test]
fn fake_backend_records_nothing_for_list() {
    let fake = deep_topology();
    let engine = engine_over(&fake);
    engine.list().unwrap();
    assert!(fake.calls().is_empty(), "listing must not actuate anything");
}

// keep the trait object path used by the server compiling against the fake
#[test]
fn engine_works_through_a_boxed_backend() {
    let fake = deep_topology();
    let boxed: Box<dyn UsbAccess> = Box::new(fake.clone());
    let engine = Engine::with_tuning(boxed, Duration::from_millis(200), Duration::ZERO);
    assert!(engine.list().unwrap().len() > 4);
    let outcome = engine.execute(&addr("1-01.04.02.04"), Command::PowerDown);
    assert!(outcome.is_success());
}
