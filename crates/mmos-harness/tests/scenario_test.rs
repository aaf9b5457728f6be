//! Multi-device scenarios over the in-process switch.

use mmos_apps::tags;
use mmos_core::RegistryConfig;
use mmos_harness::scenario::{Scenario, World, oracle};
use mmos_proto::{VirtualAddress, well_known};

#[test]
fn player_reaches_another_device() {
    let result = Scenario::new("cross-device list")
        .device("alice")
        .device("bob")
        .send("alice", "bob", tags::CONTROL, "list")
        .oracle(oracle::all_of(vec![
            oracle::received("alice", &["calculator\nclock\necho"]),
            oracle::received("bob", &[]),
            oracle::nothing_in_flight(),
        ]))
        .run();

    assert!(result.is_ok(), "scenario should succeed: {result:?}");
}

#[test]
fn launcher_opens_an_app_that_then_answers() {
    let result = Scenario::new("open calculator")
        .device("alice")
        .send("alice", "alice", tags::CONTROL, "open calculator")
        .tick(1)
        .send("alice", "alice", tags::CALCULATOR, "12+30=")
        .oracle(oracle::all_of(vec![
            oracle::received("alice", &["ok", "42"]),
            oracle::focused("alice", mmos_apps::CALCULATOR),
        ]))
        .run();

    assert!(result.is_ok(), "scenario should succeed: {result:?}");
}

#[test]
fn packets_for_an_app_that_is_not_running_are_lost() {
    // Both requests reach the device in the same tick, before the calculator
    // has bound its tag.
    let result = Scenario::new("too early")
        .device("alice")
        .send("alice", "alice", tags::CONTROL, "open calculator")
        .send("alice", "alice", tags::CALCULATOR, "1+1=")
        .oracle(Box::new(|world| {
            assert_eq!(world.received_text("alice"), ["ok"]);
            let stats = world.device("alice").unwrap().kernel().network().stats();
            assert_eq!(stats.dropped_no_listener, 1);
            Ok(())
        }))
        .run();

    assert!(result.is_ok(), "scenario should succeed: {result:?}");
}

#[test]
fn system_services_answer_and_unknown_ones_drop() {
    let result = Scenario::new("system services")
        .device("alice")
        .send_to("alice", well_known::ECHO, 3, "ping")
        .send_to("alice", VirtualAddress::system(99), 3, "lost")
        .oracle(Box::new(|world| {
            assert_eq!(world.received_text("alice"), ["ping"]);
            let stats = world.switch_stats();
            assert_eq!(stats.to_service, 1);
            assert_eq!(stats.dropped_unknown, 1);
            Ok(())
        }))
        .run();

    assert!(result.is_ok(), "scenario should succeed: {result:?}");
}

#[test]
fn back_returns_to_the_launcher() {
    let result = Scenario::new("back")
        .device("alice")
        .send("alice", "alice", tags::CONTROL, "open clock")
        .tick(1)
        .go_back("alice")
        .oracle(oracle::focused("alice", mmos_apps::LAUNCHER))
        .run();

    assert!(result.is_ok(), "scenario should succeed: {result:?}");
}

#[test]
fn disconnect_drains_before_releasing() {
    // Bob leaves with alice's request still queued; the drain answers it
    // before the address is given up.
    let result = Scenario::new("drain on disconnect")
        .device("alice")
        .device("bob")
        .send("alice", "bob", tags::CONTROL, "list")
        .disconnect("bob")
        .oracle(Box::new(|world| {
            let bob = world.departed("bob").unwrap();
            assert_eq!(bob.abandoned, 0);
            assert!(!world.registry().is_allocated(bob.address));
            assert_eq!(world.received_text("alice"), ["calculator\nclock\necho"]);
            Ok(())
        }))
        .run();

    assert!(result.is_ok(), "scenario should succeed: {result:?}");
}

#[test]
fn packets_for_a_departed_device_are_dropped() {
    let result = Scenario::new("departed")
        .device("alice")
        .device("bob")
        .disconnect("bob")
        .send("alice", "bob", tags::ECHO, "anyone?")
        .oracle(oracle::all_of(vec![
            oracle::released("bob"),
            oracle::received("alice", &[]),
            oracle::nothing_in_flight(),
            Box::new(|world: &World| match world.switch_stats().dropped_unknown {
                1 => Ok(()),
                n => Err(format!("expected one unknown drop, got {n}")),
            }),
        ]))
        .run();

    assert!(result.is_ok(), "scenario should succeed: {result:?}");
}

#[test]
fn pool_exhaustion_fails_the_scenario() {
    let result = Scenario::new("full")
        .registry(RegistryConfig { capacity: 1, first_id: 1 })
        .device("alice")
        .device("bob")
        .oracle(Box::new(|_world| Ok(())))
        .run();

    let error = result.unwrap_err();
    assert!(error.contains("bob"), "{error}");
    assert!(error.contains("exhausted"), "{error}");
}

#[test]
fn released_addresses_are_reused_after_fresh_ones() {
    let result = Scenario::new("reuse")
        .registry(RegistryConfig { capacity: 2, first_id: 1 })
        .device("alice")
        .disconnect("alice")
        .oracle(Box::new(|world| {
            let mut addresses = vec![world.address("alice").unwrap()];
            let registry = world.registry();
            addresses.push(registry.allocate().unwrap());
            addresses.push(registry.allocate().unwrap());

            assert_eq!(
                addresses,
                [VirtualAddress::device(1), VirtualAddress::device(2), VirtualAddress::device(1)]
            );
            Ok(())
        }))
        .run();

    assert!(result.is_ok(), "scenario should succeed: {result:?}");
}
