//! Console scripts against a device backed by a layout file.

use std::{fs, path::Path, time::Duration};

use mmos_core::{KernelConfig, layout::FileLayoutStore};
use mmos_standalone::{Command, Console};

const TICK: Duration = Duration::from_millis(16);

fn boot(path: &Path) -> Console {
    let config =
        KernelConfig { home_app: Some(mmos_apps::LAUNCHER.to_string()), ..KernelConfig::default() };
    Console::boot(Box::new(FileLayoutStore::new(path)), config, TICK).unwrap()
}

fn script(console: &mut Console, input: &str) -> String {
    let mut out = Vec::new();
    console.run_script(input.as_bytes(), &mut out).unwrap();
    String::from_utf8(out).unwrap()
}

fn run(console: &mut Console, line: &str) -> Vec<String> {
    let command = Command::parse(line).unwrap().unwrap();
    console.execute(&command).unwrap()
}

#[test]
fn script_transcript() {
    let dir = tempfile::tempdir().unwrap();
    let mut console = boot(&dir.path().join("layout.json"));

    let transcript = script(
        &mut console,
        "# warm up
list
open calculator
send 20 12+30=
stack
reboot
back
stack
tick 3
",
    );

    insta::assert_snapshot!(transcript, @r"
    [1] calculator
    clock
    echo
    [1] ok
    [20] 42
    launcher (Suspended)
    calculator (Active)
    error: cannot parse command: reboot
    launcher (Active)
    ");
}

#[test]
fn app_state_survives_a_reboot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("layout.json");

    let mut console = boot(&path);
    assert_eq!(run(&mut console, "open calculator"), ["[1] ok"]);
    assert_eq!(run(&mut console, "send 20 12+30="), ["[20] 42"]);
    let layout = console.shutdown().unwrap();
    assert!(layout.app_state.contains_key("calculator"));
    assert!(path.exists());

    let mut console = boot(&path);
    assert_eq!(run(&mut console, "send 1 recent"), ["[1] calculator"]);
    assert_eq!(run(&mut console, "open calculator"), ["[1] ok"]);
    assert_eq!(run(&mut console, "send 20 +1="), ["[20] 43"]);
}

#[test]
fn save_writes_the_layout_without_stopping() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("layout.json");

    let mut console = boot(&path);
    run(&mut console, "open clock");
    assert_eq!(run(&mut console, "save"), ["saved"]);
    assert!(path.exists());

    // Only the focused app ticks, so the launcher answers once it is back on top.
    assert!(run(&mut console, "send 1 recent").is_empty());
    run(&mut console, "back");
    assert_eq!(run(&mut console, "tick"), ["[1] clock"]);
}

#[test]
fn corrupt_layout_boots_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("layout.json");
    fs::write(&path, b"{ not a layout").unwrap();

    let mut console = boot(&path);
    assert_eq!(run(&mut console, "stack"), ["launcher (Active)"]);
    assert_eq!(run(&mut console, "send 1 recent"), ["[1] "]);
}

#[test]
fn navigation_errors_are_reported_and_the_script_continues() {
    let dir = tempfile::tempdir().unwrap();
    let mut console = boot(&dir.path().join("layout.json"));

    let transcript = script(&mut console, "overlay\nback\ndismiss\nstack\n");
    let lines: Vec<&str> = transcript.lines().collect();

    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("error: kernel error:"), "{}", lines[0]);
    assert_eq!(lines[1], "launcher (Active)");
}

#[test]
fn packets_for_other_addresses_are_not_printed() {
    let dir = tempfile::tempdir().unwrap();
    let mut console = boot(&dir.path().join("layout.json"));

    assert!(run(&mut console, "tick 5").is_empty());
    let stats = run(&mut console, "stats");
    assert_eq!(stats.len(), 1);
    assert!(stats[0].starts_with("sent "), "{}", stats[0]);
}
