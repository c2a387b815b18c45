//! End-to-end checks over real named pipes.
//!
//! One test plays the driven system on a thread against `LineTransport`;
//! the others launch the `bridge` subcommand with a shell child.

#![cfg(unix)]

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use model_harness::core::command::Command as GameCommand;
use model_harness::io::coordinator::{Coordinator, WaitSettings};
use model_harness::io::fifo::PipeDir;
use model_harness::io::transport::LineTransport;

const MENU: &str = r#"{"ready_for_command":true,"in_game":false,"available_commands":["start","state"]}"#;

fn quick_settings() -> WaitSettings {
    WaitSettings {
        ready: Duration::from_secs(5),
        poll_interval: Duration::from_millis(50),
        state_update: Duration::from_secs(5),
        first_ready: Duration::from_secs(5),
        ..WaitSettings::default()
    }
}

#[test]
fn coordinator_talks_through_fifos() {
    let temp = tempfile::tempdir().expect("tempdir");
    let pipes = PipeDir::create(Some(temp.path())).expect("pipes");
    let paths = pipes.paths().clone();

    let game_paths = paths.clone();
    let game = thread::spawn(move || -> std::io::Result<Vec<String>> {
        let mut to_harness = OpenOptions::new().write(true).open(&game_paths.input)?;
        let from_harness = BufReader::new(File::open(&game_paths.output)?);
        writeln!(to_harness, "ready")?;
        writeln!(to_harness, "{MENU}")?;
        let mut received = Vec::new();
        for line in from_harness.lines() {
            let line = line?;
            if line == "state" {
                writeln!(to_harness, "{MENU}")?;
            }
            received.push(line);
        }
        Ok(received)
    });

    let transport = LineTransport::open_pipes(&paths).expect("open pipes");
    let mut coord = Coordinator::connect(transport, quick_settings());

    let first = coord.await_first_ready().expect("first ready");
    assert!(first.ready_for_command);
    assert!(!first.in_session);
    assert_eq!(first.available_commands, vec!["start", "state"]);

    coord.send_message(&GameCommand::new("state")).expect("send");
    assert!(!coord.is_ready());
    coord
        .await_ready(Duration::from_secs(5))
        .expect("ready after state");
    assert!(coord.trusted().is_trusted());

    drop(coord);
    let received = game.join().expect("game thread").expect("game io");
    assert_eq!(received, vec!["state".to_string()]);
}

#[test]
fn bridge_relays_lines_between_stdio_and_child() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = r#"read line < "$STS_GAME_INPUT_PIPE"; printf 'got:%s\n' "$line" > "$STS_GAME_OUTPUT_PIPE""#;

    let mut bridge = Command::new(env!("CARGO_BIN_EXE_model-harness"))
        .arg("bridge")
        .arg("--pipe-dir")
        .arg(temp.path())
        .args(["--", "sh", "-c", script])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn bridge");

    let mut stdin = bridge.stdin.take().expect("bridge stdin");
    writeln!(stdin, "hello").expect("write to bridge");
    drop(stdin);

    let output = bridge.wait_with_output().expect("bridge output");
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8(output.stdout).expect("utf8 stdout");
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, vec!["ready", "got:hello"]);
}

#[test]
fn bridge_exits_with_the_child_status() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = Command::new(env!("CARGO_BIN_EXE_model-harness"))
        .arg("bridge")
        .arg("--pipe-dir")
        .arg(temp.path())
        .args(["--", "sh", "-c", "exit 3"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("run bridge");
    assert_eq!(status.code(), Some(3));
}
