#![cfg(all(unix, feature = "cli"))]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread;

use mvlc_frame::codec::words_to_bytes;
use mvlc_frame::commands::decode_command_buffer;
use mvlc_frame::{encode_frame_header, FrameFlags, FrameType, SuperCommand};

const CMD_BUFFER_END: u32 = 0xF200_0000;

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/mvlccli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn mvlc(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_mvlc"))
        .args(["--log-level", "error"])
        .args(args)
        .env_remove("MVLC_HOST")
        .output()
        .expect("mvlc should run")
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("temp path should be utf-8")
}

fn json_lines(output: &Output) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("stdout line should be json"))
        .collect()
}

/// Answers register reads and writes on the command socket for one client.
fn spawn_register_device(listener: UnixListener) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("client should connect");
        let mut registers: HashMap<u16, u32> = HashMap::from([(0x6008, 0x0037)]);
        let mut pending = Vec::new();
        let mut buf = [0u8; 1024];

        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            pending.extend_from_slice(&buf[..n]);

            let words: Vec<u32> = pending
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            let Some(end) = words.iter().position(|&w| w == CMD_BUFFER_END) else {
                continue;
            };
            pending.drain(..(end + 1) * 4);

            let mut mirror = Vec::new();
            for cmd in decode_command_buffer(&words[..=end]) {
                cmd.encode_into(&mut mirror);
                match cmd {
                    SuperCommand::ReadLocal { address } => {
                        mirror.push(registers.get(&address).copied().unwrap_or(0));
                    }
                    SuperCommand::WriteLocal { address, value } => {
                        registers.insert(address, value);
                    }
                    _ => {}
                }
            }

            let mut response = vec![encode_frame_header(
                FrameType::SuperFrame,
                FrameFlags::NONE,
                0,
                0,
                mirror.len() as u16,
            )];
            response.extend(mirror);
            if stream.write_all(&words_to_bytes(&response)).is_err() {
                return;
            }
        }
    })
}

#[test]
fn version_prints_package_version() {
    let output = mvlc(&["version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("mvlc "));

    let output = mvlc(&["version", "--extended"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("name: mvlc"));
}

#[test]
fn generate_then_parse_reports_all_events() {
    let dir = unique_temp_dir("roundtrip");
    let data = dir.join("run.bin");
    let stacks = dir.join("stacks.json");

    let output = mvlc(&[
        "--format",
        "json",
        "generate",
        path_str(&data),
        "--events",
        "25",
        "--modules",
        "3",
        "--dynamic-words",
        "40",
        "--frame-max-words",
        "16",
        "--timetick-every",
        "10",
        "--stacks-out",
        path_str(&stacks),
    ]);
    assert!(output.status.success(), "generate failed: {output:?}");
    let generated = json_lines(&output);
    assert_eq!(generated[0]["events"], "25");

    let output = mvlc(&[
        "--format",
        "json",
        "parse",
        path_str(&data),
        "--stacks",
        path_str(&stacks),
        "--buffer-words",
        "64",
    ]);
    assert!(output.status.success(), "parse failed: {output:?}");

    let summary = &json_lines(&output)[0];
    assert_eq!(summary["events"]["0"], 25);
    assert_eq!(summary["unused_bytes"], 0);
    assert_eq!(summary["system_events"]["BeginRun"], 1);
    assert_eq!(summary["system_events"]["EndRun"], 1);
    assert_eq!(summary["system_events"]["UnixTimetick"], 3);

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn parse_prints_events_with_module_parts() {
    let dir = unique_temp_dir("events");
    let data = dir.join("run.bin");
    let stacks = dir.join("stacks.json");

    let output = mvlc(&[
        "generate",
        path_str(&data),
        "--events",
        "2",
        "--modules",
        "1",
        "--dynamic-words",
        "3",
        "--stacks-out",
        path_str(&stacks),
    ]);
    assert!(output.status.success());

    let output = mvlc(&[
        "--format",
        "json",
        "parse",
        path_str(&data),
        "--stacks",
        path_str(&stacks),
        "--events",
    ]);
    assert!(output.status.success());

    let lines = json_lines(&output);
    assert_eq!(lines.len(), 3);
    let module = &lines[1]["modules"][0];
    assert_eq!(module["prefix"].as_array().map(Vec::len), Some(1));
    assert_eq!(module["dynamic"].as_array().map(Vec::len), Some(3));
    assert_eq!(module["suffix"].as_array().map(Vec::len), Some(1));

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn decode_lists_top_level_frames() {
    let dir = unique_temp_dir("decode");
    let data = dir.join("run.bin");

    let output = mvlc(&[
        "generate",
        path_str(&data),
        "--events",
        "1",
        "--modules",
        "1",
        "--dynamic-words",
        "2",
    ]);
    assert!(output.status.success());

    let output = mvlc(&["--format", "json", "decode", path_str(&data)]);
    assert!(output.status.success());

    let entries = json_lines(&output);
    // BeginRun, stack frame, EndRun
    assert_eq!(entries.len(), 3);
    assert!(entries[0]["description"]
        .as_str()
        .unwrap_or_default()
        .starts_with("SystemEvent"));
    assert!(entries[1]["description"]
        .as_str()
        .unwrap_or_default()
        .starts_with("StackResultFrame"));

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn parse_rejects_invalid_stacks_file() {
    let dir = unique_temp_dir("badstacks");
    let data = dir.join("run.bin");
    let stacks = dir.join("stacks.json");
    std::fs::write(&data, [0u8; 8]).expect("data should be writable");
    std::fs::write(&stacks, "not json").expect("stacks should be writable");

    let output = mvlc(&["parse", path_str(&data), "--stacks", path_str(&stacks)]);
    assert_eq!(output.status.code(), Some(60));

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn register_commands_require_a_target() {
    let output = mvlc(&["read-register", "0x6008"]);
    assert_eq!(output.status.code(), Some(64));
    assert!(String::from_utf8_lossy(&output.stderr).contains("--host or --socket"));
}

#[test]
fn register_read_and_write_over_socket() {
    let dir = unique_temp_dir("register");
    let sock = dir.join("cmd.sock");
    let listener = UnixListener::bind(&sock).expect("socket should bind");
    let device = spawn_register_device(listener);

    let output = mvlc(&["--format", "raw", "read-register", "0x6008", "--socket", path_str(&sock)]);
    assert!(output.status.success(), "read failed: {output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().collect::<Vec<_>>(), ["0x6008", "0x00000037"]);
    device.join().expect("device thread should finish");

    let listener = UnixListener::bind(dir.join("cmd2.sock")).expect("socket should bind");
    let device = spawn_register_device(listener);
    let output = mvlc(&[
        "--format",
        "json",
        "write-register",
        "0x1100",
        "0x100",
        "--socket",
        path_str(&dir.join("cmd2.sock")),
    ]);
    assert!(output.status.success(), "write failed: {output:?}");
    assert_eq!(json_lines(&output)[0]["status"], "ok");
    device.join().expect("device thread should finish");

    let _ = std::fs::remove_dir_all(dir);
}
