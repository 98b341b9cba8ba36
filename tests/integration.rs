//! Integration tests for the handoff binary and the pool running real
//! worker processes.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::process::CommandExt;
use std::process::{Child, Stdio};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use assert_cmd::Command;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use predicates::prelude::*;
use tempfile::tempdir;

use handoff::worker::{Cluster, PoolConfig, ProcessSpawner, SlotPhase, default_env};

const BIN: &str = env!("CARGO_BIN_EXE_handoff");

/// Get a command for the handoff binary.
fn handoff() -> Command {
    Command::new(BIN)
}

/// Read one banner line and check that one line is echoed back.
fn session(addr: SocketAddr, line: &str) -> String {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    let mut banner = String::new();
    reader.read_line(&mut banner).unwrap();
    writeln!(writer, "{}", line).unwrap();
    let mut echoed = String::new();
    reader.read_line(&mut echoed).unwrap();
    assert_eq!(echoed.trim_end(), line);
    banner
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<std::process::ExitStatus> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            return Some(status);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    None
}

#[test]
fn test_help() {
    handoff()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("completions"));
}

#[test]
fn test_version() {
    handoff()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_completions() {
    handoff()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("handoff"));
}

#[test]
fn test_worker_outside_pool_fails() {
    handoff()
        .arg("worker")
        .env_remove("HANDOFF_CHANNEL_FD")
        .assert()
        .failure()
        .stderr(predicate::str::contains("HANDOFF_CHANNEL_FD"));
}

#[test]
fn test_serve_rejects_zero_workers() {
    handoff()
        .args(["serve", "--workers", "0"])
        .assert()
        .failure();
}

#[test]
fn test_serve_spreads_connections_round_robin() {
    let logs = tempdir().unwrap();
    let mut child = std::process::Command::new(BIN)
        .args(["-v", "serve", "--listen", "127.0.0.1:0", "--workers", "2"])
        .arg("--log-file")
        .arg(logs.path().join("handoff.log"))
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    // Workers share the stdout pipe, so read lines on the side
    let stdout = child.stdout.take().unwrap();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    let line = rx.recv_timeout(Duration::from_secs(30)).unwrap();
    let addr: SocketAddr = line
        .strip_prefix("listening on ")
        .unwrap_or_else(|| panic!("unexpected output: {}", line))
        .parse()
        .unwrap();

    let first = session(addr, "one");
    let second = session(addr, "two");
    let third = session(addr, "three");
    assert!(first.starts_with("handoff slot=0 "), "{}", first);
    assert!(second.starts_with("handoff slot=1 "), "{}", second);
    assert!(third.starts_with("handoff slot=0 "), "{}", third);
    assert_eq!(first, third);

    kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();
    let status = wait_with_timeout(&mut child, Duration::from_secs(10));
    assert!(status.is_some_and(|s| s.success()), "{:?}", status);

    let written = std::fs::read_dir(logs.path()).unwrap().count();
    assert!(written > 0);
}

#[test]
fn test_terminal_interrupt_stops_without_reviving() {
    let mut child = std::process::Command::new(BIN)
        .args(["--no-color", "serve", "--listen", "127.0.0.1:0", "--workers", "2"])
        // Its own group, like a foreground job receiving Ctrl+C
        .process_group(0)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let pgid = Pid::from_raw(child.id() as i32);

    let stdout = child.stdout.take().unwrap();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut line = String::new();
        BufReader::new(stdout).read_line(&mut line).unwrap();
        let _ = tx.send(line);
    });
    let stderr = child.stderr.take().unwrap();
    let (err_tx, err_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut text = String::new();
        let _ = BufReader::new(stderr).read_to_string(&mut text);
        let _ = err_tx.send(text);
    });

    let line = rx.recv_timeout(Duration::from_secs(30)).unwrap();
    assert!(line.starts_with("listening on "), "{}", line);

    killpg(pgid, Signal::SIGINT).unwrap();
    let status = wait_with_timeout(&mut child, Duration::from_secs(10));
    assert!(status.is_some_and(|s| s.success()), "{:?}", status);

    let logs = err_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(logs.matches("Worker started").count(), 2, "{}", logs);
    assert!(!logs.contains("terminated by SIGINT"), "{}", logs);
    assert!(!logs.contains('\x1b'), "colored output despite --no-color");
}

#[test]
fn test_cluster_revives_killed_worker() {
    // The prefix reaches the workers through the pool config alone
    let spawner = ProcessSpawner::new(BIN).arg("worker");
    let config = PoolConfig::new(2)
        .with_prefix("itest:")
        .with_startup_timeout(Duration::from_secs(30));
    let cluster = Cluster::with_spawner(config, spawner, Arc::new(default_env)).unwrap();
    cluster.start_and_wait().unwrap();

    let before = cluster.status().unwrap();
    let old = before.slots[1].worker.unwrap();
    cluster.kill(1).unwrap();

    let deadline = Instant::now() + Duration::from_secs(30);
    let replacement = loop {
        let status = cluster.status().unwrap();
        let slot = &status.slots[1];
        if slot.worker != Some(old) && slot.phase == SlotPhase::Ready {
            assert_eq!(status.slots[0].worker, before.slots[0].worker);
            break slot.worker.unwrap();
        }
        assert!(Instant::now() < deadline, "slot 1 was not revived");
        std::thread::sleep(Duration::from_millis(20));
    };

    // Hand a real connection to the new worker
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let (accepted, _) = listener.accept().unwrap();
    cluster.entrust(1, accepted).unwrap();

    let mut banner = String::new();
    BufReader::new(&client).read_line(&mut banner).unwrap();
    assert_eq!(banner, format!("handoff slot=1 worker={}\n", replacement));

    cluster.stop().unwrap();
    assert!(!cluster.status().unwrap().running);
}
