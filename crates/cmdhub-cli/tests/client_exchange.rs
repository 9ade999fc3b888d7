//! Drives the `cmdhub` binary against a scripted daemon.

use std::io::Write;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use assert_cmd::Command;
use cmdhub_protocol::{StatusCode, encode_frame, read_text_frame, write_i32, write_status};
use predicates::prelude::*;
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct FakeDaemon {
    _dir: TempDir,
    socket: PathBuf,
}

impl FakeDaemon {
    fn endpoint(&self) -> String {
        format!("unix://{}", self.socket.display())
    }

    /// Answers one petition with `status` and `output`; yields the request.
    fn answer_once(&self, status: StatusCode, output: &'static [u8]) -> JoinHandle<String> {
        let listener = UnixListener::bind(&self.socket).expect("bind listening socket");
        let response_path = response_path(&self.socket, 1);
        thread::spawn(move || {
            let (mut request, _) = listener.accept().expect("accept petition");
            let line = read_text_frame(&mut request).expect("request frame");
            let response = UnixListener::bind(&response_path).expect("bind response socket");
            write_i32(&mut request, 1).expect("petition id");
            drop(request);

            let (mut channel, _) = response.accept().expect("accept response");
            write_status(&mut channel, status).expect("status");
            channel.write_all(output).expect("output");
            line
        })
    }

    /// Registers one listener and pushes `messages` to it.
    fn push_once(&self, messages: &'static [&'static str]) -> JoinHandle<String> {
        let listener = UnixListener::bind(&self.socket).expect("bind listening socket");
        let response_path = response_path(&self.socket, 1);
        thread::spawn(move || {
            let (mut request, _) = listener.accept().expect("accept petition");
            let line = read_text_frame(&mut request).expect("request frame");
            let response = UnixListener::bind(&response_path).expect("bind response socket");
            write_i32(&mut request, 1).expect("petition id");

            let (mut channel, _) = response.accept().expect("accept listener");
            for message in messages {
                channel
                    .write_all(&encode_frame(message.as_bytes()))
                    .expect("push");
            }
            line
        })
    }
}

fn response_path(socket: &Path, id: u32) -> PathBuf {
    PathBuf::from(format!("{}_{id}", socket.display()))
}

#[fixture]
fn daemon() -> FakeDaemon {
    let dir = TempDir::new().expect("temp dir");
    let socket = dir.path().join("srv");
    FakeDaemon { _dir: dir, socket }
}

#[rstest]
fn prints_output_and_exits_with_ok(daemon: FakeDaemon) {
    let served = daemon.answer_once(StatusCode::OK, b"hello world\n");

    Command::cargo_bin("cmdhub")
        .expect("binary")
        .args(["--daemon-socket", &daemon.endpoint(), "echo", "hello", "world"])
        .assert()
        .success()
        .stdout("hello world\n");

    assert_eq!(served.join().expect("daemon thread"), "echo hello world");
}

#[rstest]
fn negative_statuses_become_exit_codes(daemon: FakeDaemon) {
    let served = daemon.answer_once(StatusCode::EARGS, b"usage: echo <text>\n");

    Command::cargo_bin("cmdhub")
        .expect("binary")
        .args(["--daemon-socket", &daemon.endpoint(), "echo"])
        .assert()
        .code(51)
        .stdout(predicate::str::contains("usage"));

    served.join().expect("daemon thread");
}

#[rstest]
fn listeners_print_pushes_but_not_probes(daemon: FakeDaemon) {
    let served = daemon.push_once(&["clientID:1", "ack", "progress:1:2:upload"]);

    Command::cargo_bin("cmdhub")
        .expect("binary")
        .args(["--daemon-socket", &daemon.endpoint(), "--listen"])
        .assert()
        .success()
        .stdout("clientID:1\nprogress:1:2:upload\n");

    assert_eq!(served.join().expect("daemon thread"), "registerstatelistener");
}

#[rstest]
fn a_missing_daemon_is_reported(daemon: FakeDaemon) {
    Command::cargo_bin("cmdhub")
        .expect("binary")
        .args(["--daemon-socket", &daemon.endpoint(), "version"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to connect to daemon"));
}

#[rstest]
fn invalid_endpoints_are_usage_errors() {
    Command::cargo_bin("cmdhub")
        .expect("binary")
        .args(["--daemon-socket", "ftp://example.com/x", "version"])
        .assert()
        .code(2);
}
