use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::thread::{self, JoinHandle};

use serde_json::Value;
use tempfile::TempDir;

use emu_manager::{BackendSpec, Control, Manager};

// A test rig: a manager wired to a scripted orchestrator thread, with its
// backend sockets rooted in a tempdir.
//
// Note: tests must hold onto the rig until the run is over; dropping the
// manager hangs up on the orchestrator, whose log is then collected with
// `finish`.
pub struct Rig {
    pub mgr: Manager,
    pub dir: TempDir,
    orchestrator: JoinHandle<Vec<String>>,
}

impl Rig {
    pub fn new<F>(table: &'static [BackendSpec], respond: F) -> Self
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        let dir = tempfile::tempdir().expect("Failed to create tempdir");
        let (mgr_in, orch_out) = UnixStream::pair().expect("Failed to create socketpair");
        let (mgr_out, orch_in) = UnixStream::pair().expect("Failed to create socketpair");
        let control = Control::new(mgr_in.into(), mgr_out.into());
        let mut mgr = Manager::with_table(7, control, table);
        mgr.set_socket_dirs(dir.path(), dir.path());
        let orchestrator = spawn_orchestrator(orch_out, orch_in, respond);
        Rig {
            mgr,
            dir,
            orchestrator,
        }
    }

    // Drop the manager and collect everything the orchestrator saw.
    pub fn finish(self) -> Vec<String> {
        drop(self.mgr);
        self.orchestrator.join().expect("Orchestrator thread panicked")
    }
}

// The orchestrator side of the control channel: log every line the
// coordinator writes and feed back whatever the responder says.
pub fn spawn_orchestrator<F>(
    input: UnixStream,
    output: UnixStream,
    mut respond: F,
) -> JoinHandle<Vec<String>>
where
    F: FnMut(&str) -> Vec<String> + Send + 'static,
{
    thread::spawn(move || {
        let mut log = Vec::new();
        let mut input = input;
        let reader = BufReader::new(output);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            log.push(line.clone());
            for reply in respond(&line) {
                // The coordinator may already be gone; that ends the run.
                if input.write_all(reply.as_bytes()).is_err() {
                    break;
                }
            }
        }
        log
    })
}

// Acknowledge every request that expects one.
pub fn ack_all(line: &str) -> Vec<String> {
    if line.starts_with("prepare:") || line == "suspend:" {
        vec!["done\n".to_owned()]
    } else {
        Vec::new()
    }
}

// A scripted backend: accept one connection, acknowledge every command, and
// follow selected commands with extra frames (events). Returns the command
// names it saw, in order.
pub fn spawn_backend(
    listener: UnixListener,
    greeting: Option<String>,
    script: HashMap<&'static str, Vec<String>>,
) -> JoinHandle<Vec<String>> {
    thread::spawn(move || {
        let (mut sock, _) = listener.accept().expect("Backend accept failed");
        if let Some(greeting) = greeting {
            sock.write_all(greeting.as_bytes()).unwrap();
        }

        let mut received = Vec::new();
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        'serve: loop {
            let n = match sock.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);

            loop {
                let mut objects =
                    serde_json::Deserializer::from_slice(&buf).into_iter::<Value>();
                let value = match objects.next() {
                    Some(Ok(value)) => {
                        let consumed = objects.byte_offset();
                        drop(objects);
                        buf.drain(..consumed);
                        value
                    }
                    _ => break,
                };

                let cmd = value["execute"].as_str().unwrap_or("").to_owned();
                received.push(cmd.clone());
                if cmd == "quit" {
                    break 'serve;
                }
                sock.write_all(br#"{"return":{}}"#).unwrap();
                if let Some(frames) = script.get(cmd.as_str()) {
                    for frame in frames {
                        sock.write_all(frame.as_bytes()).unwrap();
                    }
                }
            }
        }
        received
    })
}

// A connected socket fd suitable as a fake data stream; the peer end leaks
// for the duration of the test process.
pub fn stream_fd() -> RawFd {
    let (a, b) = UnixStream::pair().expect("Failed to create socketpair");
    std::mem::forget(b);
    a.into_raw_fd()
}

// Extract the integer progress values from an orchestrator log.
pub fn info_values(log: &[String]) -> Vec<i64> {
    log.iter()
        .filter_map(|line| line.strip_prefix("info:\x08\x08\x08\x08"))
        .map(|value| value.parse().expect("Bad info value"))
        .collect()
}

pub fn migration_event(body: &str) -> String {
    format!(r#"{{"event":"MIGRATION","data":{{{}}}}}"#, body)
}
