use std::collections::VecDeque;
use std::io::{IoSlice, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use log::{debug, error};
use nix::errno::Errno;
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use serde_json::{Map, Value};

use crate::arglist::ArgList;
use crate::errors::{Error, Result};
use crate::util::{wait_readable, write_all_bounded};

/// Size of the inbound frame buffer; a single JSON object that cannot fit
/// is a protocol violation.
pub const CLIENT_BUF_SIZE: usize = 1024;

/// How long a request may wait for its `return`.
pub const CLIENT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// A backend command descriptor.
///
/// `needs_fd` marks the commands whose send carries an ancillary file
/// descriptor.
pub struct CommandSpec {
    /// Wire name, the value of the `execute` field.
    pub name: &'static str,
    /// Whether the send carries the data-stream fd as ancillary data.
    pub needs_fd: bool,
}

const fn plain(name: &'static str) -> CommandSpec {
    CommandSpec { name, needs_fd: false }
}

/// Hand the data-plane fd to the backend.
pub const MIGRATE_INIT: CommandSpec = CommandSpec { name: "migrate_init", needs_fd: true };
/// Flush the queued argument list to the backend.
pub const SET_ARGS: CommandSpec = plain("set_args");
/// Start dirty-page tracking.
pub const TRACK_DIRTY: CommandSpec = plain("track_dirty");
/// Ask for `MIGRATION` progress events.
pub const MIGRATE_PROGRESS: CommandSpec = plain("migrate_progress");
/// Start the live copy.
pub const MIGRATE_LIVE: CommandSpec = plain("migrate_live");
/// Pause the backend ahead of the final copy.
pub const MIGRATE_PAUSE: CommandSpec = plain("migrate_pause");
/// Run the final copy of a paused backend.
pub const MIGRATE_PAUSED: CommandSpec = plain("migrate_paused");
/// Run a non-live (stop-and-copy) migration.
pub const MIGRATE_NONLIVE: CommandSpec = plain("migrate_nonlive");
/// Abandon an in-flight migration.
pub const MIGRATE_ABORT: CommandSpec = plain("migrate_abort");
/// Start consuming the incoming stream on the restore side.
pub const RESTORE: CommandSpec = plain("restore");
/// Ask a spawned backend to exit.
pub const QUIT: CommandSpec = plain("quit");
/// Complete the device-model capabilities handshake.
pub const QMP_CAPABILITIES: CommandSpec = plain("qmp_capabilities");
/// Toggle the device model's global dirty log.
pub const SET_GLOBAL_DIRTY_LOG: CommandSpec = plain("xen-set-global-dirty-log");

/// A server-initiated notification read off a backend channel.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event type (`MIGRATION`, or `QMP` for the device-model greeting).
    pub kind: String,
    /// Payload object, when the event carried one.
    pub data: Option<Value>,
}

/// Framed JSON request/response/event channel to one backend.
///
/// Frames are concatenated JSON objects; an incremental tokenizer finds the
/// boundaries and keeps a partial trailing object for the next read. Every
/// request gates the channel until its `return` arrives; events observed
/// while waiting are queued for the coordinator to drain afterwards.
pub struct Client {
    sock: UnixStream,
    buf: Box<[u8]>,
    len: usize,
    waiting_ack: bool,
    events: VecDeque<Event>,
}

fn request_body(cmd: &CommandSpec, args: Option<&ArgList>) -> String {
    let mut map = Map::new();
    map.insert("execute".to_owned(), Value::String(cmd.name.to_owned()));
    if let Some(args) = args {
        if !args.is_empty() {
            map.insert("arguments".to_owned(), args.to_object());
        }
    }
    Value::Object(map).to_string()
}

impl Client {
    /// Wrap a connected backend socket.
    pub fn new(sock: UnixStream) -> Self {
        Self::with_buffer_size(sock, CLIENT_BUF_SIZE)
    }

    /// Like [`Client::new`] with a custom inbound buffer size.
    pub fn with_buffer_size(sock: UnixStream, size: usize) -> Self {
        Self {
            sock,
            buf: vec![0; size].into_boxed_slice(),
            len: 0,
            waiting_ack: false,
            events: VecDeque::new(),
        }
    }

    /// The socket fd, for inclusion in the coordinator poll set.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.sock.as_fd()
    }

    /// Take every event queued so far.
    pub fn take_events(&mut self) -> VecDeque<Event> {
        std::mem::take(&mut self.events)
    }

    /// Forget any outstanding acknowledgment.
    ///
    /// Used when unwinding a failed exchange before a best-effort
    /// `migrate_abort`; the reply we were waiting for is not coming.
    pub fn reset_ack(&mut self) {
        self.waiting_ack = false;
    }

    /// Send a request and wait for its `return`.
    ///
    /// `fd` must be provided for `needs_fd` commands and is passed as
    /// ancillary data on the same send. Events arriving before the
    /// acknowledgment are queued.
    pub fn call(&mut self, cmd: &CommandSpec, args: Option<&ArgList>, fd: Option<RawFd>) -> Result<()> {
        // One request in flight per channel; overlapping sends are a
        // sequencing bug in the caller.
        if self.waiting_ack {
            error!("backend send of {} while ack pending", cmd.name);
            return Err(Error::Sys(Errno::EINVAL));
        }

        let body = request_body(cmd, args);
        debug!("backend <- {}", body);
        let bytes = body.as_bytes();
        if cmd.needs_fd {
            let fd = fd.ok_or(Error::Sys(Errno::EINVAL))?;
            let fds = [fd];
            let iov = [IoSlice::new(bytes)];
            let cmsgs = [ControlMessage::ScmRights(&fds)];
            let sent = sendmsg::<UnixAddr>(
                self.sock.as_raw_fd(),
                &iov,
                &cmsgs,
                MsgFlags::empty(),
                None,
            )?;
            if sent < bytes.len() {
                write_all_bounded(&mut self.sock, &bytes[sent..], WRITE_TIMEOUT)?;
            }
        } else {
            write_all_bounded(&mut self.sock, bytes, WRITE_TIMEOUT)?;
        }

        self.waiting_ack = true;
        let deadline = Instant::now() + CLIENT_ACK_TIMEOUT;
        while self.waiting_ack {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(Error::Sys(Errno::ETIME))?;
            self.recv(remaining)?;
        }
        Ok(())
    }

    /// Send a request without waiting for anything to come back.
    ///
    /// Used for `quit` at teardown, where the peer exits instead of
    /// replying.
    pub fn send_only(&mut self, cmd: &CommandSpec) -> Result<()> {
        let body = request_body(cmd, None);
        debug!("backend <- {}", body);
        write_all_bounded(&mut self.sock, body.as_bytes(), WRITE_TIMEOUT)
    }

    /// Read from the backend and process every complete object.
    ///
    /// Blocks up to `timeout` for readability (`ETIME` otherwise, including
    /// `Duration::ZERO` probes with nothing pending). A closed peer is
    /// `EPIPE`.
    pub fn recv(&mut self, timeout: Duration) -> Result<()> {
        wait_readable(self.sock.as_fd(), timeout)?;
        let n = match self.sock.read(&mut self.buf[self.len..]) {
            Ok(0) => return Err(Error::Sys(Errno::EPIPE)),
            Ok(n) => n,
            Err(e) => return Err(Error::from_io(&e)),
        };
        self.len += n;

        let mut values = Vec::new();
        let mut consumed = 0;
        {
            let mut objects =
                serde_json::Deserializer::from_slice(&self.buf[..self.len]).into_iter::<Value>();
            loop {
                match objects.next() {
                    Some(Ok(value)) => {
                        consumed = objects.byte_offset();
                        values.push(value);
                    }
                    // Partial trailing object: keep it for the next read.
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => {
                        error!("backend sent malformed JSON: {}", e);
                        return Err(Error::Sys(Errno::EINVAL));
                    }
                    None => break,
                }
            }
        }
        self.buf.copy_within(consumed..self.len, 0);
        self.len -= consumed;

        if values.is_empty() && self.len == self.buf.len() {
            error!("backend object exceeds {} bytes", self.buf.len());
            return Err(Error::Sys(Errno::EMSGSIZE));
        }

        for value in values {
            self.process_object(value)?;
        }
        Ok(())
    }

    // Field-by-field demux of one top-level object.
    fn process_object(&mut self, value: Value) -> Result<()> {
        debug!("backend -> {}", value);
        let object = match value {
            Value::Object(object) => object,
            _ => {
                error!("backend sent a non-object frame");
                return Err(Error::Sys(Errno::EINVAL));
            }
        };

        let mut event_kind = None;
        let mut event_data = None;
        let mut greeting = None;
        for (key, value) in object {
            match key.as_str() {
                "return" => {
                    if !self.waiting_ack {
                        error!("backend sent return with no request pending");
                        return Err(Error::Sys(Errno::EINVAL));
                    }
                    self.waiting_ack = false;
                }
                "error" => {
                    error!("backend reported: {}", value);
                    return Err(Error::Sys(Errno::EINVAL));
                }
                "event" => match value {
                    Value::String(kind) => event_kind = Some(kind),
                    _ => return Err(Error::Sys(Errno::EINVAL)),
                },
                "data" => match value {
                    Value::Object(_) => event_data = Some(value),
                    _ => return Err(Error::Sys(Errno::EINVAL)),
                },
                "QMP" => match value {
                    Value::Object(_) => greeting = Some(value),
                    _ => return Err(Error::Sys(Errno::EINVAL)),
                },
                "timestamp" => (),
                other => {
                    error!("backend sent unexpected field {:?}", other);
                    return Err(Error::Sys(Errno::EINVAL));
                }
            }
        }

        if let Some(kind) = event_kind {
            self.events.push_back(Event { kind, data: event_data });
        } else if let Some(greeting) = greeting {
            self.events.push_back(Event {
                kind: "QMP".to_owned(),
                data: Some(greeting),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use nix::sys::socket::{recvmsg, ControlMessageOwned};
    use serde_json::json;

    use super::*;

    fn pair() -> (Client, UnixStream) {
        let (ours, theirs) = UnixStream::pair().expect("Failed to create socketpair");
        (Client::new(ours), theirs)
    }

    fn read_request(sock: &mut UnixStream) -> Value {
        let mut buf = [0u8; 1024];
        let n = sock.read(&mut buf).unwrap();
        serde_json::from_slice(&buf[..n]).unwrap()
    }

    #[test]
    fn test_call_waits_for_return() {
        let (mut client, mut peer) = pair();
        peer.write_all(br#"{"return":{}}"#).unwrap();
        client.call(&TRACK_DIRTY, None, None).unwrap();
        assert_eq!(read_request(&mut peer), json!({"execute": "track_dirty"}));
    }

    #[test]
    fn test_call_with_arguments() {
        let (mut client, mut peer) = pair();
        peer.write_all(br#"{"return":{}}"#).unwrap();
        let mut args = ArgList::new();
        args.push_bool("enable", true);
        client.call(&SET_GLOBAL_DIRTY_LOG, Some(&args), None).unwrap();
        assert_eq!(
            read_request(&mut peer),
            json!({"execute": "xen-set-global-dirty-log", "arguments": {"enable": true}})
        );
    }

    #[test]
    fn test_events_queued_during_call() {
        let (mut client, mut peer) = pair();
        peer.write_all(
            br#"{"event":"MIGRATION","data":{"sent":1024}}{"return":{}}"#,
        )
        .unwrap();
        client.call(&MIGRATE_LIVE, None, None).unwrap();
        let events = client.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "MIGRATION");
        assert_eq!(events[0].data, Some(json!({"sent": 1024})));
    }

    #[test]
    fn test_partial_object_retained() {
        let (mut client, mut peer) = pair();
        peer.write_all(br#"{"event":"MIGRA"#).unwrap();
        client.recv(Duration::from_secs(1)).unwrap();
        assert!(client.take_events().is_empty());
        peer.write_all(br#"TION","data":{"iteration":1}}"#).unwrap();
        client.recv(Duration::from_secs(1)).unwrap();
        assert_eq!(client.take_events().len(), 1);
    }

    #[test]
    fn test_malformed_json() {
        let (mut client, mut peer) = pair();
        peer.write_all(b"}{").unwrap();
        assert_eq!(
            client.recv(Duration::from_secs(1)).unwrap_err(),
            Error::Sys(Errno::EINVAL)
        );
    }

    #[test]
    fn test_oversized_object() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let mut client = Client::with_buffer_size(ours, 32);
        peer.write_all(br#"{"event":"MIGRATION","data":{"som"#).unwrap();
        assert_eq!(
            client.recv(Duration::from_secs(1)).unwrap_err(),
            Error::Sys(Errno::EMSGSIZE)
        );
    }

    #[test]
    fn test_unexpected_return() {
        let (mut client, mut peer) = pair();
        peer.write_all(br#"{"return":{}}"#).unwrap();
        assert_eq!(
            client.recv(Duration::from_secs(1)).unwrap_err(),
            Error::Sys(Errno::EINVAL)
        );
    }

    #[test]
    fn test_error_reply() {
        let (mut client, mut peer) = pair();
        peer.write_all(br#"{"error":"no such command"}"#).unwrap();
        assert_eq!(
            client.recv(Duration::from_secs(1)).unwrap_err(),
            Error::Sys(Errno::EINVAL)
        );
    }

    #[test]
    fn test_unknown_field() {
        let (mut client, mut peer) = pair();
        peer.write_all(br#"{"bogus":1}"#).unwrap();
        assert_eq!(
            client.recv(Duration::from_secs(1)).unwrap_err(),
            Error::Sys(Errno::EINVAL)
        );
    }

    #[test]
    fn test_timestamp_ignored() {
        let (mut client, mut peer) = pair();
        peer.write_all(br#"{"timestamp":{"seconds":1},"event":"MIGRATION"}"#)
            .unwrap();
        client.recv(Duration::from_secs(1)).unwrap();
        assert_eq!(client.take_events().len(), 1);
    }

    #[test]
    fn test_greeting_dispatch() {
        let (mut client, mut peer) = pair();
        peer.write_all(br#"{"QMP":{"version":{}}}"#).unwrap();
        client.recv(Duration::from_secs(1)).unwrap();
        let events = client.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "QMP");
    }

    #[test]
    fn test_disconnect_is_epipe() {
        let (mut client, peer) = pair();
        drop(peer);
        assert_eq!(
            client.recv(Duration::from_secs(1)).unwrap_err(),
            Error::Sys(Errno::EPIPE)
        );
    }

    #[test]
    fn test_fd_passing() {
        let (mut client, peer) = pair();
        let (extra, _keep) = UnixStream::pair().unwrap();

        // Reply first so the call can complete single-threaded.
        let mut writer = peer.try_clone().unwrap();
        writer.write_all(br#"{"return":{}}"#).unwrap();
        client
            .call(&MIGRATE_INIT, None, Some(extra.as_raw_fd()))
            .unwrap();

        let mut buf = [0u8; 256];
        let mut iov = [std::io::IoSliceMut::new(&mut buf)];
        let mut cmsg = nix::cmsg_space!([RawFd; 1]);
        let msg = recvmsg::<UnixAddr>(
            peer.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::empty(),
        )
        .unwrap();
        let received: Vec<ControlMessageOwned> = msg.cmsgs().collect();
        assert!(matches!(
            received.as_slice(),
            [ControlMessageOwned::ScmRights(fds)] if fds.len() == 1
        ));
    }
}
