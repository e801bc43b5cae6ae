use std::fs::File;
use std::io::Read;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::Duration;

use log::{debug, error};
use nix::errno::Errno;

use crate::errors::{Error, Result};
use crate::util::{wait_readable, write_all_bounded};

/// Size of the inbound line buffer; a line that cannot fit is a protocol
/// violation.
pub const CONTROL_BUF_SIZE: usize = 128;

/// How long to wait for `done` after an acknowledged request.
pub const CONTROL_ACK_TIMEOUT: Duration = Duration::from_secs(120);

const WRITE_TIMEOUT: Duration = Duration::from_secs(120);

/// A message read from the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Acknowledgment of the last `prepare:`/`suspend:` request.
    Done,
    /// Start restoring the named backend.
    Restore(String),
    /// Tear the whole migration down.
    Abort,
}

/// Newline-delimited text channel to the orchestrator that spawned us.
///
/// Both directions run over inherited fds. Outbound requests that expect an
/// acknowledgment (`prepare:`, `suspend:`) gate further sends until `done`
/// arrives; the caller drives the receive loop and feeds `done` back via
/// [`Control::clear_ack`].
pub struct Control {
    input: File,
    output: File,
    buf: Box<[u8]>,
    len: usize,
    waiting_ack: bool,
    last_percent: i64,
}

fn parse_message(line: &[u8]) -> Result<ControlMessage> {
    let line = std::str::from_utf8(line).map_err(|_| Error::Sys(Errno::EINVAL))?;
    if line == "done" {
        Ok(ControlMessage::Done)
    } else if let Some(name) = line.strip_prefix("restore:") {
        Ok(ControlMessage::Restore(name.to_owned()))
    } else if line == "abort" {
        Ok(ControlMessage::Abort)
    } else {
        error!("unknown orchestrator message: {:?}", line);
        Err(Error::Sys(Errno::EINVAL))
    }
}

impl Control {
    /// Build a channel from the two inherited fds.
    pub fn new(input: OwnedFd, output: OwnedFd) -> Self {
        Self::with_buffer_size(input, output, CONTROL_BUF_SIZE)
    }

    /// Like [`Control::new`] with a custom inbound buffer size.
    pub fn with_buffer_size(input: OwnedFd, output: OwnedFd, size: usize) -> Self {
        Self {
            input: File::from(input),
            output: File::from(output),
            buf: vec![0; size].into_boxed_slice(),
            len: 0,
            waiting_ack: false,
            last_percent: -1,
        }
    }

    /// The inbound fd, for inclusion in the coordinator poll set.
    pub fn input_fd(&self) -> BorrowedFd<'_> {
        self.input.as_fd()
    }

    /// True while a `prepare:`/`suspend:` acknowledgment is outstanding.
    pub fn waiting_ack(&self) -> bool {
        self.waiting_ack
    }

    /// Record that the pending acknowledgment arrived.
    ///
    /// `EINVAL` when no acknowledgment was outstanding.
    pub fn clear_ack(&mut self) -> Result<()> {
        if !self.waiting_ack {
            error!("orchestrator sent done with no request pending");
            return Err(Error::Sys(Errno::EINVAL));
        }
        self.waiting_ack = false;
        Ok(())
    }

    fn send_line(&mut self, line: &str) -> Result<()> {
        // Requests are strictly serialized on this channel; a send while an
        // acknowledgment is pending is a sequencing bug in the caller.
        if self.waiting_ack {
            error!("control send of {:?} while ack pending", line);
            return Err(Error::Sys(Errno::EINVAL));
        }
        debug!("control <- {:?}", line);
        write_all_bounded(&mut self.output, line.as_bytes(), WRITE_TIMEOUT)?;
        write_all_bounded(&mut self.output, b"\n", WRITE_TIMEOUT)
    }

    /// Ask the orchestrator to prepare the data stream for `name`.
    ///
    /// Gates the channel until `done` comes back.
    pub fn send_prepare(&mut self, name: &str) -> Result<()> {
        self.send_line(&format!("prepare:{}", name))?;
        self.waiting_ack = true;
        Ok(())
    }

    /// Ask the orchestrator to suspend the guest. Gates like
    /// [`Control::send_prepare`].
    pub fn send_suspend(&mut self) -> Result<()> {
        self.send_line("suspend:")?;
        self.waiting_ack = true;
        Ok(())
    }

    /// Emit a progress tick, deduplicated on the integer percentage.
    ///
    /// The four backspaces overwrite the previous value in the legacy
    /// terminal consumer; keep them bit-exact.
    pub fn send_progress(&mut self, percent: i64) -> Result<()> {
        if percent == self.last_percent {
            return Ok(());
        }
        self.send_line(&format!("info:\x08\x08\x08\x08{}", percent))?;
        self.last_percent = percent;
        Ok(())
    }

    /// Report one backend's final result.
    pub fn send_result(&mut self, name: &str, literal: Option<&str>) -> Result<()> {
        match literal {
            Some(lit) => self.send_line(&format!("result:{} {}", name, lit)),
            None => self.send_line(&format!("result:{}", name)),
        }
    }

    /// Report overall migration success.
    pub fn send_success(&mut self) -> Result<()> {
        self.send_line("result:0 0")
    }

    /// Report the run's failure. Never gated: by the time this is sent the
    /// run is unwinding and any outstanding acknowledgment is moot.
    pub fn send_error(&mut self, name: Option<&str>, text: &str) -> Result<()> {
        self.waiting_ack = false;
        match name {
            Some(name) => self.send_line(&format!("error:{} {}", name, text)),
            None => self.send_line(&format!("error:{}", text)),
        }
    }

    /// Read from the orchestrator and return every complete message.
    ///
    /// Blocks up to `timeout` for the fd to become readable (`ETIME`
    /// otherwise). A closed peer is `EPIPE`; a full buffer with no newline
    /// is `EMSGSIZE`; an unrecognized line is `EINVAL`.
    pub fn recv(&mut self, timeout: Duration) -> Result<Vec<ControlMessage>> {
        wait_readable(self.input.as_fd(), timeout)?;
        let n = match self.input.read(&mut self.buf[self.len..]) {
            Ok(0) => return Err(Error::Sys(Errno::EPIPE)),
            Ok(n) => n,
            Err(e) => return Err(Error::from_io(&e)),
        };
        self.len += n;

        let mut messages = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buf[start..self.len].iter().position(|&b| b == b'\n') {
            let line = &self.buf[start..start + pos];
            debug!("control -> {:?}", String::from_utf8_lossy(line));
            messages.push(parse_message(line)?);
            start += pos + 1;
        }

        // Compact the partial trailing message to the buffer head.
        self.buf.copy_within(start..self.len, 0);
        self.len -= start;

        if messages.is_empty() && self.len == self.buf.len() {
            error!("orchestrator line exceeds {} bytes", self.buf.len());
            return Err(Error::Sys(Errno::EMSGSIZE));
        }
        Ok(messages)
    }
}
