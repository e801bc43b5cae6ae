use std::io::{Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use crate::errors::{Error, Result};

// poll(2) takes milliseconds; saturate rather than wrap for huge durations.
fn millis(timeout: Duration) -> i32 {
    timeout.as_millis().min(i32::MAX as u128) as i32
}

// Wait for an fd to become ready for `events`, retrying on EINTR.
// ETIME when the deadline passes first.
fn wait_ready(fd: BorrowedFd<'_>, events: PollFlags, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        let mut fds = [PollFd::new(&fd, events)];
        match poll(&mut fds, millis(remaining)) {
            Ok(0) => return Err(Error::Sys(Errno::ETIME)),
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::Sys(e)),
        }
    }
}

/// Wait until `fd` is readable, failing with `ETIME` once `timeout` passes.
pub(crate) fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> Result<()> {
    wait_ready(fd, PollFlags::POLLIN, timeout)
}

/// Write all of `buf`, gating each chunk on writability with a deadline.
pub(crate) fn write_all_bounded<W>(writer: &mut W, buf: &[u8], timeout: Duration) -> Result<()>
where
    W: Write + AsFd,
{
    let deadline = Instant::now() + timeout;
    let mut off = 0;
    while off < buf.len() {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(Error::Sys(Errno::ETIME))?;
        wait_ready(writer.as_fd(), PollFlags::POLLOUT, remaining)?;
        match writer.write(&buf[off..]) {
            Ok(0) => return Err(Error::Sys(Errno::EPIPE)),
            Ok(n) => off += n,
            Err(e) => return Err(Error::from_io(&e)),
        }
    }
    Ok(())
}

/// Read exactly `buf.len()` bytes before the deadline.
///
/// End-of-stream before the buffer fills is `EPIPE`; running out of time is
/// `ETIME`.
pub(crate) fn read_exact_bounded<R>(reader: &mut R, buf: &mut [u8], timeout: Duration) -> Result<()>
where
    R: Read + AsFd,
{
    let deadline = Instant::now() + timeout;
    let mut off = 0;
    while off < buf.len() {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(Error::Sys(Errno::ETIME))?;
        wait_readable(reader.as_fd(), remaining)?;
        match reader.read(&mut buf[off..]) {
            Ok(0) => return Err(Error::Sys(Errno::EPIPE)),
            Ok(n) => off += n,
            Err(e) => return Err(Error::from_io(&e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn test_wait_readable_times_out() {
        let (a, _b) = UnixStream::pair().expect("Failed to create socketpair");
        let err = wait_readable(a.as_fd(), Duration::from_millis(10)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_read_exact_bounded_eof() {
        let (mut a, b) = UnixStream::pair().expect("Failed to create socketpair");
        drop(b);
        let mut buf = [0u8; 4];
        let err = read_exact_bounded(&mut a, &mut buf, Duration::from_millis(50)).unwrap_err();
        assert_eq!(err, Error::Sys(Errno::EPIPE));
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let (mut a, mut b) = UnixStream::pair().expect("Failed to create socketpair");
        write_all_bounded(&mut a, b"Ready\n", Duration::from_secs(1)).unwrap();
        let mut buf = [0u8; 6];
        read_exact_bounded(&mut b, &mut buf, Duration::from_secs(1)).unwrap();
        assert_eq!(&buf, b"Ready\n");
    }
}
