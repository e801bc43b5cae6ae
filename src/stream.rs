use std::cell::RefCell;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use log::debug;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::stat::{fstat, SFlag};

use crate::errors::{Error, Result};

/// Shared handle around the data-plane fd migration bytes flow through.
///
/// Several backends may be configured against the same underlying fd; they
/// then alias one wrapper. `remaining_uses` counts how many backends still
/// have to consume the fd through the init-time hand-off; the fd is closed
/// locally once the last ticket is spent. Wrapper lifetime is the `Rc`
/// strong count: the wrapper goes away when the last backend releases its
/// reference at disconnect.
#[derive(Debug)]
pub struct SharedStream {
    fd: RawFd,
    handle: Option<OwnedFd>,
    busy: bool,
    remaining_uses: u32,
}

/// Reference to a [`SharedStream`], one per attached backend.
pub type StreamRef = Rc<RefCell<SharedStream>>;

// A stream fd that is neither a socket nor a FIFO must be read-only or
// append-writable; anything else would rewind or clobber the image.
fn check_stream_fd(fd: RawFd) -> Result<()> {
    let stat = fstat(fd)?;
    let fmt = SFlag::from_bits_truncate(stat.st_mode & SFlag::S_IFMT.bits());
    if fmt == SFlag::S_IFSOCK || fmt == SFlag::S_IFIFO {
        return Ok(());
    }

    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    let accmode = flags & OFlag::O_ACCMODE;
    if accmode == OFlag::O_RDONLY || flags.contains(OFlag::O_APPEND) {
        Ok(())
    } else {
        Err(Error::Sys(Errno::ENOSTR))
    }
}

impl SharedStream {
    /// Wrap `fd`, taking ownership of it.
    ///
    /// Fails with `ENOSTR` if the fd is a regular file open for write
    /// without append (see module invariants).
    pub fn open(fd: RawFd) -> Result<StreamRef> {
        check_stream_fd(fd)?;
        // Ownership transfer: the caller hands the fd over for the rest of
        // the run.
        let handle = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Rc::new(RefCell::new(Self {
            fd,
            handle: Some(handle),
            busy: false,
            remaining_uses: 1,
        })))
    }

    /// Alias an existing wrapper for one more backend: one more hand-off
    /// ticket, one more holder.
    pub fn share(stream: &StreamRef) -> StreamRef {
        stream.borrow_mut().remaining_uses += 1;
        Rc::clone(stream)
    }

    /// The fd number this wrapper was created from.
    ///
    /// Used for aliasing checks and for building commands; stays valid as a
    /// number even after the local handle is closed.
    pub fn fd_number(&self) -> RawFd {
        self.fd
    }

    /// The open fd, for hand-off to a backend.
    ///
    /// Fails with `EBADF` once every use has been consumed and the local
    /// handle is closed.
    pub fn raw_fd(&self) -> Result<RawFd> {
        match &self.handle {
            Some(_) => Ok(self.fd),
            None => Err(Error::Sys(Errno::EBADF)),
        }
    }

    /// True while some backend is moving data over the stream.
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Flip the busy flag; setting the current value again is `EINVAL`.
    pub fn set_busy(&mut self, busy: bool) -> Result<()> {
        if self.busy == busy {
            return Err(Error::Sys(Errno::EINVAL));
        }
        self.busy = busy;
        Ok(())
    }

    /// Number of backends that still have to consume the fd.
    pub fn remaining_uses(&self) -> u32 {
        self.remaining_uses
    }

    /// Spend one hand-off ticket; closes the local fd with the last one.
    pub fn consume_use(&mut self) -> Result<()> {
        if self.remaining_uses == 0 {
            return Err(Error::Sys(Errno::EBADF));
        }
        self.remaining_uses -= 1;
        if self.remaining_uses == 0 {
            debug!("stream fd {} fully handed off, closing local copy", self.fd);
            self.handle = None;
        }
        Ok(())
    }

    /// Mark the fd close-on-exec so spawned children do not inherit it.
    pub fn set_cloexec(&self) -> Result<()> {
        let fd = self.raw_fd()?;
        let mut flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
        flags.insert(FdFlag::FD_CLOEXEC);
        fcntl(fd, FcntlArg::F_SETFD(flags))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::os::fd::IntoRawFd;
    use std::os::unix::net::UnixStream;

    use rstest::rstest;
    use tempfile::tempdir;

    use super::*;

    fn file_fd(read: bool, write: bool, append: bool) -> RawFd {
        let dir = tempdir().expect("Failed to create tempdir");
        let path = dir.path().join("stream");
        std::fs::write(&path, b"").expect("Failed to create file");
        let file = OpenOptions::new()
            .read(read)
            .write(write)
            .append(append)
            .open(&path)
            .expect("Failed to open file");
        // Leak the tempdir so the path outlives the open; fine for a test.
        std::mem::forget(dir);
        file.into_raw_fd()
    }

    #[rstest]
    #[case(true, false, false, true)] // read-only accepted
    #[case(false, true, false, false)] // write-only rejected
    #[case(false, false, true, true)] // append-write accepted
    fn test_regular_file_modes(
        #[case] read: bool,
        #[case] write: bool,
        #[case] append: bool,
        #[case] accepted: bool,
    ) {
        let result = SharedStream::open(file_fd(read, write, append));
        match result {
            Ok(_) => assert!(accepted),
            Err(e) => {
                assert!(!accepted);
                assert_eq!(e, Error::Sys(Errno::ENOSTR));
            }
        }
    }

    #[test]
    fn test_socket_always_accepted() {
        let (a, _b) = UnixStream::pair().expect("Failed to create socketpair");
        let stream = SharedStream::open(a.into_raw_fd()).expect("Socket rejected");
        assert_eq!(stream.borrow().remaining_uses(), 1);
    }

    #[test]
    fn test_share_and_consume_lifecycle() {
        let (a, _b) = UnixStream::pair().expect("Failed to create socketpair");
        let stream = SharedStream::open(a.into_raw_fd()).unwrap();
        let alias = SharedStream::share(&stream);
        assert_eq!(stream.borrow().remaining_uses(), 2);
        assert_eq!(Rc::strong_count(&stream), 2);

        stream.borrow_mut().consume_use().unwrap();
        assert!(stream.borrow().raw_fd().is_ok());
        alias.borrow_mut().consume_use().unwrap();
        assert_eq!(alias.borrow().raw_fd().unwrap_err(), Error::Sys(Errno::EBADF));
        assert_eq!(
            alias.borrow_mut().consume_use().unwrap_err(),
            Error::Sys(Errno::EBADF)
        );

        // Holders release independently of ticket consumption.
        drop(alias);
        assert_eq!(Rc::strong_count(&stream), 1);
    }

    #[test]
    fn test_busy_toggle() {
        let (a, _b) = UnixStream::pair().expect("Failed to create socketpair");
        let stream = SharedStream::open(a.into_raw_fd()).unwrap();
        stream.borrow_mut().set_busy(true).unwrap();
        assert_eq!(
            stream.borrow_mut().set_busy(true).unwrap_err(),
            Error::Sys(Errno::EINVAL)
        );
        stream.borrow_mut().set_busy(false).unwrap();
        assert!(!stream.borrow().is_busy());
    }
}
