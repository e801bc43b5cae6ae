use std::io;

use nix::errno::Errno;
use thiserror::Error as ThisError;

/// Errors produced while coordinating a migration.
///
/// The domain is the set of POSIX error numbers the channels and the
/// sequencer raise, plus three sentinels describing how a backend process
/// went away. `Display` yields the exact text reported to the orchestrator
/// in `error:` lines: the standard errno description for [`Error::Sys`], a
/// fixed English phrase for each sentinel.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A POSIX error (`EPIPE`, `ETIME`, `EINVAL`, `EMSGSIZE`, `ENOSTR`,
    /// `ESHUTDOWN`, `EREMOTEIO`, ...).
    #[error("{}", .0.desc())]
    Sys(Errno),
    /// A backend closed its socket while we still expected traffic.
    #[error("unexpectedly disconnected")]
    Disconnected,
    /// A backend child terminated on a signal.
    #[error("was killed by a signal")]
    Killed,
    /// A backend child exited with a nonzero status.
    #[error("exited with an error")]
    ExitedWithError,
}

impl Error {
    /// True for the clean-shutdown error raised by an orchestrator `abort`.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Sys(Errno::ESHUTDOWN))
    }

    /// True for the soft timeout raised by bounded reads and the poll loop.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Sys(Errno::ETIME))
    }

    /// Map an [`io::Error`] onto the errno domain.
    pub fn from_io(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Error::Sys(Errno::from_i32(code)),
            None => Error::Sys(Errno::EIO),
        }
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::Sys(errno)
    }
}

/// Result alias used across the coordinator.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_text() {
        assert_eq!(Error::Sys(Errno::EINVAL).to_string(), "Invalid argument");
        assert_eq!(Error::Disconnected.to_string(), "unexpectedly disconnected");
        assert_eq!(Error::Killed.to_string(), "was killed by a signal");
        assert_eq!(Error::ExitedWithError.to_string(), "exited with an error");
    }

    #[test]
    fn test_shutdown_classification() {
        assert!(Error::Sys(Errno::ESHUTDOWN).is_shutdown());
        assert!(!Error::Sys(Errno::EINVAL).is_shutdown());
        assert!(Error::Sys(Errno::ETIME).is_timeout());
        assert!(!Error::Disconnected.is_timeout());
    }

    #[test]
    fn test_io_error_mapping() {
        let err = io::Error::from_raw_os_error(Errno::EPIPE as i32);
        assert_eq!(Error::from_io(&err), Error::Sys(Errno::EPIPE));
        let opaque = io::Error::new(io::ErrorKind::Other, "opaque");
        assert_eq!(Error::from_io(&opaque), Error::Sys(Errno::EIO));
    }

    #[test]
    fn test_errno_conversion() {
        let err: Error = Errno::EMSGSIZE.into();
        assert_eq!(err, Error::Sys(Errno::EMSGSIZE));
    }
}
