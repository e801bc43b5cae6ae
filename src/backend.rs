use std::path::PathBuf;

use bitflags::bitflags;
use log::{debug, warn};
use nix::unistd::Pid;

use crate::arglist::ArgList;
use crate::client::Client;
use crate::errors::Error;
use crate::stream::StreamRef;

bitflags! {
    /// Capability bits gating a backend's participation in each phase.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u32 {
        /// Takes part in the run at all.
        const ENABLED = 1 << 0;
        /// Performs the live copy.
        const MIGRATE_LIVE = 1 << 1;
        /// The coordinator waits for its live stage to converge.
        const WAIT_LIVE_STAGE_DONE = 1 << 2;
        /// Performs the paused final copy.
        const MIGRATE_PAUSED = 1 << 3;
        /// Performs a stop-and-copy migration.
        const MIGRATE_NON_LIVE = 1 << 4;
    }
}

/// Which wire dialect a backend speaks, and how we reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Paravirtualized engine: spawned as a child, rich command set,
    /// fd-passing capable.
    Emp,
    /// Device-model management endpoint: connect-only, greeting banner plus
    /// capabilities handshake.
    QmpLibxl,
}

/// Migration lifecycle of one backend. Never moves backwards in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    /// Created, nothing sent yet.
    Uninitialized,
    /// Handshook and configured.
    Initialized,
    /// Consuming the incoming stream.
    Restoring,
    /// Live copy converged, ready to pause.
    LiveStageDone,
    /// The backend finished moving its state.
    MigrationDone,
    /// Result reported to the orchestrator.
    Completed,
}

/// Per-backend migration counters, fed by `MIGRATION` events.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Bytes still to transfer in the current iteration.
    pub remaining: i64,
    /// Bytes transferred when the current iteration started.
    pub sent: i64,
    /// Last mid-iteration byte count observed.
    pub sent_mid_iteration: i64,
    /// Copy iteration the counters belong to; `-1` before any report.
    pub iteration: i32,
    /// Synthetic size used while the backend has not reported numbers.
    pub fake_total: i64,
    /// Final result literal returned by the backend, if any.
    pub result: Option<String>,
}

impl Progress {
    fn new(fake_total: i64) -> Self {
        Self {
            remaining: 0,
            sent: 0,
            sent_mid_iteration: 0,
            iteration: -1,
            fake_total,
            result: None,
        }
    }

    /// Forget everything learned during the run, keeping the synthetic
    /// size.
    pub fn clear(&mut self) {
        *self = Self::new(self.fake_total);
    }
}

/// Static description of one backend table entry.
///
/// The table is data: adding a backend means adding a row.
pub struct BackendSpec {
    /// Short identifier used in orchestrator messages and logs.
    pub name: &'static str,
    /// Executable path for backends we spawn ourselves.
    pub path: Option<&'static str>,
    /// Wire dialect.
    pub kind: Kind,
    /// Default capability set; `--dm` turns `ENABLED` on for the rest.
    pub caps: Caps,
    /// Synthetic progress mass before real numbers arrive.
    pub fake_total: i64,
}

const XENGUEST_FAKE_TOTAL: i64 = 1 << 30;

/// The fixed backend table.
pub const BACKENDS: &[BackendSpec] = &[
    BackendSpec {
        name: "xenguest",
        path: Some("/usr/libexec/xen/bin/xenguest"),
        kind: Kind::Emp,
        caps: Caps::ENABLED
            .union(Caps::MIGRATE_LIVE)
            .union(Caps::WAIT_LIVE_STAGE_DONE)
            .union(Caps::MIGRATE_PAUSED),
        fake_total: XENGUEST_FAKE_TOTAL,
    },
    BackendSpec {
        name: "qemu",
        path: None,
        kind: Kind::QmpLibxl,
        caps: Caps::empty(),
        fake_total: 0,
    },
];

/// One emulator backend and everything the coordinator knows about it.
pub struct Backend {
    /// Short identifier used in orchestrator messages and logs.
    pub name: &'static str,
    /// Executable path when the backend is spawned as a child.
    pub path: Option<PathBuf>,
    /// Wire dialect.
    pub kind: Kind,
    /// Current capability set; empty means inert in every phase.
    pub caps: Caps,
    /// Channel to the backend, between connect and disconnect.
    pub client: Option<Client>,
    /// Data-plane stream shared with other backends on the same fd.
    pub stream: Option<StreamRef>,
    /// Child pid while a spawned backend is alive and unreaped.
    pub pid: Option<Pid>,
    /// Arguments queued for `set_args` at init.
    pub args: ArgList,
    /// Migration counters.
    pub progress: Progress,
    /// Set once the device-model greeting banner was seen.
    pub qmp_established: bool,
    state: State,
    error: Option<Error>,
    first_failed: bool,
}

impl Backend {
    /// Instantiate a table row.
    pub fn new(spec: &BackendSpec) -> Self {
        Self {
            name: spec.name,
            path: spec.path.map(PathBuf::from),
            kind: spec.kind,
            caps: spec.caps,
            client: None,
            stream: None,
            pid: None,
            args: ArgList::new(),
            progress: Progress::new(spec.fake_total),
            qmp_established: false,
            state: State::Uninitialized,
            error: None,
            first_failed: false,
        }
    }

    /// True when the backend takes part in this run.
    pub fn active(&self) -> bool {
        !self.caps.is_empty()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Advance the lifecycle state. States never move backwards; a
    /// backwards request is ignored and logged.
    pub fn set_state(&mut self, state: State) {
        if state < self.state {
            warn!(
                "{}: refusing state regression {:?} -> {:?}",
                self.name, self.state, state
            );
            return;
        }
        debug!("{}: state {:?} -> {:?}", self.name, self.state, state);
        self.state = state;
    }

    /// The first error recorded for this backend, frozen for the run.
    pub fn error(&self) -> Option<Error> {
        self.error
    }

    /// Record an error; only the first one sticks. Returns whether this
    /// call recorded it.
    pub fn record_error(&mut self, error: Error) -> bool {
        if self.error.is_some() {
            return false;
        }
        self.error = Some(error);
        true
    }

    /// True for the single backend whose failure is reported upstream.
    pub fn is_first_failed(&self) -> bool {
        self.first_failed
    }

    /// Flag this backend as the first to fail.
    pub fn mark_first_failed(&mut self) {
        self.first_failed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xenguest() -> Backend {
        Backend::new(&BACKENDS[0])
    }

    #[test]
    fn test_table_shape() {
        assert_eq!(BACKENDS.len(), 2);
        assert_eq!(BACKENDS[0].name, "xenguest");
        assert_eq!(BACKENDS[0].kind, Kind::Emp);
        assert!(BACKENDS[0].caps.contains(Caps::ENABLED));
        assert_eq!(BACKENDS[1].name, "qemu");
        assert_eq!(BACKENDS[1].kind, Kind::QmpLibxl);
        assert!(BACKENDS[1].caps.is_empty());
    }

    #[test]
    fn test_states_are_ordered() {
        assert!(State::Uninitialized < State::Initialized);
        assert!(State::Initialized < State::Restoring);
        assert!(State::Restoring < State::LiveStageDone);
        assert!(State::LiveStageDone < State::MigrationDone);
        assert!(State::MigrationDone < State::Completed);
    }

    #[test]
    fn test_state_never_regresses() {
        let mut backend = xenguest();
        backend.set_state(State::MigrationDone);
        backend.set_state(State::Initialized);
        assert_eq!(backend.state(), State::MigrationDone);
    }

    #[test]
    fn test_first_error_is_frozen() {
        let mut backend = xenguest();
        assert!(backend.record_error(Error::Disconnected));
        assert!(!backend.record_error(Error::Killed));
        assert_eq!(backend.error(), Some(Error::Disconnected));
    }

    #[test]
    fn test_progress_clear_keeps_fake_total() {
        let mut backend = xenguest();
        backend.progress.iteration = 3;
        backend.progress.result = Some("ok".to_owned());
        backend.progress.clear();
        assert_eq!(backend.progress.iteration, -1);
        assert_eq!(backend.progress.result, None);
        assert_eq!(backend.progress.fake_total, XENGUEST_FAKE_TOTAL);
    }
}
