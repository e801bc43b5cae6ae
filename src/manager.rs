use std::fs::File;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use itertools::Itertools;
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde_json::{Map, Value};

use crate::arglist::ArgList;
use crate::backend::{Backend, BackendSpec, Caps, Kind, State, BACKENDS};
use crate::client::{self, Client, CommandSpec, Event};
use crate::control::{Control, ControlMessage, CONTROL_ACK_TIMEOUT};
use crate::errors::{Error, Result};
use crate::stream::SharedStream;
use crate::util::read_exact_bounded;

const POLL_TIMEOUT_MS: i32 = 30_000;
const READY_TIMEOUT: Duration = Duration::from_secs(180);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REAP_TIMEOUT: Duration = Duration::from_secs(60);
const REAP_INTERVAL: Duration = Duration::from_millis(100);

// Spawned children get a scrubbed environment with stdio buffering off, so
// the Ready line is not stuck in a stdio buffer.
const STDBUF_PRELOAD: &str = "/usr/libexec/coreutils/libstdbuf.so";

const DEFAULT_CONTROL_DIR: &str = "/run/xen";
const DEFAULT_QMP_DIR: &str = "/var/run/xen";

// Live-stage convergence: few enough dirty bytes left, or the backend has
// been around the copy loop often enough.
const LIVE_STAGE_REMAINING_MAX: i64 = 50;
const LIVE_STAGE_MAX_ITERATIONS: i32 = 4;

// Weight of the mid-iteration sample in the aggregate numerator.
const MID_ITERATION_WEIGHT: f64 = 0.80;

/// What kind of run the orchestrator asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Save an HVM guest.
    HvmSave,
    /// Save a PV guest.
    Save,
    /// Restore an HVM guest.
    HvmRestore,
    /// Restore a PV guest.
    Restore,
}

impl Mode {
    /// True for the restore modes.
    pub fn is_restore(&self) -> bool {
        matches!(self, Mode::HvmRestore | Mode::Restore)
    }
}

/// The migration coordinator: owns the orchestrator channel and the backend
/// table, sequences the phases, and runs the poll-driven event loop.
pub struct Manager {
    dom_id: u32,
    control: Control,
    backends: Vec<Backend>,
    control_dir: PathBuf,
    qmp_dir: PathBuf,
}

// Retry for a bounded window; the child may still be binding its listener.
fn connect_to_uds(path: &Path) -> Result<UnixStream> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    while Instant::now() < deadline {
        if let Ok(stream) = UnixStream::connect(path) {
            return Ok(stream);
        }
        thread::sleep(Duration::from_millis(50));
    }

    // One final attempt to surface the real error.
    UnixStream::connect(path).map_err(|e| {
        error!("Failed to connect to {}: {}", path.display(), e);
        Error::from_io(&e)
    })
}

impl Manager {
    /// Build a coordinator for `dom_id` over the standard backend table.
    pub fn new(dom_id: u32, control: Control) -> Self {
        Self::with_table(dom_id, control, BACKENDS)
    }

    /// Like [`Manager::new`] with a caller-supplied backend table.
    pub fn with_table(dom_id: u32, control: Control, table: &[BackendSpec]) -> Self {
        Self {
            dom_id,
            control,
            backends: table.iter().map(Backend::new).collect(),
            control_dir: PathBuf::from(DEFAULT_CONTROL_DIR),
            qmp_dir: PathBuf::from(DEFAULT_QMP_DIR),
        }
    }

    /// Override where backend control sockets are looked up.
    pub fn set_socket_dirs<P: Into<PathBuf>>(&mut self, control_dir: P, qmp_dir: P) {
        self.control_dir = control_dir.into();
        self.qmp_dir = qmp_dir.into();
    }

    /// The backend table, for inspection.
    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.backends
            .iter()
            .position(|b| b.name == name)
            .ok_or_else(|| {
                error!("no backend named {:?}", name);
                Error::Sys(Errno::EINVAL)
            })
    }

    /// Turn a backend on for this run, optionally attaching a data stream.
    pub fn enable_backend(&mut self, name: &str, fd: Option<RawFd>) -> Result<()> {
        let idx = self.index_of(name)?;
        self.backends[idx].caps.insert(Caps::ENABLED);
        if let Some(fd) = fd {
            if self.backends[idx].kind != Kind::Emp {
                error!("{}: backend kind does not accept a data stream", name);
                return Err(Error::Sys(Errno::EINVAL));
            }
            self.attach_stream(name, fd)?;
        }
        Ok(())
    }

    /// Attach the data-plane fd to a backend.
    ///
    /// A fd already attached to another backend is aliased: both share one
    /// wrapper with one hand-off ticket per backend.
    pub fn attach_stream(&mut self, name: &str, fd: RawFd) -> Result<()> {
        let idx = self.index_of(name)?;
        if self.backends[idx].stream.is_some() {
            error!("{}: stream already attached", name);
            return Err(Error::Sys(Errno::EINVAL));
        }

        let alias = self
            .backends
            .iter()
            .filter_map(|b| b.stream.as_ref())
            .find(|s| s.borrow().fd_number() == fd)
            .map(SharedStream::share);
        let stream = match alias {
            Some(stream) => {
                debug!("{}: sharing stream fd {}", name, fd);
                stream
            }
            None => SharedStream::open(fd)?,
        };
        self.backends[idx].stream = Some(stream);
        Ok(())
    }

    /// Queued arguments for a backend, to be flushed at init.
    pub fn backend_args(&mut self, name: &str) -> Result<&mut ArgList> {
        let idx = self.index_of(name)?;
        Ok(&mut self.backends[idx].args)
    }

    /// Override where a spawned backend's executable lives.
    pub fn set_backend_path<P: Into<PathBuf>>(&mut self, name: &str, path: P) -> Result<()> {
        let idx = self.index_of(name)?;
        self.backends[idx].path = Some(path.into());
        Ok(())
    }

    // Record an error against a backend, freezing the first one and
    // flagging the process-wide first failure. Returns the error for
    // chaining.
    fn fail(&mut self, idx: usize, error: Error) -> Error {
        let already_failed = self.backends.iter().any(|b| b.error().is_some());
        let backend = &mut self.backends[idx];
        if backend.record_error(error) && !already_failed {
            backend.mark_first_failed();
            error!("{}: failed: {}", backend.name, error);
        }
        error
    }

    /// The backend whose failure gets reported upstream, if any failed.
    pub fn first_failure(&self) -> Option<(&'static str, Error)> {
        self.backends
            .iter()
            .find(|b| b.is_first_failed())
            .and_then(|b| b.error().map(|e| (b.name, e)))
    }

    /// Drive the configured run to completion.
    pub fn run(&mut self, mode: Mode, live: bool) -> Result<()> {
        self.configure(live, mode)?;
        self.spawn()?;
        self.connect()?;
        self.init()?;
        if mode.is_restore() {
            self.restore()
        } else {
            self.save(live)
        }
    }

    /// Resolve each backend's capabilities for this run.
    pub fn configure(&mut self, live: bool, mode: Mode) -> Result<()> {
        for backend in &mut self.backends {
            if let Some(stream) = &backend.stream {
                // Children re-enable on their copy after the hand-off dup.
                stream.borrow().set_cloexec()?;
            }
            if !backend.caps.contains(Caps::ENABLED) {
                backend.caps = Caps::empty();
                continue;
            }
            match backend.kind {
                Kind::Emp if !live => {
                    backend.caps
                        .remove(Caps::MIGRATE_LIVE | Caps::WAIT_LIVE_STAGE_DONE);
                    backend.caps.insert(Caps::MIGRATE_NON_LIVE);
                }
                Kind::QmpLibxl if !live || mode.is_restore() => {
                    backend.caps = Caps::empty();
                }
                _ => (),
            }
            debug!("{}: configured caps {:?}", backend.name, backend.caps);
        }
        Ok(())
    }

    /// Spawn every active EMP backend that has an executable, and wait for
    /// each to announce readiness.
    pub fn spawn(&mut self) -> Result<()> {
        for idx in 0..self.backends.len() {
            let (path, name) = match &self.backends[idx] {
                b if b.active() && b.kind == Kind::Emp && b.path.is_some() => {
                    (b.path.clone().unwrap(), b.name)
                }
                _ => continue,
            };

            let mut command = Command::new(&path);
            command
                .arg("-debug")
                .arg("-domid")
                .arg(self.dom_id.to_string())
                .arg("-controloutfd")
                .arg("2")
                .arg("-controlinfd")
                .arg("0")
                .arg("-mode")
                .arg("listen")
                .env_clear()
                .env("LD_PRELOAD", STDBUF_PRELOAD)
                .env("_STDBUF_O", "0")
                .stdout(Stdio::piped());
            debug!(
                "{} invocation: {} {}",
                name,
                command.get_program().to_string_lossy(),
                command.get_args().map(|a| a.to_string_lossy()).join(" ")
            );

            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(e) => {
                    error!("{}: failed to spawn {}: {}", name, path.display(), e);
                    return Err(self.fail(idx, Error::from_io(&e)));
                }
            };
            self.backends[idx].pid = Some(Pid::from_raw(child.id() as i32));

            // unwrap() cannot fail: stdout is piped above.
            let stdout = child.stdout.take().unwrap();
            let mut pipe = File::from(unsafe { OwnedFd::from_raw_fd(stdout.into_raw_fd()) });
            let mut ready = [0u8; 6];
            if let Err(e) = read_exact_bounded(&mut pipe, &mut ready, READY_TIMEOUT) {
                error!("{}: no ready banner: {}", name, e);
                return Err(self.fail(idx, e));
            }
            if &ready != b"Ready\n" {
                error!(
                    "{}: unexpected banner {:?}",
                    name,
                    String::from_utf8_lossy(&ready)
                );
                return Err(self.fail(idx, Error::Sys(Errno::EINVAL)));
            }
            info!("{}: ready, pid {}", name, child.id());
        }
        Ok(())
    }

    /// Connect to every active backend's control socket.
    pub fn connect(&mut self) -> Result<()> {
        for idx in 0..self.backends.len() {
            if !self.backends[idx].active() {
                continue;
            }
            let path = match self.backends[idx].kind {
                Kind::Emp => self
                    .control_dir
                    .join(format!("{}-control-{}", self.backends[idx].name, self.dom_id)),
                Kind::QmpLibxl => self.qmp_dir.join(format!("qmp-libxl-{}", self.dom_id)),
            };
            debug!("{}: connecting to {}", self.backends[idx].name, path.display());
            let sock = match connect_to_uds(&path) {
                Ok(sock) => sock,
                Err(e) => return Err(self.fail(idx, e)),
            };
            self.backends[idx].client = Some(Client::new(sock));
        }
        Ok(())
    }

    /// Initialize every active backend: device models handshake, stream
    /// owners hand their fd off, queued arguments are flushed.
    pub fn init(&mut self) -> Result<()> {
        for idx in 0..self.backends.len() {
            if !self.backends[idx].active() {
                continue;
            }
            match self.backends[idx].kind {
                Kind::QmpLibxl => {
                    let name = self.backends[idx].name;
                    self.process(move |b| b.name == name && !b.qmp_established)?;
                    self.backend_call(idx, &client::QMP_CAPABILITIES, None, None)?;
                }
                Kind::Emp => {
                    if let Some(stream) = self.backends[idx].stream.clone() {
                        let fd = match stream.borrow().raw_fd() {
                            Ok(fd) => fd,
                            Err(e) => return Err(self.fail(idx, e)),
                        };
                        self.backend_call(idx, &client::MIGRATE_INIT, None, Some(fd))?;
                        // One hand-off ticket spent; the last one closes
                        // our copy, the child owns the fd now.
                        if let Err(e) = stream.borrow_mut().consume_use() {
                            return Err(self.fail(idx, e));
                        }
                    }
                }
            }
            if !self.backends[idx].args.is_empty() {
                let args = self.backends[idx].args.clone();
                self.backend_call(idx, &client::SET_ARGS, Some(&args), None)?;
            }
            self.backends[idx].set_state(State::Initialized);
        }
        Ok(())
    }

    // Send one command on a backend channel, attributing failures.
    fn backend_call(
        &mut self,
        idx: usize,
        cmd: &CommandSpec,
        args: Option<&ArgList>,
        fd: Option<RawFd>,
    ) -> Result<()> {
        debug!("{}: sending {}", self.backends[idx].name, cmd.name);
        let client = match &mut self.backends[idx].client {
            Some(client) => client,
            None => {
                error!("{}: no channel", self.backends[idx].name);
                return Err(self.fail(idx, Error::Sys(Errno::EINVAL)));
            }
        };
        match client.call(cmd, args, fd) {
            Ok(()) => Ok(()),
            Err(Error::Sys(Errno::EPIPE)) => Err(self.fail(idx, Error::Disconnected)),
            Err(e) => Err(self.fail(idx, e)),
        }
    }

    fn set_stream_busy(&mut self, idx: usize, busy: bool) -> Result<()> {
        let stream = match &self.backends[idx].stream {
            Some(stream) => Rc::clone(stream),
            None => {
                error!("{}: no stream to mark busy", self.backends[idx].name);
                return Err(self.fail(idx, Error::Sys(Errno::EINVAL)));
            }
        };
        let result = stream.borrow_mut().set_busy(busy);
        result.map_err(|e| self.fail(idx, e))
    }

    // Send `prepare:<name>` and wait out the acknowledgment.
    fn control_prepare(&mut self, idx: usize) -> Result<()> {
        let name = self.backends[idx].name;
        self.control.send_prepare(name)?;
        self.wait_control_ack()
    }

    fn control_suspend(&mut self) -> Result<()> {
        self.control.send_suspend()?;
        self.wait_control_ack()
    }

    fn wait_control_ack(&mut self) -> Result<()> {
        let deadline = Instant::now() + CONTROL_ACK_TIMEOUT;
        while self.control.waiting_ack() {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(Error::Sys(Errno::ETIME))?;
            let messages = self.control.recv(remaining)?;
            for message in messages {
                self.handle_control(message)?;
            }
        }
        Ok(())
    }

    fn handle_control(&mut self, message: ControlMessage) -> Result<()> {
        match message {
            ControlMessage::Done => self.control.clear_ack(),
            ControlMessage::Abort => {
                info!("orchestrator requested abort");
                Err(Error::Sys(Errno::ESHUTDOWN))
            }
            ControlMessage::Restore(name) => self.start_restore(&name),
        }
    }

    // `restore:<name>` from the orchestrator: hand the named backend its
    // share of the incoming stream.
    fn start_restore(&mut self, name: &str) -> Result<()> {
        let idx = self.index_of(name)?;
        if !self.backends[idx].active() {
            error!("{}: restore for inert backend", name);
            return Err(Error::Sys(Errno::EINVAL));
        }
        if self.backends[idx].state() != State::Initialized {
            error!(
                "{}: restore in state {:?}",
                name,
                self.backends[idx].state()
            );
            return Err(self.fail(idx, Error::Sys(Errno::EINVAL)));
        }
        self.backends[idx].set_state(State::Restoring);
        self.set_stream_busy(idx, true)?;
        self.backend_call(idx, &client::RESTORE, None, None)
    }

    /// Run the save pipeline. On failure the first error is kept and a
    /// best-effort `migrate_abort` is sent around before unwinding.
    pub fn save(&mut self, live: bool) -> Result<()> {
        match self.run_save(live) {
            Ok(()) => Ok(()),
            Err(error) => {
                self.abort_save();
                Err(error)
            }
        }
    }

    fn run_save(&mut self, live: bool) -> Result<()> {
        if live {
            self.request_track()?;
            self.migrate_live()?;
            self.process(|b| {
                b.caps.contains(Caps::WAIT_LIVE_STAGE_DONE) && b.state() < State::LiveStageDone
            })?;
        }
        self.control_suspend()?;
        self.migrate_paused()?;
        self.process(|b| b.caps.contains(Caps::MIGRATE_LIVE) && b.state() < State::MigrationDone)?;
        self.migrate_non_live()?;
        self.control.send_success()
    }

    fn request_track(&mut self) -> Result<()> {
        for idx in 0..self.backends.len() {
            if !self.backends[idx].active() {
                continue;
            }
            match self.backends[idx].kind {
                Kind::Emp => {
                    self.backend_call(idx, &client::TRACK_DIRTY, None, None)?;
                    self.backend_call(idx, &client::MIGRATE_PROGRESS, None, None)?;
                }
                Kind::QmpLibxl => {
                    let mut args = ArgList::new();
                    args.push_bool("enable", true);
                    self.backend_call(idx, &client::SET_GLOBAL_DIRTY_LOG, Some(&args), None)?;
                    // The device model's part ends here; drop the channel.
                    debug!("{}: dirty log enabled, disconnecting", self.backends[idx].name);
                    self.backends[idx].client = None;
                }
            }
        }
        Ok(())
    }

    fn migrate_live(&mut self) -> Result<()> {
        for idx in 0..self.backends.len() {
            if !self.backends[idx].caps.contains(Caps::MIGRATE_LIVE) {
                continue;
            }
            self.set_stream_busy(idx, true)?;
            self.control_prepare(idx)?;
            self.backend_call(idx, &client::MIGRATE_LIVE, None, None)?;
        }
        Ok(())
    }

    fn migrate_paused(&mut self) -> Result<()> {
        for idx in 0..self.backends.len() {
            if self.backends[idx].caps.contains(Caps::MIGRATE_PAUSED) {
                self.backend_call(idx, &client::MIGRATE_PAUSE, None, None)?;
            }
        }
        for idx in 0..self.backends.len() {
            if self.backends[idx].caps.contains(Caps::MIGRATE_PAUSED) {
                self.backend_call(idx, &client::MIGRATE_PAUSED, None, None)?;
            }
        }
        Ok(())
    }

    fn migrate_non_live(&mut self) -> Result<()> {
        for idx in 0..self.backends.len() {
            if !self.backends[idx].caps.contains(Caps::MIGRATE_NON_LIVE) {
                continue;
            }
            self.set_stream_busy(idx, true)?;
            self.control_prepare(idx)?;
            self.backend_call(idx, &client::MIGRATE_NONLIVE, None, None)?;
            let name = self.backends[idx].name;
            self.process(move |b| b.name == name && b.state() < State::MigrationDone)?;
        }
        Ok(())
    }

    // Best-effort abort of whatever is still in flight; errors are logged
    // and dropped so the primary failure survives.
    fn abort_save(&mut self) {
        for idx in 0..self.backends.len() {
            let backend = &mut self.backends[idx];
            if backend.kind != Kind::Emp
                || !backend.active()
                || backend.state() >= State::MigrationDone
            {
                continue;
            }
            let name = backend.name;
            if let Some(client) = &mut backend.client {
                // A failed exchange may have left an acknowledgment
                // pending; it is not coming anymore.
                client.reset_ack();
                if let Err(e) = client.call(&client::MIGRATE_ABORT, None, None) {
                    warn!("{}: migrate_abort failed: {}", name, e);
                }
            }
        }
    }

    /// Run the restore side: feed `restore:` requests to backends, report
    /// each completion, finish when every active backend completed.
    pub fn restore(&mut self) -> Result<()> {
        loop {
            self.drain_events()?;
            self.push_progress()?;

            for idx in 0..self.backends.len() {
                if self.backends[idx].active()
                    && self.backends[idx].state() == State::MigrationDone
                {
                    let name = self.backends[idx].name;
                    let literal = self.backends[idx].progress.result.clone();
                    self.control.send_result(name, literal.as_deref())?;
                    self.backends[idx].set_state(State::Completed);
                }
            }
            if self
                .backends
                .iter()
                .filter(|b| b.active())
                .all(|b| b.state() == State::Completed)
            {
                return Ok(());
            }

            match self.poll_io() {
                Ok(()) => (),
                Err(e) if e.is_timeout() => (),
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll-and-drain until no backend satisfies `predicate` anymore.
    ///
    /// Poll timeouts are soft here; everything else unwinds. Aggregate
    /// progress is pushed after every turn.
    pub fn process<F>(&mut self, predicate: F) -> Result<()>
    where
        F: Fn(&Backend) -> bool,
    {
        loop {
            self.drain_events()?;
            self.push_progress()?;
            if !self.backends.iter().any(|b| predicate(b)) {
                return Ok(());
            }
            match self.poll_io() {
                Ok(()) => (),
                Err(e) if e.is_timeout() => (),
                Err(e) => return Err(e),
            }
        }
    }

    // One poll wake-up: the orchestrator first, then each backend in
    // registry order.
    fn poll_io(&mut self) -> Result<()> {
        let mut targets: Vec<Option<usize>> = vec![None];
        let revents: Vec<PollFlags>;
        {
            let mut raw_fds = vec![self.control.input_fd()];
            for (idx, backend) in self.backends.iter().enumerate() {
                if !backend.active() {
                    continue;
                }
                if let Some(client) = &backend.client {
                    raw_fds.push(client.fd());
                    targets.push(Some(idx));
                }
            }
            let mut fds: Vec<PollFd> = raw_fds
                .iter()
                .map(|fd| PollFd::new(fd, PollFlags::POLLIN))
                .collect();

            let ready = loop {
                match poll(&mut fds, POLL_TIMEOUT_MS) {
                    Ok(n) => break n,
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(Error::Sys(e)),
                }
            };
            if ready == 0 {
                return Err(Error::Sys(Errno::ETIME));
            }
            revents = fds
                .iter()
                .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
                .collect();
        }

        let fatal = PollFlags::POLLERR
            | PollFlags::POLLHUP
            | PollFlags::POLLNVAL
            | PollFlags::from_bits_retain(libc::POLLRDHUP);
        for (slot, flags) in targets.iter().zip(&revents) {
            if flags.intersects(fatal) {
                match slot {
                    Some(idx) => {
                        error!("{}: socket error {:?}", self.backends[*idx].name, flags);
                        self.fail(*idx, Error::Sys(Errno::EINVAL));
                    }
                    None => error!("orchestrator fd error {:?}", flags),
                }
                return Err(Error::Sys(Errno::EINVAL));
            }
        }

        if revents[0].contains(PollFlags::POLLIN) {
            let messages = self.control.recv(Duration::ZERO)?;
            for message in messages {
                self.handle_control(message)?;
            }
        }

        for pos in 1..targets.len() {
            let idx = targets[pos].unwrap();
            if revents[pos].contains(PollFlags::POLLIN) {
                // unwrap() cannot fail: only backends with a channel are in
                // the poll set.
                let result = self.backends[idx]
                    .client
                    .as_mut()
                    .unwrap()
                    .recv(Duration::ZERO);
                match result {
                    Ok(()) => (),
                    Err(e) if e.is_timeout() => (),
                    Err(Error::Sys(Errno::EPIPE)) => {
                        return Err(self.fail(idx, Error::Disconnected))
                    }
                    Err(e) => return Err(self.fail(idx, e)),
                }
            }
            self.drain_backend_events(idx)?;
        }
        Ok(())
    }

    fn drain_events(&mut self) -> Result<()> {
        for idx in 0..self.backends.len() {
            if self.backends[idx].active() {
                self.drain_backend_events(idx)?;
            }
        }
        Ok(())
    }

    fn drain_backend_events(&mut self, idx: usize) -> Result<()> {
        let mut events = match &mut self.backends[idx].client {
            Some(client) => client.take_events(),
            None => return Ok(()),
        };
        for event in events.drain(..) {
            self.dispatch_event(idx, event)?;
        }
        Ok(())
    }

    fn dispatch_event(&mut self, idx: usize, event: Event) -> Result<()> {
        match (self.backends[idx].kind, event.kind.as_str()) {
            (Kind::Emp, "MIGRATION") => {
                let data = match event.data {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                if let Err(e) = self.handle_migration(idx, &data) {
                    return Err(self.fail(idx, e));
                }
                Ok(())
            }
            (Kind::QmpLibxl, "QMP") => {
                debug!("{}: greeting received", self.backends[idx].name);
                self.backends[idx].qmp_established = true;
                Ok(())
            }
            (_, other) => {
                debug!("{}: ignoring event {:?}", self.backends[idx].name, other);
                Ok(())
            }
        }
    }

    // A MIGRATION event: status, result literal and progress counters.
    fn handle_migration(&mut self, idx: usize, data: &Map<String, Value>) -> Result<()> {
        let mut status = None;
        let mut result = None;
        let mut sent = None;
        let mut remaining = None;
        let mut iteration = None;
        for (key, value) in data {
            match key.as_str() {
                "status" => status = Some(value.as_str().ok_or(Error::Sys(Errno::EINVAL))?),
                "result" => result = Some(value.as_str().ok_or(Error::Sys(Errno::EINVAL))?),
                "sent" => sent = Some(value.as_i64().ok_or(Error::Sys(Errno::EINVAL))?),
                "remaining" => {
                    remaining = Some(value.as_i64().ok_or(Error::Sys(Errno::EINVAL))?)
                }
                "iteration" => {
                    iteration = Some(value.as_i64().ok_or(Error::Sys(Errno::EINVAL))? as i32)
                }
                other => {
                    error!(
                        "{}: unexpected MIGRATION key {:?}",
                        self.backends[idx].name, other
                    );
                    return Err(Error::Sys(Errno::EINVAL));
                }
            }
        }

        if let Some(status) = status {
            if status != "completed" {
                error!("{}: migration status {:?}", self.backends[idx].name, status);
                return Err(Error::Sys(Errno::EREMOTEIO));
            }
            self.backends[idx].set_state(State::MigrationDone);
            self.set_stream_busy(idx, false)?;
        }
        if let Some(result) = result {
            self.backends[idx].progress.result = Some(result.to_owned());
        }

        if sent.is_some() || remaining.is_some() || iteration.is_some() {
            let sent = sent.unwrap_or(-1);
            let mut remaining = remaining.unwrap_or(-1);
            let iteration = iteration.unwrap_or(-1);
            if iteration == 0 && remaining == 0 {
                // First iteration with nothing transferred yet: the counters
                // are not meaningful, leave the stored ones alone.
                remaining = -1;
            }
            let progress = &mut self.backends[idx].progress;
            if remaining != -1 && iteration != progress.iteration {
                progress.sent = sent;
                progress.remaining = remaining;
                progress.iteration = iteration;
            }
            progress.sent_mid_iteration = sent;

            if iteration > 0
                && (remaining <= LIVE_STAGE_REMAINING_MAX
                    || iteration >= LIVE_STAGE_MAX_ITERATIONS)
                && self.backends[idx].state() < State::LiveStageDone
            {
                self.backends[idx].set_state(State::LiveStageDone);
            }
            self.push_progress()?;
        }
        Ok(())
    }

    /// Aggregate progress percentage over the backends taking part.
    pub fn percent(&self) -> i64 {
        let mut num = 0.0f64;
        let mut den = 0.0f64;
        for backend in self.backends.iter().filter(|b| b.active()) {
            let progress = &backend.progress;
            if progress.iteration < 0 {
                den += progress.fake_total as f64;
                if backend.state() > State::LiveStageDone {
                    num += progress.fake_total as f64;
                }
            } else {
                den += (progress.sent + progress.remaining) as f64;
                num += progress.sent as f64
                    + MID_ITERATION_WEIGHT
                        * (progress.sent_mid_iteration - progress.sent) as f64;
            }
        }
        if den == 0.0 {
            0
        } else {
            (100.0 * num / den).floor() as i64
        }
    }

    fn push_progress(&mut self) -> Result<()> {
        let percent = self.percent();
        self.control.send_progress(percent)
    }

    /// Tear down every backend channel and release stream references.
    pub fn disconnect(&mut self) {
        for backend in &mut self.backends {
            if let Some(mut channel) = backend.client.take() {
                if backend.kind == Kind::Emp && backend.path.is_some() {
                    if let Err(e) = channel.send_only(&client::QUIT) {
                        warn!("{}: quit failed: {}", backend.name, e);
                    }
                }
                // Dropping the channel closes the socket.
            }
            // The last holder's release closes the fd if it is still open.
            backend.stream = None;
        }
    }

    /// Reap every spawned child, escalating to SIGKILL after a deadline.
    pub fn wait_termination(&mut self) {
        let mut live = self.backends.iter().filter(|b| b.pid.is_some()).count();
        let deadline = Instant::now() + REAP_TIMEOUT;
        while live > 0 && Instant::now() < deadline {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => thread::sleep(REAP_INTERVAL),
                Ok(WaitStatus::Exited(pid, code)) => {
                    let error = if code == 0 {
                        None
                    } else {
                        Some(Error::ExitedWithError)
                    };
                    if self.reap(pid, error) {
                        live -= 1;
                    }
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    warn!("child {} killed by {:?}", pid, signal);
                    if self.reap(pid, Some(Error::Killed)) {
                        live -= 1;
                    }
                }
                Ok(_) => (),
                Err(Errno::EINTR) => (),
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    warn!("waitpid failed: {}", e);
                    break;
                }
            }
        }

        // Anything still around gets the axe.
        for idx in 0..self.backends.len() {
            if let Some(pid) = self.backends[idx].pid.take() {
                warn!(
                    "{}: still alive after {}s, killing",
                    self.backends[idx].name,
                    REAP_TIMEOUT.as_secs()
                );
                let _ = kill(pid, Signal::SIGKILL);
                loop {
                    match waitpid(pid, None) {
                        Err(Errno::EINTR) => continue,
                        _ => break,
                    }
                }
                self.fail(idx, Error::Killed);
            }
        }
    }

    fn reap(&mut self, pid: Pid, error: Option<Error>) -> bool {
        match self.backends.iter().position(|b| b.pid == Some(pid)) {
            Some(idx) => {
                debug!("{} (pid {}) reaped", self.backends[idx].name, pid);
                self.backends[idx].pid = None;
                if let Some(error) = error {
                    self.fail(idx, error);
                }
                true
            }
            None => {
                warn!("reaped unknown child {}", pid);
                false
            }
        }
    }

    /// Free per-run backend state: argument lists and results.
    pub fn clean(&mut self) {
        for backend in &mut self.backends {
            backend.args.clear();
            backend.progress.clear();
        }
    }

    /// Full teardown: disconnect, reap, clean.
    pub fn teardown(&mut self) {
        self.disconnect();
        self.wait_termination();
        self.clean();
    }

    /// Report the run's failure on the orchestrator channel, naming the
    /// first failed backend when there is one.
    pub fn report_failure(&mut self, error: Error) {
        let outcome = match self.first_failure() {
            Some((name, backend_error)) => self
                .control
                .send_error(Some(name), &backend_error.to_string()),
            None => self.control.send_error(None, &error.to_string()),
        };
        if let Err(e) = outcome {
            warn!("failed to report error to orchestrator: {}", e);
        }
    }
}
