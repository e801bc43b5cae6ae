use std::io::Write;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::process::exit;

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Builder;
use log::{error, info, warn, LevelFilter};
use nix::sys::signal::{signal, SigHandler, Signal};

use emu_manager::{Control, Manager, Mode};

#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
    /// Guest domain id
    #[clap(long)]
    domid: u32,
    /// Data-stream fd attached to the xenguest backend (required for save)
    #[clap(long)]
    fd: Option<i32>,
    /// Orchestrator channel input fd
    #[clap(long)]
    controlinfd: i32,
    /// Orchestrator channel output fd
    #[clap(long)]
    controloutfd: i32,
    /// Store ring port, forwarded to xenguest
    #[clap(long)]
    store_port: Option<String>,
    /// Console ring port, forwarded to xenguest
    #[clap(long)]
    console_port: Option<String>,
    /// Live (true) or non-live (false) migration
    #[clap(long)]
    live: Option<bool>,
    /// Operation mode
    #[clap(long, value_enum)]
    mode: CliMode,
    /// Enable the named backend; `<name>[:<fd>]` also attaches a data stream
    #[clap(long)]
    dm: Vec<String>,
    /// Accepted for compatibility; has no effect
    #[clap(long)]
    fork: Option<String>,
    /// Lower the log threshold to debug
    #[clap(long)]
    debug: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
#[clap(rename_all = "snake_case")]
enum CliMode {
    HvmSave,
    Save,
    HvmRestore,
    Restore,
}

impl From<CliMode> for Mode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::HvmSave => Mode::HvmSave,
            CliMode::Save => Mode::Save,
            CliMode::HvmRestore => Mode::HvmRestore,
            CliMode::Restore => Mode::Restore,
        }
    }
}

/// Initialize logging.
///
/// Records carry the per-domain program identity so interleaved coordinators
/// can be told apart in the collected log.
fn init_logging(dom_id: u32, debug: bool) -> Result<()> {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::from_default_env()
        .filter_level(level)
        .format(move |buf, record| {
            writeln!(
                buf,
                "emu-manager-{}: [{}] {}",
                dom_id,
                record.level(),
                record.args()
            )
        })
        .try_init()
        .context("Failed to init env_logger")?;

    Ok(())
}

fn parse_dm(entry: &str) -> Result<(&str, Option<RawFd>)> {
    match entry.split_once(':') {
        Some((name, fd)) => {
            let fd: RawFd = fd
                .parse()
                .with_context(|| format!("Bad fd in --dm {}", entry))?;
            Ok((name, Some(fd)))
        }
        None => Ok((entry, None)),
    }
}

/// Configure a `Manager` instance from command line arguments.
fn configure(args: &Args) -> Result<Manager> {
    let mode = Mode::from(args.mode);
    if let Some(fd) = args.fd {
        if fd < 0 {
            bail!("--fd must be 0 or positive");
        }
    } else if !mode.is_restore() {
        bail!("--fd is required for save modes");
    }

    // The orchestrator hands these fds over; they are ours from here on.
    let input = unsafe { OwnedFd::from_raw_fd(args.controlinfd) };
    let output = unsafe { OwnedFd::from_raw_fd(args.controloutfd) };
    let control = Control::new(input, output);

    let mut manager = Manager::new(args.domid, control);
    for entry in &args.dm {
        let (name, fd) = parse_dm(entry)?;
        manager
            .enable_backend(name, fd)
            .with_context(|| format!("Bad backend in --dm {}", entry))?;
    }
    if let Some(fd) = args.fd {
        manager
            .attach_stream("xenguest", fd)
            .context("Failed to attach --fd stream")?;
    }
    if let Some(port) = &args.store_port {
        manager.backend_args("xenguest")?.push_string("store_port", port);
    }
    if let Some(port) = &args.console_port {
        manager
            .backend_args("xenguest")?
            .push_string("console_port", port);
    }
    Ok(manager)
}

fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging(args.domid, args.debug) {
        eprintln!("Failed to initialize logging: {:?}", e);
        exit(1);
    }

    // A dead orchestrator pipe must surface as EPIPE on the write, not a
    // process kill.
    if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
        warn!("failed to ignore SIGPIPE: {}", e);
    }

    if let Some(value) = &args.fork {
        info!("ignoring --fork {}", value);
    }

    let mode = Mode::from(args.mode);
    let live = args.live.unwrap_or(false);

    let mut manager = match configure(&args) {
        Ok(manager) => manager,
        Err(e) => {
            // NB: need debug formatting to get the full error chain.
            error!("{:?}", e);
            exit(1);
        }
    };

    let result = manager.run(mode, live);
    manager.teardown();

    // Teardown may have recorded the only failure (a child that died badly).
    let outcome = match result {
        Ok(()) => match manager.first_failure() {
            Some((_, e)) => Err(e),
            None => Ok(()),
        },
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => exit(0),
        Err(e) if e.is_shutdown() => {
            info!("shut down on orchestrator request");
            exit(0);
        }
        Err(e) => {
            manager.report_failure(e);
            exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dm_plain() {
        let (name, fd) = parse_dm("qemu").unwrap();
        assert_eq!(name, "qemu");
        assert_eq!(fd, None);
    }

    #[test]
    fn test_parse_dm_with_fd() {
        let (name, fd) = parse_dm("xenguest:7").unwrap();
        assert_eq!(name, "xenguest");
        assert_eq!(fd, Some(7));
    }

    #[test]
    fn test_parse_dm_bad_fd() {
        assert!(parse_dm("xenguest:seven").is_err());
    }

    #[test]
    fn test_live_flag_is_strict() {
        assert!(Args::try_parse_from([
            "emu-manager",
            "--domid",
            "1",
            "--controlinfd",
            "3",
            "--controloutfd",
            "4",
            "--mode",
            "hvm_save",
            "--live",
            "yes",
        ])
        .is_err());
    }

    #[test]
    fn test_mode_names() {
        let args = Args::try_parse_from([
            "emu-manager",
            "--domid",
            "1",
            "--controlinfd",
            "3",
            "--controloutfd",
            "4",
            "--mode",
            "hvm_restore",
        ])
        .unwrap();
        assert!(Mode::from(args.mode).is_restore());
    }
}
