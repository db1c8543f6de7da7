//! Process relaunch with listener inheritance.
//!
//! Spawns a new process running the same executable with the same arguments
//! and working directory. The listener is inherited at a known descriptor
//! number and the handoff triple is added to the child's environment. The
//! calling process keeps running and keeps its listener open whatever happens.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::{error, info, warn};

use crate::codec::{HandoffTriple, STDERR_FD};
use crate::config::RelaunchConfig;
use crate::error::{HandoffError, Result};
use crate::listener::HandoffListener;

/// Something that can start a replacement process for a listener.
///
/// The control loop calls this on the restart signal. Closures of the same
/// shape implement it too, which keeps the loop testable without spawning.
pub trait Relauncher {
    /// Start a replacement process, returning its pid.
    fn relaunch(&self, listener: &dyn HandoffListener) -> Result<u32>;
}

impl<F> Relauncher for F
where
    F: Fn(&dyn HandoffListener) -> Result<u32>,
{
    fn relaunch(&self, listener: &dyn HandoffListener) -> Result<u32> {
        self(listener)
    }
}

/// Relaunches the current program as a new OS process.
#[derive(Debug, Clone, Default)]
pub struct ProcessRelauncher {
    config: RelaunchConfig,
}

impl ProcessRelauncher {
    pub fn new(config: RelaunchConfig) -> Self {
        Self { config }
    }

    /// Create with configuration from the environment.
    pub fn from_env() -> Self {
        Self::new(RelaunchConfig::from_env())
    }

    pub fn config(&self) -> &RelaunchConfig {
        &self.config
    }

    /// Resolve the executable to run: the configured override, otherwise
    /// `argv[0]` looked up the way a shell would.
    fn resolve_executable(&self, argv0: Option<&OsStr>, cwd: &Path) -> Result<PathBuf> {
        let lookup = |source: io::Error| HandoffError::LookupFailure {
            what: "executable",
            source,
        };

        match (&self.config.executable, argv0) {
            (Some(exe), _) => {
                find_executable(cwd.join(exe).as_os_str(), None, cwd).map_err(lookup)
            }
            (None, Some(argv0)) => {
                let path = std::env::var_os("PATH");
                find_executable(argv0, path.as_deref(), cwd).map_err(lookup)
            }
            (None, None) => std::env::current_exe().map_err(lookup),
        }
    }

    /// Spawn the child with an explicit argument vector.
    fn spawn_with_args<I>(&self, listener: &dyn HandoffListener, args: I) -> Result<Child>
    where
        I: IntoIterator<Item = OsString>,
    {
        let mut args = args.into_iter();
        let argv0 = args.next();

        let cwd = std::env::current_dir().map_err(|source| HandoffError::LookupFailure {
            what: "working directory",
            source,
        })?;
        let exe = self.resolve_executable(argv0.as_deref(), &cwd)?;

        // This process is always the parent side of the triple it emits.
        let mut triple = HandoffTriple::encode(listener, std::process::id())?;
        let source_fd = triple.fd;
        let target_fd = source_fd.max(STDERR_FD + 1);
        triple.fd = target_fd;

        info!(
            exe = %exe.display(),
            cwd = %cwd.display(),
            fd = target_fd,
            name = %triple.name,
            "Relaunching with inherited listener"
        );

        let mut command = Command::new(&exe);
        if let Some(argv0) = argv0 {
            command.arg0(argv0);
        }
        command
            .args(args)
            .current_dir(&cwd)
            .envs(triple.to_env(&self.config.vars))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // SAFETY: the hook only calls async-signal-safe fcntl/dup2.
        unsafe {
            command.pre_exec(move || inherit_descriptor(source_fd, target_fd));
        }

        command.spawn().map_err(HandoffError::SpawnFailure)
    }
}

impl Relauncher for ProcessRelauncher {
    fn relaunch(&self, listener: &dyn HandoffListener) -> Result<u32> {
        let child = self.spawn_with_args(listener, std::env::args_os())?;
        let child_pid = child.id();
        info!(child_pid, "Spawned child process");

        reap_in_background(child);
        Ok(child_pid)
    }
}

/// Relaunch the current program with configuration from the environment.
///
/// Failures are recoverable: the listener stays open and accept-capable.
pub fn relaunch(listener: &dyn HandoffListener) -> Result<u32> {
    ProcessRelauncher::from_env().relaunch(listener)
}

/// Make `source` available in the exec'd image as `target`.
///
/// Runs in the forked child before exec. Every other descriptor this crate or
/// std opened is close-on-exec and disappears.
fn inherit_descriptor(source: RawFd, target: RawFd) -> io::Result<()> {
    if source != target {
        // dup2 leaves CLOEXEC clear on the new descriptor.
        if unsafe { libc::dup2(source, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
        return Ok(());
    }

    let flags = unsafe { libc::fcntl(target, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(target, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Collect the child's exit status so a failed restart shows up in the logs.
fn reap_in_background(mut child: Child) {
    let child_pid = child.id();
    let spawned = std::thread::Builder::new()
        .name("handoff-reaper".to_string())
        .spawn(move || match child.wait() {
            Ok(status) if status.success() => info!(child_pid, "Child process exited"),
            Ok(status) => error!(child_pid, %status, "Child process exited unsuccessfully"),
            Err(e) => warn!(child_pid, error = %e, "Failed to wait for child process"),
        });

    if let Err(e) = spawned {
        warn!(child_pid, error = %e, "Failed to start reaper thread");
    }
}

/// Locate `program` the way `execvp` would.
///
/// Names containing a slash are taken relative to `cwd`; bare names are
/// searched for in `path_var`. The result is always absolute.
fn find_executable(program: &OsStr, path_var: Option<&OsStr>, cwd: &Path) -> io::Result<PathBuf> {
    let program_path = Path::new(program);

    if program.is_empty() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "empty program name"));
    }

    if program.as_bytes().contains(&b'/') {
        let candidate = cwd.join(program_path);
        return if is_executable(&candidate) {
            Ok(candidate)
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not an executable file", candidate.display()),
            ))
        };
    }

    let path_var = path_var.ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "PATH is not set")
    })?;

    std::env::split_paths(path_var)
        .map(|dir| cwd.join(dir).join(program_path))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found in PATH", program_path.display()),
            )
        })
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
