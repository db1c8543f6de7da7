//! Configuration for the handoff protocol.
//!
//! # Environment Variables
//!
//! - `WADDLE_HANDOFF_EXECUTABLE`: Binary to re-execute on restart. Default: the
//!   currently running executable.

use std::path::PathBuf;
use std::process::Command;

use tracing::info;

/// Default prefix for the three handoff variables.
pub const DEFAULT_PREFIX: &str = "WADDLE_HANDOFF";

/// Names of the three environment variables carrying the handoff triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffVars {
    /// Descriptor number variable (`<PREFIX>_FD`).
    pub fd: String,
    /// Listener label variable (`<PREFIX>_NAME`).
    pub name: String,
    /// Parent pid variable (`<PREFIX>_PPID`).
    pub ppid: String,
}

impl HandoffVars {
    /// Derive the variable names from a prefix, e.g. `GOAGAIN` gives
    /// `GOAGAIN_FD`, `GOAGAIN_NAME` and `GOAGAIN_PPID`.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            fd: format!("{prefix}_FD"),
            name: format!("{prefix}_NAME"),
            ppid: format!("{prefix}_PPID"),
        }
    }

    /// Remove the three variables from `command`'s environment.
    ///
    /// A decoded triple stays in this process's environment. Apply this to
    /// every subprocess other than a relaunch so none of them sees a stale
    /// handoff. For a tokio command use `Command::as_std_mut`.
    pub fn scrub<'c>(&self, command: &'c mut Command) -> &'c mut Command {
        for name in self.all() {
            command.env_remove(name);
        }
        command
    }

    pub(crate) fn all(&self) -> [&str; 3] {
        [&self.fd, &self.name, &self.ppid]
    }
}

impl Default for HandoffVars {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }
}

/// Settings for spawning the replacement process.
#[derive(Debug, Clone, Default)]
pub struct RelaunchConfig {
    /// Variable names written into the child's environment.
    pub vars: HandoffVars,
    /// Binary to execute instead of the current executable.
    pub executable: Option<PathBuf>,
}

impl RelaunchConfig {
    /// Load relaunch configuration from environment variables.
    pub fn from_env() -> Self {
        let executable = std::env::var_os("WADDLE_HANDOFF_EXECUTABLE")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Self {
            vars: HandoffVars::default(),
            executable,
        }
    }

    /// Log the current relaunch configuration.
    pub fn log_config(&self) {
        match &self.executable {
            Some(exe) => info!(exe = %exe.display(), "Restart executable overridden"),
            None => info!("Restart executable: current executable"),
        }
        info!(
            fd_var = %self.vars.fd,
            name_var = %self.vars.name,
            ppid_var = %self.vars.ppid,
            "Handoff variables"
        );
    }
}
