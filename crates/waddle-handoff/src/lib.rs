//! # waddle-handoff
//!
//! Zero-downtime restart for Waddle servers: a running process hands its
//! listening socket to a freshly executed copy of itself without ever
//! closing it.
//!
//! ## Overview
//!
//! A restart cycle runs like this:
//! 1. The old process (parent) receives `SIGUSR2`
//! 2. It spawns the same executable with the listener inherited at a known fd
//!    and the three handoff variables set in the child's environment
//! 3. The child decodes the variables, verifies that its parent is the process
//!    that encoded them, and starts accepting on the inherited socket
//! 4. The child sends `SIGTERM` to the parent, whose control loop returns so
//!    the host can drain in-flight work and exit
//!
//! ## Signal Conventions
//!
//! - `SIGTERM`: Graceful termination (the control loop returns)
//! - `SIGUSR2`: Restart (spawn a child that inherits the listener)
//! - `SIGHUP`, `SIGUSR1`: Reserved, not intercepted
//!
//! ## Environment Variables
//!
//! - `WADDLE_HANDOFF_FD`: Descriptor number of the inherited listener
//! - `WADDLE_HANDOFF_NAME`: Listener label, e.g. `tcp:0.0.0.0:8080->`
//! - `WADDLE_HANDOFF_PPID`: Pid of the process that performed the handoff
//! - `WADDLE_HANDOFF_EXECUTABLE`: Optional override for the re-executed binary
//!
//! The triple stays in a restarted child's environment after decoding. Hosts
//! that spawn other subprocesses should strip it with [`HandoffVars::scrub`].
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use waddle_handoff::{detect, notify_parent, ControlLoop, HandoffVars, ProcessRelauncher, SignalRegistration};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let signals = SignalRegistration::register()?;
//! let vars = HandoffVars::default();
//!
//! let (listener, parent) = match detect(&vars)? {
//!     Some(inherited) => {
//!         let parent = inherited.parent_pid;
//!         (inherited.into_tokio()?, Some(parent))
//!     }
//!     None => (tokio::net::TcpListener::bind("127.0.0.1:9090").await?, None),
//! };
//! let listener = Arc::new(listener);
//!
//! if let Some(pid) = parent {
//!     notify_parent(pid)?;
//! }
//!
//! // ... spawn the accept loop on `listener.clone()` ...
//!
//! ControlLoop::new(signals, ProcessRelauncher::from_env())
//!     .run(&listener)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("waddle-handoff requires a Unix platform (Linux or macOS)");

mod codec;
mod config;
mod control;
mod error;
mod listener;
mod notify;
mod relaunch;
mod signals;

pub use codec::{decode, decode_from, detect, HandoffTriple, Inherited};
pub use config::{HandoffVars, RelaunchConfig};
pub use control::{await_signals, ControlLoop, LoopState};
pub use error::{HandoffError, Result};
pub use listener::HandoffListener;
pub use notify::notify_parent;
pub use relaunch::{relaunch, ProcessRelauncher, Relauncher};
pub use signals::{ControlSignal, SignalRegistration, SignalSource};
