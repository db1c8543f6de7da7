//! Signal registration for the control loop.
//!
//! Only `SIGTERM` and `SIGUSR2` are intercepted. `SIGHUP` (configuration
//! reload) and `SIGUSR1` (log reopen) are reserved and keep their default
//! disposition.

use std::fmt;
use std::future::Future;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;

use crate::error::{HandoffError, Result};

/// A signal the control loop acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// SIGTERM: stop serving, the control loop returns.
    Terminate,
    /// SIGUSR2: spawn a replacement process that inherits the listener.
    Restart,
}

impl ControlSignal {
    pub fn name(self) -> &'static str {
        match self {
            ControlSignal::Terminate => "SIGTERM",
            ControlSignal::Restart => "SIGUSR2",
        }
    }
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Source of control signals, delivered one at a time in order.
pub trait SignalSource {
    /// Wait for the next signal. `None` means no more signals will arrive.
    fn next_signal(&mut self) -> impl Future<Output = Option<ControlSignal>> + Send;
}

/// Process-wide interest in `SIGTERM` and `SIGUSR2`.
///
/// Created on control-loop entry. Must be created from within a tokio runtime.
///
/// Dropping it stops delivery to this value, but tokio keeps its OS handler
/// installed for the life of the process: after the drop, `SIGTERM` and
/// `SIGUSR2` are swallowed rather than restored to their default disposition.
/// Register once and keep the value alive (or pass `&mut` to successive
/// loops) for as long as the process should react to them.
#[derive(Debug)]
pub struct SignalRegistration {
    terminate: Signal,
    restart: Signal,
}

impl SignalRegistration {
    /// Register handlers for `SIGTERM` and `SIGUSR2`.
    pub fn register() -> Result<Self> {
        let terminate =
            signal(SignalKind::terminate()).map_err(|source| HandoffError::SignalRegistration {
                signal: ControlSignal::Terminate.name(),
                source,
            })?;
        let restart = signal(SignalKind::user_defined2()).map_err(|source| {
            HandoffError::SignalRegistration {
                signal: ControlSignal::Restart.name(),
                source,
            }
        })?;

        Ok(Self { terminate, restart })
    }
}

impl SignalSource for SignalRegistration {
    async fn next_signal(&mut self) -> Option<ControlSignal> {
        tokio::select! {
            biased;
            s = self.terminate.recv() => s.map(|()| ControlSignal::Terminate),
            s = self.restart.recv() => s.map(|()| ControlSignal::Restart),
        }
    }
}

impl<S: SignalSource + ?Sized> SignalSource for &mut S {
    fn next_signal(&mut self) -> impl Future<Output = Option<ControlSignal>> + Send {
        (**self).next_signal()
    }
}

/// Simulated delivery, used by tests and by hosts that trigger restarts
/// from something other than OS signals.
impl SignalSource for mpsc::Receiver<ControlSignal> {
    async fn next_signal(&mut self) -> Option<ControlSignal> {
        self.recv().await
    }
}
