//! Signal-driven control loop.
//!
//! - `SIGTERM` → log, return `Ok(())` so the host can drain and exit
//! - `SIGUSR2` → relaunch with the listener, keep waiting on success,
//!   return the error on failure
//!
//! The loop owns signal reception for the lifetime of the server. It never
//! closes the listener it was given.

use tracing::{error, info};

use crate::error::{HandoffError, Result};
use crate::listener::HandoffListener;
use crate::relaunch::{ProcessRelauncher, Relauncher};
use crate::signals::{ControlSignal, SignalRegistration, SignalSource};

/// State of a [`ControlLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for signals.
    Running,
    /// Stopped by `SIGTERM` or a failed relaunch. Final.
    Terminated,
}

/// Waits on signals and dispatches to graceful exit or restart.
pub struct ControlLoop<S, R> {
    signals: S,
    relauncher: R,
    state: LoopState,
}

impl<S, R> ControlLoop<S, R>
where
    S: SignalSource,
    R: Relauncher,
{
    pub fn new(signals: S, relauncher: R) -> Self {
        Self {
            signals,
            relauncher,
            state: LoopState::Running,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Wait for one signal and act on it.
    ///
    /// A terminated loop returns `Terminated` without waiting.
    pub async fn step<L: HandoffListener>(&mut self, listener: &L) -> Result<LoopState> {
        if self.state == LoopState::Terminated {
            return Ok(LoopState::Terminated);
        }

        let Some(signal) = self.signals.next_signal().await else {
            error!("Signal stream closed, control loop stopping");
            self.state = LoopState::Terminated;
            return Err(HandoffError::SignalStreamClosed);
        };

        match signal {
            ControlSignal::Terminate => {
                info!(signal = %signal, "Received termination signal, leaving control loop");
                self.state = LoopState::Terminated;
            }
            ControlSignal::Restart => {
                info!(signal = %signal, "Received restart signal, relaunching");
                match self.relauncher.relaunch(listener) {
                    Ok(child_pid) => {
                        info!(child_pid, "Relaunch started, waiting for child to take over");
                    }
                    Err(e) => {
                        error!(signal = %signal, error = %e, "Relaunch failed, leaving control loop");
                        self.state = LoopState::Terminated;
                        return Err(e);
                    }
                }
            }
        }

        Ok(self.state)
    }

    /// Process signals until termination.
    ///
    /// Returns `Ok(())` on `SIGTERM` and the relaunch error if a restart fails.
    pub async fn run<L: HandoffListener>(&mut self, listener: &L) -> Result<()> {
        while self.step(listener).await? == LoopState::Running {}
        Ok(())
    }
}

/// Register `SIGTERM`/`SIGUSR2` and run a control loop with the default
/// relauncher until termination.
///
/// The registration is dropped on return, after which both signals are
/// ignored by the process (see [`SignalRegistration`]).
pub async fn await_signals<L: HandoffListener>(listener: &L) -> Result<()> {
    let signals = SignalRegistration::register()?;
    ControlLoop::new(signals, ProcessRelauncher::from_env())
        .run(listener)
        .await
}
