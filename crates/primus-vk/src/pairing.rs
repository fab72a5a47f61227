// SPDX-License-Identifier: CEPL-1.0
//! Background creation of the display-side logical device.
//!
//! `vkCreateDevice` for the render device must return before anything is
//! created on the display device: some drivers deadlock on a nested device
//! creation. The display device is therefore built on its own thread, and the
//! first swapchain creation waits for it.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ash::vk;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::LayerError;

/// How long a join may block before it is reported as a likely deadlock.
pub const DEADLOCK_WARNING: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PairingError {
    #[error("display device creation was never started")]
    NotStarted,
    #[error("display device creation failed: {0}")]
    DisplayDevice(vk::Result),
    #[error("display device creation panicked")]
    Panicked,
}

impl PairingError {
    pub fn as_vk_result(&self) -> vk::Result {
        match self {
            PairingError::DisplayDevice(r) => *r,
            _ => vk::Result::ERROR_INITIALIZATION_FAILED,
        }
    }
}

type Outcome<T> = Result<Arc<T>, PairingError>;

enum State<T> {
    NotStarted,
    Running {
        result: Receiver<Outcome<T>>,
        thread: JoinHandle<()>,
    },
    Joined(Outcome<T>),
}

/// The render/display rendezvous: not started, running, or joined with a
/// cached result. Transitions happen under the pairing's own lock so the
/// background task is free to use the handle registry meanwhile.
pub struct DevicePairing<T> {
    state: Mutex<State<T>>,
}

impl<T> Default for DevicePairing<T> {
    fn default() -> Self {
        Self { state: Mutex::new(State::NotStarted) }
    }
}

impl<T: Send + Sync + 'static> DevicePairing<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch `task`. Only the first call has an effect.
    pub fn start<F>(&self, task: F) -> Result<(), LayerError>
    where
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !matches!(*state, State::NotStarted) {
            warn!("display device creation already started");
            return Ok(());
        }
        let (tx, result) = mpsc::sync_channel(1);
        let thread = thread::Builder::new()
            .name("primus-pairing".into())
            .spawn(move || {
                let _ = tx.send(task());
            })
            .map_err(|e| LayerError::Spawn("pairing", e))?;
        *state = State::Running { result, thread };
        Ok(())
    }

    /// Wait for the display device. The outcome is cached, later calls
    /// return it immediately.
    pub fn join(&self) -> Outcome<T> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match std::mem::replace(&mut *state, State::NotStarted) {
            State::NotStarted => Err(PairingError::NotStarted),
            State::Joined(outcome) => {
                *state = State::Joined(outcome.clone());
                outcome
            }
            State::Running { result, thread } => {
                let outcome = match result.recv_timeout(DEADLOCK_WARNING) {
                    Ok(outcome) => outcome,
                    Err(RecvTimeoutError::Timeout) => {
                        warn!(
                            "display device not ready after {}s, possible initialization deadlock",
                            DEADLOCK_WARNING.as_secs()
                        );
                        result.recv().unwrap_or(Err(PairingError::Panicked))
                    }
                    Err(RecvTimeoutError::Disconnected) => Err(PairingError::Panicked),
                };
                if thread.join().is_err() {
                    debug!("pairing thread unwound");
                }
                *state = State::Joined(outcome.clone());
                outcome
            }
        }
    }
}
