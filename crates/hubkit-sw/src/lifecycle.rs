//! Worker lifecycle state machine.

use serde::{Deserialize, Serialize};

use crate::ServiceWorkerError;

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Initial state, nothing installed yet.
    #[default]
    Parsed,
    /// Installing (populating the app shell cache).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (cleaning stale caches).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (install failed or superseded).
    Redundant,
}

/// Tracks the current state and the skip-waiting flag.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    state: WorkerState,
    skip_waiting: bool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting
    }

    pub fn request_skip_waiting(&mut self) {
        self.skip_waiting = true;
    }

    /// Parsed → Installing.
    pub fn begin_install(&mut self) -> Result<(), ServiceWorkerError> {
        self.transition(&[WorkerState::Parsed], WorkerState::Installing)
    }

    /// Installing → Installed.
    pub fn install_complete(&mut self) -> Result<(), ServiceWorkerError> {
        self.transition(&[WorkerState::Installing], WorkerState::Installed)
    }

    /// Installed → Activating.
    pub fn begin_activate(&mut self) -> Result<(), ServiceWorkerError> {
        self.transition(&[WorkerState::Installed], WorkerState::Activating)
    }

    /// Activating → Activated.
    pub fn activate_complete(&mut self) -> Result<(), ServiceWorkerError> {
        self.transition(&[WorkerState::Activating], WorkerState::Activated)
    }

    /// Any state → Redundant.
    pub fn make_redundant(&mut self) {
        self.state = WorkerState::Redundant;
    }

    /// Activating/Activated → Redundant when a newer version takes over.
    /// Returns whether the state changed; a waiting version is left alone.
    pub fn supersede(&mut self) -> bool {
        match self.state {
            WorkerState::Activating | WorkerState::Activated => {
                self.state = WorkerState::Redundant;
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == WorkerState::Activated
    }

    fn transition(
        &mut self,
        from: &[WorkerState],
        to: WorkerState,
    ) -> Result<(), ServiceWorkerError> {
        if !from.contains(&self.state) {
            return Err(ServiceWorkerError::StateError(format!(
                "Cannot move from {:?} to {:?}",
                self.state, to
            )));
        }
        self.state = to;
        Ok(())
    }
}
