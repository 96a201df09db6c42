//! External event dispatch
//!
//! Maps host-OS signals onto the state machine's entry points. Boot and
//! manual service starts are deliberately distinct call patterns so each can
//! be exercised independently.

use crate::error::Result;
use crate::machine::{ReportingStateMachine, TriggerOutcome};

/// An external signal delivered by the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The device finished booting; service start-up follows implicitly.
    BootCompleted,
    /// The device is shutting down.
    Shutdown,
    /// Network connectivity appeared or disappeared.
    ConnectivityChanged { connected: bool },
    /// Explicit service start, e.g. right after a consent toggle.
    ServiceStart,
}

/// Feeds external events to the reporting state machine.
pub struct EventDispatcher {
    machine: ReportingStateMachine,
}

impl EventDispatcher {
    pub fn new(machine: ReportingStateMachine) -> Self {
        Self { machine }
    }

    /// Route one event. Returns what the machine decided so callers can log
    /// or assert on it; the submission itself runs in the background.
    pub fn dispatch(&self, event: DeviceEvent) -> Result<TriggerOutcome> {
        tracing::debug!(?event, "Dispatching device event");

        match event {
            DeviceEvent::BootCompleted => {
                self.machine.on_external_reset()?;
                self.machine.on_trigger()
            }
            DeviceEvent::Shutdown => {
                // No report attempt at shutdown; only the reset.
                self.machine.on_external_reset()?;
                Ok(TriggerOutcome::Skipped)
            }
            DeviceEvent::ConnectivityChanged { connected } => {
                self.machine.on_connectivity_changed(connected)
            }
            DeviceEvent::ServiceStart => self.machine.on_trigger(),
        }
    }

    /// Access to the underlying machine (consent changes, draining).
    pub fn machine(&self) -> &ReportingStateMachine {
        &self.machine
    }

    /// Await any in-flight submission.
    pub async fn wait_idle(&self) {
        self.machine.wait_idle().await;
    }
}
