//! Capture session state machine types.

use serde::{Deserialize, Serialize};

/// The current state of a capture session.
///
/// `Idle → Opening → Previewing → Stopping → Idle`. A failed open goes
/// straight from `Opening` back to `Idle`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No device is held.
    #[default]
    Idle,

    /// The device is being opened and negotiated.
    Opening,

    /// The device is streaming frames into the pipeline.
    Previewing,

    /// The device is being released.
    Stopping,
}

impl SessionState {
    /// Returns true if the session is idle.
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns true if frames are flowing.
    pub fn is_previewing(self) -> bool {
        matches!(self, Self::Previewing)
    }

    /// Returns true if `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Opening)
                | (Self::Opening, Self::Previewing)
                | (Self::Opening, Self::Idle)
                | (Self::Previewing, Self::Stopping)
                | (Self::Idle, Self::Stopping)
                | (Self::Stopping, Self::Idle)
        )
    }

    /// Returns a simple string representation of the state.
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Opening => "Opening",
            Self::Previewing => "Previewing",
            Self::Stopping => "Stopping",
        }
    }
}
