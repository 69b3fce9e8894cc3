use serde::Serialize;
use std::fmt;

/// Lifecycle of a [`StreamManager`](super::StreamManager)
///
/// ```text
/// Idle ──► Starting ──► Running ──► Stopping ──► Idle
///             │            │
///             └────────────┴──► Failed ──► Starting / Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum StreamState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl StreamState {
    /// States from which `start()` may begin a new cycle
    pub fn can_start(self) -> bool {
        matches!(self, StreamState::Idle | StreamState::Failed)
    }

    /// True while components may be alive
    pub fn is_active(self) -> bool {
        matches!(
            self,
            StreamState::Starting | StreamState::Running | StreamState::Stopping
        )
    }

    pub fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Failed, Starting)
                | (Failed, Idle)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Idle)
                | (Stopping, Failed)
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Idle => "idle",
            StreamState::Starting => "starting",
            StreamState::Running => "running",
            StreamState::Stopping => "stopping",
            StreamState::Failed => "failed",
        };
        f.write_str(name)
    }
}
