use crate::persistence::replayer::ReplaySummary;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Notifications from background components to the manager's supervisor
#[derive(Debug)]
pub enum ComponentEvent {
    /// The subscriber lost its connection and will not reconnect
    SubscriberFailed { reason: String },
    /// A recording write failed; the recorder has shut itself down
    RecordingFailed { path: PathBuf, reason: String },
    /// The replayer reached the end of the recording
    ReplayFinished(ReplaySummary),
    /// The replayer stopped on an unrecoverable error
    ReplayFailed { reason: String },
}

pub type EventSender = mpsc::UnboundedSender<ComponentEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ComponentEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
