use crate::mqtt::envelope::Envelope;
use color_eyre::Result;

/// User code invoked for every dispatched envelope
///
/// Called from worker tasks, possibly from several at once. The return value
/// is only used for logging: an `Err` (or a panic) is counted as a handler
/// failure and the worker moves on to the next message. A handler that needs
/// to talk to another scheduler has to do its own handoff, e.g. through a
/// channel.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, envelope: &Envelope) -> Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Envelope) -> Result<()> + Send + Sync + 'static,
{
    fn handle(&self, envelope: &Envelope) -> Result<()> {
        self(envelope)
    }
}

/// Handler used when a live stream runs without user code (record-only)
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardHandler;

impl MessageHandler for DiscardHandler {
    fn handle(&self, envelope: &Envelope) -> Result<()> {
        tracing::trace!("Discarding message on {}", envelope.topic());
        Ok(())
    }
}
