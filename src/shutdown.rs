use crate::error::{Result, StreamError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Waits for a background task, aborting it when it overruns `timeout`
pub(crate) async fn join_or_abort<T>(
    name: &str,
    mut handle: JoinHandle<T>,
    timeout: Duration,
) -> Result<T> {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(value)) => {
            debug!("{} task finished", name);
            Ok(value)
        }
        Ok(Err(e)) => {
            error!("{} task terminated abnormally: {}", name, e);
            Err(StreamError::ForcedShutdown {
                components: vec![name.to_string()],
            })
        }
        Err(_) => {
            warn!("{} task did not stop within {:?}, aborting", name, timeout);
            handle.abort();
            Err(StreamError::ForcedShutdown {
                components: vec![name.to_string()],
            })
        }
    }
}
