//! Local message dispatch
//!
//! ```text
//! Subscriber ──offer──► DispatchQueue ──take──► WorkerPool ──► MessageHandler
//!                       (bounded, drop-newest)  (N workers)
//! ```
//!
//! The queue is the only structure written and read by different tasks; the
//! network loop never waits on it and never runs user code.

pub mod handler;
pub mod queue;
pub mod worker_pool;

pub use handler::{DiscardHandler, MessageHandler};
pub use queue::{DispatchQueue, DEFAULT_QUEUE_CAPACITY};
pub use worker_pool::{StopMode, WorkerPool, DEFAULT_WORKER_COUNT};
