//! # Recordings
//!
//! Durable message traces and their playback.
//!
//! ```text
//! persistence/
//! ├── recording.rs  - JSON-lines format, reader and append-only writer
//! ├── recorder.rs   - background writer fed by the subscriber
//! └── replayer.rs   - timed playback into a publish sink
//! ```
//!
//! A recording is append-only and read sequentially; a corrupt or truncated
//! line never prevents the lines before it from loading.

pub mod recorder;
pub mod recording;
pub mod replayer;

pub use recorder::{RecordSink, Recorder};
pub use recording::{RecordingReader, RecordingWriter};
pub use replayer::{replay_once, ReplayOptions, ReplaySession, ReplaySummary, Replayer};
