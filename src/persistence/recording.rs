//! On-disk recording format
//!
//! A recording is a JSON-lines file, one envelope per line:
//!
//! ```text
//! {"timestamp":"2025-03-01T12:00:00.250000Z","topic":"a/b","payload":{"x":1},"qos":0,"retain":false}
//! {"timestamp":"2025-03-01T12:00:02.250000Z","topic":"a/b","payload":"plain text","qos":0,"retain":false}
//! {"timestamp":"2025-03-01T12:00:02.550000Z","topic":"raw","payload":"AAEC/w==","encoding":"base64","qos":1,"retain":false}
//! ```
//!
//! Payload bytes always round-trip exactly: JSON is embedded only if
//! re-serialising it reproduces the original bytes, other UTF-8 text is stored
//! as a string and anything else is base64 encoded. Every line stands on its
//! own, so a truncated last line only loses that line.

use crate::error::{Result, StreamError};
use crate::mqtt::envelope::{qos_from_level, qos_level, Envelope};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum PayloadEncoding {
    Base64,
}

#[derive(Serialize, Deserialize, Debug)]
struct RecordLine {
    #[serde(with = "timestamp_format")]
    timestamp: DateTime<Utc>,
    topic: String,
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encoding: Option<PayloadEncoding>,
    #[serde(default = "default_qos")]
    qos: u8,
    #[serde(default)]
    retain: bool,
}

// Recordings without a qos field are replayed at-least-once
fn default_qos() -> u8 {
    1
}

mod timestamp_format {
    use super::{parse_timestamp, DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        ts: &DateTime<Utc>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw).ok_or_else(|| {
            serde::de::Error::custom(format!("unrecognised timestamp '{}'", raw))
        })
    }
}

/// Parses RFC 3339 timestamps; timestamps without an offset are taken as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn encode_payload(bytes: &[u8]) -> (Value, Option<PayloadEncoding>) {
    if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
        if !value.is_string() && serde_json::to_vec(&value).is_ok_and(|out| out == bytes) {
            return (value, None);
        }
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => (Value::String(text.to_string()), None),
        Err(_) => (
            Value::String(BASE64_STANDARD.encode(bytes)),
            Some(PayloadEncoding::Base64),
        ),
    }
}

fn decode_payload(value: Value, encoding: Option<PayloadEncoding>) -> std::result::Result<Bytes, String> {
    match (encoding, value) {
        (Some(PayloadEncoding::Base64), Value::String(encoded)) => BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(|e| format!("invalid base64 payload: {}", e)),
        (Some(PayloadEncoding::Base64), _) => {
            Err("base64 payload must be a string".to_string())
        }
        (None, Value::String(text)) => Ok(Bytes::from(text)),
        (None, other) => serde_json::to_vec(&other)
            .map(Bytes::from)
            .map_err(|e| e.to_string()),
    }
}

/// Serialises one envelope as a single line (without the trailing newline)
pub fn encode_record(envelope: &Envelope) -> Result<String> {
    let (payload, encoding) = encode_payload(envelope.payload());
    let line = RecordLine {
        timestamp: envelope.timestamp(),
        topic: envelope.topic().to_string(),
        payload,
        encoding,
        qos: qos_level(envelope.qos()),
        retain: envelope.retain(),
    };
    serde_json::to_string(&line).map_err(|e| StreamError::ReplayData {
        line: 0,
        reason: format!("cannot encode record: {}", e),
    })
}

/// Parses one line of a recording; `line_no` is only used for error reporting
pub fn decode_record(line: &str, line_no: usize) -> Result<Envelope> {
    let malformed = |reason: String| StreamError::ReplayData {
        line: line_no,
        reason,
    };
    let record: RecordLine = serde_json::from_str(line).map_err(|e| malformed(e.to_string()))?;
    if record.topic.is_empty() {
        return Err(malformed("record has an empty topic".to_string()));
    }
    let qos = qos_from_level(record.qos)
        .ok_or_else(|| malformed(format!("invalid qos {}", record.qos)))?;
    let payload = decode_payload(record.payload, record.encoding).map_err(malformed)?;

    Ok(Envelope::new(record.topic, payload, record.timestamp).with_delivery(qos, record.retain))
}

/// Sequential, lazy reader over a recording file
///
/// Lines are read as raw bytes so that a record cut in the middle of a
/// multi-byte character is reported as malformed instead of failing the read.
pub struct RecordingReader {
    path: PathBuf,
    reader: BufReader<File>,
    line_no: usize,
    buffer: Vec<u8>,
}

impl RecordingReader {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .await
            .map_err(|e| StreamError::persistence(&path, e))?;
        debug!("Opened recording {}", path.display());
        Ok(Self {
            path,
            reader: BufReader::new(file),
            line_no: 0,
            buffer: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next record of the file
    ///
    /// `Ok(None)` at end of file, `Ok(Some(Err(_)))` for a malformed line that
    /// the caller may skip, `Err(_)` when the file itself cannot be read.
    pub async fn next_record(&mut self) -> Result<Option<Result<Envelope>>> {
        loop {
            self.buffer.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.buffer)
                .await
                .map_err(|e| StreamError::persistence(&self.path, e))?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let record = match std::str::from_utf8(&self.buffer) {
                Ok(text) if text.trim().is_empty() => continue,
                Ok(text) => decode_record(text.trim(), self.line_no),
                Err(e) => Err(StreamError::ReplayData {
                    line: self.line_no,
                    reason: format!("invalid UTF-8: {}", e),
                }),
            };
            return Ok(Some(record));
        }
    }

    /// Reads the whole file, returning the valid envelopes and the number of
    /// malformed lines that were skipped
    pub async fn read_all(mut self) -> Result<(Vec<Envelope>, usize)> {
        let mut envelopes = Vec::new();
        let mut skipped = 0;
        while let Some(record) = self.next_record().await? {
            match record {
                Ok(envelope) => envelopes.push(envelope),
                Err(_) => skipped += 1,
            }
        }
        Ok((envelopes, skipped))
    }
}

/// Append-only writer; every record is flushed and synced before `append` returns
pub struct RecordingWriter {
    path: PathBuf,
    file: File,
    written: u64,
}

impl RecordingWriter {
    /// Opens `path` for appending, creating missing parent directories
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StreamError::persistence(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StreamError::persistence(&path, e))?;
        info!("Recording to {}", path.display());
        Ok(Self {
            path,
            file,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records appended through this writer
    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn append(&mut self, envelope: &Envelope) -> Result<()> {
        let mut line = encode_record(envelope)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| StreamError::persistence(&self.path, e))?;
        self.file
            .flush()
            .await
            .map_err(|e| StreamError::persistence(&self.path, e))?;
        self.file
            .sync_data()
            .await
            .map_err(|e| StreamError::persistence(&self.path, e))?;
        self.written += 1;
        Ok(())
    }
}
