//! Decode and encode the line-oriented worker envelope.
//!
//! An executor writes one JSON document per line on its output channel. Each line is either:
//! - a metrics sample, `{"type":"metrics","memory":<bytes>,"cpu":<percent>}`, any number of times, or
//! - the terminal [`WorkResult`], exactly once.
//!
//! Both shapes use a `type` field, so the decoder discriminates on its value explicitly instead of guessing from
//! which fields are present.
//!
//! ## Examples
//! ```rust
//! use proctor_core::WorkerMessage;
//!
//! let msg = WorkerMessage::parse_line(r#"{"type":"metrics","memory":1024,"cpu":1.5}"#).unwrap();
//! assert!(matches!(msg, WorkerMessage::Metrics { memory: 1024, .. }));
//! ```

use serde_json::{Map, Value};

use crate::result::WorkResult;

/// Discriminant value reserved for metrics samples.
pub const METRICS_TAG: &str = "metrics";

/// One decoded envelope line.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// The terminal result for the unit.
    Result(WorkResult),
    /// A resource sample; `memory` is in bytes and `cpu` is a percentage.
    Metrics { memory: u64, cpu: f64 },
}

/// Why a line could not be decoded.
#[derive(Debug)]
pub enum EnvelopeError {
    /// The line is not a JSON object. Executors may interleave plain console text; callers usually keep it as output.
    NotJson,
    /// The line is a JSON object but matches neither envelope shape.
    Malformed(serde_json::Error),
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::NotJson => f.write_str("line is not a JSON object"),
            EnvelopeError::Malformed(err) => write!(f, "malformed worker message: {err}"),
        }
    }
}

impl std::error::Error for EnvelopeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EnvelopeError::NotJson => None,
            EnvelopeError::Malformed(err) => Some(err),
        }
    }
}

impl WorkerMessage {
    /// Decode one line of executor output.
    ///
    /// ## Parameters
    /// - `line`: a single line, with or without its trailing newline.
    ///
    /// ## Returns
    /// - `Err(EnvelopeError::NotJson)` when the line is not a JSON object at all.
    /// - `Err(EnvelopeError::Malformed(_))` when it is an object of the wrong shape.
    pub fn parse_line(line: &str) -> Result<Self, EnvelopeError> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return Err(EnvelopeError::NotJson);
        }
        let value: Value = serde_json::from_str(trimmed).map_err(|_| EnvelopeError::NotJson)?;
        let Value::Object(map) = value else {
            return Err(EnvelopeError::NotJson);
        };
        if map.get("type").and_then(Value::as_str) == Some(METRICS_TAG) {
            return Ok(Self::decode_metrics(&map));
        }
        serde_json::from_value::<WorkResult>(Value::Object(map))
            .map(WorkerMessage::Result)
            .map_err(EnvelopeError::Malformed)
    }

    fn decode_metrics(map: &Map<String, Value>) -> Self {
        // Executors report memory as a float on some platforms; clamp into u64.
        let memory = match map.get("memory") {
            Some(Value::Number(n)) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)).unwrap_or(0),
            _ => 0,
        };
        let cpu = map.get("cpu").and_then(Value::as_f64).unwrap_or(0.0);
        WorkerMessage::Metrics { memory, cpu }
    }

    /// Encode as a single JSON line without the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        match self {
            WorkerMessage::Result(result) => serde_json::to_string(result),
            WorkerMessage::Metrics { memory, cpu } => serde_json::to_string(&serde_json::json!({
                "type": METRICS_TAG,
                "memory": memory,
                "cpu": cpu,
            })),
        }
    }
}
