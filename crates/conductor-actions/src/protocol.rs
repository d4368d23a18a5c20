//! Line-delimited JSON protocol between the host and a worker process.
//!
//! The host writes [`HostMessage`]s to the worker's stdin, one per line.
//! The worker answers on stdout with [`WorkerMessage`]s. The first exchange
//! is always `setup` → `ready` (or `setup_failed`). Closing stdin asks the
//! worker to exit once every queued call has been answered.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ActionError, Kwargs};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Setup {
        module: String,
        #[serde(default)]
        context: Value,
    },
    Call {
        id: u64,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Kwargs,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready {
        actions: Vec<String>,
    },
    SetupFailed {
        error: String,
    },
    /// Answer to a call. `error` set means the action failed; the protocol did not.
    Reply {
        id: u64,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Serialize a message as one protocol line, newline included.
pub fn encode<T: Serialize>(message: &T) -> Result<String, ActionError> {
    let mut line =
        serde_json::to_string(message).map_err(|e| ActionError::Protocol(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

pub fn decode<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, ActionError> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| ActionError::Protocol(format!("{}: {}", e, line.trim_end())))
}
