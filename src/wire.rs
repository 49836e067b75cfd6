//! FIFO wire protocol: one JSON-encoded [`Command`] per line.
//!
//! A session carries exactly one command on its input pipe, plus at most
//! one subsequent `cancel`. The output and error pipes carry raw bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manifest::Route;

/// Command codes. Only the first six travel over the wire; the rest are
/// local invocation modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Switch {
    /// Execute routes (the empty switch).
    #[default]
    Run,
    /// List active routes.
    List,
    /// Cancel active routes and wait for them.
    Kill,
    /// Kill, then run again with the shipped config.
    Restart,
    /// Shut down the daemon.
    Exit,
    /// Second message on an open session; cancels that command's context.
    Cancel,
    /// Dedicated-server startup mode; never sent over the wire.
    Server,
    /// Print the manifest's routes; handled locally.
    Print,
    /// Variant generator mode; handled locally.
    Meta,
}

/// One client request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Command {
    #[serde(rename = "switch")]
    pub sw: Switch,
    pub namespace: String,
    pub route: String,
    pub proc: String,
    /// Resolved route table shipped by the client, applied as a one-shot
    /// override of the daemon's working config for this command.
    pub config: Option<BTreeMap<String, Route>>,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("input parse error: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Encode one command as a newline-terminated JSON value.
pub fn encode(cmd: &Command) -> Result<Vec<u8>, WireError> {
    let mut buf = serde_json::to_vec(cmd).map_err(WireError::Encode)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Decode one command from a single received line.
pub fn decode(line: &[u8]) -> Result<Command, WireError> {
    serde_json::from_slice(line).map_err(WireError::Decode)
}
