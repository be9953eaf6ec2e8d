//! Copyright © 2025-2026 Wenze Wei. All Rights Reserved.
//!
//! This file is part of Zi.
//! The Zi project belongs to the Dunimd project team.
//!
//! Licensed under the Apache License, Version 2.0 (the "License");
//! You may not use this file except in compliance with the License.
//! You may obtain a copy of the License at
//!
//!     http://www.apache.org/licenses/LICENSE-2.0
//!
//! Unless required by applicable law or agreed to in writing, software
//! distributed under the License is distributed on an "AS IS" BASIS,
//! WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//! See the License for the specific language governing permissions and
//! limitations under the License.

//! # Plugin Wire Protocol
//!
//! Frames are newline-delimited. The host writes one JSON request per line:
//!
//! ```text
//! {"id":"0190f1c2-...","method":"search.query","params":{"q":"rust"}}
//! ```
//!
//! and the plugin answers with a JSON object carrying the same `id`. Lines a
//! plugin prints that do not start with `{` are free-form log output.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{Result, ZiError};

/// Longest line accepted from a plugin, excluding the terminator.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

/// Time-sortable identifier pairing a request with its response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZiCorrelationId(Uuid);

impl ZiCorrelationId {
    pub fn new() -> Self {
        ZiCorrelationId(Uuid::now_v7())
    }
}

impl Default for ZiCorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ZiCorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ZiCorrelationId {
    type Err = ZiError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(ZiCorrelationId)
            .map_err(|e| ZiError::protocol(format!("failed to parse response id '{}': {}", s, e)))
    }
}

/// Request frame written to a plugin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZiRpcRequest {
    pub id: ZiCorrelationId,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl ZiRpcRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        ZiRpcRequest {
            id: ZiCorrelationId::new(),
            method: method.into(),
            params,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Error object a plugin may return instead of a result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZiRpcError {
    #[serde(default)]
    pub code: i64,
    pub message: String,
}

/// Response frame read from a plugin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZiRpcResponse {
    pub id: String,
    /// Component the plugin designates as the consumer of this response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ZiRpcError>,
}

impl ZiRpcResponse {
    pub fn correlation_id(&self) -> Result<ZiCorrelationId> {
        self.id.parse()
    }

    /// Turn a plugin-reported error into a `Result`.
    pub fn into_result(self) -> std::result::Result<Value, ZiRpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result),
        }
    }
}

/// Classification of one line read from a plugin.
#[derive(Debug, PartialEq)]
pub enum ZiFrame<'a> {
    /// Blank line, ignored.
    Empty,
    /// Free-form text the plugin printed.
    Log(&'a [u8]),
    /// Candidate protocol frame.
    Json(&'a [u8]),
}

pub fn classify(line: &[u8]) -> ZiFrame<'_> {
    match line.first() {
        None => ZiFrame::Empty,
        Some(b'{') => ZiFrame::Json(line),
        Some(_) => ZiFrame::Log(line),
    }
}

/// Decode a JSON line into a response record.
pub fn decode_response(line: &[u8]) -> Result<ZiRpcResponse> {
    serde_json::from_slice(line)
        .map_err(|e| ZiError::protocol(format!("failed to decode response: {}", e)))
}
