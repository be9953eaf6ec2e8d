//! Copyright © 2025-2026 Wenze Wei. All Rights Reserved.
//!
//! This file is part of Zi.
//! The Zi project belongs to the Dunimd Team.
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

//! # Zi Orbit Error Module
//!
//! This module defines the error types used throughout the Zi Orbit runtime
//! for consistent error handling and reporting.
//!
//! ## Error Categories
//!
//! - **Validation**: Malformed archives, missing manifest or executable,
//!   unknown desired states. Reported synchronously, never retried.
//! - **Security**: Archive entries escaping the working directory.
//! - **Protocol**: Malformed frames and responses for unknown commands. These
//!   move the owning session to `errored` without touching other sessions.
//! - **Runtime**: Unexpected process exits, pipe failures, sandbox traps.
//! - **NotFound / AlreadyRunning / AlreadyLoaded / NotRunning**: Lifecycle
//!   preconditions on the runner registry and session state.
//! - **Io / Serde / Zip / Sandbox**: Wrapped failures of the underlying crates.
//! - **Internal**: Unexpected internal failures.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zip::result::ZipError;

/// Convenience result type used throughout Zi Orbit.
pub type Result<T> = std::result::Result<T, ZiError>;

/// Canonical error enumeration for Zi Orbit.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ZiError {
    /// Errors originating from filesystem or pipe IO.
    #[error("io error: {0}")]
    Io(String),

    /// Validation errors triggered by invalid archives or inputs.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Archive contents that would escape their extraction directory.
    #[error("security error: {message}")]
    Security { message: String },

    /// Frames that violate the plugin wire protocol.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Failures of a running plugin (exit, trap, broken pipe).
    #[error("plugin '{plugin}' failed: {message}")]
    Runtime { plugin: String, message: String },

    /// No live session exists for the plugin.
    #[error("plugin session not found: {plugin}")]
    NotFound { plugin: String },

    /// The plugin is already loaded in this runner.
    #[error("plugin already loaded: {plugin}")]
    AlreadyLoaded { plugin: String },

    /// The session is already running.
    #[error("plugin is already running: {plugin}")]
    AlreadyRunning { plugin: String },

    /// The session has no active run to talk to.
    #[error("plugin is not running: {plugin}")]
    NotRunning { plugin: String },

    /// An operation did not complete within its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Wrapper for serde-style serialization issues.
    #[error("serialization error: {0}")]
    Serde(String),

    /// Errors originating from ZIP file operations.
    #[error("zip error: {0}")]
    Zip(String),

    /// Errors raised by the WebAssembly sandbox.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// Catch-all variant for unexpected situations.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for ZiError {
    fn from(err: io::Error) -> Self {
        ZiError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ZiError {
    fn from(err: serde_json::Error) -> Self {
        ZiError::Serde(err.to_string())
    }
}

impl From<serde_yaml::Error> for ZiError {
    fn from(err: serde_yaml::Error) -> Self {
        ZiError::Serde(err.to_string())
    }
}

impl From<ZipError> for ZiError {
    fn from(err: ZipError) -> Self {
        ZiError::Zip(err.to_string())
    }
}

impl From<anyhow::Error> for ZiError {
    fn from(err: anyhow::Error) -> Self {
        ZiError::Sandbox(format!("{:#}", err))
    }
}

impl From<tokio::task::JoinError> for ZiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ZiError::Internal(format!("background task failed: {}", err))
    }
}

impl ZiError {
    /// Helper to construct simple validation errors.
    pub fn validation<T: Into<String>>(message: T) -> Self {
        ZiError::Validation {
            message: message.into(),
        }
    }

    /// Helper to construct security errors.
    pub fn security<T: Into<String>>(message: T) -> Self {
        ZiError::Security {
            message: message.into(),
        }
    }

    /// Helper to construct protocol errors.
    pub fn protocol<T: Into<String>>(message: T) -> Self {
        ZiError::Protocol {
            message: message.into(),
        }
    }

    /// Helper to construct runtime errors for a plugin.
    pub fn runtime(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        ZiError::Runtime {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    pub fn not_found(plugin: impl Into<String>) -> Self {
        ZiError::NotFound {
            plugin: plugin.into(),
        }
    }

    pub fn already_loaded(plugin: impl Into<String>) -> Self {
        ZiError::AlreadyLoaded {
            plugin: plugin.into(),
        }
    }

    pub fn already_running(plugin: impl Into<String>) -> Self {
        ZiError::AlreadyRunning {
            plugin: plugin.into(),
        }
    }

    pub fn not_running(plugin: impl Into<String>) -> Self {
        ZiError::NotRunning {
            plugin: plugin.into(),
        }
    }

    /// Helper to construct internal errors.
    pub fn internal<T: Into<String>>(message: T) -> Self {
        ZiError::Internal(message.into())
    }

    /// Whether the error is a "not found" lookup failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ZiError::NotFound { .. })
    }
}
