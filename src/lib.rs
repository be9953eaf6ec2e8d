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

//! # Zi Orbit
//!
//! Plugin execution runtime for Zi. Untrusted plugin packages are loaded,
//! run inside an isolation backend, and spoken to through a correlated
//! request/response protocol.
//!
//! ## Module Overview
//!
//! - **errors**: `ZiError` and the crate-wide `Result`
//! - **config**: `ZiRuntimeConfig`, loadable from JSON or YAML
//! - **orbit::manifest / orbit::archive**: package identity, validation and
//!   contained extraction
//! - **orbit::protocol**: newline-delimited JSON frames and correlation ids
//! - **orbit::state / orbit::session**: lifecycle state machine and the live
//!   session with its pending-command table
//! - **orbit::process**: subprocess backend
//! - **orbit::wasm**: WebAssembly backend (feature `wasm`)
//! - **orbit::runner**: the `ZiRunner` contract both backends implement
//! - **orbit::manager**: desired-state reconciliation against a record store
//!
//! ## Feature Flags
//!
//! - `wasm`: Enables the wasmtime backend
//! - `full`: Enables all features (default)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use zi_orbit::{build_runner, ZiRuntimeConfig};
//!
//! let runner = build_runner(ZiRuntimeConfig::default())?;
//! let session = runner.load(&archive_bytes).await?;
//! runner.start_plugin(session.id()).await?;
//! let response = session.send_command("search.query", serde_json::json!({"q": "rust"})).await?;
//! runner.stop_plugin(session.id()).await?;
//! ```
//!
//! ## Error Handling
//!
//! All operations return `Result<T, ZiError>`. Validation and security errors
//! are reported synchronously; failures of a running plugin move its session
//! to `errored` and leave every other session untouched.

#![allow(non_snake_case)]

pub mod errors;
pub mod config;
pub mod orbit;

pub use errors::{Result, ZiError};
pub use config::{ZiBackendKind, ZiRuntimeConfig, ZiRuntimeConfigBuilder};
pub use orbit::{
    build_runner, ZiActiveState, ZiCorrelationId, ZiManager, ZiManifest, ZiMemoryRecordStore,
    ZiPluginId, ZiPluginRecord, ZiProcessRunner, ZiRecordStore, ZiReportedState, ZiRestoreFailure,
    ZiRpcError, ZiRpcRequest, ZiRpcResponse, ZiRunType, ZiRunner, ZiSession, ZiStateReport,
};
#[cfg(feature = "wasm")]
pub use orbit::ZiWasmRunner;
