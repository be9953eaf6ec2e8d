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

pub mod manifest;
pub mod archive;
pub mod protocol;
pub mod state;
pub mod session;
pub mod runner;
pub mod process;
#[cfg(feature = "wasm")]
pub mod wasm;
pub mod manager;

pub use manifest::{ZiManifest, ZiPluginId};
pub use protocol::{ZiCorrelationId, ZiRpcError, ZiRpcRequest, ZiRpcResponse, MAX_FRAME_BYTES};
pub use state::{ZiActiveState, ZiReportedState, ZiStateReport};
pub use session::{ZiRunType, ZiSession};
pub use runner::{build_runner, ZiRunner};
pub use process::ZiProcessRunner;
#[cfg(feature = "wasm")]
pub use wasm::ZiWasmRunner;
pub use manager::{ZiManager, ZiMemoryRecordStore, ZiPluginRecord, ZiRecordStore, ZiRestoreFailure};
