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

//! # Zi Orbit Runtime Configuration
//!
//! Configuration for the plugin runners: which isolation backend to build,
//! where working directories are created, and the timeouts that bound
//! shutdown, command round trips and manifest probing.
//!
//! Configuration can be loaded from JSON or YAML documents. Every field is
//! optional in the document; missing values fall back to the defaults.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, ZiError};

/// Isolation backend a runner is built with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZiBackendKind {
    /// Packaged executable run as a child process.
    #[default]
    Process,
    /// Packaged WebAssembly module run inside the wasmtime sandbox.
    Wasm,
}

/// Configuration shared by both runner backends.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ZiRuntimeConfig {
    pub backend: ZiBackendKind,
    /// Directory under which private working directories are created.
    pub work_root: PathBuf,
    /// Prefix of every working directory name.
    pub workdir_prefix: String,
    /// How long a graceful stop may take before the plugin is killed.
    pub stop_grace_ms: u64,
    /// Deadline for a single command round trip.
    pub command_timeout_ms: u64,
    /// Deadline for a WebAssembly module to print its manifest.
    pub probe_timeout_ms: u64,
    /// Whether child processes inherit the host environment.
    pub inherit_env: bool,
    /// Extra environment variables passed to child processes.
    pub env: HashMap<String, String>,
}

impl Default for ZiRuntimeConfig {
    fn default() -> Self {
        ZiRuntimeConfig {
            backend: ZiBackendKind::default(),
            work_root: std::env::temp_dir(),
            workdir_prefix: "zi-orbit-".to_string(),
            stop_grace_ms: 3_000,
            command_timeout_ms: 30_000,
            probe_timeout_ms: 5_000,
            inherit_env: true,
            env: HashMap::new(),
        }
    }
}

impl ZiRuntimeConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Parse a JSON document, merging it over the defaults.
    pub fn from_json(value: &Value) -> Result<Self> {
        let builder: ZiRuntimeConfigBuilder = serde_json::from_value(value.clone())?;
        Ok(builder.build())
    }

    /// Parse a YAML document, merging it over the defaults.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let builder: ZiRuntimeConfigBuilder = serde_yaml::from_str(text)?;
        Ok(builder.build())
    }

    /// Load configuration from a `.json`, `.yaml` or `.yml` file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "json" => {
                let value: Value = serde_json::from_str(&text)?;
                Self::from_json(&value)
            }
            "yaml" | "yml" => Self::from_yaml(&text),
            other => Err(ZiError::validation(format!(
                "unsupported configuration format: '{}'",
                other
            ))),
        }
    }
}

/// All-optional mirror of [`ZiRuntimeConfig`], merged over the defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZiRuntimeConfigBuilder {
    pub backend: Option<ZiBackendKind>,
    pub work_root: Option<PathBuf>,
    pub workdir_prefix: Option<String>,
    pub stop_grace_ms: Option<u64>,
    pub command_timeout_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub inherit_env: Option<bool>,
    pub env: Option<HashMap<String, String>>,
}

impl ZiRuntimeConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: ZiBackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }

    pub fn stop_grace_ms(mut self, ms: u64) -> Self {
        self.stop_grace_ms = Some(ms);
        self
    }

    pub fn command_timeout_ms(mut self, ms: u64) -> Self {
        self.command_timeout_ms = Some(ms);
        self
    }

    pub fn probe_timeout_ms(mut self, ms: u64) -> Self {
        self.probe_timeout_ms = Some(ms);
        self
    }

    pub fn build(self) -> ZiRuntimeConfig {
        let base = ZiRuntimeConfig::default();
        ZiRuntimeConfig {
            backend: self.backend.unwrap_or(base.backend),
            work_root: self.work_root.unwrap_or(base.work_root),
            workdir_prefix: self.workdir_prefix.unwrap_or(base.workdir_prefix),
            stop_grace_ms: self.stop_grace_ms.unwrap_or(base.stop_grace_ms),
            command_timeout_ms: self.command_timeout_ms.unwrap_or(base.command_timeout_ms),
            probe_timeout_ms: self.probe_timeout_ms.unwrap_or(base.probe_timeout_ms),
            inherit_env: self.inherit_env.unwrap_or(base.inherit_env),
            env: self.env.unwrap_or(base.env),
        }
    }
}
