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

//! Declared plugin identity.
//!
//! A manifest is produced either from a bundled `manifest.json` entry
//! (subprocess packages) or from the first line a WebAssembly module prints.
//! Once [`ZiManifest::parse`] succeeds the manifest is never mutated.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, ZiError};

/// Unique plugin identifier declared by a manifest.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZiPluginId(String);

impl ZiPluginId {
    pub fn new(id: impl Into<String>) -> Self {
        ZiPluginId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ZiPluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ZiPluginId {
    fn from(id: &str) -> Self {
        ZiPluginId(id.to_string())
    }
}

impl From<String> for ZiPluginId {
    fn from(id: String) -> Self {
        ZiPluginId(id)
    }
}

/// Plugin identity and declared capabilities.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZiManifest {
    pub id: ZiPluginId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ZiManifest {
    /// Decode and check a manifest document.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let manifest: ZiManifest = serde_json::from_slice(bytes).map_err(|e| {
            ZiError::validation(format!("failed to decode manifest: {}", e))
        })?;
        if manifest.id.as_str().trim().is_empty() {
            return Err(ZiError::validation("manifest is missing a plugin id"));
        }
        Ok(manifest)
    }

    /// Display name, falling back to the id when none is declared.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.id.as_str()
        } else {
            &self.name
        }
    }
}
