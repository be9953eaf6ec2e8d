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

//! # ZiOrbit Runner Contract
//!
//! [`ZiRunner`] is the backend-agnostic entry point used by the manager.
//! Two implementations exist and one is chosen when the runner is built:
//!
//! - [`ZiProcessRunner`]: packaged executables run as child processes.
//! - `ZiWasmRunner` (feature `wasm`): packaged modules run inside wasmtime.
//!
//! Each runner exclusively owns its session registry, the single source of
//! truth for which plugins are loaded.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::{ZiBackendKind, ZiRuntimeConfig};
use crate::errors::{Result, ZiError};
use crate::orbit::manifest::{ZiManifest, ZiPluginId};
use crate::orbit::process::ZiProcessRunner;
use crate::orbit::session::ZiSession;

/// Plugin lifecycle operations shared by every isolation backend.
#[async_trait]
pub trait ZiRunner: Send + Sync {
    /// Backend this runner was built for.
    fn backend(&self) -> ZiBackendKind;

    /// Validate an archive and register an inactive session for it.
    async fn load(&self, bin: &[u8]) -> Result<Arc<ZiSession>>;

    /// Stop the plugin if needed and dispose of its session.
    async fn unload(&self, id: &ZiPluginId) -> Result<()>;

    /// Check an archive and return the manifest it declares.
    async fn validate(&self, bin: &[u8]) -> Result<ZiManifest>;

    async fn get_session(&self, id: &ZiPluginId) -> Result<Arc<ZiSession>>;

    async fn get_sessions(&self) -> Vec<Arc<ZiSession>>;

    /// Spawn the plugin. Fails with `AlreadyRunning` for an active session.
    async fn start_plugin(&self, id: &ZiPluginId) -> Result<()>;

    /// Stop the plugin. Stopping a session that is not running succeeds.
    async fn stop_plugin(&self, id: &ZiPluginId) -> Result<()>;
}

/// Build the runner selected by `config.backend`.
pub fn build_runner(config: ZiRuntimeConfig) -> Result<Arc<dyn ZiRunner>> {
    match config.backend {
        ZiBackendKind::Process => Ok(Arc::new(ZiProcessRunner::new(config))),
        #[cfg(feature = "wasm")]
        ZiBackendKind::Wasm => Ok(Arc::new(crate::orbit::wasm::ZiWasmRunner::new(config)?)),
        #[cfg(not(feature = "wasm"))]
        ZiBackendKind::Wasm => Err(ZiError::validation(
            "the wasm backend is not compiled in; enable the `wasm` feature",
        )),
    }
}

/// Backend wrapper that exposes the shared session it hosts.
pub(crate) trait ZiHostedSession: Send + Sync {
    fn session(&self) -> &Arc<ZiSession>;
}

/// Concurrent plugin id -> backend session map.
pub(crate) struct ZiSessionRegistry<T> {
    inner: DashMap<ZiPluginId, Arc<T>>,
}

impl<T: ZiHostedSession> ZiSessionRegistry<T> {
    pub(crate) fn new() -> Self {
        ZiSessionRegistry {
            inner: DashMap::new(),
        }
    }

    /// Insert unless the id is already taken.
    pub(crate) fn insert(&self, id: ZiPluginId, entry: Arc<T>) -> Result<()> {
        match self.inner.entry(id) {
            Entry::Occupied(slot) => Err(ZiError::already_loaded(slot.key().as_str())),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    pub(crate) fn lookup(&self, id: &ZiPluginId) -> Result<Arc<T>> {
        self.inner
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ZiError::not_found(id.as_str()))
    }

    pub(crate) fn remove(&self, id: &ZiPluginId) -> Option<Arc<T>> {
        self.inner.remove(id).map(|(_, entry)| entry)
    }

    pub(crate) fn sessions(&self) -> Vec<Arc<ZiSession>> {
        self.inner
            .iter()
            .map(|entry| Arc::clone(entry.value().session()))
            .collect()
    }
}
