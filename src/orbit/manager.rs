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

//! # Desired-State Reconciliation
//!
//! The host persists which plugins *should* run ([`ZiActiveState`]); the
//! runner reports what *does* run ([`ZiReportedState`]). [`ZiManager`] drives
//! the runner toward the desired state and never writes the record store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, ZiError};
use crate::orbit::manifest::ZiManifest;
use crate::orbit::runner::ZiRunner;
use crate::orbit::state::{ZiActiveState, ZiReportedState, ZiStateReport};

/// Persisted plugin record as the host stores it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZiPluginRecord {
    /// Storage key, distinct from the manifest's plugin id.
    pub id: String,
    pub manifest: ZiManifest,
    #[serde(default)]
    pub active_state: ZiActiveState,
}

/// Read access to persisted plugin records and their archives.
#[async_trait]
pub trait ZiRecordStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<ZiPluginRecord>;

    async fn load_binary(&self, id: &str) -> Result<Vec<u8>>;

    async fn list(&self) -> Result<Vec<ZiPluginRecord>>;
}

/// In-memory record store.
#[derive(Default)]
pub struct ZiMemoryRecordStore {
    records: RwLock<HashMap<String, (ZiPluginRecord, Arc<[u8]>)>>,
}

impl ZiMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record together with its archive bytes.
    pub fn insert(&self, record: ZiPluginRecord, binary: Vec<u8>) {
        if let Ok(mut records) = self.records.write() {
            records.insert(record.id.clone(), (record, Arc::from(binary)));
        }
    }

    pub fn set_active_state(&self, id: &str, state: ZiActiveState) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| ZiError::internal("record store lock poisoned"))?;
        let (record, _) = records.get_mut(id).ok_or_else(|| ZiError::not_found(id))?;
        record.active_state = state;
        Ok(())
    }

    fn entry(&self, id: &str) -> Result<(ZiPluginRecord, Arc<[u8]>)> {
        let records = self
            .records
            .read()
            .map_err(|_| ZiError::internal("record store lock poisoned"))?;
        records.get(id).cloned().ok_or_else(|| ZiError::not_found(id))
    }
}

#[async_trait]
impl ZiRecordStore for ZiMemoryRecordStore {
    async fn get(&self, id: &str) -> Result<ZiPluginRecord> {
        self.entry(id).map(|(record, _)| record)
    }

    async fn load_binary(&self, id: &str) -> Result<Vec<u8>> {
        self.entry(id).map(|(_, binary)| binary.to_vec())
    }

    async fn list(&self) -> Result<Vec<ZiPluginRecord>> {
        let records = self
            .records
            .read()
            .map_err(|_| ZiError::internal("record store lock poisoned"))?;
        let mut list: Vec<ZiPluginRecord> = records.values().map(|(record, _)| record.clone()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }
}

/// A record `restore` could not bring up.
#[derive(Clone, Debug)]
pub struct ZiRestoreFailure {
    pub record_id: String,
    pub error: ZiError,
}

/// Reconciles persisted desired state with the runner.
pub struct ZiManager {
    store: Arc<dyn ZiRecordStore>,
    runner: Arc<dyn ZiRunner>,
}

impl ZiManager {
    pub fn new(store: Arc<dyn ZiRecordStore>, runner: Arc<dyn ZiRunner>) -> Self {
        ZiManager { store, runner }
    }

    pub fn runner(&self) -> &Arc<dyn ZiRunner> {
        &self.runner
    }

    pub async fn set_active_state(&self, record_id: &str, desired: ZiActiveState) -> Result<()> {
        let record = self.store.get(record_id).await?;
        match desired {
            ZiActiveState::Active => self.activate(&record).await,
            ZiActiveState::Inactive => self.deactivate(&record).await,
        }
    }

    /// Same as [`set_active_state`](Self::set_active_state) for an unparsed state.
    pub async fn set_active_state_str(&self, record_id: &str, desired: &str) -> Result<()> {
        let desired: ZiActiveState = desired.parse()?;
        self.set_active_state(record_id, desired).await
    }

    async fn activate(&self, record: &ZiPluginRecord) -> Result<()> {
        let id = &record.manifest.id;
        match self.runner.get_session(id).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                let binary = self.store.load_binary(&record.id).await?;
                match self.runner.load(&binary).await {
                    Ok(session) if session.id() != id => {
                        let loaded = session.id().clone();
                        if let Err(err) = self.runner.unload(&loaded).await {
                            log::warn!("orbit.manager.unload_failed: {} - plugin={}", err, loaded);
                        }
                        return Err(ZiError::validation(format!(
                            "record '{}' expects plugin '{}' but its archive declares '{}'",
                            record.id, id, loaded
                        )));
                    }
                    Ok(_) => {}
                    // Lost a race with a concurrent activation.
                    Err(ZiError::AlreadyLoaded { .. }) => {}
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        }

        match self.runner.start_plugin(id).await {
            Ok(()) => {
                log::info!("orbit.manager.activated: plugin activated - record={}, plugin={}", record.id, id);
                Ok(())
            }
            Err(ZiError::AlreadyRunning { .. }) => {
                log::debug!("orbit.manager.noop: plugin already active - record={}, plugin={}", record.id, id);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn deactivate(&self, record: &ZiPluginRecord) -> Result<()> {
        let id = &record.manifest.id;
        match self.runner.stop_plugin(id).await {
            Ok(()) => {
                log::info!("orbit.manager.deactivated: plugin deactivated - record={}, plugin={}", record.id, id);
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Observed state of the record's plugin; `inactive` when not loaded.
    pub async fn reported_state(&self, record_id: &str) -> Result<ZiStateReport> {
        let record = self.store.get(record_id).await?;
        match self.runner.get_session(&record.manifest.id).await {
            Ok(session) => Ok(session.report()),
            Err(err) if err.is_not_found() => Ok(ZiStateReport {
                state: ZiReportedState::Inactive,
                error: None,
            }),
            Err(err) => Err(err),
        }
    }

    /// Bring up every record whose desired state is `active`.
    ///
    /// Records are activated concurrently. A failing record does not stop the
    /// others; its error is logged and returned.
    pub async fn restore(&self) -> Result<Vec<ZiRestoreFailure>> {
        let records = self.store.list().await?;
        let wanted: Vec<&ZiPluginRecord> = records
            .iter()
            .filter(|record| record.active_state == ZiActiveState::Active)
            .collect();

        log::info!("orbit.manager.restore: restoring active plugins - count={}", wanted.len());

        let results = join_all(wanted.iter().map(|record| self.activate(record))).await;

        let failures: Vec<ZiRestoreFailure> = wanted
            .iter()
            .zip(results)
            .filter_map(|(record, result)| {
                result.err().map(|error| {
                    log::error!(
                        "orbit.manager.restore_failed: {} - record={}, plugin={}",
                        error,
                        record.id,
                        record.manifest.id
                    );
                    ZiRestoreFailure {
                        record_id: record.id.clone(),
                        error,
                    }
                })
            })
            .collect();
        Ok(failures)
    }
}
