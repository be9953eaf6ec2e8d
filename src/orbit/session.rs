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

//! # Plugin Sessions
//!
//! A [`ZiSession`] is the runtime's live handle to one loaded plugin. It is
//! shared by both isolation backends and owns:
//!
//! - the observed lifecycle state, behind its own state lock,
//! - the inbound byte channel of the current run (host -> plugin),
//! - the pending-command table keyed by correlation id.
//!
//! Backends feed plugin output into [`ZiSession::dispatch`], which routes each
//! response to the caller awaiting it and arbitrates how the run ends. The
//! backend-specific handle (child process, sandbox store) lives in the
//! backend and is never reachable from here.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::errors::{Result, ZiError};
use crate::orbit::archive;
use crate::orbit::manifest::{ZiManifest, ZiPluginId};
use crate::orbit::protocol::{self, ZiCorrelationId, ZiFrame, ZiRpcRequest, ZiRpcResponse};
use crate::orbit::state::{ZiReportedState, ZiStateReport};

/// How a plugin is run. Only long-lived background plugins exist today.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZiRunType {
    #[default]
    Background,
}

/// A request waiting for its response.
#[derive(Debug)]
pub(crate) struct ZiPendingCommand {
    request: ZiRpcRequest,
    respond: oneshot::Sender<ZiRpcResponse>,
}

/// How a run ended, as decided by the dispatch loop.
#[derive(Debug)]
pub(crate) enum ZiRunOutcome {
    Stopped,
    Failed(ZiError),
}

/// Sending half of a run's internal error channel.
///
/// The channel holds a single slot: the first report wins and decides the
/// terminal state, later reports are dropped. `None` means a requested stop.
#[derive(Clone, Debug)]
pub(crate) struct ZiRunSignal(mpsc::Sender<Option<ZiError>>);

impl ZiRunSignal {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<Option<ZiError>>) {
        let (tx, rx) = mpsc::channel(1);
        (ZiRunSignal(tx), rx)
    }

    pub(crate) fn stopped(&self) {
        let _ = self.0.try_send(None);
    }

    pub(crate) fn fail(&self, err: ZiError) {
        let _ = self.0.try_send(Some(err));
    }
}

/// How long a late response to an abandoned command is tolerated.
const ABANDONED_RETENTION: Duration = Duration::from_secs(300);
const MAX_ABANDONED: usize = 1024;

/// Correlation ids whose callers stopped waiting before a response arrived.
///
/// Bounded in both size and age; the oldest ids fall out first.
#[derive(Debug, Default)]
struct ZiAbandonedIds {
    entries: VecDeque<(ZiCorrelationId, Instant)>,
}

impl ZiAbandonedIds {
    fn prune(&mut self, now: Instant) {
        while let Some((_, at)) = self.entries.front() {
            if now.duration_since(*at) < ABANDONED_RETENTION && self.entries.len() <= MAX_ABANDONED {
                break;
            }
            self.entries.pop_front();
        }
    }

    fn record(&mut self, id: ZiCorrelationId) {
        let now = Instant::now();
        self.entries.push_back((id, now));
        self.prune(now);
    }

    fn take(&mut self, id: &ZiCorrelationId) -> bool {
        self.prune(Instant::now());
        match self.entries.iter().position(|(entry, _)| entry == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Removes a pending entry when the awaiting caller goes away.
struct ZiPendingGuard<'a> {
    session: &'a ZiSession,
    id: ZiCorrelationId,
}

impl Drop for ZiPendingGuard<'_> {
    fn drop(&mut self) {
        if self.session.pending.remove(&self.id).is_some() {
            self.session.abandoned_ids().record(self.id);
        }
    }
}

/// Live runtime representation of one loaded plugin.
pub struct ZiSession {
    id: ZiPluginId,
    run_type: ZiRunType,
    manifest: ZiManifest,
    binary: Arc<[u8]>,
    digest: String,
    loaded_at: SystemTime,
    command_timeout: Duration,
    state: RwLock<ZiStateReport>,
    inbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    pending: DashMap<ZiCorrelationId, ZiPendingCommand>,
    abandoned: Mutex<ZiAbandonedIds>,
    retired: AtomicBool,
}

impl fmt::Debug for ZiSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZiSession")
            .field("id", &self.id)
            .field("run_type", &self.run_type)
            .field("state", &self.report())
            .field("digest", &self.digest)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl ZiSession {
    pub(crate) fn new(manifest: ZiManifest, binary: Vec<u8>, command_timeout: Duration) -> Self {
        let digest = archive::digest(&binary);
        ZiSession {
            id: manifest.id.clone(),
            run_type: ZiRunType::Background,
            manifest,
            binary: Arc::from(binary),
            digest,
            loaded_at: SystemTime::now(),
            command_timeout,
            state: RwLock::new(ZiStateReport::default()),
            inbound: Mutex::new(None),
            pending: DashMap::new(),
            abandoned: Mutex::new(ZiAbandonedIds::default()),
            retired: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &ZiPluginId {
        &self.id
    }

    pub fn run_type(&self) -> ZiRunType {
        self.run_type
    }

    pub fn manifest(&self) -> &ZiManifest {
        &self.manifest
    }

    /// BLAKE3 hex digest of the archive this session was loaded from.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn loaded_at(&self) -> SystemTime {
        self.loaded_at
    }

    pub(crate) fn binary(&self) -> Arc<[u8]> {
        Arc::clone(&self.binary)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ZiStateReport> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ZiStateReport> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn inbound_slot(&self) -> MutexGuard<'_, Option<mpsc::Sender<Vec<u8>>>> {
        self.inbound.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn abandoned_ids(&self) -> MutexGuard<'_, ZiAbandonedIds> {
        self.abandoned.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ZiReportedState {
        self.read_state().state
    }

    /// Note recorded with the last transition into `errored`.
    pub fn error_note(&self) -> Option<String> {
        self.read_state().error.clone()
    }

    pub fn report(&self) -> ZiStateReport {
        self.read_state().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &ZiCorrelationId) -> bool {
        self.pending.contains_key(id)
    }

    fn inbound_sender(&self) -> Result<mpsc::Sender<Vec<u8>>> {
        self.inbound_slot()
            .clone()
            .ok_or_else(|| ZiError::not_running(self.id.as_str()))
    }

    /// Write one raw frame to the plugin without awaiting a response.
    pub async fn send_bytes(&self, payload: Vec<u8>) -> Result<()> {
        let sender = self.inbound_sender()?;
        match tokio::time::timeout(self.command_timeout, sender.send(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ZiError::not_running(self.id.as_str())),
            Err(_) => Err(ZiError::Timeout(format!(
                "plugin '{}' did not accept input within {:?}",
                self.id, self.command_timeout
            ))),
        }
    }

    /// Send a command and wait for the response carrying its correlation id.
    ///
    /// Responses of concurrently issued commands may arrive in any order.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<ZiRpcResponse> {
        let request = ZiRpcRequest::new(method, params);
        let id = request.id;
        let payload = request.encode()?;
        let sender = self.inbound_sender()?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, ZiPendingCommand { request, respond: tx });
        let _guard = ZiPendingGuard { session: self, id };

        log::debug!(
            "orbit.session.command: sending command - plugin={}, id={}, method={}",
            self.id,
            id,
            method
        );

        let exchange = async {
            sender
                .send(payload)
                .await
                .map_err(|_| ZiError::not_running(self.id.as_str()))?;
            drop(sender);
            rx.await.map_err(|_| {
                ZiError::runtime(
                    self.id.as_str(),
                    "session stopped before the command was answered",
                )
            })
        };

        match tokio::time::timeout(self.command_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ZiError::Timeout(format!(
                "command '{}' ({}) to plugin '{}' got no response within {:?}",
                method, id, self.id, self.command_timeout
            ))),
        }
    }

    /// Mark the session as unloading; later starts are refused.
    ///
    /// Backends check this under their handle lock, so a start either wins
    /// the lock and is then stopped by the unload, or sees the flag.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// Fail fast when a start would violate the state machine.
    pub(crate) fn ensure_startable(&self) -> Result<()> {
        if self.retired.load(Ordering::SeqCst) {
            return Err(ZiError::not_found(self.id.as_str()));
        }
        if self.state() == ZiReportedState::Active {
            return Err(ZiError::already_running(self.id.as_str()));
        }
        Ok(())
    }

    /// Enter `active` and publish the inbound channel of the new run.
    pub(crate) fn begin_run(&self, inbound: mpsc::Sender<Vec<u8>>) -> Result<()> {
        {
            let mut state = self.write_state();
            if state.state == ZiReportedState::Active {
                return Err(ZiError::already_running(self.id.as_str()));
            }
            state.transition(ZiReportedState::Active, None)?;
        }
        *self.inbound_slot() = Some(inbound);
        log::info!(
            "orbit.session.active: plugin session started - plugin={}, run_type={:?}",
            self.id,
            self.run_type
        );
        Ok(())
    }

    /// Drop the session's copy of the inbound sender so the writer sees EOF.
    pub(crate) fn close_inbound(&self) {
        self.inbound_slot().take();
    }

    /// Route plugin output until the run ends and report how it ended.
    ///
    /// When `handshake` is set the first JSON frame is the plugin announcing
    /// its manifest; its id must match the loaded plugin.
    pub(crate) async fn dispatch(
        &self,
        cancel: &CancellationToken,
        mut outbound: mpsc::Receiver<Vec<u8>>,
        mut signals: mpsc::Receiver<Option<ZiError>>,
        mut handshake: bool,
    ) -> ZiRunOutcome {
        let mut outbound_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("orbit.session.cancelled: run context cancelled - plugin={}", self.id);
                    return ZiRunOutcome::Stopped;
                }
                signal = signals.recv() => {
                    return match signal {
                        Some(None) => ZiRunOutcome::Stopped,
                        Some(Some(err)) => ZiRunOutcome::Failed(err),
                        None => ZiRunOutcome::Failed(ZiError::internal("run signal channel closed")),
                    };
                }
                line = outbound.recv(), if outbound_open => match line {
                    Some(line) => {
                        if let Err(err) = self.handle_line(&line, cancel, &mut handshake) {
                            return ZiRunOutcome::Failed(err);
                        }
                    }
                    None => outbound_open = false,
                },
            }
        }
    }

    fn handle_line(&self, line: &[u8], cancel: &CancellationToken, handshake: &mut bool) -> Result<()> {
        match protocol::classify(line) {
            ZiFrame::Empty => Ok(()),
            ZiFrame::Log(text) => {
                log::info!(
                    "orbit.plugin.log: {} - plugin={}",
                    String::from_utf8_lossy(text),
                    self.id
                );
                Ok(())
            }
            ZiFrame::Json(frame) if *handshake => {
                *handshake = false;
                self.check_handshake(frame)
            }
            ZiFrame::Json(frame) => self.deliver(frame, cancel),
        }
    }

    fn check_handshake(&self, frame: &[u8]) -> Result<()> {
        let announced = ZiManifest::parse(frame)
            .map_err(|e| ZiError::protocol(format!("invalid manifest announcement: {}", e)))?;
        if announced.id != self.id {
            return Err(ZiError::protocol(format!(
                "plugin announced id '{}' but was loaded as '{}'",
                announced.id, self.id
            )));
        }
        log::debug!("orbit.session.handshake: manifest announcement accepted - plugin={}", self.id);
        Ok(())
    }

    fn deliver(&self, frame: &[u8], cancel: &CancellationToken) -> Result<()> {
        let response = protocol::decode_response(frame)?;
        let id = response.correlation_id()?;

        let Some((_, pending)) = self.pending.remove(&id) else {
            if self.abandoned_ids().take(&id) {
                log::warn!(
                    "orbit.session.late_response: response arrived after its caller gave up - plugin={}, id={}",
                    self.id,
                    id
                );
                return Ok(());
            }
            return Err(ZiError::protocol(format!(
                "received response for unknown command: {}",
                response.id
            )));
        };

        log::debug!(
            "orbit.session.response: response received - plugin={}, id={}, method={}, recipient={:?}",
            self.id,
            id,
            pending.request.method,
            response.recipient
        );

        if cancel.is_cancelled() {
            log::debug!(
                "orbit.session.response_abandoned: run cancelled before delivery - plugin={}, id={}",
                self.id,
                id
            );
            return Ok(());
        }
        if pending.respond.send(response).is_err() {
            log::debug!(
                "orbit.session.response_dropped: caller stopped waiting - plugin={}, id={}",
                self.id,
                id
            );
        }
        Ok(())
    }

    /// Apply the terminal transition of a run and release its channels.
    pub(crate) fn finish_run(&self, outcome: ZiRunOutcome) {
        self.close_inbound();
        self.pending.clear();

        let (next, note) = match outcome {
            ZiRunOutcome::Stopped => {
                log::info!("orbit.session.stopped: plugin stopped - plugin={}", self.id);
                (ZiReportedState::Inactive, None)
            }
            ZiRunOutcome::Failed(err) => {
                log::error!(
                    "orbit.session.errored: plugin run failed - plugin={}, error={}",
                    self.id,
                    err
                );
                (ZiReportedState::Errored, Some(err.to_string()))
            }
        };

        if let Err(err) = self.write_state().transition(next, note) {
            log::warn!(
                "orbit.session.transition_rejected: {} - plugin={}",
                err,
                self.id
            );
        }
    }
}
