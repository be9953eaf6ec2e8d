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

//! # Subprocess Backend
//!
//! Runs a packaged executable as a child process inside a private working
//! directory and talks to it over its standard streams.
//!
//! A run consists of five tasks sharing one cancellation token:
//!
//! - **writer**: inbound channel -> child stdin, one frame per line
//! - **output**: child stdout -> outbound channel, one line per frame
//! - **diagnostic**: child stderr -> warning log lines
//! - **exit watcher**: owns the child, reports how it terminated
//! - **supervisor**: runs the session dispatch loop, then reaps the child,
//!   removes the working directory and applies the terminal state

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ZiBackendKind, ZiRuntimeConfig};
use crate::errors::{Result, ZiError};
use crate::orbit::archive;
use crate::orbit::manifest::{ZiManifest, ZiPluginId};
use crate::orbit::protocol::MAX_FRAME_BYTES;
use crate::orbit::runner::{ZiHostedSession, ZiRunner, ZiSessionRegistry};
use crate::orbit::session::{ZiRunSignal, ZiSession};

/// Upper bound on reaping a killed child before cleanup carries on.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);
const SPAWN_ATTEMPTS: u32 = 5;

/// Handles of one running child, guarded by the session's handle lock.
struct ZiProcessRun {
    stopping: Arc<AtomicBool>,
    cancel: CancellationToken,
    kill: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ZiProcessHandle {
    workdir: Option<PathBuf>,
    pid: Option<u32>,
    run: Option<ZiProcessRun>,
}

/// Subprocess-backed session: the shared session plus its process handle.
pub(crate) struct ZiProcessSession {
    session: Arc<ZiSession>,
    handle: Mutex<ZiProcessHandle>,
}

impl ZiHostedSession for ZiProcessSession {
    fn session(&self) -> &Arc<ZiSession> {
        &self.session
    }
}

impl ZiProcessSession {
    fn new(session: Arc<ZiSession>) -> Self {
        ZiProcessSession {
            session,
            handle: Mutex::new(ZiProcessHandle::default()),
        }
    }

    async fn start(self: &Arc<Self>, config: &ZiRuntimeConfig) -> Result<()> {
        let mut handle = self.handle.lock().await;
        self.session.ensure_startable()?;
        let id = self.session.id().clone();
        if handle.run.is_some() {
            // The previous run has not finished cleaning up yet.
            return Err(ZiError::already_running(id.as_str()));
        }

        let binary = self.session.binary();
        let root = config.work_root.clone();
        let prefix = config.workdir_prefix.clone();
        let (workdir, executable) =
            tokio::task::spawn_blocking(move || archive::extract(&binary, &root, &prefix))
                .await??;

        let mut child = match spawn_child(&id, &executable, &workdir, config).await {
            Ok(child) => child,
            Err(err) => {
                remove_workdir(&id, &workdir).await;
                return Err(err);
            }
        };

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.start_kill();
                remove_workdir(&id, &workdir).await;
                return Err(ZiError::internal("child process pipes unavailable"));
            }
        };
        let pid = child.id();

        let cancel = CancellationToken::new();
        let kill = CancellationToken::new();
        let stopping = Arc::new(AtomicBool::new(false));
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(1);
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(1);
        let (signal, signals) = ZiRunSignal::channel();

        tokio::spawn(write_pump(
            id.clone(),
            stdin,
            in_rx,
            cancel.clone(),
            Arc::clone(&stopping),
            signal.clone(),
        ));
        tokio::spawn(output_pump(
            id.clone(),
            stdout,
            out_tx,
            cancel.clone(),
            Arc::clone(&stopping),
            signal.clone(),
        ));
        tokio::spawn(diagnostic_pump(id.clone(), stderr, cancel.clone()));
        let watcher = tokio::spawn(exit_watcher(
            id.clone(),
            child,
            kill.clone(),
            Arc::clone(&stopping),
            signal,
        ));

        if let Err(err) = self.session.begin_run(in_tx) {
            kill.cancel();
            cancel.cancel();
            let _ = tokio::time::timeout(REAP_TIMEOUT, watcher).await;
            remove_workdir(&id, &workdir).await;
            return Err(err);
        }

        let supervisor = tokio::spawn(Arc::clone(self).supervise(
            cancel.clone(),
            kill.clone(),
            out_rx,
            signals,
            watcher,
        ));

        log::info!(
            "orbit.process.start: plugin process spawned - plugin={}, pid={:?}, workdir={}",
            id,
            pid,
            workdir.to_string_lossy()
        );

        handle.workdir = Some(workdir);
        handle.pid = pid;
        handle.run = Some(ZiProcessRun {
            stopping,
            cancel,
            kill,
            supervisor: Some(supervisor),
        });
        Ok(())
    }

    async fn supervise(
        self: Arc<Self>,
        cancel: CancellationToken,
        kill: CancellationToken,
        outbound: mpsc::Receiver<Vec<u8>>,
        signals: mpsc::Receiver<Option<ZiError>>,
        watcher: JoinHandle<()>,
    ) {
        let outcome = self.session.dispatch(&cancel, outbound, signals, false).await;

        // The child must be gone before its working directory is removed.
        kill.cancel();
        cancel.cancel();
        if tokio::time::timeout(REAP_TIMEOUT, watcher).await.is_err() {
            log::warn!(
                "orbit.process.reap_timeout: child did not exit after kill - plugin={}",
                self.session.id()
            );
        }

        let workdir = {
            let mut handle = self.handle.lock().await;
            handle.run = None;
            handle.pid = None;
            handle.workdir.take()
        };
        if let Some(dir) = workdir {
            remove_workdir(self.session.id(), &dir).await;
        }

        self.session.finish_run(outcome);
    }

    async fn stop(&self, grace: Duration) -> Result<()> {
        let (cancel, kill, supervisor) = {
            let mut handle = self.handle.lock().await;
            let Some(run) = handle.run.as_mut() else {
                return Ok(());
            };
            run.stopping.store(true, Ordering::SeqCst);
            self.session.close_inbound();
            (run.cancel.clone(), run.kill.clone(), run.supervisor.take())
        };

        // Another stop is already waiting on this run.
        let Some(mut supervisor) = supervisor else {
            return Ok(());
        };

        log::info!(
            "orbit.process.stop: closing plugin input - plugin={}, grace_ms={}",
            self.session.id(),
            grace.as_millis()
        );
        if tokio::time::timeout(grace, &mut supervisor).await.is_ok() {
            return Ok(());
        }

        log::warn!(
            "orbit.process.kill: plugin ignored graceful stop, killing - plugin={}",
            self.session.id()
        );
        kill.cancel();
        if tokio::time::timeout(grace, &mut supervisor).await.is_ok() {
            return Ok(());
        }

        cancel.cancel();
        supervisor.await?;
        Ok(())
    }

    async fn dispose(&self) {
        let workdir = self.handle.lock().await.workdir.take();
        if let Some(dir) = workdir {
            remove_workdir(self.session.id(), &dir).await;
        }
    }

    async fn pid(&self) -> Option<u32> {
        self.handle.lock().await.pid
    }
}

async fn remove_workdir(id: &ZiPluginId, dir: &Path) {
    if let Err(err) = tokio::fs::remove_dir_all(dir).await {
        if err.kind() != io::ErrorKind::NotFound {
            log::warn!(
                "orbit.process.cleanup_failed: failed to remove working directory - plugin={}, path={}, error={}",
                id,
                dir.to_string_lossy(),
                err
            );
        }
    }
}

#[cfg(unix)]
fn is_text_busy(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ETXTBSY)
}

#[cfg(not(unix))]
fn is_text_busy(_err: &io::Error) -> bool {
    false
}

async fn spawn_child(
    id: &ZiPluginId,
    executable: &Path,
    workdir: &Path,
    config: &ZiRuntimeConfig,
) -> Result<Child> {
    let mut command = Command::new(executable);
    command
        .current_dir(executable.parent().unwrap_or(workdir))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !config.inherit_env {
        command.env_clear();
    }
    command.envs(&config.env);

    let mut attempt = 1;
    loop {
        match command.spawn() {
            Ok(child) => return Ok(child),
            // A concurrent fork elsewhere in the host may still hold the
            // freshly written executable open for writing.
            Err(err) if is_text_busy(&err) && attempt < SPAWN_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
            }
            Err(err) => {
                return Err(ZiError::runtime(
                    id.as_str(),
                    format!("failed to start process: {}", err),
                ))
            }
        }
    }
}

/// Read one line, stripping `\n` / `\r\n`. Returns `Ok(false)` at EOF.
async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<bool> {
    buf.clear();
    let limit = MAX_FRAME_BYTES as u64 + 1;
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(false);
    }
    let terminated = buf.last() == Some(&b'\n');
    if terminated {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if read as u64 >= limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {} bytes", MAX_FRAME_BYTES),
        ));
    }
    Ok(true)
}

async fn write_pump(
    id: ZiPluginId,
    mut stdin: ChildStdin,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    stopping: Arc<AtomicBool>,
    signal: ZiRunSignal,
) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            payload = inbound.recv() => payload,
        };
        let Some(mut payload) = payload else {
            break;
        };
        if payload.is_empty() {
            continue;
        }
        payload.push(b'\n');

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = async {
                stdin.write_all(&payload).await?;
                stdin.flush().await
            } => written,
        };
        if let Err(err) = written {
            if !cancel.is_cancelled() && !stopping.load(Ordering::SeqCst) {
                signal.fail(ZiError::runtime(
                    id.as_str(),
                    format!("failed to write command: {}", err),
                ));
            }
            break;
        }
        log::debug!("orbit.process.send: frame written - plugin={}, bytes={}", id, payload.len());
    }
    // Dropping stdin here is what a well-behaved plugin sees as EOF.
    drop(stdin);
}

async fn output_pump(
    id: ZiPluginId,
    stdout: ChildStdout,
    outbound: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    stopping: Arc<AtomicBool>,
    signal: ZiRunSignal,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = read_frame(&mut reader, &mut buf) => read,
        };
        match read {
            Ok(true) => {
                log::debug!("orbit.process.recv: line read - plugin={}, bytes={}", id, buf.len());
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = outbound.send(buf.clone()) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Ok(false) => return,
            Err(err) => {
                if !cancel.is_cancelled() && !stopping.load(Ordering::SeqCst) {
                    signal.fail(ZiError::runtime(
                        id.as_str(),
                        format!("failed to read stdout: {}", err),
                    ));
                }
                return;
            }
        }
    }
}

async fn diagnostic_pump(id: ZiPluginId, stderr: ChildStderr, cancel: CancellationToken) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = read_frame(&mut reader, &mut buf) => read,
        };
        match read {
            Ok(true) => log::warn!(
                "orbit.plugin.stderr: {} - plugin={}",
                String::from_utf8_lossy(&buf),
                id
            ),
            Ok(false) => return,
            Err(err) => {
                log::error!("orbit.plugin.stderr_failed: stderr read error - plugin={}, error={}", id, err);
                return;
            }
        }
    }
}

async fn exit_watcher(
    id: ZiPluginId,
    mut child: Child,
    kill: CancellationToken,
    stopping: Arc<AtomicBool>,
    signal: ZiRunSignal,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            if let Err(err) = child.start_kill() {
                log::debug!("orbit.process.kill_failed: {} - plugin={}", err, id);
            }
            child.wait().await
        }
    };

    if stopping.load(Ordering::SeqCst) {
        log::debug!("orbit.process.exited: requested stop completed - plugin={}, status={:?}", id, status);
        signal.stopped();
        return;
    }

    let err = match status {
        Ok(status) if status.success() => ZiError::runtime(id.as_str(), "plugin exited unexpectedly"),
        Ok(status) => ZiError::runtime(id.as_str(), format!("process exited: {}", status)),
        Err(err) => ZiError::runtime(id.as_str(), format!("failed to wait for process: {}", err)),
    };
    signal.fail(err);
}

/// Runner that executes plugins as child processes.
pub struct ZiProcessRunner {
    config: ZiRuntimeConfig,
    sessions: ZiSessionRegistry<ZiProcessSession>,
}

impl ZiProcessRunner {
    pub fn new(config: ZiRuntimeConfig) -> Self {
        ZiProcessRunner {
            config,
            sessions: ZiSessionRegistry::new(),
        }
    }

    pub fn config(&self) -> &ZiRuntimeConfig {
        &self.config
    }

    /// OS process id of a running plugin.
    pub async fn process_id(&self, id: &ZiPluginId) -> Result<Option<u32>> {
        Ok(self.sessions.lookup(id)?.pid().await)
    }
}

#[async_trait]
impl ZiRunner for ZiProcessRunner {
    fn backend(&self) -> ZiBackendKind {
        ZiBackendKind::Process
    }

    async fn load(&self, bin: &[u8]) -> Result<Arc<ZiSession>> {
        let manifest = self.validate(bin).await?;
        let id = manifest.id.clone();
        let session = Arc::new(ZiSession::new(manifest, bin.to_vec(), self.config.command_timeout()));
        self.sessions
            .insert(id.clone(), Arc::new(ZiProcessSession::new(Arc::clone(&session))))?;

        log::info!(
            "orbit.plugin.load: plugin loaded - plugin={}, name={}, digest={}",
            id,
            session.manifest().display_name(),
            session.digest()
        );
        Ok(session)
    }

    async fn unload(&self, id: &ZiPluginId) -> Result<()> {
        let entry = self.sessions.lookup(id)?;
        entry.session().retire();
        if let Err(err) = entry.stop(self.config.stop_grace()).await {
            log::warn!(
                "orbit.plugin.unload_stop_failed: failed to stop plugin during unload - plugin={}, error={}",
                id,
                err
            );
        }
        self.sessions.remove(id);
        entry.dispose().await;
        log::info!("orbit.plugin.unload: plugin unloaded - plugin={}", id);
        Ok(())
    }

    async fn validate(&self, bin: &[u8]) -> Result<ZiManifest> {
        archive::validate_package(bin).map_err(|err| {
            log::error!("orbit.plugin.validate_failed: {} - bytes={}", err, bin.len());
            err
        })
    }

    async fn get_session(&self, id: &ZiPluginId) -> Result<Arc<ZiSession>> {
        Ok(Arc::clone(self.sessions.lookup(id)?.session()))
    }

    async fn get_sessions(&self) -> Vec<Arc<ZiSession>> {
        self.sessions.sessions()
    }

    async fn start_plugin(&self, id: &ZiPluginId) -> Result<()> {
        self.sessions.lookup(id)?.start(&self.config).await
    }

    async fn stop_plugin(&self, id: &ZiPluginId) -> Result<()> {
        self.sessions.lookup(id)?.stop(self.config.stop_grace()).await
    }
}
