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

//! # WebAssembly Backend
//!
//! Runs plugin modules inside wasmtime with a WASI preview1 shim that only
//! exposes the three standard streams. There is no filesystem, no network and
//! no environment.
//!
//! A module describes itself by printing its manifest as the first line on
//! stdout. [`ZiWasmRunner::validate`] runs the module once to capture that
//! line; a real run announces it again and the dispatcher checks that the id
//! still matches.
//!
//! All stores share one engine with epoch interruption enabled. A background
//! thread bumps the epoch, and every store checks its interrupt flag at each
//! deadline so a stuck module can be stopped.

use std::any::Any;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex as StdMutex, Once, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wasi_common::pipe::{ReadPipe, WritePipe};
use wasi_common::{I32Exit, WasiCtx};
use wasmtime::{Config, Engine, Linker, Module, Store, UpdateDeadline};

use crate::config::{ZiBackendKind, ZiRuntimeConfig};
use crate::errors::{Result, ZiError};
use crate::orbit::manifest::{ZiManifest, ZiPluginId};
use crate::orbit::protocol::MAX_FRAME_BYTES;
use crate::orbit::runner::{ZiHostedSession, ZiRunner, ZiSessionRegistry};
use crate::orbit::session::{ZiRunSignal, ZiSession};

const EPOCH_TICK: Duration = Duration::from_millis(10);
const STDIN_POLL: Duration = Duration::from_millis(50);
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-wide engine, created on first use together with its epoch ticker.
fn shared_engine() -> Result<Engine> {
    static ENGINE: OnceLock<Engine> = OnceLock::new();
    static TICKER: Once = Once::new();

    let engine = match ENGINE.get() {
        Some(engine) => engine,
        None => {
            let mut config = Config::new();
            config.epoch_interruption(true);
            let engine = Engine::new(&config)?;
            ENGINE.get_or_init(|| engine)
        }
    };

    TICKER.call_once(|| {
        let ticking = engine.clone();
        let spawned = std::thread::Builder::new()
            .name("zi-orbit-epoch".to_string())
            .spawn(move || loop {
                std::thread::sleep(EPOCH_TICK);
                ticking.increment_epoch();
            });
        if let Err(err) = spawned {
            log::error!("orbit.wasm.ticker_failed: failed to start epoch ticker - error={}", err);
        }
    });

    Ok(engine.clone())
}

/// Per-store host state.
pub(crate) struct ZiWasmState {
    wasi: WasiCtx,
}

/// Guest stdin fed from a channel. Returns EOF once the sender is gone.
struct ZiChannelReader {
    rx: StdMutex<std_mpsc::Receiver<Vec<u8>>>,
    chunk: Vec<u8>,
    offset: usize,
    interrupt: Arc<AtomicBool>,
}

impl ZiChannelReader {
    fn new(rx: std_mpsc::Receiver<Vec<u8>>, interrupt: Arc<AtomicBool>) -> Self {
        ZiChannelReader {
            rx: StdMutex::new(rx),
            chunk: Vec::new(),
            offset: 0,
            interrupt,
        }
    }
}

impl Read for ZiChannelReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        while self.offset >= self.chunk.len() {
            let rx = self
                .rx
                .get_mut()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "stdin channel poisoned"))?;
            match rx.recv_timeout(STDIN_POLL) {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.offset = 0;
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => {
                    // Host calls are not epoch-checked, so a blocked read has
                    // to notice the interrupt itself.
                    if self.interrupt.load(Ordering::SeqCst) {
                        return Err(io::Error::new(io::ErrorKind::BrokenPipe, "plugin interrupted"));
                    }
                }
                Err(std_mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = out.len().min(self.chunk.len() - self.offset);
        out[..n].copy_from_slice(&self.chunk[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

enum ZiLineTarget {
    Channel(mpsc::Sender<Vec<u8>>),
    Log(String),
}

/// Guest stdout/stderr split into lines.
struct ZiLineSink {
    target: ZiLineTarget,
    partial: Vec<u8>,
}

impl ZiLineSink {
    fn channel(tx: mpsc::Sender<Vec<u8>>) -> Self {
        ZiLineSink {
            target: ZiLineTarget::Channel(tx),
            partial: Vec::new(),
        }
    }

    fn log(origin: impl Into<String>) -> Self {
        ZiLineSink {
            target: ZiLineTarget::Log(origin.into()),
            partial: Vec::new(),
        }
    }

    fn emit(&self, mut line: Vec<u8>) -> io::Result<()> {
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        match &self.target {
            ZiLineTarget::Channel(tx) => tx
                .blocking_send(line)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "host stopped reading")),
            ZiLineTarget::Log(origin) => {
                log::warn!(
                    "orbit.plugin.stderr: {} - plugin={}",
                    String::from_utf8_lossy(&line),
                    origin
                );
                Ok(())
            }
        }
    }
}

impl Write for ZiLineSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            let line = std::mem::take(&mut self.partial);
            self.emit(line)?;
            rest = &rest[pos + 1..];
        }
        self.partial.extend_from_slice(rest);
        if self.partial.len() > MAX_FRAME_BYTES {
            self.partial.clear();
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line exceeds {} bytes", MAX_FRAME_BYTES),
            ));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ZiLineSink {
    fn drop(&mut self) {
        if self.partial.is_empty() {
            return;
        }
        let line = std::mem::take(&mut self.partial);
        match &self.target {
            // The store is being torn down; never block here.
            ZiLineTarget::Channel(tx) => {
                let _ = tx.try_send(line);
            }
            ZiLineTarget::Log(_) => {
                let _ = self.emit(line);
            }
        }
    }
}

fn new_store(
    engine: &Engine,
    stdin: impl Read + Any + Send + Sync,
    stdout: ZiLineSink,
    stderr: ZiLineSink,
    interrupt: Arc<AtomicBool>,
) -> Store<ZiWasmState> {
    let mut builder = wasmtime_wasi::sync::WasiCtxBuilder::new();
    builder
        .stdin(Box::new(ReadPipe::new(stdin)))
        .stdout(Box::new(WritePipe::new(stdout)))
        .stderr(Box::new(WritePipe::new(stderr)));
    let wasi = builder.build();

    let mut store = Store::new(engine, ZiWasmState { wasi });
    store.set_epoch_deadline(1);
    store.epoch_deadline_callback(move |_| {
        if interrupt.load(Ordering::SeqCst) {
            Err(anyhow::anyhow!("plugin interrupted"))
        } else {
            Ok(UpdateDeadline::Continue(1))
        }
    });
    store
}

/// Instantiate and resolve the WASI entry point.
fn prepare(
    linker: &Linker<ZiWasmState>,
    store: &mut Store<ZiWasmState>,
    module: &Module,
) -> anyhow::Result<wasmtime::TypedFunc<(), ()>> {
    let instance = linker.instantiate(&mut *store, module)?;
    instance.get_typed_func::<(), ()>(&mut *store, "_start")
}

/// How a finished `_start` call ended, from the plugin's point of view.
fn exit_error(id: &ZiPluginId, result: anyhow::Result<()>) -> ZiError {
    match result {
        Ok(()) => ZiError::runtime(id.as_str(), "plugin exited unexpectedly"),
        Err(err) => match err.downcast_ref::<I32Exit>() {
            Some(I32Exit(0)) => ZiError::runtime(id.as_str(), "plugin exited unexpectedly"),
            Some(I32Exit(code)) => ZiError::runtime(id.as_str(), format!("module exited with code {}", code)),
            None => ZiError::runtime(id.as_str(), format!("module trapped: {:#}", err)),
        },
    }
}

struct ZiWasmRun {
    stopping: Arc<AtomicBool>,
    interrupt: Arc<AtomicBool>,
    cancel: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

/// Sandbox-backed session: the shared session plus its compiled module.
pub(crate) struct ZiWasmSession {
    session: Arc<ZiSession>,
    module: Module,
    handle: Mutex<Option<ZiWasmRun>>,
}

impl ZiHostedSession for ZiWasmSession {
    fn session(&self) -> &Arc<ZiSession> {
        &self.session
    }
}

impl ZiWasmSession {
    async fn start(self: &Arc<Self>, engine: &Engine, linker: &Arc<Linker<ZiWasmState>>) -> Result<()> {
        let mut handle = self.handle.lock().await;
        self.session.ensure_startable()?;
        let id = self.session.id().clone();
        if handle.is_some() {
            return Err(ZiError::already_running(id.as_str()));
        }

        let stopping = Arc::new(AtomicBool::new(false));
        let interrupt = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(1);
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(1);
        let (stdin_tx, stdin_rx) = std_mpsc::channel::<Vec<u8>>();
        let (signal, signals) = ZiRunSignal::channel();
        let (ready_tx, ready_rx) = oneshot::channel::<anyhow::Result<()>>();

        let task = {
            let engine = engine.clone();
            let linker = Arc::clone(linker);
            let module = self.module.clone();
            let stdin = ZiChannelReader::new(stdin_rx, Arc::clone(&interrupt));
            let interrupt = Arc::clone(&interrupt);
            let stopping = Arc::clone(&stopping);
            let id = id.clone();
            tokio::task::spawn_blocking(move || {
                let stderr = ZiLineSink::log(id.as_str());
                let mut store = new_store(&engine, stdin, ZiLineSink::channel(out_tx), stderr, interrupt);
                let entry = match prepare(&linker, &mut store, &module) {
                    Ok(entry) => {
                        let _ = ready_tx.send(Ok(()));
                        entry
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                let result = entry.call(&mut store, ());
                // Dropping the store flushes and closes the guest's streams.
                drop(store);

                if stopping.load(Ordering::SeqCst) {
                    signal.stopped();
                } else {
                    signal.fail(exit_error(&id, result));
                }
            })
        };

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                return Err(ZiError::runtime(id.as_str(), format!("failed to instantiate module: {:#}", err)))
            }
            Err(_) => return Err(ZiError::internal("module task ended before instantiation")),
        }

        if let Err(err) = self.session.begin_run(in_tx) {
            interrupt.store(true, Ordering::SeqCst);
            return Err(err);
        }

        tokio::spawn(write_pump(in_rx, stdin_tx, cancel.clone()));
        let supervisor = tokio::spawn(Arc::clone(self).supervise(
            cancel.clone(),
            Arc::clone(&interrupt),
            out_rx,
            signals,
            task,
        ));

        log::info!("orbit.wasm.start: module instantiated - plugin={}", id);
        *handle = Some(ZiWasmRun {
            stopping,
            interrupt,
            cancel,
            supervisor: Some(supervisor),
        });
        Ok(())
    }

    async fn supervise(
        self: Arc<Self>,
        cancel: CancellationToken,
        interrupt: Arc<AtomicBool>,
        outbound: mpsc::Receiver<Vec<u8>>,
        signals: mpsc::Receiver<Option<ZiError>>,
        task: JoinHandle<()>,
    ) {
        let outcome = self.session.dispatch(&cancel, outbound, signals, true).await;

        interrupt.store(true, Ordering::SeqCst);
        cancel.cancel();
        if tokio::time::timeout(REAP_TIMEOUT, task).await.is_err() {
            log::warn!(
                "orbit.wasm.reap_timeout: module did not observe interrupt - plugin={}",
                self.session.id()
            );
        }

        self.handle.lock().await.take();
        self.session.finish_run(outcome);
    }

    async fn stop(&self, grace: Duration) -> Result<()> {
        let (interrupt, cancel, supervisor) = {
            let mut handle = self.handle.lock().await;
            let Some(run) = handle.as_mut() else {
                return Ok(());
            };
            run.stopping.store(true, Ordering::SeqCst);
            self.session.close_inbound();
            (Arc::clone(&run.interrupt), run.cancel.clone(), run.supervisor.take())
        };

        let Some(mut supervisor) = supervisor else {
            return Ok(());
        };

        log::info!(
            "orbit.wasm.stop: closing module stdin - plugin={}, grace_ms={}",
            self.session.id(),
            grace.as_millis()
        );
        if tokio::time::timeout(grace, &mut supervisor).await.is_ok() {
            return Ok(());
        }

        log::warn!(
            "orbit.wasm.interrupt: module ignored graceful stop, interrupting - plugin={}",
            self.session.id()
        );
        interrupt.store(true, Ordering::SeqCst);
        if tokio::time::timeout(grace, &mut supervisor).await.is_ok() {
            return Ok(());
        }

        cancel.cancel();
        supervisor.await?;
        Ok(())
    }
}

/// Bridge the async inbound channel to the guest's blocking stdin.
async fn write_pump(
    mut inbound: mpsc::Receiver<Vec<u8>>,
    stdin: std_mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
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
        if stdin.send(payload).is_err() {
            break;
        }
    }
}

/// Runner that executes plugins as WebAssembly modules.
pub struct ZiWasmRunner {
    config: ZiRuntimeConfig,
    engine: Engine,
    linker: Arc<Linker<ZiWasmState>>,
    sessions: ZiSessionRegistry<ZiWasmSession>,
}

impl ZiWasmRunner {
    pub fn new(config: ZiRuntimeConfig) -> Result<Self> {
        let engine = shared_engine()?;
        let mut linker = Linker::new(&engine);
        wasmtime_wasi::sync::add_to_linker(&mut linker, |state: &mut ZiWasmState| &mut state.wasi)?;
        Ok(ZiWasmRunner {
            config,
            engine,
            linker: Arc::new(linker),
            sessions: ZiSessionRegistry::new(),
        })
    }

    pub fn config(&self) -> &ZiRuntimeConfig {
        &self.config
    }

    /// Compile the module and run it once to capture its manifest line.
    async fn probe(&self, bin: &[u8]) -> Result<(ZiManifest, Module)> {
        let engine = self.engine.clone();
        let bytes = bin.to_vec();
        let module = tokio::task::spawn_blocking(move || Module::new(&engine, &bytes))
            .await?
            .map_err(|e| ZiError::validation(format!("invalid module: {:#}", e)))?;

        let interrupt = Arc::new(AtomicBool::new(false));
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(1);
        let task = {
            let engine = self.engine.clone();
            let linker = Arc::clone(&self.linker);
            let module = module.clone();
            let interrupt = Arc::clone(&interrupt);
            tokio::task::spawn_blocking(move || {
                // Stdin is closed from the start.
                let (_, stdin_rx) = std_mpsc::channel::<Vec<u8>>();
                let stdin = ZiChannelReader::new(stdin_rx, Arc::clone(&interrupt));
                let mut store = new_store(
                    &engine,
                    stdin,
                    ZiLineSink::channel(out_tx),
                    ZiLineSink::log("<probe>"),
                    interrupt,
                );
                prepare(&linker, &mut store, &module)?.call(&mut store, ())
            })
        };

        let first = tokio::time::timeout(self.config.probe_timeout(), out_rx.recv()).await;
        interrupt.store(true, Ordering::SeqCst);
        drop(out_rx);

        let line = match first {
            Ok(Some(line)) => line,
            Ok(None) => {
                let detail = match task.await {
                    Ok(Ok(())) => String::new(),
                    Ok(Err(err)) => match err.downcast_ref::<I32Exit>() {
                        Some(I32Exit(0)) => String::new(),
                        _ => format!(": {:#}", err),
                    },
                    Err(err) => format!(": {}", err),
                };
                return Err(ZiError::validation(format!(
                    "no output received: expected a manifest{}",
                    detail
                )));
            }
            Err(_) => {
                return Err(ZiError::Timeout(format!(
                    "module printed no manifest within {:?}",
                    self.config.probe_timeout()
                )))
            }
        };

        let manifest = ZiManifest::parse(&line)?;
        log::debug!("orbit.wasm.probe: manifest captured - plugin={}", manifest.id);
        Ok((manifest, module))
    }
}

#[async_trait]
impl ZiRunner for ZiWasmRunner {
    fn backend(&self) -> ZiBackendKind {
        ZiBackendKind::Wasm
    }

    async fn load(&self, bin: &[u8]) -> Result<Arc<ZiSession>> {
        let (manifest, module) = self.probe(bin).await?;
        let id = manifest.id.clone();
        let session = Arc::new(ZiSession::new(manifest, bin.to_vec(), self.config.command_timeout()));
        self.sessions.insert(
            id.clone(),
            Arc::new(ZiWasmSession {
                session: Arc::clone(&session),
                module,
                handle: Mutex::new(None),
            }),
        )?;

        log::info!(
            "orbit.plugin.load: module loaded - plugin={}, name={}, digest={}",
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
                "orbit.plugin.unload_stop_failed: failed to stop module during unload - plugin={}, error={}",
                id,
                err
            );
        }
        self.sessions.remove(id);
        log::info!("orbit.plugin.unload: module unloaded - plugin={}", id);
        Ok(())
    }

    async fn validate(&self, bin: &[u8]) -> Result<ZiManifest> {
        self.probe(bin).await.map(|(manifest, _)| manifest).map_err(|err| {
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
        self.sessions.lookup(id)?.start(&self.engine, &self.linker).await
    }

    async fn stop_plugin(&self, id: &ZiPluginId) -> Result<()> {
        self.sessions.lookup(id)?.stop(self.config.stop_grace()).await
    }
}
