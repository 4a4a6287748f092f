//! mpv-backed media engine.
//!
//! One mpv process per load.  Direct streams are fed through mpv's stdin
//! (`-`) so the bytes mpv sees are exactly the demultiplexed audio; HLS URLs
//! are handed to mpv as-is.
//!
//! ```text
//!   MpvEngine::load()
//!         │
//!         ├── feeder_task   ← audio pipe → mpv stdin
//!         └── follow_volume ← waits for the IPC socket, then applies volume changes
//!               └── ipc_loop ← calls in, JSON lines out, replies matched by request_id
//! ```
//!
//! IPC is unix only; elsewhere volume is applied at spawn time and live
//! adjustments are skipped.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dial_proto::platform;

use crate::engine::{EngineStatus, MediaEngine, MediaSource};

#[cfg(unix)]
use tokio::net::UnixStream;

const IPC_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// mpv creates its socket shortly after start; give it about five seconds.
const IPC_CONNECT_ATTEMPTS: usize = 50;
const IPC_CONNECT_RETRY: Duration = Duration::from_millis(100);

type Reply = oneshot::Sender<anyhow::Result<Value>>;

struct IpcCall {
    command: Value,
    reply: Reply,
}

/// Cloneable handle to one mpv IPC connection.
#[derive(Clone)]
pub struct MpvHandle {
    calls: mpsc::Sender<IpcCall>,
}

impl MpvHandle {
    fn spawn<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (calls, rx) = mpsc::channel(32);
        tokio::spawn(ipc_loop(reader, writer, rx));
        Self { calls }
    }

    /// Run one IPC command and return mpv's full reply object.
    pub async fn call(&self, command: Value) -> anyhow::Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.calls
            .send(IpcCall { command, reply })
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC connection is gone"))?;
        match tokio::time::timeout(IPC_REPLY_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => anyhow::bail!("mpv IPC dropped the call"),
            Err(_) => anyhow::bail!("mpv IPC did not answer within {:?}", IPC_REPLY_TIMEOUT),
        }
    }

    pub async fn set_property(&self, name: &str, value: Value) -> anyhow::Result<()> {
        self.call(json!(["set_property", name, value])).await?;
        Ok(())
    }

    pub async fn get_property(&self, name: &str) -> anyhow::Result<Value> {
        let reply = self.call(json!(["get_property", name])).await?;
        Ok(reply.get("data").cloned().unwrap_or(Value::Null))
    }

    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        self.set_property("volume", json!(volume_percent(volume))).await
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.set_property("pause", json!(paused)).await
    }

    pub async fn is_paused(&self) -> anyhow::Result<bool> {
        Ok(self.get_property("pause").await?.as_bool().unwrap_or(false))
    }

    pub async fn speed(&self) -> anyhow::Result<f64> {
        Ok(self.get_property("speed").await?.as_f64().unwrap_or(1.0))
    }
}

fn volume_percent(volume: f32) -> f64 {
    f64::from((volume * 100.0).clamp(0.0, 100.0)).round()
}

/// IPC connection state of one instance.
enum IpcSlot {
    /// The follower task is still waiting for mpv's socket.
    Pending(oneshot::Receiver<MpvHandle>),
    Ready(MpvHandle),
    /// mpv never opened its socket.
    Unavailable,
}

/// One running mpv process.
struct MpvInstance {
    process: Child,
    socket_name: String,
    ipc: IpcSlot,
    /// Latest requested volume; the follower applies it once IPC is up.
    volume: watch::Sender<f32>,
    follower: JoinHandle<()>,
    feeder: Option<JoinHandle<()>>,
}

impl MpvInstance {
    fn ipc(&mut self) -> Option<MpvHandle> {
        if let IpcSlot::Pending(rx) = &mut self.ipc {
            match rx.try_recv() {
                Ok(handle) => self.ipc = IpcSlot::Ready(handle),
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => self.ipc = IpcSlot::Unavailable,
            }
        }
        match &self.ipc {
            IpcSlot::Ready(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    fn exit_reason(&mut self) -> Option<String> {
        match self.process.try_wait() {
            Ok(Some(status)) => Some(format!("mpv exited ({})", status)),
            Ok(None) => None,
            Err(e) => Some(format!("mpv process lost: {}", e)),
        }
    }

    fn shutdown(mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        self.follower.abort();
        if let Err(e) = self.process.start_kill() {
            debug!("mpv: kill failed (already exited?): {}", e);
        }
        let socket_name = self.socket_name;
        let mut process = self.process;
        // Reap in the background; close() must not wait on teardown.
        tokio::spawn(async move {
            let _ = process.wait().await;
            let _ = tokio::fs::remove_file(&socket_name).await;
        });
    }
}

pub struct MpvEngine {
    current: Mutex<Option<MpvInstance>>,
}

impl MpvEngine {
    /// Fails when no mpv binary can be found.
    pub fn new() -> anyhow::Result<Self> {
        platform::find_mpv_binary().ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        Ok(Self {
            current: Mutex::new(None),
        })
    }

    async fn handle(&self) -> Option<MpvHandle> {
        self.current.lock().await.as_mut()?.ipc()
    }
}

#[async_trait]
impl MediaEngine for MpvEngine {
    async fn load(&self, source: MediaSource, volume: f32) -> anyhow::Result<()> {
        let mut current = self.current.lock().await;
        if let Some(prev) = current.take() {
            prev.shutdown();
        }

        let mpv_binary = platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        let socket_name = platform::mpv_socket_name();

        let mut command = tokio::process::Command::new(mpv_binary);
        command
            .arg("--no-video")
            .arg("--really-quiet")
            .arg("--idle=no")
            .arg(platform::mpv_socket_arg(&socket_name))
            .arg(format!("--volume={}", volume_percent(volume)))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        info!("mpv: spawning for {}", source.describe());
        let (process, feeder) = match source {
            MediaSource::Url(url) => {
                let process = command.arg(url).stdin(Stdio::null()).spawn()?;
                (process, None)
            }
            MediaSource::Pipe(rx) => {
                let mut process = command.arg("-").stdin(Stdio::piped()).spawn()?;
                let stdin = process
                    .stdin
                    .take()
                    .ok_or_else(|| anyhow::anyhow!("mpv stdin not captured"))?;
                (process, Some(tokio::spawn(feeder_task(stdin, rx))))
            }
        };

        let (volume_tx, volume_rx) = watch::channel(volume);
        let (ready_tx, ready_rx) = oneshot::channel();
        let follower = tokio::spawn(follow_volume(
            socket_name.clone(),
            volume,
            volume_rx,
            ready_tx,
        ));

        *current = Some(MpvInstance {
            process,
            socket_name,
            ipc: IpcSlot::Pending(ready_rx),
            volume: volume_tx,
            follower,
            feeder,
        });
        Ok(())
    }

    async fn stop(&self) {
        if let Some(instance) = self.current.lock().await.take() {
            info!("mpv: stopping");
            instance.shutdown();
        }
    }

    async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        if let Some(instance) = self.current.lock().await.as_ref() {
            instance.volume.send_replace(volume);
        }
        Ok(())
    }

    async fn playback_rate(&self) -> Option<f64> {
        let handle = self.handle().await?;
        if handle.is_paused().await.ok()? {
            return Some(0.0);
        }
        handle.speed().await.ok()
    }

    async fn resume(&self) -> anyhow::Result<()> {
        let handle = self
            .handle()
            .await
            .ok_or_else(|| anyhow::anyhow!("mpv IPC not connected"))?;
        handle.set_pause(false).await
    }

    /// `playback-time` only exists once mpv has started decoding.
    async fn status(&self) -> EngineStatus {
        let handle = {
            let mut current = self.current.lock().await;
            let Some(instance) = current.as_mut() else {
                return EngineStatus::Idle;
            };
            if let Some(reason) = instance.exit_reason() {
                return EngineStatus::Exited(reason);
            }
            match instance.ipc() {
                Some(handle) => handle,
                None => return EngineStatus::Starting,
            }
        };
        match handle.get_property("playback-time").await {
            Ok(Value::Number(_)) => EngineStatus::Playing,
            _ => EngineStatus::Starting,
        }
    }
}

/// Connect to the instance's IPC socket once mpv has created it, hand the
/// handle over, then keep mpv's volume in line with the requested one.
async fn follow_volume(
    socket_name: String,
    spawned_with: f32,
    mut volume: watch::Receiver<f32>,
    ready: oneshot::Sender<MpvHandle>,
) {
    let mut connected = None;
    for _ in 0..IPC_CONNECT_ATTEMPTS {
        match connect_ipc(&socket_name).await {
            Ok(handle) => {
                connected = Some(handle);
                break;
            }
            Err(_) => tokio::time::sleep(IPC_CONNECT_RETRY).await,
        }
    }
    let Some(handle) = connected else {
        warn!("mpv: IPC socket {} never appeared", socket_name);
        return;
    };
    debug!("mpv: IPC connected on {}", socket_name);
    let _ = ready.send(handle.clone());

    let mut applied = spawned_with;
    loop {
        let wanted = *volume.borrow_and_update();
        if wanted != applied {
            match handle.set_volume(wanted).await {
                Ok(()) => applied = wanted,
                Err(e) => warn!("mpv: volume {:.2} not applied: {:#}", wanted, e),
            }
        }
        if volume.changed().await.is_err() {
            return;
        }
    }
}

async fn feeder_task(mut stdin: ChildStdin, mut rx: mpsc::Receiver<Vec<u8>>) {
    let mut total = 0usize;
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = stdin.write_all(&chunk).await {
            warn!("mpv feeder: write error after {} bytes: {}", total, e);
            return;
        }
        total += chunk.len();
    }
    debug!("mpv feeder: pipe closed after {} bytes", total);
}

#[cfg(unix)]
async fn connect_ipc(socket_name: &str) -> anyhow::Result<MpvHandle> {
    let (reader, writer) = UnixStream::connect(socket_name).await?.into_split();
    Ok(MpvHandle::spawn(reader, writer))
}

#[cfg(not(unix))]
async fn connect_ipc(_socket_name: &str) -> anyhow::Result<MpvHandle> {
    anyhow::bail!("mpv IPC is only supported on unix")
}

/// Owns both halves of the connection.  Calls are written as JSON lines
/// tagged with a request id; replies are routed back by that id and
/// unsolicited event lines are ignored.
async fn ipc_loop<R, W>(reader: R, mut writer: W, mut calls: mpsc::Receiver<IpcCall>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut waiting: HashMap<u64, Reply> = HashMap::new();
    let mut next_id = 1u64;

    loop {
        tokio::select! {
            call = calls.recv() => {
                let Some(IpcCall { command, reply }) = call else { break };
                let request_id = next_id;
                next_id += 1;
                let mut line = json!({ "command": command, "request_id": request_id }).to_string();
                line.push('\n');
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    warn!("mpv IPC: write failed: {}", e);
                    let _ = reply.send(Err(e.into()));
                    break;
                }
                waiting.insert(request_id, reply);
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => route_reply(&line, &mut waiting),
                Ok(None) => {
                    debug!("mpv IPC: socket closed");
                    break;
                }
                Err(e) => {
                    warn!("mpv IPC: read failed: {}", e);
                    break;
                }
            },
        }
    }

    for (_, reply) in waiting.drain() {
        let _ = reply.send(Err(anyhow::anyhow!("mpv IPC connection closed")));
    }
}

fn route_reply(line: &str, waiting: &mut HashMap<u64, Reply>) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!("mpv IPC: unparseable line {:?}: {}", line, e);
            return;
        }
    };
    let Some(request_id) = value.get("request_id").and_then(Value::as_u64) else {
        return;
    };
    let Some(reply) = waiting.remove(&request_id) else {
        debug!("mpv IPC: reply for unknown request {}", request_id);
        return;
    };
    let result = match value.get("error").and_then(Value::as_str) {
        Some("success") => Ok(value),
        Some(other) => Err(anyhow::anyhow!("mpv rejected the command: {}", other)),
        None => Err(anyhow::anyhow!("mpv reply without status")),
    };
    let _ = reply.send(result);
}
