/// mpv audio output: one mpv process per station, controlled over JSON IPC.
///
/// Architecture:
///
/// ```text
///   MpvOutput::launch(url)
///         │
///         ├── spawn `mpv --idle=no ... <url>`, wait for the IPC socket
///         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── property-change / end-file → PlayerSignal channel
/// ```
///
/// `core-idle=false` means audio is flowing; `core-idle=true` or
/// `paused-for-cache=true` means mpv is waiting on the network.  When the
/// socket closes the process is gone and the reader reports `Exited` with the
/// last `end-file` reason it saw.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::supervisor::{AudioOutput, PlayerProcess, PlayerSignal};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

const OBS_CORE_IDLE: u64 = 1;
const OBS_PAUSED_FOR_CACHE: u64 = 2;

const IPC_TIMEOUT: Duration = Duration::from_secs(2);
const QUIT_GRACE: Duration = Duration::from_millis(500);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// Cloneable handle to the writer task of one mpv connection.
#[derive(Clone)]
struct MpvIpc {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvIpc {
    async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(IPC_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    async fn observe(&self, id: u64, property: &str) {
        match self.send(json!(["observe_property", id, property])).await {
            Ok(_) => debug!("mpv: observe_property id={} name={}", id, property),
            Err(e) => warn!("mpv: observe_property {} failed: {}", property, e),
        }
    }
}

/// Launches mpv processes.
pub struct MpvOutput {
    binary: PathBuf,
    socket_path: PathBuf,
}

impl MpvOutput {
    pub fn new() -> anyhow::Result<Self> {
        let binary = radioclick_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        info!("mpv: using {}", binary.display());
        Ok(Self {
            binary,
            socket_path: radioclick_proto::platform::mpv_socket_path(),
        })
    }
}

#[async_trait]
impl AudioOutput for MpvOutput {
    async fn launch(
        &mut self,
        url: &str,
        volume: u8,
    ) -> anyhow::Result<(Box<dyn PlayerProcess>, mpsc::Receiver<PlayerSignal>)> {
        let _ = tokio::fs::remove_file(&self.socket_path).await;

        let mut child = tokio::process::Command::new(&self.binary)
            .arg("--no-video")
            .arg("--idle=no")
            .arg("--quiet")
            .arg("--no-terminal")
            .arg(format!("--volume={}", volume))
            .arg(radioclick_proto::platform::mpv_socket_arg())
            .arg(url)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        // Wait for the socket, bailing out early if mpv already gave up.
        let mut appeared = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Some(status) = child.try_wait()? {
                anyhow::bail!("mpv exited during startup: {}", status);
            }
            if self.socket_path.exists() {
                appeared = true;
                break;
            }
        }
        if !appeared {
            let _ = child.kill().await;
            anyhow::bail!("mpv IPC socket did not appear");
        }

        let stream = UnixStream::connect(&self.socket_path).await?;
        debug!("mpv: connected to {}", self.socket_path.display());

        let (signal_tx, signal_rx) = mpsc::channel::<PlayerSignal>(32);
        let ipc = start_io_tasks(stream, signal_tx);
        ipc.observe(OBS_CORE_IDLE, "core-idle").await;
        ipc.observe(OBS_PAUSED_FOR_CACHE, "paused-for-cache").await;

        let process = MpvProcess {
            child,
            ipc,
            socket_path: self.socket_path.clone(),
        };
        Ok((Box::new(process), signal_rx))
    }
}

struct MpvProcess {
    child: tokio::process::Child,
    ipc: MpvIpc,
    socket_path: PathBuf,
}

#[async_trait]
impl PlayerProcess for MpvProcess {
    async fn set_volume(&mut self, volume: u8) -> anyhow::Result<()> {
        self.ipc
            .send(json!(["set_property", "volume", volume]))
            .await?;
        Ok(())
    }

    async fn terminate(&mut self) -> anyhow::Result<()> {
        if self.is_running() {
            let _ = self.ipc.send(json!(["quit"])).await;
            if tokio::time::timeout(QUIT_GRACE, self.child.wait())
                .await
                .is_err()
            {
                debug!("mpv: quit ignored, killing");
                self.child.kill().await?;
            }
        }
        self.child.wait().await?;
        let _ = tokio::fs::remove_file(&self.socket_path).await;
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        self.child.try_wait().ok().flatten().is_none()
    }
}

fn start_io_tasks(stream: UnixStream, signal_tx: mpsc::Sender<PlayerSignal>) -> MpvIpc {
    let (read_half, write_half) = stream.into_split();
    let reader = BufReader::new(read_half);

    // req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(16);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, signal_tx));

    MpvIpc { tx: cmd_tx }
}

/// Map an unsolicited mpv message onto a player signal.
fn signal_for(val: &Value, paused_for_cache: &mut bool) -> Option<PlayerSignal> {
    match val.get("event")?.as_str()? {
        "property-change" => {
            let id = val.get("id")?.as_u64()?;
            let data = val.get("data").unwrap_or(&Value::Null);
            match id {
                OBS_CORE_IDLE => match data.as_bool()? {
                    false if !*paused_for_cache => Some(PlayerSignal::Streaming),
                    false => None,
                    true => Some(PlayerSignal::Buffering),
                },
                OBS_PAUSED_FOR_CACHE => {
                    *paused_for_cache = data.as_bool().unwrap_or(false);
                    if *paused_for_cache {
                        Some(PlayerSignal::Buffering)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        }
        _ => None,
    }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("mpv IPC {}", reason)));
    }
}

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    signal_tx: mpsc::Sender<PlayerSignal>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    let mut paused_for_cache = false;
    let mut end_reason: Option<String> = None;

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error");
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    }
                    continue;
                }

                if val.get("event").and_then(|e| e.as_str()) == Some("end-file") {
                    let reason = val
                        .get("reason")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown");
                    let detail = val.get("file_error").and_then(|v| v.as_str());
                    info!("mpv: end-file reason={} error={:?}", reason, detail);
                    end_reason = Some(match detail {
                        Some(d) => format!("{}: {}", reason, d),
                        None => reason.to_string(),
                    });
                    continue;
                }

                if let Some(signal) = signal_for(&val, &mut paused_for_cache) {
                    debug!("mpv reader: {:?}", signal);
                    if signal_tx.send(signal).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, "read error").await;
                break;
            }
        }
    }

    let reason = end_reason.unwrap_or_else(|| "mpv exited".to_string());
    let _ = signal_tx.send(PlayerSignal::Exited(reason)).await;
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can always match the reply.
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(id: u64, data: Value) -> Value {
        json!({ "event": "property-change", "id": id, "data": data })
    }

    #[test]
    fn test_core_idle_maps_to_signals() {
        let mut pfc = false;
        assert_eq!(
            signal_for(&change(OBS_CORE_IDLE, json!(false)), &mut pfc),
            Some(PlayerSignal::Streaming)
        );
        assert_eq!(
            signal_for(&change(OBS_CORE_IDLE, json!(true)), &mut pfc),
            Some(PlayerSignal::Buffering)
        );
        assert_eq!(signal_for(&change(OBS_CORE_IDLE, Value::Null), &mut pfc), None);
    }

    #[test]
    fn test_paused_for_cache_suppresses_streaming() {
        let mut pfc = false;
        assert_eq!(
            signal_for(&change(OBS_PAUSED_FOR_CACHE, json!(true)), &mut pfc),
            Some(PlayerSignal::Buffering)
        );
        assert!(pfc);
        assert_eq!(signal_for(&change(OBS_CORE_IDLE, json!(false)), &mut pfc), None);
        assert_eq!(signal_for(&change(OBS_PAUSED_FOR_CACHE, json!(false)), &mut pfc), None);
        assert_eq!(
            signal_for(&change(OBS_CORE_IDLE, json!(false)), &mut pfc),
            Some(PlayerSignal::Streaming)
        );
    }

    #[tokio::test]
    async fn test_reader_routes_replies_and_reports_exit() {
        let (client, mut server) = tokio::io::duplex(4096);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (reply_tx, reply_rx) = oneshot::channel();
        pending.lock().await.insert(7, reply_tx);

        let (signal_tx, mut signal_rx) = mpsc::channel(8);
        let task = tokio::spawn(reader_task(BufReader::new(client), pending, signal_tx));

        server
            .write_all(
                concat!(
                    "{\"request_id\":7,\"error\":\"success\",\"data\":null}\n",
                    "{\"event\":\"property-change\",\"id\":1,\"data\":false}\n",
                    "{\"event\":\"end-file\",\"reason\":\"error\",\"file_error\":\"loading failed\"}\n",
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        drop(server);

        assert!(reply_rx.await.unwrap().is_ok());
        assert_eq!(signal_rx.recv().await, Some(PlayerSignal::Streaming));
        assert_eq!(
            signal_rx.recv().await,
            Some(PlayerSignal::Exited("error: loading failed".into()))
        );
        task.await.unwrap();
    }
}
