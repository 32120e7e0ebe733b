//! Run-control server.
//!
//! One TCP listener, one client at a time, newline-delimited JSON
//! messages `{"name": <cmd>, "args": <payload>}`. Commands are routed to
//! the board driver; every reply is `{"msg":"ok"}` or `{"msg":"<error>"}`.
//! Errors keep the connection open so the orchestrator can retry; only
//! `stop` ends the session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::lock::Mutex;
use futures::{SinkExt, StreamExt};
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};

use crate::acq::{self, ChamberConfig, Device, RunHandle};
use crate::cfg::TriggerType;
use crate::error::{ErrorKind, Result};
use crate::mmio::Mmio;

#[derive(Debug, Deserialize)]
struct Request {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct Reply {
    msg: String,
}

/// One element of the `scan` payload.
#[derive(Debug, Deserialize)]
struct ScanEntry {
    rfm: u32,
    eda: u32,
    slot: usize,
    daq_state: DaqState,
}

#[derive(Debug, Deserialize)]
struct DaqState {
    rshaper: u8,
    trigger_type: TriggerType,
}

/// A run in flight: the handle plus the stop deadline captured at start.
struct ActiveRun {
    handle: RunHandle,
    deadline: Duration,
}

pub struct CtlServer<M: Mmio> {
    listener: TcpListener,
    device: Arc<Mutex<Device<M>>>,
}

impl<M: Mmio + Send + Sync + 'static> CtlServer<M> {
    pub async fn bind(addr: &str, device: Arc<Mutex<Device<M>>>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, device })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve clients forever, one at a time.
    pub async fn run(self) -> Result<()> {
        info!("control server listening on {}", self.local_addr()?);
        loop {
            let (sock, peer) = self.listener.accept().await?;
            info!("control connection from {}", peer);
            if let Err(e) = self.serve_client(sock, peer).await {
                error!("control connection from {}: {}", peer, e);
            }
            info!("control connection from {} done", peer);
        }
    }

    async fn serve_client(&self, sock: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut framed = Framed::new(sock, LinesCodec::new());
        let mut run: Option<ActiveRun> = None;
        while let Some(line) = framed.next().await {
            let line = line.map_err(|e| ErrorKind::Protocol(e.to_string()))?;
            let (reply, done) = match self.exec(&line, peer, &mut run).await {
                Ok(done) => ("ok".to_string(), done),
                Err(e) => (e.to_string(), false),
            };
            framed.send(serde_json::to_string(&Reply { msg: reply })?).await
                .map_err(|e| ErrorKind::Protocol(e.to_string()))?;
            if done {
                break;
            }
        }
        Ok(())
    }

    /// Execute one command; `Ok(true)` ends the session.
    async fn exec(&self, line: &str, peer: SocketAddr, run: &mut Option<ActiveRun>) -> Result<bool> {
        let req: Request = serde_json::from_str(line)?;
        match req.name.as_str() {
            "scan" => {
                let entries: Vec<ScanEntry> = serde_json::from_value(req.args)?;
                if entries.is_empty() {
                    Err(ErrorKind::InvalidState("scan with no slots".to_string()))?
                }
                for e in &entries {
                    info!("scan: eda {} rfm {} in slot {}", e.eda, e.rfm, e.slot);
                }
                let slots: Vec<usize> = entries.iter().map(|e| e.slot).collect();
                let daq = &entries[0].daq_state;
                self.device
                    .lock()
                    .await
                    .scan(&slots, daq.rshaper, daq.trigger_type)?;
                Ok(false)
            }
            "configure" => {
                let chambers: Vec<ChamberConfig> = serde_json::from_value(req.args)?;
                self.device
                    .lock()
                    .await
                    .configure(Some(peer.ip()), chambers)?;
                Ok(false)
            }
            "initialize" => {
                self.device.lock().await.initialize()?;
                Ok(false)
            }
            "start" => {
                if run.is_some() {
                    Err(ErrorKind::InvalidState("run already in progress".to_string()))?
                }
                let args: Vec<String> = serde_json::from_value(req.args)?;
                let number: u32 = args
                    .first()
                    .ok_or_else(|| ErrorKind::Protocol("start without run number".to_string()))?
                    .parse()
                    .map_err(|e| {
                        ErrorKind::Protocol(format!("bad run number: {}", e))
                    })?;
                let deadline = self.device.lock().await.stop_deadline();
                let handle = acq::start(self.device.clone(), number);
                *run = Some(ActiveRun { handle, deadline });
                Ok(false)
            }
            "stop" => {
                let active = run
                    .take()
                    .ok_or_else(|| ErrorKind::InvalidState("no run in progress".to_string()))?;
                let cycles = active.handle.stop(active.deadline).await?;
                info!("run stopped after {} cycles", cycles);
                Ok(true)
            }
            other => Err(ErrorKind::General(format!("unknown command {:?}", other)).into()),
        }
    }
}
