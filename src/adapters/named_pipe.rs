//! Named-pipe adapter (cTrader-style).
//!
//! The cTrader cBot exposes two channels, modeled here as Unix sockets: a
//! status pipe streaming a full JSON account snapshot on an interval
//! (default 1s), and a commands pipe answering one JSON request with one
//! JSON response (PAUSE / RESUME / CLOSE_ALL / CLOSE_POSITION / STATUS plus
//! the engine's OPEN extension).
//!
//! cTrader emits no discrete trade events, so when this adapter fronts a
//! leader account the receive loop diffs consecutive snapshots: a position
//! appearing becomes an open event, a position disappearing becomes a close.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::TransportError;
use crate::models::{
    AccountSnapshot, BrokerPosition, CommandResponse, CopyCommand, Platform, TradeEvent,
    TradeEventKind,
};
use crate::protocol::{command_to_pipe_request, PipeRequest, PipeResponse};

use super::{ConnectionHealth, PlatformAdapter};

#[derive(Debug, Clone)]
pub struct NamedPipeConfig {
    /// Socket path of the streaming snapshot channel
    pub status_pipe: PathBuf,

    /// Socket path of the request/response command channel
    pub command_pipe: PathBuf,
}

pub struct NamedPipeAdapter {
    account_id: String,
    config: NamedPipeConfig,
    health: Arc<ConnectionHealth>,
    subscriber: Mutex<Option<mpsc::Sender<TradeEvent>>>,

    /// Latest snapshot seen on the status pipe
    last_snapshot: Mutex<Option<AccountSnapshot>>,

    /// leader ticket -> follower position id, learned from snapshot comment
    /// tags and open replies; lets close commands address the right position
    copied_positions: Mutex<HashMap<i64, i64>>,
}

impl NamedPipeAdapter {
    pub fn new(account_id: &str, config: NamedPipeConfig) -> Arc<Self> {
        Arc::new(Self {
            account_id: account_id.to_string(),
            config,
            health: ConnectionHealth::new(),
            subscriber: Mutex::new(None),
            last_snapshot: Mutex::new(None),
            copied_positions: Mutex::new(HashMap::new()),
        })
    }

    async fn pipe_round_trip(&self, request: &PipeRequest) -> Result<PipeResponse, TransportError> {
        let stream = UnixStream::connect(&self.config.command_pipe)
            .await
            .map_err(|e| {
                TransportError::ConnectFailed(format!(
                    "{}: {e}",
                    self.config.command_pipe.display()
                ))
            })?;

        let mut stream = BufReader::new(stream);
        let mut line = serde_json::to_string(request)
            .map_err(|e| TransportError::ProtocolMismatch(format!("encode: {e}")))?;
        line.push('\n');
        stream.get_mut().write_all(line.as_bytes()).await?;

        let mut reply = String::new();
        let n = stream.read_line(&mut reply).await?;
        if n == 0 {
            return Err(TransportError::ConnectFailed(
                "command pipe closed before reply".to_string(),
            ));
        }

        self.health.touch();
        serde_json::from_str(reply.trim())
            .map_err(|e| TransportError::ProtocolMismatch(format!("decode: {e}")))
    }

    fn remember_copied_positions(&self, snapshot: &AccountSnapshot) {
        let mut map = self
            .copied_positions
            .lock()
            .expect("position map lock poisoned");
        for (leader_ticket, pos) in snapshot.copied_positions() {
            map.insert(leader_ticket, pos.ticket);
        }
    }

    /// Synthesize open/close events from two consecutive snapshots.
    fn diff_snapshots(
        &self,
        previous: &HashMap<i64, BrokerPosition>,
        snapshot: &AccountSnapshot,
    ) -> Vec<TradeEvent> {
        let mut events = Vec::new();

        for pos in &snapshot.positions {
            if !previous.contains_key(&pos.ticket) {
                events.push(TradeEvent {
                    leader_ticket: pos.ticket,
                    symbol: pos.symbol.clone(),
                    action: pos.action,
                    kind: TradeEventKind::Open,
                    volume: pos.volume,
                    price: pos.price_open,
                    profit: None,
                    magic: pos.magic,
                    timestamp: snapshot.timestamp,
                    source_account_id: self.account_id.clone(),
                });
            }
        }

        let open_tickets: std::collections::HashSet<i64> =
            snapshot.positions.iter().map(|p| p.ticket).collect();
        for (ticket, pos) in previous {
            if !open_tickets.contains(ticket) {
                events.push(TradeEvent {
                    leader_ticket: *ticket,
                    symbol: pos.symbol.clone(),
                    action: pos.action,
                    kind: TradeEventKind::Close,
                    volume: pos.volume,
                    price: pos.price_open,
                    profit: Some(pos.profit),
                    magic: pos.magic,
                    timestamp: snapshot.timestamp,
                    source_account_id: self.account_id.clone(),
                });
            }
        }

        events
    }
}

#[async_trait]
impl PlatformAdapter for NamedPipeAdapter {
    fn platform(&self) -> Platform {
        Platform::Ctrader
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn connect(&self) -> Result<(), TransportError> {
        // Probe the command pipe; the status pipe is owned by the event loop
        let probe = PipeRequest {
            action: crate::protocol::PipeAction::Status,
            position_id: None,
            symbol: None,
            side: None,
            volume: None,
            comment: None,
        };
        let resp = self.pipe_round_trip(&probe).await?;
        if !resp.success {
            return Err(TransportError::ConnectFailed(
                resp.error.unwrap_or_else(|| "status probe refused".to_string()),
            ));
        }

        self.health.mark_connected();
        info!(account = %self.account_id, pipe = %self.config.command_pipe.display(), "named pipe connected");
        Ok(())
    }

    fn subscribe(&self, tx: mpsc::Sender<TradeEvent>) {
        *self.subscriber.lock().expect("subscriber lock poisoned") = Some(tx);
    }

    async fn run_event_loop(&self) -> Result<(), TransportError> {
        let stream = UnixStream::connect(&self.config.status_pipe)
            .await
            .map_err(|e| {
                TransportError::ConnectFailed(format!("{}: {e}", self.config.status_pipe.display()))
            })?;

        self.health.mark_connected();
        debug!(account = %self.account_id, pipe = %self.config.status_pipe.display(), "listening for snapshots");

        // First snapshot is the baseline; pre-existing positions belong to
        // reconciliation, not the event stream.
        let mut previous: Option<HashMap<i64, BrokerPosition>> = None;

        let mut lines = BufReader::new(stream).lines();
        loop {
            let line = match lines.next_line().await? {
                Some(line) => line,
                None => {
                    self.health.mark_disconnected();
                    return Err(TransportError::ConnectFailed(
                        "status pipe closed by peer".to_string(),
                    ));
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            let snapshot: AccountSnapshot = match serde_json::from_str(line.trim()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(account = %self.account_id, error = %e, "dropping malformed snapshot");
                    continue;
                }
            };

            self.health.touch();
            self.remember_copied_positions(&snapshot);

            let events = match &previous {
                Some(prev) => self.diff_snapshots(prev, &snapshot),
                None => Vec::new(),
            };

            previous = Some(
                snapshot
                    .positions
                    .iter()
                    .map(|p| (p.ticket, p.clone()))
                    .collect(),
            );
            *self
                .last_snapshot
                .lock()
                .expect("snapshot lock poisoned") = Some(snapshot);

            let tx = self
                .subscriber
                .lock()
                .expect("subscriber lock poisoned")
                .clone();
            if let Some(tx) = tx {
                for event in events {
                    if tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn send_command(&self, cmd: &CopyCommand) -> Result<CommandResponse, TransportError> {
        let position_id = self
            .copied_positions
            .lock()
            .expect("position map lock poisoned")
            .get(&cmd.leader_ticket)
            .copied();

        let request = command_to_pipe_request(cmd, position_id);
        let response = self.pipe_round_trip(&request).await?;

        if response.success && cmd.kind == TradeEventKind::Open {
            if let Some(opened) = response.position_id {
                self.copied_positions
                    .lock()
                    .expect("position map lock poisoned")
                    .insert(cmd.leader_ticket, opened);
            }
        }

        Ok(response.into())
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot, TransportError> {
        // Prefer the streamed snapshot; fall back to a status query when the
        // event loop has not produced one yet.
        if let Some(snap) = self
            .last_snapshot
            .lock()
            .expect("snapshot lock poisoned")
            .clone()
        {
            return Ok(snap);
        }

        let probe = PipeRequest {
            action: crate::protocol::PipeAction::Status,
            position_id: None,
            symbol: None,
            side: None,
            volume: None,
            comment: None,
        };
        let resp = self.pipe_round_trip(&probe).await?;
        if !resp.success {
            return Err(TransportError::ProtocolMismatch(
                resp.error.unwrap_or_else(|| "status query refused".to_string()),
            ));
        }

        self.last_snapshot
            .lock()
            .expect("snapshot lock poisoned")
            .clone()
            .ok_or_else(|| {
                TransportError::ProtocolMismatch("no snapshot available yet".to_string())
            })
    }

    async fn disconnect(&self) {
        self.health.mark_disconnected();
        info!(account = %self.account_id, "named pipe disconnected");
    }

    fn health(&self) -> Arc<ConnectionHealth> {
        self.health.clone()
    }
}
