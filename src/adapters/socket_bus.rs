//! Socket-bus adapter (MT5-style).
//!
//! The terminal EA exposes two TCP channels: a broadcast port carrying leader
//! trade events and heartbeats as JSON lines, and a command port answering
//! one JSON request line with one JSON response line. Leader terminals
//! publish; each follower terminal binds its own command port.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::errors::TransportError;
use crate::models::{AccountSnapshot, CommandResponse, CopyCommand, Platform, TradeEvent};
use crate::protocol::{decode_frame, encode_frame, BusFrame};

use super::{ConnectionHealth, PlatformAdapter};

/// Addresses of the two channels, independently configurable per role.
#[derive(Debug, Clone)]
pub struct SocketBusConfig {
    /// host:port of the leader event broadcast channel
    pub broadcast_addr: String,

    /// host:port of the request/response command channel
    pub command_addr: String,
}

pub struct SocketBusAdapter {
    account_id: String,
    config: SocketBusConfig,
    health: Arc<ConnectionHealth>,
    subscriber: Mutex<Option<mpsc::Sender<TradeEvent>>>,

    // Request/response pairs are serialized under this lock so interleaved
    // dispatches cannot cross-read each other's replies.
    command_stream: AsyncMutex<Option<BufReader<TcpStream>>>,
}

impl SocketBusAdapter {
    pub fn new(account_id: &str, config: SocketBusConfig) -> Arc<Self> {
        Arc::new(Self {
            account_id: account_id.to_string(),
            config,
            health: ConnectionHealth::new(),
            subscriber: Mutex::new(None),
            command_stream: AsyncMutex::new(None),
        })
    }

    async fn round_trip(&self, frame: &BusFrame) -> Result<BusFrame, TransportError> {
        let mut guard = self.command_stream.lock().await;

        // The stream leaves the slot for the duration of the exchange and is
        // put back only after a complete request/response pair. Responses
        // carry no correlation id, so a round-trip abandoned mid-flight
        // (engine timeout) must close the socket: a late reply left queued
        // would be read as the answer to the next command.
        let mut stream = guard.take().ok_or(TransportError::NotConnected)?;
        let mut teardown = Teardown {
            health: &self.health,
            armed: true,
        };

        let line = encode_frame(frame)?;
        stream.get_mut().write_all(line.as_bytes()).await?;

        let mut reply = String::new();
        let n = stream.read_line(&mut reply).await?;
        if n == 0 {
            return Err(TransportError::ConnectFailed(
                "command channel closed by peer".to_string(),
            ));
        }

        self.health.touch();
        let frame = decode_frame(&reply)?;
        teardown.armed = false;
        *guard = Some(stream);
        Ok(frame)
    }
}

/// Marks the adapter disconnected when a round-trip does not run to
/// completion, whether it errored or was cancelled at an await point.
struct Teardown<'a> {
    health: &'a ConnectionHealth,
    armed: bool,
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.health.mark_disconnected();
        }
    }
}

#[async_trait]
impl PlatformAdapter for SocketBusAdapter {
    fn platform(&self) -> Platform {
        Platform::Mt5
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let mut guard = self.command_stream.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let stream = TcpStream::connect(&self.config.command_addr)
            .await
            .map_err(|e| {
                TransportError::ConnectFailed(format!("{}: {e}", self.config.command_addr))
            })?;
        stream.set_nodelay(true)?;

        *guard = Some(BufReader::new(stream));
        self.health.mark_connected();
        info!(account = %self.account_id, addr = %self.config.command_addr, "socket bus connected");
        Ok(())
    }

    fn subscribe(&self, tx: mpsc::Sender<TradeEvent>) {
        *self.subscriber.lock().expect("subscriber lock poisoned") = Some(tx);
    }

    async fn run_event_loop(&self) -> Result<(), TransportError> {
        let stream = TcpStream::connect(&self.config.broadcast_addr)
            .await
            .map_err(|e| {
                TransportError::ConnectFailed(format!("{}: {e}", self.config.broadcast_addr))
            })?;

        self.health.mark_connected();
        debug!(account = %self.account_id, addr = %self.config.broadcast_addr, "listening for leader events");

        let mut lines = BufReader::new(stream).lines();
        loop {
            let line = match lines.next_line().await? {
                Some(line) => line,
                None => {
                    self.health.mark_disconnected();
                    return Err(TransportError::ConnectFailed(
                        "broadcast stream closed by peer".to_string(),
                    ));
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            match decode_frame(&line) {
                Ok(BusFrame::Trade(wire)) => {
                    self.health.touch();
                    let tx = self
                        .subscriber
                        .lock()
                        .expect("subscriber lock poisoned")
                        .clone();
                    if let Some(tx) = tx {
                        if tx.send(wire.into()).await.is_err() {
                            // Engine gone; treat as shutdown
                            return Ok(());
                        }
                    }
                }
                Ok(BusFrame::Heartbeat { .. }) => {
                    self.health.touch();
                }
                Ok(other) => {
                    warn!(account = %self.account_id, frame = ?other, "unexpected frame on broadcast channel");
                }
                Err(e) => {
                    warn!(account = %self.account_id, error = %e, "dropping malformed frame");
                }
            }
        }
    }

    async fn send_command(&self, cmd: &CopyCommand) -> Result<CommandResponse, TransportError> {
        match self.round_trip(&BusFrame::Command(cmd.clone())).await? {
            BusFrame::Response(resp) => Ok(resp),
            other => Err(TransportError::ProtocolMismatch(format!(
                "expected response frame, got {other:?}"
            ))),
        }
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot, TransportError> {
        let query = BusFrame::Status {
            account: self.account_id.clone(),
        };
        match self.round_trip(&query).await? {
            BusFrame::Snapshot(snap) => Ok(snap),
            other => Err(TransportError::ProtocolMismatch(format!(
                "expected snapshot frame, got {other:?}"
            ))),
        }
    }

    async fn disconnect(&self) {
        *self.command_stream.lock().await = None;
        self.health.mark_disconnected();
        info!(account = %self.account_id, "socket bus disconnected");
    }

    fn health(&self) -> Arc<ConnectionHealth> {
        self.health.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio::net::TcpListener;

    use crate::models::{TradeAction, TradeEventKind};
    use crate::protocol::WireTradeEvent;

    fn wire_event(ticket: i64) -> WireTradeEvent {
        WireTradeEvent {
            event: TradeEventKind::Open,
            ticket,
            symbol: "EURUSD".to_string(),
            side: TradeAction::Buy,
            volume: dec!(1.0),
            price: dec!(1.0850),
            profit: None,
            magic: None,
            time: Utc::now(),
            account: "100500".to_string(),
        }
    }

    #[tokio::test]
    async fn test_event_loop_forwards_trades_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            for ticket in [1i64, 2, 3] {
                let frame = BusFrame::Trade(wire_event(ticket));
                stream
                    .write_all(encode_frame(&frame).unwrap().as_bytes())
                    .await
                    .unwrap();
            }
            // Heartbeats are swallowed, not forwarded
            let hb = BusFrame::Heartbeat {
                account: "100500".to_string(),
                time: Utc::now(),
            };
            stream
                .write_all(encode_frame(&hb).unwrap().as_bytes())
                .await
                .unwrap();
        });

        let adapter = SocketBusAdapter::new(
            "100500",
            SocketBusConfig {
                broadcast_addr: addr.to_string(),
                command_addr: "127.0.0.1:1".to_string(),
            },
        );

        let (tx, mut rx) = mpsc::channel(16);
        adapter.subscribe(tx);

        let loop_adapter = adapter.clone();
        let handle = tokio::spawn(async move { loop_adapter.run_event_loop().await });

        for expected in [1i64, 2, 3] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.leader_ticket, expected);
        }

        // Peer closed after writing; loop reports the drop
        let result = handle.await.unwrap();
        assert!(result.is_err());
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_send_command_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();

            let frame = decode_frame(&line).unwrap();
            let BusFrame::Command(cmd) = frame else {
                panic!("expected command frame");
            };
            assert_eq!(cmd.symbol, "EURUSD");

            let reply = BusFrame::Response(CommandResponse {
                success: true,
                ticket: Some(777),
                price: Some(dec!(1.0851)),
                filled_volume: None,
                error: None,
            });
            reader
                .get_mut()
                .write_all(encode_frame(&reply).unwrap().as_bytes())
                .await
                .unwrap();
        });

        let adapter = SocketBusAdapter::new(
            "200100",
            SocketBusConfig {
                broadcast_addr: "127.0.0.1:1".to_string(),
                command_addr: addr.to_string(),
            },
        );
        adapter.connect().await.unwrap();

        let cmd = CopyCommand {
            leader_ticket: 42,
            symbol: "EURUSD".to_string(),
            action: TradeAction::Sell,
            kind: TradeEventKind::Open,
            volume: dec!(0.5),
            price: dec!(1.0850),
            magic: None,
            comment: CopyCommand::comment_tag(42),
        };

        let resp = adapter.send_command(&cmd).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.ticket, Some(777));
    }

    #[tokio::test]
    async fn test_abandoned_round_trip_tears_down_command_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Terminal answers ticket 111 long after the caller gave up, then
        // would answer 222 for a second command.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            for ticket in [111i64, 222] {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                let reply = BusFrame::Response(CommandResponse {
                    success: true,
                    ticket: Some(ticket),
                    price: None,
                    filled_volume: None,
                    error: None,
                });
                if reader
                    .get_mut()
                    .write_all(encode_frame(&reply).unwrap().as_bytes())
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        let adapter = SocketBusAdapter::new(
            "200100",
            SocketBusConfig {
                broadcast_addr: "127.0.0.1:1".to_string(),
                command_addr: addr.to_string(),
            },
        );
        adapter.connect().await.unwrap();

        let cmd = CopyCommand {
            leader_ticket: 42,
            symbol: "EURUSD".to_string(),
            action: TradeAction::Sell,
            kind: TradeEventKind::Open,
            volume: dec!(0.5),
            price: dec!(1.0850),
            magic: None,
            comment: CopyCommand::comment_tag(42),
        };

        let first = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            adapter.send_command(&cmd),
        )
        .await;
        assert!(first.is_err());

        // The late ticket-111 reply must never surface as the answer to the
        // next command; the channel is torn down instead.
        let err = adapter.send_command(&cmd).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_send_command_requires_connection() {
        let adapter = SocketBusAdapter::new(
            "200100",
            SocketBusConfig {
                broadcast_addr: "127.0.0.1:1".to_string(),
                command_addr: "127.0.0.1:1".to_string(),
            },
        );

        let cmd = CopyCommand {
            leader_ticket: 1,
            symbol: "EURUSD".to_string(),
            action: TradeAction::Buy,
            kind: TradeEventKind::Open,
            volume: dec!(0.1),
            price: dec!(1.0),
            magic: None,
            comment: String::new(),
        };

        let err = adapter.send_command(&cmd).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }
}
