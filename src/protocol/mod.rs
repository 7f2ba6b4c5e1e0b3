//! Wire protocol and trade-event normalizer.
//!
//! Adapters speak newline-delimited JSON regardless of transport; this module
//! owns the frame shapes and the conversions between platform payloads and
//! the canonical [`TradeEvent`] / [`CopyCommand`] types. Terminal EAs emit
//! `ticket`/`side`/`time` field names, the engine speaks the canonical model;
//! nothing outside this module needs to know both.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::TransportError;
use crate::models::{
    AccountSnapshot, CommandResponse, CopyCommand, TradeAction, TradeEvent, TradeEventKind,
};

/// A leader trade event as the terminal EAs put it on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireTradeEvent {
    pub event: TradeEventKind,
    pub ticket: i64,
    pub symbol: String,
    pub side: TradeAction,
    pub volume: Decimal,
    pub price: Decimal,

    #[serde(default)]
    pub profit: Option<Decimal>,

    #[serde(default)]
    pub magic: Option<i64>,

    pub time: DateTime<Utc>,
    pub account: String,
}

impl From<WireTradeEvent> for TradeEvent {
    fn from(w: WireTradeEvent) -> Self {
        TradeEvent {
            leader_ticket: w.ticket,
            symbol: w.symbol,
            action: w.side,
            kind: w.event,
            volume: w.volume,
            price: w.price,
            profit: w.profit,
            magic: w.magic,
            timestamp: w.time,
            source_account_id: w.account,
        }
    }
}

impl From<&TradeEvent> for WireTradeEvent {
    fn from(e: &TradeEvent) -> Self {
        WireTradeEvent {
            event: e.kind,
            ticket: e.leader_ticket,
            symbol: e.symbol.clone(),
            side: e.action,
            volume: e.volume,
            price: e.price,
            profit: e.profit,
            magic: e.magic,
            time: e.timestamp,
            account: e.source_account_id.clone(),
        }
    }
}

/// One frame on the socket bus or in the file-IPC event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusFrame {
    /// Liveness beacon emitted by the terminal on an interval
    Heartbeat { account: String, time: DateTime<Utc> },

    /// Leader trade event on the broadcast channel
    Trade(WireTradeEvent),

    /// Copy command on a follower's request channel
    Command(CopyCommand),

    /// Reply on a follower's request channel
    Response(CommandResponse),

    /// Full account snapshot (reply to a status query)
    Snapshot(AccountSnapshot),

    /// Status query
    Status { account: String },
}

/// Encode a frame as one JSON line (trailing newline included).
pub fn encode_frame(frame: &BusFrame) -> Result<String, TransportError> {
    let mut line = serde_json::to_string(frame)
        .map_err(|e| TransportError::ProtocolMismatch(format!("encode: {e}")))?;
    line.push('\n');
    Ok(line)
}

/// Decode one JSON line into a frame.
pub fn decode_frame(line: &str) -> Result<BusFrame, TransportError> {
    serde_json::from_str(line.trim())
        .map_err(|e| TransportError::ProtocolMismatch(format!("decode: {e}: {line:.120}")))
}

/// Actions accepted on the cTrader-style commands pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipeAction {
    Pause,
    Resume,
    CloseAll,
    ClosePosition,
    Status,
    /// Engine-side extension for dispatching opens through the same pipe
    Open,
}

/// Request written to the commands pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipeRequest {
    pub action: PipeAction,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<i64>,

    // Order fields, present for OPEN only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<TradeAction>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Reply read back from the commands pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipeResponse {
    pub success: bool,

    #[serde(default)]
    pub position_id: Option<i64>,

    #[serde(default)]
    pub price: Option<Decimal>,

    #[serde(default)]
    pub error: Option<String>,
}

/// Translate an engine command into the pipe request dialect.
///
/// Opens carry the full order; closes address the copied position by the
/// follower-side id when known, else fall back to CLOSE_ALL-by-comment which
/// the terminal resolves from the tag. Modify has no pipe equivalent and maps
/// to a status probe so the caller still gets a round-trip.
pub fn command_to_pipe_request(cmd: &CopyCommand, position_id: Option<i64>) -> PipeRequest {
    match cmd.kind {
        TradeEventKind::Open => PipeRequest {
            action: PipeAction::Open,
            position_id: None,
            symbol: Some(cmd.symbol.clone()),
            side: Some(cmd.action),
            volume: Some(cmd.volume),
            comment: Some(cmd.comment.clone()),
        },
        TradeEventKind::Close => PipeRequest {
            action: PipeAction::ClosePosition,
            position_id,
            symbol: None,
            side: None,
            volume: None,
            comment: Some(cmd.comment.clone()),
        },
        TradeEventKind::Modify => PipeRequest {
            action: PipeAction::Status,
            position_id,
            symbol: None,
            side: None,
            volume: None,
            comment: Some(cmd.comment.clone()),
        },
    }
}

impl From<PipeResponse> for CommandResponse {
    fn from(r: PipeResponse) -> Self {
        CommandResponse {
            success: r.success,
            ticket: r.position_id,
            price: r.price,
            filled_volume: None,
            error: r.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decode_leader_trade_frame() {
        let line = r#"{"type":"trade","event":"OPEN","ticket":18446,"symbol":"EURUSD.m","side":"BUY","volume":"1.0","price":"1.0850","magic":777,"time":"2026-08-20T12:00:00Z","account":"100500"}"#;

        let frame = decode_frame(line).unwrap();
        let BusFrame::Trade(wire) = frame else {
            panic!("expected trade frame");
        };

        let event: TradeEvent = wire.into();
        assert_eq!(event.leader_ticket, 18446);
        assert_eq!(event.symbol, "EURUSD.m");
        assert_eq!(event.action, TradeAction::Buy);
        assert_eq!(event.kind, TradeEventKind::Open);
        assert_eq!(event.volume, dec!(1.0));
        assert_eq!(event.magic, Some(777));
        assert_eq!(event.source_account_id, "100500");
    }

    #[test]
    fn test_frame_round_trip() {
        let event = TradeEvent {
            leader_ticket: 7,
            symbol: "GBPUSD".to_string(),
            action: TradeAction::Sell,
            kind: TradeEventKind::Close,
            volume: dec!(0.25),
            price: dec!(1.2701),
            profit: Some(dec!(12.40)),
            magic: None,
            timestamp: Utc::now(),
            source_account_id: "100500".to_string(),
        };

        let encoded = encode_frame(&BusFrame::Trade((&event).into())).unwrap();
        assert!(encoded.ends_with('\n'));

        let decoded = decode_frame(&encoded).unwrap();
        let BusFrame::Trade(wire) = decoded else {
            panic!("expected trade frame");
        };
        let back: TradeEvent = wire.into();
        assert_eq!(back.leader_ticket, 7);
        assert_eq!(back.profit, Some(dec!(12.40)));
    }

    #[test]
    fn test_garbage_is_protocol_mismatch() {
        let err = decode_frame("not json at all").unwrap_err();
        assert!(matches!(err, TransportError::ProtocolMismatch(_)));

        // Valid JSON, unknown frame type
        let err = decode_frame(r#"{"type":"telemetry","cpu":3}"#).unwrap_err();
        assert!(matches!(err, TransportError::ProtocolMismatch(_)));
    }

    #[test]
    fn test_open_command_maps_to_pipe_open() {
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

        let req = command_to_pipe_request(&cmd, None);
        assert_eq!(req.action, PipeAction::Open);
        assert_eq!(req.symbol.as_deref(), Some("EURUSD"));
        assert_eq!(req.side, Some(TradeAction::Sell));
        assert_eq!(req.volume, Some(dec!(0.5)));

        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""action":"OPEN""#));
        // Close-only fields are omitted, not null
        assert!(!json.contains("positionId"));
    }

    #[test]
    fn test_close_command_maps_to_close_position() {
        let cmd = CopyCommand {
            leader_ticket: 42,
            symbol: "EURUSD".to_string(),
            action: TradeAction::Buy,
            kind: TradeEventKind::Close,
            volume: dec!(0.5),
            price: dec!(1.0900),
            magic: None,
            comment: CopyCommand::comment_tag(42),
        };

        let req = command_to_pipe_request(&cmd, Some(9001));
        assert_eq!(req.action, PipeAction::ClosePosition);
        assert_eq!(req.position_id, Some(9001));
    }

    #[test]
    fn test_pipe_response_conversion() {
        let resp = PipeResponse {
            success: true,
            position_id: Some(555),
            price: Some(dec!(1.0851)),
            error: None,
        };
        let cr: CommandResponse = resp.into();
        assert!(cr.success);
        assert_eq!(cr.ticket, Some(555));
    }
}
