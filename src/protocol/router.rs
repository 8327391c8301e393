//! Inbound message parsing and routing
//!
//! Parsing is strict first (full tagged-union schema), then lenient: only the
//! `type` tag and the minimal payload shape for that type are checked, so a
//! broker frame that drifts from the documented schema still reaches the same
//! typed handlers.

use chrono::DateTime;
use serde_json::{Map, Value};
use tracing::debug;

use super::messages::{
    DataEvent, DxMessage, ErrorMessage, MessageKind, PingMessage, PingRequest, PongMessage,
    RejectMessage, SubscriptionRequest, SubscriptionResponse,
};
use crate::error::{DxStreamError, Result};

/// Longest raw payload carried in diagnostics
pub const RAW_PREVIEW_LEN: usize = 200;

/// Which parsing path accepted a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Strict,
    Lenient,
}

/// A validated inbound frame
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub message: DxMessage,
    pub validation: Validation,
}

/// Where a message goes after parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Pong: heartbeat acknowledgement / session accepted
    Heartbeat,
    /// Server PingRequest that needs an echo
    KeepaliveRequest,
    SubscriptionAck,
    Data(MessageKind),
    Reject,
    ServerError,
    /// Client-to-server frame echoed back by the peer
    Outbound,
}

pub fn route(message: &DxMessage) -> Route {
    let kind = message.kind();
    match kind {
        MessageKind::Pong => Route::Heartbeat,
        MessageKind::PingRequest => Route::KeepaliveRequest,
        MessageKind::SubscriptionResponse => Route::SubscriptionAck,
        MessageKind::Reject => Route::Reject,
        MessageKind::Error => Route::ServerError,
        MessageKind::Ping
        | MessageKind::MarketDataSubscriptionRequest
        | MessageKind::AccountPortfoliosSubscriptionRequest => Route::Outbound,
        MessageKind::MarketData
        | MessageKind::AccountPortfolios
        | MessageKind::PositionUpdate
        | MessageKind::OrderUpdate => Route::Data(kind),
    }
}

/// Truncate `raw` to at most `max` bytes on a char boundary.
pub fn truncate_payload(raw: &str, max: usize) -> String {
    if raw.len() <= max {
        return raw.to_string();
    }
    let mut end = max;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &raw[..end])
}

/// Parse one inbound text frame.
pub fn parse_inbound(text: &str) -> Result<ParsedMessage> {
    match serde_json::from_str::<DxMessage>(text) {
        Ok(message) => match message.validate() {
            Ok(()) => {
                return Ok(ParsedMessage {
                    message,
                    validation: Validation::Strict,
                })
            }
            Err(reason) => debug!("Strict validation failed: {}", reason),
        },
        Err(e) => debug!("Strict parse failed: {}", e),
    }

    let value: Value = serde_json::from_str(text)
        .map_err(|e| DxStreamError::Protocol(format!("invalid JSON: {}", e)))?;
    let message = parse_lenient(&value)?;
    Ok(ParsedMessage {
        message,
        validation: Validation::Lenient,
    })
}

/// Permissive fallback: `type` tag plus minimal required shape.
pub fn parse_lenient(value: &Value) -> Result<DxMessage> {
    let obj = value
        .as_object()
        .ok_or_else(|| DxStreamError::Protocol("frame is not a JSON object".to_string()))?;
    let tag = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DxStreamError::Protocol("missing type tag".to_string()))?;
    let kind = MessageKind::from_type(tag)
        .ok_or_else(|| DxStreamError::Protocol(format!("unknown message type {}", tag)))?;

    let missing = |field: &str| DxStreamError::Protocol(format!("{} without {}", tag, field));

    let message = match kind {
        MessageKind::Ping => DxMessage::Ping(PingMessage {
            session: string_field(obj, &["session"]).unwrap_or_default(),
            timestamp: obj.get("timestamp").and_then(coerce_timestamp).unwrap_or(0),
        }),
        MessageKind::Pong => DxMessage::Pong(PongMessage {
            timestamp: obj.get("timestamp").and_then(coerce_timestamp),
            session: string_field(obj, &["session"]),
        }),
        MessageKind::PingRequest => DxMessage::PingRequest(PingRequest {
            timestamp: obj
                .get("timestamp")
                .and_then(coerce_timestamp)
                .ok_or_else(|| missing("timestamp"))?,
        }),
        MessageKind::MarketDataSubscriptionRequest
        | MessageKind::AccountPortfoliosSubscriptionRequest => {
            let request = SubscriptionRequest {
                request_id: string_field(obj, &["requestId", "inReplyTo"])
                    .ok_or_else(|| missing("requestId"))?,
                session: string_field(obj, &["session"]).unwrap_or_default(),
                payload: payload_field(obj).ok_or_else(|| missing("payload"))?,
            };
            if kind == MessageKind::MarketDataSubscriptionRequest {
                DxMessage::MarketDataSubscriptionRequest(request)
            } else {
                DxMessage::AccountPortfoliosSubscriptionRequest(request)
            }
        }
        MessageKind::SubscriptionResponse => {
            let error = string_field(obj, &["error", "message"]);
            DxMessage::SubscriptionResponse(SubscriptionResponse {
                request_id: string_field(obj, &["requestId", "inReplyTo"])
                    .ok_or_else(|| missing("requestId"))?,
                success: obj
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(error.is_none()),
                error,
            })
        }
        MessageKind::MarketData
        | MessageKind::AccountPortfolios
        | MessageKind::PositionUpdate
        | MessageKind::OrderUpdate => {
            let event = DataEvent {
                payload: payload_field(obj).ok_or_else(|| missing("payload"))?,
                timestamp: obj.get("timestamp").and_then(coerce_timestamp),
                request_id: string_field(obj, &["requestId", "inReplyTo"]),
            };
            match kind {
                MessageKind::MarketData => DxMessage::MarketData(event),
                MessageKind::AccountPortfolios => DxMessage::AccountPortfolios(event),
                MessageKind::PositionUpdate => DxMessage::PositionUpdate(event),
                _ => DxMessage::OrderUpdate(event),
            }
        }
        MessageKind::Reject => DxMessage::Reject(RejectMessage {
            reason: string_field(obj, &["reason", "message", "error"]),
            payload: payload_field(obj),
        }),
        MessageKind::Error => DxMessage::Error(ErrorMessage {
            error: string_field(obj, &["error", "message", "description"]).or_else(|| {
                payload_field(obj).and_then(|p| {
                    p.get("description")
                        .or_else(|| p.get("message"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
            }),
            code: obj.get("code").cloned(),
        }),
    };

    Ok(message)
}

/// First present field among `names`, as a string (numbers are stringified).
fn string_field(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match obj.get(*name)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// `payload`, or DXTrade's `body`, when non-null.
fn payload_field(obj: &Map<String, Value>) -> Option<Value> {
    ["payload", "body"]
        .iter()
        .filter_map(|name| obj.get(*name))
        .find(|v| !v.is_null())
        .cloned()
}

/// Epoch millis from a number, a numeric string, or an RFC 3339 string.
fn coerce_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| {
                DateTime::parse_from_rfc3339(s.trim())
                    .ok()
                    .map(|dt| dt.timestamp_millis())
            }),
        _ => None,
    }
}
