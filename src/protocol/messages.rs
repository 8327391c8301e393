//! DXTrade push API message schema
//!
//! Every frame is a JSON object discriminated by its `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client keepalive / session greeting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingMessage {
    pub session: String,
    pub timestamp: i64,
}

/// Server acknowledgement of a `Ping`; doubles as the authentication signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PongMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

/// Server-initiated keepalive; must be answered with a `Ping` echoing `timestamp`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingRequest {
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub request_id: String,
    pub session: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Market data, portfolio, position and order pushes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataEvent {
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RejectMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
}

/// Closed set of frames exchanged on either socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DxMessage {
    Ping(PingMessage),
    Pong(PongMessage),
    PingRequest(PingRequest),
    MarketDataSubscriptionRequest(SubscriptionRequest),
    AccountPortfoliosSubscriptionRequest(SubscriptionRequest),
    SubscriptionResponse(SubscriptionResponse),
    MarketData(DataEvent),
    AccountPortfolios(DataEvent),
    PositionUpdate(DataEvent),
    OrderUpdate(DataEvent),
    Reject(RejectMessage),
    Error(ErrorMessage),
}

/// Discriminant of [`DxMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Pong,
    PingRequest,
    MarketDataSubscriptionRequest,
    AccountPortfoliosSubscriptionRequest,
    SubscriptionResponse,
    MarketData,
    AccountPortfolios,
    PositionUpdate,
    OrderUpdate,
    Reject,
    Error,
}

impl MessageKind {
    pub const ALL: [MessageKind; 12] = [
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::PingRequest,
        MessageKind::MarketDataSubscriptionRequest,
        MessageKind::AccountPortfoliosSubscriptionRequest,
        MessageKind::SubscriptionResponse,
        MessageKind::MarketData,
        MessageKind::AccountPortfolios,
        MessageKind::PositionUpdate,
        MessageKind::OrderUpdate,
        MessageKind::Reject,
        MessageKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Ping => "Ping",
            MessageKind::Pong => "Pong",
            MessageKind::PingRequest => "PingRequest",
            MessageKind::MarketDataSubscriptionRequest => "MarketDataSubscriptionRequest",
            MessageKind::AccountPortfoliosSubscriptionRequest => {
                "AccountPortfoliosSubscriptionRequest"
            }
            MessageKind::SubscriptionResponse => "SubscriptionResponse",
            MessageKind::MarketData => "MarketData",
            MessageKind::AccountPortfolios => "AccountPortfolios",
            MessageKind::PositionUpdate => "PositionUpdate",
            MessageKind::OrderUpdate => "OrderUpdate",
            MessageKind::Reject => "Reject",
            MessageKind::Error => "Error",
        }
    }

    pub fn from_type(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == tag)
    }

    pub fn is_data(&self) -> bool {
        matches!(
            self,
            MessageKind::MarketData
                | MessageKind::AccountPortfolios
                | MessageKind::PositionUpdate
                | MessageKind::OrderUpdate
        )
    }

    pub fn is_subscription_request(&self) -> bool {
        matches!(
            self,
            MessageKind::MarketDataSubscriptionRequest
                | MessageKind::AccountPortfoliosSubscriptionRequest
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DxMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            DxMessage::Ping(_) => MessageKind::Ping,
            DxMessage::Pong(_) => MessageKind::Pong,
            DxMessage::PingRequest(_) => MessageKind::PingRequest,
            DxMessage::MarketDataSubscriptionRequest(_) => MessageKind::MarketDataSubscriptionRequest,
            DxMessage::AccountPortfoliosSubscriptionRequest(_) => {
                MessageKind::AccountPortfoliosSubscriptionRequest
            }
            DxMessage::SubscriptionResponse(_) => MessageKind::SubscriptionResponse,
            DxMessage::MarketData(_) => MessageKind::MarketData,
            DxMessage::AccountPortfolios(_) => MessageKind::AccountPortfolios,
            DxMessage::PositionUpdate(_) => MessageKind::PositionUpdate,
            DxMessage::OrderUpdate(_) => MessageKind::OrderUpdate,
            DxMessage::Reject(_) => MessageKind::Reject,
            DxMessage::Error(_) => MessageKind::Error,
        }
    }

    pub fn ping(session: &str, timestamp: i64) -> Self {
        DxMessage::Ping(PingMessage {
            session: session.to_string(),
            timestamp,
        })
    }

    /// Subscription request of the given wire kind.
    pub fn subscription_request(
        kind: MessageKind,
        request_id: &str,
        session: &str,
        payload: Value,
    ) -> Option<Self> {
        let request = SubscriptionRequest {
            request_id: request_id.to_string(),
            session: session.to_string(),
            payload,
        };
        match kind {
            MessageKind::MarketDataSubscriptionRequest => {
                Some(DxMessage::MarketDataSubscriptionRequest(request))
            }
            MessageKind::AccountPortfoliosSubscriptionRequest => {
                Some(DxMessage::AccountPortfoliosSubscriptionRequest(request))
            }
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&DataEvent> {
        match self {
            DxMessage::MarketData(event)
            | DxMessage::AccountPortfolios(event)
            | DxMessage::PositionUpdate(event)
            | DxMessage::OrderUpdate(event) => Some(event),
            _ => None,
        }
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            DxMessage::Ping(ping) if ping.session.is_empty() => {
                Err("Ping without session".to_string())
            }
            DxMessage::MarketDataSubscriptionRequest(req)
            | DxMessage::AccountPortfoliosSubscriptionRequest(req)
                if req.request_id.is_empty() =>
            {
                Err("subscription request without requestId".to_string())
            }
            DxMessage::SubscriptionResponse(resp) if resp.request_id.is_empty() => {
                Err("subscription response without requestId".to_string())
            }
            DxMessage::MarketData(event)
            | DxMessage::AccountPortfolios(event)
            | DxMessage::PositionUpdate(event)
            | DxMessage::OrderUpdate(event)
                if event.payload.is_null() =>
            {
                Err(format!("{} with null payload", self.kind()))
            }
            _ => Ok(()),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
