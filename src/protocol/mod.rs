//! DXTrade wire protocol
//!
//! - `messages`: tagged-union schema of every frame on either socket
//! - `router`: strict-then-lenient parsing and route classification

pub mod messages;
pub mod router;

pub use messages::{
    DataEvent, DxMessage, ErrorMessage, MessageKind, PingMessage, PingRequest, PongMessage,
    RejectMessage, SubscriptionRequest, SubscriptionResponse,
};
pub use router::{parse_inbound, route, truncate_payload, ParsedMessage, Route, Validation};
