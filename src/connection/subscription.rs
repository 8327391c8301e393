use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::protocol::MessageKind;

/// Channel plus sorted, de-duplicated symbol set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub channel: String,
    pub symbols: Vec<String>,
}

impl SubscriptionKey {
    pub fn new<I, S>(channel: &str, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let symbols: BTreeSet<String> = symbols.into_iter().map(Into::into).collect();
        Self {
            channel: channel.to_string(),
            symbols: symbols.into_iter().collect(),
        }
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.channel, self.symbols.join(","))
    }
}

/// A subscription and the template used to (re)issue it
#[derive(Debug, Clone)]
pub struct Subscription {
    pub key: SubscriptionKey,
    pub request_type: MessageKind,
    pub payload: Value,
    /// Set once the server acknowledges the latest request
    pub active: bool,
    pub last_update: Option<DateTime<Utc>>,
    /// requestId of the latest request awaiting acknowledgement
    pub pending_request_id: Option<String>,
}

impl Subscription {
    pub fn new(key: SubscriptionKey, request_type: MessageKind, payload: Value) -> Self {
        Self {
            key,
            request_type,
            payload,
            active: false,
            last_update: None,
            pending_request_id: None,
        }
    }

    /// Whether data of kind `data` is delivered by this subscription
    pub fn feeds(&self, data: MessageKind) -> bool {
        match self.request_type {
            MessageKind::MarketDataSubscriptionRequest => data == MessageKind::MarketData,
            MessageKind::AccountPortfoliosSubscriptionRequest => matches!(
                data,
                MessageKind::AccountPortfolios
                    | MessageKind::PositionUpdate
                    | MessageKind::OrderUpdate
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_sorts_and_dedups_symbols() {
        let a = SubscriptionKey::new("quotes", ["GBP/USD", "EUR/USD", "GBP/USD"]);
        let b = SubscriptionKey::new("quotes", vec!["EUR/USD".to_string(), "GBP/USD".to_string()]);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "quotes[EUR/USD,GBP/USD]");
        assert_ne!(a, SubscriptionKey::new("candles", ["EUR/USD", "GBP/USD"]));
    }

    #[test]
    fn test_feeds() {
        let sub = Subscription::new(
            SubscriptionKey::new("portfolio", Vec::<String>::new()),
            MessageKind::AccountPortfoliosSubscriptionRequest,
            json!({}),
        );
        assert!(sub.feeds(MessageKind::OrderUpdate));
        assert!(!sub.feeds(MessageKind::MarketData));
    }
}
