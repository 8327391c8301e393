//! Pre-obtained session credentials
//!
//! Login happens elsewhere; the streaming client only carries the token and
//! the account it belongs to.

use std::sync::Arc;
use zeroize::Zeroizing;

/// DXTrade session token, wiped from memory when the last clone drops
#[derive(Clone)]
pub struct SessionToken(Arc<Zeroizing<String>>);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::new(Zeroizing::new(token.into())))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionToken(***)")
    }
}

/// Token plus account identifier
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub token: SessionToken,
    pub account_id: String,
}

impl SessionCredentials {
    pub fn new(token: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            token: SessionToken::new(token),
            account_id: account_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_token() {
        let creds = SessionCredentials::new("secret-token", "ACC-1");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("ACC-1"));
        assert_eq!(creds.token.expose(), "secret-token");
    }
}
