//! The active user credential

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// An authenticated session: access/refresh token pair plus the owning user
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Id of the user that owns this session
    pub user_id: String,
    /// Access token attached to session-authenticated requests
    pub access_token: String,
    /// Refresh token for obtaining a new access token, if the backend issued one
    pub refresh_token: Option<String>,
    /// Expiry hint for the access token
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Create a credential without refresh token or expiry information
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    /// Set the refresh token
    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    /// Set the expiry hint from a lifetime in seconds
    pub fn with_expires_in(mut self, seconds: i64) -> Self {
        self.expires_at = Some(Utc::now() + Duration::seconds(seconds));
        self
    }

    /// Whether the access token is past (or within a minute of) its expiry hint
    ///
    /// A credential without a hint is assumed live until the backend rejects it.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => at <= Utc::now() + Duration::seconds(60),
            None => false,
        }
    }

    /// True when a refresh exchange can be attempted for this credential
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }
}
