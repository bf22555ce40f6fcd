//! Session management: credential storage, proactive renewal, and coalesced
//! token refresh

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use reqwest::header;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use kinvey_store::Credential;

use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// A backend user, as returned by signup and login
#[derive(Clone, Debug, Deserialize)]
pub struct User {
    /// Server-assigned user id
    #[serde(rename = "_id")]
    pub id: String,
    /// Login name
    pub username: String,
    /// Remaining user attributes the backend returned
    #[serde(flatten)]
    pub attributes: HashMap<String, Value>,
}

/// Response to signup and login requests
#[derive(Debug, Deserialize)]
pub(crate) struct SessionResponse {
    #[serde(flatten)]
    pub(crate) user: User,
    pub(crate) access_token: String,
    #[serde(default)]
    pub(crate) refresh_token: Option<String>,
    #[serde(default)]
    pub(crate) expires_in: Option<i64>,
}

/// Response to a refresh token exchange
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Owns the active credential and the refresh protocol
///
/// Concurrent refreshes for the same credential owner are coalesced: one
/// caller performs the token exchange while the rest wait on a per-owner
/// lock and then reuse the stored result.
pub(crate) struct SessionManager {
    config: Arc<ClientConfig>,
    http: reqwest::Client,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionManager {
    pub(crate) fn new(config: Arc<ClientConfig>, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            refresh_locks: DashMap::new(),
        }
    }

    /// The credential for the active session
    ///
    /// A credential past its expiry hint is renewed here, before the request
    /// goes out, when a refresh token is available.
    pub(crate) async fn current_credential(&self) -> Result<Credential> {
        let credential = self
            .config
            .credential_store()
            .get()
            .await?
            .ok_or(Error::AuthenticationExpired)?;

        if credential.is_expired() && credential.can_refresh() {
            return self.refresh_after_rejection(&credential).await;
        }
        Ok(credential)
    }

    /// The id of the user owning the active session, if any
    pub(crate) async fn active_user_id(&self) -> Result<Option<String>> {
        Ok(self
            .config
            .credential_store()
            .get()
            .await?
            .map(|credential| credential.user_id))
    }

    /// Persist the session opened by a signup or login response
    pub(crate) async fn store_session(&self, session: &SessionResponse) -> Result<()> {
        let mut credential =
            Credential::new(session.user.id.clone(), session.access_token.clone());
        if let Some(refresh_token) = &session.refresh_token {
            credential = credential.with_refresh_token(refresh_token.clone());
        }
        if let Some(expires_in) = session.expires_in {
            credential = credential.with_expires_in(expires_in);
        }
        self.config.credential_store().set(credential).await?;
        Ok(())
    }

    /// Drop the active credential
    pub(crate) async fn clear(&self) -> Result<()> {
        self.config.credential_store().delete().await?;
        Ok(())
    }

    /// Replace a credential the backend rejected, coalescing concurrent
    /// refreshes per owner
    ///
    /// Waiters that arrive while a refresh is in flight block on the owner's
    /// lock; once inside they re-read the store, and a token that already
    /// changed means someone else refreshed first, so the stored result is
    /// reused without another exchange.
    pub(crate) async fn refresh_after_rejection(&self, rejected: &Credential) -> Result<Credential> {
        let lock = self
            .refresh_locks
            .entry(rejected.user_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.refresh_under_lock(rejected).await
        };
        // An entry is only needed while a refresh is in flight; the last
        // caller out removes it. Two counts are the map's own handle plus
        // `lock` above, so anything higher means a waiter is still queued.
        self.refresh_locks
            .remove_if(&rejected.user_id, |_, entry| Arc::strong_count(entry) <= 2);
        result
    }

    /// Caller must hold the owner's refresh lock
    async fn refresh_under_lock(&self, rejected: &Credential) -> Result<Credential> {
        let current = self
            .config
            .credential_store()
            .get()
            .await?
            .ok_or(Error::AuthenticationExpired)?;
        if current.access_token != rejected.access_token {
            debug!(user_id = %current.user_id, "credential already refreshed by another caller");
            return Ok(current);
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            return Err(Error::AuthenticationExpired);
        };

        debug!(user_id = %current.user_id, "refreshing rejected credential");
        let token = self.exchange_refresh_token(&refresh_token).await?;
        let renewed = renewed_credential(&current, token);
        self.config.credential_store().set(renewed.clone()).await?;
        Ok(renewed)
    }

    /// Exchange a refresh token for a new access token
    ///
    /// The exchange runs outside the regular request pipeline: it is not
    /// retried, and any failure collapses to [`Error::AuthenticationExpired`]
    /// so the caller knows to authenticate again.
    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenResponse> {
        let url = format!("{}oauth/token", self.config.base_url());
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, self.config.app_auth_header())
            .form(&form)
            .send()
            .await
            .map_err(|error| {
                warn!(%error, "token refresh exchange did not complete");
                Error::AuthenticationExpired
            })?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "token refresh rejected");
            return Err(Error::AuthenticationExpired);
        }

        response.json::<TokenResponse>().await.map_err(|error| {
            warn!(%error, "token refresh response did not parse");
            Error::AuthenticationExpired
        })
    }
}

/// Merge a token exchange result into the credential it renews
///
/// The owner stays the same. A missing refresh token in the response keeps
/// the previous one, since the backend only rotates it sometimes.
fn renewed_credential(current: &Credential, token: TokenResponse) -> Credential {
    let mut renewed = Credential::new(current.user_id.clone(), token.access_token);
    if let Some(refresh_token) = token.refresh_token.or_else(|| current.refresh_token.clone()) {
        renewed = renewed.with_refresh_token(refresh_token);
    }
    if let Some(expires_in) = token.expires_in {
        renewed = renewed.with_expires_in(expires_in);
    }
    renewed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_response_shape() {
        let body = r#"{
            "_id": "u1",
            "username": "alice",
            "email": "alice@test.com",
            "access_token": "tok-1",
            "refresh_token": "ref-1",
            "expires_in": 3600
        }"#;
        let session: SessionResponse = serde_json::from_str(body).unwrap();

        assert_eq!(session.user.id, "u1");
        assert_eq!(session.user.username, "alice");
        assert_eq!(
            session.user.attributes.get("email").unwrap(),
            &Value::String("alice@test.com".to_string())
        );
        assert_eq!(session.access_token, "tok-1");
        assert_eq!(session.refresh_token.as_deref(), Some("ref-1"));
    }

    #[test]
    fn test_renewal_keeps_previous_refresh_token() {
        let current = Credential::new("u1", "old-access").with_refresh_token("old-refresh");
        let token = TokenResponse {
            access_token: "new-access".to_string(),
            refresh_token: None,
            expires_in: Some(3600),
        };

        let renewed = renewed_credential(&current, token);
        assert_eq!(renewed.access_token, "new-access");
        assert_eq!(renewed.refresh_token.as_deref(), Some("old-refresh"));
        assert!(!renewed.is_expired());
    }

    #[test]
    fn test_renewal_adopts_rotated_refresh_token() {
        let current = Credential::new("u1", "old-access").with_refresh_token("old-refresh");
        let token = TokenResponse {
            access_token: "new-access".to_string(),
            refresh_token: Some("new-refresh".to_string()),
            expires_in: None,
        };

        let renewed = renewed_credential(&current, token);
        assert_eq!(renewed.refresh_token.as_deref(), Some("new-refresh"));
        assert!(renewed.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_refresh_lock_entries_do_not_linger() {
        let config = Arc::new(crate::config::test_config("kid", "secret"));
        let manager = SessionManager::new(config.clone(), reqwest::Client::new());

        // Another caller already refreshed, so this resolves from the store
        let stored = Credential::new("u1", "tok-2").with_refresh_token("ref-1");
        config.credential_store().set(stored).await.unwrap();
        let rejected = Credential::new("u1", "tok-1").with_refresh_token("ref-1");

        let renewed = manager.refresh_after_rejection(&rejected).await.unwrap();
        assert_eq!(renewed.access_token, "tok-2");
        assert!(manager.refresh_locks.is_empty());

        // A failed attempt does not leave an entry behind either
        config.credential_store().delete().await.unwrap();
        let result = manager.refresh_after_rejection(&rejected).await;
        assert!(matches!(result, Err(Error::AuthenticationExpired)));
        assert!(manager.refresh_locks.is_empty());
    }
}
