//! Main client implementation

use std::sync::Arc;

use reqwest::{header, redirect, Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use kinvey_store::{Credential, OfflineStore};

use crate::auth::{SessionManager, SessionResponse, User};
use crate::config::{backoff_delay, ClientBuilder, ClientConfig};
use crate::data::DataStore;
use crate::error::{classify_response, Error, Result};
use crate::files::FileStore;
use crate::request::{AuthContext, RequestBuilder, RequestDescriptor};

/// Backend greeting returned by [`Kinvey::ping`]
#[derive(Debug, Deserialize)]
pub struct PingResponse {
    /// Backend version string
    #[serde(default)]
    pub version: Option<String>,
    /// Greeting naming the application the key resolves to
    #[serde(default)]
    pub kinvey: Option<String>,
}

/// Kinvey client
///
/// The entry point for everything: sessions, app data collections, and file
/// transfer. Cheap to clone; clones share the configuration, the HTTP
/// connection pool, and the active session.
#[derive(Clone)]
pub struct Kinvey {
    config: Arc<ClientConfig>,
    http: Client,
    transfer_http: Client,
    session: Arc<SessionManager>,
}

impl Kinvey {
    /// Start building a client for an application
    pub fn builder(app_key: impl Into<String>, app_secret: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(app_key, app_secret)
    }

    pub(crate) fn from_config(config: ClientConfig) -> Result<Self> {
        let config = Arc::new(config);
        let user_agent = format!("kinvey-client/{}", env!("CARGO_PKG_VERSION"));

        let http = Client::builder()
            .timeout(config.timeout())
            .user_agent(user_agent.as_str())
            .build()?;
        // Transfer exchanges speak the 308 resume protocol themselves, so
        // that status must reach the engine instead of the redirect layer
        let transfer_http = Client::builder()
            .timeout(config.timeout())
            .user_agent(user_agent.as_str())
            .redirect(redirect::Policy::none())
            .build()?;

        let session = Arc::new(SessionManager::new(config.clone(), http.clone()));
        Ok(Self {
            config,
            http,
            transfer_http,
            session,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn offline_store(&self) -> &Arc<dyn OfflineStore> {
        self.config.offline_store()
    }

    pub(crate) fn transfer_http(&self) -> &Client {
        &self.transfer_http
    }

    // ==================== Session Operations ====================

    /// Create a user and open a session for it
    #[instrument(skip(self, password))]
    pub async fn signup(&self, username: &str, password: &str) -> Result<User> {
        let body = serde_json::json!({ "username": username, "password": password });
        let descriptor = RequestBuilder::new(&self.config, Method::POST, "user/{appKey}")
            .auth(AuthContext::App)
            .json(&body)?
            .build()?;
        let session: SessionResponse = self.execute_json(descriptor).await?;
        self.session.store_session(&session).await?;
        Ok(session.user)
    }

    /// Open a session for an existing user
    #[instrument(skip(self, password))]
    pub async fn login(&self, username: &str, password: &str) -> Result<User> {
        let body = serde_json::json!({ "username": username, "password": password });
        let descriptor = RequestBuilder::new(&self.config, Method::POST, "user/{appKey}/login")
            .auth(AuthContext::App)
            .json(&body)?
            .build()?;
        let session: SessionResponse = self.execute_json(descriptor).await?;
        self.session.store_session(&session).await?;
        Ok(session.user)
    }

    /// End the active session and drop the stored credential
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<()> {
        let descriptor =
            RequestBuilder::new(&self.config, Method::POST, "user/{appKey}/_logout").build()?;
        match self.execute(descriptor).await {
            Ok(_) => {}
            // A session the backend no longer recognizes is already logged out
            Err(error) if error.is_authentication() => {}
            Err(error) => return Err(error),
        }
        self.session.clear().await
    }

    /// The id of the user owning the active session, if any
    pub async fn active_user_id(&self) -> Result<Option<String>> {
        self.session.active_user_id().await
    }

    // ==================== Service Handles ====================

    /// Typed handle over an app data collection
    pub fn data_store<T>(&self, collection: impl Into<String>) -> DataStore<T>
    where
        T: serde::Serialize + DeserializeOwned,
    {
        DataStore::new(self.clone(), collection.into())
    }

    /// Handle over the blob/file service
    pub fn file_store(&self) -> FileStore {
        FileStore::new(self.clone())
    }

    // ==================== Diagnostics ====================

    /// Check connectivity and app credentials against the backend
    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<PingResponse> {
        let descriptor = RequestBuilder::new(&self.config, Method::GET, "appdata/{appKey}")
            .auth(AuthContext::App)
            .build()?;
        self.execute_json(descriptor).await
    }

    // ==================== Transport ====================

    /// Execute a descriptor and return the raw response
    ///
    /// Session requests that come back 401 trigger one coalesced credential
    /// refresh followed by a single replay; a second rejection, or a refresh
    /// that fails, surfaces [`Error::AuthenticationExpired`].
    pub(crate) async fn execute(&self, descriptor: RequestDescriptor) -> Result<Response> {
        match descriptor.auth {
            AuthContext::Session => {
                let credential = self.session.current_credential().await?;
                match self.send_with_retries(&descriptor, Some(&credential)).await {
                    Err(error) if is_unauthorized(&error) => {
                        debug!(path = %descriptor.path, "session rejected, refreshing and replaying once");
                        let renewed = self.session.refresh_after_rejection(&credential).await?;
                        self.send_with_retries(&descriptor, Some(&renewed))
                            .await
                            .map_err(|error| {
                                if is_unauthorized(&error) {
                                    Error::AuthenticationExpired
                                } else {
                                    error
                                }
                            })
                    }
                    other => other,
                }
            }
            _ => self.send_with_retries(&descriptor, None).await,
        }
    }

    /// Execute a descriptor and decode the JSON response body
    pub(crate) async fn execute_json<T: DeserializeOwned>(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<T> {
        let response = self.execute(descriptor).await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Send with a bounded retry budget
    ///
    /// Transport failures always qualify for a retry; backend 5xx failures
    /// qualify only when the verb is idempotent. Everything else surfaces
    /// immediately.
    async fn send_with_retries(
        &self,
        descriptor: &RequestDescriptor,
        credential: Option<&Credential>,
    ) -> Result<Response> {
        let url = format!("{}{}", self.config.base_url(), descriptor.path);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(descriptor, &url, credential).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    if !error.is_retryable_for(&descriptor.method)
                        || attempt >= self.config.max_attempts()
                    {
                        return Err(error);
                    }
                    let delay = backoff_delay(self.config.retry_backoff(), attempt);
                    warn!(
                        method = %descriptor.method,
                        path = %descriptor.path,
                        attempt,
                        %error,
                        "request failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One wire exchange: assemble, send, classify
    async fn send_once(
        &self,
        descriptor: &RequestDescriptor,
        url: &str,
        credential: Option<&Credential>,
    ) -> Result<Response> {
        let mut request = self.http.request(descriptor.method.clone(), url);
        if !descriptor.query.is_empty() {
            request = request.query(&descriptor.query);
        }
        for (name, value) in &descriptor.headers {
            request = request.header(name, value);
        }
        request = match descriptor.auth {
            AuthContext::None => request,
            AuthContext::App => {
                request.header(header::AUTHORIZATION, self.config.app_auth_header())
            }
            AuthContext::Session => {
                let credential = credential.ok_or(Error::AuthenticationExpired)?;
                request.bearer_auth(&credential.access_token)
            }
        };
        if let Some(body) = &descriptor.body {
            request = request.body(body.clone());
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            debug!(method = %descriptor.method, path = %descriptor.path, status = status.as_u16(), "request ok");
            return Ok(response);
        }
        Err(classify_response(response).await)
    }
}

fn is_unauthorized(error: &Error) -> bool {
    matches!(error, Error::Client { status: 401, .. })
}
