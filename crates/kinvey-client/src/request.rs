//! Request descriptors and the builder that produces them

use std::collections::HashMap;

use bytes::Bytes;
use reqwest::Method;
use serde::Serialize;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::template::resolve_template;

/// Protocol version reported to the backend with every request
pub const API_VERSION: &str = "5";

/// Header naming the protocol version in use
pub const API_VERSION_HEADER: &str = "X-Kinvey-API-Version";

/// Header describing the calling platform and SDK build
pub const DEVICE_INFO_HEADER: &str = "X-Kinvey-Device-Info";

/// How a request authenticates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthContext {
    /// No Authorization header
    None,
    /// Basic auth with the application key and secret
    App,
    /// Bearer auth with the active session's access token
    Session,
}

/// A fully assembled request, ready for the transport
///
/// Carries the resolved path rather than the template: placeholder values are
/// consumed during construction and never persisted.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    pub method: Method,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub auth: AuthContext,
}

/// Builder assembling a [`RequestDescriptor`] from a path template
///
/// Performs no network IO. The application key is pre-bound as `{appKey}`
/// since every endpoint path carries it; callers bind the rest.
pub struct RequestBuilder<'a> {
    config: &'a ClientConfig,
    method: Method,
    template: &'a str,
    params: HashMap<String, String>,
    query: Vec<(String, String)>,
    headers: HashMap<String, String>,
    body: Option<Bytes>,
    content_type: &'static str,
    auth: AuthContext,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(config: &'a ClientConfig, method: Method, template: &'a str) -> Self {
        let mut params = HashMap::new();
        params.insert("appKey".to_string(), config.app_key().to_string());
        Self {
            config,
            method,
            template,
            params,
            query: Vec::new(),
            headers: HashMap::new(),
            body: None,
            content_type: "application/json",
            auth: AuthContext::Session,
        }
    }

    /// Select the authentication context, session auth being the default
    pub fn auth(mut self, auth: AuthContext) -> Self {
        self.auth = auth;
        self
    }

    /// Bind a value for a `{name}` placeholder in the path template
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Append a query string pair
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Append several query string pairs
    pub fn query_pairs(mut self, pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.query.extend(pairs);
        self
    }

    /// Set a request header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Attach a JSON body
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.body = Some(Bytes::from(serde_json::to_vec(body)?));
        self.content_type = "application/json";
        Ok(self)
    }

    /// Attach a raw binary body
    pub fn bytes(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self.content_type = "application/octet-stream";
        self
    }

    /// Resolve the path template and produce the descriptor
    ///
    /// Fails with [`crate::Error::InvalidTemplateBinding`] when a placeholder
    /// in the template has no bound value.
    pub fn build(self) -> Result<RequestDescriptor> {
        let path = resolve_template(self.template, &self.params)
            .map_err(|error| error.into_template_binding())?;

        let mut headers = self.headers;
        headers.insert("Content-Type".to_string(), self.content_type.to_string());
        headers.insert(API_VERSION_HEADER.to_string(), API_VERSION.to_string());
        headers.insert(DEVICE_INFO_HEADER.to_string(), self.config.device_info());

        Ok(RequestDescriptor {
            method: self.method,
            path,
            headers,
            query: self.query,
            body: self.body,
            auth: self.auth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn config() -> ClientConfig {
        crate::config::test_config("kid_test", "secret")
    }

    #[test]
    fn test_descriptor_carries_protocol_headers() {
        let config = config();
        let descriptor = RequestBuilder::new(&config, Method::GET, "appdata/{appKey}")
            .auth(AuthContext::App)
            .build()
            .unwrap();

        assert_eq!(descriptor.path, "appdata/kid_test");
        assert_eq!(descriptor.headers.get(API_VERSION_HEADER).unwrap(), API_VERSION);
        assert!(descriptor.headers.contains_key(DEVICE_INFO_HEADER));
        assert_eq!(
            descriptor.headers.get("Content-Type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_json_body_is_serialized_once() {
        let config = config();
        let body = serde_json::json!({"username": "alice"});
        let descriptor = RequestBuilder::new(&config, Method::POST, "user/{appKey}/login")
            .json(&body)
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(descriptor.body.unwrap(), Bytes::from(r#"{"username":"alice"}"#));
    }

    #[test]
    fn test_binary_body_switches_content_type() {
        let config = config();
        let descriptor = RequestBuilder::new(&config, Method::PUT, "blob/{appKey}/data")
            .bytes(Bytes::from_static(b"\x00\x01"))
            .build()
            .unwrap();

        assert_eq!(
            descriptor.headers.get("Content-Type").unwrap(),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_unbound_placeholder_fails_the_build() {
        let config = config();
        let error = RequestBuilder::new(&config, Method::GET, "appdata/{appKey}/{collection}")
            .build()
            .unwrap_err();

        match error {
            Error::InvalidTemplateBinding { name, .. } => assert_eq!(name, "collection"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_placeholder_values_never_outlive_the_build() {
        let config = config();
        let descriptor = RequestBuilder::new(&config, Method::GET, "appdata/{appKey}/{collection}")
            .param("collection", "notes")
            .query("limit", "10")
            .build()
            .unwrap();

        assert_eq!(descriptor.path, "appdata/kid_test/notes");
        assert_eq!(descriptor.query, vec![("limit".to_string(), "10".to_string())]);
    }
}
