//! HTTP transport abstraction.
//!
//! [`ApiRequest`] is the per-call request descriptor. It is built by the
//! caller, consumed by [`Transport::send`], and never shared between calls.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::error::MtaError;

/// Body of an outgoing request.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// JSON document.
    Json(serde_json::Value),
    /// Single file sent as a `multipart/form-data` part named `file`.
    File { file_name: String, bytes: Vec<u8> },
}

/// Request descriptor exchanged between the client, the issuer and the transport.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Service base URL; `path` is appended to it. An empty `path` targets
    /// the base URL itself.
    pub base_url: Url,
    /// Path starting with `/`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl ApiRequest {
    /// Create a request with no query, headers or body.
    #[must_use]
    pub fn new(method: Method, base_url: &Url, path: impl Into<String>) -> Self {
        Self {
            method,
            base_url: base_url.clone(),
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    /// Whether the request changes server state and needs CSRF protection.
    #[must_use]
    pub fn is_mutating(&self) -> bool {
        self.method == Method::POST
    }

    /// Append a query parameter.
    #[must_use]
    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    /// Set a header.
    ///
    /// # Errors
    /// Returns error if the name or value is not a valid header.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self, MtaError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| MtaError::InvalidInput(format!("header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| MtaError::InvalidInput(format!("header '{name}' value: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Attach a JSON body.
    ///
    /// # Errors
    /// Returns error if the body cannot be serialized.
    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, MtaError> {
        self.body = RequestBody::Json(serde_json::to_value(body)?);
        Ok(self)
    }

    /// Attach a file as a multipart part.
    #[must_use]
    pub fn file(mut self, file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.body = RequestBody::File {
            file_name: file_name.into(),
            bytes,
        };
        self
    }

    /// Full URL of the request, including query parameters.
    ///
    /// # Errors
    /// Returns error if the joined URL does not parse.
    pub fn url(&self) -> Result<Url, MtaError> {
        let mut url = if self.path.is_empty() {
            self.base_url.clone()
        } else {
            let base = self.base_url.as_str().trim_end_matches('/');
            Url::parse(&format!("{base}{}", self.path))?
        };
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(self.query.iter());
        }
        Ok(url)
    }
}

/// Raw response: status, headers and body bytes.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Body as text, replacing invalid UTF-8.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Convert a non-success response into an API error.
    #[must_use]
    pub fn into_api_error(self) -> MtaError {
        let body = self.text();
        MtaError::Api {
            status: self.status.as_u16(),
            status_text: self
                .status
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
            body,
        }
    }
}

/// Issues HTTP requests.
///
/// Implementations are shared across concurrent workflows.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and return the raw response, whatever its status.
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, MtaError>;
}

/// [`Transport`] backed by a `reqwest` client.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport with the given per-request timeout.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(timeout: Duration) -> Result<Self, MtaError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client (custom TLS, proxies, auth middleware).
    #[must_use]
    pub const fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, MtaError> {
        let url = request.url()?;
        debug!(method = %request.method, url = %url, "Sending request");

        let builder = self
            .client
            .request(request.method, url)
            .headers(request.headers);

        let builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::File { file_name, bytes } => {
                let part = Part::bytes(bytes).file_name(file_name);
                builder.multipart(Form::new().part("file", part))
            }
        };

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        debug!(status = status.as_u16(), bytes = body.len(), "Received response");
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
