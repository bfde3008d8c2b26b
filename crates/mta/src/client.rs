//! Deploy service API client.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::AuthenticatedIssuer;
use crate::config::{parse_base_url, ClientConfig};
use crate::error::{MtaError, ProtocolError};
use crate::job::accepted_job_id;
use crate::models::{
    FileMetadata, FileUrl, Mta, Operation, OperationAction, OperationQuery, OperationRequest,
    UploadHandle, UploadJob,
};
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, Transport};

/// Header routing upload-job reads to the instance that owns the job.
pub const APP_INSTANCE_HEADER: &str = "x-cf-app-instance";

/// Value of the `embed` query parameter that includes the message log.
pub const EMBED_MESSAGES: &str = "messages";

/// The only content type accepted for a remote archive.
pub const ARCHIVE_CONTENT_TYPE: &str = "application/octet-stream";

/// Interpreted response of a call.
enum Reply {
    /// Accepted for asynchronous processing; carries the job or operation id.
    Accepted { id: String, headers: HeaderMap },
    /// Completed synchronously with a (possibly empty) body.
    Completed { status: StatusCode, body: Vec<u8> },
}

/// Client for the MTA deploy service.
///
/// Cheap to clone; clones share the underlying transport.
#[derive(Clone)]
pub struct MtaClient {
    issuer: AuthenticatedIssuer,
    base_url: Url,
    default_headers: HeaderMap,
    poll_interval: Duration,
}

impl MtaClient {
    /// Create a client with a `reqwest` transport.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid or the HTTP client
    /// cannot be created.
    pub fn new(config: &ClientConfig) -> Result<Self, MtaError> {
        let transport = HttpTransport::new(config.request_timeout())?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a client over an existing transport.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid.
    pub fn with_transport(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, MtaError> {
        config.validate()?;

        let mut default_headers = HeaderMap::new();
        let agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|e| MtaError::Config(format!("user agent: {e}")))?;
        default_headers.insert(USER_AGENT, agent);
        for (name, value) in &config.default_headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| MtaError::Config(format!("header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| MtaError::Config(format!("header '{name}': {e}")))?;
            default_headers.insert(header, value);
        }

        Ok(Self {
            issuer: AuthenticatedIssuer::new(transport),
            base_url: config.parsed_base_url()?,
            default_headers,
            poll_interval: config.poll_interval(),
        })
    }

    /// Point this client at a different deploy service.
    ///
    /// # Errors
    /// Returns error if the URL is blank or does not parse; the current
    /// base URL is kept in that case.
    pub fn set_base_url(&mut self, base_url: &str) -> Result<(), MtaError> {
        self.base_url = parse_base_url(base_url)?;
        Ok(())
    }

    /// Current base URL.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Configured delay between state polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn request(&self, method: Method, path: String) -> ApiRequest {
        let mut request = ApiRequest::new(method, &self.base_url, path);
        request.headers.clone_from(&self.default_headers);
        request
    }

    /// Issue a request and interpret the status code.
    async fn send(&self, request: ApiRequest) -> Result<Reply, MtaError> {
        let url = request.url()?;
        debug!(method = %request.method, url = %url, "Issuing request");

        let response = self.issuer.issue(request).await?;
        Self::handle_response(response, &url)
    }

    fn handle_response(response: ApiResponse, url: &Url) -> Result<Reply, MtaError> {
        if response.status == StatusCode::ACCEPTED {
            let id = accepted_job_id(&response, url)?;
            return Ok(Reply::Accepted {
                id,
                headers: response.headers,
            });
        }
        if response.status.is_success() {
            return Ok(Reply::Completed {
                status: response.status,
                body: response.body,
            });
        }
        Err(response.into_api_error())
    }

    /// Issue a request whose result is a JSON document.
    async fn fetch<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, MtaError> {
        match self.send(request).await? {
            Reply::Completed { body, .. } => serde_json::from_slice(&body).map_err(|e| {
                warn!(error = %e, body = %String::from_utf8_lossy(&body), "Failed to parse response");
                MtaError::Serialization(e)
            }),
            Reply::Accepted { id, .. } => Err(ProtocolError::UnexpectedAsync { id }.into()),
        }
    }

    /// Issue a request that must be accepted for asynchronous processing.
    async fn submit(&self, request: ApiRequest) -> Result<(String, HeaderMap), MtaError> {
        match self.send(request).await? {
            Reply::Accepted { id, headers } => Ok((id, headers)),
            Reply::Completed { status, .. } => Err(ProtocolError::NotAccepted {
                status: status.as_u16(),
            }
            .into()),
        }
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Start an operation. Returns the id of the new operation.
    ///
    /// # Errors
    /// Returns error if the request fails or the response carries no operation id.
    pub async fn start_operation(
        &self,
        space: &str,
        body: &OperationRequest,
    ) -> Result<String, MtaError> {
        info!(space = %space, process_type = ?body.process_type, "Starting operation");
        let request = self
            .request(Method::POST, format!("/api/v1/spaces/{space}/operations"))
            .json(body)?;
        let (operation_id, _) = self.submit(request).await?;
        info!(space = %space, operation_id = %operation_id, "Operation started");
        Ok(operation_id)
    }

    /// Fetch an operation, optionally embedding related data (e.g. `messages`).
    ///
    /// # Errors
    /// Returns error if the request fails or the body does not decode.
    pub async fn get_operation(
        &self,
        space: &str,
        operation_id: &str,
        embed: Option<&str>,
    ) -> Result<Operation, MtaError> {
        let mut request = self.request(
            Method::GET,
            format!("/api/v1/spaces/{space}/operations/{operation_id}"),
        );
        if let Some(embed) = embed {
            request = request.query("embed", embed);
        }
        self.fetch(request).await
    }

    /// List operations in a space.
    ///
    /// # Errors
    /// Returns error if the request fails or the body does not decode.
    pub async fn list_operations(
        &self,
        space: &str,
        query: &OperationQuery,
    ) -> Result<Vec<Operation>, MtaError> {
        let mut request = self.request(Method::GET, format!("/api/v1/spaces/{space}/operations"));
        if let Some(mta_id) = &query.mta_id {
            request = request.query("mtaId", mta_id.as_str());
        }
        if let Some(last) = query.last {
            request = request.query("last", last.to_string());
        }
        if !query.states.is_empty() {
            let states: Vec<&str> = query.states.iter().map(|s| s.as_str()).collect();
            request = request.query("state", states.join(","));
        }
        self.fetch(request).await
    }

    /// Execute an action on an operation.
    ///
    /// Returns the id of the operation to poll for the action's outcome.
    ///
    /// # Errors
    /// Returns error if the request fails.
    pub async fn execute_action(
        &self,
        space: &str,
        operation_id: &str,
        action: OperationAction,
    ) -> Result<String, MtaError> {
        info!(space = %space, operation_id = %operation_id, action = %action, "Executing operation action");
        let request = self
            .request(
                Method::POST,
                format!("/api/v1/spaces/{space}/operations/{operation_id}"),
            )
            .query("actionId", action.as_str());

        match self.send(request).await? {
            Reply::Accepted { id, .. } => Ok(id),
            Reply::Completed { .. } => Ok(operation_id.to_string()),
        }
    }

    // ------------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------------

    /// Upload a local archive or extension descriptor.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or the upload fails.
    pub async fn upload_file(
        &self,
        space: &str,
        path: &Path,
        namespace: &str,
    ) -> Result<FileMetadata, MtaError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                MtaError::InvalidInput(format!("no file name in path {}", path.display()))
            })?
            .to_string();
        let bytes = tokio::fs::read(path).await?;
        self.upload_bytes(space, &file_name, bytes, namespace).await
    }

    /// Upload in-memory file content.
    ///
    /// # Errors
    /// Returns error if the upload fails or the body does not decode.
    pub async fn upload_bytes(
        &self,
        space: &str,
        file_name: &str,
        bytes: Vec<u8>,
        namespace: &str,
    ) -> Result<FileMetadata, MtaError> {
        if bytes.is_empty() {
            return Err(MtaError::InvalidInput(format!("{file_name} is empty")));
        }
        info!(space = %space, file = %file_name, size = bytes.len(), "Uploading file");

        let mut request = self
            .request(Method::POST, format!("/api/v1/spaces/{space}/files"))
            .file(file_name, bytes);
        if !namespace.is_empty() {
            request = request.query("namespace", namespace);
        }
        let file: FileMetadata = self.fetch(request).await?;
        info!(space = %space, file_id = %file.id, "File uploaded");
        Ok(file)
    }

    /// Start an asynchronous upload of an archive from a remote URL.
    ///
    /// # Errors
    /// Returns error if the URL is empty, the request fails, or the response
    /// carries no job id.
    pub async fn upload_from_url(
        &self,
        space: &str,
        file_url: &str,
        namespace: &str,
    ) -> Result<UploadHandle, MtaError> {
        if file_url.trim().is_empty() {
            return Err(MtaError::InvalidInput(
                "file URL required for uploading".to_string(),
            ));
        }
        info!(space = %space, "Starting upload from URL");

        let mut request = self
            .request(Method::POST, format!("/api/v1/spaces/{space}/files/async"))
            .json(&FileUrl {
                file_url: URL_SAFE.encode(file_url),
            })?;
        if !namespace.is_empty() {
            request = request.query("namespace", namespace);
        }

        let (job_id, headers) = self.submit(request).await?;
        let app_instance = headers
            .get(APP_INSTANCE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        info!(space = %space, job_id = %job_id, app_instance = ?app_instance, "Upload job started");

        Ok(UploadHandle {
            job_id,
            app_instance,
        })
    }

    /// Fetch the state of an upload-from-URL job.
    ///
    /// # Errors
    /// Returns error if the request fails or the body does not decode.
    pub async fn get_upload_job(
        &self,
        space: &str,
        handle: &UploadHandle,
        namespace: &str,
    ) -> Result<UploadJob, MtaError> {
        let mut request = self.request(
            Method::GET,
            format!("/api/v1/spaces/{space}/files/jobs/{}", handle.job_id),
        );
        if let Some(instance) = &handle.app_instance {
            request = request.header(APP_INSTANCE_HEADER, instance)?;
        }
        if !namespace.is_empty() {
            request = request.query("namespace", namespace);
        }
        self.fetch(request).await
    }

    /// SHA-256 of an archive hosted at a remote URL, hex encoded.
    ///
    /// The URL is checked with a HEAD request before the archive is
    /// downloaded. Only the user agent is sent: the archive host is not the
    /// deploy service and must not see its credentials. Comparing hashes
    /// tells whether an archive deployed from a URL has changed.
    ///
    /// # Errors
    /// Returns error if the URL does not parse, either request fails or is
    /// answered with a non-success status, or the download is not served as
    /// `application/octet-stream`.
    pub async fn remote_archive_hash(&self, archive_url: &str) -> Result<String, MtaError> {
        let url = Url::parse(archive_url.trim())
            .map_err(|e| MtaError::InvalidInput(format!("archive URL '{archive_url}': {e}")))?;

        debug!(url = %url, "Checking archive URL");
        let response = self.issuer.issue(self.remote_request(Method::HEAD, &url)).await?;
        if !response.status.is_success() {
            return Err(response.into_api_error());
        }

        debug!(url = %url, "Downloading archive");
        let response = self.issuer.issue(self.remote_request(Method::GET, &url)).await?;
        if !response.status.is_success() {
            return Err(response.into_api_error());
        }

        let content_type = response
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let media_type = content_type.split(';').next().unwrap_or_default().trim();
        if !media_type.eq_ignore_ascii_case(ARCHIVE_CONTENT_TYPE) {
            return Err(MtaError::InvalidContentType {
                url: url.to_string(),
                content_type: content_type.to_string(),
            });
        }

        let hash = hex::encode(Sha256::digest(&response.body));
        info!(url = %url, size = response.body.len(), sha256 = %hash, "Hashed remote archive");
        Ok(hash)
    }

    fn remote_request(&self, method: Method, url: &Url) -> ApiRequest {
        let mut request = ApiRequest::new(method, url, "");
        if let Some(agent) = self.default_headers.get(USER_AGENT) {
            request.headers.insert(USER_AGENT, agent.clone());
        }
        request
    }

    // ------------------------------------------------------------------------
    // MTAs
    // ------------------------------------------------------------------------

    /// Fetch the single MTA with the given id and namespace.
    ///
    /// # Errors
    /// Returns [`MtaError::MtaNotFound`] unless exactly one MTA matches.
    pub async fn get_mta(&self, space: &str, mta_id: &str, namespace: &str) -> Result<Mta, MtaError> {
        let request = self
            .request(Method::GET, format!("/api/v2/spaces/{space}/mtas"))
            .query("name", mta_id)
            .query("namespace", namespace);
        let mut mtas: Vec<Mta> = self.fetch(request).await?;

        if mtas.len() == 1 {
            return Ok(mtas.remove(0));
        }
        Err(MtaError::MtaNotFound {
            mta_id: mta_id.to_string(),
            namespace: namespace.to_string(),
            matches: mtas.len(),
        })
    }

    /// List MTAs in a space, optionally filtered by name and namespace.
    ///
    /// # Errors
    /// Returns error if the request fails or the body does not decode.
    pub async fn get_mtas(
        &self,
        space: &str,
        name: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<Vec<Mta>, MtaError> {
        let mut request = self.request(Method::GET, format!("/api/v2/spaces/{space}/mtas"));
        if let Some(namespace) = namespace {
            request = request.query("namespace", namespace);
        }
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            request = request.query("name", name);
        }
        self.fetch(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use serde_json::json;

    fn client(transport: &Arc<ScriptedTransport>) -> MtaClient {
        let config = ClientConfig::new("https://deploy.example.com");
        MtaClient::with_transport(&config, transport.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_get_mta_requires_exactly_one_match() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(&json!([]));
        let err = client(&transport)
            .get_mta("s1", "com.example.app", "")
            .await
            .unwrap_err();
        assert!(matches!(err, MtaError::MtaNotFound { matches: 0, .. }));

        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(&json!([
            {"metadata": {"id": "com.example.app"}},
            {"metadata": {"id": "com.example.app"}}
        ]));
        let err = client(&transport)
            .get_mta("s1", "com.example.app", "")
            .await
            .unwrap_err();
        assert!(matches!(err, MtaError::MtaNotFound { matches: 2, .. }));
    }

    #[tokio::test]
    async fn test_list_operations_query() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(&json!([]));
        client(&transport)
            .list_operations("s1", &OperationQuery::active_for("com.example.app"))
            .await
            .unwrap();

        let sent = transport.requests();
        let url = sent[0].url().unwrap();
        assert_eq!(
            url.query(),
            Some("mtaId=com.example.app&state=RUNNING%2CERROR%2CACTION_REQUIRED")
        );
    }

    #[tokio::test]
    async fn test_default_headers_on_every_request() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(&json!([]));
        let config = ClientConfig::new("https://deploy.example.com")
            .with_default_header("authorization", "Bearer abc");
        let client = MtaClient::with_transport(&config, transport.clone()).unwrap();
        client.get_mtas("s1", None, None).await.unwrap();

        let sent = transport.requests();
        assert_eq!(sent[0].headers["authorization"], "Bearer abc");
        assert!(sent[0].headers[USER_AGENT]
            .to_str()
            .unwrap()
            .starts_with("mta/"));
    }

    #[tokio::test]
    async fn test_start_operation_requires_accepted() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_token();
        transport.push_json(&json!({}));
        let err = client(&transport)
            .start_operation("s1", &OperationRequest::undeploy("com.example.app", ""))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MtaError::Protocol(ProtocolError::NotAccepted { status: 200 })
        ));
    }

    #[tokio::test]
    async fn test_upload_from_url_encodes_body() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_token();
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::LOCATION,
            HeaderValue::from_static("/api/v1/spaces/s1/files/jobs/J1"),
        );
        headers.insert(APP_INSTANCE_HEADER, HeaderValue::from_static("guid:3"));
        transport.push(StatusCode::ACCEPTED, headers, "");

        let handle = client(&transport)
            .upload_from_url("s1", "https://repo.example.com/app.mtar", "")
            .await
            .unwrap();

        assert_eq!(handle.job_id, "J1");
        assert_eq!(handle.app_instance.as_deref(), Some("guid:3"));
        let sent = transport.requests();
        match &sent[1].body {
            crate::transport::RequestBody::Json(body) => {
                assert_eq!(
                    body["file_url"],
                    URL_SAFE.encode("https://repo.example.com/app.mtar")
                );
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_set_base_url_retargets_requests() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(&json!([]));
        let mut client = client(&transport);

        assert!(client.set_base_url("   ").is_err());
        assert!(client.set_base_url("not a url").is_err());
        assert_eq!(client.base_url().as_str(), "https://deploy.example.com/");

        client
            .set_base_url("  https://deploy.eu10.example.com/  ")
            .unwrap();
        client.get_mtas("s1", None, None).await.unwrap();

        let url = transport.requests()[0].url().unwrap();
        assert_eq!(url.as_str(), "https://deploy.eu10.example.com/api/v2/spaces/s1/mtas");
    }

    #[tokio::test]
    async fn test_remote_archive_hash_keeps_credentials_private() {
        let transport = Arc::new(ScriptedTransport::new());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(ARCHIVE_CONTENT_TYPE));
        transport.push(StatusCode::OK, headers, "abc");
        let config = ClientConfig::new("https://deploy.example.com")
            .with_default_header("authorization", "Bearer abc");
        let client = MtaClient::with_transport(&config, transport.clone()).unwrap();

        let hash = client
            .remote_archive_hash("https://repo.example.com/releases/app.mtar?v=2")
            .await
            .unwrap();

        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].method, Method::HEAD);
        assert_eq!(sent[1].method, Method::GET);
        assert_eq!(
            sent[1].url().unwrap().as_str(),
            "https://repo.example.com/releases/app.mtar?v=2"
        );
        assert!(sent.iter().all(|r| !r.headers.contains_key("authorization")));
        assert!(sent[1].headers.contains_key(USER_AGENT));
    }

    #[tokio::test]
    async fn test_upload_rejects_empty_input() {
        let transport = Arc::new(ScriptedTransport::new());
        let client = client(&transport);
        assert!(matches!(
            client.upload_from_url("s1", "  ", "").await,
            Err(MtaError::InvalidInput(_))
        ));
        assert!(matches!(
            client.upload_bytes("s1", "ext.mtaext", Vec::new(), "").await,
            Err(MtaError::InvalidInput(_))
        ));
        assert!(transport.requests().is_empty());
    }
}
