//! CSRF-protected request issuing.
//!
//! Every mutating request is preceded by a GET to the token endpoint. The
//! token header and the session cookies from that response are attached to
//! the mutating request. Tokens are never cached: each mutating call pays
//! two round-trips.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE, SET_COOKIE};
use reqwest::Method;
use tracing::debug;

use crate::error::{MtaError, ProtocolError};
use crate::transport::{ApiRequest, ApiResponse, Transport};

/// Path of the token endpoint.
pub const CSRF_TOKEN_PATH: &str = "/api/v1/csrf-token";

/// Header carrying the CSRF token in both directions.
pub const CSRF_TOKEN_HEADER: &str = "x-csrf-token";

/// The token endpoint sets a session cookie and an instance-affinity cookie.
const REQUIRED_SESSION_COOKIES: usize = 2;

/// Token and cookie header taken from one token-endpoint response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfCredentials {
    pub token: String,
    /// Reconstructed `Cookie` header value (`a=1; b=2`).
    pub cookie: String,
}

impl CsrfCredentials {
    /// Extract the token header and session cookies from a token response.
    ///
    /// # Errors
    /// Returns a protocol error if the token header or the session cookies
    /// are missing.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ProtocolError> {
        let token = headers
            .get(CSRF_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ProtocolError::MissingCsrfToken)?
            .to_string();

        let cookies: Vec<&str> = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(str::trim)
            .filter(|pair| pair.split_once('=').is_some_and(|(name, _)| !name.is_empty()))
            .collect();

        if cookies.len() < REQUIRED_SESSION_COOKIES {
            return Err(ProtocolError::MissingSessionCookies {
                found: cookies.len(),
            });
        }

        Ok(Self {
            token,
            cookie: cookies.join("; "),
        })
    }

    /// Add the token and cookie headers to an outgoing request.
    ///
    /// # Errors
    /// Returns error if either value is not a valid header value.
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<(), MtaError> {
        let token = HeaderValue::from_str(&self.token).map_err(|_| {
            ProtocolError::MalformedCredentials {
                header: CSRF_TOKEN_HEADER.to_string(),
            }
        })?;
        let cookie = HeaderValue::from_str(&self.cookie).map_err(|_| {
            ProtocolError::MalformedCredentials {
                header: COOKIE.to_string(),
            }
        })?;
        headers.insert(HeaderName::from_static(CSRF_TOKEN_HEADER), token);
        headers.insert(COOKIE, cookie);
        Ok(())
    }
}

/// Wraps a [`Transport`] and authenticates mutating requests.
#[derive(Clone)]
pub struct AuthenticatedIssuer {
    transport: Arc<dyn Transport>,
}

impl AuthenticatedIssuer {
    /// Create an issuer over a shared transport.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Issue a request, fetching a fresh CSRF token first if it is mutating.
    ///
    /// Non-success responses of the request itself are returned as-is; only
    /// a failed token fetch is turned into an error here.
    ///
    /// # Errors
    /// Returns error if the token fetch fails, its response lacks the token
    /// or cookies, or the transport fails.
    pub async fn issue(&self, mut request: ApiRequest) -> Result<ApiResponse, MtaError> {
        if request.is_mutating() {
            let credentials = self.fetch_credentials(&request).await?;
            credentials.apply(&mut request.headers)?;
        }
        self.transport.send(request).await
    }

    /// Fetch a CSRF token for a request, reusing its base URL and static headers.
    async fn fetch_credentials(&self, request: &ApiRequest) -> Result<CsrfCredentials, MtaError> {
        let mut token_request = ApiRequest::new(Method::GET, &request.base_url, CSRF_TOKEN_PATH);
        token_request.headers.clone_from(&request.headers);

        debug!(path = %request.path, "Fetching CSRF token");
        let response = self.transport.send(token_request).await?;
        if !response.status.is_success() {
            return Err(response.into_api_error());
        }
        Ok(CsrfCredentials::from_headers(&response.headers)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use reqwest::StatusCode;
    use url::Url;

    fn token_headers(cookies: &[&str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CSRF_TOKEN_HEADER, HeaderValue::from_static("tok-1"));
        for cookie in cookies {
            headers.append(SET_COOKIE, HeaderValue::from_str(cookie).unwrap());
        }
        headers
    }

    #[test]
    fn test_cookie_reconstruction() {
        let headers = token_headers(&[
            "JSESSIONID=abc123; Path=/; Secure; HttpOnly",
            "__VCAP_ID__=vcap-9; Path=/; HttpOnly",
        ]);
        let creds = CsrfCredentials::from_headers(&headers).unwrap();
        assert_eq!(creds.token, "tok-1");
        assert_eq!(creds.cookie, "JSESSIONID=abc123; __VCAP_ID__=vcap-9");
    }

    #[test]
    fn test_missing_token_is_protocol_error() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        assert_eq!(
            CsrfCredentials::from_headers(&headers),
            Err(ProtocolError::MissingCsrfToken)
        );
    }

    #[test]
    fn test_missing_cookies_is_protocol_error() {
        let headers = token_headers(&["JSESSIONID=abc123; Path=/"]);
        assert_eq!(
            CsrfCredentials::from_headers(&headers),
            Err(ProtocolError::MissingSessionCookies { found: 1 })
        );
    }

    #[test]
    fn test_unsendable_credentials_are_named() {
        let creds = CsrfCredentials {
            token: "tok\n1".to_string(),
            cookie: "a=1; b=2".to_string(),
        };
        let err = creds.apply(&mut HeaderMap::new()).unwrap_err();
        assert!(matches!(
            err,
            MtaError::Protocol(ProtocolError::MalformedCredentials { ref header })
                if header == CSRF_TOKEN_HEADER
        ));

        let creds = CsrfCredentials {
            token: "tok-1".to_string(),
            cookie: "a=1\r\nb=2".to_string(),
        };
        let err = creds.apply(&mut HeaderMap::new()).unwrap_err();
        assert!(matches!(
            err,
            MtaError::Protocol(ProtocolError::MalformedCredentials { ref header })
                if header == "cookie"
        ));
    }

    #[tokio::test]
    async fn test_get_skips_token_fetch() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(StatusCode::OK, HeaderMap::new(), "[]");
        let issuer = AuthenticatedIssuer::new(transport.clone());

        let base = Url::parse("https://deploy.example.com").unwrap();
        let response = issuer
            .issue(ApiRequest::new(Method::GET, &base, "/api/v2/spaces/s/mtas"))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].path, "/api/v2/spaces/s/mtas");
    }

    #[tokio::test]
    async fn test_post_carries_fresh_token_and_cookies() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(
            StatusCode::OK,
            token_headers(&["JSESSIONID=abc; Path=/", "__VCAP_ID__=v1"]),
            "",
        );
        transport.push(StatusCode::NO_CONTENT, HeaderMap::new(), "");
        let issuer = AuthenticatedIssuer::new(transport.clone());

        let base = Url::parse("https://deploy.example.com").unwrap();
        issuer
            .issue(ApiRequest::new(Method::POST, &base, "/api/v1/spaces/s/operations"))
            .await
            .unwrap();

        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].method, Method::GET);
        assert_eq!(sent[0].path, CSRF_TOKEN_PATH);
        assert_eq!(sent[1].method, Method::POST);
        assert_eq!(sent[1].headers[CSRF_TOKEN_HEADER], "tok-1");
        assert_eq!(sent[1].headers[COOKIE], "JSESSIONID=abc; __VCAP_ID__=v1");
    }

    #[tokio::test]
    async fn test_failed_token_fetch_blocks_mutating_call() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(StatusCode::UNAUTHORIZED, HeaderMap::new(), "no session");
        let issuer = AuthenticatedIssuer::new(transport.clone());

        let base = Url::parse("https://deploy.example.com").unwrap();
        let err = issuer
            .issue(ApiRequest::new(Method::POST, &base, "/api/v1/spaces/s/operations"))
            .await
            .unwrap_err();

        assert!(matches!(err, MtaError::Api { status: 401, .. }));
        assert_eq!(transport.requests().len(), 1);
    }
}
