//! In-memory transport for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, LOCATION};
use reqwest::StatusCode;

use crate::auth::CSRF_TOKEN_HEADER;
use crate::error::MtaError;
use crate::transport::{ApiRequest, ApiResponse, Transport};

/// Replays queued responses in order and records every request.
///
/// The last queued response is repeated once the queue would otherwise be empty.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<ApiResponse>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, status: StatusCode, headers: HeaderMap, body: &str) {
        self.responses.lock().unwrap().push_back(ApiResponse {
            status,
            headers,
            body: body.as_bytes().to_vec(),
        });
    }

    pub fn push_json(&self, body: &serde_json::Value) {
        self.push(StatusCode::OK, HeaderMap::new(), &body.to_string());
    }

    pub fn push_token(&self) {
        let mut headers = HeaderMap::new();
        headers.insert(CSRF_TOKEN_HEADER, HeaderValue::from_static("tok"));
        headers.append("set-cookie", HeaderValue::from_static("JSESSIONID=s1; Path=/"));
        headers.append("set-cookie", HeaderValue::from_static("__VCAP_ID__=v1; Path=/"));
        self.push(StatusCode::OK, headers, "");
    }

    pub fn push_accepted(&self, location: &str) {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_str(location).unwrap());
        self.push(StatusCode::ACCEPTED, headers, "");
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|r| format!("{} {}", r.method, r.path))
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, MtaError> {
        self.requests.lock().unwrap().push(request);
        let mut responses = self.responses.lock().unwrap();
        let response = if responses.len() > 1 {
            responses.pop_front()
        } else {
            responses.front().cloned()
        };
        response.ok_or_else(|| MtaError::InvalidInput("no scripted response".to_string()))
    }
}
