//! Decoding of asynchronous job handles.
//!
//! A call accepted for asynchronous processing answers `202 Accepted` with a
//! `Location` header such as `/api/v1/spaces/{space}/operations/{id}` or
//! `/api/v1/spaces/{space}/files/jobs/{id}`. The last path segment is the
//! handle to poll.

use reqwest::header::{HeaderMap, LOCATION};
use reqwest::StatusCode;
use url::Url;

use crate::error::{MtaError, ProtocolError};
use crate::transport::ApiResponse;

/// Path segments that precede a pollable id.
const JOB_COLLECTIONS: [&str; 2] = ["operations", "jobs"];

/// Extract the job or operation id from a `Location` header value.
///
/// Relative locations are resolved against `request_url`.
///
/// # Errors
/// - [`ProtocolError::MissingLocation`] when there is no header.
/// - [`ProtocolError::MalformedLocation`] when it does not parse as a URL.
/// - [`ProtocolError::NoJobId`] when the path does not end in
///   `operations/{id}` or `jobs/{id}`.
pub fn decode_job_id(location: Option<&str>, request_url: &Url) -> Result<String, ProtocolError> {
    let value = location.ok_or(ProtocolError::MissingLocation)?;
    let url = request_url
        .join(value.trim())
        .map_err(|_| ProtocolError::MalformedLocation {
            value: value.to_string(),
        })?;
    job_id_from_path(url.path())
}

fn job_id_from_path(path: &str) -> Result<String, ProtocolError> {
    let segments: Vec<&str> = path.split('/').collect();
    match segments.as_slice() {
        [.., collection, id] if JOB_COLLECTIONS.contains(collection) && !id.is_empty() => {
            Ok((*id).to_string())
        }
        _ => Err(ProtocolError::NoJobId {
            path: path.to_string(),
        }),
    }
}

/// Read the `Location` header, if present.
fn location_header(headers: &HeaderMap) -> Result<Option<&str>, ProtocolError> {
    headers
        .get(LOCATION)
        .map(|value| {
            value.to_str().map_err(|_| ProtocolError::MalformedLocation {
                value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            })
        })
        .transpose()
}

/// Decode the handle of an accepted response.
///
/// # Errors
/// Returns a protocol error if the response is not `202 Accepted` or its
/// `Location` header does not carry an id.
pub fn accepted_job_id(response: &ApiResponse, request_url: &Url) -> Result<String, MtaError> {
    if response.status != StatusCode::ACCEPTED {
        return Err(ProtocolError::NotAccepted {
            status: response.status.as_u16(),
        }
        .into());
    }
    let location = location_header(&response.headers)?;
    Ok(decode_job_id(location, request_url)?)
}
