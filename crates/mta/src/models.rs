//! Deploy service request and response models.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Operations
// ============================================================================

/// State of an operation as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    /// Operation is executing.
    Running,
    /// Operation failed. It may still hold its lock.
    Error,
    /// Operation is paused waiting for user input.
    ActionRequired,
    /// Operation completed successfully.
    Finished,
    /// Operation was aborted.
    Aborted,
}

impl OperationState {
    /// States in which an operation may still hold the MTA lock.
    pub const ACTIVE: [Self; 3] = [Self::Running, Self::Error, Self::ActionRequired];

    /// Wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Error => "ERROR",
            Self::ActionRequired => "ACTION_REQUIRED",
            Self::Finished => "FINISHED",
            Self::Aborted => "ABORTED",
        }
    }

    /// Whether the operation may still hold the MTA lock.
    #[must_use]
    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(Self::Running),
            "ERROR" => Ok(Self::Error),
            "ACTION_REQUIRED" => Ok(Self::ActionRequired),
            "FINISHED" => Ok(Self::Finished),
            "ABORTED" => Ok(Self::Aborted),
            other => Err(format!("unknown operation state '{other}'")),
        }
    }
}

/// Kind of lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessType {
    /// Deploy or update an MTA.
    Deploy,
    /// Blue-green deploy of an MTA.
    BlueGreenDeploy,
    /// Remove an MTA.
    Undeploy,
    /// Any process type this client does not start itself.
    #[serde(other)]
    Other,
}

/// Action that can be executed on a running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationAction {
    Abort,
    Retry,
    Resume,
}

impl OperationAction {
    /// Value of the `actionId` query parameter.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Retry => "retry",
            Self::Resume => "resume",
        }
    }
}

impl fmt::Display for OperationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of an operation's message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Message type (`INFO`, `WARNING`, `ERROR`, ...).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Snapshot of a lifecycle operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Process identifier (primary key).
    pub process_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_type: Option<ProcessType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub space_id: String,
    #[serde(default)]
    pub mta_id: String,
    /// Namespace; the empty string means no namespace.
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Whether this operation holds the per MTA/namespace/space lock.
    #[serde(default)]
    pub acquired_lock: bool,
    pub state: OperationState,
    /// Set only in the ERROR state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Chronological diagnostic messages. Only present when embedded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

impl Operation {
    /// The most recent diagnostic message, if any.
    #[must_use]
    pub fn last_message(&self) -> Option<&str> {
        self.messages.last().map(|m| m.text.as_str())
    }

    /// Text describing why an errored operation failed: the last message,
    /// falling back to the error type.
    #[must_use]
    pub fn failure_detail(&self) -> String {
        self.last_message()
            .map(str::to_string)
            .or_else(|| self.error_type.clone())
            .unwrap_or_else(|| "UNKNOWN".to_string())
    }

    /// Whether this operation holds the lock for the given MTA in a space.
    #[must_use]
    pub fn holds_lock_on(&self, mta_id: &str, space_id: &str, namespace: &str) -> bool {
        self.acquired_lock
            && self.mta_id == mta_id
            && self.space_id == space_id
            && self.namespace == namespace
    }
}

/// Body of a start-operation call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    pub process_type: ProcessType,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub parameters: Map<String, Value>,
}

impl OperationRequest {
    /// Deploy an uploaded archive.
    #[must_use]
    pub fn deploy(archive_id: &str, mta_id: &str, namespace: &str) -> Self {
        Self {
            process_type: ProcessType::Deploy,
            namespace: namespace.to_string(),
            parameters: Map::new(),
        }
        .with_parameter("appArchiveId", archive_id)
        .with_parameter("mtaId", mta_id)
    }

    /// Undeploy an MTA and delete its services.
    #[must_use]
    pub fn undeploy(mta_id: &str, namespace: &str) -> Self {
        Self {
            process_type: ProcessType::Undeploy,
            namespace: namespace.to_string(),
            parameters: Map::new(),
        }
        .with_parameter("mtaId", mta_id)
        .with_parameter("deleteServices", true)
    }

    /// Add a process parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }
}

/// Filters for listing operations.
#[derive(Debug, Clone, Default)]
pub struct OperationQuery {
    pub mta_id: Option<String>,
    /// Only the last N operations.
    pub last: Option<u32>,
    pub states: Vec<OperationState>,
}

impl OperationQuery {
    /// Operations for an MTA that may still hold its lock.
    #[must_use]
    pub fn active_for(mta_id: &str) -> Self {
        Self {
            mta_id: Some(mta_id.to_string()),
            last: None,
            states: OperationState::ACTIVE.to_vec(),
        }
    }
}

// ============================================================================
// Files and upload jobs
// ============================================================================

/// Metadata of a stored archive or extension descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileMetadata {
    pub id: String,
    pub name: String,
    pub size: i64,
    pub digest: String,
    pub digest_algorithm: String,
    pub space: String,
    pub namespace: String,
}

/// Status of an upload-from-URL job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Error,
    Finished,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "RUNNING",
            Self::Error => "ERROR",
            Self::Finished => "FINISHED",
        })
    }
}

/// Snapshot of an upload-from-URL job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadJob {
    pub status: JobStatus,
    /// Set once the job finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mta_id: Option<String>,
    /// Set when the job failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Handle to a started upload-from-URL job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHandle {
    pub job_id: String,
    /// Instance that accepted the upload. Job state lives on that instance only.
    pub app_instance: Option<String>,
}

/// Body of an upload-from-URL call.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct FileUrl {
    /// URL-safe base64 of the archive URL.
    pub file_url: String,
}

// ============================================================================
// MTAs
// ============================================================================

/// A deployed multi-target application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mta {
    #[serde(default)]
    pub metadata: Option<MtaMetadata>,
    #[serde(default)]
    pub modules: Vec<Module>,
    #[serde(default)]
    pub services: Vec<String>,
}

/// Identity of a deployed MTA.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MtaMetadata {
    pub id: String,
    pub version: String,
    pub namespace: String,
}

/// One deployed module of an MTA.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Module {
    pub module_name: String,
    pub app_name: String,
    pub created_on: Option<DateTime<Utc>>,
    pub updated_on: Option<DateTime<Utc>>,
    /// The service spells this field `providedDendencyNames`.
    #[serde(rename = "providedDendencyNames")]
    pub provided_dependency_names: Vec<String>,
    pub services: Vec<String>,
    pub uris: Vec<String>,
}
