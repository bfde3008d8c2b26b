//! Polling of operations and upload jobs to a terminal state.
//!
//! Both pollers sleep a fixed interval, fetch the current state, and repeat.
//! There is no retry limit and no backoff. The only way to stop waiting on
//! an operation that never settles is the [`CancellationToken`], which is
//! checked at every sleep.

use std::fmt;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{MtaClient, EMBED_MESSAGES};
use crate::error::MtaError;
use crate::models::{JobStatus, Operation, OperationState, UploadHandle, UploadJob};

/// What a poller knows about a remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed<S> {
    /// No fetch has succeeded yet.
    NotYetPolled,
    /// The state reported by the last fetch.
    Reported(S),
}

impl<S: fmt::Display> fmt::Display for Observed<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotYetPolled => f.write_str("not yet polled"),
            Self::Reported(state) => write!(f, "{state}"),
        }
    }
}

/// Waits for operations and upload jobs to settle.
#[derive(Clone)]
pub struct Poller {
    client: MtaClient,
    interval: Duration,
    cancel: CancellationToken,
}

impl Poller {
    /// Create a poller using the client's configured interval.
    #[must_use]
    pub fn new(client: MtaClient, cancel: CancellationToken) -> Self {
        let interval = client.poll_interval();
        Self {
            client,
            interval,
            cancel,
        }
    }

    /// Override the poll interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// The client used for state fetches.
    #[must_use]
    pub const fn client(&self) -> &MtaClient {
        &self.client
    }

    /// The token that stops every poll started by this poller.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Sleep one interval, or fail if cancellation is requested first.
    async fn pause(&self, id: &str) -> Result<(), MtaError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                info!(id = %id, "Polling cancelled");
                Err(MtaError::Cancelled { id: id.to_string() })
            }
            () = tokio::time::sleep(self.interval) => Ok(()),
        }
    }

    /// Poll an operation until it reaches `target`.
    ///
    /// Messages added to the operation's log are logged as they appear.
    ///
    /// # Errors
    /// - [`MtaError::OperationFailed`] as soon as the operation reports ERROR,
    ///   whatever the target, carrying its last message or error type.
    /// - [`MtaError::Cancelled`] if the token is cancelled.
    /// - Any fetch failure, immediately.
    pub async fn poll_operation(
        &self,
        space: &str,
        operation_id: &str,
        target: OperationState,
    ) -> Result<Operation, MtaError> {
        info!(space = %space, operation_id = %operation_id, target = %target, "Waiting for operation");

        let mut observed = Observed::NotYetPolled;
        let mut messages_seen = 0;
        let mut attempt: u64 = 0;

        loop {
            self.pause(operation_id).await?;
            attempt += 1;

            let operation = self
                .client
                .get_operation(space, operation_id, Some(EMBED_MESSAGES))
                .await?;

            for message in operation.messages.iter().skip(messages_seen) {
                info!(operation_id = %operation_id, message = %message.text, "Operation message");
            }
            messages_seen = messages_seen.max(operation.messages.len());

            let state = operation.state;
            if observed != Observed::Reported(state) {
                info!(
                    operation_id = %operation_id,
                    from = %observed,
                    to = %state,
                    "Operation state changed"
                );
            }
            debug!(operation_id = %operation_id, state = %state, attempt, "Polled operation");

            if state == OperationState::Error {
                return Err(MtaError::OperationFailed {
                    operation_id: operation_id.to_string(),
                    detail: operation.failure_detail(),
                });
            }
            if state == target {
                info!(operation_id = %operation_id, state = %state, attempt, "Operation reached target state");
                return Ok(operation);
            }
            observed = Observed::Reported(state);
        }
    }

    /// Poll an upload job until it reaches `target`.
    ///
    /// # Errors
    /// - [`MtaError::JobFailed`] as soon as the job reports ERROR.
    /// - [`MtaError::Cancelled`] if the token is cancelled.
    /// - Any fetch failure, immediately.
    pub async fn poll_job(
        &self,
        space: &str,
        handle: &UploadHandle,
        namespace: &str,
        target: JobStatus,
    ) -> Result<UploadJob, MtaError> {
        let job_id = handle.job_id.as_str();
        info!(space = %space, job_id = %job_id, target = %target, "Waiting for upload job");

        let mut observed = Observed::NotYetPolled;
        let mut attempt: u64 = 0;

        loop {
            self.pause(job_id).await?;
            attempt += 1;

            let job = self.client.get_upload_job(space, handle, namespace).await?;
            if observed != Observed::Reported(job.status) {
                info!(job_id = %job_id, from = %observed, to = %job.status, "Upload job status changed");
            }
            debug!(job_id = %job_id, status = %job.status, attempt, "Polled upload job");

            if job.status == JobStatus::Error {
                return Err(MtaError::JobFailed {
                    job_id: job_id.to_string(),
                    message: job.error.unwrap_or_default(),
                });
            }
            if job.status == target {
                info!(job_id = %job_id, attempt, "Upload job reached target status");
                return Ok(job);
            }
            observed = Observed::Reported(job.status);
        }
    }

    /// Run [`poll_operation`](Self::poll_operation) as a background task.
    #[must_use]
    pub fn spawn_operation(
        &self,
        space: impl Into<String>,
        operation_id: impl Into<String>,
        target: OperationState,
    ) -> JoinHandle<Result<Operation, MtaError>> {
        let poller = self.clone();
        let space = space.into();
        let operation_id = operation_id.into();
        tokio::spawn(async move { poller.poll_operation(&space, &operation_id, target).await })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ClientConfig;
    use crate::testing::ScriptedTransport;
    use serde_json::json;

    fn poller(transport: &Arc<ScriptedTransport>) -> Poller {
        let config = ClientConfig::new("https://deploy.example.com")
            .with_poll_interval(Duration::from_millis(5));
        let client = MtaClient::with_transport(&config, transport.clone()).unwrap();
        Poller::new(client, CancellationToken::new())
    }

    fn operation(state: &str, messages: &[&str]) -> serde_json::Value {
        let messages: Vec<_> = messages
            .iter()
            .enumerate()
            .map(|(i, text)| json!({"id": i, "text": text, "type": "INFO"}))
            .collect();
        json!({
            "processId": "op-1",
            "spaceId": "s1",
            "mtaId": "com.example.app",
            "state": state,
            "errorType": "CONTENT",
            "messages": messages
        })
    }

    #[tokio::test]
    async fn test_poll_operation_reaches_target() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(&operation("RUNNING", &["Uploading"]));
        transport.push_json(&operation("RUNNING", &["Uploading", "Staging"]));
        transport.push_json(&operation("FINISHED", &["Uploading", "Staging", "Done"]));

        let op = poller(&transport)
            .poll_operation("s1", "op-1", OperationState::Finished)
            .await
            .unwrap();

        assert_eq!(op.state, OperationState::Finished);
        assert_eq!(transport.requests().len(), 3);
        let url = transport.requests()[0].url().unwrap();
        assert_eq!(url.query(), Some("embed=messages"));
    }

    #[tokio::test]
    async fn test_poll_operation_fails_fast_on_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(&operation("RUNNING", &[]));
        transport.push_json(&operation("ERROR", &["Uploading", "Service broker timed out"]));
        transport.push_json(&operation("FINISHED", &[]));

        let err = poller(&transport)
            .poll_operation("s1", "op-1", OperationState::Finished)
            .await
            .unwrap_err();

        match err {
            MtaError::OperationFailed {
                operation_id,
                detail,
            } => {
                assert_eq!(operation_id, "op-1");
                assert_eq!(detail, "Service broker timed out");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_poll_operation_error_without_messages_uses_error_type() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(&operation("ERROR", &[]));

        let err = poller(&transport)
            .poll_operation("s1", "op-1", OperationState::Aborted)
            .await
            .unwrap_err();
        assert!(matches!(err, MtaError::OperationFailed { detail, .. } if detail == "CONTENT"));
    }

    #[tokio::test]
    async fn test_poll_operation_propagates_fetch_failure() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(&operation("RUNNING", &[]));
        transport.push(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            reqwest::header::HeaderMap::new(),
            "boom",
        );

        let err = poller(&transport)
            .poll_operation("s1", "op-1", OperationState::Finished)
            .await
            .unwrap_err();
        assert!(matches!(err, MtaError::Api { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_poll() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(&operation("RUNNING", &[]));
        let poller = poller(&transport);
        poller.cancellation_token().cancel();

        let err = poller
            .poll_operation("s1", "op-1", OperationState::Finished)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_endless_poll() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(&operation("RUNNING", &[]));
        let poller = poller(&transport);

        let handle = poller.spawn_operation("s1", "op-1", OperationState::Finished);
        tokio::time::sleep(Duration::from_millis(30)).await;
        poller.cancellation_token().cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(MtaError::Cancelled { id }) if id == "op-1"));
        assert!(!transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_poll_job() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(&json!({"status": "RUNNING"}));
        transport.push_json(&json!({
            "status": "FINISHED",
            "mta_id": "com.example.app",
            "file": {"id": "file-1", "name": "app.mtar"}
        }));
        let handle = UploadHandle {
            job_id: "job-1".to_string(),
            app_instance: Some("guid:0".to_string()),
        };

        let job = poller(&transport)
            .poll_job("s1", &handle, "", JobStatus::Finished)
            .await
            .unwrap();

        assert_eq!(job.mta_id.as_deref(), Some("com.example.app"));
        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].path, "/api/v1/spaces/s1/files/jobs/job-1");
        assert_eq!(sent[0].headers["x-cf-app-instance"], "guid:0");
    }

    #[tokio::test]
    async fn test_poll_job_error_carries_message() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(&json!({"status": "ERROR", "error": "404 fetching archive"}));
        let handle = UploadHandle {
            job_id: "job-1".to_string(),
            app_instance: None,
        };

        let err = poller(&transport)
            .poll_job("s1", &handle, "", JobStatus::Finished)
            .await
            .unwrap_err();
        assert!(
            matches!(err, MtaError::JobFailed { message, .. } if message == "404 fetching archive")
        );
    }

    #[test]
    fn test_observed_display() {
        assert_eq!(
            Observed::<OperationState>::NotYetPolled.to_string(),
            "not yet polled"
        );
        assert_eq!(
            Observed::Reported(OperationState::Running).to_string(),
            "RUNNING"
        );
    }
}
