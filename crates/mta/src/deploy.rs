//! Deploy and undeploy workflows.
//!
//! A deploy runs strictly in order: archive intake, extension descriptor
//! upload, conflict resolution, operation start, wait for `FINISHED`, and a
//! final read of the deployed MTA. Any failure stops the workflow.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::MtaClient;
use crate::conflict::ConflictResolver;
use crate::error::MtaError;
use crate::models::{FileMetadata, JobStatus, Mta, OperationRequest, OperationState};
use crate::poll::Poller;

/// Where the archive to deploy comes from.
#[derive(Debug, Clone)]
pub enum ArchiveSource {
    /// Local `.mtar` file. The MTA id is read from its descriptor by the caller.
    File { path: PathBuf, mta_id: String },
    /// Remote URL fetched by the service. The MTA id comes from the finished upload job.
    Url(String),
}

/// Parameters of a deploy.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub space: String,
    /// Empty for no namespace.
    pub namespace: String,
    pub source: ArchiveSource,
    /// Local extension descriptor files.
    pub extension_descriptors: Vec<PathBuf>,
}

/// Uploaded archive ready to deploy.
#[derive(Debug, Clone)]
struct Intake {
    file: FileMetadata,
    mta_id: String,
}

/// Runs deploy and undeploy workflows against one deploy service.
#[derive(Clone)]
pub struct Deployer {
    client: MtaClient,
    poller: Poller,
    resolver: ConflictResolver,
}

impl Deployer {
    /// Create a deployer. Cancelling `cancel` stops any wait in progress.
    #[must_use]
    pub fn new(client: MtaClient, cancel: CancellationToken) -> Self {
        let poller = Poller::new(client.clone(), cancel);
        Self {
            client,
            resolver: ConflictResolver::new(poller.clone()),
            poller,
        }
    }

    /// Deploy an archive and return the resulting MTA.
    ///
    /// # Errors
    /// Returns error if any step fails; later steps are not attempted.
    pub async fn deploy(&self, request: &DeployRequest) -> Result<Mta, MtaError> {
        let space = request.space.as_str();
        let intake = self.intake(request).await?;
        info!(
            space = %space,
            mta_id = %intake.mta_id,
            archive_id = %intake.file.id,
            "Archive uploaded"
        );

        let mut descriptor_ids = Vec::with_capacity(request.extension_descriptors.len());
        for path in &request.extension_descriptors {
            let file = self
                .client
                .upload_file(space, path, &request.namespace)
                .await?;
            descriptor_ids.push(file.id);
        }

        // The lock is held per target namespace, which the file metadata may omit.
        self.resolver
            .resolve_conflict(space, &intake.mta_id, &request.namespace)
            .await?;

        let mut body = OperationRequest::deploy(&intake.file.id, &intake.mta_id, &request.namespace);
        if !descriptor_ids.is_empty() {
            body = body.with_parameter("mtaExtDescriptorId", descriptor_ids.join(","));
        }

        let operation_id = self.client.start_operation(space, &body).await?;
        self.poller
            .poll_operation(space, &operation_id, OperationState::Finished)
            .await?;

        let mta = self
            .client
            .get_mta(space, &intake.mta_id, &request.namespace)
            .await?;
        info!(space = %space, mta_id = %intake.mta_id, "MTA deployed");
        Ok(mta)
    }

    async fn intake(&self, request: &DeployRequest) -> Result<Intake, MtaError> {
        let space = request.space.as_str();
        match &request.source {
            ArchiveSource::File { path, mta_id } => {
                if mta_id.is_empty() {
                    return Err(MtaError::InvalidInput(format!(
                        "MTA id missing for archive {}",
                        path.display()
                    )));
                }
                let file = self
                    .client
                    .upload_file(space, path, &request.namespace)
                    .await?;
                Ok(Intake {
                    file,
                    mta_id: mta_id.clone(),
                })
            }
            ArchiveSource::Url(url) => {
                let handle = self
                    .client
                    .upload_from_url(space, url, &request.namespace)
                    .await?;
                let job = self
                    .poller
                    .poll_job(space, &handle, &request.namespace, JobStatus::Finished)
                    .await?;

                let mta_id = job.mta_id.filter(|id| !id.is_empty()).ok_or_else(|| {
                    MtaError::InvalidInput(format!(
                        "upload job {} finished without an MTA id",
                        handle.job_id
                    ))
                })?;
                let file = job.file.ok_or_else(|| {
                    MtaError::InvalidInput(format!(
                        "upload job {} finished without file metadata",
                        handle.job_id
                    ))
                })?;
                Ok(Intake { file, mta_id })
            }
        }
    }

    /// Undeploy an MTA, deleting its services.
    ///
    /// # Errors
    /// Returns error if conflict resolution, the operation start, or the wait fails.
    pub async fn undeploy(&self, space: &str, mta_id: &str, namespace: &str) -> Result<(), MtaError> {
        self.resolver
            .resolve_conflict(space, mta_id, namespace)
            .await?;

        let operation_id = self
            .client
            .start_operation(space, &OperationRequest::undeploy(mta_id, namespace))
            .await?;
        self.poller
            .poll_operation(space, &operation_id, OperationState::Finished)
            .await?;

        info!(space = %space, mta_id = %mta_id, "MTA undeployed");
        Ok(())
    }

    /// Read an MTA, treating "not found" as absent.
    ///
    /// # Errors
    /// Returns error for any failure other than "not found".
    pub async fn find(&self, space: &str, mta_id: &str, namespace: &str) -> Result<Option<Mta>, MtaError> {
        match self.client.get_mta(space, mta_id, namespace).await {
            Ok(mta) => Ok(Some(mta)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
