//! Multi-target application deployment client.
//!
//! This crate drives MTA lifecycle operations (deploy, undeploy, abort)
//! against a remote deploy service. The service runs operations out of
//! band: calls are accepted with `202` and a `Location` header, and the
//! client polls the referenced operation or upload job until it settles.
//!
//! # Example
//!
//! ```rust,no_run
//! use mta::deploy::{ArchiveSource, DeployRequest, Deployer};
//! use mta::{ClientConfig, MtaClient};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = MtaClient::new(&ClientConfig::from_env()?)?;
//!     let deployer = Deployer::new(client, CancellationToken::new());
//!
//!     // Aborts any operation holding the MTA lock, deploys, and waits.
//!     let mta = deployer
//!         .deploy(&DeployRequest {
//!             space: "space-guid".into(),
//!             namespace: String::new(),
//!             source: ArchiveSource::Url("https://repo.example.com/app.mtar".into()),
//!             extension_descriptors: vec![],
//!         })
//!         .await?;
//!
//!     println!("{} modules deployed", mta.modules.len());
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod client;
pub mod config;
pub mod conflict;
pub mod deploy;
pub mod error;
pub mod job;
pub mod models;
pub mod poll;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::MtaClient;
pub use config::ClientConfig;
pub use conflict::ConflictResolver;
pub use error::{MtaError, ProtocolError};
pub use models::{
    FileMetadata, JobStatus, Mta, Operation, OperationAction, OperationQuery, OperationRequest,
    OperationState, UploadHandle, UploadJob,
};
pub use poll::Poller;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
