//! MTA CLI - deploy and manage multi-target applications.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mta::deploy::{ArchiveSource, DeployRequest, Deployer};
use mta::{ClientConfig, Mta, MtaClient, OperationAction, OperationQuery, OperationState, Poller};

/// MTA CLI - deploy and manage multi-target applications.
#[derive(Parser)]
#[command(name = "mta")]
#[command(about = "Deploy and manage multi-target applications")]
struct Cli {
    /// Deploy service URL (or set `MTA_DEPLOY_URL` env var).
    #[arg(long, env = "MTA_DEPLOY_URL")]
    url: String,

    /// Bearer token for the deploy service (or set `MTA_AUTH_TOKEN` env var).
    #[arg(long, env = "MTA_AUTH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Milliseconds between state polls.
    #[arg(long, env = "MTA_POLL_INTERVAL_MS", default_value = "2000")]
    poll_interval_ms: u64,

    /// Per-request timeout in seconds.
    #[arg(long, env = "MTA_REQUEST_TIMEOUT_SECS", default_value = "30")]
    request_timeout_secs: u64,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload an archive and deploy it, aborting any conflicting operation.
    Deploy {
        /// Space GUID.
        #[arg(long)]
        space: String,

        /// MTA namespace.
        #[arg(long, default_value = "")]
        namespace: String,

        /// Local archive to upload (requires --mta-id).
        #[arg(long, conflicts_with = "archive_url", requires = "mta_id")]
        archive: Option<PathBuf>,

        /// MTA id of the local archive.
        #[arg(long)]
        mta_id: Option<String>,

        /// Remote archive URL for the service to fetch.
        #[arg(long)]
        archive_url: Option<String>,

        /// Extension descriptor files.
        #[arg(long = "extension-descriptor")]
        extension_descriptors: Vec<PathBuf>,
    },

    /// Undeploy an MTA and delete its services.
    Undeploy {
        /// Space GUID.
        #[arg(long)]
        space: String,

        /// MTA id.
        #[arg(long)]
        mta_id: String,

        /// MTA namespace.
        #[arg(long, default_value = "")]
        namespace: String,
    },

    /// Show a deployed MTA.
    Get {
        /// Space GUID.
        #[arg(long)]
        space: String,

        /// MTA id.
        #[arg(long)]
        mta_id: String,

        /// MTA namespace.
        #[arg(long, default_value = "")]
        namespace: String,
    },

    /// List operations in a space.
    Operations {
        /// Space GUID.
        #[arg(long)]
        space: String,

        /// Only operations of this MTA.
        #[arg(long)]
        mta_id: Option<String>,

        /// Only the last N operations.
        #[arg(long)]
        last: Option<u32>,

        /// States to include (comma-separated, e.g. RUNNING,ERROR).
        #[arg(long, value_delimiter = ',')]
        state: Vec<OperationState>,
    },

    /// Print the SHA-256 of an archive hosted at a URL.
    ArchiveHash {
        /// Archive URL.
        #[arg(value_name = "URL")]
        archive_url: String,
    },

    /// Abort an operation and wait until it is aborted.
    Abort {
        /// Space GUID.
        #[arg(long)]
        space: String,

        /// Operation (process) id.
        #[arg(long)]
        id: String,
    },
}

/// Cancel `token` on Ctrl-C so polls stop at their next sleep.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = ClientConfig::new(&cli.url);
    config.poll_interval_ms = cli.poll_interval_ms;
    config.request_timeout_secs = cli.request_timeout_secs;
    if let Some(token) = &cli.token {
        config = config.with_default_header("authorization", format!("Bearer {token}"));
    }

    let client = MtaClient::new(&config).context("Failed to create deploy service client")?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    match cli.command {
        Commands::Deploy {
            space,
            namespace,
            archive,
            mta_id,
            archive_url,
            extension_descriptors,
        } => {
            let source = match (archive, archive_url) {
                (Some(path), None) => ArchiveSource::File {
                    path,
                    mta_id: mta_id.unwrap_or_default(),
                },
                (None, Some(url)) => ArchiveSource::Url(url),
                _ => bail!("Specify exactly one of --archive or --archive-url"),
            };

            let deployer = Deployer::new(client, cancel);
            let mta = deployer
                .deploy(&DeployRequest {
                    space,
                    namespace,
                    source,
                    extension_descriptors,
                })
                .await
                .context("Deploy failed")?;

            print_mta(&mta);
        }

        Commands::Undeploy {
            space,
            mta_id,
            namespace,
        } => {
            Deployer::new(client, cancel)
                .undeploy(&space, &mta_id, &namespace)
                .await
                .context("Undeploy failed")?;
            println!("✅ {mta_id} undeployed");
        }

        Commands::Get {
            space,
            mta_id,
            namespace,
        } => {
            let found = Deployer::new(client, cancel)
                .find(&space, &mta_id, &namespace)
                .await?;
            match found {
                Some(mta) => print_mta(&mta),
                None => println!("MTA {mta_id} not found"),
            }
        }

        Commands::Operations {
            space,
            mta_id,
            last,
            state,
        } => {
            let operations = client
                .list_operations(
                    &space,
                    &OperationQuery {
                        mta_id,
                        last,
                        states: state,
                    },
                )
                .await?;

            println!(
                "\n{:<38} {:<12} {:<16} {:<30} {:<5}",
                "PROCESS ID", "TYPE", "STATE", "MTA", "LOCK"
            );
            println!("{}", "-".repeat(104));
            for op in operations {
                let process_type = op
                    .process_type
                    .map_or_else(|| "-".to_string(), |t| format!("{t:?}"));
                println!(
                    "{:<38} {:<12} {:<16} {:<30} {:<5}",
                    op.process_id,
                    process_type,
                    op.state,
                    op.mta_id,
                    if op.acquired_lock { "yes" } else { "no" }
                );
            }
        }

        Commands::ArchiveHash { archive_url } => {
            let hash = client
                .remote_archive_hash(&archive_url)
                .await
                .context("Failed to hash remote archive")?;
            println!("{hash}");
        }

        Commands::Abort { space, id } => {
            let poller = Poller::new(client.clone(), cancel);
            let operation_id = client
                .execute_action(&space, &id, OperationAction::Abort)
                .await?;
            info!(operation_id = %operation_id, "Abort requested");
            poller
                .poll_operation(&space, &operation_id, OperationState::Aborted)
                .await
                .context("Failed waiting for abort")?;
            println!("✅ Operation {id} aborted");
        }
    }

    Ok(())
}

fn print_mta(mta: &Mta) {
    if let Some(metadata) = &mta.metadata {
        println!("\nMTA:       {}", metadata.id);
        println!("Version:   {}", metadata.version);
        if !metadata.namespace.is_empty() {
            println!("Namespace: {}", metadata.namespace);
        }
    }
    println!("\n{:<30} {:<30} URIS", "MODULE", "APP");
    println!("{}", "-".repeat(80));
    for module in &mta.modules {
        println!(
            "{:<30} {:<30} {}",
            module.module_name,
            module.app_name,
            module.uris.join(", ")
        );
    }
    if !mta.services.is_empty() {
        println!("\nServices: {}", mta.services.join(", "));
    }
}
