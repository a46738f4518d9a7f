//! # dsa-sync CLI Interface
//!
//! Command parsing and orchestration only. All synchronization logic lives in
//! `dsa-sync-core`; this module wires the concrete collaborators
//! ([`GirderClient`], [`WorkbookTransformer`], [`FsArtifactCache`]) into it.
//!
//! ## Commands
//! - `sync`: one synchronization run, report logged at the end.
//! - `serve`: HTTP trigger (`GET /files`) plus the daily scheduler.
//! - `scaffold`: create the local lab/study/sample directories from a YAML structure.
//!
//! For programmatic/integration use, call [`run`] with a constructed [`Cli`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dsa_sync_core::artifacts::FsArtifactCache;
use dsa_sync_core::scaffold::create_folder_structure;
use dsa_sync_core::synchronise::synchronise;
use dsa_sync_core::transform::WorkbookTransformer;

use crate::client::GirderClient;
use crate::load_config::{load_config, load_structure, AppConfig};
use crate::server::{serve, SyncRunner};

/// CLI for dsa-sync: mirror local lab folders onto a Digital Slide Archive.
#[derive(Parser)]
#[clap(
    name = "dsa-sync",
    version,
    about = "Mirror a local lab/study/sample tree onto a Digital Slide Archive"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one synchronization and exit
    Sync {
        /// Path to the YAML config file (optional, environment is always read)
        #[clap(long)]
        config: Option<PathBuf>,
    },
    /// Serve the HTTP trigger and run the daily schedule
    Serve {
        #[clap(long)]
        config: Option<PathBuf>,
    },
    /// Create the local folder structure described in a YAML file
    Scaffold {
        /// YAML file with `labs: {lab: {studies: {study: [sample, ...]}}}`
        #[clap(long)]
        structure: PathBuf,
        #[clap(long)]
        config: Option<PathBuf>,
    },
}

fn client_for(config: &AppConfig) -> Result<GirderClient> {
    GirderClient::new(&config.dsa.host, config.transfer_config())
        .with_context(|| format!("Failed to construct client for {}", config.dsa.host))
}

pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Sync { config } => {
            let config = load_config(config.as_deref())?;
            let sync_config = config.sync_config()?;
            let client = client_for(&config)?;
            tracing::info!(command = "sync", "Starting synchronisation process");

            match synchronise(
                &sync_config,
                &client,
                &WorkbookTransformer::new(),
                &FsArtifactCache,
            )
            .await
            {
                Ok(report) => {
                    tracing::info!(command = "sync", ?report, "Synchronisation complete");
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(command = "sync", error = %e, "Synchronisation failed");
                    Err(anyhow::Error::new(e))
                }
            }
        }
        Commands::Serve { config } => {
            let config = load_config(config.as_deref())?;
            let runner = Arc::new(SyncRunner::new(
                config.sync_config()?,
                Arc::new(client_for(&config)?),
                Arc::new(WorkbookTransformer::new()),
                Arc::new(FsArtifactCache),
            ));
            tracing::info!(command = "serve", "Starting server");
            serve(runner, &config.server).await
        }
        Commands::Scaffold { structure, config } => {
            let config = load_config(config.as_deref())?;
            let structure = load_structure(&structure)?;
            let root = PathBuf::from(&config.dsa.folder_name);
            let created = create_folder_structure(&root, &structure);
            tracing::info!(
                command = "scaffold",
                root = %root.display(),
                created = created.len(),
                "Scaffold complete"
            );
            Ok(())
        }
    }
}
