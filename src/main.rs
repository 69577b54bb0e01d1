// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::Result;
use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fabric_ca_operator::config::Config;
use fabric_ca_operator::constants::OPERATOR_VERSION;
use fabric_ca_operator::kubernetes::wait_for_ibpca_crd;
use fabric_ca_operator::reconcilers::CaReconciler;
use fabric_ca_operator::types::IBPCA;
use fabric_ca_operator::upload::{self, FileArg};

#[derive(Parser, Debug)]
#[command(name = "fabric-ca-operator", version, about = "Operator for Hyperledger Fabric CAs")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the operator (default)
    Run,
    /// Print the IBPCA CustomResourceDefinition as YAML
    Crd,
    /// Store files as keys of a secret, used by HSM init jobs
    UploadCrypto {
        #[arg(long)]
        namespace: String,
        #[arg(long)]
        secret: String,
        /// `key=path`, may be repeated
        #[arg(long = "file", required = true)]
        files: Vec<FileArg>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command.unwrap_or(Command::Run) {
        Command::Run => run().await,
        Command::Crd => {
            print!("{}", serde_yaml::to_string(&IBPCA::crd())?);
            Ok(())
        }
        Command::UploadCrypto {
            namespace,
            secret,
            files,
        } => {
            let client = Client::try_default().await?;
            upload::upload(&client, &namespace, &secret, &files).await
        }
    }
}

async fn run() -> Result<()> {
    info!("Starting fabric-ca operator {}", OPERATOR_VERSION);

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Configuration loaded: operator_namespace={}, cluster_type={:?}",
        config.operator_namespace, config.cluster_type
    );

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    // Wait for the IBPCA CRD before starting the reconciler
    info!("Waiting for IBPCA CRD to become available...");
    wait_for_ibpca_crd(&client).await?;

    CaReconciler::new(client, config).run().await?;

    warn!("IBPCA reconciler stopped");
    Ok(())
}
