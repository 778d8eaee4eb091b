//! Process entrypoint.
//!
//! `crd` prints the CRD manifests this operator owns, for `kubectl apply`.
//! `run` bootstraps configuration once and hands off to the tick-driven root
//! loop; any bootstrap failure is a startup configuration error and exits
//! non-zero.

mod backoff;
mod bootstrap;
mod config;
mod controller;
mod crd;
mod credentials;
mod deployment;
mod discovery;
mod inventory;
mod masterpassword;
mod nsxt;
mod reconciler;
mod sso;
mod templates;

use clap::{Parser, Subcommand};
use crd::{VCenterServiceUser, VCenterTemplate};
use kube::CustomResourceExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Opts {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Prints the CRD manifests this operator owns.
    Crd,
    /// Runs the reconciliation loop.
    Run {
        /// Render and log deltas without applying them.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    match opts.cmd {
        Command::Crd => {
            print!("{}", serde_yaml::to_string(&VCenterTemplate::crd())?);
            println!("---");
            print!("{}", serde_yaml::to_string(&VCenterServiceUser::crd())?);
        }
        Command::Run { dry_run } => {
            let level = bootstrap::parse_log_level(std::env::var("LOG_LEVEL").ok().as_deref())?;
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new(level.to_string()))
                .init();

            let bootstrap = bootstrap::bootstrap().await?;
            crd::ensure_crds(&bootstrap.client).await?;

            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                region = %bootstrap.config.region,
                domain = %bootstrap.config.domain,
                dry_run,
                "vcenter-operator starting"
            );

            controller::State::new(bootstrap, dry_run).run().await;
        }
    }

    Ok(())
}
