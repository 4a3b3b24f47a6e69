//! `ocne cluster` subcommands

use clap::{Args, Subcommand};
use tracing::info;

use ocne_driver::{create_driver, delete_cluster, join_cluster, stage_cluster, start_cluster};

use super::ClusterArgs;
use crate::Result;

#[derive(Subcommand, Debug)]
pub enum ClusterCommand {
    /// Create a cluster, or check that an existing one answers
    Start(StartArgs),

    /// Add nodes to a running cluster
    Join(JoinArgs),

    /// Prepare a cluster for a new Kubernetes version
    Stage(StageArgs),

    /// Delete a cluster and everything it owns
    Delete(DeleteArgs),
}

#[derive(Args, Debug)]
pub struct StartArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Kubernetes version, overriding the configuration
    #[arg(long)]
    pub version: Option<String>,
}

#[derive(Args, Debug)]
pub struct JoinArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Control plane nodes to add
    #[arg(long, default_value_t = 0)]
    pub control_plane_nodes: u32,

    /// Worker nodes to add
    #[arg(long, default_value_t = 0)]
    pub worker_nodes: u32,
}

#[derive(Args, Debug)]
pub struct StageArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Kubernetes version to stage
    #[arg(short = 'v', long)]
    pub version: String,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,
}

pub async fn run(cmd: ClusterCommand, show_ui: bool) -> Result<()> {
    match cmd {
        ClusterCommand::Start(args) => start(args, show_ui).await,
        ClusterCommand::Join(args) => join(args, show_ui).await,
        ClusterCommand::Stage(args) => stage(args, show_ui).await,
        ClusterCommand::Delete(args) => delete(args, show_ui).await,
    }
}

async fn start(args: StartArgs, show_ui: bool) -> Result<()> {
    let mut config = args.cluster.load()?;
    if let Some(version) = args.version {
        config.kubernetes_version = version;
    }
    let mut driver = create_driver(config, show_ui).await?;
    let report = start_cluster(driver.as_mut()).await?;
    if report.outcome.already_running {
        info!("Cluster is already running");
    }
    print!("{}", report.help);
    Ok(())
}

async fn join(args: JoinArgs, show_ui: bool) -> Result<()> {
    let kubeconfig = args.cluster.require_kubeconfig()?;
    let config = args.cluster.load()?;
    let mut driver = create_driver(config, show_ui).await?;
    join_cluster(
        driver.as_mut(),
        &kubeconfig,
        args.control_plane_nodes,
        args.worker_nodes,
    )
    .await?;
    info!(
        control_planes = args.control_plane_nodes,
        workers = args.worker_nodes,
        "Nodes joined"
    );
    Ok(())
}

async fn stage(args: StageArgs, show_ui: bool) -> Result<()> {
    let config = args.cluster.load()?;
    let mut driver = create_driver(config, show_ui).await?;
    let outcome = stage_cluster(driver.as_mut(), &args.version).await?;
    if outcome.help_text.is_empty() {
        info!(version = %args.version, "Nothing to stage");
    } else {
        print!("{}", outcome.help_text);
    }
    Ok(())
}

async fn delete(args: DeleteArgs, show_ui: bool) -> Result<()> {
    let config = args.cluster.load()?;
    let mut driver = create_driver(config, show_ui).await?;
    delete_cluster(driver.as_mut()).await?;
    Ok(())
}
