//! `ocne node` subcommands

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use tracing::{info, warn};

use ocne_update::{
    pre_update, update_nodes, DrainOptions, HelmInstaller, KubeNodeOps, NodeOps, PreUpdateOptions, UpdateOptions,
};

use crate::Result;

#[derive(Subcommand, Debug)]
pub enum NodeCommand {
    /// Apply the staged OS and Kubernetes update to nodes, one at a time
    Update(UpdateArgs),
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Kubeconfig of the cluster
    #[arg(short = 'k', long = "kubeconfig")]
    pub kubeconfig: Option<PathBuf>,

    /// Node to update; repeat to update several in order
    #[arg(short = 'N', long = "node", required = true)]
    pub nodes: Vec<String>,

    /// Minutes allowed for draining each node
    #[arg(long, default_value_t = 30)]
    pub drain_timeout_minutes: u64,

    /// Delete pods instead of evicting them
    #[arg(long)]
    pub disable_eviction: bool,

    /// Drain pods that use emptyDir volumes
    #[arg(long)]
    pub delete_emptydir_data: bool,

    /// Skip preparing clusters created with older images
    #[arg(long)]
    pub skip_pre_update: bool,
}

impl UpdateArgs {
    fn update_options(&self) -> UpdateOptions {
        UpdateOptions {
            drain: DrainOptions {
                timeout: Duration::from_secs(self.drain_timeout_minutes * 60),
                disable_eviction: self.disable_eviction,
                delete_emptydir_data: self.delete_emptydir_data,
            },
            ..Default::default()
        }
    }
}

pub async fn run(cmd: NodeCommand, show_ui: bool) -> Result<()> {
    match cmd {
        NodeCommand::Update(args) => update(args, show_ui).await,
    }
}

async fn update(args: UpdateArgs, show_ui: bool) -> Result<()> {
    let ops = Arc::new(KubeNodeOps::connect(args.kubeconfig.clone()).await?);

    if !args.skip_pre_update {
        let installer = HelmInstaller::new(args.kubeconfig.clone());
        let opts = PreUpdateOptions {
            show_ui,
            ..Default::default()
        };
        let node_ops: Arc<dyn NodeOps> = ops.clone();
        let report = pre_update(node_ops, &installer, &opts).await?;
        for (node, error) in &report.failed {
            warn!(node = %node, error = %error, "Could not retag images");
        }
        if !report.skipped {
            info!(
                retagged = report.retagged.len(),
                adopted = ?report.adopted,
                "Cluster prepared for updates"
            );
        }
    }

    update_nodes(ops.as_ref(), &args.nodes, &args.update_options()).await?;
    info!(nodes = ?args.nodes, "Nodes updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_shape_the_drain() {
        let args = UpdateArgs {
            kubeconfig: None,
            nodes: vec!["w1".to_string()],
            drain_timeout_minutes: 5,
            disable_eviction: true,
            delete_emptydir_data: false,
            skip_pre_update: false,
        };
        let opts = args.update_options();
        assert_eq!(opts.drain.timeout, Duration::from_secs(300));
        assert!(opts.drain.disable_eviction);
        assert!(!opts.drain.delete_emptydir_data);
    }
}
