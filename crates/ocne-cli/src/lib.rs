//! ocne CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// ocne - Kubernetes clusters on hypervisors and in the cloud
#[derive(Parser, Debug)]
#[command(name = "ocne")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log progress lines instead of drawing progress bars
    #[arg(long, global = true)]
    pub no_progress: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create, grow, upgrade and delete clusters
    #[command(subcommand)]
    Cluster(commands::cluster::ClusterCommand),

    /// Operate on the nodes of a running cluster
    #[command(subcommand)]
    Node(commands::node::NodeCommand),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let show_ui = !self.no_progress;
        match self.command {
            Commands::Cluster(cmd) => commands::cluster::run(cmd, show_ui).await,
            Commands::Node(cmd) => commands::node::run(cmd, show_ui).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commands::cluster::ClusterCommand;
    use commands::node::NodeCommand;

    #[test]
    fn cluster_stage_takes_a_version() {
        let cli = Cli::try_parse_from(["ocne", "cluster", "stage", "-c", "cluster.yaml", "--version", "1.31"]).unwrap();
        match cli.command {
            Commands::Cluster(ClusterCommand::Stage(args)) => {
                assert_eq!(args.version, "1.31");
                assert_eq!(args.cluster.config.as_deref(), Some(std::path::Path::new("cluster.yaml")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn node_update_needs_a_node() {
        assert!(Cli::try_parse_from(["ocne", "node", "update"]).is_err());

        let cli = Cli::try_parse_from(["ocne", "--no-progress", "node", "update", "-N", "cp1", "-N", "w1"]).unwrap();
        assert!(cli.no_progress);
        match cli.command {
            Commands::Node(NodeCommand::Update(args)) => assert_eq!(args.nodes, vec!["cp1", "w1"]),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
