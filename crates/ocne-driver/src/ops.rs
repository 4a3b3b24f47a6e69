//! Whole operations over a driver
//!
//! Each one runs a driver operation to completion and always closes the
//! driver afterwards, so PKI material and memory-backed files are released
//! even when the operation fails.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use ocne_common::Result;

use crate::driver::{Driver, StageOutcome, StartOutcome};

/// What starting a cluster produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartReport {
    /// Start outcome
    pub outcome: StartOutcome,
    /// Kubeconfig of the cluster
    pub kubeconfig: Option<PathBuf>,
    /// Instructions for reaching the cluster
    pub help: String,
}

fn finish<T>(driver: &mut dyn Driver, result: Result<T>) -> Result<T> {
    let closed = driver.close();
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close)) => {
            warn!(error = %close, "Failed to release driver resources");
            Err(e)
        }
    }
}

async fn start_inner(driver: &mut dyn Driver) -> Result<StartReport> {
    let outcome = driver.start().await?;
    if outcome.already_running {
        info!("Cluster was already running");
    } else {
        driver.post_start().await?;
    }
    Ok(StartReport {
        outcome,
        kubeconfig: driver.kubeconfig_path(),
        help: driver.post_install_help_stanza(),
    })
}

/// Start a cluster, pivoting it onto itself after a fresh bring-up
pub async fn start_cluster(driver: &mut dyn Driver) -> Result<StartReport> {
    let result = start_inner(driver).await;
    finish(driver, result)
}

/// Add nodes to the running cluster behind `kubeconfig`
pub async fn join_cluster(driver: &mut dyn Driver, kubeconfig: &Path, control_planes: u32, workers: u32) -> Result<()> {
    let result = driver.join(kubeconfig, control_planes, workers).await;
    finish(driver, result)
}

/// Stage an upgrade to `version`
pub async fn stage_cluster(driver: &mut dyn Driver, version: &str) -> Result<StageOutcome> {
    let result = driver.stage(version).await;
    finish(driver, result)
}

/// Delete a cluster
pub async fn delete_cluster(driver: &mut dyn Driver) -> Result<()> {
    let result = driver.delete().await;
    finish(driver, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use mockall::Sequence;
    use ocne_common::Error;

    #[tokio::test]
    async fn story_fresh_cluster_is_pivoted_then_closed() {
        let mut seq = Sequence::new();
        let mut driver = MockDriver::new();
        driver
            .expect_start()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                Ok(StartOutcome {
                    already_running: false,
                    changed: true,
                })
            });
        driver
            .expect_post_start()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        driver
            .expect_kubeconfig_path()
            .returning(|| Some(PathBuf::from("/home/u/.kube/kubeconfig.demo.local")));
        driver
            .expect_post_install_help_stanza()
            .returning(|| "export KUBECONFIG=/home/u/.kube/kubeconfig.demo.local\n".to_string());
        driver.expect_close().times(1).in_sequence(&mut seq).returning(|| Ok(()));

        let report = start_cluster(&mut driver).await.unwrap();
        assert!(report.outcome.changed);
        assert!(report.help.contains("KUBECONFIG"));
    }

    #[tokio::test]
    async fn running_clusters_are_not_pivoted_again() {
        let mut driver = MockDriver::new();
        driver.expect_start().returning(|| {
            Ok(StartOutcome {
                already_running: true,
                changed: false,
            })
        });
        driver.expect_post_start().never();
        driver.expect_kubeconfig_path().returning(|| None);
        driver.expect_post_install_help_stanza().returning(String::new);
        driver.expect_close().times(1).returning(|| Ok(()));

        let report = start_cluster(&mut driver).await.unwrap();
        assert!(report.outcome.already_running);
    }

    #[tokio::test]
    async fn failures_still_close_and_keep_the_original_error() {
        let mut driver = MockDriver::new();
        driver
            .expect_delete()
            .returning(|| Err(Error::timeout("deletion of cluster demo", std::time::Duration::from_secs(1200))));
        driver
            .expect_close()
            .times(1)
            .returning(|| Err(Error::fatal("temp dir vanished")));

        let err = delete_cluster(&mut driver).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn stage_returns_the_driver_outcome() {
        let mut driver = MockDriver::new();
        driver
            .expect_stage()
            .withf(|version| version == "1.31")
            .returning(|_| {
                Ok(StageOutcome {
                    kubeconfig: PathBuf::from("/dev/shm/kubeconfig.demo.x"),
                    help_text: "kubectl patch ...".to_string(),
                    changed: true,
                })
            });
        driver.expect_close().returning(|| Ok(()));

        let outcome = stage_cluster(&mut driver, "1.31").await.unwrap();
        assert!(outcome.changed);
    }
}
