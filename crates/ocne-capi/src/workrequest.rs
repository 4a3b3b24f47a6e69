//! Waiting on asynchronous platform operations
//!
//! Each work request gets one waiter that polls its status and reports percent
//! complete to the progress display. A request ending in Failed or Canceled
//! fails the whole group once every other request has reached a terminal state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use ocne_common::retry::{poll, Poll, RetryStrategy};
use ocne_common::waiter::{wait_for_all, Waiter};
use ocne_common::{Error, Result};

use crate::oci::OciClient;

/// Poll interval for work requests
pub const WORK_REQUEST_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound on how long one work request may run
pub const WORK_REQUEST_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Wait for every request in `requests` (id → label) to finish
pub async fn wait_for_work_requests(
    oci: Arc<dyn OciClient>,
    requests: &BTreeMap<String, String>,
    interval: Duration,
    show_ui: bool,
) -> Result<()> {
    if requests.is_empty() {
        return Ok(());
    }

    let waiters = requests
        .iter()
        .map(|(id, label)| {
            let oci = oci.clone();
            let id = id.clone();
            Waiter::new(label.clone(), move |handle| async move {
                let strategy = RetryStrategy::linear(interval, WORK_REQUEST_TIMEOUT);
                poll(&strategy, &format!("work request {id}"), || {
                    let oci = oci.clone();
                    let id = id.clone();
                    let handle = handle.clone();
                    async move {
                        let wr = oci.get_work_request(&id).await?;
                        handle.set_percent(wr.percent_complete.clamp(0.0, 100.0) as u64);
                        handle.set_message(wr.status.to_string());
                        Ok(match wr.status {
                            s if s.is_failure() => {
                                Poll::Fail(Error::fatal(format!("work request {id} {s}")))
                            }
                            s if s.is_terminal() => Poll::Ready(()),
                            _ => Poll::Pending,
                        })
                    }
                })
                .await
            })
        })
        .collect::<Vec<_>>();

    wait_for_all(waiters, show_ui).await?;
    info!(count = requests.len(), "Work requests finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::{MockOciClient, WorkRequest, WorkRequestStatus};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn wr(id: &str, status: WorkRequestStatus, pct: f32) -> WorkRequest {
        WorkRequest {
            id: id.to_string(),
            status,
            percent_complete: pct,
        }
    }

    #[tokio::test]
    async fn waits_until_all_succeed() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut oci = MockOciClient::new();
        oci.expect_get_work_request().returning(move |id| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            Ok(if n < 2 {
                wr(id, WorkRequestStatus::InProgress, 50.0)
            } else {
                wr(id, WorkRequestStatus::Succeeded, 100.0)
            })
        });
        let requests = BTreeMap::from([
            ("wr1".to_string(), "amd64 image".to_string()),
            ("wr2".to_string(), "arm64 image".to_string()),
        ]);
        wait_for_work_requests(Arc::new(oci), &requests, Duration::from_millis(5), false)
            .await
            .unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn one_failure_fails_the_group() {
        let mut oci = MockOciClient::new();
        oci.expect_get_work_request().returning(|id| {
            Ok(if id == "bad" {
                wr(id, WorkRequestStatus::Failed, 10.0)
            } else {
                wr(id, WorkRequestStatus::Succeeded, 100.0)
            })
        });
        let requests = BTreeMap::from([
            ("bad".to_string(), "amd64 image".to_string()),
            ("good".to_string(), "arm64 image".to_string()),
        ]);
        let err = wait_for_work_requests(Arc::new(oci), &requests, Duration::from_millis(5), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad"));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut oci = MockOciClient::new();
        oci.expect_get_work_request().returning(move |id| {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::transient("throttled"))
            } else {
                Ok(wr(id, WorkRequestStatus::Succeeded, 100.0))
            }
        });
        let requests = BTreeMap::from([("wr1".to_string(), "image".to_string())]);
        wait_for_work_requests(Arc::new(oci), &requests, Duration::from_millis(5), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn nothing_to_wait_for() {
        let oci = MockOciClient::new();
        wait_for_work_requests(Arc::new(oci), &BTreeMap::new(), Duration::from_millis(5), false)
            .await
            .unwrap();
    }
}
