//! Concurrent waiters with a progress display
//!
//! A [`Waiter`] is one task with one completion cell: it polls something
//! (a work request, a script pod, an API server) and reports progress through
//! its [`WaiterHandle`]. [`wait_for_all`] runs a set of waiters concurrently and
//! redraws one progress bar per waiter every 500 ms. The display loop is the only
//! reader of the cells; each task writes only its own.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::{Error, Result};

/// Redraw cadence of the progress display
pub const REDRAW_INTERVAL: Duration = Duration::from_millis(500);

type Task = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Lifecycle of a single waiter
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaiterState {
    /// Still polling
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished with the given error message
    Failed(String),
}

#[derive(Clone, Debug)]
struct WaiterStatus {
    message: String,
    percent: Option<u64>,
    state: WaiterState,
}

/// Handle a waiter task uses to publish progress
#[derive(Clone, Debug)]
pub struct WaiterHandle {
    cell: Arc<Mutex<WaiterStatus>>,
}

impl WaiterHandle {
    fn update(&self, f: impl FnOnce(&mut WaiterStatus)) {
        let mut guard = self.cell.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard);
    }

    /// Replace the status message shown next to the label
    pub fn set_message(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|s| s.message = message);
    }

    /// Set percent complete (clamped to 100)
    pub fn set_percent(&self, percent: u64) {
        self.update(|s| s.percent = Some(percent.min(100)));
    }

    fn finish(&self, result: &Result<()>) {
        self.update(|s| {
            s.state = match result {
                Ok(()) => WaiterState::Succeeded,
                Err(e) => WaiterState::Failed(e.to_string()),
            }
        });
    }

    fn snapshot(&self) -> WaiterStatus {
        self.cell.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// One unit of waiting
pub struct Waiter {
    label: String,
    handle: WaiterHandle,
    task: Task,
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter").field("label", &self.label).finish()
    }
}

impl Waiter {
    /// Create a waiter; `f` receives the handle it reports progress through
    pub fn new<F, Fut>(label: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(WaiterHandle) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handle = WaiterHandle {
            cell: Arc::new(Mutex::new(WaiterStatus {
                message: String::new(),
                percent: None,
                state: WaiterState::Running,
            })),
        };
        let task = Box::pin(f(handle.clone()));
        Self {
            label: label.into(),
            handle,
            task,
        }
    }

    /// Label shown as the bar prefix
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Outcome of one waiter after [`wait_for_all`] returns
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaiterReport {
    /// Waiter label
    pub label: String,
    /// Terminal state
    pub state: WaiterState,
}

fn running_style(with_bar: bool) -> ProgressStyle {
    let template = if with_bar {
        "{spinner:.cyan} {prefix} [{bar:30.cyan/blue}] {pos:>3}% {wide_msg}"
    } else {
        "{spinner:.cyan} {prefix} {wide_msg}"
    };
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .progress_chars("#>.")
}

fn finished_style(failed: bool) -> ProgressStyle {
    let template = if failed {
        "{prefix} {msg:.red}"
    } else {
        "{prefix} {msg:.green}"
    };
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

struct Bar {
    pb: ProgressBar,
    done: bool,
}

fn redraw(bars: &mut [Bar], waiters: &[(String, WaiterHandle)]) {
    for (bar, (label, handle)) in bars.iter_mut().zip(waiters) {
        if bar.done {
            continue;
        }
        let status = handle.snapshot();
        match &status.state {
            WaiterState::Running => {
                if let Some(p) = status.percent {
                    if bar.pb.length().is_none() {
                        bar.pb.set_length(100);
                        bar.pb.set_style(running_style(true));
                    }
                    bar.pb.set_position(p);
                }
                bar.pb.set_message(status.message.clone());
                bar.pb.tick();
            }
            WaiterState::Succeeded => {
                bar.pb.set_style(finished_style(false));
                bar.pb.finish_with_message("done");
                bar.done = true;
            }
            WaiterState::Failed(msg) => {
                bar.pb.set_style(finished_style(true));
                bar.pb.finish_with_message(format!("failed: {msg}"));
                bar.done = true;
                error!(waiter = %label, error = %msg, "Waiter failed");
            }
        }
    }
}

/// Run every waiter to completion and report the first failure
///
/// Waiters are independent: a failing waiter does not cancel the others, which
/// keep running until their own terminal state. When `show_ui` is false the
/// progress bars are hidden and only log lines are emitted.
pub async fn wait_for_all(waiters: Vec<Waiter>, show_ui: bool) -> Result<Vec<WaiterReport>> {
    let multi = if show_ui {
        MultiProgress::new()
    } else {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    };

    let mut handles = Vec::with_capacity(waiters.len());
    let mut bars = Vec::with_capacity(waiters.len());
    let mut set = JoinSet::new();

    for (idx, waiter) in waiters.into_iter().enumerate() {
        let pb = multi.add(ProgressBar::new_spinner());
        pb.set_style(running_style(false));
        pb.set_prefix(waiter.label.clone());
        bars.push(Bar { pb, done: false });

        let handle = waiter.handle.clone();
        handles.push((waiter.label, waiter.handle));
        let task = waiter.task;
        set.spawn(async move {
            let result = task.await;
            handle.finish(&result);
            (idx, result)
        });
    }

    let mut results: Vec<Option<Result<()>>> = (0..handles.len()).map(|_| None).collect();
    let mut ticker = tokio::time::interval(REDRAW_INTERVAL);
    while !set.is_empty() {
        tokio::select! {
            _ = ticker.tick() => redraw(&mut bars, &handles),
            joined = set.join_next() => match joined {
                Some(Ok((idx, res))) => results[idx] = Some(res),
                Some(Err(e)) => error!(error = %e, "Waiter task panicked"),
                None => break,
            },
        }
    }
    redraw(&mut bars, &handles);

    let mut first_failure: Option<Error> = None;
    let mut reports = Vec::with_capacity(handles.len());
    for ((label, handle), result) in handles.iter().zip(results) {
        let state = match result {
            Some(Ok(())) => WaiterState::Succeeded,
            Some(Err(e)) => {
                let state = WaiterState::Failed(e.to_string());
                if first_failure.is_none() {
                    first_failure = Some(e.with_context(label));
                }
                state
            }
            None => {
                let msg = "task did not complete".to_string();
                if first_failure.is_none() {
                    first_failure = Some(Error::fatal(format!("{label}: {msg}")));
                }
                handle.update(|s| s.state = WaiterState::Failed(msg.clone()));
                WaiterState::Failed(msg)
            }
        };
        reports.push(WaiterReport {
            label: label.clone(),
            state,
        });
    }

    match first_failure {
        Some(e) => Err(e),
        None => {
            info!(count = reports.len(), "All waiters finished");
            Ok(reports)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn all_succeed() {
        let waiters = (0..3)
            .map(|i| {
                Waiter::new(format!("task-{i}"), move |h| async move {
                    h.set_message("polling");
                    h.set_percent(50);
                    tokio::time::sleep(Duration::from_millis(10 * i)).await;
                    h.set_percent(100);
                    Ok(())
                })
            })
            .collect();
        let reports = wait_for_all(waiters, false).await.unwrap();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.state == WaiterState::Succeeded));
        assert_eq!(reports[2].label, "task-2");
    }

    /// Story: one import fails while another keeps going to completion
    #[tokio::test]
    async fn story_failure_does_not_cancel_siblings() {
        let finished = Arc::new(AtomicBool::new(false));
        let f = finished.clone();
        let waiters = vec![
            Waiter::new("import amd64", |_| async {
                Err(Error::fatal("work request FAILED"))
            }),
            Waiter::new("import arm64", move |_| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                f.store(true, Ordering::SeqCst);
                Ok(())
            }),
        ];
        let err = wait_for_all(waiters, false).await.unwrap_err();
        assert!(finished.load(Ordering::SeqCst));
        let msg = err.to_string();
        assert!(msg.contains("import amd64"));
        assert!(msg.contains("work request FAILED"));
    }

    #[test]
    fn percent_is_clamped() {
        let w = Waiter::new("x", |_| async { Ok(()) });
        w.handle.set_percent(250);
        assert_eq!(w.handle.snapshot().percent, Some(100));
    }

    #[tokio::test]
    async fn empty_set_is_ok() {
        assert!(wait_for_all(Vec::new(), false).await.unwrap().is_empty());
    }
}
