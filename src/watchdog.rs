//! Maximum job-item execution watchdog.
//!
//! A calculation node registers each item invocation before running it and
//! deregisters it when the invocation returns (the guard does this on drop).
//! A single scan task checks registered invocations against the configured
//! bound and cancels the invocation token of anything overdue. This is a
//! coarse escape hatch for runaway functions, not a cancellation protocol:
//! the node observes the cancelled token as a per-item failure and carries on
//! with the rest of the job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WatchdogConfig;

struct RunningItem {
    function_id: String,
    started: Instant,
    token: CancellationToken,
}

pub struct ExecutionWatchdog {
    config: WatchdogConfig,
    running: Arc<Mutex<HashMap<u64, RunningItem>>>,
    next_id: AtomicU64,
    scan_task: Option<JoinHandle<()>>,
}

impl ExecutionWatchdog {
    /// Creates the watchdog and, if a bound is configured, spawns its scan
    /// task on the current runtime.
    pub fn new(config: WatchdogConfig) -> Self {
        let running: Arc<Mutex<HashMap<u64, RunningItem>>> = Arc::new(Mutex::new(HashMap::new()));
        let scan_task = config.max_item_execution.map(|max| {
            let running = running.clone();
            let scan_interval = config.scan_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(scan_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    let mut running = running.lock().expect("watchdog poisoned");
                    running.retain(|_, item| {
                        if item.started.elapsed() > max {
                            tracing::warn!(
                                function_id = %item.function_id,
                                elapsed_ms = item.started.elapsed().as_millis() as u64,
                                "Interrupting job item that exceeded the execution bound"
                            );
                            item.token.cancel();
                            false
                        } else {
                            true
                        }
                    });
                }
            })
        });
        Self {
            config,
            running,
            next_id: AtomicU64::new(0),
            scan_task,
        }
    }

    /// Disabled watchdog; items run unbounded.
    pub fn disabled() -> Self {
        Self::new(WatchdogConfig::default())
    }

    /// Registers an item invocation. The returned guard deregisters on drop;
    /// hold it across the invocation future.
    pub fn execution_started(
        self: &Arc<Self>,
        function_id: &str,
        token: CancellationToken,
    ) -> ExecutionGuard {
        if self.config.max_item_execution.is_none() {
            return ExecutionGuard {
                watchdog: self.clone(),
                id: None,
            };
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.running.lock().expect("watchdog poisoned").insert(
            id,
            RunningItem {
                function_id: function_id.to_string(),
                started: Instant::now(),
                token,
            },
        );
        ExecutionGuard {
            watchdog: self.clone(),
            id: Some(id),
        }
    }

    fn execution_stopped(&self, id: u64) {
        self.running.lock().expect("watchdog poisoned").remove(&id);
    }
}

impl Drop for ExecutionWatchdog {
    fn drop(&mut self) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
    }
}

pub struct ExecutionGuard {
    watchdog: Arc<ExecutionWatchdog>,
    id: Option<u64>,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.watchdog.execution_stopped(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn overdue_item_is_interrupted() {
        let watchdog = Arc::new(ExecutionWatchdog::new(
            WatchdogConfig::default()
                .with_max_item_execution(Duration::from_millis(20))
                .with_scan_interval(Duration::from_millis(10)),
        ));
        let token = CancellationToken::new();
        let _guard = watchdog.execution_started("fn-runaway", token.clone());

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("watchdog should cancel an overdue item");
    }

    #[tokio::test]
    async fn finished_item_is_not_interrupted() {
        let watchdog = Arc::new(ExecutionWatchdog::new(
            WatchdogConfig::default()
                .with_max_item_execution(Duration::from_millis(20))
                .with_scan_interval(Duration::from_millis(10)),
        ));
        let token = CancellationToken::new();
        {
            let _guard = watchdog.execution_started("fn-quick", token.clone());
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn disabled_watchdog_never_interrupts() {
        let watchdog = Arc::new(ExecutionWatchdog::disabled());
        let token = CancellationToken::new();
        let _guard = watchdog.execution_started("fn-any", token.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!token.is_cancelled());
    }
}
