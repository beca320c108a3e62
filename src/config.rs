use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the job dispatcher's retry and timeout behaviour.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Terminal failure is reported after this many failed attempts.
    pub max_job_attempts: usize,
    /// Wall-clock budget for one job execution, across liveness re-arms.
    pub max_job_execution_time: Duration,
    /// Interval between liveness queries while a job is in flight.
    pub max_job_execution_time_query: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_job_attempts: 3,
            max_job_execution_time: Duration::from_secs(300),
            max_job_execution_time_query: Duration::from_secs(10),
        }
    }
}

impl DispatcherConfig {
    pub fn with_max_job_attempts(mut self, attempts: usize) -> Self {
        self.max_job_attempts = attempts;
        self
    }

    pub fn with_max_job_execution_time(mut self, max: Duration) -> Self {
        self.max_job_execution_time = max;
        self
    }

    pub fn with_max_job_execution_time_query(mut self, interval: Duration) -> Self {
        self.max_job_execution_time_query = interval;
        self
    }
}

/// Configuration for a local execution container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Number of calculation nodes in the pool.
    pub node_count: usize,
    /// How long failed-job records are kept so that late-arriving dependents
    /// observe the failure instead of inferring success from absence.
    pub failure_retention: Duration,
    /// A retention sweep runs after every this many recorded failures.
    pub failure_sweep_interval: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            node_count: 4,
            failure_retention: Duration::from_secs(300),
            failure_sweep_interval: 100,
        }
    }
}

impl ContainerConfig {
    pub fn with_node_count(mut self, node_count: usize) -> Self {
        self.node_count = node_count;
        self
    }

    pub fn with_failure_retention(mut self, retention: Duration) -> Self {
        self.failure_retention = retention;
        self
    }

    pub fn with_failure_sweep_interval(mut self, interval: usize) -> Self {
        self.failure_sweep_interval = interval;
        self
    }
}

/// Configuration for the per-item execution watchdog.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Longest a single job item may run before its invocation is
    /// interrupted. `None` disables the watchdog.
    pub max_item_execution: Option<Duration>,
    /// How often running items are checked against the bound.
    pub scan_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_item_execution: None,
            scan_interval: Duration::from_secs(1),
        }
    }
}

impl WatchdogConfig {
    pub fn with_max_item_execution(mut self, max: Duration) -> Self {
        self.max_item_execution = Some(max);
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }
}

/// Configuration for a remote node host process.
#[derive(Debug, Clone)]
pub struct NodeHostConfig {
    /// Dispatcher address to connect to.
    pub dispatcher_addr: SocketAddr,
    pub container: ContainerConfig,
    pub watchdog: WatchdogConfig,
    /// Interval between `Invocations` cost-feedback messages.
    pub statistics_interval: Duration,
}

impl Default for NodeHostConfig {
    fn default() -> Self {
        Self {
            // SAFETY: hardcoded valid address that will always parse
            dispatcher_addr: "127.0.0.1:7470"
                .parse()
                .expect("default dispatcher address is valid"),
            container: ContainerConfig::default(),
            watchdog: WatchdogConfig::default(),
            statistics_interval: Duration::from_secs(60),
        }
    }
}
