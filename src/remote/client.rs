//! Node-host side of the remote protocol: presents the local execution
//! container to a dispatcher over one connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::container::{CalculationNodeContainer, JobInvocationReceiver};
use crate::error::{CalcGridError, Result};
use crate::function::FunctionRepository;
use crate::identifier::IdentifierMap;
use crate::job::{CalculationJob, CalculationJobResult};
use crate::remote::channel;
use crate::remote::message::RemoteNodeMessage;
use crate::stats::{NodeStatisticsGatherer, TotallingStatistics};

pub struct RemoteNodeClient {
    container: Arc<CalculationNodeContainer>,
    functions: Arc<dyn FunctionRepository>,
    identifiers: Arc<dyn IdentifierMap>,
    node_stats: Arc<dyn NodeStatisticsGatherer>,
    invocation_stats: Arc<TotallingStatistics>,
    statistics_interval: Duration,
    host_id: String,
}

impl RemoteNodeClient {
    pub fn new(
        container: Arc<CalculationNodeContainer>,
        functions: Arc<dyn FunctionRepository>,
        identifiers: Arc<dyn IdentifierMap>,
        host_id: impl Into<String>,
    ) -> Self {
        Self {
            container,
            functions,
            identifiers,
            node_stats: Arc::new(crate::stats::DiscardingStatistics),
            invocation_stats: Arc::new(TotallingStatistics::new()),
            statistics_interval: Duration::from_secs(60),
            host_id: host_id.into(),
        }
    }

    pub fn with_node_statistics(mut self, stats: Arc<dyn NodeStatisticsGatherer>) -> Self {
        self.node_stats = stats;
        self
    }

    /// Statistics gatherer whose samples are periodically drained into
    /// `Invocations` messages. Share it with the container's nodes.
    pub fn with_invocation_statistics(mut self, stats: Arc<TotallingStatistics>) -> Self {
        self.invocation_stats = stats;
        self
    }

    pub fn with_statistics_interval(mut self, interval: Duration) -> Self {
        self.statistics_interval = interval;
        self
    }

    /// Connects to the dispatcher and serves until the connection drops or
    /// shutdown is signalled.
    pub async fn connect(
        self,
        addr: std::net::SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<()> {
        tracing::info!(%addr, host_id = %self.host_id, "Connecting to dispatcher");
        let stream = TcpStream::connect(addr).await?;
        self.run(stream, shutdown).await
    }

    /// Serves the protocol over an established stream. Messages are handled
    /// strictly in arrival order: a `Cancel` can never overtake the
    /// `Execute` it targets.
    pub async fn run<S>(self, stream: S, shutdown: CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (writer, mut reader) = channel::split(stream);
        // Tear the writer down with this method, whichever way it exits, so
        // the dispatcher observes the connection closing.
        let writer_shutdown = shutdown.child_token();
        let _writer_guard = writer_shutdown.clone().drop_guard();
        let outbound = channel::spawn_writer(writer, writer_shutdown);
        outbound
            .send(RemoteNodeMessage::Ready {
                capacity: self.container.node_count(),
                host_id: self.host_id.clone(),
            })
            .map_err(|_| CalcGridError::ConnectionLost)?;

        let mut stats_interval = tokio::time::interval(self.statistics_interval);
        stats_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        stats_interval.reset();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(host_id = %self.host_id, "Node host shutting down");
                    return Ok(());
                }
                _ = stats_interval.tick() => {
                    let statistics = self.invocation_stats.drain();
                    if !statistics.is_empty() {
                        let _ = outbound.send(RemoteNodeMessage::Invocations { statistics });
                    }
                }
                message = reader.next() => match message {
                    None => {
                        tracing::info!(host_id = %self.host_id, "Dispatcher closed the connection");
                        return Ok(());
                    }
                    Some(Err(error)) => {
                        tracing::warn!(error = %error, "Connection error, disconnecting");
                        return Err(error);
                    }
                    Some(Ok(message)) => self.handle(message, &outbound),
                }
            }
        }
    }

    fn handle(&self, message: RemoteNodeMessage, outbound: &UnboundedSender<RemoteNodeMessage>) {
        match message {
            RemoteNodeMessage::Init { function_init_id } => {
                if self.functions.init_id() != function_init_id {
                    self.functions.reinitialize(function_init_id);
                }
            }
            RemoteNodeMessage::Execute { mut job } => {
                if let Err(error) = job.resolve_identifiers(self.identifiers.as_ref()) {
                    tracing::warn!(job = %job.spec, error = %error, "Failed to resolve job identifiers");
                    let _ = outbound.send(RemoteNodeMessage::Failure {
                        spec: job.spec.clone(),
                        message: error.to_string(),
                        node_id: self.host_id.clone(),
                        ready: None,
                    });
                    return;
                }
                if job.required_job_ids.is_some() {
                    // Tail job riding on its parent's submission.
                    let _ = outbound.send(RemoteNodeMessage::Busy {
                        spec: job.spec.clone(),
                    });
                }
                let receiver = Arc::new(ResultForwarder {
                    outbound: outbound.clone(),
                    stats: self.node_stats.clone(),
                    host_id: self.host_id.clone(),
                });
                self.container.add_job(job, receiver);
            }
            RemoteNodeMessage::Cancel { jobs } => {
                for spec in &jobs {
                    self.container.cancel(spec);
                }
            }
            RemoteNodeMessage::IsAlive { jobs } => {
                for spec in jobs {
                    if !self.container.is_alive(&spec) {
                        tracing::warn!(job = %spec, "Liveness probe for an unknown job");
                        let _ = outbound.send(RemoteNodeMessage::Failure {
                            spec,
                            message: "job is not executing on this host".to_string(),
                            node_id: self.host_id.clone(),
                            ready: None,
                        });
                    }
                }
            }
            other => {
                tracing::warn!(message = ?other, "Unexpected message at node host, dropped");
            }
        }
    }
}

/// Forwards container callbacks back over the connection.
struct ResultForwarder {
    outbound: UnboundedSender<RemoteNodeMessage>,
    stats: Arc<dyn NodeStatisticsGatherer>,
    host_id: String,
}

impl JobInvocationReceiver for ResultForwarder {
    fn job_completed(&self, result: CalculationJobResult) {
        self.stats
            .job_completed(&result.node_id, result.items.len(), result.duration());
        let _ = self.outbound.send(RemoteNodeMessage::Result {
            result,
            ready: None,
        });
    }

    fn job_failed(&self, job: &CalculationJob, node_id: &str, error: &str) {
        self.stats.job_failed(node_id, Duration::ZERO);
        let node_id = if node_id.is_empty() {
            self.host_id.clone()
        } else {
            node_id.to_string()
        };
        let _ = self.outbound.send(RemoteNodeMessage::Failure {
            spec: job.spec.clone(),
            message: error.to_string(),
            node_id,
            ready: None,
        });
    }
}
