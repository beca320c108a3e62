//! Dispatcher side of the remote protocol: one invoker per node-host
//! connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::capability::{CapabilitySet, NODE_COUNT};
use crate::container::JobInvocationReceiver;
use crate::dispatcher::{JobInvoker, JobInvokerRegister};
use crate::identifier::IdentifierMap;
use crate::job::{CalculationJob, CalculationJobSpec};
use crate::remote::message::RemoteNodeMessage;

struct PendingJob {
    job: CalculationJob,
    receiver: Arc<dyn JobInvocationReceiver>,
    /// Only root jobs count against the admission counter; tails ride along.
    root: bool,
}

/// Presents one remote node host as a [`JobInvoker`].
///
/// Admission is counted against the host's last advertised capacity:
/// `invoke` refuses when saturated and the invoker re-enters the rotation
/// through the availability callback once a result frees a slot. Pending
/// receivers are keyed by job specification; a duplicate or late message for
/// a removed key is logged and dropped. Connection loss fails every pending
/// receiver and retires the invoker permanently.
pub struct RemoteNodeJobInvoker {
    self_ref: Weak<RemoteNodeJobInvoker>,
    outbound: UnboundedSender<RemoteNodeMessage>,
    invoker_id: String,
    identifiers: Arc<dyn IdentifierMap>,
    capacity: AtomicUsize,
    launched: AtomicUsize,
    retired: AtomicBool,
    pending: Mutex<HashMap<CalculationJobSpec, PendingJob>>,
    availability: Mutex<Option<Arc<dyn JobInvokerRegister>>>,
}

impl RemoteNodeJobInvoker {
    pub fn new(
        outbound: UnboundedSender<RemoteNodeMessage>,
        host_id: impl Into<String>,
        capacity: usize,
        identifiers: Arc<dyn IdentifierMap>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            outbound,
            invoker_id: host_id.into(),
            identifiers,
            capacity: AtomicUsize::new(capacity),
            launched: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            availability: Mutex::new(None),
        })
    }

    /// Handles one inbound message from the host. Called by the connection's
    /// reader loop, so processing preserves arrival order.
    pub fn handle_message(&self, message: RemoteNodeMessage) {
        match message {
            RemoteNodeMessage::Ready { capacity, host_id } => {
                tracing::info!(invoker = %self.invoker_id, host_id = %host_id, capacity, "Capacity re-advertised");
                self.capacity.store(capacity, Ordering::SeqCst);
                self.fire_availability();
            }
            RemoteNodeMessage::Result { result, ready } => {
                if let Some(ready) = ready {
                    self.capacity.store(ready, Ordering::SeqCst);
                }
                let pending = self
                    .pending
                    .lock()
                    .expect("invoker poisoned")
                    .remove(&result.spec);
                match pending {
                    None => {
                        tracing::debug!(job = %result.spec, "Duplicate or late result message, dropped")
                    }
                    Some(pending) => {
                        if pending.root {
                            self.launched.fetch_sub(1, Ordering::SeqCst);
                        }
                        pending.receiver.job_completed(result);
                        self.fire_availability();
                    }
                }
            }
            RemoteNodeMessage::Failure {
                spec,
                message,
                node_id,
                ready,
            } => {
                if let Some(ready) = ready {
                    self.capacity.store(ready, Ordering::SeqCst);
                }
                let pending = self.pending.lock().expect("invoker poisoned").remove(&spec);
                match pending {
                    None => {
                        tracing::debug!(job = %spec, "Duplicate or late failure message, dropped")
                    }
                    Some(pending) => {
                        if pending.root {
                            self.launched.fetch_sub(1, Ordering::SeqCst);
                        }
                        pending.receiver.job_failed(&pending.job, &node_id, &message);
                        self.fire_availability();
                    }
                }
            }
            RemoteNodeMessage::Busy { spec } => {
                tracing::debug!(job = %spec, invoker = %self.invoker_id, "Host accepted a tail job");
            }
            RemoteNodeMessage::Invocations { statistics } => {
                tracing::debug!(
                    invoker = %self.invoker_id,
                    samples = statistics.len(),
                    "Received invocation cost samples"
                );
            }
            other => {
                tracing::warn!(message = ?other, "Unexpected message at dispatcher, dropped");
            }
        }
    }

    /// Fails all pending jobs and retires the invoker. Called when the
    /// connection's reader loop ends.
    pub fn connection_lost(&self) {
        if self.retired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.availability.lock().expect("invoker poisoned").take();
        let pending: Vec<PendingJob> = {
            let mut map = self.pending.lock().expect("invoker poisoned");
            map.drain().map(|(_, p)| p).collect()
        };
        tracing::warn!(
            invoker = %self.invoker_id,
            pending = pending.len(),
            "Connection lost, failing pending jobs and retiring invoker"
        );
        for entry in pending {
            entry
                .receiver
                .job_failed(&entry.job, &self.invoker_id, "connection to node host lost");
        }
    }

    fn has_spare_capacity(&self) -> bool {
        self.launched.load(Ordering::SeqCst) < self.capacity.load(Ordering::SeqCst)
    }

    fn fire_availability(&self) {
        if !self.has_spare_capacity() || self.retired.load(Ordering::SeqCst) {
            return;
        }
        let register = self.availability.lock().expect("invoker poisoned").take();
        if let (Some(register), Some(invoker)) = (register, self.self_ref.upgrade()) {
            tracing::debug!(invoker = %self.invoker_id, "Capacity available again, re-registering");
            register.register_job_invoker(invoker);
        }
    }
}

#[async_trait]
impl JobInvoker for RemoteNodeJobInvoker {
    fn invoker_id(&self) -> Option<String> {
        if self.retired.load(Ordering::SeqCst) {
            None
        } else {
            Some(self.invoker_id.clone())
        }
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::new().with(NODE_COUNT, self.capacity.load(Ordering::SeqCst) as f64)
    }

    async fn invoke(&self, job: &CalculationJob, receiver: Arc<dyn JobInvocationReceiver>) -> bool {
        if self.retired.load(Ordering::SeqCst) {
            return false;
        }
        if self.launched.fetch_add(1, Ordering::SeqCst) >= self.capacity.load(Ordering::SeqCst) {
            self.launched.fetch_sub(1, Ordering::SeqCst);
            return false;
        }

        // Register receivers before sending so a result racing back over the
        // connection always finds its entry.
        let jobs = job.flatten();
        {
            let mut pending = self.pending.lock().expect("invoker poisoned");
            for (index, entry) in jobs.iter().enumerate() {
                let mut single = (*entry).clone();
                single.tail.clear();
                pending.insert(
                    entry.spec.clone(),
                    PendingJob {
                        job: single,
                        receiver: receiver.clone(),
                        root: index == 0,
                    },
                );
            }
        }
        for entry in jobs {
            let mut wire = entry.clone();
            wire.tail.clear();
            wire.convert_identifiers(self.identifiers.as_ref());
            if self
                .outbound
                .send(RemoteNodeMessage::Execute { job: wire })
                .is_err()
            {
                self.connection_lost();
                return true;
            }
        }
        true
    }

    async fn cancel(&self, jobs: &[CalculationJobSpec]) {
        let _ = self.outbound.send(RemoteNodeMessage::Cancel {
            jobs: jobs.to_vec(),
        });
    }

    async fn is_alive(&self, jobs: &[CalculationJobSpec]) -> bool {
        if self.retired.load(Ordering::SeqCst) {
            return false;
        }
        // Optimistic: the host answers with Failure messages for dead jobs.
        self.outbound
            .send(RemoteNodeMessage::IsAlive {
                jobs: jobs.to_vec(),
            })
            .is_ok()
    }

    fn notify_when_available(&self, register: Arc<dyn JobInvokerRegister>) -> bool {
        if self.has_spare_capacity() {
            return true;
        }
        *self.availability.lock().expect("invoker poisoned") = Some(register);
        // A slot may have freed between the check and the store.
        self.fire_availability();
        false
    }
}
