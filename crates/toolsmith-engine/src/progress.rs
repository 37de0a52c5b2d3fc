//! Best-effort progress delivery.
//!
//! Events go to the job owner's push connections when a push transport is up
//! and the owner has connections; otherwise they are handed to local listeners
//! registered for the job. The choice is made on every emit.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use toolsmith_core::{ConnectionId, JobId, ProgressEvent, UserId};

pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

#[async_trait]
pub trait ProgressChannel: Send + Sync {
    /// Deliver `event` for a job owned by `owner`. Never fails.
    async fn emit(&self, owner: &UserId, event: &ProgressEvent);

    /// Register a local listener for one job.
    fn subscribe(&self, job_id: &JobId, callback: ProgressCallback) -> Subscription;
}

/// Read-only view of which push connections belong to a user.
#[async_trait]
pub trait ConnectionDirectory: Send + Sync {
    async fn connections_for_user(&self, user_id: &UserId) -> Vec<ConnectionId>;
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("connection {0} is gone")]
    Gone(ConnectionId),
    #[error("delivery failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    fn is_available(&self) -> bool;
    async fn send(&self, connection: &ConnectionId, message: &serde_json::Value) -> Result<(), DeliveryError>;
}

/// Local listeners keyed by job id.
///
/// A job's entry exists from its first subscription until its last one is dropped.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: DashMap<JobId, Vec<(u64, ProgressCallback)>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>, job_id: &JobId, callback: ProgressCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.entry(job_id.clone()).or_default().push((id, callback));
        Subscription {
            registry: Arc::downgrade(self),
            job_id: job_id.clone(),
            id,
            active: true,
        }
    }

    fn remove(&self, job_id: &JobId, id: u64) {
        let emptied = match self.listeners.get_mut(job_id) {
            Some(mut entry) => {
                entry.retain(|(existing, _)| *existing != id);
                entry.is_empty()
            }
            None => false,
        };
        if emptied {
            self.listeners.remove_if(job_id, |_, callbacks| callbacks.is_empty());
        }
    }

    /// Call every listener for the event's job. Returns how many were called.
    pub fn dispatch(&self, event: &ProgressEvent) -> usize {
        let callbacks: Vec<ProgressCallback> = match self.listeners.get(&event.job_id) {
            Some(entry) => entry.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return 0,
        };

        for callback in &callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!(job_id = %event.job_id, "progress listener panicked");
            }
        }
        callbacks.len()
    }

    pub fn listener_count(&self, job_id: &JobId) -> usize {
        self.listeners.get(job_id).map_or(0, |entry| entry.len())
    }

    pub fn job_count(&self) -> usize {
        self.listeners.len()
    }
}

/// Handle returned by `subscribe`. Dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Weak<ListenerRegistry>,
    job_id: JobId,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.job_id, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

struct Push {
    directory: Arc<dyn ConnectionDirectory>,
    transport: Arc<dyn PushTransport>,
}

/// The process progress channel: push delivery with a local-listener fallback.
pub struct ProgressHub {
    registry: Arc<ListenerRegistry>,
    push: Option<Push>,
}

impl ProgressHub {
    /// Fallback-only hub.
    pub fn local(registry: Arc<ListenerRegistry>) -> Self {
        Self { registry, push: None }
    }

    pub fn with_push(
        registry: Arc<ListenerRegistry>,
        directory: Arc<dyn ConnectionDirectory>,
        transport: Arc<dyn PushTransport>,
    ) -> Self {
        Self {
            registry,
            push: Some(Push { directory, transport }),
        }
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// Push to the owner's connections. Returns false when the fallback should be used.
    async fn try_push(&self, owner: &UserId, event: &ProgressEvent) -> bool {
        let Some(push) = &self.push else {
            return false;
        };
        if !push.transport.is_available() {
            return false;
        }
        let connections = push.directory.connections_for_user(owner).await;
        if connections.is_empty() {
            return false;
        }

        let message = event.to_wire();
        let mut delivered = 0usize;
        for connection in &connections {
            match push.transport.send(connection, &message).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    job_id = %event.job_id,
                    connection = %connection,
                    error = %e,
                    "skipping stale progress connection"
                ),
            }
        }
        debug!(
            job_id = %event.job_id,
            status = event.status.as_str(),
            delivered,
            attempted = connections.len(),
            "progress pushed"
        );
        true
    }
}

#[async_trait]
impl ProgressChannel for ProgressHub {
    async fn emit(&self, owner: &UserId, event: &ProgressEvent) {
        if self.try_push(owner, event).await {
            return;
        }
        if self.registry.dispatch(event) == 0 {
            debug!(
                job_id = %event.job_id,
                step = %event.step,
                status = event.status.as_str(),
                "no listeners, progress event dropped"
            );
        }
    }

    fn subscribe(&self, job_id: &JobId, callback: ProgressCallback) -> Subscription {
        self.registry.subscribe(job_id, callback)
    }
}
