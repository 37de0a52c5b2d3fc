use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use toolsmith_core::JobId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Running,
    Paused,
    Cancelled,
}

/// Pause, resume and cancel switches for jobs. The orchestrator checks the
/// gate before each step, so an in-flight agent call always runs to completion.
#[derive(Default)]
pub struct JobControls {
    gates: DashMap<JobId, watch::Sender<GateState>>,
}

/// Receiving side of a job's gate.
pub struct JobGate {
    rx: watch::Receiver<GateState>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct GateClosed;

impl JobGate {
    /// Wait until the job may proceed. Errors once the job is cancelled.
    pub async fn ready(&mut self) -> Result<(), GateClosed> {
        loop {
            let state = *self.rx.borrow_and_update();
            match state {
                GateState::Running => return Ok(()),
                GateState::Cancelled => return Err(GateClosed),
                GateState::Paused => {
                    if self.rx.changed().await.is_err() {
                        return Err(GateClosed);
                    }
                }
            }
        }
    }
}

impl JobControls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the job controllable. Existing state is kept.
    pub fn register(&self, job_id: &JobId) {
        self.gates
            .entry(job_id.clone())
            .or_insert_with(|| watch::channel(GateState::Running).0);
    }

    pub fn gate(&self, job_id: &JobId) -> JobGate {
        let sender = self
            .gates
            .entry(job_id.clone())
            .or_insert_with(|| watch::channel(GateState::Running).0);
        JobGate { rx: sender.subscribe() }
    }

    fn transition(&self, job_id: &JobId, from: &[GateState], to: GateState) -> bool {
        let Some(sender) = self.gates.get(job_id) else {
            return false;
        };
        let changed = sender.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            info!(job_id = %job_id, state = ?to, "job gate changed");
        }
        changed
    }

    pub fn pause(&self, job_id: &JobId) -> bool {
        self.transition(job_id, &[GateState::Running], GateState::Paused)
    }

    pub fn resume(&self, job_id: &JobId) -> bool {
        self.transition(job_id, &[GateState::Paused], GateState::Running)
    }

    pub fn cancel(&self, job_id: &JobId) -> bool {
        self.transition(job_id, &[GateState::Running, GateState::Paused], GateState::Cancelled)
    }

    pub fn state(&self, job_id: &JobId) -> Option<GateState> {
        self.gates.get(job_id).map(|sender| *sender.borrow())
    }

    /// Forget a finished job.
    pub fn release(&self, job_id: &JobId) {
        self.gates.remove(job_id);
    }
}
