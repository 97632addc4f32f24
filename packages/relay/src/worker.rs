//! Remote worker slots and the orchestrator's registry.

use std::sync::Mutex;

use color_eyre::{Result, eyre::bail};
use derive_more::Display;
use quarry::scheduler::WorkerId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    call::RpcFailure,
    events::{EventLevel, WorkerForwardedEvent, report},
    protocol::{AttachCompletedInfo, ServiceLocation},
};

/// Lifecycle of a remote worker slot.
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize, strum::EnumIter,
)]
pub enum WorkerStatus {
    /// A dynamic slot waiting for a `Hello`.
    NotStarted,

    /// The worker's location is known; attachment has not begun.
    Known,

    /// An attach call is in flight.
    Attaching,

    /// Attached and accepting pips.
    Attached,

    /// Exited at the orchestrator's request.
    Stopped,

    /// Lost to a timeout, an unrecoverable error, or a session mismatch.
    Failed,
}

/// Why a worker was declared failed.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize)]
pub enum WorkerFailure {
    ReconnectionTimeout,
    AttachmentTimeout,
    UnrecoverableFailure,
    InvocationMismatch,
    CallDeadlineExceeded,
}

impl WorkerFailure {
    /// Map a call failure to the worker-level classification, when the
    /// failure is one that dooms the worker.
    pub fn from_rpc(failure: &RpcFailure) -> Option<Self> {
        match failure {
            RpcFailure::UnrecoverableFailure => Some(Self::UnrecoverableFailure),
            RpcFailure::InvocationMismatch => Some(Self::InvocationMismatch),
            RpcFailure::CallDeadlineExceeded => Some(Self::CallDeadlineExceeded),
            RpcFailure::AttachmentTimeout => Some(Self::AttachmentTimeout),
            RpcFailure::ReconnectionTimeout => Some(Self::ReconnectionTimeout),
            RpcFailure::Transient { .. } | RpcFailure::Failed { .. } => None,
        }
    }
}

/// One remote worker slot.
#[derive(Clone, Debug)]
pub struct WorkerSlot {
    pub id: WorkerId,
    pub location: Option<ServiceLocation>,
    pub status: WorkerStatus,
    pub failure: Option<WorkerFailure>,
}

/// The outcome of admitting a `Hello`.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
pub enum HelloOutcome {
    /// A dynamic slot was bound to the announced location.
    #[display("bound {_0}")]
    Bound(WorkerId),

    /// The location was already known; the hello is acknowledged without
    /// change.
    #[display("already known as {_0}")]
    AlreadyKnown(WorkerId),

    /// Every slot is taken.
    NoSlot,
}

/// The orchestrator's dense registry of remote worker slots.
///
/// Worker 0 is the local process and is not represented here; remote
/// slots are numbered from 1. Back-references into the registry are
/// always ids, never owned slots.
pub struct Orchestrator {
    slots: Mutex<Vec<WorkerSlot>>,
}

impl Orchestrator {
    /// Create the registry. `Some(location)` entries are statically known
    /// workers; `None` entries are dynamic slots filled by `Hello`s.
    pub fn new(locations: Vec<Option<ServiceLocation>>) -> Self {
        let slots = locations
            .into_iter()
            .enumerate()
            .map(|(index, location)| WorkerSlot {
                id: WorkerId(index as u32 + 1),
                status: if location.is_some() {
                    WorkerStatus::Known
                } else {
                    WorkerStatus::NotStarted
                },
                location,
                failure: None,
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    fn with_slots<T>(&self, f: impl FnOnce(&mut Vec<WorkerSlot>) -> T) -> T {
        f(&mut self.slots.lock().expect("worker registry poisoned"))
    }

    /// Admit a dynamic worker's `Hello`.
    #[instrument(skip(self), fields(%location))]
    pub fn handle_hello(&self, location: ServiceLocation) -> HelloOutcome {
        self.with_slots(|slots| {
            if let Some(slot) = slots
                .iter()
                .find(|slot| slot.location.as_ref() == Some(&location))
            {
                debug!(worker = %slot.id, "hello from a known location");
                return HelloOutcome::AlreadyKnown(slot.id);
            }

            match slots
                .iter_mut()
                .find(|slot| slot.location.is_none() && slot.status == WorkerStatus::NotStarted)
            {
                Some(slot) => {
                    info!(worker = %slot.id, "bound dynamic worker slot");
                    slot.location = Some(location);
                    slot.status = WorkerStatus::Known;
                    HelloOutcome::Bound(slot.id)
                }
                None => {
                    warn!("no worker slot available for hello");
                    HelloOutcome::NoSlot
                }
            }
        })
    }

    /// Record that an attach call is going out to a known worker.
    pub fn begin_attach(&self, worker: WorkerId) -> Result<()> {
        self.with_slots(|slots| {
            let slot = slot_mut(slots, worker)?;
            if slot.status != WorkerStatus::Known {
                bail!("cannot attach worker {worker} in status {}", slot.status);
            }
            slot.status = WorkerStatus::Attaching;
            Ok(())
        })
    }

    /// Complete attachment from the worker's `AttachCompleted`.
    #[instrument(skip_all, fields(worker = %info.worker_id))]
    pub fn handle_attach_completed(&self, info: &AttachCompletedInfo) -> Result<()> {
        self.with_slots(|slots| {
            let slot = slot_mut(slots, info.worker_id)?;
            if slot.status != WorkerStatus::Attaching {
                bail!(
                    "attach completion for worker {} in status {}",
                    info.worker_id,
                    slot.status,
                );
            }
            info!(
                slots = info.available_process_slots,
                ram_mb = info.available_ram_mb,
                "worker attached",
            );
            slot.status = WorkerStatus::Attached;
            Ok(())
        })
    }

    /// Drive a worker to `Stopped` as part of orchestrator exit.
    pub fn request_exit(&self, worker: WorkerId) -> Result<()> {
        self.with_slots(|slots| {
            let slot = slot_mut(slots, worker)?;
            if slot.status != WorkerStatus::Failed {
                slot.status = WorkerStatus::Stopped;
            }
            Ok(())
        })
    }

    /// Declare a worker failed; any state may transition here.
    pub fn mark_failed(&self, worker: WorkerId, failure: WorkerFailure) {
        self.with_slots(|slots| {
            if let Ok(slot) = slot_mut(slots, worker) {
                warn!(%worker, %failure, "worker failed");
                slot.status = WorkerStatus::Failed;
                slot.failure = Some(failure);
            }
        });
    }

    pub fn status(&self, worker: WorkerId) -> Option<WorkerStatus> {
        self.with_slots(|slots| {
            slots
                .iter()
                .find(|slot| slot.id == worker)
                .map(|slot| slot.status)
        })
    }

    pub fn slot(&self, worker: WorkerId) -> Option<WorkerSlot> {
        self.with_slots(|slots| slots.iter().find(|slot| slot.id == worker).cloned())
    }

    /// Workers currently able to take pips.
    pub fn attached_workers(&self) -> Vec<WorkerId> {
        self.with_slots(|slots| {
            slots
                .iter()
                .filter(|slot| slot.status == WorkerStatus::Attached)
                .map(|slot| slot.id)
                .collect()
        })
    }

    /// Report a forwarded event, applying the demotion rules for this
    /// worker's status.
    pub fn handle_forwarded_event(
        &self,
        worker: WorkerId,
        event: &WorkerForwardedEvent,
    ) -> EventLevel {
        let status = self.status(worker).unwrap_or(WorkerStatus::Failed);
        report(event, status)
    }
}

fn slot_mut(slots: &mut [WorkerSlot], worker: WorkerId) -> Result<&mut WorkerSlot> {
    match slots.iter_mut().find(|slot| slot.id == worker) {
        Some(slot) => Ok(slot),
        None => bail!("unknown worker id {worker}"),
    }
}
