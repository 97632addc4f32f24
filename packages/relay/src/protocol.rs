//! Wire messages between orchestrator and worker.
//!
//! Compatibility is byte-exact with respect to these shapes; fields are
//! added only at the end of a message, and none are ever repurposed.

use derive_more::Display;
use quarry::{pip::PipId, scheduler::WorkerId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::WorkerForwardedEvent;

/// Where a worker's service can be reached.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{ip}:{port}")]
pub struct ServiceLocation {
    pub ip: String,
    pub port: u16,
}

/// Worker → orchestrator: a dynamic worker announcing its location.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Hello {
    pub location: ServiceLocation,
}

/// Worker → orchestrator: attachment finished; the worker is ready for
/// pips.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct AttachCompletedInfo {
    pub worker_id: WorkerId,

    /// Process slots the worker offers.
    pub available_process_slots: u32,

    /// Cache-lookup slots the worker offers.
    pub available_cache_lookup_slots: u32,

    pub available_ram_mb: u64,
}

/// One pip's result, streamed back from a worker.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct PipCompletionData {
    pub pip: PipId,
    pub succeeded: bool,
    pub execution_time_ms: u64,

    /// Hex strong fingerprint of the execution, when one was computed.
    pub strong_fingerprint: Option<String>,
}

/// Worker → orchestrator: a batch of pip results plus forwarded events.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct PipResultsInfo {
    pub worker_id: WorkerId,
    pub completed_pips: Vec<PipCompletionData>,
    pub forwarded_events: Vec<WorkerForwardedEvent>,
    pub build_manifest_events: Option<Vec<String>>,
}

/// Worker → orchestrator: a chunk of the binary execution log.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ExecutionLogInfo {
    pub worker_id: WorkerId,
    pub events: Vec<u8>,
}

/// Orchestrator → worker: begin attachment for this build session.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct AttachRequest {
    pub worker_id: WorkerId,
    pub session_id: Uuid,
}

/// Orchestrator → worker: stop accepting work and shut down.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ExitRequest {
    pub worker_id: WorkerId,

    /// Present when the exit is due to a failure, for the worker's log.
    pub failure: Option<String>,
}

/// Every call in the protocol.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum Request {
    Hello(Hello),
    AttachCompleted(AttachCompletedInfo),
    PipResults(PipResultsInfo),
    ExecutionLog(ExecutionLogInfo),
    Attach(AttachRequest),
    Exit(ExitRequest),
}

/// Every reply payload in the protocol.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum Response {
    Ack,
}
