//! The pip dispatcher: named stages, per-stage concurrency, and the
//! drain loop that moves runnable pips through the pipeline.

pub mod adaptive;
pub mod queue;

use std::{future::Future, pin::Pin};

use bon::Builder;
use derive_more::Display;
use strum::EnumCount;

use crate::pip::PipId;

pub use adaptive::{AdaptiveIoController, MachinePerf, PerfSnapshot, PerfSource};
pub use queue::DispatcherQueue;

/// A worker slot id. Worker 0 is the local process; remote workers are
/// numbered from 1.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, serde::Serialize, serde::Deserialize,
)]
#[display("w{_0}")]
pub struct WorkerId(pub u32);

impl WorkerId {
    pub const LOCAL: Self = Self(0);

    pub fn is_local(self) -> bool {
        self == Self::LOCAL
    }
}

/// The pipeline stages, each with its own queue and parallel degree.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Debug,
    Display,
    EnumCount,
    strum::EnumIter,
    strum::FromRepr,
)]
#[repr(usize)]
pub enum DispatchStage {
    /// Hashing and file IO; adaptively tuned.
    Io,

    /// Admission throttle in front of cache lookup.
    DelayedCacheLookup,

    /// Bind a pip to a worker for cache lookup.
    ChooseWorkerCacheLookup,

    /// Bind a pip to a worker for process execution.
    ChooseWorkerCpu,

    /// Bind a lightweight pip to a worker.
    ChooseWorkerLight,

    /// Bind an IPC pip to a worker.
    ChooseWorkerIpc,

    /// Execute the cache lookup.
    CacheLookup,

    /// Process execution.
    Cpu,

    /// Output materialization.
    Materialize,

    /// Non-process lightweight pips.
    Light,

    /// IPC pips.
    IpcPips,
}

impl DispatchStage {
    /// Whether this stage belongs to the ChooseWorker family, the only
    /// stages whose parallel degree may legally drop to zero.
    pub const fn is_choose_worker(self) -> bool {
        matches!(
            self,
            Self::ChooseWorkerCacheLookup
                | Self::ChooseWorkerCpu
                | Self::ChooseWorkerLight
                | Self::ChooseWorkerIpc
        )
    }
}

/// Stage concurrency and throttling configuration.
#[derive(Copy, Clone, Debug, Builder)]
pub struct ScheduleConfig {
    /// Upper bound for the adaptive IO stage.
    #[builder(default = num_cpus::get().max(2))]
    pub max_io: usize,

    #[builder(default = 2)]
    pub cache_lookup: usize,

    #[builder(default = 1)]
    pub choose_worker_cache_lookup: usize,

    #[builder(default = 1)]
    pub choose_worker_cpu: usize,

    #[builder(default = 1)]
    pub choose_worker_light: usize,

    #[builder(default = num_cpus::get().max(1))]
    pub cpu: usize,

    #[builder(default = num_cpus::get().max(1))]
    pub materialize: usize,

    #[builder(default = 8)]
    pub light: usize,

    #[builder(default = 1)]
    pub ipc_pips: usize,

    /// Total process slots across all workers, the baseline for the
    /// delayed cache-lookup multipliers.
    #[builder(default = num_cpus::get().max(1))]
    pub total_process_slots: usize,

    /// Enables the delayed cache-lookup throttle.
    #[builder(default)]
    pub delayed_cache_lookup_enabled: bool,

    /// Pause admission when ChooseWorkerCpu backlog exceeds
    /// `total_process_slots * delayed_max_multiplier`.
    #[builder(default = 2.0)]
    pub delayed_max_multiplier: f64,

    /// Resume admission when the backlog falls below
    /// `total_process_slots * delayed_min_multiplier`.
    #[builder(default = 1.0)]
    pub delayed_min_multiplier: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ScheduleConfig {
    /// The initial parallel degree of a stage.
    pub fn default_degree(&self, stage: DispatchStage) -> usize {
        match stage {
            DispatchStage::Io => (self.max_io / 2).max(1),
            DispatchStage::DelayedCacheLookup => {
                usize::from(self.delayed_cache_lookup_enabled)
            }
            DispatchStage::ChooseWorkerCacheLookup => self.choose_worker_cache_lookup,
            DispatchStage::ChooseWorkerCpu => self.choose_worker_cpu,
            DispatchStage::ChooseWorkerLight => self.choose_worker_light,
            DispatchStage::ChooseWorkerIpc => 1,
            DispatchStage::CacheLookup => self.cache_lookup,
            DispatchStage::Cpu => self.cpu,
            DispatchStage::Materialize => self.materialize,
            DispatchStage::Light => self.light,
            DispatchStage::IpcPips => self.ipc_pips,
        }
    }
}

/// What a pip step resolved to.
pub enum StepOutcome {
    /// The pip continues at another stage.
    Continue(RunnablePip),

    Completed,
    Failed,
    Cancelled,
}

type StepFuture = Pin<Box<dyn Future<Output = StepOutcome> + Send>>;

/// A pip admitted to the dispatcher: its identity, the stage it is queued
/// for, its bound worker, and the resumable operation to run when a slot
/// frees up.
pub struct RunnablePip {
    pub pip: PipId,
    pub stage: DispatchStage,
    pub worker: WorkerId,
    step: Box<dyn FnOnce() -> StepFuture + Send>,
}

impl RunnablePip {
    pub fn new<F, Fut>(pip: PipId, stage: DispatchStage, step: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = StepOutcome> + Send + 'static,
    {
        Self {
            pip,
            stage,
            worker: WorkerId::LOCAL,
            step: Box::new(move || Box::pin(step()) as StepFuture),
        }
    }

    /// Bind the pip to a worker.
    pub fn on_worker(mut self, worker: WorkerId) -> Self {
        self.worker = worker;
        self
    }

    pub(crate) async fn run(self) -> StepOutcome {
        (self.step)().await
    }
}

impl std::fmt::Debug for RunnablePip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnablePip")
            .field("pip", &self.pip)
            .field("stage", &self.stage)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}
