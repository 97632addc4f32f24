//! The multi-queue dispatcher.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use strum::{EnumCount, IntoEnumIterator};
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, instrument, trace};

use crate::{
    context::{BuildContext, EngineCounter},
    scheduler::{
        AdaptiveIoController, DispatchStage, PerfSource, RunnablePip, ScheduleConfig, StepOutcome,
    },
};

/// How often the adaptive stages re-read machine feedback.
const TUNE_INTERVAL: Duration = Duration::from_secs(1);

struct StageState {
    queue: VecDeque<RunnablePip>,
    max_degree: usize,
    running: usize,
}

struct QueueState {
    stages: Vec<StageState>,

    /// Sum of queued and running pips across all stages.
    running_or_queued: usize,
}

impl QueueState {
    fn stage(&mut self, stage: DispatchStage) -> &mut StageState {
        &mut self.stages[stage as usize]
    }

    fn total_running(&self) -> usize {
        self.stages.iter().map(|state| state.running).sum()
    }
}

/// The pip dispatcher: a fixed set of named stages, each a FIFO with an
/// adjustable parallel degree, drained by one cooperative master loop.
///
/// ## Shutdown
///
/// Two ways out: [`DispatcherQueue::set_finalized`] promises no further
/// external enqueues, letting [`DispatcherQueue::drain`] return once
/// everything queued has run; [`DispatcherQueue::cancel`] discards queued
/// work, refuses new enqueues, and waits only for the pips already
/// running.
pub struct DispatcherQueue {
    context: BuildContext,
    config: ScheduleConfig,
    state: Mutex<QueueState>,
    changed: Notify,
    finalized: AtomicBool,
    cancelled: AtomicBool,
    perf: Option<Arc<dyn PerfSource>>,
}

impl DispatcherQueue {
    pub fn new(context: BuildContext, config: ScheduleConfig) -> Self {
        let stages = DispatchStage::iter()
            .map(|stage| StageState {
                queue: VecDeque::new(),
                max_degree: config.default_degree(stage),
                running: 0,
            })
            .collect::<Vec<_>>();
        debug_assert_eq!(stages.len(), DispatchStage::COUNT);

        Self {
            context,
            config,
            state: Mutex::new(QueueState {
                stages,
                running_or_queued: 0,
            }),
            changed: Notify::new(),
            finalized: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            perf: None,
        }
    }

    /// Attach a machine-feedback source, enabling adaptive IO tuning.
    pub fn with_perf_source(mut self, perf: Arc<dyn PerfSource>) -> Self {
        self.perf = Some(perf);
        self
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("dispatcher state poisoned")
    }

    /// Append a pip to its stage's queue. Silently dropped after
    /// cancellation.
    pub fn enqueue(&self, runnable: RunnablePip) {
        let stage = runnable.stage;
        {
            let mut state = self.lock();
            if self.cancelled.load(Ordering::SeqCst) {
                trace!(pip = %runnable.pip, "enqueue dropped: dispatcher cancelled");
                return;
            }
            state.stage(stage).queue.push_back(runnable);
            state.running_or_queued += 1;
        }
        self.trigger();
    }

    /// Adjust a stage's parallel degree.
    ///
    /// Zero is only meaningful for the ChooseWorker family (it parks the
    /// stage until a worker frees up); for every other stage a zero is
    /// clamped to one so the stage cannot wedge the pipeline.
    pub fn set_max_parallel_degree(&self, stage: DispatchStage, degree: usize) {
        let degree = if degree == 0 && !stage.is_choose_worker() {
            1
        } else {
            degree
        };
        self.lock().stage(stage).max_degree = degree;
        self.trigger();
    }

    pub fn max_parallel_degree(&self, stage: DispatchStage) -> usize {
        self.lock().stage(stage).max_degree
    }

    pub fn num_queued(&self, stage: DispatchStage) -> usize {
        self.lock().stage(stage).queue.len()
    }

    /// Pips currently queued or running, across all stages.
    pub fn num_running_or_queued(&self) -> usize {
        self.lock().running_or_queued
    }

    /// Wake the drain loop.
    pub fn trigger(&self) {
        self.changed.notify_one();
    }

    /// Promise that no further external enqueues will occur; the drain
    /// loop completes once the queues empty.
    pub fn set_finalized(&self) {
        self.finalized.store(true, Ordering::SeqCst);
        self.trigger();
    }

    /// Refuse new enqueues, discard queued pips, and wait for the
    /// currently-running set to finish.
    #[instrument(skip(self))]
    pub async fn cancel(&self) {
        let discarded = {
            let mut state = self.lock();
            self.cancelled.store(true, Ordering::SeqCst);
            let mut discarded = 0;
            for stage_state in &mut state.stages {
                discarded += stage_state.queue.len();
                stage_state.queue.clear();
            }
            state.running_or_queued -= discarded;
            discarded
        };
        if discarded > 0 {
            self.context
                .counters
                .add(EngineCounter::PipsCancelled, discarded as u64);
            debug!(discarded, "discarded queued pips");
        }
        self.trigger();

        // The change signal belongs to the drain loop; polling here keeps
        // the two waiters from stealing each other's wakeups.
        let mut interval = tokio::time::interval(Duration::from_millis(10));
        loop {
            interval.tick().await;
            if self.lock().total_running() == 0 {
                self.trigger();
                return;
            }
        }
    }

    fn finished(&self) -> bool {
        let state = self.lock();
        if self.cancelled.load(Ordering::SeqCst) {
            return state.total_running() == 0;
        }
        self.finalized.load(Ordering::SeqCst) && state.running_or_queued == 0
    }

    /// The master loop: tune adaptive stages, start whatever the current
    /// degrees allow, then wait on the change signal (or the tune tick).
    #[instrument(skip(self))]
    pub async fn drain(self: &Arc<Self>) {
        let mut adaptive = self
            .perf
            .is_some()
            .then(|| AdaptiveIoController::new(self.config.max_io));
        let mut last_tune: Option<Instant> = None;

        loop {
            let changed = self.changed.notified();

            if last_tune.is_none_or(|at| at.elapsed() >= TUNE_INTERVAL) {
                last_tune = Some(Instant::now());
                self.tune_io(adaptive.as_mut());
                self.tune_delayed_cache_lookup();
            }
            self.start_ready_work();

            if self.finished() {
                debug!("dispatcher drained");
                return;
            }

            tokio::select! {
                _ = changed => {}
                _ = tokio::time::sleep(TUNE_INTERVAL) => {}
            }
        }
    }

    /// Start as many queued pips as the current degrees permit.
    fn start_ready_work(self: &Arc<Self>) {
        let mut to_start = Vec::new();
        {
            let mut state = self.lock();
            if self.cancelled.load(Ordering::SeqCst) {
                return;
            }
            for stage in DispatchStage::iter() {
                let stage_state = state.stage(stage);
                while stage_state.running < stage_state.max_degree {
                    let Some(runnable) = stage_state.queue.pop_front() else {
                        break;
                    };
                    stage_state.running += 1;
                    to_start.push(runnable);
                }
            }
        }

        for runnable in to_start {
            self.context.counters.bump(EngineCounter::PipsDispatched);
            trace!(pip = %runnable.pip, stage = %runnable.stage, "starting pip step");
            let this = Arc::clone(self);
            let stage = runnable.stage;
            tokio::spawn(async move {
                let outcome = runnable.run().await;
                this.complete_step(stage, outcome);
            });
        }
    }

    fn complete_step(&self, stage: DispatchStage, outcome: StepOutcome) {
        {
            let mut state = self.lock();
            state.stage(stage).running -= 1;
            state.running_or_queued -= 1;
        }
        match outcome {
            StepOutcome::Continue(next) => self.enqueue(next),
            StepOutcome::Cancelled => self.context.counters.bump(EngineCounter::PipsCancelled),
            StepOutcome::Completed | StepOutcome::Failed => {}
        }
        self.trigger();
    }

    fn tune_io(&self, adaptive: Option<&mut AdaptiveIoController>) {
        let (Some(perf), Some(controller)) = (self.perf.as_ref(), adaptive) else {
            return;
        };
        let snapshot = perf.snapshot();
        let mut state = self.lock();
        let running = state.stage(DispatchStage::Io).running;
        state.stage(DispatchStage::Io).max_degree = controller.tune(snapshot, running);
    }

    /// Pause cache-lookup admission while the ChooseWorkerCpu backlog is
    /// past the high-water mark; resume below the low-water mark.
    fn tune_delayed_cache_lookup(&self) {
        if !self.config.delayed_cache_lookup_enabled {
            return;
        }
        let slots = self.config.total_process_slots as f64;
        let mut state = self.lock();
        let backlog = state.stage(DispatchStage::ChooseWorkerCpu).queue.len() as f64;
        let current = state.stage(DispatchStage::DelayedCacheLookup).max_degree;

        if current > 0 && backlog > slots * self.config.delayed_max_multiplier {
            debug!(backlog, "pausing delayed cache lookup");
            state.stage(DispatchStage::DelayedCacheLookup).max_degree = 0;
        } else if current == 0 && backlog < slots * self.config.delayed_min_multiplier {
            debug!(backlog, "resuming delayed cache lookup");
            state.stage(DispatchStage::DelayedCacheLookup).max_degree = 1;
        }
    }
}
