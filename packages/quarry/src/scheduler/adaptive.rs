//! Adaptive tuning of the IO stage from machine feedback.

use std::sync::Mutex;

use sysinfo::{Disks, System};
use tracing::{debug, trace};

/// One sample of machine pressure, in percentages.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct PerfSnapshot {
    pub cpu_percent: f64,
    pub ram_percent: f64,

    /// The busiest disk's utilization.
    pub max_disk_percent: f64,
}

/// A source of [`PerfSnapshot`]s. Production uses [`MachinePerf`]; tests
/// script the samples.
pub trait PerfSource: Send + Sync {
    fn snapshot(&self) -> PerfSnapshot;
}

/// Machine feedback via `sysinfo`.
pub struct MachinePerf {
    system: Mutex<System>,
    disks: Mutex<Disks>,
}

impl Default for MachinePerf {
    fn default() -> Self {
        Self::new()
    }
}

impl MachinePerf {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            disks: Mutex::new(Disks::new_with_refreshed_list()),
        }
    }
}

impl PerfSource for MachinePerf {
    fn snapshot(&self) -> PerfSnapshot {
        let mut system = self.system.lock().expect("perf source poisoned");
        system.refresh_cpu_usage();
        system.refresh_memory();
        let cpu_percent = f64::from(system.global_cpu_usage());
        let ram_percent = if system.total_memory() == 0 {
            0.0
        } else {
            system.used_memory() as f64 / system.total_memory() as f64 * 100.0
        };

        // sysinfo reports capacity, not busy time; a full disk is the
        // closest portable signal of IO pressure.
        let mut disks = self.disks.lock().expect("perf source poisoned");
        disks.refresh(false);
        let max_disk_percent = disks
            .iter()
            .map(|disk| {
                let total = disk.total_space();
                if total == 0 {
                    0.0
                } else {
                    (total - disk.available_space()) as f64 / total as f64 * 100.0
                }
            })
            .fold(0.0, f64::max);

        PerfSnapshot {
            cpu_percent,
            ram_percent,
            max_disk_percent,
        }
    }
}

/// The raise/halve controller for the IO stage's parallel degree.
///
/// Starts at half the configured maximum. Raised halfway toward the
/// maximum when the machine has headroom and the stage is actually busy;
/// halved when any disk is saturated.
#[derive(Debug)]
pub struct AdaptiveIoController {
    configured_max: usize,
    current_max: usize,
}

impl AdaptiveIoController {
    pub fn new(configured_max: usize) -> Self {
        let configured_max = configured_max.max(1);
        Self {
            configured_max,
            current_max: (configured_max / 2).max(1),
        }
    }

    pub fn current_max(&self) -> usize {
        self.current_max
    }

    /// Apply one feedback sample; returns the (possibly changed) degree.
    pub fn tune(&mut self, snapshot: PerfSnapshot, running: usize) -> usize {
        let headroom = snapshot.cpu_percent < 90.0
            && snapshot.ram_percent < 90.0
            && snapshot.max_disk_percent < 90.0;
        let busy = running as f64 >= self.current_max as f64 * 0.8;

        if headroom && busy && self.current_max < self.configured_max {
            let raised = (self.configured_max + self.current_max + 1) / 2;
            debug!(from = self.current_max, to = raised, "raising io parallelism");
            self.current_max = raised;
        }

        if snapshot.max_disk_percent > 95.0 {
            let halved = (self.current_max + 1) / 2;
            debug!(from = self.current_max, to = halved, "disk saturated; halving io parallelism");
            self.current_max = halved;
        }

        trace!(current = self.current_max, ?snapshot, "tuned io stage");
        self.current_max
    }
}
