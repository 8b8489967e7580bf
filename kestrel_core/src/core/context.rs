use super::ComponentCore;
use crate::clock::TimeServer;
use crate::interface::{ProvidedInterface, RequiredInterface};
use crate::state::StateTable;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-task execution counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    /// Scheduler iterations (each one drains the mailboxes)
    pub cycles: u64,
    /// Calls to the user `run` hook
    pub runs: u64,
    pub run_failures: u64,
    pub overruns: u64,
    pub last_overrun_cycle: Option<u64>,
    pub commands_executed: u64,
    pub events_executed: u64,
    pub command_failures: u64,
    pub last_cycle_ms: f64,
    pub min_cycle_ms: f64,
    pub max_cycle_ms: f64,
    pub avg_cycle_ms: f64,
    pub warnings_count: u64,
    pub errors_count: u64,
}

impl TaskMetrics {
    pub(crate) fn record_cycle(&mut self, duration: Duration) {
        let ms = duration.as_secs_f64() * 1000.0;
        self.cycles += 1;
        self.last_cycle_ms = ms;
        if self.cycles == 1 {
            self.min_cycle_ms = ms;
            self.max_cycle_ms = ms;
            self.avg_cycle_ms = ms;
        } else {
            self.min_cycle_ms = self.min_cycle_ms.min(ms);
            self.max_cycle_ms = self.max_cycle_ms.max(ms);
            self.avg_cycle_ms += (ms - self.avg_cycle_ms) / self.cycles as f64;
        }
    }

    /// Count an overrun on the current cycle. Returns true if it should be logged.
    pub(crate) fn record_overrun(&mut self) -> bool {
        self.overruns += 1;
        self.last_overrun_cycle = Some(self.cycles);
        self.overruns == 1 || self.overruns % 100 == 0
    }
}

/// Execution context handed to every [`Component`](super::Component) hook.
///
/// Owns the component's state table writer and gives access to its interfaces, timing and
/// metrics.
pub struct TaskContext {
    core: Arc<ComponentCore>,
    state_table: StateTable,
    metrics: Arc<Mutex<TaskMetrics>>,
    period: Option<Duration>,
    cycle_start: Instant,
    time: TimeServer,
}

impl TaskContext {
    pub(crate) fn new(
        core: Arc<ComponentCore>,
        state_table: StateTable,
        metrics: Arc<Mutex<TaskMetrics>>,
        period: Option<Duration>,
        time: TimeServer,
    ) -> Self {
        Self {
            core,
            state_table,
            metrics,
            period,
            cycle_start: Instant::now(),
            time,
        }
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn component(&self) -> &Arc<ComponentCore> {
        &self.core
    }

    pub fn state_table(&self) -> &StateTable {
        &self.state_table
    }

    pub fn state_table_mut(&mut self) -> &mut StateTable {
        &mut self.state_table
    }

    pub fn provided_interface(&self, name: &str) -> Option<Arc<ProvidedInterface>> {
        self.core.provided_interface(name)
    }

    pub fn required_interface(&self, name: &str) -> Option<Arc<RequiredInterface>> {
        self.core.required_interface(name)
    }

    /// Configured period of a periodic task
    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    pub fn cycle_start(&self) -> Instant {
        self.cycle_start
    }

    pub fn elapsed_in_cycle(&self) -> Duration {
        self.cycle_start.elapsed()
    }

    pub fn time(&self) -> &TimeServer {
        &self.time
    }

    pub fn metrics(&self) -> TaskMetrics {
        self.metrics.lock().clone()
    }

    pub(crate) fn begin_cycle(&mut self) {
        self.cycle_start = Instant::now();
    }

    pub(crate) fn with_metrics<R>(&self, f: impl FnOnce(&mut TaskMetrics) -> R) -> R {
        f(&mut self.metrics.lock())
    }

    pub fn log_info(&self, message: &str) {
        log::info!("[{}] {}", self.name(), message);
    }

    pub fn log_warning(&mut self, message: &str) {
        log::warn!("[{}] {}", self.name(), message);
        self.metrics.lock().warnings_count += 1;
    }

    pub fn log_error(&mut self, message: &str) {
        log::error!("[{}] {}", self.name(), message);
        self.metrics.lock().errors_count += 1;
    }

    pub fn log_debug(&self, message: &str) {
        log::debug!("[{}] {}", self.name(), message);
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("name", &self.name())
            .field("period", &self.period)
            .field("state_table", &self.state_table)
            .finish()
    }
}
