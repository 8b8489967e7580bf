//! Body of a task thread: startup, the scheduling loop and cleanup

use super::control::TaskControl;
use super::{realtime, ContinuousMode, SchedulingKind};
use crate::config::RealtimeConfig;
use crate::core::{Component, ComponentState, TaskContext};
use crate::error::{panic_message, CommandError};
use crate::mailbox::{Mailbox, MailboxSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on a signal-driven wait, after which the loop re-checks its state
const SIGNAL_WAIT: Duration = Duration::from_millis(500);
/// Idle wait of a free-running task while suspended
const SUSPENDED_POLL: Duration = Duration::from_millis(10);

pub(crate) struct TaskRunner {
    pub(crate) component: Box<dyn Component>,
    pub(crate) ctx: TaskContext,
    pub(crate) control: Arc<TaskControl>,
    pub(crate) mailboxes: Arc<MailboxSet>,
    pub(crate) kind: SchedulingKind,
    pub(crate) realtime: Option<RealtimeConfig>,
}

impl TaskRunner {
    pub(crate) fn run(mut self) {
        if !self.startup() {
            self.abort();
            return;
        }

        let promoted = self.scheduling_loop();
        self.cleanup(promoted);
    }

    /// Check connections and run the user startup hook. Returns false if the task cannot run.
    fn startup(&mut self) -> bool {
        let name = self.ctx.name().to_string();
        let missing = self.ctx.component().unconnected_mandatory();
        if !missing.is_empty() {
            log::error!(
                "Task '{}' cannot be started: required interface(s) not connected: {}",
                name,
                missing.join(", ")
            );
            return false;
        }

        let component = &mut self.component;
        let ctx = &mut self.ctx;
        match catch_unwind(AssertUnwindSafe(|| component.startup(ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Task '{}': startup failed: {}", name, e),
            Err(payload) => log::error!(
                "Task '{}': startup panicked: {}",
                name,
                panic_message(payload.as_ref())
            ),
        }

        // Publish the initial row before anyone can observe READY
        let table = self.ctx.state_table_mut();
        if table.automatic_advance() {
            table.advance();
        }

        if !self
            .control
            .transition(ComponentState::Initializing, ComponentState::Ready)
        {
            // Killed while initializing; go straight to cleanup
            log::debug!("Task '{}' killed during startup", name);
        }
        true
    }

    fn abort(&mut self) {
        self.mailboxes.close_all();
        self.control.set(ComponentState::Finished);
    }

    /// Returns true if the thread was promoted to real-time priority
    fn scheduling_loop(&mut self) -> bool {
        let name = self.ctx.name().to_string();
        let period = match self.kind {
            SchedulingKind::Periodic { .. } => self.ctx.period(),
            SchedulingKind::Continuous { .. } => None,
        };
        let mut promoted = false;
        let mut first_cycle = true;
        let mut next_deadline = Instant::now();

        loop {
            let state = self.control.state();
            if !state.is_running() {
                break;
            }

            let elapsed = self.cycle(state);

            if let Some(period) = period {
                if state == ComponentState::Active && elapsed > period {
                    let log_it = self.ctx.with_metrics(|m| m.record_overrun());
                    if log_it {
                        let overruns = self.ctx.with_metrics(|m| m.overruns);
                        log::warn!(
                            "Task '{}' overran its period: {:.3} ms > {:.3} ms ({} overrun(s) so far)",
                            name,
                            elapsed.as_secs_f64() * 1000.0,
                            period.as_secs_f64() * 1000.0,
                            overruns
                        );
                    }
                }
            }

            // Promotion happens after the first complete cycle in READY
            if first_cycle {
                first_cycle = false;
                if let Some(rt) = &self.realtime {
                    promoted = realtime::promote(&name, rt);
                }
            }

            match (period, self.kind) {
                (Some(period), _) => {
                    next_deadline += period;
                    let now = Instant::now();
                    // Stay on the period grid: skip the slots already missed
                    while next_deadline <= now {
                        next_deadline += period;
                    }
                    self.control.sleep_until(next_deadline);
                }
                (None, SchedulingKind::Continuous { mode: ContinuousMode::FromSignal }) => {
                    self.mailboxes.wake_signal().wait_timeout(SIGNAL_WAIT);
                }
                (None, _) => {
                    if self.control.state() == ComponentState::Ready {
                        self.mailboxes.wake_signal().wait_timeout(SUSPENDED_POLL);
                    }
                }
            }
        }
        promoted
    }

    /// One cycle: drain events and commands, run if ACTIVE, publish the state table.
    /// Returns the time spent.
    fn cycle(&mut self, state: ComponentState) -> Duration {
        let name = self.ctx.name().to_string();
        self.ctx.begin_cycle();
        let automatic = self.ctx.state_table().automatic_advance();
        if automatic {
            self.ctx.state_table_mut().start();
        }

        let mut failures = 0u64;
        let mut report = |mailbox: &Mailbox, err: CommandError| {
            failures += 1;
            log::warn!("Task '{}': queued command in '{}' failed: {}", name, mailbox.name(), err);
        };
        let events = self.mailboxes.process_queued_events(&mut report);
        let commands = self.mailboxes.process_queued_commands(&mut report);

        if state == ComponentState::Active {
            let component = &mut self.component;
            let ctx = &mut self.ctx;
            match catch_unwind(AssertUnwindSafe(|| component.run(ctx))) {
                Ok(()) => self.ctx.with_metrics(|m| m.runs += 1),
                Err(payload) => {
                    log::error!(
                        "Task '{}': run panicked: {}",
                        name,
                        panic_message(payload.as_ref())
                    );
                    self.ctx.with_metrics(|m| {
                        m.runs += 1;
                        m.run_failures += 1;
                    });
                }
            }
        }

        if automatic {
            self.ctx.state_table_mut().advance();
        }

        let elapsed = self.ctx.elapsed_in_cycle();
        self.ctx.with_metrics(|m| {
            m.events_executed += events as u64;
            m.commands_executed += commands as u64;
            m.command_failures += failures;
            m.record_cycle(elapsed);
        });
        elapsed
    }

    fn cleanup(&mut self, promoted: bool) {
        let name = self.ctx.name().to_string();
        let component = &mut self.component;
        let ctx = &mut self.ctx;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| component.cleanup(ctx))) {
            log::error!(
                "Task '{}': cleanup panicked: {}",
                name,
                panic_message(payload.as_ref())
            );
        }

        let failed = self.mailboxes.close_all();
        if failed > 0 {
            log::warn!(
                "Task '{}' finished with {} queued command(s) not executed",
                name,
                failed
            );
        }
        if promoted {
            realtime::demote(&name);
        }
        self.control.set(ComponentState::Finished);
    }
}
