//! Tasks, devices and their lifecycle
//!
//! A [`Task`] owns one OS thread that repeatedly drains its mailboxes, calls the component's
//! `run` hook while ACTIVE and publishes its state table. Periodic tasks wait for the rest of
//! their period between cycles; continuous tasks either loop freely or wait for a mailbox
//! signal. A [`Device`] has no thread: its commands run in the caller's thread.

mod control;
mod device;
pub mod realtime;
mod runner;
mod task;

pub use control::TaskControl;
pub use device::Device;
pub use task::Task;

use crate::config::ComponentParams;
use crate::core::{ComponentCore, ComponentState};
use crate::error::KestrelResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Behaviour of a continuous task between cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuousMode {
    /// Start the next cycle immediately
    #[default]
    FreeRunning,
    /// Wait until a command or event is queued, or the state changes
    FromSignal,
}

/// How a task is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulingKind {
    Periodic {
        period_ms: f64,
    },
    Continuous {
        #[serde(default)]
        mode: ContinuousMode,
    },
}

impl Default for SchedulingKind {
    fn default() -> Self {
        SchedulingKind::Continuous {
            mode: ContinuousMode::default(),
        }
    }
}

/// Lifecycle operations common to tasks and devices, used by the component manager
pub trait Lifecycle: Send + Sync {
    fn name(&self) -> &str;

    fn component_core(&self) -> &Arc<ComponentCore>;

    fn state(&self) -> ComponentState;

    fn set_params(&self, params: ComponentParams);

    fn create(&self) -> KestrelResult<()>;

    fn start(&self) -> KestrelResult<()>;

    fn suspend(&self) -> KestrelResult<()>;

    fn kill(&self) -> KestrelResult<()>;

    fn wait_for_state(&self, state: ComponentState, timeout: Option<Duration>) -> bool;

    /// Release the thread once FINISHED. No-op for components without a thread.
    fn join(&self, _timeout: Option<Duration>) -> bool {
        true
    }

    fn initialization_timeout(&self) -> Duration;
}
