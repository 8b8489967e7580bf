//! # KESTREL
//!
//! Component-based real-time execution framework for robotics control software.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kestrel::prelude::*;
//!
//! struct Blinker {
//!     on: bool,
//! }
//!
//! impl Component for Blinker {
//!     fn run(&mut self, ctx: &mut TaskContext) {
//!         self.on = !self.on;
//!         ctx.log_debug(if self.on { "on" } else { "off" });
//!     }
//! }
//!
//! fn main() -> AnyResult<()> {
//!     let manager = ComponentManager::new();
//!     let task = manager.add_task(Task::periodic("blinker", Duration::from_millis(500))?)?;
//!     task.set_component(Blinker { on: false })?;
//!     manager.create_all_and_wait(Duration::from_secs(3))?;
//!     manager.start_all_and_wait(Duration::from_secs(3))?;
//!     manager.run_until_signal(Duration::from_secs(3))?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Typed interfaces** checked once, at connection time
//! - **Mailbox-routed calls** between threads, direct calls within one
//! - **Lock-free state history** readable from any thread
//! - **Periodic and continuous tasks** with overrun accounting and optional SCHED_FIFO

pub use kestrel_core::{self, *};

/// The KESTREL prelude - everything you need to get started
pub mod prelude {
    // Components and lifecycle
    pub use kestrel_core::{
        Component, ComponentManager, ComponentParams, ComponentState, ContinuousMode, Device,
        Lifecycle, Passive, Task, TaskConfig, TaskContext,
    };

    // Interfaces
    pub use kestrel_core::{
        Dispatch, EventVoid, EventWrite, FunctionQualifiedRead, FunctionRead, FunctionVoid,
        FunctionVoidReturn, FunctionWrite, FunctionWriteReturn, QueueingPolicy, Requirement,
    };

    // State tables
    pub use kestrel_core::{Accessor, StateElement, StateTableReader};

    // Error types
    pub use kestrel_core::{BindError, CommandError, KestrelError, KestrelResult};
    pub type Result<T> = KestrelResult<T>;

    // Common std types
    pub use std::sync::Arc;
    pub use std::time::{Duration, Instant};

    // Common traits
    pub use serde::{Deserialize, Serialize};

    // Re-export anyhow for error handling
    pub use anyhow::{anyhow, bail, ensure, Context, Result as AnyResult};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get KESTREL version
pub fn version() -> &'static str {
    VERSION
}
