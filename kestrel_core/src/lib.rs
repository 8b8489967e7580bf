//! # KESTREL Core
//!
//! The execution core of the KESTREL component framework.
//!
//! A process is a set of components that talk through typed interfaces:
//!
//! - **Components**: a [`Task`] owns a thread (periodic or continuous), a [`Device`] has none
//! - **Interfaces**: provided interfaces expose commands and events, required interfaces hold
//!   the matching functions and event handlers
//! - **Mailboxes**: calls into another task are queued and executed on the owner's thread
//! - **State tables**: a ring of per-cycle snapshots, written by one task and read lock-free by
//!   any other
//! - **Manager**: registry, connections by name and bulk lifecycle control
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kestrel_core::{Component, ComponentManager, Device, Requirement, Task, TaskConfig, TaskContext};
//! use std::time::Duration;
//!
//! struct Controller;
//!
//! impl Component for Controller {
//!     fn run(&mut self, ctx: &mut TaskContext) {
//!         ctx.log_debug("control cycle");
//!     }
//! }
//!
//! let manager = ComponentManager::new();
//! let sensor = manager.add_device(Device::new("sensor")?)?;
//! sensor
//!     .add_interface_provided("Sensor")?
//!     .add_command_read("Position", || 42.0f64)?;
//!
//! let task = manager.add_task(Task::new(TaskConfig::periodic("ctrl", Duration::from_millis(5)))?)?;
//! let required = task.add_interface_required("Sensor", Requirement::Mandatory)?;
//! let _position = required.add_function_read::<f64>("Position", Requirement::Mandatory)?;
//! task.set_component(Controller)?;
//!
//! manager.connect("ctrl", "Sensor", "sensor", "Sensor")?;
//! manager.create_all_and_wait(Duration::from_secs(3))?;
//! manager.start_all_and_wait(Duration::from_secs(3))?;
//! manager.kill_all_and_wait(Duration::from_secs(3))?;
//! # Ok::<(), kestrel_core::KestrelError>(())
//! ```

pub mod clock;
pub mod command;
pub mod config;
pub mod core;
pub mod error;
pub mod interface;
pub mod mailbox;
pub mod manager;
pub mod scheduling;
pub mod state;

// Re-export commonly used types for easy access
pub use clock::TimeServer;
pub use command::{Argument, Command, CommandShape, QueueingPolicy, Requirement};
pub use config::{ComponentParams, ConnectionConfig, ManagerConfig, RealtimeConfig, TaskConfig};
pub use core::{Component, ComponentCore, ComponentState, Passive, TaskContext, TaskMetrics};
pub use error::{BindError, CommandError, KestrelError, KestrelResult, StateTableError};
pub use interface::{
    Dispatch, EventVoid, EventWrite, FunctionQualifiedRead, FunctionRead, FunctionVoid,
    FunctionVoidReturn, FunctionWrite, FunctionWriteReturn, ProvidedInterface, RequiredInterface,
};
pub use mailbox::{Mailbox, MailboxSet};
pub use manager::ComponentManager;
pub use scheduling::{ContinuousMode, Device, Lifecycle, SchedulingKind, Task};
pub use state::{Accessor, StateElement, StateIndex, StateTable, StateTableReader, StateValue};
