//! Components: lifecycle state, user hooks, interfaces and execution context

mod component;
mod context;

pub use component::{Component, ComponentCore, ComponentState, Passive};
pub use context::{TaskContext, TaskMetrics};
