//! Provided and required interfaces
//!
//! A [`ProvidedInterface`] exposes named commands and events. A [`RequiredInterface`] declares the
//! functions and event handlers a component needs; [`RequiredInterface::connect_to`] resolves them
//! by name and shape against a provided interface and binds each function to a
//! [`CommandInvoker`]. Whether an invocation runs inline or goes through the provider's mailbox is
//! decided once, at bind time, and is invisible to the caller.
//!
//! [`CommandInvoker`] is also the seam for remote connections: a proxy implementing it is
//! indistinguishable from a local command to the code holding a function handle.

mod event;
mod function;
mod provided;
mod required;

pub use event::{EventVoid, EventWrite, ObserverId};
pub use function::{
    FunctionQualifiedRead, FunctionRead, FunctionVoid, FunctionVoidReturn, FunctionWrite,
    FunctionWriteReturn,
};
pub use provided::ProvidedInterface;
pub use required::RequiredInterface;

use crate::command::{Argument, ArgumentPrototype, Command, CommandShape};
use crate::error::CommandError;
use crate::mailbox::{Mailbox, QueuedCommand};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a successful non-blocking function call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Placed in the provider's mailbox; runs on the provider's thread
    Queued,
    /// Ran to completion in the calling thread
    Executed,
}

/// Raw outcome reported by an invoker
pub enum Invocation {
    Queued,
    Completed(Option<Argument>),
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => f.write_str("Queued"),
            Self::Completed(value) => write!(f, "Completed(has_value: {})", value.is_some()),
        }
    }
}

/// Something a bound function can invoke: a local command, a mailbox route, or a remote proxy
pub trait CommandInvoker: Send + Sync {
    fn name(&self) -> &str;

    fn shape(&self) -> CommandShape;

    fn argument_prototype(&self) -> Option<ArgumentPrototype>;

    fn result_prototype(&self) -> Option<ArgumentPrototype>;

    /// Invoke with an owned argument. When `blocking` is set, or the shape returns a value,
    /// the call returns only after the command ran.
    fn invoke(&self, argument: Option<Argument>, blocking: bool) -> Result<Invocation, CommandError>;

    fn is_queued(&self) -> bool {
        false
    }
}

/// Runs the command in the calling thread
pub struct DirectInvoker {
    command: Arc<Command>,
}

impl DirectInvoker {
    pub fn new(command: Arc<Command>) -> Self {
        Self { command }
    }
}

impl CommandInvoker for DirectInvoker {
    fn name(&self) -> &str {
        self.command.name()
    }

    fn shape(&self) -> CommandShape {
        self.command.shape()
    }

    fn argument_prototype(&self) -> Option<ArgumentPrototype> {
        self.command.argument_prototype()
    }

    fn result_prototype(&self) -> Option<ArgumentPrototype> {
        self.command.result_prototype()
    }

    fn invoke(&self, argument: Option<Argument>, _blocking: bool) -> Result<Invocation, CommandError> {
        let argument: Option<&dyn Any> = match &argument {
            Some(boxed) => Some(&**boxed),
            None => None,
        };
        self.command.execute(argument).map(Invocation::Completed)
    }
}

/// Routes invocations through the provider's mailbox
pub struct QueuedInvoker {
    command: Arc<Command>,
    mailbox: Arc<Mailbox>,
    timeout: Option<Duration>,
}

impl QueuedInvoker {
    pub fn new(command: Arc<Command>, mailbox: Arc<Mailbox>, timeout: Option<Duration>) -> Self {
        Self {
            command,
            mailbox,
            timeout,
        }
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }
}

impl CommandInvoker for QueuedInvoker {
    fn name(&self) -> &str {
        self.command.name()
    }

    fn shape(&self) -> CommandShape {
        self.command.shape()
    }

    fn argument_prototype(&self) -> Option<ArgumentPrototype> {
        self.command.argument_prototype()
    }

    fn result_prototype(&self) -> Option<ArgumentPrototype> {
        self.command.result_prototype()
    }

    fn invoke(&self, argument: Option<Argument>, blocking: bool) -> Result<Invocation, CommandError> {
        if !self.command.is_enabled() {
            return Err(CommandError::Disabled(self.command.name().to_string()));
        }

        let entry = QueuedCommand::new(self.command.clone(), argument);
        if blocking || self.command.shape().returns_value() {
            let (entry, completion) = entry.blocking();
            self.mailbox.try_write(entry)?;
            completion
                .wait(self.command.name(), self.timeout)
                .map(Invocation::Completed)
        } else {
            self.mailbox.try_write(entry)?;
            Ok(Invocation::Queued)
        }
    }

    fn is_queued(&self) -> bool {
        true
    }
}
