//! Command objects
//!
//! A [`Command`] is a named callable registered on a provided interface. The callable is one of a
//! closed set of shapes ([`CommandCallable`]); arguments and results travel type-erased as
//! `Box<dyn Any + Send>` and are checked against an [`ArgumentPrototype`] once, at bind time.

use crate::error::{panic_message, CommandError};
use std::any::{Any, TypeId};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Owned, type-erased argument or result value
pub type Argument = Box<dyn Any + Send>;

type VoidFn = Arc<dyn Fn() + Send + Sync>;
type ProduceFn = Arc<dyn Fn() -> Argument + Send + Sync>;
type ConsumeFn = Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>;
type TransformFn = Arc<dyn Fn(&dyn Any) -> Option<Argument> + Send + Sync>;

/// Argument arity and return of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandShape {
    Void,
    Read,
    Write,
    QualifiedRead,
    WriteReturn,
    VoidReturn,
}

impl CommandShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Read => "read",
            Self::Write => "write",
            Self::QualifiedRead => "qualified-read",
            Self::WriteReturn => "write-return",
            Self::VoidReturn => "void-return",
        }
    }

    /// Shapes whose caller always waits for the result
    pub fn returns_value(&self) -> bool {
        matches!(
            self,
            Self::Read | Self::QualifiedRead | Self::WriteReturn | Self::VoidReturn
        )
    }
}

impl fmt::Display for CommandShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static type of an argument or result, compared at bind time
#[derive(Debug, Clone, Copy)]
pub struct ArgumentPrototype {
    type_id: TypeId,
    type_name: &'static str,
}

impl ArgumentPrototype {
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }
}

impl PartialEq for ArgumentPrototype {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for ArgumentPrototype {}

/// Whether a command goes through the owner's mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueingPolicy {
    /// Follow the provided interface (queued when owned by a task)
    #[default]
    InterfaceDefault,
    /// Always queued; ignored on interfaces without a mailbox
    Queued,
    /// Executed in the caller's thread; the callable must be thread-safe
    NotQueued,
}

/// Whether a function, event handler or required interface must be bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Requirement {
    #[default]
    Mandatory,
    Optional,
}

/// Closed set of callable shapes
#[derive(Clone)]
pub enum CommandCallable {
    Void(VoidFn),
    Read(ProduceFn),
    Write(ConsumeFn),
    QualifiedRead(TransformFn),
    WriteReturn(TransformFn),
    VoidReturn(ProduceFn),
}

impl CommandCallable {
    pub fn shape(&self) -> CommandShape {
        match self {
            Self::Void(_) => CommandShape::Void,
            Self::Read(_) => CommandShape::Read,
            Self::Write(_) => CommandShape::Write,
            Self::QualifiedRead(_) => CommandShape::QualifiedRead,
            Self::WriteReturn(_) => CommandShape::WriteReturn,
            Self::VoidReturn(_) => CommandShape::VoidReturn,
        }
    }
}

impl fmt::Debug for CommandCallable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandCallable::{}", self.shape())
    }
}

/// A named, typed, invocable operation owned by a provided interface
pub struct Command {
    name: String,
    callable: CommandCallable,
    argument: Option<ArgumentPrototype>,
    result: Option<ArgumentPrototype>,
    queueing: QueueingPolicy,
    enabled: AtomicBool,
}

impl Command {
    fn build(
        name: &str,
        callable: CommandCallable,
        argument: Option<ArgumentPrototype>,
        result: Option<ArgumentPrototype>,
    ) -> Self {
        Self {
            name: name.to_string(),
            callable,
            argument,
            result,
            queueing: QueueingPolicy::InterfaceDefault,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn void<F>(name: &str, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::build(name, CommandCallable::Void(Arc::new(f)), None, None)
    }

    pub fn read<R, F>(name: &str, f: F) -> Self
    where
        R: Send + 'static,
        F: Fn() -> R + Send + Sync + 'static,
    {
        let produce: ProduceFn = Arc::new(move || Box::new(f()) as Argument);
        Self::build(
            name,
            CommandCallable::Read(produce),
            None,
            Some(ArgumentPrototype::of::<R>()),
        )
        .with_queueing(QueueingPolicy::NotQueued)
    }

    pub fn write<T, F>(name: &str, f: F) -> Self
    where
        T: Send + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let consume: ConsumeFn = Arc::new(move |arg: &dyn Any| match arg.downcast_ref::<T>() {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        });
        Self::build(
            name,
            CommandCallable::Write(consume),
            Some(ArgumentPrototype::of::<T>()),
            None,
        )
    }

    pub fn qualified_read<Q, R, F>(name: &str, f: F) -> Self
    where
        Q: Send + 'static,
        R: Send + 'static,
        F: Fn(&Q) -> R + Send + Sync + 'static,
    {
        Self::build(
            name,
            CommandCallable::QualifiedRead(transform(f)),
            Some(ArgumentPrototype::of::<Q>()),
            Some(ArgumentPrototype::of::<R>()),
        )
        .with_queueing(QueueingPolicy::NotQueued)
    }

    pub fn write_return<A, R, F>(name: &str, f: F) -> Self
    where
        A: Send + 'static,
        R: Send + 'static,
        F: Fn(&A) -> R + Send + Sync + 'static,
    {
        Self::build(
            name,
            CommandCallable::WriteReturn(transform(f)),
            Some(ArgumentPrototype::of::<A>()),
            Some(ArgumentPrototype::of::<R>()),
        )
    }

    pub fn void_return<R, F>(name: &str, f: F) -> Self
    where
        R: Send + 'static,
        F: Fn() -> R + Send + Sync + 'static,
    {
        let produce: ProduceFn = Arc::new(move || Box::new(f()) as Argument);
        Self::build(
            name,
            CommandCallable::VoidReturn(produce),
            None,
            Some(ArgumentPrototype::of::<R>()),
        )
    }

    /// Override the queueing policy (chainable)
    pub fn with_queueing(mut self, policy: QueueingPolicy) -> Self {
        self.queueing = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> CommandShape {
        self.callable.shape()
    }

    pub fn argument_prototype(&self) -> Option<ArgumentPrototype> {
        self.argument
    }

    pub fn result_prototype(&self) -> Option<ArgumentPrototype> {
        self.result
    }

    pub fn queueing(&self) -> QueueingPolicy {
        self.queueing
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Run the callable in the current thread.
    ///
    /// Panics raised by the callable are caught and reported as
    /// [`CommandError::ExecutionFailed`].
    pub fn execute(&self, argument: Option<&dyn Any>) -> Result<Option<Argument>, CommandError> {
        if !self.is_enabled() {
            return Err(CommandError::Disabled(self.name.clone()));
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| match (&self.callable, argument) {
            (CommandCallable::Void(f), _) => {
                f();
                Ok(None)
            }
            (CommandCallable::Read(f), _) | (CommandCallable::VoidReturn(f), _) => Ok(Some(f())),
            (CommandCallable::Write(f), Some(arg)) => {
                if f(arg) {
                    Ok(None)
                } else {
                    Err(CommandError::ArgumentMismatch(self.name.clone()))
                }
            }
            (CommandCallable::QualifiedRead(f), Some(arg))
            | (CommandCallable::WriteReturn(f), Some(arg)) => f(arg)
                .map(Some)
                .ok_or_else(|| CommandError::ArgumentMismatch(self.name.clone())),
            (_, None) => Err(CommandError::ArgumentMismatch(self.name.clone())),
        }));

        match outcome {
            Ok(result) => result,
            Err(payload) => Err(CommandError::ExecutionFailed {
                command: self.name.clone(),
                reason: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("shape", &self.shape())
            .field("argument", &self.argument.map(|p| p.type_name()))
            .field("result", &self.result.map(|p| p.type_name()))
            .field("queueing", &self.queueing)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

fn transform<A, R, F>(f: F) -> TransformFn
where
    A: Send + 'static,
    R: Send + 'static,
    F: Fn(&A) -> R + Send + Sync + 'static,
{
    Arc::new(move |arg: &dyn Any| {
        arg.downcast_ref::<A>()
            .map(|value| Box::new(f(value)) as Argument)
    })
}

/// Downcast an erased result to its concrete type
pub(crate) fn take_result<R: 'static>(name: &str, value: Option<Argument>) -> Result<R, CommandError> {
    value
        .and_then(|boxed| boxed.downcast::<R>().ok())
        .map(|boxed| *boxed)
        .ok_or_else(|| CommandError::ArgumentMismatch(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    #[test]
    fn test_shapes_dispatch() {
        let counter = Arc::new(AtomicI64::new(0));

        let c = counter.clone();
        let void = Command::void("Increment", move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(void.shape(), CommandShape::Void);
        assert!(void.execute(None).unwrap().is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let c = counter.clone();
        let write = Command::write("Add", move |v: &i64| {
            c.fetch_add(*v, Ordering::SeqCst);
        });
        write.execute(Some(&5i64)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 6);

        let qr = Command::qualified_read("Scale", |v: &i64| v * 3);
        let out = qr.execute(Some(&7i64)).unwrap();
        assert_eq!(take_result::<i64>("Scale", out).unwrap(), 21);

        let read = Command::read("Answer", || 42i32);
        assert_eq!(read.shape(), CommandShape::Read);
        assert_eq!(read.queueing(), QueueingPolicy::NotQueued);
        assert_eq!(take_result::<i32>("Answer", read.execute(None).unwrap()).unwrap(), 42);
    }

    #[test]
    fn test_wrong_argument_type_is_reported() {
        let write = Command::write("Set", |_v: &f64| {});
        let err = write.execute(Some(&1u8)).unwrap_err();
        assert_eq!(err, CommandError::ArgumentMismatch("Set".to_string()));

        let err = write.execute(None).unwrap_err();
        assert_eq!(err, CommandError::ArgumentMismatch("Set".to_string()));
    }

    #[test]
    fn test_panic_becomes_execution_error() {
        let cmd = Command::void("Explode", || panic!("boom"));
        match cmd.execute(None) {
            Err(CommandError::ExecutionFailed { command, reason }) => {
                assert_eq!(command, "Explode");
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected outcome: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_disabled_command() {
        let cmd = Command::void_return("Ping", || 1u8);
        cmd.set_enabled(false);
        assert_eq!(
            cmd.execute(None).unwrap_err(),
            CommandError::Disabled("Ping".to_string())
        );
        cmd.set_enabled(true);
        assert!(cmd.execute(None).is_ok());
    }

    #[test]
    fn test_prototypes() {
        let cmd = Command::write_return("Convert", |v: &u16| *v as f32);
        assert_eq!(cmd.argument_prototype(), Some(ArgumentPrototype::of::<u16>()));
        assert_eq!(cmd.result_prototype(), Some(ArgumentPrototype::of::<f32>()));
        assert_ne!(cmd.argument_prototype(), Some(ArgumentPrototype::of::<u32>()));
    }
}
