//! Caller-side function handles
//!
//! Each handle shares its binding slot with the required interface that created it, so handles
//! can be cloned into the component before the interface is connected. An unbound handle returns
//! [`CommandError::NotBound`].

use super::{CommandInvoker, Dispatch, Invocation};
use crate::command::{take_result, Argument};
use crate::error::CommandError;
use parking_lot::RwLock;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

pub(crate) type InvokerSlot = Arc<RwLock<Option<Arc<dyn CommandInvoker>>>>;

#[derive(Clone)]
pub(crate) struct FunctionCore {
    name: Arc<str>,
    slot: InvokerSlot,
}

impl FunctionCore {
    pub(crate) fn new(name: &str, slot: InvokerSlot) -> Self {
        Self {
            name: Arc::from(name),
            slot,
        }
    }

    fn invoker(&self) -> Result<Arc<dyn CommandInvoker>, CommandError> {
        self.slot.read().clone().ok_or(CommandError::NotBound)
    }

    fn invoke(&self, argument: Option<Argument>, blocking: bool) -> Result<Invocation, CommandError> {
        self.invoker()?.invoke(argument, blocking)
    }

    fn dispatch(&self, argument: Option<Argument>) -> Result<Dispatch, CommandError> {
        match self.invoke(argument, false)? {
            Invocation::Queued => Ok(Dispatch::Queued),
            Invocation::Completed(_) => Ok(Dispatch::Executed),
        }
    }

    fn wait(&self, argument: Option<Argument>) -> Result<(), CommandError> {
        self.invoke(argument, true).map(|_| ())
    }

    fn value<R: 'static>(&self, argument: Option<Argument>) -> Result<R, CommandError> {
        match self.invoke(argument, true)? {
            Invocation::Completed(value) => take_result(&self.name, value),
            Invocation::Queued => Err(CommandError::ArgumentMismatch(self.name.to_string())),
        }
    }

    fn is_bound(&self) -> bool {
        self.slot.read().is_some()
    }

    fn is_queued(&self) -> bool {
        self.slot
            .read()
            .as_ref()
            .map(|invoker| invoker.is_queued())
            .unwrap_or(false)
    }
}

impl fmt::Debug for FunctionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("bound", &self.is_bound())
            .field("queued", &self.is_queued())
            .finish()
    }
}

macro_rules! function_common {
    () => {
        pub fn name(&self) -> &str {
            &self.core.name
        }

        pub fn is_bound(&self) -> bool {
            self.core.is_bound()
        }

        /// True if calls go through the provider's mailbox
        pub fn is_queued(&self) -> bool {
            self.core.is_queued()
        }
    };
}

/// Function bound to a void command
#[derive(Debug, Clone)]
pub struct FunctionVoid {
    core: FunctionCore,
}

impl FunctionVoid {
    pub(crate) fn new(core: FunctionCore) -> Self {
        Self { core }
    }

    function_common!();

    pub fn call(&self) -> Result<Dispatch, CommandError> {
        self.core.dispatch(None)
    }

    /// Wait until the command ran on the provider's thread
    pub fn call_blocking(&self) -> Result<(), CommandError> {
        self.core.wait(None)
    }
}

/// Function bound to a write command taking a `T`
pub struct FunctionWrite<T> {
    core: FunctionCore,
    _marker: PhantomData<fn(T)>,
}

impl<T: Clone + Send + 'static> FunctionWrite<T> {
    pub(crate) fn new(core: FunctionCore) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    function_common!();

    /// Invoke with a copy of `value`
    pub fn call(&self, value: &T) -> Result<Dispatch, CommandError> {
        self.core.dispatch(Some(Box::new(value.clone())))
    }

    pub fn call_blocking(&self, value: &T) -> Result<(), CommandError> {
        self.core.wait(Some(Box::new(value.clone())))
    }
}

/// Function bound to a read command returning an `R`
pub struct FunctionRead<R> {
    core: FunctionCore,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Send + 'static> FunctionRead<R> {
    pub(crate) fn new(core: FunctionCore) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    function_common!();

    pub fn call(&self) -> Result<R, CommandError> {
        self.core.value(None)
    }
}

/// Function bound to a qualified read: `Q` in, `R` out
pub struct FunctionQualifiedRead<Q, R> {
    core: FunctionCore,
    _marker: PhantomData<fn(Q) -> R>,
}

impl<Q: Clone + Send + 'static, R: Send + 'static> FunctionQualifiedRead<Q, R> {
    pub(crate) fn new(core: FunctionCore) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    function_common!();

    pub fn call(&self, qualifier: &Q) -> Result<R, CommandError> {
        self.core.value(Some(Box::new(qualifier.clone())))
    }
}

/// Function bound to a write-return command: `A` in, `R` out
pub struct FunctionWriteReturn<A, R> {
    core: FunctionCore,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A: Clone + Send + 'static, R: Send + 'static> FunctionWriteReturn<A, R> {
    pub(crate) fn new(core: FunctionCore) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    function_common!();

    pub fn call(&self, argument: &A) -> Result<R, CommandError> {
        self.core.value(Some(Box::new(argument.clone())))
    }
}

/// Function bound to a void-return command returning an `R`
pub struct FunctionVoidReturn<R> {
    core: FunctionCore,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Send + 'static> FunctionVoidReturn<R> {
    pub(crate) fn new(core: FunctionCore) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    function_common!();

    pub fn call(&self) -> Result<R, CommandError> {
        self.core.value(None)
    }
}

macro_rules! impl_clone_debug {
    ($name:ident < $($param:ident),+ >) => {
        impl<$($param),+> Clone for $name<$($param),+> {
            fn clone(&self) -> Self {
                Self {
                    core: self.core.clone(),
                    _marker: PhantomData,
                }
            }
        }

        impl<$($param),+> fmt::Debug for $name<$($param),+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.core).finish()
            }
        }
    };
}

impl_clone_debug!(FunctionWrite<T>);
impl_clone_debug!(FunctionRead<R>);
impl_clone_debug!(FunctionQualifiedRead<Q, R>);
impl_clone_debug!(FunctionWriteReturn<A, R>);
impl_clone_debug!(FunctionVoidReturn<R>);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::interface::DirectInvoker;

    fn bound(command: Command) -> FunctionCore {
        let invoker: Arc<dyn CommandInvoker> = Arc::new(DirectInvoker::new(Arc::new(command)));
        FunctionCore::new("f", Arc::new(RwLock::new(Some(invoker))))
    }

    #[test]
    fn test_unbound_function_returns_not_bound() {
        let core = FunctionCore::new("missing", Arc::new(RwLock::new(None)));
        let f = FunctionRead::<i32>::new(core.clone());
        assert!(!f.is_bound());
        assert_eq!(f.call().unwrap_err(), CommandError::NotBound);
        assert_eq!(FunctionVoid::new(core).call().unwrap_err(), CommandError::NotBound);
    }

    #[test]
    fn test_direct_calls() {
        let f = FunctionWriteReturn::<String, usize>::new(bound(Command::write_return(
            "Len",
            |s: &String| s.len(),
        )));
        assert!(f.is_bound());
        assert!(!f.is_queued());
        assert_eq!(f.call(&"kestrel".to_string()).unwrap(), 7);

        let v = FunctionVoid::new(bound(Command::void("Noop", || {})));
        assert_eq!(v.call().unwrap(), Dispatch::Executed);
    }

    #[test]
    fn test_result_type_mismatch_is_reported() {
        let f = FunctionVoidReturn::<u64>::new(bound(Command::void_return("Wrong", || 1u8)));
        assert!(matches!(f.call(), Err(CommandError::ArgumentMismatch(_))));
    }
}
