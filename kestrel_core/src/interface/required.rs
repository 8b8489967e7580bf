use super::event::ObserverId;
use super::function::{FunctionCore, InvokerSlot};
use super::provided::{describe, ProvidedInterface};
use super::{
    CommandInvoker, DirectInvoker, FunctionQualifiedRead, FunctionRead, FunctionVoid,
    FunctionVoidReturn, FunctionWrite, FunctionWriteReturn, QueuedInvoker,
};
use crate::command::{ArgumentPrototype, Command, CommandShape, QueueingPolicy, Requirement};
use crate::error::{BindError, KestrelError, KestrelResult};
use crate::mailbox::{Mailbox, MailboxSet};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

struct FunctionEntry {
    name: String,
    shape: CommandShape,
    argument: Option<ArgumentPrototype>,
    result: Option<ArgumentPrototype>,
    requirement: Requirement,
    slot: InvokerSlot,
}

struct HandlerEntry {
    event: String,
    command: Arc<Command>,
    requirement: Requirement,
}

struct Connection {
    provided: Arc<ProvidedInterface>,
    client_key: String,
    observers: Vec<(String, ObserverId)>,
}

/// Functions and event handlers a component expects another component to provide
pub struct RequiredInterface {
    name: String,
    component: String,
    requirement: Requirement,
    mailboxes: Option<Arc<MailboxSet>>,
    functions: RwLock<Vec<FunctionEntry>>,
    handlers: RwLock<Vec<HandlerEntry>>,
    connection: Mutex<Option<Connection>>,
    blocking_timeout: RwLock<Option<Duration>>,
}

impl RequiredInterface {
    pub(crate) fn new(
        name: &str,
        component: &str,
        requirement: Requirement,
        mailboxes: Option<Arc<MailboxSet>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            component: component.to_string(),
            requirement,
            mailboxes,
            functions: RwLock::new(Vec::new()),
            handlers: RwLock::new(Vec::new()),
            connection: Mutex::new(None),
            blocking_timeout: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component_name(&self) -> &str {
        &self.component
    }

    pub fn requirement(&self) -> Requirement {
        self.requirement
    }

    /// Upper bound for blocking calls routed through a mailbox; applies to later connections
    pub fn set_blocking_timeout(&self, timeout: Option<Duration>) {
        *self.blocking_timeout.write() = timeout;
    }

    fn add_function(
        &self,
        name: &str,
        shape: CommandShape,
        argument: Option<ArgumentPrototype>,
        result: Option<ArgumentPrototype>,
        requirement: Requirement,
    ) -> KestrelResult<FunctionCore> {
        if self.is_connected() {
            return Err(KestrelError::invalid_input(format!(
                "required interface '{}.{}' is connected, cannot add function '{}'",
                self.component, self.name, name
            )));
        }
        let mut functions = self.functions.write();
        if functions.iter().any(|f| f.name == name && f.shape == shape) {
            return Err(KestrelError::DuplicateName {
                interface: self.name.clone(),
                name: name.to_string(),
            });
        }
        let slot: InvokerSlot = Arc::new(RwLock::new(None));
        functions.push(FunctionEntry {
            name: name.to_string(),
            shape,
            argument,
            result,
            requirement,
            slot: slot.clone(),
        });
        Ok(FunctionCore::new(name, slot))
    }

    pub fn add_function_void(&self, name: &str, requirement: Requirement) -> KestrelResult<FunctionVoid> {
        self.add_function(name, CommandShape::Void, None, None, requirement)
            .map(FunctionVoid::new)
    }

    pub fn add_function_read<R: Send + 'static>(
        &self,
        name: &str,
        requirement: Requirement,
    ) -> KestrelResult<FunctionRead<R>> {
        self.add_function(
            name,
            CommandShape::Read,
            None,
            Some(ArgumentPrototype::of::<R>()),
            requirement,
        )
        .map(FunctionRead::new)
    }

    pub fn add_function_write<T: Clone + Send + 'static>(
        &self,
        name: &str,
        requirement: Requirement,
    ) -> KestrelResult<FunctionWrite<T>> {
        self.add_function(
            name,
            CommandShape::Write,
            Some(ArgumentPrototype::of::<T>()),
            None,
            requirement,
        )
        .map(FunctionWrite::new)
    }

    pub fn add_function_qualified_read<Q: Clone + Send + 'static, R: Send + 'static>(
        &self,
        name: &str,
        requirement: Requirement,
    ) -> KestrelResult<FunctionQualifiedRead<Q, R>> {
        self.add_function(
            name,
            CommandShape::QualifiedRead,
            Some(ArgumentPrototype::of::<Q>()),
            Some(ArgumentPrototype::of::<R>()),
            requirement,
        )
        .map(FunctionQualifiedRead::new)
    }

    pub fn add_function_write_return<A: Clone + Send + 'static, R: Send + 'static>(
        &self,
        name: &str,
        requirement: Requirement,
    ) -> KestrelResult<FunctionWriteReturn<A, R>> {
        self.add_function(
            name,
            CommandShape::WriteReturn,
            Some(ArgumentPrototype::of::<A>()),
            Some(ArgumentPrototype::of::<R>()),
            requirement,
        )
        .map(FunctionWriteReturn::new)
    }

    pub fn add_function_void_return<R: Send + 'static>(
        &self,
        name: &str,
        requirement: Requirement,
    ) -> KestrelResult<FunctionVoidReturn<R>> {
        self.add_function(
            name,
            CommandShape::VoidReturn,
            None,
            Some(ArgumentPrototype::of::<R>()),
            requirement,
        )
        .map(FunctionVoidReturn::new)
    }

    fn add_handler(&self, event: &str, command: Command, requirement: Requirement) -> KestrelResult<()> {
        if self.is_connected() {
            return Err(KestrelError::invalid_input(format!(
                "required interface '{}.{}' is connected, cannot add handler for '{}'",
                self.component, self.name, event
            )));
        }
        let mut handlers = self.handlers.write();
        if handlers.iter().any(|h| h.event == event) {
            return Err(KestrelError::DuplicateName {
                interface: self.name.clone(),
                name: event.to_string(),
            });
        }
        handlers.push(HandlerEntry {
            event: event.to_string(),
            command: Arc::new(command),
            requirement,
        });
        Ok(())
    }

    /// Handle a void event. With a queued policy on a task, the handler runs on the task's
    /// thread during its next event drain; otherwise in the thread that fires the event.
    pub fn add_event_handler_void<F>(
        &self,
        event: &str,
        handler: F,
        policy: QueueingPolicy,
        requirement: Requirement,
    ) -> KestrelResult<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_handler(
            event,
            Command::void(event, handler).with_queueing(policy),
            requirement,
        )
    }

    pub fn add_event_handler_write<T, F>(
        &self,
        event: &str,
        handler: F,
        policy: QueueingPolicy,
        requirement: Requirement,
    ) -> KestrelResult<()>
    where
        T: Send + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.add_handler(
            event,
            Command::write(event, handler).with_queueing(policy),
            requirement,
        )
    }

    pub fn function_names(&self) -> Vec<String> {
        self.functions.read().iter().map(|f| f.name.clone()).collect()
    }

    pub fn event_handler_names(&self) -> Vec<String> {
        self.handlers.read().iter().map(|h| h.event.clone()).collect()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }

    /// `(component, interface)` of the connected provided interface
    pub fn connected_to(&self) -> Option<(String, String)> {
        self.connection.lock().as_ref().map(|c| {
            (
                c.provided.component_name().to_string(),
                c.provided.name().to_string(),
            )
        })
    }

    fn client_key(&self) -> String {
        format!("{}.{}", self.component, self.name)
    }

    fn handler_invoker(&self, command: &Arc<Command>) -> Arc<dyn CommandInvoker> {
        let queued = command.queueing() != QueueingPolicy::NotQueued;
        match (&self.mailboxes, queued) {
            (Some(mailboxes), true) => Arc::new(QueuedInvoker::new(
                command.clone(),
                mailboxes.event_mailbox().clone(),
                None,
            )),
            _ => Arc::new(DirectInvoker::new(command.clone())),
        }
    }

    /// Resolve every function and event handler against `provided` and bind them.
    ///
    /// Fails without side effects if a mandatory function or handler cannot be resolved or has a
    /// different type. Optional ones that cannot be resolved stay unbound.
    pub fn connect_to(&self, provided: &Arc<ProvidedInterface>) -> Result<(), BindError> {
        let mut connection = self.connection.lock();
        if connection.is_some() {
            return Err(BindError::AlreadyConnected(self.client_key()));
        }

        // Resolve without side effects first
        let functions = self.functions.read();
        let mut resolved: Vec<(usize, Arc<Command>)> = Vec::new();
        for (position, function) in functions.iter().enumerate() {
            match resolve(provided, function) {
                Ok(command) => resolved.push((position, command)),
                Err(err) if function.requirement == Requirement::Optional => {
                    log::debug!(
                        "'{}': optional function '{}' left unbound: {}",
                        self.client_key(),
                        function.name,
                        err
                    );
                }
                Err(err) => {
                    log::error!(
                        "Failed to connect '{}' to '{}.{}': {}",
                        self.client_key(),
                        provided.component_name(),
                        provided.name(),
                        err
                    );
                    return Err(err);
                }
            }
        }

        let handlers = self.handlers.read();
        let mut handled: Vec<&HandlerEntry> = Vec::new();
        for handler in handlers.iter() {
            let check = provided.event_argument(&handler.event).and_then(|argument| {
                if argument == handler.command.argument_prototype() {
                    Ok(())
                } else {
                    Err(BindError::TypeMismatch {
                        name: handler.event.clone(),
                        expected: describe(handler.command.argument_prototype()),
                        found: describe(argument),
                    })
                }
            });
            match check {
                Ok(()) => handled.push(handler),
                Err(err) if handler.requirement == Requirement::Optional => {
                    log::debug!(
                        "'{}': optional event handler '{}' not attached: {}",
                        self.client_key(),
                        handler.event,
                        err
                    );
                }
                Err(err) => {
                    log::error!(
                        "Failed to connect '{}' to '{}.{}': {}",
                        self.client_key(),
                        provided.component_name(),
                        provided.name(),
                        err
                    );
                    return Err(err);
                }
            }
        }

        // Same component means same thread: call inline
        let same_component = provided.component_name() == self.component;
        let client_key = self.client_key();
        let needs_mailbox = !same_component
            && resolved
                .iter()
                .any(|(_, command)| provided.routes_through_mailbox(command));
        let mailbox: Option<Arc<Mailbox>> = if needs_mailbox {
            provided.end_user(&client_key).map_err(|err| {
                log::error!("Failed to connect '{}': {}", client_key, err);
                err
            })?
        } else {
            None
        };

        let mut observers = Vec::new();
        for handler in handled {
            let invoker = self.handler_invoker(&handler.command);
            match provided.add_observer(&handler.event, invoker) {
                Ok(id) => observers.push((handler.event.clone(), id)),
                Err(err) => {
                    for (event, id) in observers {
                        provided.remove_observer(&event, id);
                    }
                    if mailbox.is_some() {
                        provided.release_end_user(&client_key);
                    }
                    return Err(err);
                }
            }
        }

        let timeout = *self.blocking_timeout.read();
        for (position, command) in resolved {
            let invoker: Arc<dyn CommandInvoker> = match &mailbox {
                Some(mailbox) if provided.routes_through_mailbox(&command) => {
                    Arc::new(QueuedInvoker::new(command, mailbox.clone(), timeout))
                }
                _ => Arc::new(DirectInvoker::new(command)),
            };
            *functions[position].slot.write() = Some(invoker);
        }

        log::debug!(
            "Connected '{}' to '{}.{}' ({} queued)",
            client_key,
            provided.component_name(),
            provided.name(),
            mailbox.is_some()
        );
        *connection = Some(Connection {
            provided: provided.clone(),
            client_key,
            observers,
        });
        Ok(())
    }

    /// Unbind every function and detach event handlers
    pub fn disconnect(&self) -> Result<(), BindError> {
        let connection = self
            .connection
            .lock()
            .take()
            .ok_or_else(|| BindError::NotConnected(self.client_key()))?;

        for function in self.functions.read().iter() {
            *function.slot.write() = None;
        }
        for (event, id) in &connection.observers {
            connection.provided.remove_observer(event, *id);
        }
        connection.provided.release_end_user(&connection.client_key);

        log::debug!(
            "Disconnected '{}' from '{}.{}'",
            connection.client_key,
            connection.provided.component_name(),
            connection.provided.name()
        );
        Ok(())
    }
}

fn resolve(provided: &ProvidedInterface, function: &FunctionEntry) -> Result<Arc<Command>, BindError> {
    let command = provided
        .command(function.shape, &function.name)
        .ok_or_else(|| BindError::UnknownCommand {
            interface: provided.name().to_string(),
            command: function.name.clone(),
        })?;

    if command.argument_prototype() != function.argument {
        return Err(BindError::TypeMismatch {
            name: function.name.clone(),
            expected: describe(function.argument),
            found: describe(command.argument_prototype()),
        });
    }
    if command.result_prototype() != function.result {
        return Err(BindError::TypeMismatch {
            name: function.name.clone(),
            expected: describe(function.result),
            found: describe(command.result_prototype()),
        });
    }
    Ok(command)
}

impl fmt::Debug for RequiredInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequiredInterface")
            .field("name", &self.name)
            .field("component", &self.component)
            .field("requirement", &self.requirement)
            .field("functions", &self.function_names())
            .field("handlers", &self.event_handler_names())
            .field("connected_to", &self.connected_to())
            .finish()
    }
}
