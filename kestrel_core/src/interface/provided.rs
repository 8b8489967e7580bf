use super::event::{EventSource, EventVoid, EventWrite, ObserverId};
use super::CommandInvoker;
use crate::command::{ArgumentPrototype, Command, CommandShape, QueueingPolicy};
use crate::error::{BindError, KestrelError, KestrelResult};
use crate::mailbox::{Mailbox, MailboxSet};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Named collection of commands and events exposed by a component.
///
/// When the owning component is a task, each connected client gets its own mailbox from the
/// task's [`MailboxSet`]; queued commands invoked by that client go through it.
pub struct ProvidedInterface {
    name: String,
    component: String,
    mailboxes: Option<Arc<MailboxSet>>,
    commands: RwLock<HashMap<CommandShape, BTreeMap<String, Arc<Command>>>>,
    events: RwLock<BTreeMap<String, Arc<EventSource>>>,
    end_users: Mutex<BTreeMap<String, Arc<Mailbox>>>,
}

impl ProvidedInterface {
    pub(crate) fn new(name: &str, component: &str, mailboxes: Option<Arc<MailboxSet>>) -> Self {
        Self {
            name: name.to_string(),
            component: component.to_string(),
            mailboxes,
            commands: RwLock::new(HashMap::new()),
            events: RwLock::new(BTreeMap::new()),
            end_users: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component_name(&self) -> &str {
        &self.component
    }

    /// True if the owner has a thread and mailboxes
    pub fn is_queued(&self) -> bool {
        self.mailboxes.is_some()
    }

    /// Register a command. Names are unique per shape.
    pub fn add_command(&self, command: Command) -> KestrelResult<Arc<Command>> {
        let mut commands = self.commands.write();
        let by_name = commands.entry(command.shape()).or_default();
        if by_name.contains_key(command.name()) {
            return Err(KestrelError::DuplicateName {
                interface: self.name.clone(),
                name: command.name().to_string(),
            });
        }
        let command = Arc::new(command);
        by_name.insert(command.name().to_string(), command.clone());
        log::trace!(
            "Interface '{}.{}': added {} command '{}'",
            self.component,
            self.name,
            command.shape(),
            command.name()
        );
        Ok(command)
    }

    pub fn add_command_void<F>(&self, name: &str, f: F) -> KestrelResult<Arc<Command>>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_command(Command::void(name, f))
    }

    pub fn add_command_read<R, F>(&self, name: &str, f: F) -> KestrelResult<Arc<Command>>
    where
        R: Send + 'static,
        F: Fn() -> R + Send + Sync + 'static,
    {
        self.add_command(Command::read(name, f))
    }

    pub fn add_command_write<T, F>(&self, name: &str, f: F) -> KestrelResult<Arc<Command>>
    where
        T: Send + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.add_command(Command::write(name, f))
    }

    pub fn add_command_qualified_read<Q, R, F>(&self, name: &str, f: F) -> KestrelResult<Arc<Command>>
    where
        Q: Send + 'static,
        R: Send + 'static,
        F: Fn(&Q) -> R + Send + Sync + 'static,
    {
        self.add_command(Command::qualified_read(name, f))
    }

    pub fn add_command_write_return<A, R, F>(&self, name: &str, f: F) -> KestrelResult<Arc<Command>>
    where
        A: Send + 'static,
        R: Send + 'static,
        F: Fn(&A) -> R + Send + Sync + 'static,
    {
        self.add_command(Command::write_return(name, f))
    }

    pub fn add_command_void_return<R, F>(&self, name: &str, f: F) -> KestrelResult<Arc<Command>>
    where
        R: Send + 'static,
        F: Fn() -> R + Send + Sync + 'static,
    {
        self.add_command(Command::void_return(name, f))
    }

    fn add_event_source(&self, name: &str, argument: Option<ArgumentPrototype>) -> KestrelResult<Arc<EventSource>> {
        let mut events = self.events.write();
        if events.contains_key(name) {
            return Err(KestrelError::DuplicateName {
                interface: self.name.clone(),
                name: name.to_string(),
            });
        }
        let source = Arc::new(EventSource::new(name, &self.name, argument));
        events.insert(name.to_string(), source.clone());
        Ok(source)
    }

    pub fn add_event_void(&self, name: &str) -> KestrelResult<EventVoid> {
        self.add_event_source(name, None).map(EventVoid::new)
    }

    pub fn add_event_write<T: Clone + Send + 'static>(&self, name: &str) -> KestrelResult<EventWrite<T>> {
        self.add_event_source(name, Some(ArgumentPrototype::of::<T>()))
            .map(EventWrite::new)
    }

    pub fn command(&self, shape: CommandShape, name: &str) -> Option<Arc<Command>> {
        self.commands
            .read()
            .get(&shape)
            .and_then(|by_name| by_name.get(name).cloned())
    }

    pub fn command_names(&self, shape: CommandShape) -> Vec<String> {
        self.commands
            .read()
            .get(&shape)
            .map(|by_name| by_name.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events.read().keys().cloned().collect()
    }

    /// Enable or disable every command with this name. Returns false if none matched.
    pub fn set_command_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut found = false;
        for by_name in self.commands.read().values() {
            if let Some(command) = by_name.get(name) {
                command.set_enabled(enabled);
                found = true;
            }
        }
        found
    }

    /// Whether invocations of `command` from another component go through a mailbox
    pub fn routes_through_mailbox(&self, command: &Command) -> bool {
        match command.queueing() {
            QueueingPolicy::NotQueued => false,
            QueueingPolicy::Queued | QueueingPolicy::InterfaceDefault => self.is_queued(),
        }
    }

    pub(crate) fn event_argument(&self, event: &str) -> Result<Option<ArgumentPrototype>, BindError> {
        self.events
            .read()
            .get(event)
            .map(|source| source.argument_prototype())
            .ok_or_else(|| BindError::UnknownEvent {
                interface: self.name.clone(),
                event: event.to_string(),
            })
    }

    pub fn add_observer(
        &self,
        event: &str,
        handler: Arc<dyn CommandInvoker>,
    ) -> Result<ObserverId, BindError> {
        let source = self
            .events
            .read()
            .get(event)
            .cloned()
            .ok_or_else(|| BindError::UnknownEvent {
                interface: self.name.clone(),
                event: event.to_string(),
            })?;

        if source.argument_prototype() != handler.argument_prototype() {
            return Err(BindError::TypeMismatch {
                name: event.to_string(),
                expected: describe(handler.argument_prototype()),
                found: describe(source.argument_prototype()),
            });
        }
        Ok(source.add_observer(handler))
    }

    pub fn remove_observer(&self, event: &str, id: ObserverId) -> bool {
        self.events
            .read()
            .get(event)
            .map(|source| source.remove_observer(id))
            .unwrap_or(false)
    }

    /// Per-connection mailbox for `client`, created on first use. `None` for interfaces without
    /// a thread. Fails once the owning task has closed its mailboxes.
    pub(crate) fn end_user(&self, client: &str) -> Result<Option<Arc<Mailbox>>, BindError> {
        let mailboxes = match &self.mailboxes {
            Some(mailboxes) => mailboxes,
            None => return Ok(None),
        };
        let finished = || BindError::ProviderFinished {
            component: self.component.clone(),
            interface: self.name.clone(),
        };
        let mut end_users = self.end_users.lock();
        if let Some(existing) = end_users.get(client) {
            if existing.is_closed() {
                return Err(finished());
            }
            return Ok(Some(existing.clone()));
        }
        let mailbox = mailboxes
            .create_mailbox(&format!("{}<-{}", self.name, client))
            .map_err(|err| {
                log::debug!(
                    "Interface '{}.{}': no mailbox for client '{}': {}",
                    self.component,
                    self.name,
                    client,
                    err
                );
                finished()
            })?;
        end_users.insert(client.to_string(), mailbox.clone());
        log::debug!(
            "Interface '{}.{}': created mailbox for client '{}'",
            self.component,
            self.name,
            client
        );
        Ok(Some(mailbox))
    }

    pub(crate) fn release_end_user(&self, client: &str) {
        if let Some(mailbox) = self.end_users.lock().remove(client) {
            if let Some(mailboxes) = &self.mailboxes {
                mailboxes.remove_mailbox(&mailbox);
            }
        }
    }

    pub fn client_names(&self) -> Vec<String> {
        self.end_users.lock().keys().cloned().collect()
    }
}

impl fmt::Debug for ProvidedInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let commands: BTreeMap<&'static str, Vec<String>> = self
            .commands
            .read()
            .iter()
            .map(|(shape, by_name)| (shape.as_str(), by_name.keys().cloned().collect()))
            .collect();
        f.debug_struct("ProvidedInterface")
            .field("name", &self.name)
            .field("component", &self.component)
            .field("queued", &self.is_queued())
            .field("commands", &commands)
            .field("events", &self.event_names())
            .finish()
    }
}

pub(crate) fn describe(prototype: Option<ArgumentPrototype>) -> String {
    prototype
        .map(|p| p.type_name().to_string())
        .unwrap_or_else(|| "()".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_names_rejected_per_shape() {
        let prov = ProvidedInterface::new("Prov", "B", None);
        prov.add_command_void("Reset", || {}).unwrap();
        assert!(matches!(
            prov.add_command_void("Reset", || {}),
            Err(KestrelError::DuplicateName { .. })
        ));
        prov.add_command_write("Reset", |_v: &bool| {}).unwrap();

        assert_eq!(prov.command_names(CommandShape::Void), vec!["Reset"]);
        assert_eq!(prov.command_names(CommandShape::Write), vec!["Reset"]);
        assert!(prov.command_names(CommandShape::Read).is_empty());

        prov.add_event_void("Done").unwrap();
        assert!(prov.add_event_write::<u8>("Done").is_err());
    }

    #[test]
    fn test_routing_policy() {
        let mailboxes = MailboxSet::new("B", 4).unwrap();
        let queued = ProvidedInterface::new("Prov", "B", Some(mailboxes));
        let write = queued.add_command_write("Set", |_v: &i32| {}).unwrap();
        let read = queued.add_command_read("Get", || 0i32).unwrap();
        let forced = queued
            .add_command(Command::void("Now", || {}).with_queueing(QueueingPolicy::NotQueued))
            .unwrap();

        assert!(queued.routes_through_mailbox(&write));
        assert!(!queued.routes_through_mailbox(&read));
        assert!(!queued.routes_through_mailbox(&forced));

        let device = ProvidedInterface::new("Prov", "D", None);
        let write = device.add_command_write("Set", |_v: &i32| {}).unwrap();
        assert!(!device.routes_through_mailbox(&write));
    }

    #[test]
    fn test_end_user_mailboxes() {
        let mailboxes = MailboxSet::new("B", 4).unwrap();
        let prov = ProvidedInterface::new("Prov", "B", Some(mailboxes.clone()));

        let first = prov.end_user("A.Req").unwrap().unwrap();
        let again = prov.end_user("A.Req").unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        prov.end_user("C.Req").unwrap();
        assert_eq!(mailboxes.mailbox_count(), 2);

        prov.release_end_user("A.Req");
        assert_eq!(mailboxes.mailbox_count(), 1);
        assert_eq!(prov.client_names(), vec!["C.Req"]);
        assert!(first.is_closed());
    }

    #[test]
    fn test_no_end_user_after_owner_closed() {
        let mailboxes = MailboxSet::new("B", 4).unwrap();
        let prov = ProvidedInterface::new("Prov", "B", Some(mailboxes.clone()));
        prov.end_user("A.Req").unwrap();
        mailboxes.close_all();

        let expected = BindError::ProviderFinished {
            component: "B".to_string(),
            interface: "Prov".to_string(),
        };
        assert_eq!(prov.end_user("A.Req").unwrap_err(), expected);
        assert_eq!(prov.end_user("C.Req").unwrap_err(), expected);
        assert_eq!(mailboxes.mailbox_count(), 1);
    }

    #[test]
    fn test_enable_disable_by_name() {
        let prov = ProvidedInterface::new("Prov", "B", None);
        let cmd = prov.add_command_void("Stop", || {}).unwrap();
        assert!(prov.set_command_enabled("Stop", false));
        assert!(!cmd.is_enabled());
        assert!(!prov.set_command_enabled("Missing", false));
    }
}
