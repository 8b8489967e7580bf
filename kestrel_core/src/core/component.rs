use super::TaskContext;
use crate::command::Requirement;
use crate::config::ComponentParams;
use crate::error::{KestrelError, KestrelResult};
use crate::interface::{ProvidedInterface, RequiredInterface};
use crate::mailbox::MailboxSet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle shared by tasks and devices
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum ComponentState {
    #[default]
    Constructed,
    Initializing,
    Ready,
    Active,
    Finishing,
    Finished,
}

impl ComponentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Constructed => "CONSTRUCTED",
            Self::Initializing => "INITIALIZING",
            Self::Ready => "READY",
            Self::Active => "ACTIVE",
            Self::Finishing => "FINISHING",
            Self::Finished => "FINISHED",
        }
    }

    /// READY or ACTIVE: the scheduler loop is running and draining mailboxes
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Ready | Self::Active)
    }

    pub fn is_terminal(&self) -> bool {
        *self == Self::Finished
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User hooks of a component.
///
/// `configure` runs on the thread calling `create`; the other hooks run on the task's own thread
/// (or inline for a device). Panics escaping a hook are caught and logged.
pub trait Component: Send + 'static {
    /// Register state table elements and apply parameters
    fn configure(&mut self, _ctx: &mut TaskContext, _params: &ComponentParams) -> KestrelResult<()> {
        Ok(())
    }

    fn startup(&mut self, _ctx: &mut TaskContext) -> KestrelResult<()> {
        Ok(())
    }

    /// Called once per cycle while ACTIVE
    fn run(&mut self, ctx: &mut TaskContext);

    fn cleanup(&mut self, _ctx: &mut TaskContext) {}
}

/// Component with no behaviour of its own, for devices that only serve commands
#[derive(Debug, Default, Clone, Copy)]
pub struct Passive;

impl Component for Passive {
    fn run(&mut self, _ctx: &mut TaskContext) {}
}

/// Name, identity and interfaces of a component
pub struct ComponentCore {
    name: String,
    instance_id: Uuid,
    mailboxes: Option<Arc<MailboxSet>>,
    provided: RwLock<BTreeMap<String, Arc<ProvidedInterface>>>,
    required: RwLock<BTreeMap<String, Arc<RequiredInterface>>>,
}

impl ComponentCore {
    pub(crate) fn new(name: &str, mailboxes: Option<Arc<MailboxSet>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            instance_id: Uuid::new_v4(),
            mailboxes,
            provided: RwLock::new(BTreeMap::new()),
            required: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// True if the component owns a thread and drains mailboxes
    pub fn has_thread(&self) -> bool {
        self.mailboxes.is_some()
    }

    pub fn add_interface_provided(&self, name: &str) -> KestrelResult<Arc<ProvidedInterface>> {
        let mut provided = self.provided.write();
        if provided.contains_key(name) {
            return Err(KestrelError::DuplicateInterface {
                component: self.name.clone(),
                interface: name.to_string(),
            });
        }
        let interface = Arc::new(ProvidedInterface::new(
            name,
            &self.name,
            self.mailboxes.clone(),
        ));
        provided.insert(name.to_string(), interface.clone());
        Ok(interface)
    }

    pub fn add_interface_required(
        &self,
        name: &str,
        requirement: Requirement,
    ) -> KestrelResult<Arc<RequiredInterface>> {
        let mut required = self.required.write();
        if required.contains_key(name) {
            return Err(KestrelError::DuplicateInterface {
                component: self.name.clone(),
                interface: name.to_string(),
            });
        }
        let interface = Arc::new(RequiredInterface::new(
            name,
            &self.name,
            requirement,
            self.mailboxes.clone(),
        ));
        required.insert(name.to_string(), interface.clone());
        Ok(interface)
    }

    pub fn provided_interface(&self, name: &str) -> Option<Arc<ProvidedInterface>> {
        self.provided.read().get(name).cloned()
    }

    pub fn required_interface(&self, name: &str) -> Option<Arc<RequiredInterface>> {
        self.required.read().get(name).cloned()
    }

    pub fn provided_interface_names(&self) -> Vec<String> {
        self.provided.read().keys().cloned().collect()
    }

    pub fn required_interface_names(&self) -> Vec<String> {
        self.required.read().keys().cloned().collect()
    }

    /// Mandatory required interfaces that are not connected
    pub fn unconnected_mandatory(&self) -> Vec<String> {
        self.required
            .read()
            .values()
            .filter(|r| r.requirement() == Requirement::Mandatory && !r.is_connected())
            .map(|r| r.name().to_string())
            .collect()
    }

    /// Disconnect every connected required interface of this component
    pub fn disconnect_all(&self) {
        for required in self.required.read().values() {
            if required.is_connected() {
                let _ = required.disconnect();
            }
        }
    }
}

impl fmt::Debug for ComponentCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentCore")
            .field("name", &self.name)
            .field("instance_id", &self.instance_id)
            .field("provided", &self.provided_interface_names())
            .field("required", &self.required_interface_names())
            .finish()
    }
}
