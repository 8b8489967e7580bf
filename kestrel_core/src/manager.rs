//! Component manager: registry, connections and bulk lifecycle control
//!
//! The manager owns every task and device of a process. It resolves connections by
//! `(component, interface)` names and drives all components through their lifecycle together.
//!
//! ```no_run
//! use kestrel_core::{ComponentManager, Device, Passive, Task, TaskConfig};
//! use std::time::Duration;
//!
//! let manager = ComponentManager::new();
//! let task = manager.add_task(Task::new(TaskConfig::periodic("ctrl", Duration::from_millis(5)))?)?;
//! task.set_component(Passive)?;
//! manager.create_all_and_wait(Duration::from_secs(3))?;
//! manager.start_all_and_wait(Duration::from_secs(3))?;
//! manager.kill_all_and_wait(Duration::from_secs(3))?;
//! # Ok::<(), kestrel_core::KestrelError>(())
//! ```

use crate::config::{ConnectionConfig, ManagerConfig};
use crate::core::ComponentState;
use crate::error::{BindError, KestrelError, KestrelResult};
use crate::interface::{ProvidedInterface, RequiredInterface};
use crate::scheduling::{Device, Lifecycle, Task};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Registry of the components of one process
#[derive(Default)]
pub struct ComponentManager {
    components: RwLock<BTreeMap<String, Arc<dyn Lifecycle>>>,
    connections: RwLock<Vec<ConnectionConfig>>,
}

impl ComponentManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&self, task: Task) -> KestrelResult<Arc<Task>> {
        let task = Arc::new(task);
        self.add_component(task.clone())?;
        Ok(task)
    }

    pub fn add_device(&self, device: Device) -> KestrelResult<Arc<Device>> {
        let device = Arc::new(device);
        self.add_component(device.clone())?;
        Ok(device)
    }

    pub fn add_component(&self, component: Arc<dyn Lifecycle>) -> KestrelResult<()> {
        let mut components = self.components.write();
        let name = component.name().to_string();
        if components.contains_key(&name) {
            return Err(KestrelError::DuplicateComponent(name));
        }
        log::debug!("Component '{}' added to manager", name);
        components.insert(name, component);
        Ok(())
    }

    /// Kill a component, wait for it to finish and drop every connection to or from it
    pub fn remove_component(&self, name: &str, timeout: Duration) -> KestrelResult<()> {
        let component = self
            .component(name)
            .ok_or_else(|| BindError::UnknownComponent(name.to_string()))?;

        component.kill()?;
        if !component.wait_for_state(ComponentState::Finished, Some(timeout)) {
            return Err(KestrelError::internal(format!(
                "component '{}' did not finish within {:?}",
                name, timeout
            )));
        }
        component.join(Some(timeout));

        let served: Vec<ConnectionConfig> = self
            .connections
            .read()
            .iter()
            .filter(|c| c.server == name && c.client != name)
            .cloned()
            .collect();
        for connection in served {
            self.disconnect(&connection.client, &connection.required)?;
        }
        component.component_core().disconnect_all();
        self.connections.write().retain(|c| c.client != name);

        self.components.write().remove(name);
        log::debug!("Component '{}' removed from manager", name);
        Ok(())
    }

    pub fn component(&self, name: &str) -> Option<Arc<dyn Lifecycle>> {
        self.components.read().get(name).cloned()
    }

    pub fn component_names(&self) -> Vec<String> {
        self.components.read().keys().cloned().collect()
    }

    pub fn connections(&self) -> Vec<ConnectionConfig> {
        self.connections.read().clone()
    }

    fn required_interface(&self, component: &str, interface: &str) -> Result<Arc<RequiredInterface>, BindError> {
        let lifecycle = self
            .component(component)
            .ok_or_else(|| BindError::UnknownComponent(component.to_string()))?;
        lifecycle
            .component_core()
            .required_interface(interface)
            .ok_or_else(|| BindError::UnknownInterface {
                component: component.to_string(),
                interface: interface.to_string(),
            })
    }

    fn provided_interface(&self, component: &str, interface: &str) -> Result<Arc<ProvidedInterface>, BindError> {
        let lifecycle = self
            .component(component)
            .ok_or_else(|| BindError::UnknownComponent(component.to_string()))?;
        lifecycle
            .component_core()
            .provided_interface(interface)
            .ok_or_else(|| BindError::UnknownInterface {
                component: component.to_string(),
                interface: interface.to_string(),
            })
    }

    /// Connect `client.required` to `server.provided`
    pub fn connect(&self, client: &str, required: &str, server: &str, provided: &str) -> KestrelResult<()> {
        let req = self.required_interface(client, required)?;
        let prov = self.provided_interface(server, provided)?;
        req.connect_to(&prov)?;
        self.connections
            .write()
            .push(ConnectionConfig::new(client, required, server, provided));
        log::info!(
            "Connected '{}.{}' to '{}.{}'",
            client,
            required,
            server,
            provided
        );
        Ok(())
    }

    pub fn disconnect(&self, client: &str, required: &str) -> KestrelResult<()> {
        let req = self.required_interface(client, required)?;
        req.disconnect()?;
        self.connections
            .write()
            .retain(|c| !(c.client == client && c.required == required));
        Ok(())
    }

    /// Set parameters of the named components, then make the listed connections
    pub fn apply_config(&self, config: &ManagerConfig) -> KestrelResult<()> {
        for (name, params) in &config.components {
            let component = self
                .component(name)
                .ok_or_else(|| BindError::UnknownComponent(name.clone()))?;
            component.set_params(params.clone());
        }
        for c in &config.connections {
            self.connect(&c.client, &c.required, &c.server, &c.provided)?;
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<dyn Lifecycle>> {
        self.components.read().values().cloned().collect()
    }

    /// Apply `op` to every component; all are attempted, the first error is returned
    fn for_each(
        &self,
        operation: &str,
        components: Vec<Arc<dyn Lifecycle>>,
        op: impl Fn(&dyn Lifecycle) -> KestrelResult<()>,
    ) -> KestrelResult<()> {
        let mut first_error = None;
        for component in components {
            if let Err(e) = op(component.as_ref()) {
                log::error!("Failed to {} '{}': {}", operation, component.name(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn create_all(&self) -> KestrelResult<()> {
        self.for_each("create", self.snapshot(), |c| {
            if c.state() == ComponentState::Constructed {
                c.create()
            } else {
                Ok(())
            }
        })
    }

    pub fn start_all(&self) -> KestrelResult<()> {
        self.for_each("start", self.snapshot(), |c| c.start())
    }

    pub fn suspend_all(&self) -> KestrelResult<()> {
        self.for_each("suspend", self.snapshot(), |c| {
            if c.state() == ComponentState::Active {
                c.suspend()
            } else {
                Ok(())
            }
        })
    }

    pub fn kill_all(&self) -> KestrelResult<()> {
        let mut components = self.snapshot();
        components.reverse();
        self.for_each("kill", components, |c| c.kill())
    }

    /// Wait until every component reaches `state`, sharing one deadline
    pub fn wait_for_state_all(&self, state: ComponentState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut reached = true;
        for component in self.snapshot() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !component.wait_for_state(state, Some(remaining)) {
                log::warn!(
                    "Component '{}' did not reach {} (currently {})",
                    component.name(),
                    state,
                    component.state()
                );
                reached = false;
            }
        }
        reached
    }

    fn wait_or_fail(&self, state: ComponentState, timeout: Duration) -> KestrelResult<()> {
        if self.wait_for_state_all(state, timeout) {
            Ok(())
        } else {
            Err(KestrelError::internal(format!(
                "not all components reached {} within {:?}",
                state, timeout
            )))
        }
    }

    pub fn create_all_and_wait(&self, timeout: Duration) -> KestrelResult<()> {
        self.create_all()?;
        self.wait_or_fail(ComponentState::Ready, timeout)
    }

    pub fn start_all_and_wait(&self, timeout: Duration) -> KestrelResult<()> {
        self.start_all()?;
        self.wait_or_fail(ComponentState::Active, timeout)
    }

    /// Kill everything, wait for FINISHED and join the task threads
    pub fn kill_all_and_wait(&self, timeout: Duration) -> KestrelResult<()> {
        self.kill_all()?;
        self.wait_or_fail(ComponentState::Finished, timeout)?;
        for component in self.snapshot() {
            component.join(Some(timeout));
        }
        Ok(())
    }

    /// Block until Ctrl+C, then kill every component and wait for them to finish
    pub fn run_until_signal(&self, timeout: Duration) -> KestrelResult<()> {
        let (tx, rx) = crossbeam::channel::bounded::<()>(1);
        ctrlc::set_handler(move || {
            let _ = tx.try_send(());
        })
        .map_err(|e| KestrelError::internal(format!("Failed to set signal handler: {}", e)))?;

        log::info!("Running {} component(s); press Ctrl+C to stop", self.components.read().len());
        let _ = rx.recv();
        log::info!("Ctrl+C received, shutting down");
        self.kill_all_and_wait(timeout)
    }
}

impl std::fmt::Debug for ComponentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentManager")
            .field("components", &self.component_names())
            .field("connections", &self.connections.read().len())
            .finish()
    }
}
