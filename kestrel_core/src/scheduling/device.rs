use super::control::TaskControl;
use super::Lifecycle;
use crate::clock::TimeServer;
use crate::command::Requirement;
use crate::config::{ComponentParams, DEFAULT_INITIALIZATION_TIMEOUT_MS, DEFAULT_STATE_TABLE_SIZE};
use crate::core::{Component, ComponentCore, ComponentState, TaskContext, TaskMetrics};
use crate::error::{panic_message, KestrelError, KestrelResult};
use crate::interface::{ProvidedInterface, RequiredInterface};
use crate::state::{StateElement, StateTable, StateTableReader, StateValue};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

struct DeviceInner {
    component: Option<Box<dyn Component>>,
    ctx: TaskContext,
}

/// A component without a thread.
///
/// Commands on its provided interfaces run in the calling thread, and its hooks run inline:
/// `create` calls `configure` and `startup`, `kill` calls `cleanup`, and `run_once` calls `run`.
pub struct Device {
    core: Arc<ComponentCore>,
    control: TaskControl,
    metrics: Arc<Mutex<TaskMetrics>>,
    reader: StateTableReader,
    inner: Mutex<DeviceInner>,
    params: Mutex<ComponentParams>,
}

impl Device {
    pub fn new(name: &str) -> KestrelResult<Self> {
        Self::with_state_table_size(name, DEFAULT_STATE_TABLE_SIZE)
    }

    pub fn with_state_table_size(name: &str, rows: usize) -> KestrelResult<Self> {
        if name.is_empty() {
            return Err(KestrelError::config("device name must not be empty"));
        }
        let core = ComponentCore::new(name, None);
        let time = TimeServer::new();
        let state_table = StateTable::with_time_server(name, rows, time)?;
        let metrics = Arc::new(Mutex::new(TaskMetrics::default()));
        let reader = state_table.reader();
        let ctx = TaskContext::new(core.clone(), state_table, metrics.clone(), None, time);

        Ok(Self {
            control: TaskControl::new(name, None),
            core,
            metrics,
            reader,
            inner: Mutex::new(DeviceInner {
                component: None,
                ctx,
            }),
            params: Mutex::new(ComponentParams::new()),
        })
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn component_core(&self) -> &Arc<ComponentCore> {
        &self.core
    }

    pub fn state(&self) -> ComponentState {
        self.control.state()
    }

    pub fn metrics(&self) -> TaskMetrics {
        self.metrics.lock().clone()
    }

    pub fn add_interface_provided(&self, name: &str) -> KestrelResult<Arc<ProvidedInterface>> {
        self.core.add_interface_provided(name)
    }

    pub fn add_interface_required(
        &self,
        name: &str,
        requirement: Requirement,
    ) -> KestrelResult<Arc<RequiredInterface>> {
        self.core.add_interface_required(name, requirement)
    }

    pub fn set_component<C: Component>(&self, component: C) -> KestrelResult<()> {
        let state = self.state();
        if state != ComponentState::Constructed {
            return Err(KestrelError::lifecycle(self.name(), "set component", state));
        }
        self.inner.lock().component = Some(Box::new(component));
        Ok(())
    }

    pub fn with_state_table<R>(&self, f: impl FnOnce(&mut StateTable) -> R) -> R {
        f(self.inner.lock().ctx.state_table_mut())
    }

    pub fn new_element<T: StateValue>(&self, name: &str, initial: T) -> KestrelResult<StateElement<T>> {
        self.with_state_table(|table| table.new_element(name, initial))
            .map_err(KestrelError::from)
    }

    pub fn state_table(&self) -> StateTableReader {
        self.reader.clone()
    }

    pub fn set_params(&self, params: ComponentParams) {
        *self.params.lock() = params;
    }

    /// Run `configure` and `startup` inline. The device is READY on success.
    pub fn create(&self) -> KestrelResult<()> {
        {
            let mut state = self.control.lock();
            if *state != ComponentState::Constructed {
                return Err(KestrelError::lifecycle(self.name(), "create", *state));
            }
            self.control.set_locked(&mut state, ComponentState::Initializing);
        }

        let params = self.params.lock().clone();
        let mut inner = self.inner.lock();
        let DeviceInner { component, ctx } = &mut *inner;

        if let Some(component) = component.as_mut() {
            let configured = catch_unwind(AssertUnwindSafe(|| component.configure(ctx, &params)));
            let failure = match configured {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(payload) => Some(panic_message(payload.as_ref())),
            };
            if let Some(reason) = failure {
                log::error!("Device '{}': configure failed: {}", self.name(), reason);
                self.control.set(ComponentState::Finished);
                return Err(KestrelError::config(format!(
                    "device '{}' configure failed: {}",
                    self.name(),
                    reason
                )));
            }
        }

        let missing = self.core.unconnected_mandatory();
        if !missing.is_empty() {
            log::error!(
                "Device '{}' cannot be started: required interface(s) not connected: {}",
                self.name(),
                missing.join(", ")
            );
            self.control.set(ComponentState::Finished);
            return Err(KestrelError::config(format!(
                "device '{}' has unconnected required interface(s): {}",
                self.name(),
                missing.join(", ")
            )));
        }

        if let Some(component) = component.as_mut() {
            match catch_unwind(AssertUnwindSafe(|| component.startup(ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("Device '{}': startup failed: {}", self.name(), e),
                Err(payload) => log::error!(
                    "Device '{}': startup panicked: {}",
                    self.name(),
                    panic_message(payload.as_ref())
                ),
            }
        }

        let table = ctx.state_table_mut();
        if table.automatic_advance() {
            table.advance();
        }
        self.control
            .transition(ComponentState::Initializing, ComponentState::Ready);
        Ok(())
    }

    pub fn start(&self) -> KestrelResult<()> {
        let mut state = self.control.lock();
        match *state {
            ComponentState::Ready => {
                self.control.set_locked(&mut state, ComponentState::Active);
                Ok(())
            }
            ComponentState::Active => Ok(()),
            other => Err(KestrelError::lifecycle(self.name(), "start", other)),
        }
    }

    pub fn suspend(&self) -> KestrelResult<()> {
        let mut state = self.control.lock();
        match *state {
            ComponentState::Active => {
                self.control.set_locked(&mut state, ComponentState::Ready);
                Ok(())
            }
            ComponentState::Ready => Ok(()),
            other => Err(KestrelError::lifecycle(self.name(), "suspend", other)),
        }
    }

    /// Call the component's `run` hook once in the caller's thread. Only valid while ACTIVE.
    pub fn run_once(&self) -> KestrelResult<()> {
        let state = self.state();
        if state != ComponentState::Active {
            return Err(KestrelError::lifecycle(self.name(), "run", state));
        }

        let mut inner = self.inner.lock();
        let DeviceInner { component, ctx } = &mut *inner;
        ctx.begin_cycle();
        let automatic = ctx.state_table().automatic_advance();
        if automatic {
            ctx.state_table_mut().start();
        }

        let mut failed = false;
        if let Some(component) = component.as_mut() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| component.run(ctx))) {
                log::error!(
                    "Device '{}': run panicked: {}",
                    self.name(),
                    panic_message(payload.as_ref())
                );
                failed = true;
            }
        }

        if automatic {
            ctx.state_table_mut().advance();
        }
        let elapsed = ctx.elapsed_in_cycle();
        ctx.with_metrics(|m| {
            m.runs += 1;
            if failed {
                m.run_failures += 1;
            }
            m.record_cycle(elapsed);
        });
        Ok(())
    }

    /// Run `cleanup` inline and finish. Idempotent.
    pub fn kill(&self) -> KestrelResult<()> {
        {
            let mut state = self.control.lock();
            match *state {
                ComponentState::Constructed => {
                    self.control.set_locked(&mut state, ComponentState::Finished);
                    return Ok(());
                }
                ComponentState::Finishing | ComponentState::Finished => return Ok(()),
                _ => self.control.set_locked(&mut state, ComponentState::Finishing),
            }
        }

        let mut inner = self.inner.lock();
        let DeviceInner { component, ctx } = &mut *inner;
        if let Some(component) = component.as_mut() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| component.cleanup(ctx))) {
                log::error!(
                    "Device '{}': cleanup panicked: {}",
                    self.name(),
                    panic_message(payload.as_ref())
                );
            }
        }
        self.control.set(ComponentState::Finished);
        Ok(())
    }

    pub fn wait_for_state(&self, state: ComponentState, timeout: Option<Duration>) -> bool {
        self.control.wait_for_state(state, timeout)
    }
}

impl Lifecycle for Device {
    fn name(&self) -> &str {
        Device::name(self)
    }

    fn component_core(&self) -> &Arc<ComponentCore> {
        &self.core
    }

    fn state(&self) -> ComponentState {
        Device::state(self)
    }

    fn set_params(&self, params: ComponentParams) {
        Device::set_params(self, params)
    }

    fn create(&self) -> KestrelResult<()> {
        Device::create(self)
    }

    fn start(&self) -> KestrelResult<()> {
        Device::start(self)
    }

    fn suspend(&self) -> KestrelResult<()> {
        Device::suspend(self)
    }

    fn kill(&self) -> KestrelResult<()> {
        Device::kill(self)
    }

    fn wait_for_state(&self, state: ComponentState, timeout: Option<Duration>) -> bool {
        Device::wait_for_state(self, state, timeout)
    }

    fn initialization_timeout(&self) -> Duration {
        Duration::from_millis(DEFAULT_INITIALIZATION_TIMEOUT_MS)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Sampler {
        value: Option<StateElement<u32>>,
        cleaned: Arc<AtomicU32>,
    }

    impl Component for Sampler {
        fn configure(&mut self, ctx: &mut TaskContext, params: &ComponentParams) -> KestrelResult<()> {
            let start = params.get_or("start", 0u32);
            self.value = Some(ctx.state_table_mut().new_element("value", start)?);
            Ok(())
        }

        fn run(&mut self, _ctx: &mut TaskContext) {
            if let Some(value) = &self.value {
                value.modify(|v| *v += 1);
            }
        }

        fn cleanup(&mut self, _ctx: &mut TaskContext) {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_inline_lifecycle() {
        let device = Device::new("sampler").unwrap();
        let cleaned = Arc::new(AtomicU32::new(0));
        device
            .set_component(Sampler {
                value: None,
                cleaned: cleaned.clone(),
            })
            .unwrap();
        device.set_params(ComponentParams::new().with("start", 10u32).unwrap());

        assert!(device.run_once().is_err());
        device.create().unwrap();
        assert_eq!(device.state(), ComponentState::Ready);
        device.start().unwrap();

        device.run_once().unwrap();
        device.run_once().unwrap();
        let value = device.state_table().accessor::<u32>("value").unwrap();
        assert_eq!(value.get_latest().unwrap(), 12);
        assert_eq!(device.metrics().runs, 2);

        device.kill().unwrap();
        device.kill().unwrap();
        assert_eq!(device.state(), ComponentState::Finished);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_commands_run_in_caller_thread() {
        let device = Device::new("inline").unwrap();
        let prov = device.add_interface_provided("Prov").unwrap();
        prov.add_command_void_return("Thread", || format!("{:?}", std::thread::current().id()))
            .unwrap();
        device.set_component(crate::core::Passive).unwrap();

        let client = ComponentCore::new("client", None);
        let req = client
            .add_interface_required("Req", Requirement::Mandatory)
            .unwrap();
        let which = req
            .add_function_void_return::<String>("Thread", Requirement::Mandatory)
            .unwrap();
        req.connect_to(&prov).unwrap();
        assert!(!which.is_queued());

        device.create().unwrap();
        assert_eq!(
            which.call().unwrap(),
            format!("{:?}", std::thread::current().id())
        );
    }

    #[test]
    fn test_missing_mandatory_interface() {
        let device = Device::new("needy").unwrap();
        device
            .add_interface_required("Needed", Requirement::Mandatory)
            .unwrap();
        device
            .add_interface_required("Maybe", Requirement::Optional)
            .unwrap();
        let err = device.create().unwrap_err();
        assert!(err.to_string().contains("Needed"));
        assert!(!err.to_string().contains("Maybe"));
        assert_eq!(device.state(), ComponentState::Finished);
    }
}
