use super::control::TaskControl;
use super::runner::TaskRunner;
use super::{ContinuousMode, Lifecycle};
use crate::clock::TimeServer;
use crate::command::Requirement;
use crate::config::{ComponentParams, TaskConfig};
use crate::core::{Component, ComponentCore, ComponentState, TaskContext, TaskMetrics};
use crate::error::{panic_message, KestrelError, KestrelResult};
use crate::interface::{ProvidedInterface, RequiredInterface};
use crate::mailbox::MailboxSet;
use crate::state::{StateElement, StateTable, StateTableReader, StateValue};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

struct Pending {
    component: Option<Box<dyn Component>>,
    state_table: StateTable,
}

/// A component with its own thread.
///
/// Interfaces, state table elements and the component are set up while CONSTRUCTED; `create`
/// runs `configure` on the calling thread and spawns the task thread, which runs `startup` and
/// then loops until `kill`.
///
/// ```no_run
/// use kestrel_core::{Component, Task, TaskConfig, TaskContext};
/// use std::time::Duration;
///
/// struct Blink;
/// impl Component for Blink {
///     fn run(&mut self, ctx: &mut TaskContext) {
///         ctx.log_debug("tick");
///     }
/// }
///
/// let task = Task::new(TaskConfig::periodic("blink", Duration::from_millis(10))).unwrap();
/// task.set_component(Blink).unwrap();
/// task.create().unwrap();
/// task.start().unwrap();
/// task.kill().unwrap();
/// task.wait_to_terminate(Some(Duration::from_secs(1)));
/// ```
pub struct Task {
    config: TaskConfig,
    core: Arc<ComponentCore>,
    mailboxes: Arc<MailboxSet>,
    control: Arc<TaskControl>,
    metrics: Arc<Mutex<TaskMetrics>>,
    reader: StateTableReader,
    time: TimeServer,
    pending: Mutex<Option<Pending>>,
    params: Mutex<ComponentParams>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Task {
    pub fn new(config: TaskConfig) -> KestrelResult<Self> {
        config.validate()?;
        let mailboxes = MailboxSet::new(&config.name, config.mailbox_size)?;
        let core = ComponentCore::new(&config.name, Some(mailboxes.clone()));
        let time = TimeServer::new();
        let state_table =
            StateTable::with_time_server(&config.name, config.state_table_size, time)?;
        let control = Arc::new(TaskControl::new(
            &config.name,
            Some(mailboxes.wake_signal().clone()),
        ));

        Ok(Self {
            reader: state_table.reader(),
            pending: Mutex::new(Some(Pending {
                component: None,
                state_table,
            })),
            config,
            core,
            mailboxes,
            control,
            metrics: Arc::new(Mutex::new(TaskMetrics::default())),
            time,
            params: Mutex::new(ComponentParams::new()),
            thread: Mutex::new(None),
        })
    }

    pub fn periodic(name: &str, period: Duration) -> KestrelResult<Self> {
        Self::new(TaskConfig::periodic(name, period))
    }

    pub fn continuous(name: &str, mode: ContinuousMode) -> KestrelResult<Self> {
        Self::new(TaskConfig::continuous(name, mode))
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
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

    /// Commands waiting in this task's mailboxes
    pub fn pending_commands(&self) -> usize {
        self.mailboxes.pending()
    }

    pub fn time_server(&self) -> &TimeServer {
        &self.time
    }

    fn require_constructed(&self, operation: &'static str) -> KestrelResult<()> {
        let state = self.state();
        if state != ComponentState::Constructed {
            return Err(KestrelError::lifecycle(self.name(), operation, state));
        }
        Ok(())
    }

    pub fn add_interface_provided(&self, name: &str) -> KestrelResult<Arc<ProvidedInterface>> {
        self.core.add_interface_provided(name)
    }

    pub fn add_interface_required(
        &self,
        name: &str,
        requirement: Requirement,
    ) -> KestrelResult<Arc<RequiredInterface>> {
        let required = self.core.add_interface_required(name, requirement)?;
        required.set_blocking_timeout(self.config.blocking_timeout());
        Ok(required)
    }

    pub fn set_component<C: Component>(&self, component: C) -> KestrelResult<()> {
        self.require_constructed("set component")?;
        let mut pending = self.pending.lock();
        match pending.as_mut() {
            Some(pending) => {
                pending.component = Some(Box::new(component));
                Ok(())
            }
            None => Err(KestrelError::lifecycle(
                self.name(),
                "set component",
                self.state(),
            )),
        }
    }

    /// Access the state table writer before `create`
    pub fn with_state_table<R>(&self, f: impl FnOnce(&mut StateTable) -> R) -> KestrelResult<R> {
        let mut pending = self.pending.lock();
        match pending.as_mut() {
            Some(pending) => Ok(f(&mut pending.state_table)),
            None => Err(KestrelError::lifecycle(
                self.name(),
                "modify state table",
                self.state(),
            )),
        }
    }

    /// Register a state table element before `create`
    pub fn new_element<T: StateValue>(&self, name: &str, initial: T) -> KestrelResult<StateElement<T>> {
        self.with_state_table(|table| table.new_element(name, initial))?
            .map_err(KestrelError::from)
    }

    pub fn state_table(&self) -> StateTableReader {
        self.reader.clone()
    }

    pub fn set_params(&self, params: ComponentParams) {
        *self.params.lock() = params;
    }

    /// Change the capacity of mailboxes created by later connections
    pub fn set_mailbox_size(&self, capacity: usize) -> KestrelResult<()> {
        self.require_constructed("resize mailboxes")?;
        if capacity == 0 {
            return Err(KestrelError::invalid_input("mailbox capacity must be at least 1"));
        }
        self.mailboxes.set_capacity(capacity);
        Ok(())
    }

    /// Configure the component and spawn the task thread. The task reaches READY asynchronously.
    pub fn create(&self) -> KestrelResult<()> {
        {
            let mut state = self.control.lock();
            if *state != ComponentState::Constructed {
                return Err(KestrelError::lifecycle(self.name(), "create", *state));
            }
            self.control.set_locked(&mut state, ComponentState::Initializing);
        }

        let pending = self.pending.lock().take();
        let Pending {
            component,
            state_table,
        } = match pending {
            Some(pending) => pending,
            None => return Err(KestrelError::internal("task resources already taken")),
        };
        let mut component = match component {
            Some(component) => component,
            None => {
                self.fail_creation();
                return Err(KestrelError::config(format!(
                    "task '{}' has no component",
                    self.name()
                )));
            }
        };

        let mut ctx = TaskContext::new(
            self.core.clone(),
            state_table,
            self.metrics.clone(),
            self.config.period(),
            self.time,
        );

        let params = self.params.lock().clone();
        let configured = catch_unwind(AssertUnwindSafe(|| component.configure(&mut ctx, &params)));
        let failure = match configured {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };
        if let Some(reason) = failure {
            log::error!("Task '{}': configure failed: {}", self.name(), reason);
            self.fail_creation();
            return Err(KestrelError::config(format!(
                "task '{}' configure failed: {}",
                self.name(),
                reason
            )));
        }

        let runner = TaskRunner {
            component,
            ctx,
            control: self.control.clone(),
            mailboxes: self.mailboxes.clone(),
            kind: self.config.kind,
            realtime: self.config.realtime,
        };

        let handle = std::thread::Builder::new()
            .name(self.name().to_string())
            .spawn(move || runner.run())
            .map_err(|e| {
                self.fail_creation();
                KestrelError::ThreadSpawn(self.name().to_string(), e)
            })?;
        *self.thread.lock() = Some(handle);
        log::debug!("Task '{}' created", self.name());
        Ok(())
    }

    fn fail_creation(&self) {
        self.mailboxes.close_all();
        self.control.set(ComponentState::Finished);
    }

    /// READY -> ACTIVE. While INITIALIZING, waits up to the initialization timeout for READY.
    pub fn start(&self) -> KestrelResult<()> {
        if self.state() == ComponentState::Initializing {
            self.control
                .wait_for_state(ComponentState::Ready, Some(self.config.initialization_timeout()));
        }

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

    /// ACTIVE -> READY; mailboxes keep being drained
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

    pub fn resume(&self) -> KestrelResult<()> {
        self.start()
    }

    /// Request termination. Idempotent.
    pub fn kill(&self) -> KestrelResult<()> {
        let mut state = self.control.lock();
        match *state {
            ComponentState::Constructed => {
                self.control.set_locked(&mut state, ComponentState::Finished);
                drop(state);
                self.mailboxes.close_all();
            }
            ComponentState::Initializing | ComponentState::Ready | ComponentState::Active => {
                self.control.set_locked(&mut state, ComponentState::Finishing);
            }
            ComponentState::Finishing | ComponentState::Finished => {}
        }
        Ok(())
    }

    pub fn wait_for_state(&self, state: ComponentState, timeout: Option<Duration>) -> bool {
        self.control.wait_for_state(state, timeout)
    }

    pub fn wait_to_start(&self, timeout: Option<Duration>) -> bool {
        self.wait_for_state(ComponentState::Ready, timeout)
    }

    /// Wait for FINISHED and join the thread
    pub fn wait_to_terminate(&self, timeout: Option<Duration>) -> bool {
        if !self.wait_for_state(ComponentState::Finished, timeout) {
            return false;
        }
        self.join_thread();
        true
    }

    fn join_thread(&self) {
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                log::error!("Task '{}': thread terminated abnormally", self.name());
            }
        }
    }
}

impl Lifecycle for Task {
    fn name(&self) -> &str {
        Task::name(self)
    }

    fn component_core(&self) -> &Arc<ComponentCore> {
        &self.core
    }

    fn state(&self) -> ComponentState {
        Task::state(self)
    }

    fn set_params(&self, params: ComponentParams) {
        Task::set_params(self, params)
    }

    fn create(&self) -> KestrelResult<()> {
        Task::create(self)
    }

    fn start(&self) -> KestrelResult<()> {
        Task::start(self)
    }

    fn suspend(&self) -> KestrelResult<()> {
        Task::suspend(self)
    }

    fn kill(&self) -> KestrelResult<()> {
        Task::kill(self)
    }

    fn wait_for_state(&self, state: ComponentState, timeout: Option<Duration>) -> bool {
        Task::wait_for_state(self, state, timeout)
    }

    fn join(&self, timeout: Option<Duration>) -> bool {
        self.wait_to_terminate(timeout)
    }

    fn initialization_timeout(&self) -> Duration {
        self.config.initialization_timeout()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        let _ = self.kill();
        if self.thread.lock().is_some() {
            if self.wait_for_state(ComponentState::Finished, Some(Duration::from_secs(1))) {
                self.join_thread();
            } else {
                log::warn!("Task '{}' did not finish; detaching its thread", self.name());
            }
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("kind", &self.config.kind)
            .finish()
    }
}
