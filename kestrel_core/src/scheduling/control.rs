use crate::core::ComponentState;
use crate::mailbox::ThreadSignal;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle state shared between a component's handle and its thread.
///
/// Every change notifies waiters and raises the wake signal, so a thread blocked in its
/// end-of-cycle wait observes `kill` promptly.
#[derive(Debug)]
pub struct TaskControl {
    name: String,
    state: Mutex<ComponentState>,
    changed: Condvar,
    wake: Option<Arc<ThreadSignal>>,
}

impl TaskControl {
    pub(crate) fn new(name: &str, wake: Option<Arc<ThreadSignal>>) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(ComponentState::Constructed),
            changed: Condvar::new(),
            wake,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ComponentState {
        *self.state.lock()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ComponentState> {
        self.state.lock()
    }

    /// Change state under an already-held lock
    pub(crate) fn set_locked(&self, guard: &mut MutexGuard<'_, ComponentState>, next: ComponentState) {
        let previous = **guard;
        if previous == next {
            return;
        }
        **guard = next;
        log::debug!("Component '{}': {} -> {}", self.name, previous, next);
        self.changed.notify_all();
        if let Some(wake) = &self.wake {
            wake.raise();
        }
    }

    pub(crate) fn set(&self, next: ComponentState) {
        let mut guard = self.state.lock();
        self.set_locked(&mut guard, next);
    }

    /// Change state only if the current state is `from`
    pub(crate) fn transition(&self, from: ComponentState, to: ComponentState) -> bool {
        let mut guard = self.state.lock();
        if *guard != from {
            return false;
        }
        self.set_locked(&mut guard, to);
        true
    }

    /// Wait until `target` is reached. ACTIVE counts as having reached READY.
    /// Returns false on timeout, or if the component finished without reaching `target`.
    pub fn wait_for_state(&self, target: ComponentState, timeout: Option<Duration>) -> bool {
        let reached = |state: ComponentState| {
            state == target || (target == ComponentState::Ready && state == ComponentState::Active)
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.state.lock();
        loop {
            if reached(*guard) {
                return true;
            }
            if guard.is_terminal() {
                return false;
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut guard, deadline).timed_out() {
                        return reached(*guard);
                    }
                }
                None => self.changed.wait(&mut guard),
            }
        }
    }

    /// Sleep until `deadline` unless the state leaves READY/ACTIVE first.
    /// Returns the state observed on wake-up.
    pub(crate) fn sleep_until(&self, deadline: Instant) -> ComponentState {
        let mut guard = self.state.lock();
        while guard.is_running() {
            if self.changed.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_transition_is_conditional() {
        let control = TaskControl::new("t", None);
        assert!(!control.transition(ComponentState::Initializing, ComponentState::Ready));
        control.set(ComponentState::Initializing);
        assert!(control.transition(ComponentState::Initializing, ComponentState::Ready));
        assert_eq!(control.state(), ComponentState::Ready);
    }

    #[test]
    fn test_wait_for_state_across_threads() {
        let control = Arc::new(TaskControl::new("t", None));
        let setter = control.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            setter.set(ComponentState::Active);
        });
        assert!(control.wait_for_state(ComponentState::Ready, Some(Duration::from_secs(2))));
        handle.join().unwrap();

        assert!(!control.wait_for_state(ComponentState::Finished, Some(Duration::from_millis(5))));
        control.set(ComponentState::Finished);
        assert!(!control.wait_for_state(ComponentState::Ready, None));
    }

    #[test]
    fn test_sleep_interrupted_by_kill() {
        let control = Arc::new(TaskControl::new("t", None));
        control.set(ComponentState::Ready);
        let killer = control.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            killer.set(ComponentState::Finishing);
        });

        let start = Instant::now();
        let state = control.sleep_until(start + Duration::from_secs(5));
        assert_eq!(state, ComponentState::Finishing);
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }
}
