use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// Types that can be stored in a state table column
pub trait StateValue: Clone + Debug + Send + Sync + 'static {}

impl<T> StateValue for T where T: Clone + Debug + Send + Sync + 'static {}

/// Type-erased view of a column used by the table for commits and dumps
pub(crate) trait Column: Send + Sync {
    fn name(&self) -> &str;
    /// Copy the working value into `slot`
    fn commit(&self, slot: usize);
    fn format_slot(&self, slot: usize) -> String;
}

/// One column: the writer's working value plus one value per ring slot
pub(crate) struct StateArray<T> {
    name: String,
    current: Mutex<T>,
    slots: Box<[RwLock<T>]>,
}

impl<T: StateValue> StateArray<T> {
    pub(crate) fn new(name: &str, initial: T, slots: usize) -> Self {
        Self {
            name: name.to_string(),
            slots: (0..slots).map(|_| RwLock::new(initial.clone())).collect(),
            current: Mutex::new(initial),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_current(&self, value: T) {
        *self.current.lock() = value;
    }

    pub(crate) fn current(&self) -> T {
        self.current.lock().clone()
    }

    pub(crate) fn modify_current<F: FnOnce(&mut T)>(&self, f: F) {
        f(&mut self.current.lock());
    }

    pub(crate) fn read_slot(&self, slot: usize) -> T {
        self.slots[slot].read().clone()
    }
}

impl<T: StateValue> Column for StateArray<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn commit(&self, slot: usize) {
        let value = self.current.lock().clone();
        *self.slots[slot].write() = value;
    }

    fn format_slot(&self, slot: usize) -> String {
        format!("{:?}", *self.slots[slot].read())
    }
}

/// A registered column, kept both as a [`Column`] and as `Any` for typed lookup
#[derive(Clone)]
pub(crate) struct ColumnEntry {
    pub(crate) column: Arc<dyn Column>,
    pub(crate) any: Arc<dyn Any + Send + Sync>,
}

impl ColumnEntry {
    pub(crate) fn new<T: StateValue>(array: Arc<StateArray<T>>) -> Self {
        Self {
            column: array.clone(),
            any: array,
        }
    }

    pub(crate) fn downcast<T: StateValue>(&self) -> Option<Arc<StateArray<T>>> {
        self.any.clone().downcast::<StateArray<T>>().ok()
    }
}
