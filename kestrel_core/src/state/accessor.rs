use super::column::{StateArray, StateValue};
use super::table::TableCore;
use super::StateIndex;
use crate::error::StateTableError;
use std::fmt;
use std::sync::Arc;

/// Writer-side handle to one column.
///
/// `set`/`modify` change the working value; it becomes visible to readers at the next
/// [`StateTable::advance`](super::StateTable::advance). Not `Clone`: the component that owns the
/// table is the only writer.
pub struct StateElement<T: StateValue> {
    array: Arc<StateArray<T>>,
    core: Arc<TableCore>,
}

impl<T: StateValue> StateElement<T> {
    pub(crate) fn new(array: Arc<StateArray<T>>, core: Arc<TableCore>) -> Self {
        Self { array, core }
    }

    pub fn name(&self) -> &str {
        self.array.name()
    }

    pub fn set(&self, value: T) {
        self.array.set_current(value);
    }

    /// Working value (not necessarily published yet)
    pub fn get(&self) -> T {
        self.array.current()
    }

    pub fn modify<F: FnOnce(&mut T)>(&self, f: F) {
        self.array.modify_current(f);
    }

    pub fn accessor(&self) -> Accessor<T> {
        Accessor::new(self.array.clone(), self.core.clone())
    }
}

impl<T: StateValue> fmt::Debug for StateElement<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateElement")
            .field("table", &self.core.name())
            .field("name", &self.name())
            .field("value", &self.get())
            .finish()
    }
}

/// Typed read handle to one column; cheap to clone and safe to use from any thread
pub struct Accessor<T: StateValue> {
    array: Arc<StateArray<T>>,
    core: Arc<TableCore>,
}

impl<T: StateValue> Clone for Accessor<T> {
    fn clone(&self) -> Self {
        Self {
            array: self.array.clone(),
            core: self.core.clone(),
        }
    }
}

impl<T: StateValue> Accessor<T> {
    pub(crate) fn new(array: Arc<StateArray<T>>, core: Arc<TableCore>) -> Self {
        Self { array, core }
    }

    pub fn name(&self) -> &str {
        self.array.name()
    }

    pub fn table_name(&self) -> &str {
        self.core.name()
    }

    /// Value at `index`, or `Overwritten` if that row has been reused since
    pub fn get(&self, index: &StateIndex) -> Result<T, StateTableError> {
        if index.index() >= self.core.slots() {
            return Err(StateTableError::Overwritten {
                table: self.core.name().to_string(),
                index: index.index(),
                ticks: index.ticks(),
            });
        }
        let value = self.array.read_slot(index.index());
        self.core.validate(index)?;
        Ok(value)
    }

    pub fn get_latest(&self) -> Result<T, StateTableError> {
        let index = self.core.index_reader()?;
        self.get(&index)
    }

    pub fn get_delayed(&self) -> Result<T, StateTableError> {
        let index = self.core.index_delayed()?;
        self.get(&index)
    }

    /// Value published `rows_back` advances before the latest one
    pub fn get_ago(&self, rows_back: usize) -> Result<T, StateTableError> {
        let index = self.core.index_ago(rows_back)?;
        self.get(&index)
    }

    /// Fill `out` with consecutive rows, the last element being the row at `end`
    pub fn get_history(&self, end: &StateIndex, out: &mut [T]) -> Result<(), StateTableError> {
        if out.len() > self.core.capacity() {
            return Err(StateTableError::HistoryTooLong {
                table: self.core.name().to_string(),
                requested: out.len(),
                capacity: self.core.capacity(),
            });
        }
        let last = out.len();
        for (position, slot) in out.iter_mut().enumerate() {
            let back = (last - 1 - position) as u64;
            let index = end
                .back(back)
                .ok_or_else(|| StateTableError::NoData(self.core.name().to_string()))?;
            *slot = self.get(&index)?;
        }
        Ok(())
    }
}

impl<T: StateValue> fmt::Debug for Accessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessor")
            .field("table", &self.core.name())
            .field("name", &self.name())
            .finish()
    }
}
