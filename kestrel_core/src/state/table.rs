use super::accessor::{Accessor, StateElement};
use super::column::{ColumnEntry, StateArray, StateValue};
use super::stats::PeriodStatistics;
use super::StateIndex;
use crate::clock::TimeServer;
use crate::error::{KestrelError, KestrelResult, StateTableError};
use parking_lot::{Mutex, RwLock};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Ticks value of a slot that has never been written
pub(crate) const INVALID_TICKS: u64 = u64::MAX;

/// Smallest history length accepted by [`StateTable::new`]
pub const MIN_HISTORY: usize = 2;

pub const TIC_ELEMENT: &str = "Tic";
pub const TOC_ELEMENT: &str = "Toc";
pub const PERIOD_ELEMENT: &str = "Period";

/// Ring shared by the writer handle, readers and accessors.
///
/// The ring has `capacity + 1` slots. The slot at `writer` is the one the next `advance` fills and
/// is never readable; the other `capacity` slots hold published history. `ticks[slot]` is the
/// generation of the data in that slot and is bumped before a slot is reused, so an index taken
/// earlier fails validation once its row is overwritten.
pub(crate) struct TableCore {
    name: String,
    slots: usize,
    ticks: Box<[AtomicU64]>,
    writer: AtomicUsize,
    reader: AtomicUsize,
    delayed: AtomicUsize,
    delay: AtomicUsize,
    published: AtomicBool,
    in_service: AtomicBool,
    automatic_advance: AtomicBool,
    columns: RwLock<Vec<ColumnEntry>>,
    stats: Mutex<PeriodStatistics>,
    time: TimeServer,
}

impl TableCore {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn slots(&self) -> usize {
        self.slots
    }

    /// Readable rows
    pub(crate) fn capacity(&self) -> usize {
        self.slots - 1
    }

    fn ticks_at(&self, slot: usize) -> u64 {
        self.ticks[slot].load(Ordering::Acquire)
    }

    /// Check that `index` still designates the row it was taken for.
    /// Called after the value has been read.
    pub(crate) fn validate(&self, index: &StateIndex) -> Result<(), StateTableError> {
        if index.index() >= self.slots || self.ticks_at(index.index()) != index.ticks() {
            return Err(StateTableError::Overwritten {
                table: self.name.clone(),
                index: index.index(),
                ticks: index.ticks(),
            });
        }
        Ok(())
    }

    /// Pair the slot held by `cursor` with that slot's generation.
    ///
    /// The cursor is read again after the ticks. A slot is re-armed only while the cursor points
    /// elsewhere, so an unchanged cursor means the ticks belong to the row it designates.
    fn snapshot(&self, cursor: &AtomicUsize) -> StateIndex {
        let mut slot = cursor.load(Ordering::Acquire);
        loop {
            let ticks = self.ticks_at(slot);
            let again = cursor.load(Ordering::Acquire);
            if again == slot {
                return StateIndex::new(slot, ticks, self.slots);
            }
            slot = again;
        }
    }

    pub(crate) fn index_reader(&self) -> Result<StateIndex, StateTableError> {
        if !self.published.load(Ordering::Acquire) {
            return Err(StateTableError::NoData(self.name.clone()));
        }
        Ok(self.snapshot(&self.reader))
    }

    pub(crate) fn index_delayed(&self) -> Result<StateIndex, StateTableError> {
        if !self.published.load(Ordering::Acquire) {
            return Err(StateTableError::NoData(self.name.clone()));
        }
        let index = self.snapshot(&self.delayed);
        if index.ticks() == INVALID_TICKS {
            // Fewer rows than the delay have been published so far
            return Err(StateTableError::NoData(self.name.clone()));
        }
        Ok(index)
    }

    pub(crate) fn index_writer(&self) -> StateIndex {
        self.snapshot(&self.writer)
    }

    /// Index of the row `rows_back` advances before the latest one
    pub(crate) fn index_ago(&self, rows_back: usize) -> Result<StateIndex, StateTableError> {
        if rows_back >= self.capacity() {
            return Err(StateTableError::HistoryTooLong {
                table: self.name.clone(),
                requested: rows_back + 1,
                capacity: self.capacity(),
            });
        }
        self.index_reader()?
            .back(rows_back as u64)
            .ok_or_else(|| StateTableError::NoData(self.name.clone()))
    }

    /// Readable rows from oldest to newest
    pub(crate) fn readable_indices(&self) -> Vec<StateIndex> {
        let newest = match self.index_reader() {
            Ok(index) => index,
            Err(_) => return Vec::new(),
        };
        (0..self.capacity() as u64)
            .rev()
            .filter_map(|back| newest.back(back))
            .filter(|index| self.ticks_at(index.index()) == index.ticks())
            .collect()
    }

    fn find_column(&self, name: &str) -> Option<ColumnEntry> {
        self.columns
            .read()
            .iter()
            .find(|entry| entry.column.name() == name)
            .cloned()
    }

    pub(crate) fn accessor<T: StateValue>(
        self: &Arc<Self>,
        name: &str,
    ) -> Result<Accessor<T>, StateTableError> {
        let entry = self
            .find_column(name)
            .ok_or_else(|| StateTableError::UnknownElement {
                table: self.name.clone(),
                element: name.to_string(),
            })?;
        let array = entry
            .downcast::<T>()
            .ok_or_else(|| StateTableError::TypeMismatch {
                table: self.name.clone(),
                element: name.to_string(),
                requested: std::any::type_name::<T>(),
            })?;
        Ok(Accessor::new(array, self.clone()))
    }

    fn element_names(&self) -> Vec<String> {
        self.columns
            .read()
            .iter()
            .map(|entry| entry.column.name().to_string())
            .collect()
    }
}

/// Writer handle of a state table.
///
/// Only one `StateTable` exists per table; it is owned by the component's thread. Readers obtain
/// a [`StateTableReader`] or typed [`Accessor`]s, which can be shared freely.
pub struct StateTable {
    core: Arc<TableCore>,
    tic: StateElement<f64>,
    toc: StateElement<f64>,
    period: StateElement<f64>,
    last_toc: Option<f64>,
}

impl StateTable {
    /// Create a table holding `capacity` rows of history
    pub fn new(name: &str, capacity: usize) -> KestrelResult<Self> {
        Self::with_time_server(name, capacity, TimeServer::new())
    }

    pub fn with_time_server(name: &str, capacity: usize, time: TimeServer) -> KestrelResult<Self> {
        if capacity < MIN_HISTORY {
            return Err(KestrelError::invalid_input(format!(
                "state table '{}' needs at least {} rows of history, got {}",
                name, MIN_HISTORY, capacity
            )));
        }

        let slots = capacity + 1;
        let ticks: Box<[AtomicU64]> = (0..slots)
            .map(|slot| AtomicU64::new(if slot == 0 { 0 } else { INVALID_TICKS }))
            .collect();

        let core = Arc::new(TableCore {
            name: name.to_string(),
            slots,
            ticks,
            writer: AtomicUsize::new(0),
            reader: AtomicUsize::new(0),
            delayed: AtomicUsize::new(0),
            delay: AtomicUsize::new(0),
            published: AtomicBool::new(false),
            in_service: AtomicBool::new(false),
            automatic_advance: AtomicBool::new(true),
            columns: RwLock::new(Vec::new()),
            stats: Mutex::new(PeriodStatistics::default()),
            time,
        });

        let tic = register(&core, TIC_ELEMENT, 0.0)?;
        let toc = register(&core, TOC_ELEMENT, 0.0)?;
        let period = register(&core, PERIOD_ELEMENT, 0.0)?;

        Ok(Self {
            core,
            tic,
            toc,
            period,
            last_toc: None,
        })
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Rows of history a reader can access
    pub fn capacity(&self) -> usize {
        self.core.capacity()
    }

    /// Register a column. Only legal before the first `start`/`advance`.
    pub fn new_element<T: StateValue>(
        &mut self,
        name: &str,
        initial: T,
    ) -> Result<StateElement<T>, StateTableError> {
        if self.is_in_service() {
            return Err(StateTableError::Sealed {
                table: self.core.name.clone(),
                element: name.to_string(),
            });
        }
        register(&self.core, name, initial)
    }

    pub fn is_in_service(&self) -> bool {
        self.core.in_service.load(Ordering::Acquire)
    }

    pub fn automatic_advance(&self) -> bool {
        self.core.automatic_advance.load(Ordering::Acquire)
    }

    /// When disabled, the owning task does not call `start`/`advance`; the component does
    pub fn set_automatic_advance(&mut self, automatic: bool) {
        self.core
            .automatic_advance
            .store(automatic, Ordering::Release);
    }

    pub fn delay(&self) -> usize {
        self.core.delay.load(Ordering::Acquire)
    }

    /// Expose a read view lagging `delay` rows behind the latest one
    pub fn set_delay(&mut self, delay: usize) -> Result<(), StateTableError> {
        if delay >= self.capacity() {
            return Err(StateTableError::InvalidDelay {
                table: self.core.name.clone(),
                delay,
                capacity: self.capacity(),
            });
        }
        self.core.delay.store(delay, Ordering::Release);
        self.update_delayed();
        Ok(())
    }

    /// Mark the beginning of a cycle
    pub fn start(&mut self) {
        self.core.in_service.store(true, Ordering::Release);
        self.tic.set(self.core.time.relative_time());
    }

    /// Publish the working values of every column as a new row
    pub fn advance(&mut self) {
        let core = &self.core;
        core.in_service.store(true, Ordering::Release);

        let toc = core.time.relative_time();
        let tic = self.tic.get();
        let period = self.last_toc.map(|last| toc - last);
        self.toc.set(toc);
        self.period.set(period.unwrap_or(0.0));
        self.last_toc = Some(toc);

        let slot = core.writer.load(Ordering::Relaxed);
        for entry in core.columns.read().iter() {
            entry.column.commit(slot);
        }

        let ticks = core.ticks[slot].load(Ordering::Relaxed);
        core.reader.store(slot, Ordering::Release);
        core.published.store(true, Ordering::Release);
        // Move the delayed cursor before re-arming: at the largest delay it sits on `next`
        self.update_delayed();

        let next = (slot + 1) % core.slots;
        core.ticks[next].store(ticks + 1, Ordering::Release);
        core.writer.store(next, Ordering::Release);

        core.stats.lock().update(period, (toc - tic).max(0.0));
    }

    fn update_delayed(&self) {
        let core = &self.core;
        let reader = core.reader.load(Ordering::Acquire);
        let delay = core.delay.load(Ordering::Acquire);
        core.delayed
            .store((reader + core.slots - delay) % core.slots, Ordering::Release);
    }

    pub fn reader(&self) -> StateTableReader {
        StateTableReader {
            core: self.core.clone(),
        }
    }

    pub fn index_writer(&self) -> StateIndex {
        self.core.index_writer()
    }

    pub fn index_reader(&self) -> Result<StateIndex, StateTableError> {
        self.core.index_reader()
    }

    pub fn tic(&self) -> f64 {
        self.tic.get()
    }

    pub fn accessor<T: StateValue>(&self, name: &str) -> Result<Accessor<T>, StateTableError> {
        self.core.accessor(name)
    }
}

impl std::fmt::Debug for StateTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTable")
            .field("name", &self.core.name)
            .field("capacity", &self.capacity())
            .field("elements", &self.core.element_names())
            .field("writer", &self.index_writer())
            .finish()
    }
}

fn register<T: StateValue>(
    core: &Arc<TableCore>,
    name: &str,
    initial: T,
) -> Result<StateElement<T>, StateTableError> {
    let mut columns = core.columns.write();
    if columns.iter().any(|entry| entry.column.name() == name) {
        return Err(StateTableError::DuplicateElement {
            table: core.name.clone(),
            element: name.to_string(),
        });
    }
    let array = Arc::new(StateArray::new(name, initial, core.slots));
    columns.push(ColumnEntry::new(array.clone()));
    log::trace!("State table '{}': added element '{}'", core.name, name);
    Ok(StateElement::new(array, core.clone()))
}

/// Shareable read-only view of a state table
#[derive(Clone)]
pub struct StateTableReader {
    core: Arc<TableCore>,
}

impl StateTableReader {
    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn capacity(&self) -> usize {
        self.core.capacity()
    }

    pub fn index_reader(&self) -> Result<StateIndex, StateTableError> {
        self.core.index_reader()
    }

    pub fn index_delayed(&self) -> Result<StateIndex, StateTableError> {
        self.core.index_delayed()
    }

    pub fn index_writer(&self) -> StateIndex {
        self.core.index_writer()
    }

    /// True if the row designated by `index` has not been overwritten
    pub fn is_valid(&self, index: &StateIndex) -> bool {
        self.core.validate(index).is_ok()
    }

    /// Typed accessor for a column, looked up by name
    pub fn accessor<T: StateValue>(&self, name: &str) -> Result<Accessor<T>, StateTableError> {
        self.core.accessor(name)
    }

    pub fn element_names(&self) -> Vec<String> {
        self.core.element_names()
    }

    pub fn period_statistics(&self) -> PeriodStatistics {
        *self.core.stats.lock()
    }

    /// Mean interval between the readable rows, in seconds (0 with fewer than two rows)
    pub fn average_period(&self) -> f64 {
        let rows = self.core.readable_indices();
        if rows.len() < 2 {
            return 0.0;
        }
        let toc = match self.core.accessor::<f64>(TOC_ELEMENT) {
            Ok(accessor) => accessor,
            Err(_) => return 0.0,
        };
        match (toc.get(&rows[0]), toc.get(&rows[rows.len() - 1])) {
            (Ok(oldest), Ok(newest)) => (newest - oldest) / (rows.len() - 1) as f64,
            _ => 0.0,
        }
    }

    /// Dump readable rows as CSV, oldest first. `non_zero_only` skips the row with ticks 0.
    pub fn write_csv<W: Write>(&self, out: &mut W, non_zero_only: bool) -> KestrelResult<()> {
        let columns: Vec<ColumnEntry> = self.core.columns.read().clone();

        let mut header = vec!["index".to_string(), "ticks".to_string()];
        header.extend(columns.iter().map(|entry| entry.column.name().to_string()));
        writeln!(out, "{}", header.join(","))?;

        for index in self.core.readable_indices() {
            if non_zero_only && index.ticks() == 0 {
                continue;
            }
            let mut fields = vec![index.index().to_string(), index.ticks().to_string()];
            fields.extend(
                columns
                    .iter()
                    .map(|entry| csv_field(&entry.column.format_slot(index.index()))),
            );
            if self.core.validate(&index).is_err() {
                continue;
            }
            writeln!(out, "{}", fields.join(","))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for StateTableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTableReader")
            .field("name", &self.core.name)
            .field("capacity", &self.capacity())
            .finish()
    }
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_short_history() {
        assert!(StateTable::new("tiny", 1).is_err());
        assert!(StateTable::new("ok", MIN_HISTORY).is_ok());
    }

    #[test]
    fn test_builtin_columns() {
        let table = StateTable::new("builtin", 4).unwrap();
        let names = table.reader().element_names();
        assert_eq!(names, vec!["Tic", "Toc", "Period"]);
    }

    #[test]
    fn test_sealed_after_first_advance() {
        let mut table = StateTable::new("sealed", 4).unwrap();
        let _x = table.new_element("x", 0i32).unwrap();
        assert!(matches!(
            table.new_element("x", 1i32),
            Err(StateTableError::DuplicateElement { .. })
        ));

        table.advance();
        assert!(matches!(
            table.new_element("y", 0u8),
            Err(StateTableError::Sealed { .. })
        ));
    }

    #[test]
    fn test_no_data_before_advance() {
        let mut table = StateTable::new("empty", 3).unwrap();
        let x = table.new_element("x", 7i32).unwrap();
        assert!(matches!(
            x.accessor().get_latest(),
            Err(StateTableError::NoData(_))
        ));
        table.advance();
        assert_eq!(x.accessor().get_latest().unwrap(), 7);
    }

    #[test]
    fn test_delay_bounds_and_view() {
        let mut table = StateTable::new("delayed", 4).unwrap();
        let x = table.new_element("x", 0u32).unwrap();
        assert!(matches!(
            table.set_delay(4),
            Err(StateTableError::InvalidDelay { .. })
        ));
        table.set_delay(2).unwrap();

        let accessor = x.accessor();
        for value in 1..=5u32 {
            x.set(value);
            table.advance();
        }
        assert_eq!(accessor.get_latest().unwrap(), 5);
        assert_eq!(accessor.get_delayed().unwrap(), 3);
    }

    #[test]
    fn test_accessor_lookup_by_name() {
        let mut table = StateTable::new("lookup", 3).unwrap();
        let _pos = table.new_element("position", [0.0f64; 3]).unwrap();
        let reader = table.reader();

        assert!(reader.accessor::<[f64; 3]>("position").is_ok());
        assert!(matches!(
            reader.accessor::<f32>("position"),
            Err(StateTableError::TypeMismatch { .. })
        ));
        assert!(matches!(
            reader.accessor::<f32>("velocity"),
            Err(StateTableError::UnknownElement { .. })
        ));
    }

    #[test]
    fn test_csv_dump() {
        let mut table = StateTable::new("csv", 3).unwrap();
        let x = table.new_element("x", 0i32).unwrap();
        for value in [10, 20] {
            x.set(value);
            table.start();
            table.advance();
        }

        let mut out = Vec::new();
        table.reader().write_csv(&mut out, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "index,ticks,Tic,Toc,Period,x");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with(",10"));
        assert!(lines[2].ends_with(",20"));

        let mut out = Vec::new();
        table.reader().write_csv(&mut out, true).unwrap();
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_period_statistics_and_average() {
        let mut table = StateTable::new("stats", 8).unwrap();
        for _ in 0..4 {
            table.start();
            std::thread::sleep(std::time::Duration::from_millis(2));
            table.advance();
        }
        let reader = table.reader();
        let stats = reader.period_statistics();
        assert_eq!(stats.samples, 4);
        assert!(stats.period_min > 0.0);
        assert!(stats.compute_min >= 0.002);
        assert!(reader.average_period() >= 0.002);
    }
}
