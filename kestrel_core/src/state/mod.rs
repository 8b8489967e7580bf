//! Historied state tables
//!
//! A state table is a ring of time-indexed rows. Each column is registered with
//! [`StateTable::new_element`] before the table goes into service; the owning component updates the
//! working values and calls [`StateTable::advance`] once per cycle to publish them as a new row.
//! Any number of threads read published rows through [`Accessor`]s without blocking the writer.

mod accessor;
mod column;
mod stats;
mod table;

pub use accessor::{Accessor, StateElement};
pub use column::StateValue;
pub use stats::PeriodStatistics;
pub use table::{
    StateTable, StateTableReader, MIN_HISTORY, PERIOD_ELEMENT, TIC_ELEMENT, TOC_ELEMENT,
};

use std::fmt;

/// Position of a row in a state table: the ring slot and the generation written there
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateIndex {
    index: usize,
    ticks: u64,
    slots: usize,
}

impl StateIndex {
    pub(crate) fn new(index: usize, ticks: u64, slots: usize) -> Self {
        Self {
            index,
            ticks,
            slots,
        }
    }

    /// Ring slot
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of advances that preceded this row
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Index of the row published `rows` advances earlier, if there was one
    pub fn back(&self, rows: u64) -> Option<StateIndex> {
        let ticks = self.ticks.checked_sub(rows)?;
        let offset = (rows % self.slots as u64) as usize;
        Some(Self::new(
            (self.index + self.slots - offset) % self.slots,
            ticks,
            self.slots,
        ))
    }
}

impl fmt::Display for StateIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.index, self.ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StateTableError;

    #[test]
    fn test_oldest_row_overwritten_after_capacity_plus_one() {
        const N: usize = 5;
        let mut table = StateTable::new("ring", N).unwrap();
        let x = table.new_element("x", 0u64).unwrap();
        let accessor = x.accessor();

        let mut indices = Vec::new();
        for value in 1..=(N as u64 + 1) {
            x.set(value);
            table.advance();
            indices.push(table.index_reader().unwrap());
        }

        assert!(matches!(
            accessor.get(&indices[0]),
            Err(StateTableError::Overwritten { .. })
        ));
        for (offset, index) in indices.iter().enumerate().skip(1) {
            assert_eq!(accessor.get(index).unwrap(), offset as u64 + 1);
        }
    }

    #[test]
    fn test_index_back_wraps() {
        let index = StateIndex::new(1, 10, 4);
        assert_eq!(index.back(2), Some(StateIndex::new(3, 8, 4)));
        assert_eq!(index.back(11), None);
        assert_eq!(index.to_string(), "1@10");
    }
}
