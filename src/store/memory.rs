// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stores that keep everything in memory.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use log::{debug, trace};
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use super::{ParameterStore, ParmId, SampleChunk, SampleInfo, SampleStore, StoreError};
use crate::{
    c64,
    grid::{Grid, Location, Range2},
};

/// The column that samples are read from unless told otherwise.
pub const DEFAULT_COLUMN: &str = "DATA";

/// A parameter and its default coefficients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParmDefinition {
    pub name: String,
    pub values: Vec<f64>,
}

/// The coefficients of one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellValues {
    pub cell: Location,
    pub values: Vec<f64>,
}

/// Everything known about one parameter; used to dump a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParmValues {
    pub name: String,
    pub default: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid: Option<Grid>,
    pub cells: Vec<CellValues>,
}

#[derive(Debug, Clone)]
struct ParmEntry {
    default: Vec<f64>,
    grid: Option<Grid>,
    cells: BTreeMap<Location, Vec<f64>>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryParmStore {
    parms: IndexMap<String, ParmEntry>,
    flushes: usize,
}

impl MemoryParmStore {
    pub fn new() -> MemoryParmStore {
        MemoryParmStore::default()
    }

    pub fn from_definitions(defs: &[ParmDefinition]) -> Result<MemoryParmStore, StoreError> {
        let mut store = MemoryParmStore::new();
        for def in defs {
            store.add(&def.name, def.values.clone())?;
        }
        Ok(store)
    }

    /// Add a parameter with at least one default coefficient.
    pub fn add(&mut self, name: &str, default: Vec<f64>) -> Result<ParmId, StoreError> {
        if self.parms.contains_key(name) {
            return Err(StoreError::DuplicateParm(name.to_string()));
        }
        if default.is_empty() {
            return Err(StoreError::CoeffCount {
                name: name.to_string(),
                expected: 1,
                got: 0,
            });
        }
        let (id, _) = self.parms.insert_full(
            name.to_string(),
            ParmEntry {
                default,
                grid: None,
                cells: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    /// How many times [`ParameterStore::flush`] has been called.
    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    pub fn values(&self) -> Vec<ParmValues> {
        self.parms
            .iter()
            .map(|(name, entry)| ParmValues {
                name: name.clone(),
                default: entry.default.clone(),
                grid: entry.grid.clone(),
                cells: entry
                    .cells
                    .iter()
                    .map(|(&cell, values)| CellValues {
                        cell,
                        values: values.clone(),
                    })
                    .collect(),
            })
            .collect()
    }

    fn entry(&self, id: ParmId) -> Result<(&String, &ParmEntry), StoreError> {
        self.parms.get_index(id).ok_or(StoreError::InvalidParm(id))
    }
}

impl ParameterStore for MemoryParmStore {
    fn get(&self, name: &str) -> Option<ParmId> {
        self.parms.get_index_of(name)
    }

    fn name(&self, id: ParmId) -> Result<&str, StoreError> {
        self.entry(id).map(|(name, _)| name.as_str())
    }

    fn names(&self) -> Vec<&str> {
        self.parms.keys().map(|k| k.as_str()).collect()
    }

    fn coeff_count(&self, id: ParmId) -> Result<usize, StoreError> {
        self.entry(id).map(|(_, e)| e.default.len())
    }

    fn grid(&self, id: ParmId) -> Result<Option<&Grid>, StoreError> {
        self.entry(id).map(|(_, e)| e.grid.as_ref())
    }

    fn set_grid(&mut self, grid: &Grid, ids: &[ParmId]) -> Result<(), StoreError> {
        // Check everything before changing anything.
        for &id in ids {
            let (name, entry) = self.entry(id)?;
            if matches!(&entry.grid, Some(g) if g != grid) {
                return Err(StoreError::GridMismatch { name: name.clone() });
            }
        }
        for &id in ids {
            if let Some((name, entry)) = self.parms.get_index_mut(id) {
                if entry.grid.is_none() {
                    debug!("Setting the solution grid of '{name}'");
                    entry.grid = Some(grid.clone());
                }
            }
        }
        Ok(())
    }

    fn coeff(&self, id: ParmId, cell: Location) -> Result<Vec<f64>, StoreError> {
        let (name, entry) = self.entry(id)?;
        if let Some(grid) = &entry.grid {
            if !grid.cells().contains(cell) {
                return Err(StoreError::OutOfGrid {
                    name: name.clone(),
                    cell,
                });
            }
        }
        Ok(entry
            .cells
            .get(&cell)
            .unwrap_or(&entry.default)
            .clone())
    }

    fn set_coeff(&mut self, id: ParmId, cell: Location, values: &[f64]) -> Result<(), StoreError> {
        let (name, entry) = self
            .parms
            .get_index_mut(id)
            .ok_or(StoreError::InvalidParm(id))?;
        let grid = entry
            .grid
            .as_ref()
            .ok_or_else(|| StoreError::NoGrid { name: name.clone() })?;
        if !grid.cells().contains(cell) {
            return Err(StoreError::OutOfGrid {
                name: name.clone(),
                cell,
            });
        }
        if values.len() != entry.default.len() {
            return Err(StoreError::CoeffCount {
                name: name.clone(),
                expected: entry.default.len(),
                got: values.len(),
            });
        }
        entry.cells.insert(cell, values.to_vec());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.flushes += 1;
        trace!("Flushed the parameter store ({} flushes)", self.flushes);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MemorySampleStore {
    info: SampleInfo,
    columns: IndexMap<String, Array4<c64>>,
    flags: Array4<bool>,
    covariance: Array4<f64>,
}

impl MemorySampleStore {
    /// Make a store whose [`DEFAULT_COLUMN`] holds `samples`. Nothing is
    /// flagged and all covariances are one.
    pub fn new(info: SampleInfo, samples: Array4<c64>) -> Result<MemorySampleStore, StoreError> {
        let dims = info.dims();
        check_shape(dims, samples.dim())?;
        Ok(MemorySampleStore {
            flags: Array4::from_elem(dims, false),
            covariance: Array4::from_elem(dims, 1.0),
            columns: IndexMap::from([(DEFAULT_COLUMN.to_string(), samples)]),
            info,
        })
    }

    pub fn with_flags(mut self, flags: Array4<bool>) -> Result<MemorySampleStore, StoreError> {
        check_shape(self.info.dims(), flags.dim())?;
        self.flags = flags;
        Ok(self)
    }

    pub fn with_covariance(
        mut self,
        covariance: Array4<f64>,
    ) -> Result<MemorySampleStore, StoreError> {
        check_shape(self.info.dims(), covariance.dim())?;
        self.covariance = covariance;
        Ok(self)
    }

    pub fn column(&self, name: &str) -> Option<ArrayView4<c64>> {
        self.columns.get(name).map(|c| c.view())
    }

    pub fn flags(&self) -> ArrayView4<bool> {
        self.flags.view()
    }

    fn check_selection(&self, selection: &Range2) -> Result<(), StoreError> {
        let all = self.info.grid.cells();
        if selection.is_empty() || selection.intersect(&all) != *selection {
            return Err(StoreError::Selection {
                start: selection.start(),
                end: selection.end(),
            });
        }
        Ok(())
    }
}

fn check_shape(
    expected: (usize, usize, usize, usize),
    got: (usize, usize, usize, usize),
) -> Result<(), StoreError> {
    if expected == got {
        Ok(())
    } else {
        Err(StoreError::Shape { expected, got })
    }
}

impl SampleStore for MemorySampleStore {
    fn info(&self) -> &SampleInfo {
        &self.info
    }

    fn read(&self, selection: &Range2, column: &str) -> Result<SampleChunk, StoreError> {
        self.check_selection(selection)?;
        let samples = self
            .columns
            .get(column)
            .ok_or_else(|| StoreError::UnknownColumn(column.to_string()))?;
        let (t, f) = (selection.time, selection.freq);
        Ok(SampleChunk {
            grid: self.info.grid.subset_range(selection)?,
            offset: selection.start(),
            samples: samples
                .slice(s![.., t.start..=t.end, f.start..=f.end, ..])
                .to_owned(),
            flags: self
                .flags
                .slice(s![.., t.start..=t.end, f.start..=f.end, ..])
                .to_owned(),
            covariance: self
                .covariance
                .slice(s![.., t.start..=t.end, f.start..=f.end, ..])
                .to_owned(),
        })
    }

    fn write(
        &mut self,
        chunk: &SampleChunk,
        column: &str,
        write_flags: bool,
    ) -> Result<(), StoreError> {
        let selection = chunk.cells();
        self.check_selection(&selection)?;
        let (t, f) = (selection.time, selection.freq);
        let expected = (
            self.info.baselines.len(),
            t.len(),
            f.len(),
            self.info.correlations.len(),
        );
        check_shape(expected, chunk.samples.dim())?;
        check_shape(expected, chunk.flags.dim())?;

        if !self.columns.contains_key(column) {
            debug!("Creating sample column '{column}'");
            let template = self.columns[DEFAULT_COLUMN].clone();
            self.columns.insert(column.to_string(), template);
        }
        if let Some(target) = self.columns.get_mut(column) {
            target
                .slice_mut(s![.., t.start..=t.end, f.start..=f.end, ..])
                .assign(&chunk.samples);
        }
        if write_flags {
            self.flags
                .slice_mut(s![.., t.start..=t.end, f.start..=f.end, ..])
                .assign(&chunk.flags);
        }
        Ok(())
    }
}
