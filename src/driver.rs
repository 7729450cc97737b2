// Multi-step runs of whole cells and the parallel fan-out across cells.

use log::{debug, warn};
use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;

use crate::cell::{Cell, CellParams};
use crate::error::{VicError, VicResult};
use crate::forcing::{AtmosForcingStep, AtmosRecord};
use crate::output::{OutVar, OutputRecord, StepDiagnostics};
use crate::state;

/// Result of running one cell over a forcing series.
#[derive(Debug, Clone, PartialEq)]
pub struct CellRun {
    pub records: Vec<OutputRecord>,
    pub diagnostics: Vec<StepDiagnostics>,
    pub final_state: Vec<f64>,
}

impl CellRun {
    /// Time series of `var`, one row per step and one column per value
    /// (layer, band or node). Missing values are NaN.
    pub fn series(&self, var: OutVar) -> Array2<f64> {
        let width = self
            .records
            .iter()
            .filter_map(|r| r.get(var).map(|v| v.len()))
            .max()
            .unwrap_or(1);
        let mut out = Array2::from_elem((self.records.len(), width), f64::NAN);
        for (t, rec) in self.records.iter().enumerate() {
            if let Some(values) = rec.get(var) {
                for (i, v) in values.iter().enumerate() {
                    out[[t, i]] = *v;
                }
            }
        }
        out
    }

    pub fn n_warnings(&self) -> usize {
        self.diagnostics.iter().map(|d| d.warnings.len()).sum()
    }
}

/// Run one cell from `initial` (a checkpoint) or from its parameters.
pub fn run_cell(params: CellParams, forcing: &[AtmosForcingStep], initial: Option<&[f64]>) -> VicResult<CellRun> {
    let cell = Cell::new(params)?;
    let mut cell_state = match initial {
        Some(v) => state::unpack(&cell, v)?,
        None => cell.initial_state()?,
    };

    let mut records = Vec::with_capacity(forcing.len());
    let mut diagnostics = Vec::with_capacity(forcing.len());
    for step in forcing {
        let out = cell.step(&mut cell_state, step)?;
        records.push(out.record);
        diagnostics.push(out.diagnostics);
    }
    let run = CellRun {
        records,
        diagnostics,
        final_state: state::pack(&cell_state),
    };
    debug!(
        "cell {}: {} steps, {} balance warnings",
        cell.params.id,
        forcing.len(),
        run.n_warnings()
    );
    Ok(run)
}

/// Run independent cells in parallel. A failing cell does not affect the others.
pub fn run_cells(
    cells: Vec<CellParams>,
    forcing: &[Vec<AtmosForcingStep>],
    initial: Option<&[Vec<f64>]>,
) -> Vec<VicResult<CellRun>> {
    if cells.len() != forcing.len() {
        let err = VicError::Shape {
            name: "cell forcing series",
            expected: cells.len(),
            actual: forcing.len(),
        };
        return vec![Err(err)];
    }
    cells
        .into_par_iter()
        .enumerate()
        .map(|(c, params)| {
            let id = params.id;
            let init = initial.and_then(|all| all.get(c)).map(|v| v.as_slice());
            let result = run_cell(params, &forcing[c], init);
            if let Err(e) = &result {
                warn!("cell {} failed: {}", id, e);
            }
            result
        })
        .collect()
}

/// One scalar per step and cell from a batch of runs, (n_steps, n_cells).
/// Columns of failed cells stay NaN.
pub fn batch_series(
    results: &[VicResult<CellRun>],
    n_steps: usize,
    value: impl Fn(&OutputRecord) -> f64,
) -> Array2<f64> {
    let mut out = Array2::from_elem((n_steps, results.len()), f64::NAN);
    for (c, run) in results.iter().enumerate() {
        let Ok(run) = run else { continue };
        for (t, rec) in run.records.iter().take(n_steps).enumerate() {
            out[[t, c]] = value(rec);
        }
    }
    out
}

/// Final checkpoints as (n_cells, longest state), NaN-padded. Failed cells
/// are all NaN.
pub fn batch_states(results: &[VicResult<CellRun>]) -> Array2<f64> {
    let width = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .map(|r| r.final_state.len())
        .max()
        .unwrap_or(0);
    let mut out = Array2::from_elem((results.len(), width), f64::NAN);
    for (c, run) in results.iter().enumerate() {
        let Ok(run) = run else { continue };
        for (i, &v) in run.final_state.iter().enumerate() {
            out[[c, i]] = v;
        }
    }
    out
}

/// Error message of every failed cell, `None` for cells that completed.
pub fn batch_errors(results: &[VicResult<CellRun>]) -> Vec<Option<String>> {
    results.iter().map(|r| r.as_ref().err().map(|e| e.to_string())).collect()
}

/// Per-record forcing columns of one cell at sub-step resolution.
pub struct ForcingColumns<'a> {
    pub air_temp: ArrayView1<'a, f64>,  // C
    pub prec: ArrayView1<'a, f64>,      // mm per record
    pub shortwave: ArrayView1<'a, f64>, // W/m^2
    pub longwave: ArrayView1<'a, f64>,  // W/m^2
    pub pressure: ArrayView1<'a, f64>,  // kPa
    pub vp: ArrayView1<'a, f64>,        // kPa
    pub wind: ArrayView1<'a, f64>,      // m/s
}

/// Group sub-step records into model steps of `n_substeps` records each.
/// `months` gives the calendar month of every model step.
pub fn build_forcing(
    columns: &ForcingColumns<'_>,
    months: &[usize],
    n_substeps: usize,
) -> VicResult<Vec<AtmosForcingStep>> {
    let n_records = columns.air_temp.len();
    for (name, col) in [
        ("prec", &columns.prec),
        ("shortwave", &columns.shortwave),
        ("longwave", &columns.longwave),
        ("pressure", &columns.pressure),
        ("vp", &columns.vp),
        ("wind", &columns.wind),
    ] {
        if col.len() != n_records {
            return Err(VicError::Shape {
                name,
                expected: n_records,
                actual: col.len(),
            });
        }
    }
    if n_records != months.len() * n_substeps {
        return Err(VicError::Shape {
            name: "forcing records",
            expected: months.len() * n_substeps,
            actual: n_records,
        });
    }

    months
        .iter()
        .enumerate()
        .map(|(step, &month)| {
            let records = (step * n_substeps..(step + 1) * n_substeps)
                .map(|i| {
                    AtmosRecord::new(
                        columns.air_temp[i],
                        columns.prec[i],
                        columns.shortwave[i],
                        columns.longwave[i],
                        columns.pressure[i],
                        columns.vp[i],
                        columns.wind[i],
                    )
                })
                .collect();
            AtmosForcingStep::from_substeps(month, records)
        })
        .collect()
}
