// Python entry point: batch runs over numpy forcing arrays.

use numpy::{PyArray2, PyReadonlyArray1, PyReadonlyArray2};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::cell::{Cell, CellParams};
use crate::driver::{batch_errors, batch_series, batch_states, build_forcing, run_cells, CellRun, ForcingColumns};
use crate::error::{VicError, VicResult};
use crate::forcing::AtmosForcingStep;
use crate::output::{OutVar, OutputRecord};
use crate::state::StateLayout;

fn to_py(err: VicError) -> PyErr {
    match err {
        VicError::Config(_) | VicError::Parameter { .. } | VicError::Shape { .. } | VicError::Checkpoint { .. } => {
            PyValueError::new_err(err.to_string())
        }
        _ => PyRuntimeError::new_err(err.to_string()),
    }
}

fn parse_cells(cells_json: &str) -> PyResult<Vec<CellParams>> {
    serde_json::from_str(cells_json).map_err(|e| PyValueError::new_err(format!("cell parameters: {}", e)))
}

/// Run a batch of cells.
///
/// Forcing arrays are (n_records, n_cells) at snow sub-step resolution;
/// `months` holds the calendar month of every model step. Returns SWE,
/// column soil moisture, runoff, baseflow, evaporation and surface
/// temperature as (n_steps, n_cells), the final state (n_cells, n_state)
/// and one error message per cell (`None` on success). A failed cell keeps
/// NaN in all of its columns and does not affect the others.
#[pyfunction]
#[pyo3(signature = (cells_json, months, ta, prec, sw, lw, ps, vp, wind, initial_state=None))]
#[allow(clippy::too_many_arguments, clippy::type_complexity)]
fn run_vic_batch<'py>(
    py: Python<'py>,
    cells_json: &str,
    months: PyReadonlyArray1<'py, i64>,
    ta: PyReadonlyArray2<'py, f64>,
    prec: PyReadonlyArray2<'py, f64>,
    sw: PyReadonlyArray2<'py, f64>,
    lw: PyReadonlyArray2<'py, f64>,
    ps: PyReadonlyArray2<'py, f64>,
    vp: PyReadonlyArray2<'py, f64>,
    wind: PyReadonlyArray2<'py, f64>,
    initial_state: Option<PyReadonlyArray2<'py, f64>>,
) -> PyResult<(
    Bound<'py, PyArray2<f64>>,
    Bound<'py, PyArray2<f64>>,
    Bound<'py, PyArray2<f64>>,
    Bound<'py, PyArray2<f64>>,
    Bound<'py, PyArray2<f64>>,
    Bound<'py, PyArray2<f64>>,
    Bound<'py, PyArray2<f64>>,
    Vec<Option<String>>,
)> {
    let cells = parse_cells(cells_json)?;
    let months: Vec<usize> = months.as_array().iter().map(|&m| m.max(0) as usize).collect();
    let (ta, prec, sw, lw, ps, vp, wind) = (
        ta.as_array(),
        prec.as_array(),
        sw.as_array(),
        lw.as_array(),
        ps.as_array(),
        vp.as_array(),
        wind.as_array(),
    );
    let n_cells = cells.len();
    if ta.shape()[1] != n_cells {
        return Err(to_py(VicError::Shape {
            name: "forcing columns",
            expected: n_cells,
            actual: ta.shape()[1],
        }));
    }
    let n_steps = months.len();

    // Pre-extract per-cell forcing before releasing the GIL
    let forcing: Vec<Vec<AtmosForcingStep>> = cells
        .iter()
        .enumerate()
        .map(|(c, params)| {
            let cols = ForcingColumns {
                air_temp: ta.column(c),
                prec: prec.column(c),
                shortwave: sw.column(c),
                longwave: lw.column(c),
                pressure: ps.column(c),
                vp: vp.column(c),
                wind: wind.column(c),
            };
            build_forcing(&cols, &months, params.config.global.n_substeps())
        })
        .collect::<Result<_, _>>()
        .map_err(to_py)?;

    let initial: Option<Vec<Vec<f64>>> = initial_state.map(|arr| {
        arr.as_array()
            .rows()
            .into_iter()
            .map(|row| row.iter().copied().take_while(|v| !v.is_nan()).collect())
            .collect()
    });

    let results: Vec<VicResult<CellRun>> = py.allow_threads(|| run_cells(cells, &forcing, initial.as_deref()));
    if results.len() != n_cells {
        // Only a batch-level shape mismatch comes back as a single entry
        if let Some(Err(e)) = results.into_iter().next() {
            return Err(to_py(e));
        }
        return Err(PyRuntimeError::new_err("cell results missing"));
    }

    let series = |value: fn(&OutputRecord) -> f64| batch_series(&results, n_steps, value);
    let swe_out = series(|r| r.scalar(OutVar::Swe));
    let moist_out = series(|r| r.get(OutVar::SoilMoist).map_or(0.0, |v| v.iter().sum()));
    let runoff_out = series(|r| r.scalar(OutVar::Runoff));
    let baseflow_out = series(|r| r.scalar(OutVar::Baseflow));
    let evap_out = series(|r| r.scalar(OutVar::Evap));
    let tsurf_out = series(|r| r.scalar(OutVar::SurfTemp));
    let state_out = batch_states(&results);
    let errors = batch_errors(&results);

    Ok((
        PyArray2::from_owned_array_bound(py, swe_out),
        PyArray2::from_owned_array_bound(py, moist_out),
        PyArray2::from_owned_array_bound(py, runoff_out),
        PyArray2::from_owned_array_bound(py, baseflow_out),
        PyArray2::from_owned_array_bound(py, evap_out),
        PyArray2::from_owned_array_bound(py, tsurf_out),
        PyArray2::from_owned_array_bound(py, state_out),
        errors,
    ))
}

/// Checkpoint length of one cell described as JSON.
#[pyfunction]
fn state_size(cell_json: &str) -> PyResult<usize> {
    let params = CellParams::from_json(cell_json).map_err(to_py)?;
    let cell = Cell::new(params).map_err(to_py)?;
    Ok(StateLayout::for_cell(&cell).size())
}

/// Names of every output variable.
#[pyfunction]
fn output_names() -> Vec<&'static str> {
    OutVar::ALL.iter().map(|v| v.name()).collect()
}

pub fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(run_vic_batch, m)?)?;
    m.add_function(wrap_pyfunction!(state_size, m)?)?;
    m.add_function(wrap_pyfunction!(output_names, m)?)?;
    Ok(())
}
