pub mod atmos;
pub mod canopy;
pub mod cell;
pub mod config;
pub mod constants;
pub mod driver;
pub mod error;
pub mod forcing;
pub mod lake;
pub mod output;
pub mod root;
pub mod snow;
pub mod soil;
pub mod state;
pub mod surface;
pub mod thermal;
pub mod tile;

#[cfg(feature = "python")]
mod python;

pub use cell::{BandParams, Cell, CellParams, CellState, CellStep};
pub use config::ModelConfig;
pub use driver::{run_cell, run_cells, CellRun};
pub use error::{VicError, VicResult};
pub use forcing::{AtmosForcingStep, AtmosRecord};
pub use output::{OutVar, OutputRecord, StepDiagnostics};

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
fn _vic_rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    python::register(m)?;
    Ok(())
}
