use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::root::RootError;

pub type VicResult<T> = Result<T, VicError>;

/// Location of a failing solve inside a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolveContext {
    pub cell: Option<usize>,
    pub step: Option<usize>,
    pub veg: Option<usize>,
    pub band: Option<usize>,
    pub fraction: Option<usize>, // 0 = wet, 1 = dry
}

impl SolveContext {
    pub fn tile(veg: usize, band: usize) -> Self {
        SolveContext {
            veg: Some(veg),
            band: Some(band),
            ..SolveContext::default()
        }
    }

    /// Fill every unset field from `outer`.
    pub fn merge(self, outer: SolveContext) -> Self {
        SolveContext {
            cell: self.cell.or(outer.cell),
            step: self.step.or(outer.step),
            veg: self.veg.or(outer.veg),
            band: self.band.or(outer.band),
            fraction: self.fraction.or(outer.fraction),
        }
    }
}

impl fmt::Display for SolveContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(c) = self.cell {
            parts.push(format!("cell {}", c));
        }
        if let Some(s) = self.step {
            parts.push(format!("step {}", s));
        }
        if let Some(v) = self.veg {
            parts.push(format!("veg {}", v));
        }
        if let Some(b) = self.band {
            parts.push(format!("band {}", b));
        }
        if let Some(d) = self.fraction {
            parts.push(if d == 0 { "wet".to_string() } else { "dry".to_string() });
        }
        if parts.is_empty() {
            write!(f, "<no context>")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

/// The unknown a root search was solving for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveVariable {
    SurfaceTemperature,
    SnowSurfaceTemperature,
    SoilTemperature,
    FoliageTemperature,
    CanopyAirTemperature,
    CanopyVaporPressure,
    LakeSurfaceTemperature,
    LakeIceTemperature,
}

impl fmt::Display for SolveVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SolveVariable::SurfaceTemperature => "surface temperature",
            SolveVariable::SnowSurfaceTemperature => "snow surface temperature",
            SolveVariable::SoilTemperature => "soil temperature",
            SolveVariable::FoliageTemperature => "foliage temperature",
            SolveVariable::CanopyAirTemperature => "canopy air temperature",
            SolveVariable::CanopyVaporPressure => "canopy vapor pressure",
            SolveVariable::LakeSurfaceTemperature => "lake surface temperature",
            SolveVariable::LakeIceTemperature => "lake ice temperature",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceKind {
    Water,
    Energy,
    SnowMass,
}

impl fmt::Display for BalanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalanceKind::Water => f.write_str("water"),
            BalanceKind::Energy => f.write_str("energy"),
            BalanceKind::SnowMass => f.write_str("snow mass"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VicError {
    /// Root not bracketed or iteration limit exceeded.
    #[error("{variable} solve failed at {context}: {source}")]
    Solver {
        context: SolveContext,
        variable: SolveVariable,
        #[source]
        source: RootError,
    },

    /// Closure error beyond the hard sanity limit.
    #[error("{kind} balance error {error:.4e} exceeds limit {limit:.4e} at {context}")]
    Balance {
        context: SolveContext,
        kind: BalanceKind,
        error: f64,
        limit: f64,
    },

    #[error("physically inconsistent state at {context}: {message}")]
    Physical {
        context: SolveContext,
        message: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid parameter {field} = {value}: {reason}")]
    Parameter {
        field: &'static str,
        value: f64,
        reason: &'static str,
    },

    #[error("shape mismatch for {name}: expected {expected}, got {actual}")]
    Shape {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("checkpoint length mismatch: expected {expected} values, got {actual}")]
    Checkpoint { expected: usize, actual: usize },
}

impl VicError {
    pub fn solver(variable: SolveVariable, source: RootError) -> Self {
        VicError::Solver {
            context: SolveContext::default(),
            variable,
            source,
        }
    }

    pub fn physical(message: impl Into<String>) -> Self {
        VicError::Physical {
            context: SolveContext::default(),
            message: message.into(),
        }
    }

    pub fn parameter(field: &'static str, value: f64, reason: &'static str) -> Self {
        VicError::Parameter { field, value, reason }
    }

    /// Attach location fields that are not already set.
    pub fn with_context(self, outer: SolveContext) -> Self {
        match self {
            VicError::Solver {
                context,
                variable,
                source,
            } => VicError::Solver {
                context: context.merge(outer),
                variable,
                source,
            },
            VicError::Balance {
                context,
                kind,
                error,
                limit,
            } => VicError::Balance {
                context: context.merge(outer),
                kind,
                error,
                limit,
            },
            VicError::Physical { context, message } => VicError::Physical {
                context: context.merge(outer),
                message,
            },
            other => other,
        }
    }

    pub fn context(&self) -> Option<SolveContext> {
        match self {
            VicError::Solver { context, .. }
            | VicError::Balance { context, .. }
            | VicError::Physical { context, .. } => Some(*context),
            _ => None,
        }
    }
}
