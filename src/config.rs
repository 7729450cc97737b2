use serde::{Deserialize, Serialize};

use crate::constants::C_SVP;
use crate::error::{VicError, VicResult};
use crate::root::RootSolver;

// ═══════════════════════════════════════════════════════════════════════
// Model options (resolved once per cell)
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GroundFluxMode {
    QuickFlux,
    #[default]
    FiniteDifference,
    QuickSolve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LowerBoundary {
    #[default]
    ConstantTemperature,
    NoFlux,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    pub full_energy: bool,           // solve surface temperature (false: Ts = Tair)
    pub frozen_soil: bool,           // partition layer moisture into ice and liquid
    pub frost_subareas: Option<usize>, // spatial frost bins, requires frozen_soil
    pub spatial_snow: bool,          // depletion-curve snow coverage
    pub blowing: bool,               // blowing snow sublimation
    pub dist_prcp: bool,             // wet/dry precipitation split
    pub prec_expt: f64,              // exponent of the wet fraction relation
    pub ground_flux: GroundFluxMode,
    pub lower_boundary: LowerBoundary,
    pub nnode: usize,                // number of soil thermal nodes
    pub min_wind_speed: f64,         // m/s
    pub lakes: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        ModelOptions {
            full_energy: true,
            frozen_soil: false,
            frost_subareas: None,
            spatial_snow: false,
            blowing: false,
            dist_prcp: false,
            prec_expt: 0.6,
            ground_flux: GroundFluxMode::default(),
            lower_boundary: LowerBoundary::default(),
            nnode: 5,
            min_wind_speed: 0.1,
            lakes: false,
        }
    }
}

impl ModelOptions {
    /// Number of frost subareas each layer carries (1 without spatial frost).
    pub fn n_frost(&self) -> usize {
        self.frost_subareas.unwrap_or(1).max(1)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Run-wide parameters
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalParams {
    pub dt_hours: f64,         // model time step (h)
    pub snow_step_hours: f64,  // snow sub-step (h), divides dt_hours
    pub max_snow_temp: f64,    // all precipitation is snow below this (C)
    pub min_rain_temp: f64,    // all precipitation is rain above this (C)
    pub measure_h: f64,        // temperature/humidity measurement height (m)
    pub wind_h: f64,           // wind measurement height above displacement (m)
}

impl Default for GlobalParams {
    fn default() -> Self {
        GlobalParams {
            dt_hours: 24.0,
            snow_step_hours: 3.0,
            max_snow_temp: 0.5,
            min_rain_temp: -0.5,
            measure_h: 2.0,
            wind_h: 10.0,
        }
    }
}

impl GlobalParams {
    pub fn dt_seconds(&self) -> f64 {
        self.dt_hours * crate::constants::SEC_PER_HOUR
    }

    pub fn n_substeps(&self) -> usize {
        (self.dt_hours / self.snow_step_hours).round().max(1.0) as usize
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Numerical settings
// ═══════════════════════════════════════════════════════════════════════

/// Half-widths of the initial brackets for each class of unknown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BracketWidths {
    pub snow_dt: f64,   // snow surface temperature (C)
    pub surf_dt: f64,   // ground, foliage and lake surface temperature (C)
    pub soil_dt: f64,   // soil node temperature (C)
    pub canopy_dt: f64, // canopy air temperature (C)
    pub canopy_vp: f64, // canopy vapour pressure (Pa)
    pub min_temp: f64,  // lowest temperature any widened bracket may reach (C)
    pub max_temp: f64,  // highest temperature any widened bracket may reach (C)
}

impl BracketWidths {
    /// Physical range every temperature search is clamped to.
    pub fn temp_limits(&self) -> (f64, f64) {
        (self.min_temp, self.max_temp)
    }
}

impl Default for BracketWidths {
    fn default() -> Self {
        BracketWidths {
            snow_dt: 5.0,
            surf_dt: 1.0,
            soil_dt: 0.25,
            canopy_dt: 1.0,
            canopy_vp: 25.0,
            min_temp: -100.0,
            max_temp: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionSettings {
    pub theta: f64,          // implicit weight (0.5 = Crank-Nicolson)
    pub max_iterations: usize,
    pub ice_tolerance: f64,  // max node ice change between iterations (m3/m3)
}

impl Default for DiffusionSettings {
    fn default() -> Self {
        DiffusionSettings {
            theta: 0.5,
            max_iterations: 50,
            ice_tolerance: 1.0e-6,
        }
    }
}

/// Warning and fatal thresholds for one closure term.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub warn: f64,
    pub fatal: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceTolerances {
    pub water: Tolerance,     // mm
    pub energy: Tolerance,    // W/m^2
    pub snow_mass: Tolerance, // m
}

impl Default for BalanceTolerances {
    fn default() -> Self {
        BalanceTolerances {
            water: Tolerance {
                warn: 1.0e-3,
                fatal: 1.0,
            },
            energy: Tolerance {
                warn: 1.0,
                fatal: 500.0,
            },
            snow_mass: Tolerance {
                warn: 1.0e-6,
                fatal: 1.0e-3,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub brackets: BracketWidths,
    pub root: RootSolver,
    pub diffusion: DiffusionSettings,
    pub tolerances: BalanceTolerances,
}

// ═══════════════════════════════════════════════════════════════════════
// Full configuration
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub options: ModelOptions,
    pub global: GlobalParams,
    pub solver: SolverSettings,
}

impl ModelConfig {
    /// Reject option combinations that cannot be simulated.
    pub fn validate(&self) -> VicResult<()> {
        let o = &self.options;
        let g = &self.global;
        let s = &self.solver;

        if o.frost_subareas.is_some() && !o.frozen_soil {
            return Err(VicError::Config(
                "spatial frost requires frozen soil".to_string(),
            ));
        }
        if o.frost_subareas == Some(0) {
            return Err(VicError::Config(
                "spatial frost needs at least one subarea".to_string(),
            ));
        }
        if o.frozen_soil && o.ground_flux == GroundFluxMode::QuickFlux {
            return Err(VicError::Config(
                "frozen soil requires the finite-difference ground flux".to_string(),
            ));
        }
        if o.nnode < 3 {
            return Err(VicError::parameter(
                "nnode",
                o.nnode as f64,
                "at least three thermal nodes are required",
            ));
        }
        if o.blowing && !o.spatial_snow {
            return Err(VicError::Config(
                "blowing snow requires spatial snow".to_string(),
            ));
        }
        if o.dist_prcp && !(o.prec_expt > 0.0) {
            return Err(VicError::parameter(
                "prec_expt",
                o.prec_expt,
                "must be positive with distributed precipitation",
            ));
        }
        if o.min_wind_speed <= 0.0 {
            return Err(VicError::parameter(
                "min_wind_speed",
                o.min_wind_speed,
                "must be positive",
            ));
        }

        if !(g.dt_hours > 0.0) || g.dt_hours > 24.0 {
            return Err(VicError::parameter(
                "dt_hours",
                g.dt_hours,
                "must lie in (0, 24]",
            ));
        }
        if !(g.snow_step_hours > 0.0) || g.snow_step_hours > g.dt_hours {
            return Err(VicError::parameter(
                "snow_step_hours",
                g.snow_step_hours,
                "must lie in (0, dt_hours]",
            ));
        }
        let ratio = g.dt_hours / g.snow_step_hours;
        if (ratio - ratio.round()).abs() > 1.0e-9 {
            return Err(VicError::parameter(
                "snow_step_hours",
                g.snow_step_hours,
                "must divide the model time step",
            ));
        }
        if g.max_snow_temp < g.min_rain_temp {
            return Err(VicError::parameter(
                "max_snow_temp",
                g.max_snow_temp,
                "must not be below min_rain_temp",
            ));
        }
        if g.measure_h <= 0.0 || g.wind_h <= 0.0 {
            return Err(VicError::Config(
                "measurement heights must be positive".to_string(),
            ));
        }

        let b = &s.brackets;
        if !(b.min_temp > -C_SVP) || !(b.max_temp > b.min_temp) {
            return Err(VicError::parameter(
                "min_temp",
                b.min_temp,
                "temperature limits must be ordered and above the vapour pressure pole",
            ));
        }
        for (field, value) in [
            ("snow_dt", b.snow_dt),
            ("surf_dt", b.surf_dt),
            ("soil_dt", b.soil_dt),
            ("canopy_dt", b.canopy_dt),
            ("canopy_vp", b.canopy_vp),
        ] {
            if !(value > 0.0) {
                return Err(VicError::parameter(field, value, "bracket half-width must be positive"));
            }
        }
        if s.root.max_iterations == 0 {
            return Err(VicError::Config(
                "root solver needs at least one iteration".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&s.diffusion.theta) {
            return Err(VicError::parameter(
                "theta",
                s.diffusion.theta,
                "implicit weight must lie in [0, 1]",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ModelConfig::default().validate().is_ok());
    }

    #[test]
    fn spatial_frost_without_frozen_soil_is_rejected() {
        let mut cfg = ModelConfig::default();
        cfg.options.frost_subareas = Some(3);
        assert!(matches!(cfg.validate(), Err(VicError::Config(_))));
        cfg.options.frozen_soil = true;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn quick_flux_with_frozen_soil_is_rejected() {
        let mut cfg = ModelConfig::default();
        cfg.options.frozen_soil = true;
        cfg.options.ground_flux = GroundFluxMode::QuickFlux;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn snow_step_must_divide_model_step() {
        let mut cfg = ModelConfig::default();
        cfg.global.snow_step_hours = 5.0;
        assert!(cfg.validate().is_err());
        cfg.global.snow_step_hours = 6.0;
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.global.n_substeps(), 4);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: ModelConfig = serde_json::from_str(
            r#"{"options": {"frozen_soil": true, "nnode": 10},
                "solver": {"brackets": {"surf_dt": 2.0}}}"#,
        )
        .unwrap();
        assert!(cfg.options.frozen_soil);
        assert_eq!(cfg.options.nnode, 10);
        assert_eq!(cfg.solver.brackets.surf_dt, 2.0);
        assert_eq!(cfg.solver.brackets.snow_dt, 5.0);
        assert_eq!(cfg.global.dt_hours, 24.0);
        assert_eq!(cfg.solver.brackets.temp_limits(), (-100.0, 100.0));
    }

    #[test]
    fn temperature_floor_below_the_vapour_pressure_pole_is_rejected() {
        let mut cfg = ModelConfig::default();
        cfg.solver.brackets.min_temp = -250.0;
        assert!(cfg.validate().is_err());
    }
}
