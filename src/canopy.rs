// Vegetation parameters, interception storage and the canopy energy balance
// solved above a snow pack sheltered by an overstory.

use serde::{Deserialize, Serialize};

use crate::atmos::{
    latent_heat_sublimation, latent_heat_vaporization, sensible_heat, svp, vapor_flux, ExchangeGeometry,
};
use crate::config::SolverSettings;
use crate::constants::*;
use crate::error::{SolveVariable, VicError, VicResult};

// ═══════════════════════════════════════════════════════════════════════
// Vegetation library
// ═══════════════════════════════════════════════════════════════════════

fn default_emissivity() -> f64 {
    1.0
}

fn default_rad_atten() -> f64 {
    0.5
}

fn default_wind_atten() -> f64 {
    0.5
}

fn default_trunk_ratio() -> f64 {
    0.2
}

/// One vegetation class with monthly cycles (index 0 = January).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VegClass {
    #[serde(default)]
    pub name: String,
    pub overstory: bool,
    pub lai: [f64; 12],
    pub albedo: [f64; 12],
    pub roughness: [f64; 12],    // m
    pub displacement: [f64; 12], // m
    #[serde(default)]
    pub wdmax: Option<[f64; 12]>, // interception capacity (mm)
    #[serde(default = "default_emissivity")]
    pub emissivity: f64,
    pub rmin: f64, // minimum stomatal resistance (s/m)
    pub rarc: f64, // architectural resistance (s/m)
    #[serde(default = "default_rad_atten")]
    pub rad_atten: f64,
    #[serde(default = "default_wind_atten")]
    pub wind_atten: f64,
    #[serde(default = "default_trunk_ratio")]
    pub trunk_ratio: f64,
}

impl VegClass {
    /// Parameters for calendar month `month` (1..=12).
    pub fn view(&self, month: usize) -> CanopyView {
        let m = month.clamp(1, 12) - 1;
        let lai = self.lai[m];
        CanopyView {
            overstory: self.overstory,
            lai,
            albedo: self.albedo[m],
            roughness: self.roughness[m],
            displacement: self.displacement[m],
            wdmax: self.wdmax.map(|w| w[m]).unwrap_or(lai * WDEW_PER_LAI),
            emissivity: self.emissivity,
            rmin: self.rmin,
            rarc: self.rarc,
            rad_atten: self.rad_atten,
            wind_atten: self.wind_atten,
            trunk_ratio: self.trunk_ratio,
        }
    }

    pub fn validate(&self) -> VicResult<()> {
        if self.lai.iter().any(|v| *v < 0.0) {
            return Err(VicError::parameter("lai", self.lai[0], "must be non-negative"));
        }
        if self.roughness.iter().any(|v| *v <= 0.0) {
            return Err(VicError::parameter("roughness", self.roughness[0], "must be positive"));
        }
        if self.albedo.iter().any(|v| !(0.0..=1.0).contains(v)) {
            return Err(VicError::parameter("albedo", self.albedo[0], "must lie in [0, 1]"));
        }
        if self.rmin < 0.0 || self.rarc < 0.0 {
            return Err(VicError::parameter("rmin", self.rmin, "resistances must be non-negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VegLibrary {
    pub classes: Vec<VegClass>,
}

impl VegLibrary {
    pub fn get(&self, class: usize) -> VicResult<&VegClass> {
        self.classes.get(class).ok_or(VicError::Shape {
            name: "vegetation class",
            expected: self.classes.len(),
            actual: class,
        })
    }
}

/// A vegetation class occupying a fraction `cv` of a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VegTile {
    pub class: usize,
    pub cv: f64,
    pub root: Vec<f64>, // root fraction per soil layer
}

/// Monthly snapshot of a class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanopyView {
    pub overstory: bool,
    pub lai: f64,
    pub albedo: f64,
    pub roughness: f64,
    pub displacement: f64,
    pub wdmax: f64,
    pub emissivity: f64,
    pub rmin: f64,
    pub rarc: f64,
    pub rad_atten: f64,
    pub wind_atten: f64,
    pub trunk_ratio: f64,
}

impl CanopyView {
    /// Shortwave transmitted through the overstory.
    pub fn transmittance(&self) -> f64 {
        (-self.rad_atten * self.lai).exp()
    }

    /// Wind speed reduction in the trunk space.
    pub fn wind_factor(&self) -> f64 {
        (-self.wind_atten * (1.0 - self.trunk_ratio)).exp()
    }

    pub fn snow_capacity(&self) -> f64 {
        SNOW_INTERCEPT_LAI * self.lai
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Interception
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VegVarState {
    pub wdew: f64,        // intercepted liquid (mm)
    pub canopy_evap: f64, // evaporation from wdew this step (mm)
    pub throughfall: f64, // mm this step
}

/// Add rain (mm) to the canopy store, returning throughfall (mm).
pub fn intercept_rain(state: &mut VegVarState, rain: f64, wdmax: f64) -> f64 {
    let total = state.wdew + rain;
    let through = (total - wdmax).max(0.0);
    state.wdew = total - through;
    state.throughfall += through;
    through
}

/// Catch part of the snowfall (m) on the overstory; returns what reaches the
/// ground (m).
pub fn intercept_snow(snow_canopy: &mut f64, snowfall: f64, capacity: f64) -> f64 {
    let room = (capacity - *snow_canopy).max(0.0);
    let caught = (SNOW_INTERCEPT_EFF * snowfall).min(room);
    *snow_canopy += caught;
    snowfall - caught
}

// ═══════════════════════════════════════════════════════════════════════
// Evaporation
// ═══════════════════════════════════════════════════════════════════════

/// Conductance model turning a vapour pressure difference into
/// evaporation from a vegetated or bare surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvapSurface {
    pub vegetated: bool,
    pub wet_fraction: f64,
    pub canopy_resistance: f64, // s/m
    pub arch_resistance: f64,   // s/m
    pub soil_efficiency: f64,
    pub max_water: f64,         // mm available over the step
}

/// Evaporation (mm) split by source.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EvapPartition {
    pub canopy: f64,
    pub transpiration: f64,
    pub soil: f64,
}

impl EvapSurface {
    pub fn bare(soil_efficiency: f64, max_water: f64) -> Self {
        EvapSurface {
            vegetated: false,
            wet_fraction: 0.0,
            canopy_resistance: HUGE_RESIST,
            arch_resistance: 0.0,
            soil_efficiency,
            max_water,
        }
    }

    /// `stress` is the root-weighted soil moisture stress (0..1).
    pub fn vegetated(view: &CanopyView, wdew: f64, stress: f64, max_water: f64) -> Self {
        let wet = if view.wdmax > 0.0 {
            (wdew / view.wdmax).clamp(0.0, 1.0).powf(2.0 / 3.0)
        } else {
            0.0
        };
        let rc = if view.lai > 0.0 && stress > 0.0 {
            (view.rmin / (view.lai * stress)).min(HUGE_RESIST)
        } else {
            HUGE_RESIST
        };
        EvapSurface {
            vegetated: true,
            wet_fraction: wet,
            canopy_resistance: rc,
            arch_resistance: view.rarc,
            soil_efficiency: 0.0,
            max_water,
        }
    }

    fn conductances(&self, ra: f64) -> (f64, f64) {
        if ra >= HUGE_RESIST {
            return (0.0, 0.0);
        }
        if self.vegetated {
            let wet = self.wet_fraction / ra;
            let dry = (1.0 - self.wet_fraction) / (ra + self.arch_resistance + self.canopy_resistance);
            (wet, dry)
        } else {
            (0.0, self.soil_efficiency / ra)
        }
    }

    /// Vapour flux (kg/m^2/s) away from a surface at vapour pressure
    /// `e_surf`, limited by the water available over `dt` seconds.
    pub fn flux(&self, density: f64, pressure: f64, e_surf: f64, e_air: f64, ra: f64, dt: f64) -> f64 {
        let (wet, dry) = self.conductances(ra);
        let e = vapor_flux(density, pressure, e_surf, e_air, 1.0) * (wet + dry);
        if e > 0.0 {
            e.min(self.max_water / dt)
        } else {
            e
        }
    }

    /// Split a total evaporation (mm) between canopy store, transpiration
    /// and soil in proportion to the conductances.
    pub fn partition(&self, total: f64, ra: f64, wdew: f64) -> EvapPartition {
        if !self.vegetated {
            return EvapPartition {
                soil: total,
                ..EvapPartition::default()
            };
        }
        if total <= 0.0 {
            // Dew settles on the foliage
            return EvapPartition {
                canopy: total,
                ..EvapPartition::default()
            };
        }
        let (wet, dry) = self.conductances(ra);
        let share = if wet + dry > 0.0 { wet / (wet + dry) } else { 0.0 };
        let canopy = (total * share).min(wdew);
        EvapPartition {
            canopy,
            transpiration: total - canopy,
            soil: 0.0,
        }
    }
}

/// Root-weighted distribution of transpiration (mm) over the soil layers.
pub fn transpiration_demand(total: f64, root: &[f64], stress: &[f64]) -> Vec<f64> {
    let weights: Vec<f64> = root.iter().zip(stress).map(|(r, s)| r * s).collect();
    let sum: f64 = weights.iter().sum();
    if sum <= 0.0 {
        return vec![0.0; root.len()];
    }
    weights.iter().map(|w| total * w / sum).collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Canopy energy balance above snow
// ═══════════════════════════════════════════════════════════════════════

/// Drivers of one canopy solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanopyForcing {
    pub air_temp: f64,
    pub shortwave: f64,
    pub longwave: f64,
    pub vp: f64,
    pub pressure: f64,
    pub density: f64,
    pub wind: f64,
    pub ground_temp: f64, // snow surface beneath the canopy (C)
    pub dt_hours: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CanopyBalance {
    pub foliage_temp: f64,
    pub canopy_air_temp: f64,
    pub canopy_vp: f64, // kPa
    pub net_short: f64,
    pub net_long: f64,
    pub sensible: f64,
    pub latent: f64,
    pub sublimation: f64, // intercepted snow lost to vapour (m)
    pub transpiration: f64, // mm drawn from the root zone
    pub drip: f64,        // intercepted snow melted and released (m)
    pub under_shortwave: f64,
    pub under_longwave: f64,
    pub under_wind: f64,
}

struct CanopyProblem<'a> {
    view: &'a CanopyView,
    f: &'a CanopyForcing,
    above: ExchangeGeometry,
    ground_resistance: f64,
    leaf_resistance: f64,
    stomatal: f64, // extra resistance on the dry foliage path (s/m)
    snow_covered: bool,
    solver: &'a SolverSettings,
}

struct FoliageTerms {
    net_short: f64,
    net_long: f64,
    sensible: f64,
    latent: f64,
    vapor: f64, // kg/m^2/s
    canopy_air_temp: f64,
    canopy_vp: f64,
}

impl FoliageTerms {
    fn residual(&self) -> f64 {
        self.net_short + self.net_long - self.sensible - self.latent
    }
}

impl CanopyProblem<'_> {
    fn canopy_air_temp(&self, tf: f64) -> VicResult<f64> {
        let f = self.f;
        let rf = self.leaf_resistance;
        let rg = self.ground_resistance;
        let above = &self.above;
        let brackets = &self.solver.brackets;
        let root = self
            .solver
            .root
            .solve_about_within(f.air_temp, brackets.canopy_dt, brackets.temp_limits(), |tc| {
                let ra = above.resistance(f.air_temp, tc, f.wind);
                sensible_heat(f.density, tf, tc, rf) + sensible_heat(f.density, f.ground_temp, tc, rg)
                    - sensible_heat(f.density, tc, f.air_temp, ra)
            })
            .map_err(|e| VicError::solver(SolveVariable::CanopyAirTemperature, e))?;
        Ok(root.value)
    }

    fn canopy_vp(&self, tf: f64, tc: f64) -> VicResult<f64> {
        let f = self.f;
        let ra = self.above.resistance(f.air_temp, tc, f.wind);
        let rf = self.leaf_resistance + self.stomatal;
        let rg = self.ground_resistance;
        let e_leaf = svp(tf) * 1000.0;
        let e_ground = svp(f.ground_temp) * 1000.0;
        let e_air = f.vp * 1000.0;
        let centre = (e_leaf + e_ground + e_air) / 3.0;
        let root = self
            .solver
            .root
            .solve_about_within(centre, self.solver.brackets.canopy_vp, (0.0, f64::INFINITY), |ec| {
                (e_leaf - ec) / rf + (e_ground - ec) / rg - (ec - e_air) / ra
            })
            .map_err(|e| VicError::solver(SolveVariable::CanopyVaporPressure, e))?;
        Ok(root.value.max(0.0) / 1000.0)
    }

    fn terms(&self, tf: f64) -> VicResult<FoliageTerms> {
        let f = self.f;
        let v = self.view;
        let tau = v.transmittance();
        let sigma_f = STEFAN_B * (tf + KELVIN).powi(4);
        let sigma_g = STEFAN_B * (f.ground_temp + KELVIN).powi(4);
        let tc = self.canopy_air_temp(tf)?;
        let ec = self.canopy_vp(tf, tc)?;
        let vapor = vapor_flux(f.density, f.pressure, svp(tf), ec, self.leaf_resistance + self.stomatal);
        let latent_heat = if self.snow_covered {
            latent_heat_sublimation(tf)
        } else {
            latent_heat_vaporization(tf)
        };
        Ok(FoliageTerms {
            net_short: (1.0 - tau) * (1.0 - v.albedo) * f.shortwave,
            net_long: (1.0 - tau) * v.emissivity * (f.longwave + sigma_g - 2.0 * sigma_f),
            sensible: sensible_heat(f.density, tf, tc, self.leaf_resistance),
            latent: latent_heat * vapor,
            vapor,
            canopy_air_temp: tc,
            canopy_vp: ec,
        })
    }
}

/// Solve foliage temperature, canopy air temperature and canopy vapour
/// pressure for an overstory above snow, updating intercepted snow and
/// liquid. `stress` is the root-weighted soil moisture stress.
#[allow(clippy::too_many_arguments)]
pub fn canopy_energy_balance(
    view: &CanopyView,
    f: &CanopyForcing,
    snow_canopy: &mut f64,
    veg_var: &mut VegVarState,
    stress: f64,
    wind_h: f64,
    measure_h: f64,
    solver: &SolverSettings,
) -> VicResult<CanopyBalance> {
    let dt = f.dt_hours * SEC_PER_HOUR;
    let above = ExchangeGeometry::new(wind_h, measure_h, view.roughness);
    let under_wind = f.wind * view.wind_factor();
    let ground_geom = ExchangeGeometry::new(wind_h, measure_h, SNOW_ROUGHNESS);
    let ground_resistance = ground_geom.resistance(f.air_temp, f.ground_temp, under_wind.max(SMALL));
    let leaf_resistance = above.resistance(f.air_temp, f.air_temp, f.wind);
    let snow_covered = *snow_canopy > 0.0;
    let wet = snow_covered || veg_var.wdew > 0.0;
    let stomatal = if wet {
        0.0
    } else if view.lai > 0.0 && stress > 0.0 {
        view.rarc + view.rmin / (view.lai * stress)
    } else {
        HUGE_RESIST
    };
    let problem = CanopyProblem {
        view,
        f,
        above,
        ground_resistance,
        leaf_resistance,
        stomatal,
        snow_covered,
        solver,
    };

    let lf_rho = LF * RHO_W;
    let mut drip = 0.0;
    let at_melt = if snow_covered { Some(problem.terms(0.0)?) } else { None };
    let (foliage_temp, terms) = match at_melt {
        Some(terms) if terms.residual() >= 0.0 => {
            // Foliage held at 0 C while intercepted snow melts
            let melt = (terms.residual() * dt / lf_rho).min(*snow_canopy);
            *snow_canopy -= melt;
            drip = melt;
            log::trace!("canopy snow melt {:.3e} m", melt);
            (0.0, terms)
        }
        _ => {
            let mut failure: Option<VicError> = None;
            let found = solver.root.solve_about_within(
                f.air_temp,
                solver.brackets.surf_dt,
                solver.brackets.temp_limits(),
                |tf| match problem.terms(tf) {
                    Ok(t) => t.residual(),
                    Err(e) => {
                        failure.get_or_insert(e);
                        f64::NAN
                    }
                },
            );
            if let Some(e) = failure {
                return Err(e);
            }
            let root = found.map_err(|e| VicError::solver(SolveVariable::FoliageTemperature, e))?;
            (root.value, problem.terms(root.value)?)
        }
    };

    // Vapour leaves the intercepted snow first, then the liquid store
    let mut water = terms.vapor * dt; // kg/m^2 = mm
    let mut sublimation = 0.0;
    if snow_covered {
        sublimation = (water / RHO_W).min(*snow_canopy);
        *snow_canopy -= sublimation;
        water -= sublimation * RHO_W;
    }
    let from_dew = if water > 0.0 { water.min(veg_var.wdew) } else { water };
    veg_var.wdew -= from_dew;
    veg_var.canopy_evap += from_dew;

    let tau = view.transmittance();
    let sigma_f = STEFAN_B * (foliage_temp + KELVIN).powi(4);
    Ok(CanopyBalance {
        foliage_temp,
        canopy_air_temp: terms.canopy_air_temp,
        canopy_vp: terms.canopy_vp,
        net_short: terms.net_short,
        net_long: terms.net_long,
        sensible: terms.sensible,
        latent: terms.latent,
        sublimation,
        transpiration: water - from_dew,
        drip,
        under_shortwave: tau * f.shortwave,
        under_longwave: tau * f.longwave + (1.0 - tau) * view.emissivity * sigma_f,
        under_wind,
    })
}
