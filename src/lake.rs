// Lake volume and temperature/ice balance for the lake fraction of a cell.

use serde::{Deserialize, Serialize};

use crate::atmos::{
    latent_heat_sublimation, latent_heat_vaporization, net_longwave, sensible_heat, svp, vapor_flux,
    ExchangeGeometry,
};
use crate::config::{GlobalParams, SolverSettings};
use crate::constants::*;
use crate::error::{SolveVariable, VicError, VicResult};
use crate::forcing::AtmosRecord;
use crate::root::{RootSolver, Widen};
use crate::thermal::tridiag;

// ═══════════════════════════════════════════════════════════════════════
// Parameters
// ═══════════════════════════════════════════════════════════════════════

/// Basin shape: surface area as a function of depth above the lake bed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Bathymetry {
    /// Levels `z` (m above the bed, increasing from 0) with areas `area` (m^2).
    Profile { z: Vec<f64>, area: Vec<f64> },
    /// `area = max_area * (depth / max_depth)^b`.
    PowerLaw { max_depth: f64, max_area: f64, b: f64 },
}

impl Bathymetry {
    pub fn max_depth(&self) -> f64 {
        match self {
            Bathymetry::Profile { z, .. } => z.last().copied().unwrap_or(0.0),
            Bathymetry::PowerLaw { max_depth, .. } => *max_depth,
        }
    }

    pub fn area(&self, depth: f64) -> f64 {
        let depth = depth.clamp(0.0, self.max_depth());
        match self {
            Bathymetry::Profile { z, area } => {
                for k in 1..z.len() {
                    if depth <= z[k] {
                        let w = (depth - z[k - 1]) / (z[k] - z[k - 1]);
                        return area[k - 1] + w * (area[k] - area[k - 1]);
                    }
                }
                area.last().copied().unwrap_or(0.0)
            }
            Bathymetry::PowerLaw { max_depth, max_area, b } => max_area * (depth / max_depth).powf(*b),
        }
    }

    pub fn volume(&self, depth: f64) -> f64 {
        let depth = depth.clamp(0.0, self.max_depth());
        match self {
            Bathymetry::Profile { z, area } => {
                let mut vol = 0.0;
                for k in 1..z.len() {
                    let top = depth.min(z[k]);
                    if top <= z[k - 1] {
                        break;
                    }
                    let a_top = area[k - 1] + (top - z[k - 1]) / (z[k] - z[k - 1]) * (area[k] - area[k - 1]);
                    vol += 0.5 * (area[k - 1] + a_top) * (top - z[k - 1]);
                }
                vol
            }
            Bathymetry::PowerLaw { max_depth, max_area, b } => {
                max_area * max_depth / (b + 1.0) * (depth / max_depth).powf(b + 1.0)
            }
        }
    }

    pub fn max_volume(&self) -> f64 {
        self.volume(self.max_depth())
    }

    /// Depth holding `volume` m^3.
    pub fn depth_from_volume(&self, volume: f64) -> VicResult<f64> {
        let max_vol = self.max_volume();
        if volume <= 0.0 {
            return Ok(0.0);
        }
        if volume >= max_vol {
            return Ok(self.max_depth());
        }
        let solver = RootSolver {
            tolerance: 1.0e-10,
            min_step: 1.0e-9,
            ..RootSolver::default()
        };
        let root = solver
            .brent(0.0, self.max_depth(), |d| (self.volume(d) - volume) / max_vol)
            .map_err(|e| VicError::solver(SolveVariable::LakeSurfaceTemperature, e))?;
        Ok(root.value)
    }

    fn validate(&self) -> VicResult<()> {
        match self {
            Bathymetry::Profile { z, area } => {
                if z.len() < 2 || z.len() != area.len() {
                    return Err(VicError::Shape {
                        name: "lake profile",
                        expected: z.len().max(2),
                        actual: area.len(),
                    });
                }
                if z[0] != 0.0 || z.windows(2).any(|w| w[1] <= w[0]) {
                    return Err(VicError::parameter("z", z[0], "levels must start at 0 and increase"));
                }
                if area.windows(2).any(|w| w[1] < w[0]) || area.iter().any(|a| *a < 0.0) {
                    return Err(VicError::parameter("area", area[0], "areas must not shrink upward"));
                }
            }
            Bathymetry::PowerLaw { max_depth, max_area, b } => {
                if !(*max_depth > 0.0 && *max_area > 0.0 && *b > 0.0) {
                    return Err(VicError::parameter("b", *b, "power-law basin needs positive size"));
                }
            }
        }
        Ok(())
    }
}

fn default_lake_nodes() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LakeParams {
    pub fraction: f64,       // share of the cell held by the lake tile
    pub wetland_veg: usize,  // vegetation tile the lake is carved from
    pub bathymetry: Bathymetry,
    pub mindepth: f64,       // no outflow below this depth (m)
    pub maxrate: f64,        // outflow rate at full depth (m^3/s)
    pub rpercent: f64,       // share of land runoff entering the lake
    pub bpercent: f64,       // share of land baseflow entering the lake
    pub depth_in: f64,       // initial depth (m)
    #[serde(default = "default_lake_nodes")]
    pub nodes: usize,
}

impl LakeParams {
    pub fn validate(&self) -> VicResult<()> {
        self.bathymetry.validate()?;
        if !(0.0..1.0).contains(&self.fraction) {
            return Err(VicError::parameter("lake fraction", self.fraction, "must lie in [0, 1)"));
        }
        for (field, v) in [("rpercent", self.rpercent), ("bpercent", self.bpercent)] {
            if !(0.0..=1.0).contains(&v) {
                return Err(VicError::parameter(field, v, "must lie in [0, 1]"));
            }
        }
        if self.mindepth < 0.0 || self.mindepth > self.bathymetry.max_depth() {
            return Err(VicError::parameter("mindepth", self.mindepth, "must lie within the basin"));
        }
        if self.depth_in < 0.0 || self.depth_in > self.bathymetry.max_depth() {
            return Err(VicError::parameter("depth_in", self.depth_in, "must lie within the basin"));
        }
        if self.nodes < 2 {
            return Err(VicError::parameter("lake nodes", self.nodes as f64, "at least two nodes"));
        }
        Ok(())
    }

    pub fn initial_state(&self, water_temp: f64) -> VicResult<LakeState> {
        let b = &self.bathymetry;
        let volume = b.volume(self.depth_in);
        let t = water_temp.max(0.0);
        Ok(LakeState {
            volume,
            depth: self.depth_in,
            area: b.area(self.depth_in),
            temps: vec![t; self.nodes],
            ice_vol: 0.0,
            fraction_ice: 0.0,
            hice: 0.0,
            tempi: 0.0,
            snow_vol: 0.0,
            surf_temp: t,
            mixmax: 0,
            evap: 0.0,
            outflow: 0.0,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// State
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LakeState {
    pub volume: f64,       // liquid water (m^3)
    pub depth: f64,        // m
    pub area: f64,         // m^2
    pub temps: Vec<f64>,   // node temperatures, top first (C)
    pub ice_vol: f64,      // m^3 of ice
    pub fraction_ice: f64, // ice-covered share of the surface
    pub hice: f64,         // ice thickness over the covered part (m)
    pub tempi: f64,        // ice surface temperature (C)
    pub snow_vol: f64,     // snow on ice, water equivalent (m^3)
    pub surf_temp: f64,    // area-weighted surface temperature (C)
    pub mixmax: usize,     // deepest node reached by convective mixing
    pub evap: f64,         // step evaporation (m^3)
    pub outflow: f64,      // step outflow (m^3)
}

impl LakeState {
    /// Water equivalent of everything the basin holds (m^3).
    pub fn total_water(&self) -> f64 {
        self.volume + self.ice_vol * RHO_ICE / RHO_W + self.snow_vol
    }

    /// Storage as mm over an area of `cell_area` m^2.
    pub fn storage_mm(&self, cell_area: f64) -> f64 {
        self.total_water() / cell_area * 1000.0
    }

    fn refresh_ice_cover(&mut self) {
        if self.ice_vol <= 0.0 || self.area <= 0.0 {
            self.ice_vol = 0.0;
            self.fraction_ice = 0.0;
            self.hice = 0.0;
            return;
        }
        self.fraction_ice = (self.ice_vol / (self.area * FRAC_LIM)).min(1.0);
        self.hice = self.ice_vol / (self.fraction_ice * self.area);
    }
}

/// Ice volume (m^3) that `volume` m^3 of liquid can freeze into.
fn liquid_as_ice(volume: f64) -> f64 {
    volume.max(0.0) * RHO_W / RHO_ICE
}

/// Water density (kg/m^3) after Hostetler.
pub fn water_density(t: f64) -> f64 {
    1000.0 * (1.0 - 1.9549e-5 * (t - 3.84).abs().powf(1.68))
}

/// Mix from the top down while the column is unstable; returns the deepest
/// node touched.
pub fn convective_mix(temps: &mut [f64]) -> usize {
    let mut mixmax = 0;
    let n = temps.len();
    let mut k = 0;
    while k + 1 < n {
        if water_density(temps[k]) > water_density(temps[k + 1]) + 1.0e-9 {
            let mean = temps[..=k + 1].iter().sum::<f64>() / (k + 2) as f64;
            for t in temps[..=k + 1].iter_mut() {
                *t = mean;
            }
            mixmax = mixmax.max(k + 1);
            k = 0;
            continue;
        }
        k += 1;
    }
    mixmax
}

// ═══════════════════════════════════════════════════════════════════════
// Lake step
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LakeFlux {
    pub net_short: f64, // W/m^2 over the lake surface
    pub net_long: f64,
    pub sensible: f64,
    pub latent: f64,
    pub evap: f64,      // mm over the lake tile
    pub outflow: f64,   // m^3
    pub ice_growth: f64, // m^3 of ice formed (negative when melting)
    pub error: f64,
}

/// Inputs of one lake step.
pub struct LakeInputs<'a> {
    pub record: &'a AtmosRecord,
    pub rain: f64,     // mm over the lake tile
    pub snow: f64,     // mm over the lake tile
    pub inflow: f64,   // m^3 from the land fraction
    pub tile_area: f64, // m^2
    pub global: &'a GlobalParams,
    pub solver: &'a SolverSettings,
}

pub fn lake_step(params: &LakeParams, state: &mut LakeState, input: &LakeInputs) -> VicResult<LakeFlux> {
    let dt = input.global.dt_seconds();
    let rec = input.record;
    let geom = ExchangeGeometry::new(input.global.wind_h, input.global.measure_h, LAKE_ROUGHNESS);
    let mut flux = LakeFlux::default();
    let lf_ice = LF * RHO_ICE;

    let n = state.temps.len();
    let dz = (state.depth / n as f64).max(LAKE_MIN_SURF_DZ);
    let fi = state.fraction_ice;
    let area = state.area;

    // ─── Open water ───
    let mut evap_vol = 0.0; // from liquid water
    let mut sublimation_vol = 0.0; // already taken from snow and ice
    if fi < 1.0 && area > 0.0 {
        let t_top = state.temps[0];
        let cap = CH_WATER * dz / dt;
        let terms = |t: f64| {
            let ra = geom.resistance(rec.air_temp, t, rec.wind);
            let e = vapor_flux(rec.density, rec.pressure, svp(t), rec.vp, ra);
            let sw = (1.0 - LAKE_WATER_ALBEDO) * rec.shortwave;
            let lw = net_longwave(rec.longwave, LAKE_EMISSIVITY, t);
            let h = sensible_heat(rec.density, t, rec.air_temp, ra);
            let le = latent_heat_vaporization(t) * e;
            (sw, lw, h, le, e)
        };
        let residual = |t: f64| {
            let (sw, lw, h, le, _) = terms(t);
            sw + lw - h - le - cap * (t - t_top)
        };
        let open = 1.0 - fi;
        let r0 = residual(0.0);
        let t_open = if r0 <= 0.0 {
            // Skin held at freezing; the deficit forms new ice
            let wanted = -r0 * dt / lf_ice * open * area;
            let new_ice = wanted.min(liquid_as_ice(state.volume));
            state.ice_vol += new_ice;
            state.volume -= new_ice * RHO_ICE / RHO_W;
            flux.ice_growth += new_ice;
            flux.error -= (wanted - new_ice) * lf_ice / (area * dt);
            0.0
        } else {
            let limits = input.solver.brackets.temp_limits();
            let upper = t_top.max(0.0) + input.solver.brackets.surf_dt;
            let root = input
                .solver
                .root
                .solve_within(0.0, upper, Widen::Upper, limits, residual)
                .map_err(|e| VicError::solver(SolveVariable::LakeSurfaceTemperature, e))?;
            flux.error += open * root.residual;
            root.value
        };
        let (sw, lw, h, le, e) = terms(t_open);
        flux.net_short += open * sw;
        flux.net_long += open * lw;
        flux.sensible += open * h;
        flux.latent += open * le;
        evap_vol += e * dt / RHO_W * open * area;

        // Ice-covered share of the top node sits at the freezing point
        state.temps[0] = open * t_open;
    }

    // ─── Ice cover ───
    let mut t_ice = state.tempi;
    if fi > 0.0 && area > 0.0 {
        let covered = fi * area;
        let snow_depth = state.snow_vol / covered * RHO_W / SNOW_MAX_DENSITY_COLD;
        let k_snow = K_SNOW * SNOW_MAX_DENSITY_COLD.powi(2);
        let conductance = 1.0 / (state.hice / K_ICE + snow_depth / k_snow);
        let albedo = if state.snow_vol > 0.0 { NEW_SNOW_ALB } else { LAKE_ICE_ALBEDO };
        let terms = |t: f64| {
            let ra = geom.resistance(rec.air_temp, t, rec.wind);
            let e = vapor_flux(rec.density, rec.pressure, svp(t), rec.vp, ra);
            let sw = (1.0 - albedo) * rec.shortwave;
            let lw = net_longwave(rec.longwave, LAKE_EMISSIVITY, t);
            let h = sensible_heat(rec.density, t, rec.air_temp, ra);
            let le = latent_heat_sublimation(t) * e;
            (sw, lw, h, le, e)
        };
        let residual = |t: f64| {
            let (sw, lw, h, le, _) = terms(t);
            sw + lw - h - le + conductance * (0.0 - t)
        };
        let r0 = residual(0.0);
        let mut melt_energy = 0.0; // J/m^2 at the top surface
        if r0 >= 0.0 {
            t_ice = 0.0;
            melt_energy = r0 * dt;
        } else {
            let lower = state.tempi.min(0.0) - input.solver.brackets.surf_dt;
            let limits = input.solver.brackets.temp_limits();
            let root = input
                .solver
                .root
                .solve_within(lower, 0.0, Widen::Lower, limits, residual)
                .map_err(|e| VicError::solver(SolveVariable::LakeIceTemperature, e))?;
            t_ice = root.value;
            flux.error += fi * root.residual;
        }
        let (sw, lw, h, le, e) = terms(t_ice);
        flux.net_short += fi * sw;
        flux.net_long += fi * lw;
        flux.sensible += fi * h;
        flux.latent += fi * le;

        // Bottom growth from conduction, sublimation from the top
        let wanted_growth = conductance * (0.0 - t_ice) * dt / lf_ice * covered;
        let mut sublimated = e * dt / RHO_W * covered;
        if sublimated > 0.0 {
            let from_snow = sublimated.min(state.snow_vol);
            state.snow_vol -= from_snow;
            sublimated -= from_snow;
            let from_ice = (sublimated * RHO_W / RHO_ICE).min(state.ice_vol);
            state.ice_vol -= from_ice;
            sublimation_vol += from_snow + from_ice * RHO_ICE / RHO_W;
        } else {
            state.snow_vol -= sublimated;
            sublimation_vol += sublimated;
        }

        // Surface melt: snow on the ice first
        let mut melt_water = 0.0;
        if melt_energy > 0.0 {
            let snow_melt = (melt_energy / (LF * RHO_W) * covered).min(state.snow_vol);
            state.snow_vol -= snow_melt;
            melt_water += snow_melt;
            let left = melt_energy - snow_melt / covered * LF * RHO_W;
            let ice_melt = (left / lf_ice * covered).min(state.ice_vol);
            state.ice_vol -= ice_melt;
            melt_water += ice_melt * RHO_ICE / RHO_W;
            flux.ice_growth -= ice_melt;
        }
        state.volume += melt_water;
        let growth = wanted_growth.min(liquid_as_ice(state.volume));
        state.ice_vol += growth;
        flux.ice_growth += growth;
        state.volume -= growth * RHO_ICE / RHO_W;
        flux.error -= (wanted_growth - growth) * lf_ice / (area * dt);

        // Warm water below the ice melts it from beneath
        if state.temps[0] > 0.0 && state.ice_vol > 0.0 {
            let heat = CH_WATER * dz * state.temps[0] * covered;
            let melt = (heat / lf_ice).min(state.ice_vol);
            state.ice_vol -= melt;
            state.volume += melt * RHO_ICE / RHO_W;
            flux.ice_growth -= melt;
            state.temps[0] -= melt * lf_ice / (CH_WATER * dz * covered);
        }
    }
    state.tempi = t_ice;

    // ─── Mixing and diffusion ───
    state.mixmax = convective_mix(&mut state.temps);
    let kd = LAKE_DIFFUSIVITY + LAKE_EDDY_DIFFUSIVITY * rec.wind * (1.0 - fi);
    let r = kd * dt / (dz * dz);
    let mut a = vec![-r; n];
    let mut b = vec![1.0 + 2.0 * r; n];
    let mut c = vec![-r; n];
    a[0] = 0.0;
    c[n - 1] = 0.0;
    b[0] = 1.0 + r;
    b[n - 1] = 1.0 + r;
    let rhs = state.temps.clone();
    tridiag(&a, &b, &c, &rhs, &mut state.temps);
    for t in state.temps.iter_mut() {
        *t = t.max(0.0);
    }

    // ─── Water balance ───
    let tile_area = input.tile_area;
    let snow_vol = input.snow / 1000.0 * tile_area;
    let rain_vol = input.rain / 1000.0 * tile_area;
    if state.fraction_ice > 0.0 {
        let on_ice = snow_vol * state.fraction_ice * area / tile_area.max(area);
        state.snow_vol += on_ice;
        state.volume += snow_vol - on_ice;
    } else {
        state.volume += snow_vol;
    }
    state.volume += rain_vol + input.inflow;
    let open_evap = if evap_vol > 0.0 { evap_vol.min(state.volume.max(0.0)) } else { evap_vol };
    state.volume -= open_evap;

    let total = state.total_water();
    state.depth = params.bathymetry.depth_from_volume(total)?;
    let mut outflow = 0.0;
    if state.depth > params.mindepth {
        let excess = total - params.bathymetry.volume(params.mindepth);
        let max_depth = params.bathymetry.max_depth();
        let scale = ((state.depth - params.mindepth) / (max_depth - params.mindepth).max(SMALL)).min(1.0);
        outflow = (params.maxrate * scale * dt).min(excess).min(state.volume);
    }
    // Spill above the basin rim
    let spill = (state.total_water() - outflow - params.bathymetry.max_volume()).max(0.0);
    outflow += spill;
    state.volume -= outflow;
    state.depth = params.bathymetry.depth_from_volume(state.total_water())?;
    state.area = params.bathymetry.area(state.depth);
    state.refresh_ice_cover();

    state.surf_temp = (1.0 - state.fraction_ice) * state.temps[0] + state.fraction_ice * state.tempi;
    state.evap = open_evap + sublimation_vol;
    state.outflow = outflow;
    flux.evap = state.evap / tile_area * 1000.0;
    flux.outflow = outflow;
    Ok(flux)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn params() -> LakeParams {
        LakeParams {
            fraction: 0.1,
            wetland_veg: 0,
            bathymetry: Bathymetry::PowerLaw {
                max_depth: 10.0,
                max_area: 1.0e6,
                b: 1.0,
            },
            mindepth: 2.0,
            maxrate: 5.0,
            rpercent: 0.5,
            bpercent: 0.5,
            depth_in: 5.0,
            nodes: 8,
        }
    }

    fn inputs<'a>(rec: &'a AtmosRecord, global: &'a GlobalParams, solver: &'a SolverSettings) -> LakeInputs<'a> {
        LakeInputs {
            record: rec,
            rain: 0.0,
            snow: 0.0,
            inflow: 0.0,
            tile_area: 1.0e6,
            global,
            solver,
        }
    }

    #[test]
    fn profile_and_power_law_agree_for_a_cone() {
        let cone = Bathymetry::PowerLaw {
            max_depth: 10.0,
            max_area: 100.0,
            b: 1.0,
        };
        let profile = Bathymetry::Profile {
            z: vec![0.0, 5.0, 10.0],
            area: vec![0.0, 50.0, 100.0],
        };
        assert_abs_diff_eq!(cone.volume(10.0), profile.volume(10.0), epsilon = 1e-9);
        let d = profile.depth_from_volume(cone.volume(7.0)).unwrap();
        assert_abs_diff_eq!(d, 7.0, epsilon = 1e-4);
    }

    #[test]
    fn unstable_column_is_mixed() {
        // Densest water (near 4 C) on top sinks through the whole column
        let mut temps = vec![4.0, 1.0, 0.5];
        let mixmax = convective_mix(&mut temps);
        assert_eq!(mixmax, 2);
        for t in &temps {
            assert_abs_diff_eq!(*t, 5.5 / 3.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn stable_column_is_left_alone() {
        let mut temps = vec![2.0, 3.0, 3.8];
        assert_eq!(convective_mix(&mut temps), 0);
        assert_eq!(temps, vec![2.0, 3.0, 3.8]);
    }

    #[test]
    fn cold_air_freezes_the_surface() {
        let p = params();
        let mut state = p.initial_state(0.5).unwrap();
        let rec = AtmosRecord::new(-25.0, 0.0, 0.0, 180.0, 95.0, 0.05, 4.0);
        let global = GlobalParams::default();
        let solver = SolverSettings::default();
        for _ in 0..10 {
            lake_step(&p, &mut state, &inputs(&rec, &global, &solver)).unwrap();
        }
        assert!(state.ice_vol > 0.0);
        assert!(state.fraction_ice > 0.0 && state.fraction_ice <= 1.0);
        assert!(state.tempi <= 0.0);
        assert!(state.temps.iter().all(|t| *t >= 0.0));
    }

    #[test]
    fn shallow_lake_freezes_without_running_dry() {
        let p = LakeParams {
            depth_in: 0.05,
            ..params()
        };
        let mut state = p.initial_state(0.5).unwrap();
        let start = state.total_water();
        let rec = AtmosRecord::new(-30.0, 0.0, 0.0, 150.0, 95.0, 0.03, 5.0);
        let global = GlobalParams::default();
        let solver = SolverSettings::default();
        let mut vapour = 0.0;
        for _ in 0..20 {
            let f = lake_step(&p, &mut state, &inputs(&rec, &global, &solver)).unwrap();
            vapour += state.evap;
            assert!(state.volume >= 0.0);
            assert!(state.ice_vol * RHO_ICE / RHO_W <= start + 1e-9);
            assert_eq!(f.outflow, 0.0);
            assert!(state.temps.iter().all(|t| *t >= 0.0));
        }
        assert!(state.ice_vol > 0.0);
        assert!(state.tempi < 0.0);
        assert_abs_diff_eq!(state.total_water() + vapour, start, epsilon = 1e-9);
    }

    #[test]
    fn cold_open_water_holds_at_freezing() {
        let p = params();
        let mut state = p.initial_state(0.0).unwrap();
        let rec = AtmosRecord::new(-30.0, 0.0, 0.0, 150.0, 95.0, 0.03, 5.0);
        let global = GlobalParams::default();
        let solver = SolverSettings::default();
        let f = lake_step(&p, &mut state, &inputs(&rec, &global, &solver)).unwrap();
        assert!(f.ice_growth > 0.0);
        assert_eq!(f.error, 0.0);
        assert_eq!(state.temps[0], 0.0);
    }

    #[test]
    fn outflow_stops_at_min_depth_and_water_is_conserved() {
        let p = params();
        let mut state = p.initial_state(10.0).unwrap();
        let rec = AtmosRecord::new(10.0, 0.0, 0.0, 330.0, 95.0, 1.2, 0.0);
        let global = GlobalParams::default();
        let solver = SolverSettings::default();
        let mut prev = state.total_water();
        for _ in 0..100 {
            let f = lake_step(&p, &mut state, &inputs(&rec, &global, &solver)).unwrap();
            let now = state.total_water();
            assert_abs_diff_eq!(prev - now, f.outflow + state.evap, epsilon = 1e-3);
            prev = now;
        }
        assert!(state.depth >= p.mindepth - 1e-6);
    }
}
