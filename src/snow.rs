// Ground snow pack: accumulation, two-layer energy balance with melt and
// refreeze, liquid water routing, compaction, albedo ageing and areal
// depletion. Mass terms are metres of water; the pack physics works on
// quantities local to the snow-covered area and converts at the edges.

use serde::{Deserialize, Serialize};

use crate::atmos::{latent_heat_sublimation, net_longwave, sensible_heat, svp, vapor_flux, ExchangeGeometry};
use crate::config::{ModelOptions, SolverSettings};
use crate::constants::*;
use crate::error::{SolveVariable, VicError, VicResult};
use crate::root::Widen;

// ═══════════════════════════════════════════════════════════════════════
// State
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnowPackState {
    pub swq: f64,         // area-mean snow water equivalent incl. liquid (m)
    pub surf_water: f64,  // liquid in the surface layer, local (m)
    pub pack_water: f64,  // liquid in the pack layer, local (m)
    pub surf_temp: f64,   // surface layer temperature (C)
    pub pack_temp: f64,   // pack layer temperature (C)
    pub density: f64,     // kg/m^3
    pub depth: f64,       // local depth (m)
    pub coldcontent: f64, // surface layer cold content (J/m^2)
    pub coverage: f64,    // snow-covered fraction
    pub max_swq: f64,     // largest swq of the current season (m)
    pub store_swq: f64,   // fresh snow sitting above the depletion curve (m)
    pub swq_slope: f64,   // depletion curve scale (m)
    pub last_snow: usize, // snow steps since the last snowfall
    pub melting: bool,
    pub albedo: f64,
    pub snow_canopy: f64, // intercepted snow (m)
    pub vapor_flux: f64,  // sublimation from the pack this step (m, area mean)
    pub blowing_flux: f64, // blowing snow sublimation this step (m, area mean)
    pub canopy_vapor_flux: f64, // sublimation from the canopy this step (m)
    pub melt: f64,        // melt water released this step (mm, area mean)
    pub mass_error: f64,  // m
}

impl Default for SnowPackState {
    fn default() -> Self {
        SnowPackState {
            swq: 0.0,
            surf_water: 0.0,
            pack_water: 0.0,
            surf_temp: 0.0,
            pack_temp: 0.0,
            density: 0.0,
            depth: 0.0,
            coldcontent: 0.0,
            coverage: 0.0,
            max_swq: 0.0,
            store_swq: 0.0,
            swq_slope: 0.0,
            last_snow: 0,
            melting: false,
            albedo: NEW_SNOW_ALB,
            snow_canopy: 0.0,
            vapor_flux: 0.0,
            blowing_flux: 0.0,
            canopy_vapor_flux: 0.0,
            melt: 0.0,
            mass_error: 0.0,
        }
    }
}

impl SnowPackState {
    pub fn has_snow(&self) -> bool {
        self.swq > 0.0
    }

    /// Water held by the pack and the canopy (m, area mean).
    pub fn total_water(&self) -> f64 {
        self.swq + self.snow_canopy
    }

    /// Reset the step accumulators.
    pub fn begin_step(&mut self) {
        self.vapor_flux = 0.0;
        self.blowing_flux = 0.0;
        self.canopy_vapor_flux = 0.0;
        self.melt = 0.0;
        self.mass_error = 0.0;
    }

    /// Change the covered fraction keeping area-mean storage fixed.
    fn spread(&mut self, new_coverage: f64) {
        if new_coverage <= 0.0 || self.coverage <= 0.0 {
            self.coverage = new_coverage;
            return;
        }
        let factor = self.coverage / new_coverage;
        self.surf_water *= factor;
        self.pack_water *= factor;
        self.depth *= factor;
        self.coverage = new_coverage;
    }

    fn clear(&mut self) {
        let keep = SnowPackState {
            snow_canopy: self.snow_canopy,
            vapor_flux: self.vapor_flux,
            blowing_flux: self.blowing_flux,
            canopy_vapor_flux: self.canopy_vapor_flux,
            melt: self.melt,
            mass_error: self.mass_error,
            ..SnowPackState::default()
        };
        *self = keep;
    }

    /// Heat conductance between the pack and the ground (W/m^2/K, local).
    pub fn conductance(&self) -> f64 {
        if !self.has_snow() {
            return 0.0;
        }
        K_SNOW * self.density.powi(2) / self.depth.max(MIN_SNOW_COND_DEPTH)
    }

    /// Temperature of the layer in contact with the ground.
    pub fn bottom_temp(&self) -> f64 {
        if self.local_ice_split().1 > 0.0 {
            self.pack_temp
        } else {
            self.surf_temp
        }
    }

    /// Local (surface, pack) ice amounts.
    fn local_ice_split(&self) -> (f64, f64) {
        if self.coverage <= 0.0 {
            return (0.0, 0.0);
        }
        let ice = (self.swq / self.coverage - self.surf_water - self.pack_water).max(0.0);
        let surf = ice.min(MAX_SURFACE_SWE);
        (surf, ice - surf)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Snowfall and pack properties
// ═══════════════════════════════════════════════════════════════════════

/// Split precipitation into (rain, snow) linearly between the thresholds.
pub fn partition_precip(prec: f64, air_temp: f64, max_snow_temp: f64, min_rain_temp: f64) -> (f64, f64) {
    if air_temp < min_rain_temp {
        (0.0, prec)
    } else if air_temp > max_snow_temp {
        (prec, 0.0)
    } else if max_snow_temp - min_rain_temp <= SMALL {
        (prec, 0.0)
    } else {
        let rain_frac = (air_temp - min_rain_temp) / (max_snow_temp - min_rain_temp);
        (prec * rain_frac, prec * (1.0 - rain_frac))
    }
}

/// Density of fresh snow (kg/m^3) at air temperature `t` (C).
pub fn new_snow_density(t: f64) -> f64 {
    (67.92 + 51.25 * (t / 2.59).exp()).min(SNOW_MAX_DENSITY_COLD)
}

/// Albedo decay with snow age (days); slower curve while the pack is cold.
pub fn snow_albedo(age_days: f64, melting: bool) -> f64 {
    if age_days <= 0.0 {
        return NEW_SNOW_ALB;
    }
    if melting {
        NEW_SNOW_ALB * SNOW_ALB_THAW_A.powf(age_days.powf(SNOW_ALB_THAW_B))
    } else {
        NEW_SNOW_ALB * SNOW_ALB_ACCUM_A.powf(age_days.powf(SNOW_ALB_ACCUM_B))
    }
}

/// Blowing snow sublimation rate (m/s) above the transport threshold.
pub fn blowing_rate(wind: f64, air_temp: f64, vp: f64, fetch: f64) -> f64 {
    let threshold = 6.975 + 0.0033 * (air_temp + 27.27).powi(2);
    if wind <= threshold {
        return 0.0;
    }
    let deficit = (1.0 - vp / svp(air_temp)).clamp(0.0, 1.0);
    BLOWING_RATE * (wind - threshold) * deficit * (fetch / BLOWING_FETCH_SCALE).min(1.0)
}

// ═══════════════════════════════════════════════════════════════════════
// Snow step
// ═══════════════════════════════════════════════════════════════════════

/// Drivers for one snow sub-step at the pack surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnowForcing {
    pub air_temp: f64,
    pub shortwave: f64,
    pub longwave: f64,
    pub vp: f64,
    pub pressure: f64,
    pub density: f64,
    pub wind: f64,
    pub rain: f64,        // m reaching the ground, area mean
    pub snowfall: f64,    // m reaching the ground, area mean
    pub ground_temp: f64, // soil surface temperature (C)
    pub dt_hours: f64,
}

/// Mass (m, area mean) and energy (W/m^2, local, upward positive for
/// turbulent terms) terms of one snow sub-step.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SnowFlux {
    pub outflow: f64,
    pub melt: f64,        // melt water released by the pack
    pub refreeze: f64,
    pub vapor: f64,
    pub blowing: f64,
    pub net_short: f64,
    pub net_long: f64,
    pub sensible: f64,
    pub latent: f64,
    pub advected: f64,
    pub ground: f64,
    pub delta_cc: f64,
    pub energy_error: f64,
    pub melt_out: f64,      // W/m^2 area mean left over once the local ice is gone
    pub coverage: f64,      // after the step
    pub step_coverage: f64, // coverage the local energy terms applied to
}

struct SurfaceEnergy<'a> {
    f: &'a SnowForcing,
    geometry: &'a ExchangeGeometry,
    albedo: f64,
    surf_ice: f64,
    old_temp: f64,
    rain_local: f64,
    conductance: f64, // ground coupling of a surface-only pack
    dt: f64,
}

struct SurfaceTerms {
    net_short: f64,
    net_long: f64,
    sensible: f64, // upward
    latent: f64,   // upward
    vapor: f64,    // kg/m^2/s, positive away from the pack
    advected: f64,
    ground: f64,   // into the layer
    delta_cc: f64,
}

impl SurfaceTerms {
    fn residual(&self) -> f64 {
        self.net_short + self.net_long - self.sensible - self.latent + self.advected + self.ground
            - self.delta_cc
    }
}

impl SurfaceEnergy<'_> {
    fn terms(&self, ts: f64) -> SurfaceTerms {
        let f = self.f;
        let ra = self.geometry.resistance(f.air_temp, ts, f.wind);
        let vapor = vapor_flux(f.density, f.pressure, svp(ts), f.vp, ra);
        SurfaceTerms {
            net_short: (1.0 - self.albedo) * f.shortwave,
            net_long: net_longwave(f.longwave, 1.0, ts),
            sensible: sensible_heat(f.density, ts, f.air_temp, ra),
            latent: latent_heat_sublimation(ts) * vapor,
            vapor,
            advected: CH_WATER * self.rain_local * f.air_temp.max(0.0) / self.dt,
            ground: self.conductance * (f.ground_temp - ts),
            delta_cc: CH_ICE * self.surf_ice * (ts - self.old_temp) / self.dt,
        }
    }
}

/// Advance the pack over one snow sub-step.
pub fn snow_step(
    state: &mut SnowPackState,
    f: &SnowForcing,
    geometry: &ExchangeGeometry,
    fetch: f64,
    options: &ModelOptions,
    solver: &SolverSettings,
) -> VicResult<SnowFlux> {
    let dt = f.dt_hours * SEC_PER_HOUR;
    let mut flux = SnowFlux::default();
    let old_swq = state.swq;

    if state.swq <= 0.0 && f.snowfall <= 0.0 {
        flux.outflow = f.rain;
        return Ok(flux);
    }

    // ─── Fresh snow ───
    let t_new = f.air_temp.min(0.0);
    if f.snowfall > 0.0 {
        if state.swq <= 0.0 {
            state.clear();
            state.coverage = 1.0;
            state.surf_temp = t_new;
            state.pack_temp = t_new;
            state.density = new_snow_density(f.air_temp);
        } else if state.coverage < 1.0 {
            state.spread(1.0);
        }
        if f.snowfall > TRACE_SNOW {
            state.last_snow = 0;
        }
    } else {
        state.last_snow += 1;
    }

    let c = state.coverage;
    let (mut surf_ice, mut pack_ice) = state.local_ice_split();
    let mut surf_water = state.surf_water;
    let mut pack_water = state.pack_water;
    if pack_ice <= 0.0 {
        surf_water += pack_water;
        pack_water = 0.0;
    }

    if f.snowfall > 0.0 {
        // New snow joins the surface layer (coverage is 1 here)
        let old_mass = (state.swq / c) * RHO_W;
        let new_mass = f.snowfall * RHO_W;
        let new_depth = new_mass / new_snow_density(f.air_temp);
        let old_depth = if state.density > 0.0 { old_mass / state.density } else { 0.0 };
        state.density = (old_mass + new_mass) / (old_depth + new_depth);
        if surf_ice + f.snowfall > 0.0 {
            state.surf_temp = (surf_ice * state.surf_temp + f.snowfall * t_new) / (surf_ice + f.snowfall);
        }
        surf_ice += f.snowfall;
        state.swq += f.snowfall;
    }

    let age_days = state.last_snow as f64 * f.dt_hours / HOURS_PER_DAY;
    state.albedo = snow_albedo(age_days, state.melting);

    // Rain on the covered part joins the surface liquid
    let rain_bare = f.rain * (1.0 - c);
    surf_water += f.rain;

    // ─── Surface layer energy balance ───
    let surf_only = pack_ice <= 0.0;
    let conductance = K_SNOW * state.density.powi(2) / (state.depth.max(MIN_SNOW_COND_DEPTH));
    let energy = SurfaceEnergy {
        f,
        geometry,
        albedo: state.albedo,
        surf_ice,
        old_temp: state.surf_temp,
        rain_local: f.rain,
        conductance: if surf_only { conductance } else { 0.0 },
        dt,
    };

    let lf_rho = LF * RHO_W;
    let r0 = energy.terms(0.0).residual();
    let mut melt_local = 0.0;
    let mut refreeze_local = 0.0;
    let mut energy_to_pack = 0.0; // J/m^2
    let ts;
    if r0 >= 0.0 {
        ts = 0.0;
        let potential = r0 * dt / lf_rho;
        if potential <= surf_ice {
            melt_local = potential;
        } else {
            melt_local = surf_ice;
            energy_to_pack = (potential - surf_ice) * lf_rho;
        }
        surf_ice -= melt_local;
        surf_water += melt_local;
        state.melting = true;
    } else {
        let deficit = -r0 * dt;
        let latent_store = surf_water * lf_rho;
        if deficit <= latent_store {
            refreeze_local = deficit / lf_rho;
            ts = 0.0;
        } else {
            refreeze_local = surf_water;
            let release = latent_store / dt;
            let lower = state.surf_temp.min(0.0) - solver.brackets.snow_dt;
            let root = solver
                .root
                .solve_within(lower, 0.0, Widen::Lower, solver.brackets.temp_limits(), |t| {
                    energy.terms(t).residual() + release
                })
                .map_err(|e| VicError::solver(SolveVariable::SnowSurfaceTemperature, e))?;
            ts = root.value;
        }
        surf_water -= refreeze_local;
        surf_ice += refreeze_local;
        state.melting = false;
    }

    let terms = energy.terms(ts);
    flux.net_short = terms.net_short;
    flux.net_long = terms.net_long;
    flux.sensible = terms.sensible;
    flux.latent = terms.latent;
    flux.advected = terms.advected;
    flux.delta_cc = terms.delta_cc;
    let residual = terms.residual() + refreeze_local * lf_rho / dt - melt_local * lf_rho / dt
        - energy_to_pack / dt;
    state.surf_temp = ts;

    // Sublimation and deposition at the surface
    let mut vapor_local = terms.vapor * dt / RHO_W;
    if vapor_local > 0.0 {
        let from_ice = vapor_local.min(surf_ice);
        surf_ice -= from_ice;
        let from_water = (vapor_local - from_ice).min(surf_water);
        surf_water -= from_water;
        vapor_local = from_ice + from_water;
    } else {
        surf_ice -= vapor_local;
    }

    // ─── Pack layer ───
    let mut lost_energy = 0.0;
    if pack_ice > 0.0 {
        let g = conductance * (f.ground_temp - state.pack_temp);
        flux.ground = g;
        let heat = CH_ICE * pack_ice * state.pack_temp + g * dt + energy_to_pack;
        if heat > 0.0 {
            state.pack_temp = 0.0;
            let m = (heat / lf_rho).min(pack_ice);
            lost_energy = heat - m * lf_rho;
            pack_ice -= m;
            pack_water += m;
        } else {
            state.pack_temp = heat / (CH_ICE * pack_ice);
        }
    } else {
        flux.ground = terms.ground;
        lost_energy = energy_to_pack;
    }

    // ─── Liquid water routing ───
    let mut outflow_local = 0.0;
    let cap_surf = LIQUID_WATER_CAPACITY * surf_ice;
    if surf_water > cap_surf {
        let excess = surf_water - cap_surf;
        surf_water = cap_surf;
        if pack_ice > 0.0 {
            pack_water += excess;
        } else {
            outflow_local += excess;
        }
    }
    if pack_ice > 0.0 {
        let csnow = CH_ICE * pack_ice;
        let coldcont = csnow * (0.0 - state.pack_temp);
        if coldcont > 0.0 {
            let freeze = pack_water.min(coldcont / lf_rho);
            pack_water -= freeze;
            pack_ice += freeze;
            state.pack_temp += lf_rho * freeze / csnow;
            refreeze_local += freeze;
        }
        let cap_pack = LIQUID_WATER_CAPACITY * pack_ice;
        if pack_water > cap_pack {
            outflow_local += pack_water - cap_pack;
            pack_water = cap_pack;
        }
    }

    // ─── Blowing snow ───
    let mut blowing_local = 0.0;
    if options.blowing && options.spatial_snow {
        blowing_local = (blowing_rate(f.wind, f.air_temp, f.vp, fetch) * dt).min(surf_ice);
        surf_ice -= blowing_local;
    }

    // ─── Re-layer the pack ───
    if surf_ice > MAX_SURFACE_SWE {
        let excess = surf_ice - MAX_SURFACE_SWE;
        if pack_ice + excess > 0.0 {
            state.pack_temp = (pack_ice * state.pack_temp + excess * state.surf_temp) / (pack_ice + excess);
        }
        pack_ice += excess;
        surf_ice = MAX_SURFACE_SWE;
    } else if pack_ice > 0.0 {
        let moved = (MAX_SURFACE_SWE - surf_ice).min(pack_ice);
        if moved > 0.0 {
            state.surf_temp = (surf_ice * state.surf_temp + moved * state.pack_temp) / (surf_ice + moved);
            surf_ice += moved;
            pack_ice -= moved;
        }
        if pack_ice <= 0.0 {
            surf_water += pack_water;
            pack_water = 0.0;
        }
    }

    let local = surf_ice + surf_water + pack_ice + pack_water;
    state.surf_water = surf_water;
    state.pack_water = pack_water;
    state.swq = local * c;
    state.coldcontent = CH_ICE * surf_ice * state.surf_temp;

    flux.refreeze = refreeze_local * c;
    flux.vapor = vapor_local * c;
    flux.blowing = blowing_local * c;
    flux.outflow = outflow_local * c + rain_bare;
    flux.energy_error = residual;
    flux.melt_out = lost_energy / dt * c;
    flux.step_coverage = c;

    // ─── Compaction ───
    if state.density > 0.0 {
        let rmax = if state.melting { SNOW_MAX_DENSITY_MELT } else { SNOW_MAX_DENSITY_COLD };
        if state.density < rmax {
            let tau = SEC_PER_HOUR * SNOW_COMPACTION_HOURS;
            state.density = rmax + (state.density - rmax) * (-dt / tau).exp();
        }
    }

    // ─── Areal coverage ───
    update_coverage(state, old_swq, f.snowfall, options.spatial_snow);

    if state.swq < MIN_SWQ {
        flux.outflow += state.swq;
        state.clear();
    } else {
        state.depth = state.swq / state.coverage * RHO_W / state.density;
    }
    flux.coverage = state.coverage;
    flux.melt = flux.outflow - rain_bare;

    state.vapor_flux += flux.vapor;
    state.blowing_flux += flux.blowing;
    state.melt += flux.melt * 1000.0;

    let mass_error = old_swq + f.snowfall + f.rain - flux.outflow - flux.vapor - flux.blowing - state.swq;
    state.mass_error += mass_error;

    Ok(flux)
}

/// Depletion-curve coverage: fresh snow covers the tile until it has melted
/// back, then coverage follows `sqrt(2 swq / swq_slope)` below `max_swq`.
fn update_coverage(state: &mut SnowPackState, old_swq: f64, snowfall: f64, spatial: bool) {
    if !spatial {
        if state.swq > 0.0 {
            state.spread(1.0);
        }
        return;
    }
    let s = state.swq;
    if snowfall > 0.0 {
        state.store_swq += snowfall;
    }
    let loss = old_swq + snowfall - s;
    if loss > 0.0 {
        state.store_swq = (state.store_swq - loss).max(0.0);
    }
    let target = if s >= state.max_swq {
        state.max_swq = s;
        state.swq_slope = 2.0 * s;
        state.store_swq = 0.0;
        1.0
    } else if state.store_swq > 0.0 {
        1.0
    } else if state.swq_slope > 0.0 {
        (2.0 * s / state.swq_slope).sqrt().min(1.0)
    } else {
        1.0
    };
    let target = if snowfall > 0.0 { target } else { target.min(state.coverage) };
    if target > 0.0 && (target - state.coverage).abs() > 0.0 {
        state.spread(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn forcing(t: f64, rain: f64, snow: f64, sw: f64) -> SnowForcing {
        SnowForcing {
            air_temp: t,
            shortwave: sw,
            longwave: 280.0,
            vp: 0.4,
            pressure: 95.0,
            density: crate::atmos::air_density(95.0, t),
            wind: 2.0,
            rain,
            snowfall: snow,
            ground_temp: 0.0,
            dt_hours: 3.0,
        }
    }

    fn run(state: &mut SnowPackState, f: &SnowForcing, options: &ModelOptions) -> SnowFlux {
        let geom = ExchangeGeometry::new(10.0, 2.0, SNOW_ROUGHNESS);
        snow_step(state, f, &geom, 1000.0, options, &SolverSettings::default()).unwrap()
    }

    #[test]
    fn precipitation_partition_is_linear_between_thresholds() {
        assert_eq!(partition_precip(10.0, -2.0, 0.5, -0.5), (0.0, 10.0));
        assert_eq!(partition_precip(10.0, 2.0, 0.5, -0.5), (10.0, 0.0));
        let (r, s) = partition_precip(10.0, 0.0, 0.5, -0.5);
        assert_abs_diff_eq!(r, 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s, 5.0, epsilon = 1e-12);
    }

    #[test]
    fn albedo_decays_faster_when_melting() {
        assert_eq!(snow_albedo(0.0, false), NEW_SNOW_ALB);
        let cold = snow_albedo(5.0, false);
        let warm = snow_albedo(5.0, true);
        assert!(warm < cold && cold < NEW_SNOW_ALB);
    }

    #[test]
    fn cold_snowfall_builds_a_pack_and_closes_mass() {
        let opts = ModelOptions::default();
        let mut s = SnowPackState::default();
        for _ in 0..8 {
            run(&mut s, &forcing(-8.0, 0.0, 0.01, 0.0), &opts);
        }
        assert!(s.swq > 0.07);
        assert!(s.surf_temp <= 0.0 && s.pack_temp <= 0.0);
        assert_eq!(s.coverage, 1.0);
        assert!(s.mass_error.abs() < 1e-9);
        assert!(s.depth > s.swq);
    }

    #[test]
    fn warm_sunny_steps_melt_the_pack_completely() {
        let opts = ModelOptions::default();
        let mut s = SnowPackState::default();
        run(&mut s, &forcing(-5.0, 0.0, 0.02, 0.0), &opts);
        let start = s.swq;
        let mut melted = 0.0;
        let mut out = 0.0;
        let mut vapor = 0.0;
        for _ in 0..200 {
            if !s.has_snow() {
                break;
            }
            let f = run(&mut s, &forcing(8.0, 0.0, 0.0, 600.0), &opts);
            melted += f.melt;
            out += f.outflow;
            vapor += f.vapor;
            assert!(s.pack_temp <= 0.0 && s.surf_temp <= 0.0);
        }
        assert_eq!(s.swq, 0.0);
        assert_eq!(s.coverage, 0.0);
        assert_abs_diff_eq!(out + vapor, start, epsilon = 1e-9);
        assert_abs_diff_eq!(melted + vapor, start, epsilon = 1e-9);
    }

    #[test]
    fn melt_accounts_for_every_loss_from_a_ripe_pack() {
        let opts = ModelOptions::default();
        let mut s = SnowPackState::default();
        run(&mut s, &forcing(-5.0, 0.0, 0.02, 0.0), &opts);
        let mut ripe_steps = 0;
        for _ in 0..200 {
            if !s.has_snow() {
                break;
            }
            let before = s.swq;
            let f = run(&mut s, &forcing(8.0, 0.0, 0.0, 600.0), &opts);
            if s.pack_temp == 0.0 {
                ripe_steps += 1;
                assert_abs_diff_eq!(before - s.swq, f.melt + f.vapor + f.blowing, epsilon = 1e-12);
            }
        }
        assert!(ripe_steps > 0);
    }

    #[test]
    fn energy_left_after_melt_out_is_handed_on() {
        let opts = ModelOptions::default();
        let mut s = SnowPackState::default();
        run(&mut s, &forcing(-1.0, 0.0, 0.0005, 0.0), &opts);
        let coverage = s.coverage;
        let f = run(&mut s, &forcing(12.0, 0.0, 0.0, 800.0), &opts);
        assert!(!s.has_snow());
        assert_eq!(f.coverage, 0.0);
        assert_eq!(f.step_coverage, coverage);
        assert!(f.melt_out > 0.0);
        assert!(f.energy_error.abs() < 1.0);
    }

    #[test]
    fn coverage_depletes_monotonically_and_resets_on_fresh_snow() {
        let opts = ModelOptions {
            spatial_snow: true,
            ..ModelOptions::default()
        };
        let mut s = SnowPackState::default();
        for _ in 0..4 {
            run(&mut s, &forcing(-6.0, 0.0, 0.02, 0.0), &opts);
        }
        assert_abs_diff_eq!(s.max_swq, s.swq, epsilon = 1e-12);
        let mut prev_cov = s.coverage;
        let mut prev_swq = s.swq;
        for _ in 0..2000 {
            if !s.has_snow() {
                break;
            }
            run(&mut s, &forcing(6.0, 0.0, 0.0, 500.0), &opts);
            if s.swq < prev_swq {
                assert!(s.coverage <= prev_cov + 1e-12);
            }
            prev_cov = s.coverage;
            prev_swq = s.swq;
        }
        assert_eq!(s.coverage, 0.0);
        run(&mut s, &forcing(-3.0, 0.0, 0.005, 0.0), &opts);
        assert_eq!(s.coverage, 1.0);
    }

    #[test]
    fn rain_on_bare_ground_passes_through() {
        let opts = ModelOptions::default();
        let mut s = SnowPackState::default();
        let f = run(&mut s, &forcing(5.0, 0.004, 0.0, 100.0), &opts);
        assert_eq!(f.outflow, 0.004);
        assert!(!s.has_snow());
    }

    #[test]
    fn blowing_snow_needs_strong_wind() {
        assert_eq!(blowing_rate(3.0, -5.0, 0.2, 1000.0), 0.0);
        assert!(blowing_rate(15.0, -5.0, 0.2, 1000.0) > 0.0);
    }
}
