// One vegetation × elevation band tile advanced over one model step. The
// snow pack and thermal profile are shared by the wet and dry precipitation
// fractions; layer moisture and canopy storage are kept per fraction.

use serde::{Deserialize, Serialize};

use crate::atmos::{svp, ExchangeGeometry};
use crate::canopy::{
    canopy_energy_balance, intercept_rain, intercept_snow, transpiration_demand, CanopyForcing, CanopyView,
    EvapSurface, VegVarState,
};
use crate::config::{ModelConfig, ModelOptions};
use crate::constants::*;
use crate::error::{SolveContext, VicResult};
use crate::forcing::{AtmosForcingStep, StepIndex};
use crate::snow::{partition_precip, snow_step, SnowFlux, SnowForcing, SnowPackState};
use crate::soil::{LayerState, SoilColumn};
use crate::surface::{EnergyBalance, SnowCover, SurfaceForcing, SurfaceProblem};

pub const WET: usize = 0;
pub const DRY: usize = 1;

/// Moisture state of one precipitation fraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecipState {
    pub layers: Vec<LayerState>,
    pub veg_var: VegVarState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileState {
    pub energy: EnergyBalance,
    pub snow: SnowPackState,
    pub fractions: [PrecipState; 2], // wet, dry
}

impl TileState {
    /// Snow-free tile with identical wet and dry fractions and a node
    /// profile interpolated from the initial layer temperatures.
    pub fn initial(soil: &SoilColumn, options: &ModelOptions) -> Self {
        let layers = soil.initial_layers(options);
        let temps: Vec<f64> = layers.iter().map(|l| l.t).collect();
        let surf_temp = temps[0];
        let nodes = soil.grid.initial_nodes(
            &soil.depths(),
            &temps,
            &soil.volumetric_water(&layers),
            surf_temp,
            soil.avg_temp,
            options.frozen_soil,
        );
        let frac = PrecipState {
            layers,
            veg_var: VegVarState::default(),
        };
        TileState {
            energy: EnergyBalance::new(nodes, surf_temp),
            snow: SnowPackState::default(),
            fractions: [frac.clone(), frac],
        }
    }
}

/// Surface cover of a tile for the current month.
#[derive(Debug, Clone, Copy)]
pub enum Cover<'a> {
    Bare,
    Vegetated { view: CanopyView, root: &'a [f64] },
}

impl Cover<'_> {
    fn overstory(&self) -> Option<(&CanopyView, &[f64])> {
        match self {
            Cover::Vegetated { view, root } if view.overstory => Some((view, root)),
            _ => None,
        }
    }
}

pub struct TileInputs<'a> {
    pub forcing: &'a AtmosForcingStep, // already adjusted to the band
    pub soil: &'a SoilColumn,
    pub cover: Cover<'a>,
    pub mu: f64,
    pub config: &'a ModelConfig,
}

/// Tile-mean fluxes and storages of one step. Water terms in mm, energy
/// terms in W/m^2.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TileFlux {
    pub prec: f64,
    pub rain: f64,
    pub snowfall: f64,
    pub evap: f64,
    pub evap_canop: f64,
    pub transp: f64,
    pub evap_bare: f64,
    pub sub_snow: f64,
    pub sub_canop: f64,
    pub sub_blowing: f64,
    pub runoff: f64,
    pub baseflow: f64,
    pub net_short: f64,
    pub net_long: f64,
    pub sensible: f64,
    pub latent: f64,
    pub ground: f64,
    pub delta_h: f64,
    pub energy_error: f64,
    pub surf_temp: f64,
    pub snow_surf_temp: f64,
    pub snow_pack_temp: f64,
    pub swe: f64,
    pub snow_depth: f64, // m
    pub snow_cover: f64,
    pub snow_canopy: f64,
    pub melt: f64,
    pub wdew: f64,
    pub soil_moist: Vec<f64>, // per layer, liquid + ice
    pub soil_ice: Vec<f64>,
    pub soil_temp: Vec<f64>,
    pub node_temp: Vec<f64>,
    pub fdepth: Vec<f64>,
    pub tdepth: Vec<f64>,
    pub storage: f64,
    pub water_error: f64,
    pub snow_mass_error: f64, // m
}

/// Area shares of the wet and dry fractions.
pub fn fraction_weights(mu: f64, dist_prcp: bool) -> [f64; 2] {
    if dist_prcp {
        [mu, 1.0 - mu]
    } else {
        [1.0, 0.0]
    }
}

/// Water held by the tile (mm, tile mean).
pub fn tile_storage(state: &TileState, soil: &SoilColumn, weights: &[f64; 2]) -> f64 {
    let fractions: f64 = state
        .fractions
        .iter()
        .zip(weights)
        .filter(|(_, w)| **w > 0.0)
        .map(|(f, w)| w * (soil.total_water(&f.layers) + f.veg_var.wdew))
        .sum();
    fractions + state.snow.total_water() * 1000.0
}

fn root_stress(soil: &SoilColumn, layers: &[LayerState], root: &[f64]) -> (f64, Vec<f64>) {
    let stress = soil.moisture_stress(layers);
    let total = root.iter().zip(&stress).map(|(r, s)| r * s).sum();
    (total, stress)
}

#[derive(Default)]
struct SnowAccumulator {
    coverage: f64,
    flux: SnowFlux,
    canopy_short: f64,
    canopy_long: f64,
    canopy_sensible: f64,
    canopy_latent: f64,
}

impl SnowAccumulator {
    fn add(&mut self, f: &SnowFlux) {
        self.coverage += f.coverage;
        let c = f.step_coverage;
        let acc = &mut self.flux;
        acc.net_short += c * f.net_short;
        acc.net_long += c * f.net_long;
        acc.sensible += c * f.sensible;
        acc.latent += c * f.latent;
        acc.energy_error += c * f.energy_error;
        acc.melt_out += f.melt_out;
    }
}

fn blend(surfaces: &[(f64, EvapSurface)]) -> EvapSurface {
    if surfaces.len() == 1 {
        return surfaces[0].1;
    }
    let mut out = surfaces[0].1;
    out.wet_fraction = 0.0;
    out.soil_efficiency = 0.0;
    out.max_water = 0.0;
    let mut conductance = 0.0;
    for (w, s) in surfaces {
        out.wet_fraction += w * s.wet_fraction;
        out.soil_efficiency += w * s.soil_efficiency;
        out.max_water += w * s.max_water;
        conductance += w / s.canopy_resistance.max(SMALL);
    }
    out.canopy_resistance = if conductance > 0.0 { 1.0 / conductance } else { HUGE_RESIST };
    out
}

/// Advance one tile over one model step.
pub fn solve_tile(state: &mut TileState, input: &TileInputs) -> VicResult<TileFlux> {
    let cfg = input.config;
    let opts = &cfg.options;
    let global = &cfg.global;
    let solver = &cfg.solver;
    let soil = input.soil;
    let weights = fraction_weights(input.mu, opts.dist_prcp);
    let active: Vec<usize> = (0..2).filter(|k| weights[*k] > 0.0).collect();
    let n_sub = input.forcing.n_substeps();
    let sub_hours = global.dt_hours / n_sub as f64;
    let dt = global.dt_seconds();
    let frozen = opts.frozen_soil;

    let storage_before = tile_storage(state, soil, &weights);
    state.snow.begin_step();
    for frac in state.fractions.iter_mut() {
        frac.veg_var.canopy_evap = 0.0;
        frac.veg_var.throughfall = 0.0;
        for layer in frac.layers.iter_mut() {
            layer.evap = 0.0;
        }
    }

    let mut flux = TileFlux::default();
    let mut inflow = [0.0; 2];
    let mut acc = SnowAccumulator::default();
    let snow_geom = ExchangeGeometry::new(global.wind_h, global.measure_h, SNOW_ROUGHNESS);

    // ─── Snow sub-steps ───
    for i in 0..n_sub {
        let rec = input.forcing.record(StepIndex::Sub(i));
        let wind = rec.wind.max(opts.min_wind_speed);
        let (rain, snowfall) =
            partition_precip(rec.prec, rec.air_temp, global.max_snow_temp, global.min_rain_temp);
        flux.prec += rec.prec;
        flux.rain += rain;
        flux.snowfall += snowfall;

        let mut snow_ground = snowfall / 1000.0;
        if let Some((view, _)) = input.cover.overstory() {
            snow_ground = intercept_snow(&mut state.snow.snow_canopy, snow_ground, view.snow_capacity());
        }

        let mut through = [0.0; 2];
        for &k in &active {
            let rain_k = if k == WET { rain / weights[WET] } else { 0.0 };
            through[k] = match input.cover {
                Cover::Vegetated { view, .. } => intercept_rain(&mut state.fractions[k].veg_var, rain_k, view.wdmax),
                Cover::Bare => rain_k,
            };
        }
        let through_mean: f64 = active.iter().map(|&k| weights[k] * through[k]).sum();

        let canopy_snow = input.cover.overstory().is_some() && state.snow.snow_canopy > 0.0;
        if !(state.snow.has_snow() || snow_ground > 0.0 || canopy_snow) {
            for &k in &active {
                inflow[k] += through[k];
            }
            continue;
        }

        let mut sf = SnowForcing {
            air_temp: rec.air_temp,
            shortwave: rec.shortwave,
            longwave: rec.longwave,
            vp: rec.vp,
            pressure: rec.pressure,
            density: rec.density,
            wind,
            rain: through_mean / 1000.0,
            snowfall: snow_ground,
            ground_temp: state.energy.surf_temp,
            dt_hours: sub_hours,
        };

        if let Some((view, root)) = input.cover.overstory() {
            let ground_temp = if state.snow.has_snow() { state.snow.surf_temp } else { state.energy.surf_temp };
            let cf = CanopyForcing {
                air_temp: rec.air_temp,
                shortwave: rec.shortwave,
                longwave: rec.longwave,
                vp: rec.vp,
                pressure: rec.pressure,
                density: rec.density,
                wind,
                ground_temp,
                dt_hours: sub_hours,
            };
            let wet = &mut state.fractions[active[0]];
            let (stress, _) = root_stress(soil, &wet.layers, root);
            let bal = canopy_energy_balance(
                view,
                &cf,
                &mut state.snow.snow_canopy,
                &mut wet.veg_var,
                stress,
                global.wind_h,
                global.measure_h,
                solver,
            )?;
            if bal.transpiration > 0.0 {
                for &k in &active {
                    let layers = &mut state.fractions[k].layers;
                    let demand = transpiration_demand(bal.transpiration, root, &soil.moisture_stress(layers));
                    soil.extract(layers, &demand);
                }
            }
            state.snow.canopy_vapor_flux += bal.sublimation;
            flux.sub_canop += bal.sublimation * 1000.0;
            acc.canopy_short += bal.net_short;
            acc.canopy_long += bal.net_long;
            acc.canopy_sensible += bal.sensible;
            acc.canopy_latent += bal.latent;
            state.energy.foliage_temp = bal.foliage_temp;
            state.energy.canopy_air_temp = bal.canopy_air_temp;
            state.energy.canopy_vp = bal.canopy_vp;

            sf.air_temp = bal.canopy_air_temp;
            sf.vp = bal.canopy_vp.min(svp(bal.canopy_air_temp));
            sf.shortwave = bal.under_shortwave;
            sf.longwave = bal.under_longwave;
            sf.wind = bal.under_wind.max(opts.min_wind_speed);
            sf.rain += bal.drip;
        }

        let sflux = snow_step(&mut state.snow, &sf, &snow_geom, soil.fetch, opts, solver)?;
        acc.add(&sflux);
        for &k in &active {
            inflow[k] += sflux.outflow * 1000.0;
        }
    }
    let n = n_sub as f64;
    let snow_coverage = acc.coverage / n;

    // ─── Whole-step surface energy balance ───
    let rec = input.forcing.record(StepIndex::Whole);
    let (albedo, emissivity, roughness) = match input.cover {
        Cover::Vegetated { view, .. } => (view.albedo, view.emissivity, view.roughness),
        Cover::Bare => (BARE_SOIL_ALBEDO, 1.0, BARE_SOIL_ROUGHNESS),
    };

    let mut surfaces = Vec::with_capacity(2);
    let mut stresses = [Vec::new(), Vec::new()];
    for &k in &active {
        let frac = &state.fractions[k];
        let extractable = soil.extractable(&frac.layers);
        let surface = match input.cover {
            Cover::Vegetated { view, root } => {
                let (stress, layer_stress) = root_stress(soil, &frac.layers, root);
                let rooted: f64 = extractable.iter().zip(root).filter(|(_, r)| **r > 0.0).map(|(e, _)| e).sum();
                stresses[k] = layer_stress;
                EvapSurface::vegetated(&view, frac.veg_var.wdew, stress, frac.veg_var.wdew + rooted)
            }
            Cover::Bare => EvapSurface::bare(soil.bare_soil_efficiency(&frac.layers), extractable[0]),
        };
        surfaces.push((weights[k], surface));
    }

    let mut volumetric = vec![0.0; soil.n_layers()];
    for &k in &active {
        for (v, x) in volumetric.iter_mut().zip(soil.volumetric_water(&state.fractions[k].layers)) {
            *v += weights[k] * x;
        }
    }
    soil.grid.set_node_moisture(&mut state.energy.nodes, &volumetric, frozen);

    let layer_depths = soil.depths();
    let problem = SurfaceProblem {
        forcing: SurfaceForcing {
            air_temp: rec.air_temp,
            shortwave: rec.shortwave,
            longwave: rec.longwave,
            vp: rec.vp,
            pressure: rec.pressure,
            density: rec.density,
            wind: rec.wind.max(opts.min_wind_speed),
            albedo,
            emissivity,
            dt_hours: global.dt_hours,
        },
        snow: SnowCover {
            coverage: snow_coverage,
            bottom_temp: state.snow.bottom_temp(),
            conductance: state.snow.conductance(),
            melt_out: acc.flux.melt_out / n,
        },
        geometry: ExchangeGeometry::new(global.wind_h, global.measure_h, roughness),
        evap: blend(&surfaces),
        grid: &soil.grid,
        layer_depths: &layer_depths,
        bottom_temp: soil.avg_temp,
        options: opts,
        solver,
    };
    let sol = problem.solve(&mut state.energy)?;

    // ─── Soil thermal state and frozen split ───
    for &k in &active {
        let layers = &mut state.fractions[k].layers;
        soil.update_layer_thermal(layers, &state.energy.nodes);
        if frozen {
            soil.partition_ice(layers, true);
        }
    }

    // ─── Evaporation ───
    let ts = sol.surf_temp;
    let ra = sol.terms.resistance;
    let exposed = 1.0 - snow_coverage;
    for (idx, &k) in active.iter().enumerate() {
        let surface = surfaces[idx].1;
        let e = surface.flux(rec.density, rec.pressure, svp(ts), rec.vp, ra, dt) * exposed * dt;
        let frac = &mut state.fractions[k];
        let part = surface.partition(e, ra, frac.veg_var.wdew);
        frac.veg_var.wdew -= part.canopy;
        frac.veg_var.canopy_evap += part.canopy;
        if let Cover::Vegetated { root, .. } = input.cover {
            let demand = transpiration_demand(part.transpiration, root, &stresses[k]);
            soil.extract(&mut frac.layers, &demand);
        }
        if part.soil != 0.0 {
            let soil_evap = soil.extract(&mut frac.layers, &[part.soil]);
            flux.evap_bare += weights[k] * soil_evap[0];
        }
    }

    // ─── Runoff ───
    for &k in &active {
        let r = soil.runoff(&mut state.fractions[k].layers, inflow[k], global.dt_hours);
        flux.runoff += weights[k] * r.runoff;
        flux.baseflow += weights[k] * r.baseflow;
    }

    for &k in &active {
        soil.check_bounds(&state.fractions[k].layers).map_err(|e| {
            e.with_context(SolveContext {
                fraction: Some(k),
                ..SolveContext::default()
            })
        })?;
    }

    // ─── Tile means ───
    let n_layers = soil.n_layers();
    flux.soil_moist = vec![0.0; n_layers];
    flux.soil_ice = vec![0.0; n_layers];
    flux.soil_temp = vec![0.0; n_layers];
    let mut layer_evap = 0.0;
    for &k in &active {
        let w = weights[k];
        let frac = &state.fractions[k];
        for (l, layer) in frac.layers.iter().enumerate() {
            flux.soil_moist[l] += w * soil.layer_water(layer);
            flux.soil_ice[l] += w * layer.ice.mean(&soil.frost_fract);
            flux.soil_temp[l] += w * layer.t;
            layer_evap += w * layer.evap;
        }
        flux.evap_canop += w * frac.veg_var.canopy_evap;
        flux.wdew += w * frac.veg_var.wdew;
    }
    flux.transp = layer_evap - flux.evap_bare;
    flux.sub_snow = state.snow.vapor_flux * 1000.0;
    flux.sub_blowing = state.snow.blowing_flux * 1000.0;
    flux.evap = flux.evap_canop + layer_evap + flux.sub_snow + flux.sub_blowing + flux.sub_canop;

    flux.net_short = sol.terms.net_short + (acc.flux.net_short + acc.canopy_short) / n;
    flux.net_long = sol.terms.net_long + (acc.flux.net_long + acc.canopy_long) / n;
    flux.sensible = sol.terms.sensible + (acc.flux.sensible + acc.canopy_sensible) / n;
    flux.latent = sol.terms.latent + (acc.flux.latent + acc.canopy_latent) / n;
    flux.ground = state.energy.ground_flux;
    flux.delta_h = state.energy.delta_h;
    flux.energy_error = sol.error + acc.flux.energy_error / n;
    flux.surf_temp = ts;
    flux.node_temp = state.energy.nodes.iter().map(|n| n.t).collect();
    flux.fdepth = state.energy.fdepth.clone();
    flux.tdepth = state.energy.tdepth.clone();

    let snow = &state.snow;
    flux.swe = snow.swq * 1000.0;
    flux.snow_depth = snow.depth * snow.coverage;
    flux.snow_cover = snow.coverage;
    flux.snow_canopy = snow.snow_canopy * 1000.0;
    flux.snow_surf_temp = snow.surf_temp;
    flux.snow_pack_temp = snow.pack_temp;
    flux.melt = snow.melt;
    flux.snow_mass_error = snow.mass_error;

    flux.storage = tile_storage(state, soil, &weights);
    flux.water_error =
        storage_before + flux.prec - flux.evap - flux.runoff - flux.baseflow - flux.storage;
    Ok(flux)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forcing::AtmosRecord;
    use crate::soil::{BaseflowParams, LayerParams, SoilParams};

    fn layer(depth: f64, init: f64) -> LayerParams {
        LayerParams {
            depth,
            ksat: 200.0,
            expt: 11.0,
            bubble: 30.0,
            quartz: 0.4,
            bulk_density: 1400.0,
            soil_density: 2650.0,
            wcr_fract: 0.7,
            wp_fract: 0.5,
            resid_moist: 0.02,
            init_moist: init,
        }
    }

    fn soil(config: &ModelConfig) -> SoilColumn {
        let params = SoilParams {
            layers: vec![layer(0.1, 30.0), layer(0.3, 90.0), layer(1.0, 300.0)],
            baseflow: BaseflowParams::Arno {
                ds: 0.02,
                dsmax: 10.0,
                ws: 0.8,
                c: 2.0,
            },
            b_infilt: 0.2,
            dp: 4.0,
            avg_temp: 8.0,
            init_temps: None,
            frost_slope: 1.0,
            fetch: 1000.0,
        };
        SoilColumn::new(&params, &config.options).unwrap()
    }

    fn step(t: f64, prec: f64) -> AtmosForcingStep {
        let rec = AtmosRecord::new(t, prec / 8.0, 150.0, 300.0, 95.0, 0.6, 3.0);
        AtmosForcingStep::from_substeps(4, vec![rec; 8]).unwrap()
    }

    #[test]
    fn bare_tile_closes_its_water_balance() {
        let config = ModelConfig::default();
        let soil = soil(&config);
        let mut state = TileState::initial(&soil, &config.options);
        for p in [0.0, 12.0, 30.0, 0.0] {
            let forcing = step(10.0, p);
            let input = TileInputs {
                forcing: &forcing,
                soil: &soil,
                cover: Cover::Bare,
                mu: 1.0,
                config: &config,
            };
            let flux = solve_tile(&mut state, &input).unwrap();
            assert!(flux.water_error.abs() < 1e-6, "water error {}", flux.water_error);
            assert!(flux.evap >= 0.0);
        }
    }

    #[test]
    fn cold_precipitation_accumulates_snow() {
        let config = ModelConfig::default();
        let soil = soil(&config);
        let mut state = TileState::initial(&soil, &config.options);
        let forcing = step(-6.0, 20.0);
        let input = TileInputs {
            forcing: &forcing,
            soil: &soil,
            cover: Cover::Bare,
            mu: 1.0,
            config: &config,
        };
        let flux = solve_tile(&mut state, &input).unwrap();
        assert!(flux.swe > 15.0);
        assert_eq!(flux.snow_cover, 1.0);
        assert!(flux.water_error.abs() < 1e-6);
    }

    #[test]
    fn wet_and_dry_fractions_receive_different_water() {
        let mut config = ModelConfig::default();
        config.options.dist_prcp = true;
        let soil = soil(&config);
        let mut state = TileState::initial(&soil, &config.options);
        let forcing = step(12.0, 20.0);
        let input = TileInputs {
            forcing: &forcing,
            soil: &soil,
            cover: Cover::Bare,
            mu: 0.4,
            config: &config,
        };
        let flux = solve_tile(&mut state, &input).unwrap();
        let wet = soil.total_water(&state.fractions[WET].layers);
        let dry = soil.total_water(&state.fractions[DRY].layers);
        assert!(wet > dry);
        assert!(flux.water_error.abs() < 1e-6);
    }
}
