// Grid cell coordinator: enumerates vegetation × band tiles, drives the
// distributed precipitation split, solves tiles in parallel and reduces them
// to cell-mean output with a storage closure check.

use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::canopy::{VegLibrary, VegTile};
use crate::config::ModelConfig;
use crate::constants::*;
use crate::error::{BalanceKind, SolveContext, VicError, VicResult};
use crate::forcing::{AtmosForcingStep, StepIndex};
use crate::lake::{lake_step, LakeFlux, LakeInputs, LakeParams, LakeState};
use crate::output::{OutVar, OutputRecord, StepDiagnostics};
use crate::snow::partition_precip;
use crate::soil::{SoilColumn, SoilParams};
use crate::tile::{fraction_weights, solve_tile, tile_storage, Cover, PrecipState, TileFlux, TileInputs, TileState};

// ═══════════════════════════════════════════════════════════════════════
// Parameters
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandParams {
    pub area_fract: f64,
    pub elevation: f64, // m
    pub prcp_fract: f64,
    #[serde(default)]
    pub above_treeline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellParams {
    pub id: usize,
    pub area_m2: f64,
    pub elevation: f64, // m
    pub soil: SoilParams,
    #[serde(default)]
    pub veg: Vec<VegTile>,
    #[serde(default)]
    pub veg_lib: VegLibrary,
    #[serde(default)]
    pub bands: Vec<BandParams>, // empty: one band at the cell elevation
    #[serde(default)]
    pub lake: Option<LakeParams>,
    #[serde(default)]
    pub config: ModelConfig,
}

impl CellParams {
    pub fn from_json(text: &str) -> VicResult<Self> {
        serde_json::from_str(text).map_err(|e| VicError::Config(format!("cell parameters: {}", e)))
    }
}

/// One simulated sub-area column: a vegetation tile or bare soil.
#[derive(Debug, Clone, PartialEq)]
struct VegSlot {
    veg: Option<usize>, // index into `CellParams::veg`, None for bare soil
    cv: f64,            // after the lake carve-out
}

/// Initialised cell: validated parameters plus derived soil column and tile
/// layout. Tiles are indexed `veg * n_bands + band`; bare soil is the last
/// vegetation slot.
#[derive(Debug, Clone)]
pub struct Cell {
    pub params: CellParams,
    pub soil: SoilColumn,
    pub bands: Vec<BandParams>,
    slots: Vec<VegSlot>,
}

/// Mutable state of one cell between steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellState {
    pub tiles: Vec<TileState>,
    pub mu: f64,     // wet fraction of the current storm
    pub storm: bool, // a storm is in progress
    pub lake: Option<LakeState>,
    pub storage: f64, // cell water storage at the end of the last step (mm)
    pub step: usize,
}

pub struct CellStep {
    pub record: OutputRecord,
    pub diagnostics: StepDiagnostics,
}

const AREA_TOLERANCE: f64 = 1.0e-6;

impl Cell {
    pub fn new(params: CellParams) -> VicResult<Self> {
        let config = &params.config;
        config.validate()?;
        let soil = SoilColumn::new(&params.soil, &config.options)?;

        if params.area_m2 <= 0.0 {
            return Err(VicError::parameter("cell area", params.area_m2, "must be positive"));
        }

        let bands = if params.bands.is_empty() {
            vec![BandParams {
                area_fract: 1.0,
                elevation: params.elevation,
                prcp_fract: 1.0,
                above_treeline: false,
            }]
        } else {
            params.bands.clone()
        };
        let area_sum: f64 = bands.iter().map(|b| b.area_fract).sum();
        if (area_sum - 1.0).abs() > AREA_TOLERANCE {
            return Err(VicError::parameter("band area fractions", area_sum, "must sum to 1"));
        }
        for b in &bands {
            if b.area_fract <= 0.0 {
                return Err(VicError::parameter("band area fraction", b.area_fract, "must be positive"));
            }
        }

        let mut slots = Vec::with_capacity(params.veg.len() + 1);
        let mut cv_sum = 0.0;
        for (i, tile) in params.veg.iter().enumerate() {
            params.veg_lib.get(tile.class)?.validate()?;
            if tile.cv < 0.0 {
                return Err(VicError::parameter("Cv", tile.cv, "must be non-negative"));
            }
            if tile.root.len() != soil.n_layers() {
                return Err(VicError::Shape {
                    name: "root fractions",
                    expected: soil.n_layers(),
                    actual: tile.root.len(),
                });
            }
            let root_sum: f64 = tile.root.iter().sum();
            if (root_sum - 1.0).abs() > 1.0e-3 {
                return Err(VicError::parameter("root fractions", root_sum, "must sum to 1"));
            }
            cv_sum += tile.cv;
            slots.push(VegSlot { veg: Some(i), cv: tile.cv });
        }
        if cv_sum > 1.0 + AREA_TOLERANCE {
            return Err(VicError::parameter("sum of Cv", cv_sum, "must not exceed 1"));
        }
        slots.push(VegSlot {
            veg: None,
            cv: (1.0 - cv_sum).max(0.0),
        });

        if let Some(lake) = &params.lake {
            if !config.options.lakes {
                return Err(VicError::Config("lake parameters given with lakes disabled".to_string()));
            }
            lake.validate()?;
            let slot = slots
                .get_mut(lake.wetland_veg)
                .filter(|s| s.veg.is_some())
                .ok_or_else(|| VicError::parameter("wetland_veg", lake.wetland_veg as f64, "no such vegetation tile"))?;
            if lake.fraction > slot.cv + AREA_TOLERANCE {
                return Err(VicError::parameter("lake fraction", lake.fraction, "exceeds the wetland Cv"));
            }
            slot.cv = (slot.cv - lake.fraction).max(0.0);
        } else if config.options.lakes {
            return Err(VicError::Config("lakes enabled without lake parameters".to_string()));
        }

        Ok(Cell {
            params,
            soil,
            bands,
            slots,
        })
    }

    pub fn n_bands(&self) -> usize {
        self.bands.len()
    }

    /// Vegetation slots including bare soil.
    pub fn n_veg(&self) -> usize {
        self.slots.len()
    }

    pub fn n_tiles(&self) -> usize {
        self.slots.len() * self.bands.len()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.params.config
    }

    fn lake_fraction(&self) -> f64 {
        self.params.lake.as_ref().map_or(0.0, |l| l.fraction)
    }

    /// Area share of tile `(veg, band)`.
    pub fn tile_weight(&self, veg: usize, band: usize) -> f64 {
        self.slots[veg].cv * self.bands[band].area_fract
    }

    /// Weights of all tiles in storage order; with the lake fraction they sum to 1.
    pub fn tile_weights(&self) -> Vec<f64> {
        (0..self.n_tiles())
            .map(|t| self.tile_weight(t / self.n_bands(), t % self.n_bands()))
            .collect()
    }

    fn band_factors(&self, band: usize) -> (f64, f64) {
        let b = &self.bands[band];
        let tfactor = (self.params.elevation - b.elevation) * T_LAPSE / 1000.0;
        let pfactor = b.prcp_fract / b.area_fract;
        (tfactor, pfactor)
    }

    fn cover(&self, veg: usize, band: usize, month: usize) -> VicResult<Cover<'_>> {
        let Some(i) = self.slots[veg].veg else {
            return Ok(Cover::Bare);
        };
        let tile = &self.params.veg[i];
        let class = self.params.veg_lib.get(tile.class)?;
        if class.overstory && self.bands[band].above_treeline {
            return Ok(Cover::Bare);
        }
        Ok(Cover::Vegetated {
            view: class.view(month),
            root: &tile.root,
        })
    }

    pub fn initial_state(&self) -> VicResult<CellState> {
        let tile = TileState::initial(&self.soil, &self.config().options);
        let lake = match &self.params.lake {
            Some(l) => Some(l.initial_state(self.soil.init_temps[0])?),
            None => None,
        };
        let mut state = CellState {
            tiles: vec![tile; self.n_tiles()],
            mu: 1.0,
            storm: false,
            lake,
            storage: 0.0,
            step: 0,
        };
        state.storage = self.storage(&state);
        Ok(state)
    }

    /// Cell-mean water storage (mm): soil, canopy interception, snow and lake.
    pub fn storage(&self, state: &CellState) -> f64 {
        let weights = fraction_weights(state.mu, self.config().options.dist_prcp);
        let land: f64 = state
            .tiles
            .iter()
            .zip(self.tile_weights())
            .filter(|(_, w)| *w > 0.0)
            .map(|(t, w)| w * tile_storage(t, &self.soil, &weights))
            .sum();
        let lake = state
            .lake
            .as_ref()
            .map_or(0.0, |l| l.storage_mm(self.params.area_m2));
        land + lake
    }

    // ═══════════════════════════════════════════════════════════════════
    // Step
    // ═══════════════════════════════════════════════════════════════════

    /// Advance the cell by one model step. The state is left untouched when
    /// any tile fails.
    pub fn step(&self, state: &mut CellState, forcing: &AtmosForcingStep) -> VicResult<CellStep> {
        let config = self.config();
        let ctx = SolveContext {
            cell: Some(self.params.id),
            step: Some(state.step),
            ..SolveContext::default()
        };
        let expected = config.global.n_substeps();
        if forcing.n_substeps() != expected {
            return Err(VicError::Shape {
                name: "forcing substeps",
                expected,
                actual: forcing.n_substeps(),
            });
        }

        let mut next = state.clone();
        self.update_storm(&mut next, forcing.record(StepIndex::Whole).prec);

        let band_forcing: Vec<AtmosForcingStep> = (0..self.n_bands())
            .map(|b| {
                let (tfactor, pfactor) = self.band_factors(b);
                forcing.for_band(tfactor, pfactor)
            })
            .collect();

        let n_bands = self.n_bands();
        let mu = next.mu;
        let fluxes: Vec<Option<TileFlux>> = next
            .tiles
            .par_iter_mut()
            .enumerate()
            .map(|(t, tile)| {
                let (veg, band) = (t / n_bands, t % n_bands);
                if self.tile_weight(veg, band) <= 0.0 {
                    return Ok(None);
                }
                let inputs = TileInputs {
                    forcing: &band_forcing[band],
                    soil: &self.soil,
                    cover: self.cover(veg, band, forcing.month)?,
                    mu,
                    config,
                };
                solve_tile(tile, &inputs)
                    .map(Some)
                    .map_err(|e| e.with_context(SolveContext::tile(veg, band).merge(ctx)))
            })
            .collect::<VicResult<_>>()?;

        let mut out = self.aggregate(&fluxes);

        if let (Some(params), Some(lake)) = (&self.params.lake, next.lake.as_mut()) {
            let lake_flux = self.step_lake(params, lake, forcing, &mut out)?;
            debug!("cell {} lake depth {:.3} m, outflow {:.1} m^3", self.params.id, lake.depth, lake_flux.outflow);
        }

        let storage = self.storage(&next);
        let water_error = storage_closure(state.storage, storage, &out.record);
        out.record.set_scalar(OutVar::WaterError, water_error);
        out.record.set_scalar(OutVar::DelSoilMoist, next.soil_water(self) - state.soil_water(self));
        out.record.set_scalar(OutVar::DelSwe, next.swe(self) - state.swe(self));

        let mut diagnostics = StepDiagnostics {
            step: state.step,
            water_error,
            energy_error: out.energy_error,
            snow_mass_error: out.snow_mass_error,
            warnings: Vec::new(),
        };
        let tol = &config.solver.tolerances;
        for (kind, error, limits) in [
            (BalanceKind::Water, water_error, tol.water),
            (BalanceKind::Energy, out.energy_error, tol.energy),
            (BalanceKind::SnowMass, out.snow_mass_error, tol.snow_mass),
        ] {
            if error.abs() > limits.fatal {
                return Err(VicError::Balance {
                    context: ctx,
                    kind,
                    error,
                    limit: limits.fatal,
                });
            }
            if error.abs() > limits.warn {
                let message = format!("{} balance error {:.3e} at {}", kind, error, ctx);
                warn!("{}", message);
                diagnostics.warnings.push(message);
            }
        }
        debug!(
            "cell {} step {}: prec {:.2} evap {:.3} runoff {:.3} baseflow {:.3} mm",
            self.params.id,
            state.step,
            out.record.scalar(OutVar::Prec),
            out.record.scalar(OutVar::Evap),
            out.record.scalar(OutVar::Runoff),
            out.record.scalar(OutVar::Baseflow),
        );

        next.storage = storage;
        next.step += 1;
        *state = next;
        Ok(CellStep {
            record: out.record,
            diagnostics,
        })
    }

    /// Start, continue or end a storm and move layer water between the wet
    /// and dry fractions so that every tile keeps its mean storage.
    fn update_storm(&self, state: &mut CellState, prec: f64) {
        if !self.config().options.dist_prcp {
            state.mu = 1.0;
            return;
        }
        let old_mu = state.mu;
        let new_mu = if prec > STORM_THRES {
            if state.storm {
                old_mu
            } else {
                (1.0 - (-self.config().options.prec_expt * prec).exp()).clamp(SMALL, 1.0)
            }
        } else {
            1.0
        };
        state.storm = prec > STORM_THRES;
        if new_mu == old_mu {
            return;
        }
        for tile in state.tiles.iter_mut() {
            redistribute(&mut tile.fractions, old_mu, new_mu);
        }
        state.mu = new_mu;
    }

    fn step_lake(
        &self,
        params: &LakeParams,
        lake: &mut LakeState,
        forcing: &AtmosForcingStep,
        out: &mut Aggregate,
    ) -> VicResult<LakeFlux> {
        let config = self.config();
        let area = self.params.area_m2;
        let frac = params.fraction;
        let rec = forcing.record(StepIndex::Whole);
        let (rain, snow) = partition_precip(rec.prec, rec.air_temp, config.global.max_snow_temp, config.global.min_rain_temp);

        let runoff = out.record.scalar(OutVar::Runoff);
        let baseflow = out.record.scalar(OutVar::Baseflow);
        let to_lake_runoff = params.rpercent * runoff;
        let to_lake_baseflow = params.bpercent * baseflow;
        let inflow = (to_lake_runoff + to_lake_baseflow) / 1000.0 * area;

        let inputs = LakeInputs {
            record: rec,
            rain,
            snow,
            inflow,
            tile_area: frac * area,
            global: &config.global,
            solver: &config.solver,
        };
        let flux = lake_step(params, lake, &inputs).map_err(|e| {
            e.with_context(SolveContext {
                cell: Some(self.params.id),
                veg: Some(params.wetland_veg),
                ..SolveContext::default()
            })
        })?;

        let outflow_mm = flux.outflow / area * 1000.0;
        let rec_out = &mut out.record;
        let add = |rec: &mut OutputRecord, var: OutVar, v: f64| {
            let cur = rec.scalar(var);
            rec.set_scalar(var, cur + v);
        };
        add(rec_out, OutVar::Prec, frac * rec.prec);
        add(rec_out, OutVar::Rainf, frac * rain);
        add(rec_out, OutVar::Snowf, frac * snow);
        add(rec_out, OutVar::Evap, frac * flux.evap);
        rec_out.set_scalar(OutVar::EvapLake, frac * flux.evap);
        rec_out.set_scalar(OutVar::Runoff, runoff - to_lake_runoff + outflow_mm);
        rec_out.set_scalar(OutVar::Baseflow, baseflow - to_lake_baseflow);
        for (var, v) in [
            (OutVar::NetShort, flux.net_short),
            (OutVar::NetLong, flux.net_long),
            (OutVar::Sensible, flux.sensible),
            (OutVar::Latent, flux.latent),
        ] {
            add(rec_out, var, frac * v);
        }
        out.energy_error += frac * flux.error;
        rec_out.set_scalar(OutVar::LakeDepth, lake.depth);
        rec_out.set_scalar(OutVar::LakeIceFract, lake.fraction_ice);
        rec_out.set_scalar(OutVar::LakeSurfTemp, lake.surf_temp);
        rec_out.set_scalar(OutVar::LakeStorage, lake.storage_mm(area));
        Ok(flux)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Aggregation
    // ═══════════════════════════════════════════════════════════════════

    fn aggregate(&self, fluxes: &[Option<TileFlux>]) -> Aggregate {
        let n_layers = self.soil.n_layers();
        let n_bands = self.n_bands();
        let mut rec = OutputRecord::default();
        let mut sum = TileFlux {
            soil_moist: vec![0.0; n_layers],
            soil_ice: vec![0.0; n_layers],
            soil_temp: vec![0.0; n_layers],
            ..TileFlux::default()
        };
        let mut node_temp: Vec<f64> = Vec::new();
        let mut swe_band = vec![0.0; n_bands];
        let mut dominant: Option<(f64, &TileFlux)> = None;
        let mut snow_mass_error: f64 = 0.0;

        for (t, flux) in fluxes.iter().enumerate() {
            let Some(f) = flux else { continue };
            let (veg, band) = (t / n_bands, t % n_bands);
            let w = self.tile_weight(veg, band);
            macro_rules! acc {
                ($($field:ident),+) => { $( sum.$field += w * f.$field; )+ };
            }
            acc!(
                prec, rain, snowfall, evap, evap_canop, transp, evap_bare, sub_snow, sub_canop, sub_blowing,
                runoff, baseflow, net_short, net_long, sensible, latent, ground, delta_h, energy_error,
                surf_temp, snow_surf_temp, snow_pack_temp, swe, snow_depth, snow_cover, snow_canopy, melt, wdew
            );
            for l in 0..n_layers {
                sum.soil_moist[l] += w * f.soil_moist[l];
                sum.soil_ice[l] += w * f.soil_ice[l];
                sum.soil_temp[l] += w * f.soil_temp[l];
            }
            if node_temp.is_empty() {
                node_temp = vec![0.0; f.node_temp.len()];
            }
            for (n, v) in node_temp.iter_mut().zip(&f.node_temp) {
                *n += w * v;
            }
            swe_band[band] += self.slots[veg].cv * f.swe;
            snow_mass_error = snow_mass_error.max(f.snow_mass_error.abs());
            if dominant.map_or(true, |(dw, _)| w > dw) {
                dominant = Some((w, f));
            }
        }

        // Land-only means are reported over the land share of the cell.
        let land = 1.0 - self.lake_fraction();
        let per_land = |v: f64| if land > 0.0 { v / land } else { 0.0 };

        rec.set_scalar(OutVar::Prec, sum.prec);
        rec.set_scalar(OutVar::Rainf, sum.rain);
        rec.set_scalar(OutVar::Snowf, sum.snowfall);
        rec.set_scalar(OutVar::Evap, sum.evap);
        rec.set_scalar(OutVar::EvapCanop, sum.evap_canop);
        rec.set_scalar(OutVar::TranspVeg, sum.transp);
        rec.set_scalar(OutVar::EvapBare, sum.evap_bare);
        rec.set_scalar(OutVar::SubSnow, sum.sub_snow);
        rec.set_scalar(OutVar::SubCanop, sum.sub_canop);
        rec.set_scalar(OutVar::SubBlowing, sum.sub_blowing);
        rec.set_scalar(OutVar::Runoff, sum.runoff);
        rec.set_scalar(OutVar::Baseflow, sum.baseflow);
        rec.set_scalar(OutVar::NetShort, sum.net_short);
        rec.set_scalar(OutVar::NetLong, sum.net_long);
        rec.set_scalar(OutVar::Sensible, sum.sensible);
        rec.set_scalar(OutVar::Latent, sum.latent);
        rec.set_scalar(OutVar::GrndFlux, sum.ground);
        rec.set_scalar(OutVar::DeltaH, sum.delta_h);
        rec.set_scalar(OutVar::SurfTemp, per_land(sum.surf_temp));
        rec.set_scalar(OutVar::SnowSurfTemp, per_land(sum.snow_surf_temp));
        rec.set_scalar(OutVar::SnowPackTemp, per_land(sum.snow_pack_temp));
        rec.set_scalar(OutVar::Swe, sum.swe);
        rec.set(OutVar::SweBand, swe_band);
        rec.set_scalar(OutVar::SnowDepth, sum.snow_depth);
        rec.set_scalar(OutVar::SnowCover, sum.snow_cover);
        rec.set_scalar(OutVar::SnowCanopy, sum.snow_canopy);
        rec.set_scalar(OutVar::SnowMelt, sum.melt);
        rec.set_scalar(OutVar::Wdew, sum.wdew);
        rec.set(OutVar::SoilMoist, sum.soil_moist.clone());
        rec.set(OutVar::SoilIce, sum.soil_ice);
        rec.set(OutVar::SoilTemp, sum.soil_temp.iter().map(|&t| per_land(t)).collect());
        rec.set(OutVar::SoilTnode, node_temp.iter().map(|&t| per_land(t)).collect());
        if let Some((_, f)) = dominant {
            rec.set(OutVar::Fdepth, f.fdepth.clone());
            rec.set(OutVar::Tdepth, f.tdepth.clone());
        }

        Aggregate {
            record: rec,
            energy_error: sum.energy_error,
            snow_mass_error,
        }
    }
}

/// Cell sums carried from aggregation into the closure check.
struct Aggregate {
    record: OutputRecord,
    energy_error: f64,
    snow_mass_error: f64,
}

impl CellState {
    fn soil_water(&self, cell: &Cell) -> f64 {
        let weights = fraction_weights(self.mu, cell.config().options.dist_prcp);
        self.tiles
            .iter()
            .zip(cell.tile_weights())
            .map(|(t, w)| {
                w * t
                    .fractions
                    .iter()
                    .zip(&weights)
                    .map(|(f, fw)| fw * cell.soil.total_water(&f.layers))
                    .sum::<f64>()
            })
            .sum()
    }

    /// Cell-mean snow water equivalent on the ground (mm).
    fn swe(&self, cell: &Cell) -> f64 {
        self.tiles
            .iter()
            .zip(cell.tile_weights())
            .map(|(t, w)| w * t.snow.swq * 1000.0)
            .sum()
    }
}

/// Storage change closure of the step (mm).
fn storage_closure(before: f64, after: f64, r: &OutputRecord) -> f64 {
    before + r.scalar(OutVar::Prec) - r.scalar(OutVar::Evap) - r.scalar(OutVar::Runoff) - r.scalar(OutVar::Baseflow)
        - after
}

fn mix(into: &mut PrecipState, w_into: f64, from: &PrecipState, w_from: f64) {
    let total = w_into + w_from;
    if total <= 0.0 {
        return;
    }
    let (a, b) = (w_into / total, w_from / total);
    for (l, f) in into.layers.iter_mut().zip(&from.layers) {
        l.moist = a * l.moist + b * f.moist;
        l.t = a * l.t + b * f.t;
        for (i, fi) in l.ice.values_mut().iter_mut().zip(f.ice.values()) {
            *i = a * *i + b * fi;
        }
    }
    into.veg_var.wdew = a * into.veg_var.wdew + b * from.veg_var.wdew;
}

/// Move water between fractions when the wet share changes from `old_mu`
/// to `new_mu`; tile-mean storage is unchanged.
pub fn redistribute(fractions: &mut [PrecipState; 2], old_mu: f64, new_mu: f64) {
    let [wet, dry] = fractions;
    if new_mu > old_mu {
        mix(wet, old_mu, dry, new_mu - old_mu);
    } else {
        mix(dry, 1.0 - old_mu, wet, old_mu - new_mu);
    }
    if new_mu >= 1.0 {
        *dry = wet.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canopy::VegClass;
    use crate::forcing::AtmosRecord;
    use crate::soil::{BaseflowParams, LayerParams};
    use crate::tile::{DRY, WET};
    use approx::assert_abs_diff_eq;

    fn layer(depth: f64, init: f64) -> LayerParams {
        LayerParams {
            depth,
            ksat: 150.0,
            expt: 12.0,
            bubble: 25.0,
            quartz: 0.5,
            bulk_density: 1450.0,
            soil_density: 2650.0,
            wcr_fract: 0.7,
            wp_fract: 0.4,
            resid_moist: 0.02,
            init_moist: init,
        }
    }

    fn grass() -> VegClass {
        VegClass {
            name: "grass".to_string(),
            overstory: false,
            lai: [2.0; 12],
            albedo: [0.2; 12],
            roughness: [0.04; 12],
            displacement: [0.3; 12],
            wdmax: None,
            emissivity: 1.0,
            rmin: 120.0,
            rarc: 25.0,
            rad_atten: 0.5,
            wind_atten: 0.5,
            trunk_ratio: 0.2,
        }
    }

    fn params() -> CellParams {
        CellParams {
            id: 7,
            area_m2: 1.0e8,
            elevation: 1200.0,
            soil: SoilParams {
                layers: vec![layer(0.1, 25.0), layer(0.4, 110.0), layer(1.0, 280.0)],
                baseflow: BaseflowParams::Arno {
                    ds: 0.02,
                    dsmax: 8.0,
                    ws: 0.8,
                    c: 2.0,
                },
                b_infilt: 0.25,
                dp: 4.0,
                avg_temp: 6.0,
                init_temps: None,
                frost_slope: 1.0,
                fetch: 1000.0,
            },
            veg: vec![VegTile {
                class: 0,
                cv: 0.6,
                root: vec![0.4, 0.4, 0.2],
            }],
            veg_lib: VegLibrary { classes: vec![grass()] },
            bands: vec![
                BandParams {
                    area_fract: 0.5,
                    elevation: 1000.0,
                    prcp_fract: 0.4,
                    above_treeline: false,
                },
                BandParams {
                    area_fract: 0.5,
                    elevation: 1400.0,
                    prcp_fract: 0.6,
                    above_treeline: false,
                },
            ],
            lake: None,
            config: ModelConfig::default(),
        }
    }

    fn forcing(t: f64, prec: f64) -> AtmosForcingStep {
        let rec = AtmosRecord::new(t, prec / 8.0, 180.0, 310.0, 88.0, 0.7, 2.5);
        AtmosForcingStep::from_substeps(6, vec![rec; 8]).unwrap()
    }

    #[test]
    fn tile_weights_cover_the_cell() {
        let cell = Cell::new(params()).unwrap();
        assert_eq!(cell.n_tiles(), 4);
        let total: f64 = cell.tile_weights().iter().sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cell.tile_weight(1, 0), 0.2, epsilon = 1e-12);
    }

    #[test]
    fn rejects_bad_area_fractions() {
        let mut p = params();
        p.bands[0].area_fract = 0.7;
        assert!(matches!(Cell::new(p), Err(VicError::Parameter { .. })));
    }

    #[test]
    fn step_closes_water_balance() {
        let cell = Cell::new(params()).unwrap();
        let mut state = cell.initial_state().unwrap();
        for p in [0.0, 15.0, 4.0] {
            let out = cell.step(&mut state, &forcing(14.0, p)).unwrap();
            assert!(out.diagnostics.water_error.abs() < 1e-6);
            assert_abs_diff_eq!(out.record.scalar(OutVar::Prec), p, epsilon = 1e-9);
        }
        assert_eq!(state.step, 3);
    }

    #[test]
    fn failed_step_leaves_state_untouched() {
        let cell = Cell::new(params()).unwrap();
        let mut state = cell.initial_state().unwrap();
        let before = state.clone();
        let rec = AtmosRecord::new(10.0, 0.0, 100.0, 300.0, 90.0, 0.5, 2.0);
        let short = AtmosForcingStep::from_substeps(6, vec![rec; 2]).unwrap();
        assert!(cell.step(&mut state, &short).is_err());
        assert_eq!(state, before);
    }

    #[test]
    fn storm_split_conserves_storage() {
        let mut p = params();
        p.config.options.dist_prcp = true;
        let cell = Cell::new(p).unwrap();
        let mut state = cell.initial_state().unwrap();
        let storage = cell.storage(&state);
        let mut wet = state.tiles[0].fractions[WET].clone();
        wet.layers[0].moist += 10.0;
        for tile in state.tiles.iter_mut() {
            tile.fractions[WET] = wet.clone();
        }
        state.mu = 0.3;
        let before = cell.storage(&state);
        let mut shifted = state.clone();
        for tile in shifted.tiles.iter_mut() {
            redistribute(&mut tile.fractions, 0.3, 0.6);
        }
        shifted.mu = 0.6;
        assert_abs_diff_eq!(cell.storage(&shifted), before, epsilon = 1e-9);
        assert!(before > storage);
        assert_eq!(shifted.tiles[0].fractions[DRY], state.tiles[0].fractions[DRY]);
    }

    #[test]
    fn cell_flux_is_exactly_the_weighted_tile_sum() {
        let mut p = params();
        p.config.options.dist_prcp = true;
        let cell = Cell::new(p).unwrap();
        let mut state = cell.initial_state().unwrap();
        let f = forcing(12.0, 18.0);

        let mut next = state.clone();
        cell.update_storm(&mut next, f.record(StepIndex::Whole).prec);
        assert!(next.mu < 1.0);
        let mut fluxes = Vec::new();
        for (t, tile) in next.tiles.iter_mut().enumerate() {
            let (veg, band) = (t / cell.n_bands(), t % cell.n_bands());
            let (tfactor, pfactor) = cell.band_factors(band);
            let band_forcing = f.for_band(tfactor, pfactor);
            let inputs = TileInputs {
                forcing: &band_forcing,
                soil: &cell.soil,
                cover: cell.cover(veg, band, f.month).unwrap(),
                mu: next.mu,
                config: cell.config(),
            };
            fluxes.push((cell.tile_weight(veg, band), solve_tile(tile, &inputs).unwrap()));
        }

        let out = cell.step(&mut state, &f).unwrap();
        let weighted = |field: fn(&TileFlux) -> f64| fluxes.iter().fold(0.0, |acc, (w, tf)| acc + w * field(tf));
        assert_eq!(out.record.scalar(OutVar::Runoff), weighted(|tf| tf.runoff));
        assert_eq!(out.record.scalar(OutVar::Baseflow), weighted(|tf| tf.baseflow));
        assert_eq!(out.record.scalar(OutVar::Evap), weighted(|tf| tf.evap));
        assert_eq!(out.record.scalar(OutVar::Latent), weighted(|tf| tf.latent));
        assert_eq!(out.record.scalar(OutVar::Prec), weighted(|tf| tf.prec));
    }

    fn lake_params() -> CellParams {
        let mut p = params();
        p.config.options.lakes = true;
        p.lake = Some(LakeParams {
            fraction: 0.2,
            wetland_veg: 0,
            bathymetry: crate::lake::Bathymetry::PowerLaw {
                max_depth: 5.0,
                max_area: 2.0e7,
                b: 1.0,
            },
            mindepth: 1.0,
            maxrate: 2.0,
            rpercent: 1.0,
            bpercent: 1.0,
            depth_in: 3.0,
            nodes: 10,
        });
        p
    }

    #[test]
    fn lake_is_carved_from_the_wetland_tile() {
        let cell = Cell::new(lake_params()).unwrap();
        for band in 0..cell.n_bands() {
            assert_abs_diff_eq!(cell.tile_weight(0, band), 0.2, epsilon = 1e-12);
            assert_abs_diff_eq!(cell.tile_weight(1, band), 0.2, epsilon = 1e-12);
        }
        let land: f64 = cell.tile_weights().iter().sum();
        assert_abs_diff_eq!(land + 0.2, 1.0, epsilon = 1e-12);

        let mut p = lake_params();
        if let Some(lake) = p.lake.as_mut() {
            lake.fraction = 0.7;
        }
        assert!(matches!(Cell::new(p), Err(VicError::Parameter { .. })));
    }

    #[test]
    fn lake_cell_closes_water_and_routes_outflow_to_runoff() {
        let cell = Cell::new(lake_params()).unwrap();
        let mut state = cell.initial_state().unwrap();
        let area = cell.params.area_m2;
        for p in [0.0, 25.0, 6.0, 0.0] {
            let out = cell.step(&mut state, &forcing(14.0, p)).unwrap();
            assert!(out.diagnostics.water_error.abs() < 1e-6);
            assert_abs_diff_eq!(out.record.scalar(OutVar::Prec), p, epsilon = 1e-9);
            let lake = state.lake.as_ref().unwrap();
            assert!(lake.outflow > 0.0);
            // All land runoff and baseflow pass through the lake
            let outflow_mm = lake.outflow / area * 1000.0;
            assert_abs_diff_eq!(out.record.scalar(OutVar::Runoff), outflow_mm, epsilon = 1e-12);
            assert_abs_diff_eq!(out.record.scalar(OutVar::Baseflow), 0.0, epsilon = 1e-12);
            assert!(out.record.scalar(OutVar::LakeStorage) > 0.0);
        }
    }
}
