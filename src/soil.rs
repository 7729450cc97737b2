// Soil column parameters and layer moisture bookkeeping: infiltration,
// drainage, baseflow, evaporation extraction and the frozen/liquid split.

use serde::{Deserialize, Serialize};

use crate::config::ModelOptions;
use crate::constants::*;
use crate::error::{VicError, VicResult};
use crate::thermal::{max_unfrozen_fraction, NodeGrid, NodeSoil, NodeState};

// ═══════════════════════════════════════════════════════════════════════
// Parameters
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerParams {
    pub depth: f64,        // m
    pub ksat: f64,         // saturated hydraulic conductivity (mm/day)
    pub expt: f64,         // Brooks-Corey exponent, 3 + 2/lambda
    pub bubble: f64,       // bubbling pressure (cm)
    pub quartz: f64,       // quartz fraction
    pub bulk_density: f64, // kg/m^3
    pub soil_density: f64, // kg/m^3
    pub wcr_fract: f64,    // critical point as a fraction of max_moist
    pub wp_fract: f64,     // wilting point as a fraction of max_moist
    pub resid_moist: f64,  // residual moisture (m3/m3)
    pub init_moist: f64,   // initial moisture (mm)
}

/// Baseflow parametrization of the bottom layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum BaseflowParams {
    /// `ds` and `ws` are fractions, `dsmax` in mm/day.
    Arno { ds: f64, dsmax: f64, ws: f64, c: f64 },
    /// `d1` (1/day), `d2` (mm/day), `d3` (mm), `d4` (exponent).
    Nijssen2001 { d1: f64, d2: f64, d3: f64, d4: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoilParams {
    pub layers: Vec<LayerParams>,
    pub baseflow: BaseflowParams,
    pub b_infilt: f64,       // variable infiltration curve shape
    pub dp: f64,             // soil thermal damping depth (m)
    pub avg_temp: f64,       // average soil temperature, bottom boundary (C)
    #[serde(default)]
    pub init_temps: Option<Vec<f64>>, // initial layer temperatures (C)
    #[serde(default = "default_frost_slope")]
    pub frost_slope: f64,    // temperature spread across frost subareas (C)
    #[serde(default = "default_fetch")]
    pub fetch: f64,          // blowing snow fetch (m)
}

fn default_frost_slope() -> f64 {
    1.0
}

fn default_fetch() -> f64 {
    1000.0
}

/// ARNO baseflow coefficients in their working form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArnoBaseflow {
    pub ds: f64,
    pub dsmax: f64, // mm/day
    pub ws: f64,
    pub c: f64,
}

impl ArnoBaseflow {
    /// Convert either parametrization for a bottom layer holding `max_moist` mm.
    pub fn from_params(params: &BaseflowParams, max_moist: f64) -> VicResult<Self> {
        let arno = match *params {
            BaseflowParams::Arno { ds, dsmax, ws, c } => ArnoBaseflow { ds, dsmax, ws, c },
            BaseflowParams::Nijssen2001 { d1, d2, d3, d4 } => {
                if !(d3 < max_moist) {
                    return Err(VicError::parameter("d3", d3, "must be below the bottom layer capacity"));
                }
                let dsmax = d2 * (1.0 / (max_moist - d3)).powf(-d4) + d1 * max_moist;
                ArnoBaseflow {
                    ds: if dsmax > 0.0 { d1 * d3 / dsmax } else { 0.0 },
                    dsmax,
                    ws: d3 / max_moist,
                    c: d4,
                }
            }
        };
        if !(0.0..=1.0).contains(&arno.ds) || !(arno.ws > 0.0 && arno.ws <= 1.0) || arno.dsmax < 0.0 {
            return Err(VicError::parameter("baseflow", arno.ds, "Ds and Ws must be fractions"));
        }
        Ok(arno)
    }

    /// Baseflow rate (mm/day) for bottom-layer moisture `moist`.
    pub fn rate(&self, moist: f64, max_moist: f64) -> f64 {
        let moist = moist.max(0.0);
        let threshold = self.ws * max_moist;
        let mut rate = self.ds * self.dsmax / threshold * moist;
        if moist > threshold {
            let frac = ((moist - threshold) / (max_moist - threshold)).min(1.0);
            rate += self.dsmax * (1.0 - self.ds / self.ws) * frac.powf(self.c);
        }
        rate
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Layer state
// ═══════════════════════════════════════════════════════════════════════

/// Frozen water in a layer, uniform or per frost subarea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IceContent {
    Uniform(f64),
    Distributed(Vec<f64>),
}

impl IceContent {
    /// Area-weighted ice (mm).
    pub fn mean(&self, frost_fract: &[f64]) -> f64 {
        match self {
            IceContent::Uniform(ice) => *ice,
            IceContent::Distributed(ice) => ice.iter().zip(frost_fract).map(|(i, f)| i * f).sum(),
        }
    }

    pub fn values(&self) -> &[f64] {
        match self {
            IceContent::Uniform(ice) => std::slice::from_ref(ice),
            IceContent::Distributed(ice) => ice,
        }
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        match self {
            IceContent::Uniform(ice) => std::slice::from_mut(ice),
            IceContent::Distributed(ice) => ice,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerState {
    pub moist: f64,      // liquid water (mm)
    pub ice: IceContent, // frozen water (mm)
    pub t: f64,          // C
    pub kappa: f64,      // W/m/K
    pub cs: f64,         // J/m^3/K
    pub evap: f64,       // evaporation + transpiration this step (mm)
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RunoffFlux {
    pub runoff: f64,       // surface runoff (mm)
    pub baseflow: f64,     // mm
    pub infiltration: f64, // mm
}

// ═══════════════════════════════════════════════════════════════════════
// Soil column
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoilColumn {
    pub layers: Vec<LayerParams>,
    pub max_moist: Vec<f64>, // mm
    pub resid: Vec<f64>,     // mm
    pub wcr: Vec<f64>,       // mm
    pub wp: Vec<f64>,        // mm
    pub arno: ArnoBaseflow,
    pub b_infilt: f64,
    pub max_infil: f64, // mm
    pub grid: NodeGrid,
    pub layer_soil: Vec<NodeSoil>,
    pub frost_fract: Vec<f64>,
    pub frost_slope: f64,
    pub dp: f64,
    pub avg_temp: f64,
    pub init_temps: Vec<f64>,
    pub fetch: f64,
}

impl SoilColumn {
    pub fn new(params: &SoilParams, options: &ModelOptions) -> VicResult<Self> {
        let n = params.layers.len();
        if n < 2 {
            return Err(VicError::Shape {
                name: "soil layers",
                expected: 2,
                actual: n,
            });
        }

        let mut max_moist = Vec::with_capacity(n);
        let mut resid = Vec::with_capacity(n);
        let mut wcr = Vec::with_capacity(n);
        let mut wp = Vec::with_capacity(n);
        let mut node_soil = Vec::with_capacity(n);
        for layer in &params.layers {
            if !(layer.depth >= MIN_SOIL_DEPTH) {
                return Err(VicError::parameter("depth", layer.depth, "layer too thin"));
            }
            if !(layer.soil_density > layer.bulk_density && layer.bulk_density > 0.0) {
                return Err(VicError::parameter(
                    "bulk_density",
                    layer.bulk_density,
                    "must be positive and below the particle density",
                ));
            }
            if !(layer.ksat >= 0.0) || !(layer.expt > 3.0) {
                return Err(VicError::parameter("expt", layer.expt, "must exceed 3"));
            }
            let porosity = 1.0 - layer.bulk_density / layer.soil_density;
            let mm = porosity * layer.depth * 1000.0;
            let r = layer.resid_moist * layer.depth * 1000.0;
            if !(r >= 0.0 && r < mm) {
                return Err(VicError::parameter(
                    "resid_moist",
                    layer.resid_moist,
                    "must lie in [0, porosity)",
                ));
            }
            if !(layer.init_moist >= 0.0 && layer.init_moist <= mm) {
                return Err(VicError::parameter(
                    "init_moist",
                    layer.init_moist,
                    "must lie in [0, max_moist]",
                ));
            }
            if !(layer.wp_fract <= layer.wcr_fract && layer.wcr_fract <= 1.0 && layer.wp_fract >= 0.0) {
                return Err(VicError::parameter(
                    "wp_fract",
                    layer.wp_fract,
                    "wilting point must not exceed the critical point",
                ));
            }
            max_moist.push(mm);
            resid.push(r);
            wcr.push(layer.wcr_fract * mm);
            wp.push(layer.wp_fract * mm);
            node_soil.push(NodeSoil {
                porosity,
                expt: layer.expt,
                bubble: layer.bubble,
                quartz: layer.quartz,
                bulk_density: layer.bulk_density,
                soil_density: layer.soil_density,
            });
        }
        if !(params.b_infilt > 0.0) {
            return Err(VicError::parameter("b_infilt", params.b_infilt, "must be positive"));
        }

        let depths: Vec<f64> = params.layers.iter().map(|l| l.depth).collect();
        let grid = NodeGrid::new(&depths, &node_soil, params.dp, options.nnode)?;
        let arno = ArnoBaseflow::from_params(&params.baseflow, max_moist[n - 1])?;

        let top_max: f64 = max_moist[..n - 1].iter().sum();
        let n_frost = options.n_frost();
        let frost_fract = vec![1.0 / n_frost as f64; n_frost];

        let init_temps = match &params.init_temps {
            Some(t) if t.len() == n => t.clone(),
            Some(t) => {
                return Err(VicError::Shape {
                    name: "init_temps",
                    expected: n,
                    actual: t.len(),
                })
            }
            None => vec![params.avg_temp; n],
        };

        Ok(SoilColumn {
            layers: params.layers.clone(),
            max_moist,
            resid,
            wcr,
            wp,
            arno,
            b_infilt: params.b_infilt,
            max_infil: (1.0 + params.b_infilt) * top_max,
            grid,
            layer_soil: node_soil,
            frost_fract,
            frost_slope: params.frost_slope,
            dp: params.dp,
            avg_temp: params.avg_temp,
            init_temps,
            fetch: params.fetch,
        })
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn depths(&self) -> Vec<f64> {
        self.layers.iter().map(|l| l.depth).collect()
    }

    /// Initial layer states with the frozen split already applied.
    pub fn initial_layers(&self, options: &ModelOptions) -> Vec<LayerState> {
        let mut layers: Vec<LayerState> = self
            .layers
            .iter()
            .enumerate()
            .map(|(l, p)| LayerState {
                moist: p.init_moist,
                ice: if options.frost_subareas.is_some() {
                    IceContent::Distributed(vec![0.0; self.frost_fract.len()])
                } else {
                    IceContent::Uniform(0.0)
                },
                t: self.init_temps[l],
                kappa: 0.0,
                cs: 0.0,
                evap: 0.0,
            })
            .collect();
        self.partition_ice(&mut layers, options.frozen_soil);
        let volumetric = self.volumetric_water(&layers);
        for (l, layer) in layers.iter_mut().enumerate() {
            let soil = &self.layer_soil[l];
            let ice_v = layer.ice.mean(&self.frost_fract) / (self.layers[l].depth * 1000.0);
            layer.kappa = soil.conductivity(volumetric[l], ice_v);
            layer.cs = soil.heat_capacity(volumetric[l], ice_v);
        }
        layers
    }

    /// Liquid plus frozen water (mm) in layer `l`.
    pub fn layer_water(&self, layer: &LayerState) -> f64 {
        layer.moist + layer.ice.mean(&self.frost_fract)
    }

    /// Column water (mm).
    pub fn total_water(&self, layers: &[LayerState]) -> f64 {
        layers.iter().map(|l| self.layer_water(l)).sum()
    }

    /// Volumetric total water content per layer (m3/m3).
    pub fn volumetric_water(&self, layers: &[LayerState]) -> Vec<f64> {
        layers
            .iter()
            .zip(&self.layers)
            .map(|(s, p)| self.layer_water(s) / (p.depth * 1000.0))
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Runoff, drainage and baseflow
    // ═══════════════════════════════════════════════════════════════════

    /// Saturated-area runoff from the variable infiltration curve over the
    /// upper zone (every layer above the bottom one).
    pub fn surface_runoff(&self, layers: &[LayerState], inflow: f64) -> f64 {
        if inflow <= 0.0 {
            return 0.0;
        }
        let top = self.n_layers() - 1;
        let top_max: f64 = self.max_moist[..top].iter().sum();
        let top_moist: f64 = layers[..top].iter().map(|l| self.layer_water(l)).sum::<f64>().min(top_max);
        if self.max_infil <= 0.0 {
            return inflow;
        }
        let b = self.b_infilt;
        let ex = b / (1.0 + b);
        let a = 1.0 - (1.0 - top_moist / top_max).max(0.0).powf(ex);
        let i0 = self.max_infil * (1.0 - (1.0 - a).max(0.0).powf(1.0 / b));
        let runoff = if i0 + inflow >= self.max_infil {
            inflow - top_max + top_moist
        } else {
            let basis = 1.0 - (i0 + inflow) / self.max_infil;
            inflow - top_max + top_moist + top_max * basis.powf(1.0 + b)
        };
        runoff.clamp(0.0, inflow)
    }

    /// Route `inflow` (mm) through the column over `dt_hours`.
    ///
    /// Drainage and baseflow are integrated on hourly sub-steps. Water above a
    /// layer's free pore space moves to the layer below; overflow of the
    /// bottom layer leaves as baseflow.
    pub fn runoff(&self, layers: &mut [LayerState], inflow: f64, dt_hours: f64) -> RunoffFlux {
        let n = self.n_layers();
        let runoff = self.surface_runoff(layers, inflow);
        let infiltration = inflow - runoff;
        let mut baseflow = 0.0;

        let n_sub = dt_hours.ceil().max(1.0) as usize;
        let sub_dt = dt_hours / n_sub as f64;
        let mut drain = vec![0.0; n];

        for _ in 0..n_sub {
            layers[0].moist += infiltration / n_sub as f64;
            baseflow += self.push_excess(layers);

            for l in 0..n - 1 {
                let ice = layers[l].ice.mean(&self.frost_fract);
                let available = (layers[l].moist - self.resid[l]).max(0.0);
                let span = self.max_moist[l] - ice - self.resid[l];
                drain[l] = if span > 0.0 && available > 0.0 {
                    let se = (available / span).min(1.0);
                    let q = self.layers[l].ksat / HOURS_PER_DAY * sub_dt * se.powf(self.layers[l].expt);
                    q.min(available)
                } else {
                    0.0
                };
            }
            for l in 0..n - 1 {
                layers[l].moist -= drain[l];
                layers[l + 1].moist += drain[l];
            }

            let bottom = n - 1;
            let available = (layers[bottom].moist - self.resid[bottom]).max(0.0);
            let bf = (self.arno.rate(self.layer_water(&layers[bottom]), self.max_moist[bottom])
                / HOURS_PER_DAY
                * sub_dt)
                .min(available);
            layers[bottom].moist -= bf;
            baseflow += bf;

            baseflow += self.push_excess(layers);
        }

        RunoffFlux {
            runoff,
            baseflow,
            infiltration,
        }
    }

    /// Move water above each layer's capacity downward; returns the overflow
    /// of the bottom layer (mm).
    pub fn push_excess(&self, layers: &mut [LayerState]) -> f64 {
        let n = layers.len();
        let mut overflow = 0.0;
        for l in 0..n {
            let excess = self.layer_water(&layers[l]) - self.max_moist[l];
            if excess > 0.0 {
                let moved = excess.min(layers[l].moist);
                layers[l].moist -= moved;
                if l + 1 < n {
                    layers[l + 1].moist += moved;
                } else {
                    overflow += moved;
                }
            }
        }
        overflow
    }

    // ═══════════════════════════════════════════════════════════════════
    // Evaporation
    // ═══════════════════════════════════════════════════════════════════

    /// Withdraw per-layer demand (mm), never below residual moisture.
    /// Negative demand on the top layer is condensation.
    pub fn extract(&self, layers: &mut [LayerState], demand: &[f64]) -> Vec<f64> {
        let mut actual = vec![0.0; layers.len()];
        for (l, layer) in layers.iter_mut().enumerate() {
            let d = demand.get(l).copied().unwrap_or(0.0);
            if d < 0.0 {
                layer.moist -= d;
                actual[l] = d;
            } else {
                let take = d.min((layer.moist - self.resid[l]).max(0.0));
                layer.moist -= take;
                actual[l] = take;
            }
            layer.evap += actual[l];
        }
        actual
    }

    /// Water (mm) that evaporation may still remove from the column.
    pub fn extractable(&self, layers: &[LayerState]) -> Vec<f64> {
        layers
            .iter()
            .enumerate()
            .map(|(l, s)| (s.moist - self.resid[l]).max(0.0))
            .collect()
    }

    /// Fraction of the surface that is saturated, from the infiltration curve
    /// applied to the top layer.
    pub fn saturated_fraction(&self, layers: &[LayerState]) -> f64 {
        let ratio = (self.layer_water(&layers[0]) / self.max_moist[0]).clamp(0.0, 1.0);
        let b = self.b_infilt;
        1.0 - (1.0 - ratio).powf(b / (1.0 + b))
    }

    /// Bare soil evaporation efficiency (0..1).
    pub fn bare_soil_efficiency(&self, layers: &[LayerState]) -> f64 {
        let as_ = self.saturated_fraction(layers);
        let ratio = ((layers[0].moist - self.resid[0]) / (self.max_moist[0] - self.resid[0])).clamp(0.0, 1.0);
        (as_ + (1.0 - as_) * ratio).clamp(0.0, 1.0)
    }

    /// Transpiration soil moisture stress per layer (0..1).
    pub fn moisture_stress(&self, layers: &[LayerState]) -> Vec<f64> {
        layers
            .iter()
            .enumerate()
            .map(|(l, s)| {
                let w = s.moist;
                if w >= self.wcr[l] {
                    1.0
                } else if w > self.wp[l] && self.wcr[l] > self.wp[l] {
                    (w - self.wp[l]) / (self.wcr[l] - self.wp[l])
                } else {
                    0.0
                }
            })
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Frozen partition
    // ═══════════════════════════════════════════════════════════════════

    /// Split each layer's water into liquid and ice from the layer
    /// temperature; frost subareas spread temperatures linearly by
    /// `frost_slope` around the layer mean.
    pub fn partition_ice(&self, layers: &mut [LayerState], frozen: bool) {
        let nf = self.frost_fract.len();
        for (l, layer) in layers.iter_mut().enumerate() {
            let total = layer.moist + layer.ice.mean(&self.frost_fract);
            let p = &self.layers[l];
            let max = self.max_moist[l];
            let mut cum = 0.0;
            let fract = &self.frost_fract;
            let slope = self.frost_slope;
            let t_mean = layer.t;
            for (k, ice) in layer.ice.values_mut().iter_mut().enumerate() {
                let t_k = if nf > 1 {
                    let centre = cum + 0.5 * fract[k];
                    cum += fract[k];
                    t_mean + slope * (centre - 0.5)
                } else {
                    t_mean
                };
                *ice = if frozen && t_k < 0.0 {
                    (total - max * max_unfrozen_fraction(t_k, p.bubble, p.expt)).max(0.0)
                } else {
                    0.0
                };
            }
            let ice_mean = layer.ice.mean(&self.frost_fract);
            layer.moist = (total - ice_mean).max(0.0);
        }
    }

    /// Layer temperatures and thermal properties averaged from the nodes.
    pub fn update_layer_thermal(&self, layers: &mut [LayerState], nodes: &[NodeState]) {
        let t = self.grid.layer_average(|i| nodes[i].t);
        let k = self.grid.layer_average(|i| nodes[i].kappa);
        let c = self.grid.layer_average(|i| nodes[i].cs);
        for (l, layer) in layers.iter_mut().enumerate() {
            layer.t = t[l];
            layer.kappa = k[l];
            layer.cs = c[l];
        }
    }

    /// Moisture bounds that must hold after every update.
    pub fn check_bounds(&self, layers: &[LayerState]) -> VicResult<()> {
        for (l, layer) in layers.iter().enumerate() {
            let ice = layer.ice.mean(&self.frost_fract);
            if layer.moist < -SMALL || layer.ice.values().iter().any(|i| *i < -SMALL) {
                return Err(VicError::physical(format!(
                    "layer {} holds negative water (liquid {:.6}, ice {:.6})",
                    l, layer.moist, ice
                )));
            }
            if layer.moist + ice > self.max_moist[l] + 1.0e-6 {
                return Err(VicError::physical(format!(
                    "layer {} water {:.6} exceeds capacity {:.6}",
                    l,
                    layer.moist + ice,
                    self.max_moist[l]
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    pub(crate) fn layer(depth: f64, init: f64) -> LayerParams {
        LayerParams {
            depth,
            ksat: 200.0,
            expt: 11.0,
            bubble: 20.0,
            quartz: 0.4,
            bulk_density: 1450.0,
            soil_density: 2650.0,
            wcr_fract: 0.7,
            wp_fract: 0.3,
            resid_moist: 0.02,
            init_moist: init,
        }
    }

    fn params() -> SoilParams {
        SoilParams {
            layers: vec![layer(0.1, 30.0), layer(0.4, 120.0), layer(1.0, 300.0)],
            baseflow: BaseflowParams::Arno {
                ds: 0.1,
                dsmax: 10.0,
                ws: 0.8,
                c: 2.0,
            },
            b_infilt: 0.2,
            dp: 4.0,
            avg_temp: 5.0,
            init_temps: None,
            frost_slope: 1.0,
            fetch: 1000.0,
        }
    }

    fn column(options: &ModelOptions) -> SoilColumn {
        SoilColumn::new(&params(), options).unwrap()
    }

    #[test]
    fn nijssen_parameters_convert_to_arno_form() {
        let max = 400.0;
        let arno = ArnoBaseflow::from_params(
            &BaseflowParams::Nijssen2001 {
                d1: 0.01,
                d2: 0.05,
                d3: 300.0,
                d4: 2.0,
            },
            max,
        )
        .unwrap();
        assert_abs_diff_eq!(arno.dsmax, 0.05 * 100.0_f64.powi(2) + 0.01 * max, epsilon = 1e-9);
        assert_abs_diff_eq!(arno.ws, 0.75, epsilon = 1e-12);
        // Below Ws the rate is linear with slope d1
        assert_abs_diff_eq!(arno.rate(100.0, max), 0.01 * 100.0, epsilon = 1e-9);
        assert_abs_diff_eq!(arno.rate(max, max), arno.dsmax, epsilon = 1e-9);
    }

    #[test]
    fn infiltration_curve_saturates_on_large_inflow() {
        let opts = ModelOptions::default();
        let col = column(&opts);
        let layers = col.initial_layers(&opts);
        let small = col.surface_runoff(&layers, 1.0);
        let large = col.surface_runoff(&layers, 500.0);
        assert!(small >= 0.0 && small < 1.0);
        let top_room: f64 = (0..2).map(|l| col.max_moist[l] - col.layer_water(&layers[l])).sum();
        assert_abs_diff_eq!(large, 500.0 - top_room, epsilon = 1e-6);
    }

    #[test]
    fn runoff_keeps_moisture_within_bounds_and_conserves_water() {
        let opts = ModelOptions::default();
        let col = column(&opts);
        let mut layers = col.initial_layers(&opts);
        for inflow in [0.0, 5.0, 80.0, 400.0] {
            let before = col.total_water(&layers);
            let flux = col.runoff(&mut layers, inflow, 24.0);
            let after = col.total_water(&layers);
            assert_abs_diff_eq!(
                before + inflow - flux.runoff - flux.baseflow,
                after,
                epsilon = 1e-9
            );
            col.check_bounds(&layers).unwrap();
            for (l, s) in layers.iter().enumerate() {
                assert!(s.moist >= 0.0 && s.moist <= col.max_moist[l] + 1e-9);
            }
        }
    }

    #[test]
    fn evaporation_never_takes_residual_moisture() {
        let opts = ModelOptions::default();
        let col = column(&opts);
        let mut layers = col.initial_layers(&opts);
        let actual = col.extract(&mut layers, &[1000.0, 0.0, 0.0]);
        assert_abs_diff_eq!(layers[0].moist, col.resid[0], epsilon = 1e-12);
        assert_abs_diff_eq!(actual[0], 30.0 - col.resid[0], epsilon = 1e-12);
    }

    #[test]
    fn frozen_partition_conserves_water() {
        let opts = ModelOptions {
            frozen_soil: true,
            frost_subareas: Some(3),
            ..ModelOptions::default()
        };
        let col = column(&opts);
        let mut layers = col.initial_layers(&opts);
        let before = col.total_water(&layers);
        layers[0].t = -3.0;
        layers[1].t = -0.2;
        col.partition_ice(&mut layers, true);
        assert_abs_diff_eq!(col.total_water(&layers), before, epsilon = 1e-9);
        assert!(layers[0].ice.mean(&col.frost_fract) > 0.0);
        assert_eq!(layers[2].ice.mean(&col.frost_fract), 0.0);
        if let IceContent::Distributed(ice) = &layers[0].ice {
            // The coldest subarea holds the most ice
            assert!(ice[0] >= ice[1] && ice[1] >= ice[2]);
        } else {
            panic!("expected distributed ice");
        }
        col.check_bounds(&layers).unwrap();
    }

    #[test]
    fn too_few_layers_is_rejected() {
        let mut p = params();
        p.layers.truncate(1);
        assert!(SoilColumn::new(&p, &ModelOptions::default()).is_err());
    }
}
