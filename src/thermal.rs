// Soil thermal node profile: fixed node geometry, conduction properties and
// the Crank-Nicolson heat diffusion update with optional freezing.

use serde::{Deserialize, Serialize};

use crate::config::{BracketWidths, DiffusionSettings, LowerBoundary};
use crate::constants::*;
use crate::error::{SolveVariable, VicError, VicResult};
use crate::root::{RootError, RootSolver, Widen};

// ═══════════════════════════════════════════════════════════════════════
// Tridiagonal solve (Thomas algorithm)
// ═══════════════════════════════════════════════════════════════════════

/// Solve a tridiagonal system. `a[i]` multiplies x[i-1] and `c[i]` multiplies
/// x[i+1] in row i; `a[0]` and `c[n-1]` are ignored.
pub fn tridiag(a: &[f64], b: &[f64], c: &[f64], r: &[f64], x: &mut [f64]) {
    let n = b.len();
    if n == 0 {
        return;
    }
    // Forward sweep normalises every row to a unit diagonal
    let mut upper = vec![0.0; n];
    let mut rhs = vec![0.0; n];
    upper[0] = if n > 1 { c[0] / b[0] } else { 0.0 };
    rhs[0] = r[0] / b[0];
    for i in 1..n {
        let pivot = b[i] - a[i] * upper[i - 1];
        upper[i] = if i + 1 < n { c[i] / pivot } else { 0.0 };
        rhs[i] = (r[i] - a[i] * rhs[i - 1]) / pivot;
    }
    x[n - 1] = rhs[n - 1];
    for i in (0..n - 1).rev() {
        x[i] = rhs[i] - upper[i] * x[i + 1];
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Soil thermal properties
// ═══════════════════════════════════════════════════════════════════════

/// Soil properties seen by one thermal node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeSoil {
    pub porosity: f64,     // m3/m3
    pub expt: f64,         // Brooks-Corey exponent
    pub bubble: f64,       // bubbling pressure (cm)
    pub quartz: f64,       // quartz fraction of solids
    pub bulk_density: f64, // kg/m^3
    pub soil_density: f64, // kg/m^3
}

/// Largest unfrozen fraction of the pore space at temperature `t` (C).
pub fn max_unfrozen_fraction(t: f64, bubble: f64, expt: f64) -> f64 {
    if t >= 0.0 || expt <= 3.0 || bubble <= 0.0 {
        return 1.0;
    }
    let suction = (-LF * t) / 273.16 / (G * bubble / 100.0);
    suction.powf(-2.0 / (expt - 3.0)).clamp(0.0, 1.0)
}

impl NodeSoil {
    /// Equilibrium ice content (m3/m3 of water) for total water `moist`.
    pub fn ice(&self, moist: f64, t: f64, frozen: bool) -> f64 {
        if !frozen || t >= 0.0 {
            return 0.0;
        }
        let unfrozen = self.porosity * max_unfrozen_fraction(t, self.bubble, self.expt);
        (moist - unfrozen).max(0.0)
    }

    /// Volumetric heat capacity (J/m^3/K).
    pub fn heat_capacity(&self, moist: f64, ice: f64) -> f64 {
        CH_SOLIDS * (1.0 - self.porosity) + CH_WATER * (moist - ice).max(0.0) + CH_ICE * ice
    }

    /// Thermal conductivity (W/m/K) following Johansen.
    pub fn conductivity(&self, moist: f64, ice: f64) -> f64 {
        let porosity = self.porosity.max(SMALL);
        let sr = (moist / porosity).clamp(0.0, 1.0);
        let unfrozen = (moist - ice).max(0.0);
        let kdry = (0.135 * self.bulk_density + 64.7) / (self.soil_density - 0.947 * self.bulk_density);
        if sr <= 0.0 {
            return kdry;
        }
        let ko: f64 = if self.quartz > 0.2 { 2.0 } else { 3.0 };
        let ks = HCON_QUARTZ.powf(self.quartz) * ko.powf(1.0 - self.quartz);
        let (ke, ksat) = if ice <= 0.0 {
            let ke = if sr > 0.05 { 0.7 * sr.log10() + 1.0 } else { 0.0 };
            (ke, ks.powf(1.0 - porosity) * HCON_WAT.powf(porosity))
        } else {
            let ksat = ks.powf(1.0 - porosity)
                * HCON_ICE.powf((porosity - unfrozen).max(0.0))
                * HCON_WAT.powf(unfrozen);
            (sr, ksat)
        };
        (ksat - kdry) * ke.max(0.0) + kdry
    }

    /// Enthalpy per unit volume (J/m^3) relative to unfrozen soil at 0C.
    pub fn enthalpy(&self, moist: f64, t: f64, frozen: bool) -> f64 {
        let ice = self.ice(moist, t, frozen);
        self.heat_capacity(moist, ice) * t - RHO_W * LF * ice
    }
}

/// State of one thermal node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub t: f64,     // C
    pub moist: f64, // total water (m3/m3)
    pub ice: f64,   // frozen water (m3/m3)
    pub kappa: f64, // W/m/K
    pub cs: f64,    // J/m^3/K
}

impl NodeState {
    pub fn new(soil: &NodeSoil, t: f64, moist: f64, frozen: bool) -> Self {
        let ice = soil.ice(moist, t, frozen);
        NodeState {
            t,
            moist,
            ice,
            kappa: soil.conductivity(moist, ice),
            cs: soil.heat_capacity(moist, ice),
        }
    }

    fn refresh(&mut self, soil: &NodeSoil) {
        self.kappa = soil.conductivity(self.moist, self.ice);
        self.cs = soil.heat_capacity(self.moist, self.ice);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Node geometry
// ═══════════════════════════════════════════════════════════════════════

/// Boundary condition at the surface node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpperBoundary {
    Temperature(f64), // fixed surface temperature (C)
    Flux(f64),        // heat flux into the soil (W/m^2)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffusionResult {
    pub ground_flux: f64, // time-weighted flux into the soil at the surface (W/m^2)
    pub iterations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGrid {
    pub depth: Vec<f64>,     // node depths (m)
    pub alpha: Vec<f64>,     // distance between neighbouring nodes i-1 and i+1
    pub beta: Vec<f64>,      // distance to the node above
    pub gamma: Vec<f64>,     // distance to the node below
    pub thickness: Vec<f64>, // control volume thickness (m)
    pub t1_index: usize,     // node at the bottom of the first layer
    pub dp: f64,             // damping depth (m)
    pub node_layer: Vec<usize>,
    pub layer_weights: Vec<Vec<f64>>, // [layer][node] control volume overlap
    pub soil: Vec<NodeSoil>,
}

impl NodeGrid {
    /// Node 0 at the surface, node 1 at the bottom of the first layer and the
    /// rest evenly spaced down to the damping depth.
    pub fn new(
        layer_depths: &[f64],
        layer_soil: &[NodeSoil],
        dp: f64,
        nnode: usize,
    ) -> VicResult<Self> {
        if layer_depths.is_empty() || layer_depths.len() != layer_soil.len() {
            return Err(VicError::Shape {
                name: "layer soil properties",
                expected: layer_depths.len(),
                actual: layer_soil.len(),
            });
        }
        if nnode < 3 {
            return Err(VicError::parameter("nnode", nnode as f64, "at least three nodes"));
        }
        let total: f64 = layer_depths.iter().sum();
        let d1 = layer_depths[0];
        if !(dp >= total) || dp <= d1 {
            return Err(VicError::parameter(
                "dp",
                dp,
                "damping depth must reach the bottom of the soil column",
            ));
        }

        let n = nnode;
        let mut depth = vec![0.0; n];
        depth[1] = d1;
        let dz = (dp - d1) / (n - 2) as f64;
        for (k, z) in depth.iter_mut().enumerate().skip(2) {
            *z = d1 + (k - 1) as f64 * dz;
        }

        let mut alpha = vec![0.0; n];
        let mut beta = vec![0.0; n];
        let mut gamma = vec![0.0; n];
        let mut thickness = vec![0.0; n];
        for i in 0..n {
            if i > 0 {
                beta[i] = depth[i] - depth[i - 1];
            }
            if i + 1 < n {
                gamma[i] = depth[i + 1] - depth[i];
            }
            alpha[i] = beta[i] + gamma[i];
            thickness[i] = 0.5 * alpha[i];
        }

        // Layer bounds
        let mut bounds = Vec::with_capacity(layer_depths.len());
        let mut top = 0.0;
        for &d in layer_depths {
            bounds.push((top, top + d));
            top += d;
        }
        let node_layer: Vec<usize> = depth
            .iter()
            .map(|&z| {
                bounds
                    .iter()
                    .position(|&(lo, hi)| z >= lo && z < hi)
                    .unwrap_or(bounds.len() - 1)
            })
            .collect();

        let mut layer_weights = vec![vec![0.0; n]; bounds.len()];
        for (l, &(lo, hi)) in bounds.iter().enumerate() {
            for i in 0..n {
                let cv_lo = depth[i] - 0.5 * beta[i];
                let cv_hi = depth[i] + 0.5 * gamma[i];
                let overlap = (cv_hi.min(hi) - cv_lo.max(lo)).max(0.0);
                layer_weights[l][i] = overlap / (hi - lo);
            }
        }

        let soil = node_layer.iter().map(|&l| layer_soil[l]).collect();

        Ok(NodeGrid {
            depth,
            alpha,
            beta,
            gamma,
            thickness,
            t1_index: 1,
            dp,
            node_layer,
            layer_weights,
            soil,
        })
    }

    pub fn n_nodes(&self) -> usize {
        self.depth.len()
    }

    /// Node temperatures linearly interpolated between the surface, the layer
    /// centres and the bottom boundary temperature at the damping depth.
    pub fn interpolate_node_temperatures(
        &self,
        layer_depths: &[f64],
        layer_temps: &[f64],
        surf_temp: f64,
        bottom_temp: f64,
    ) -> Vec<f64> {
        let mut knots = Vec::with_capacity(layer_temps.len() + 2);
        knots.push((0.0, surf_temp));
        let mut top = 0.0;
        for (d, t) in layer_depths.iter().zip(layer_temps) {
            knots.push((top + 0.5 * d, *t));
            top += d;
        }
        knots.push((self.dp, bottom_temp));

        self.depth
            .iter()
            .map(|&z| {
                for w in knots.windows(2) {
                    let (z0, t0) = w[0];
                    let (z1, t1) = w[1];
                    if z <= z1 {
                        if z1 - z0 <= SMALL {
                            return t1;
                        }
                        return t0 + (t1 - t0) * (z - z0) / (z1 - z0);
                    }
                }
                bottom_temp
            })
            .collect()
    }

    /// Nodes seeded from layer temperatures and layer water contents.
    pub fn initial_nodes(
        &self,
        layer_depths: &[f64],
        layer_temps: &[f64],
        layer_moist: &[f64],
        surf_temp: f64,
        bottom_temp: f64,
        frozen: bool,
    ) -> Vec<NodeState> {
        let temps = self.interpolate_node_temperatures(layer_depths, layer_temps, surf_temp, bottom_temp);
        temps
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                let moist = layer_moist[self.node_layer[i]];
                NodeState::new(&self.soil[i], t, moist, frozen)
            })
            .collect()
    }

    /// Average a node quantity over each soil layer.
    pub fn layer_average(&self, values: impl Fn(usize) -> f64) -> Vec<f64> {
        self.layer_weights
            .iter()
            .map(|w| w.iter().enumerate().map(|(i, wi)| wi * values(i)).sum())
            .collect()
    }

    /// Copy layer water contents onto the nodes and re-equilibrate ice.
    pub fn set_node_moisture(&self, nodes: &mut [NodeState], layer_moist: &[f64], frozen: bool) {
        for (i, node) in nodes.iter_mut().enumerate() {
            node.moist = layer_moist[self.node_layer[i]];
            node.ice = self.soil[i].ice(node.moist, node.t, frozen);
            node.refresh(&self.soil[i]);
        }
    }

    /// Heat content of the profile (J/m^2), used for energy closure.
    pub fn heat_storage(&self, nodes: &[NodeState], frozen: bool) -> f64 {
        nodes
            .iter()
            .enumerate()
            .map(|(i, n)| self.thickness[i] * self.soil[i].enthalpy(n.moist, n.t, frozen))
            .sum()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Heat diffusion
    // ═══════════════════════════════════════════════════════════════════

    /// Advance node temperatures over `dt` seconds.
    ///
    /// Solved in enthalpy form. Without frozen soil one tridiagonal solve is
    /// exact; with frozen soil the apparent heat capacity is linearised around
    /// the current iterate and each node temperature is recovered from its
    /// enthalpy by a bracketed search, repeating until node ice settles.
    #[allow(clippy::too_many_arguments)]
    pub fn diffuse(
        &self,
        nodes: &mut [NodeState],
        dt: f64,
        upper: UpperBoundary,
        lower: LowerBoundary,
        bottom_temp: f64,
        frozen: bool,
        settings: &DiffusionSettings,
        root: &RootSolver,
        brackets: &BracketWidths,
    ) -> VicResult<DiffusionResult> {
        let n = nodes.len();
        if n != self.n_nodes() {
            return Err(VicError::Shape {
                name: "thermal nodes",
                expected: self.n_nodes(),
                actual: n,
            });
        }
        let theta = settings.theta;

        // Face conductances between node i and i+1 (W/m^2/K)
        let kf: Vec<f64> = (0..n - 1)
            .map(|i| 0.5 * (nodes[i].kappa + nodes[i + 1].kappa) / self.gamma[i])
            .collect();

        let t_old: Vec<f64> = nodes.iter().map(|n| n.t).collect();
        let h_old: Vec<f64> = (0..n)
            .map(|i| self.soil[i].enthalpy(nodes[i].moist, t_old[i], frozen))
            .collect();

        let fixed_top = match upper {
            UpperBoundary::Temperature(ts) => Some(ts),
            UpperBoundary::Flux(_) => None,
        };
        let q_top = match upper {
            UpperBoundary::Flux(q) => q,
            UpperBoundary::Temperature(_) => 0.0,
        };
        let fixed_bottom = match lower {
            LowerBoundary::ConstantTemperature => Some(bottom_temp),
            LowerBoundary::NoFlux => None,
        };

        let conduction = |t: &[f64], i: usize| -> f64 {
            let mut f = 0.0;
            if i > 0 {
                f += kf[i - 1] * (t[i - 1] - t[i]);
            }
            if i + 1 < n {
                f += kf[i] * (t[i + 1] - t[i]);
            }
            if i == 0 {
                f += q_top;
            }
            f
        };
        let f_old: Vec<f64> = (0..n).map(|i| conduction(&t_old, i)).collect();

        let mut t_iter = t_old.clone();
        if let Some(ts) = fixed_top {
            t_iter[0] = ts;
        }
        if let Some(tb) = fixed_bottom {
            t_iter[n - 1] = tb;
        }
        let mut ice_iter: Vec<f64> = nodes.iter().map(|n| n.ice).collect();

        let mut a = vec![0.0; n];
        let mut b = vec![0.0; n];
        let mut c = vec![0.0; n];
        let mut r = vec![0.0; n];
        let mut t_new = vec![0.0; n];

        let max_iter = if frozen { settings.max_iterations.max(1) } else { 1 };
        let mut converged = !frozen;
        let mut iterations = 0;

        for iter in 1..=max_iter {
            iterations = iter;
            for i in 0..n {
                let is_fixed = (i == 0 && fixed_top.is_some()) || (i == n - 1 && fixed_bottom.is_some());
                if is_fixed {
                    a[i] = 0.0;
                    b[i] = 1.0;
                    c[i] = 0.0;
                    r[i] = t_iter[i];
                    continue;
                }
                let soil = &self.soil[i];
                let moist = nodes[i].moist;
                let (h_k, c_app) = if frozen {
                    let delta = 0.01;
                    let hp = soil.enthalpy(moist, t_iter[i] + delta, true);
                    let hm = soil.enthalpy(moist, t_iter[i] - delta, true);
                    (soil.enthalpy(moist, t_iter[i], true), (hp - hm) / (2.0 * delta))
                } else {
                    let cs = soil.heat_capacity(moist, 0.0);
                    (cs * t_iter[i], cs)
                };
                let cap = self.thickness[i] * c_app / dt;
                let up = if i > 0 { kf[i - 1] } else { 0.0 };
                let down = if i + 1 < n { kf[i] } else { 0.0 };
                a[i] = -theta * up;
                b[i] = cap + theta * (up + down);
                c[i] = -theta * down;
                r[i] = self.thickness[i] / dt * (h_old[i] - h_k + c_app * t_iter[i])
                    + (1.0 - theta) * f_old[i]
                    + if i == 0 { theta * q_top } else { 0.0 };
            }
            tridiag(&a, &b, &c, &r, &mut t_new);

            if !frozen {
                t_iter.copy_from_slice(&t_new);
                break;
            }

            // Recover temperatures from the enthalpy implied by the fluxes
            let mut max_dice: f64 = 0.0;
            let mut next = t_new.clone();
            for i in 0..n {
                let is_fixed = (i == 0 && fixed_top.is_some()) || (i == n - 1 && fixed_bottom.is_some());
                let soil = &self.soil[i];
                let moist = nodes[i].moist;
                if !is_fixed {
                    let flux = theta * conduction(&t_new, i) + (1.0 - theta) * f_old[i];
                    let h_target = h_old[i] + dt / self.thickness[i] * flux;
                    // The root lies near the segment between the iterate and the linear step
                    let lo = t_iter[i].min(t_new[i]) - brackets.soil_dt;
                    let hi = t_iter[i].max(t_new[i]) + brackets.soil_dt;
                    let root_t = root
                        .solve_within(lo, hi, Widen::Both, brackets.temp_limits(), |t| {
                            h_target - soil.enthalpy(moist, t, true)
                        })
                        .map_err(|e| VicError::solver(SolveVariable::SoilTemperature, e))?;
                    next[i] = root_t.value;
                }
                let ice = soil.ice(moist, next[i], true);
                max_dice = max_dice.max((ice - ice_iter[i]).abs());
                ice_iter[i] = ice;
            }
            t_iter = next;
            if max_dice < settings.ice_tolerance {
                converged = true;
                break;
            }
        }

        if !converged {
            log::debug!("node ice did not settle after {} iterations", iterations);
            return Err(VicError::solver(
                SolveVariable::SoilTemperature,
                RootError::MaxIterations {
                    iterations,
                    value: t_iter[0],
                    residual: f64::NAN,
                },
            ));
        }

        let ground_flux = match upper {
            UpperBoundary::Flux(q) => q,
            UpperBoundary::Temperature(_) => {
                theta * kf[0] * (t_iter[0] - t_iter[1]) + (1.0 - theta) * kf[0] * (t_old[0] - t_old[1])
            }
        };

        for (i, node) in nodes.iter_mut().enumerate() {
            node.t = t_iter[i];
            node.ice = self.soil[i].ice(node.moist, node.t, frozen);
            node.refresh(&self.soil[i]);
        }

        Ok(DiffusionResult {
            ground_flux,
            iterations,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Quick flux (two-layer implicit approximation)
// ═══════════════════════════════════════════════════════════════════════

/// Closed-form ground heat flux through a thin top layer over a thick
/// second layer relaxing to the deep temperature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuickFlux {
    pub d1: f64,
    pub d2: f64,
    pub kappa1: f64,
    pub kappa2: f64,
    pub cs1: f64,
    pub cs2: f64,
    pub dp: f64,
    pub t_deep: f64,
    pub t1_old: f64,
    pub dt: f64, // s
}

impl QuickFlux {
    /// Temperature at the bottom of the top layer for surface temperature `ts`.
    pub fn t1(&self, ts: f64) -> f64 {
        let QuickFlux {
            d1,
            d2,
            kappa1,
            kappa2,
            cs2,
            dp,
            t_deep,
            t1_old,
            dt,
            ..
        } = *self;
        let c1 = cs2 * dp / d2 * (1.0 - (-d2 / dp).exp());
        let c2 = -(1.0 - (d1 / dp).exp()) * (-d2 / dp).exp();
        let c3 = kappa1 / d1 - kappa2 / d1 + kappa2 / d1 * (-d1 / dp).exp();
        (kappa1 / 2.0 / d1 / d2 * ts
            + c1 / dt * t1_old
            + (2.0 * c2 - 1.0 + (-d1 / dp).exp()) * kappa2 / 2.0 / d1 / d2 * t_deep)
            / (c1 / dt + kappa2 / d1 / d2 * c2 + c3 / 2.0 / d2)
    }

    /// Heat flux into the soil (W/m^2).
    pub fn ground_flux(&self, ts: f64) -> f64 {
        self.kappa1 / self.d1 * (ts - self.t1(ts))
    }

    /// Write the quick-flux profile onto the nodes.
    pub fn apply(&self, grid: &NodeGrid, nodes: &mut [NodeState], ts: f64) {
        let t1 = self.t1(ts);
        let z1 = grid.depth[grid.t1_index];
        for (i, node) in nodes.iter_mut().enumerate() {
            let z = grid.depth[i];
            node.t = if i == 0 {
                ts
            } else if i == grid.t1_index {
                t1
            } else {
                t1 + (self.t_deep - t1) * (z - z1) / (grid.dp - z1)
            };
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Freezing and thawing fronts
// ═══════════════════════════════════════════════════════════════════════

/// Depths of freezing fronts (frozen above, thawed below) and thawing fronts
/// (thawed above, frozen below), linearly interpolated between nodes.
pub fn find_fronts(depth: &[f64], temps: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let mut fdepth = Vec::new();
    let mut tdepth = Vec::new();
    for i in 0..temps.len().saturating_sub(1) {
        let (t0, t1) = (temps[i], temps[i + 1]);
        let crossing = || depth[i] + (depth[i + 1] - depth[i]) * t0 / (t0 - t1);
        if t0 < 0.0 && t1 >= 0.0 {
            fdepth.push(crossing());
        } else if t0 >= 0.0 && t1 < 0.0 {
            tdepth.push(crossing());
        }
    }
    (fdepth, tdepth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn loam() -> NodeSoil {
        NodeSoil {
            porosity: 0.45,
            expt: 11.0,
            bubble: 20.0,
            quartz: 0.4,
            bulk_density: 1450.0,
            soil_density: 2650.0,
        }
    }

    fn grid() -> NodeGrid {
        NodeGrid::new(&[0.1, 0.3, 1.0], &[loam(); 3], 4.0, 6).unwrap()
    }

    #[test]
    fn tridiag_solves_known_system() {
        let a = [0.0, -1.0, -1.0];
        let b = [2.0, 2.0, 2.0];
        let c = [-1.0, -1.0, 0.0];
        let r = [1.0, 0.0, 1.0];
        let mut x = [0.0; 3];
        tridiag(&a, &b, &c, &r, &mut x);
        for v in x {
            assert_abs_diff_eq!(v, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn tridiag_handles_uneven_rows_and_a_single_row() {
        let a = [9.0, 2.0, 3.0];
        let b = [4.0, 5.0, 6.0];
        let c = [1.0, 1.0, 9.0];
        let r = [6.0, 15.0, 24.0];
        let mut x = [0.0; 3];
        tridiag(&a, &b, &c, &r, &mut x);
        for (v, want) in x.iter().zip([1.0, 2.0, 3.0]) {
            assert_abs_diff_eq!(*v, want, epsilon = 1e-12);
        }
        let mut one = [0.0];
        tridiag(&[0.0], &[2.0], &[0.0], &[3.0], &mut one);
        assert_eq!(one[0], 1.5);
    }

    #[test]
    fn node_geometry_places_t1_at_first_layer_bottom() {
        let g = grid();
        assert_eq!(g.depth[0], 0.0);
        assert_abs_diff_eq!(g.depth[g.t1_index], 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(*g.depth.last().unwrap(), 4.0, epsilon = 1e-12);
        for i in 1..g.n_nodes() - 1 {
            assert_abs_diff_eq!(g.alpha[i], g.beta[i] + g.gamma[i], epsilon = 1e-12);
        }
        // Each layer is fully covered by node control volumes
        for w in &g.layer_weights {
            assert_abs_diff_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn damping_depth_above_soil_bottom_is_rejected() {
        assert!(NodeGrid::new(&[0.1, 0.3, 1.0], &[loam(); 3], 1.0, 5).is_err());
    }

    #[test]
    fn interpolation_reproduces_linear_profile() {
        let g = grid();
        let layer_depths = [0.1, 0.3, 1.0];
        // T(z) = 10 - 2 z at layer centres 0.05, 0.25, 0.9
        let temps = g.interpolate_node_temperatures(&layer_depths, &[9.9, 9.5, 8.2], 10.0, 2.0);
        for (z, t) in g.depth.iter().zip(&temps) {
            assert_abs_diff_eq!(*t, 10.0 - 2.0 * z, epsilon = 1e-9);
        }
    }

    #[test]
    fn unfrozen_diffusion_conserves_energy_with_no_flux_bottom() {
        let g = grid();
        let layer_depths = [0.1, 0.3, 1.0];
        let mut nodes = g.initial_nodes(&layer_depths, &[5.0, 3.0, 1.0], &[0.3, 0.3, 0.3], 8.0, 1.0, false);
        let before = g.heat_storage(&nodes, false);
        let q = 20.0;
        let dt = 3600.0;
        let res = g
            .diffuse(
                &mut nodes,
                dt,
                UpperBoundary::Flux(q),
                LowerBoundary::NoFlux,
                1.0,
                false,
                &DiffusionSettings::default(),
                &RootSolver::default(),
                &BracketWidths::default(),
            )
            .unwrap();
        let after = g.heat_storage(&nodes, false);
        assert_abs_diff_eq!(res.ground_flux, q, epsilon = 1e-12);
        assert_abs_diff_eq!(after - before, q * dt, epsilon = 1e-3 * q * dt);
    }

    #[test]
    fn freezing_releases_latent_heat_and_conserves_enthalpy() {
        let g = grid();
        let layer_depths = [0.1, 0.3, 1.0];
        let mut nodes = g.initial_nodes(&layer_depths, &[0.5, 0.5, 0.5], &[0.35, 0.35, 0.35], 0.5, 0.5, true);
        let before = g.heat_storage(&nodes, true);
        let q = -80.0;
        let dt = 6.0 * 3600.0;
        g.diffuse(
            &mut nodes,
            dt,
            UpperBoundary::Flux(q),
            LowerBoundary::NoFlux,
            0.5,
            true,
            &DiffusionSettings::default(),
            &RootSolver {
                tolerance: 1e-6,
                ..RootSolver::default()
            },
            &BracketWidths::default(),
        )
        .unwrap();
        let after = g.heat_storage(&nodes, true);
        assert!(nodes[0].t < 0.0);
        assert!(nodes[0].ice > 0.0);
        assert!(nodes.iter().all(|n| n.ice >= 0.0 && n.ice <= n.moist));
        assert_abs_diff_eq!(after - before, q * dt, epsilon = 0.02 * (q * dt).abs());
    }

    #[test]
    fn fixed_surface_temperature_drives_flux_into_soil() {
        let g = grid();
        let layer_depths = [0.1, 0.3, 1.0];
        let mut nodes = g.initial_nodes(&layer_depths, &[5.0, 5.0, 5.0], &[0.3; 3], 5.0, 5.0, false);
        let res = g
            .diffuse(
                &mut nodes,
                3600.0,
                UpperBoundary::Temperature(15.0),
                LowerBoundary::ConstantTemperature,
                5.0,
                false,
                &DiffusionSettings::default(),
                &RootSolver::default(),
                &BracketWidths::default(),
            )
            .unwrap();
        assert!(res.ground_flux > 0.0);
        assert_eq!(nodes[0].t, 15.0);
        assert_eq!(nodes.last().unwrap().t, 5.0);
        assert!(nodes[1].t > 5.0 && nodes[1].t < 15.0);
    }

    #[test]
    fn quick_flux_is_zero_in_isothermal_soil() {
        let qf = QuickFlux {
            d1: 0.1,
            d2: 0.5,
            kappa1: 1.2,
            kappa2: 1.4,
            cs1: 2.0e6,
            cs2: 2.2e6,
            dp: 4.0,
            t_deep: 3.0,
            t1_old: 3.0,
            dt: 3600.0,
        };
        assert_abs_diff_eq!(qf.t1(3.0), 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(qf.ground_flux(3.0), 0.0, epsilon = 1e-9);
        assert!(qf.ground_flux(10.0) > 0.0);
    }

    #[test]
    fn unfrozen_water_limit_decreases_with_temperature() {
        assert_eq!(max_unfrozen_fraction(1.0, 20.0, 11.0), 1.0);
        let a = max_unfrozen_fraction(-0.5, 20.0, 11.0);
        let b = max_unfrozen_fraction(-5.0, 20.0, 11.0);
        assert!(a > b && b > 0.0);
    }

    #[test]
    fn fronts_are_located_between_nodes() {
        let depth = [0.0, 0.1, 0.5, 1.0];
        let (f, t) = find_fronts(&depth, &[-2.0, -1.0, 1.0, 1.0]);
        assert_eq!(t.len(), 0);
        assert_abs_diff_eq!(f[0], 0.3, epsilon = 1e-12);
        let (f, t) = find_fronts(&depth, &[1.0, -1.0, -1.0, -1.0]);
        assert!(f.is_empty());
        assert_abs_diff_eq!(t[0], 0.05, epsilon = 1e-12);
    }
}
