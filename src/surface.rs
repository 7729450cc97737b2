// Surface energy balance: the temperature of the soil or vegetation surface
// that closes net radiation against turbulent, snow and ground fluxes.

use serde::{Deserialize, Serialize};

use crate::atmos::{latent_heat_vaporization, net_longwave, sensible_heat, svp, ExchangeGeometry};
use crate::canopy::EvapSurface;
use crate::config::{GroundFluxMode, LowerBoundary, ModelOptions, SolverSettings};
use crate::constants::*;
use crate::error::{SolveVariable, VicError, VicResult};
use crate::thermal::{find_fronts, NodeGrid, NodeState, QuickFlux, UpperBoundary};

/// Energy terms and thermal profile of one tile.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnergyBalance {
    pub nodes: Vec<NodeState>,
    pub surf_temp: f64,   // C
    pub albedo: f64,
    pub net_short: f64,   // W/m^2
    pub net_long: f64,
    pub sensible: f64,    // upward
    pub latent: f64,      // upward
    pub latent_sub: f64,  // sublimation part of latent
    pub ground_flux: f64, // into the soil
    pub snow_flux: f64,   // from the pack into the soil surface
    pub advected: f64,
    pub delta_h: f64,     // change in soil heat storage (W/m^2)
    pub error: f64,       // residual at the accepted temperature
    pub fdepth: Vec<f64>, // freezing fronts (m)
    pub tdepth: Vec<f64>, // thawing fronts (m)
    pub foliage_temp: f64,
    pub canopy_air_temp: f64,
    pub canopy_vp: f64,   // kPa
}

impl EnergyBalance {
    pub fn new(nodes: Vec<NodeState>, surf_temp: f64) -> Self {
        EnergyBalance {
            nodes,
            surf_temp,
            foliage_temp: surf_temp,
            canopy_air_temp: surf_temp,
            ..EnergyBalance::default()
        }
    }

    pub fn t1(&self, grid: &NodeGrid) -> f64 {
        self.nodes[grid.t1_index].t
    }
}

/// Atmospheric drivers seen by the exposed surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceForcing {
    pub air_temp: f64,
    pub shortwave: f64,
    pub longwave: f64,
    pub vp: f64,
    pub pressure: f64,
    pub density: f64,
    pub wind: f64,
    pub albedo: f64,
    pub emissivity: f64,
    pub dt_hours: f64,
}

/// Step-mean snow pack seen from below.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SnowCover {
    pub coverage: f64,
    pub bottom_temp: f64, // C
    pub conductance: f64, // W/m^2/K
    pub melt_out: f64,    // energy passed on by a pack that melted out (W/m^2)
}

/// Everything the residual needs besides the trial temperature.
pub struct SurfaceProblem<'a> {
    pub forcing: SurfaceForcing,
    pub snow: SnowCover,
    pub geometry: ExchangeGeometry,
    pub evap: EvapSurface,
    pub grid: &'a NodeGrid,
    pub layer_depths: &'a [f64],
    pub bottom_temp: f64,
    pub options: &'a ModelOptions,
    pub solver: &'a SolverSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SurfaceTerms {
    pub net_short: f64,
    pub net_long: f64,
    pub sensible: f64,
    pub latent: f64,
    pub vapor: f64, // kg/m^2/s over the exposed area
    pub snow_flux: f64,
    pub ground: f64,
    pub resistance: f64,
}

impl SurfaceTerms {
    pub fn residual(&self) -> f64 {
        self.net_short + self.net_long - self.sensible - self.latent + self.snow_flux - self.ground
    }
}

/// Accepted surface solution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceSolution {
    pub surf_temp: f64,
    pub terms: SurfaceTerms,
    pub evaporation: f64, // mm over the step, tile mean
    pub error: f64,
}

impl SurfaceProblem<'_> {
    fn dt(&self) -> f64 {
        self.forcing.dt_hours * SEC_PER_HOUR
    }

    /// Closed-form ground flux seeded from the current profile.
    pub fn quick_flux(&self, nodes: &[NodeState]) -> QuickFlux {
        let t1 = self.grid.t1_index;
        QuickFlux {
            d1: self.layer_depths[0],
            d2: self.layer_depths[1],
            kappa1: nodes[0].kappa,
            kappa2: nodes[t1].kappa,
            cs1: nodes[0].cs,
            cs2: nodes[t1].cs,
            dp: self.grid.dp,
            t_deep: self.bottom_temp,
            t1_old: nodes[t1].t,
            dt: self.dt(),
        }
    }

    fn finite_difference_flux(&self, nodes: &[NodeState], ts: f64) -> VicResult<f64> {
        let mut trial = nodes.to_vec();
        let result = self.diffuse(&mut trial, ts)?;
        Ok(result)
    }

    fn diffuse(&self, nodes: &mut [NodeState], ts: f64) -> VicResult<f64> {
        let lower: LowerBoundary = self.options.lower_boundary;
        let result = self.grid.diffuse(
            nodes,
            self.dt(),
            UpperBoundary::Temperature(ts),
            lower,
            self.bottom_temp,
            self.options.frozen_soil,
            &self.solver.diffusion,
            &self.solver.root,
            &self.solver.brackets,
        )?;
        Ok(result.ground_flux)
    }

    /// Atmospheric and snow terms at trial temperature `ts`, with ground
    /// flux supplied by the caller.
    pub fn terms(&self, ts: f64, ground: f64) -> SurfaceTerms {
        let f = &self.forcing;
        let exposed = 1.0 - self.snow.coverage;
        let ra = self.geometry.resistance(f.air_temp, ts, f.wind);
        let vapor = self.evap.flux(f.density, f.pressure, svp(ts), f.vp, ra, self.dt());
        SurfaceTerms {
            net_short: exposed * (1.0 - f.albedo) * f.shortwave,
            net_long: exposed * net_longwave(f.longwave, f.emissivity, ts),
            sensible: exposed * sensible_heat(f.density, ts, f.air_temp, ra),
            latent: exposed * latent_heat_vaporization(ts) * vapor,
            vapor: exposed * vapor,
            snow_flux: self.snow.coverage * self.snow.conductance * (self.snow.bottom_temp - ts) + self.snow.melt_out,
            ground,
            resistance: ra,
        }
    }

    fn search(
        &self,
        center: f64,
        mut ground: impl FnMut(f64) -> VicResult<f64>,
    ) -> VicResult<f64> {
        let mut failure: Option<VicError> = None;
        let found = self.solver.root.solve_about_within(
            center,
            self.solver.brackets.surf_dt,
            self.solver.brackets.temp_limits(),
            |ts| match ground(ts) {
                Ok(g) => self.terms(ts, g).residual(),
                Err(e) => {
                    failure.get_or_insert(e);
                    f64::NAN
                }
            },
        );
        if let Some(e) = failure {
            return Err(e);
        }
        let root = found.map_err(|e| VicError::solver(SolveVariable::SurfaceTemperature, e))?;
        log::trace!("surface temperature {:.4} after {} iterations", root.value, root.iterations);
        Ok(root.value)
    }

    /// Solve the surface temperature and advance the soil profile in
    /// `energy.nodes`.
    pub fn solve(&self, energy: &mut EnergyBalance) -> VicResult<SurfaceSolution> {
        let dt = self.dt();
        let frozen = self.options.frozen_soil;
        let heat_before = self.grid.heat_storage(&energy.nodes, frozen);
        let previous = energy.surf_temp;

        let ts = if !self.options.full_energy {
            self.forcing.air_temp
        } else {
            match self.options.ground_flux {
                GroundFluxMode::QuickFlux => {
                    let qf = self.quick_flux(&energy.nodes);
                    self.search(previous, |ts| Ok(qf.ground_flux(ts)))?
                }
                GroundFluxMode::FiniteDifference => {
                    let nodes = energy.nodes.clone();
                    self.search(previous, |ts| self.finite_difference_flux(&nodes, ts))?
                }
                GroundFluxMode::QuickSolve => {
                    let qf = self.quick_flux(&energy.nodes);
                    let seed = self.search(previous, |ts| Ok(qf.ground_flux(ts)))?;
                    let nodes = energy.nodes.clone();
                    self.search(seed, |ts| self.finite_difference_flux(&nodes, ts))?
                }
            }
        };

        // Commit the profile at the accepted temperature
        let ground = match self.options.ground_flux {
            GroundFluxMode::QuickFlux => {
                let qf = self.quick_flux(&energy.nodes);
                qf.apply(self.grid, &mut energy.nodes, ts);
                qf.ground_flux(ts)
            }
            _ => self.diffuse(&mut energy.nodes, ts)?,
        };
        let terms = self.terms(ts, ground);
        let heat_after = self.grid.heat_storage(&energy.nodes, frozen);

        let depths = &self.grid.depth;
        let temps: Vec<f64> = energy.nodes.iter().map(|n| n.t).collect();
        let (fdepth, tdepth) = find_fronts(depths, &temps);

        energy.surf_temp = ts;
        energy.albedo = self.forcing.albedo;
        energy.net_short = terms.net_short;
        energy.net_long = terms.net_long;
        energy.sensible = terms.sensible;
        energy.latent = terms.latent;
        energy.ground_flux = terms.ground;
        energy.snow_flux = terms.snow_flux;
        energy.delta_h = (heat_after - heat_before) / dt;
        energy.fdepth = fdepth;
        energy.tdepth = tdepth;
        let error = if self.options.full_energy { terms.residual() } else { 0.0 };
        energy.error = error;

        Ok(SurfaceSolution {
            surf_temp: ts,
            terms,
            evaporation: terms.vapor * dt,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atmos::air_density;
    use crate::thermal::NodeSoil;
    use approx::assert_abs_diff_eq;

    fn loam() -> NodeSoil {
        NodeSoil {
            porosity: 0.45,
            expt: 11.0,
            bubble: 30.0,
            quartz: 0.4,
            bulk_density: 1400.0,
            soil_density: 2650.0,
        }
    }

    fn setup(nodes_t: f64) -> (NodeGrid, Vec<NodeState>, Vec<f64>) {
        let depths = vec![0.1, 0.4, 1.0];
        let grid = NodeGrid::new(&depths, &[loam(); 3], 4.0, 6).unwrap();
        let nodes = (0..grid.n_nodes())
            .map(|i| NodeState::new(&grid.soil[i], nodes_t, 0.25, false))
            .collect();
        (grid, nodes, depths)
    }

    fn forcing(t: f64, sw: f64) -> SurfaceForcing {
        SurfaceForcing {
            air_temp: t,
            shortwave: sw,
            longwave: 320.0,
            vp: 0.8,
            pressure: 95.0,
            density: air_density(95.0, t),
            wind: 3.0,
            albedo: 0.2,
            emissivity: 1.0,
            dt_hours: 24.0,
        }
    }

    fn solve_with(mode: GroundFluxMode, full_energy: bool) -> (SurfaceSolution, EnergyBalance) {
        let (grid, nodes, depths) = setup(10.0);
        let options = ModelOptions {
            ground_flux: mode,
            full_energy,
            ..ModelOptions::default()
        };
        let solver = SolverSettings::default();
        let problem = SurfaceProblem {
            forcing: forcing(15.0, 250.0),
            snow: SnowCover::default(),
            geometry: ExchangeGeometry::new(10.0, 2.0, 0.01),
            evap: EvapSurface::bare(0.5, 10.0),
            grid: &grid,
            layer_depths: &depths,
            bottom_temp: 10.0,
            options: &options,
            solver: &solver,
        };
        let mut energy = EnergyBalance::new(nodes, 10.0);
        let sol = problem.solve(&mut energy).unwrap();
        (sol, energy)
    }

    #[test]
    fn finite_difference_mode_closes_the_balance() {
        let (sol, energy) = solve_with(GroundFluxMode::FiniteDifference, true);
        assert!(sol.error.abs() < 1.0e-2);
        assert!(sol.surf_temp > 10.0);
        assert!(energy.ground_flux > 0.0);
        assert_abs_diff_eq!(energy.nodes[0].t, sol.surf_temp, epsilon = 1e-12);
    }

    #[test]
    fn ground_flux_modes_agree_roughly() {
        let (quick, _) = solve_with(GroundFluxMode::QuickFlux, true);
        let (fd, _) = solve_with(GroundFluxMode::FiniteDifference, true);
        let (hybrid, _) = solve_with(GroundFluxMode::QuickSolve, true);
        assert!((quick.surf_temp - fd.surf_temp).abs() < 5.0);
        assert_abs_diff_eq!(hybrid.surf_temp, fd.surf_temp, epsilon = 1e-2);
    }

    #[test]
    fn water_balance_mode_uses_air_temperature() {
        let (sol, energy) = solve_with(GroundFluxMode::FiniteDifference, false);
        assert_eq!(sol.surf_temp, 15.0);
        assert_eq!(energy.error, 0.0);
    }

    #[test]
    fn snow_cover_shuts_off_exposed_radiation() {
        let (grid, nodes, depths) = setup(-2.0);
        let options = ModelOptions::default();
        let solver = SolverSettings::default();
        let problem = SurfaceProblem {
            forcing: forcing(-5.0, 200.0),
            snow: SnowCover {
                coverage: 1.0,
                bottom_temp: -3.0,
                conductance: 2.0,
                melt_out: 0.0,
            },
            geometry: ExchangeGeometry::new(10.0, 2.0, 0.01),
            evap: EvapSurface::bare(1.0, 10.0),
            grid: &grid,
            layer_depths: &depths,
            bottom_temp: 5.0,
            options: &options,
            solver: &solver,
        };
        let t = problem.terms(-2.0, 0.0);
        assert_eq!(t.net_short, 0.0);
        assert_eq!(t.sensible, 0.0);
        assert_abs_diff_eq!(t.snow_flux, -2.0, epsilon = 1e-12);
        let mut energy = EnergyBalance::new(nodes, -2.0);
        let sol = problem.solve(&mut energy).unwrap();
        assert!(sol.surf_temp > -3.0 && sol.surf_temp < 5.0);
    }

    #[test]
    fn melt_out_energy_reaches_the_ground() {
        let (grid, nodes, depths) = setup(0.0);
        let options = ModelOptions::default();
        let solver = SolverSettings::default();
        let solve = |melt_out: f64| {
            let problem = SurfaceProblem {
                forcing: forcing(8.0, 300.0),
                snow: SnowCover {
                    coverage: 0.0,
                    bottom_temp: 0.0,
                    conductance: 0.0,
                    melt_out,
                },
                geometry: ExchangeGeometry::new(10.0, 2.0, 0.01),
                evap: EvapSurface::bare(0.5, 10.0),
                grid: &grid,
                layer_depths: &depths,
                bottom_temp: 5.0,
                options: &options,
                solver: &solver,
            };
            assert_abs_diff_eq!(problem.terms(1.0, 0.0).snow_flux, melt_out, epsilon = 1e-12);
            let mut energy = EnergyBalance::new(nodes.clone(), 0.0);
            let sol = problem.solve(&mut energy).unwrap();
            (sol.surf_temp, energy.ground_flux)
        };
        let (t_plain, g_plain) = solve(0.0);
        let (t_extra, g_extra) = solve(60.0);
        assert!(t_extra > t_plain);
        assert!(g_extra > g_plain);
    }
}
