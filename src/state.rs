// Flat checkpoint vector of a cell's mutable state. The field order is fixed
// so an external state file can store one row of f64 per cell.
//
// Layout:
//   mu, storm, storage, step
//   per tile (veg-major, then band):
//     surf_temp, foliage_temp, canopy_air_temp, canopy_vp
//     per node: t, moist, ice, kappa, cs
//     snow: swq, surf_water, pack_water, surf_temp, pack_temp, density, depth,
//           coldcontent, coverage, max_swq, store_swq, swq_slope, last_snow,
//           melting, albedo, snow_canopy
//     per fraction (wet, dry): wdew, per layer: moist, t, kappa, cs, ice[n_frost]
//   lake (when present): volume, depth, area, ice_vol, fraction_ice, hice,
//     tempi, snow_vol, surf_temp, mixmax, temps[nodes]

use crate::cell::{Cell, CellState};
use crate::error::{VicError, VicResult};
use crate::thermal::find_fronts;

const CELL_FIELDS: usize = 4;
const ENERGY_FIELDS: usize = 4;
const NODE_FIELDS: usize = 5;
const SNOW_FIELDS: usize = 16;
const LAYER_FIELDS: usize = 4;
const LAKE_FIELDS: usize = 10;

/// Dimensions that fix the checkpoint length of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateLayout {
    pub n_tiles: usize,
    pub n_layers: usize,
    pub n_frost: usize,
    pub n_nodes: usize,
    pub lake_nodes: Option<usize>,
}

impl StateLayout {
    pub fn for_cell(cell: &Cell) -> Self {
        StateLayout {
            n_tiles: cell.n_tiles(),
            n_layers: cell.soil.n_layers(),
            n_frost: cell.config().options.n_frost(),
            n_nodes: cell.soil.grid.n_nodes(),
            lake_nodes: cell.params.lake.as_ref().map(|l| l.nodes),
        }
    }

    fn tile_size(&self) -> usize {
        let fraction = 1 + self.n_layers * (LAYER_FIELDS + self.n_frost);
        ENERGY_FIELDS + self.n_nodes * NODE_FIELDS + SNOW_FIELDS + 2 * fraction
    }

    pub fn size(&self) -> usize {
        CELL_FIELDS + self.n_tiles * self.tile_size() + self.lake_nodes.map_or(0, |n| LAKE_FIELDS + n)
    }
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

pub fn pack(state: &CellState) -> Vec<f64> {
    let mut v = vec![state.mu, flag(state.storm), state.storage, state.step as f64];
    for tile in &state.tiles {
        let e = &tile.energy;
        v.extend_from_slice(&[e.surf_temp, e.foliage_temp, e.canopy_air_temp, e.canopy_vp]);
        for n in &e.nodes {
            v.extend_from_slice(&[n.t, n.moist, n.ice, n.kappa, n.cs]);
        }
        let s = &tile.snow;
        v.extend_from_slice(&[
            s.swq,
            s.surf_water,
            s.pack_water,
            s.surf_temp,
            s.pack_temp,
            s.density,
            s.depth,
            s.coldcontent,
            s.coverage,
            s.max_swq,
            s.store_swq,
            s.swq_slope,
            s.last_snow as f64,
            flag(s.melting),
            s.albedo,
            s.snow_canopy,
        ]);
        for frac in &tile.fractions {
            v.push(frac.veg_var.wdew);
            for l in &frac.layers {
                v.extend_from_slice(&[l.moist, l.t, l.kappa, l.cs]);
                v.extend_from_slice(l.ice.values());
            }
        }
    }
    if let Some(lake) = &state.lake {
        v.extend_from_slice(&[
            lake.volume,
            lake.depth,
            lake.area,
            lake.ice_vol,
            lake.fraction_ice,
            lake.hice,
            lake.tempi,
            lake.snow_vol,
            lake.surf_temp,
            lake.mixmax as f64,
        ]);
        v.extend_from_slice(&lake.temps);
    }
    v
}

struct Reader<'a> {
    v: &'a [f64],
    pos: usize,
}

impl Reader<'_> {
    fn next(&mut self) -> f64 {
        let x = self.v[self.pos];
        self.pos += 1;
        x
    }

    fn fill(&mut self, out: &mut [f64]) {
        out.copy_from_slice(&self.v[self.pos..self.pos + out.len()]);
        self.pos += out.len();
    }
}

/// Rebuild a cell state from a checkpoint written by [`pack`].
pub fn unpack(cell: &Cell, v: &[f64]) -> VicResult<CellState> {
    let layout = StateLayout::for_cell(cell);
    if v.len() != layout.size() {
        return Err(VicError::Checkpoint {
            expected: layout.size(),
            actual: v.len(),
        });
    }
    let mut state = cell.initial_state()?;
    let mut r = Reader { v, pos: 0 };
    state.mu = r.next();
    state.storm = r.next() > 0.5;
    state.storage = r.next();
    state.step = r.next() as usize;

    for tile in state.tiles.iter_mut() {
        let e = &mut tile.energy;
        e.surf_temp = r.next();
        e.foliage_temp = r.next();
        e.canopy_air_temp = r.next();
        e.canopy_vp = r.next();
        for n in e.nodes.iter_mut() {
            n.t = r.next();
            n.moist = r.next();
            n.ice = r.next();
            n.kappa = r.next();
            n.cs = r.next();
        }
        let temps: Vec<f64> = e.nodes.iter().map(|n| n.t).collect();
        (e.fdepth, e.tdepth) = find_fronts(&cell.soil.grid.depth, &temps);

        let s = &mut tile.snow;
        s.swq = r.next();
        s.surf_water = r.next();
        s.pack_water = r.next();
        s.surf_temp = r.next();
        s.pack_temp = r.next();
        s.density = r.next();
        s.depth = r.next();
        s.coldcontent = r.next();
        s.coverage = r.next();
        s.max_swq = r.next();
        s.store_swq = r.next();
        s.swq_slope = r.next();
        s.last_snow = r.next() as usize;
        s.melting = r.next() > 0.5;
        s.albedo = r.next();
        s.snow_canopy = r.next();

        for frac in tile.fractions.iter_mut() {
            frac.veg_var.wdew = r.next();
            for l in frac.layers.iter_mut() {
                l.moist = r.next();
                l.t = r.next();
                l.kappa = r.next();
                l.cs = r.next();
                r.fill(l.ice.values_mut());
            }
        }
    }

    if let Some(lake) = state.lake.as_mut() {
        lake.volume = r.next();
        lake.depth = r.next();
        lake.area = r.next();
        lake.ice_vol = r.next();
        lake.fraction_ice = r.next();
        lake.hice = r.next();
        lake.tempi = r.next();
        lake.snow_vol = r.next();
        lake.surf_temp = r.next();
        lake.mixmax = r.next() as usize;
        r.fill(&mut lake.temps);
    }
    Ok(state)
}
