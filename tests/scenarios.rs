use approx::assert_abs_diff_eq;

use vic_rs::atmos::svp;
use vic_rs::canopy::{VegClass, VegLibrary, VegTile};
use vic_rs::cell::{BandParams, Cell, CellParams};
use vic_rs::config::ModelConfig;
use vic_rs::forcing::{AtmosForcingStep, AtmosRecord};
use vic_rs::output::OutVar;
use vic_rs::root::RootSolver;
use vic_rs::soil::{BaseflowParams, LayerParams, SoilParams};
use vic_rs::{run_cell, state};

// ═══════════════════════════════════════════════════════════════════════
// Fixtures
// ═══════════════════════════════════════════════════════════════════════

fn layer(depth: f64, init: f64) -> LayerParams {
    LayerParams {
        depth,
        ksat: 250.0,
        expt: 10.0,
        bubble: 20.0,
        quartz: 0.6,
        bulk_density: 1500.0,
        soil_density: 2650.0,
        wcr_fract: 0.7,
        wp_fract: 0.4,
        resid_moist: 0.03,
        init_moist: init,
    }
}

fn soil(dsmax: f64) -> SoilParams {
    SoilParams {
        layers: vec![layer(0.1, 25.0), layer(0.5, 120.0), layer(1.5, 350.0)],
        baseflow: BaseflowParams::Arno {
            ds: 0.05,
            dsmax,
            ws: 0.7,
            c: 2.0,
        },
        b_infilt: 0.3,
        dp: 4.0,
        avg_temp: 5.0,
        init_temps: Some(vec![5.0, 5.0, 5.0]),
        frost_slope: 1.0,
        fetch: 1000.0,
    }
}

fn grass() -> VegClass {
    VegClass {
        name: "grassland".to_string(),
        overstory: false,
        lai: [1.5; 12],
        albedo: [0.2; 12],
        roughness: [0.03; 12],
        displacement: [0.2; 12],
        wdmax: None,
        emissivity: 1.0,
        rmin: 100.0,
        rarc: 25.0,
        rad_atten: 0.5,
        wind_atten: 0.5,
        trunk_ratio: 0.2,
    }
}

fn cell_params(veg: Vec<VegTile>, bands: Vec<BandParams>) -> CellParams {
    CellParams {
        id: 1,
        area_m2: 2.5e7,
        elevation: 900.0,
        soil: soil(6.0),
        veg,
        veg_lib: VegLibrary { classes: vec![grass()] },
        bands,
        lake: None,
        config: ModelConfig::default(),
    }
}

fn grass_tile(cv: f64) -> VegTile {
    VegTile {
        class: 0,
        cv,
        root: vec![0.5, 0.4, 0.1],
    }
}

fn day(t: f64, prec: f64, sw: f64, lw: f64, vp: f64) -> AtmosForcingStep {
    let rec = AtmosRecord::new(t, prec / 8.0, sw, lw, 92.0, vp, 2.0);
    AtmosForcingStep::from_substeps(1, vec![rec; 8]).unwrap()
}

/// Air at saturation so that no water leaves as vapour.
fn saturated_day(t: f64, prec: f64) -> AtmosForcingStep {
    day(t, prec, 150.0, 320.0, svp(t))
}

// ═══════════════════════════════════════════════════════════════════════
// Root finder
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn linear_residual_converges_within_bound() {
    let solver = RootSolver::default();
    let root = solver.brent(-40.0, 40.0, |t| 12.0 * (3.7 - t)).unwrap();
    assert!(root.residual.abs() < solver.tolerance);
    assert!(root.iterations <= solver.max_iterations);
    assert_abs_diff_eq!(root.value, 3.7, epsilon = 1e-3);
}

// ═══════════════════════════════════════════════════════════════════════
// Water balance
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn storage_constant_without_precipitation_or_evaporation() {
    let mut params = cell_params(vec![grass_tile(0.5)], Vec::new());
    params.soil = soil(0.0);
    params.config.options.full_energy = false;
    let cell = Cell::new(params).unwrap();
    let mut st = cell.initial_state().unwrap();
    let start = cell.storage(&st);
    for _ in 0..10 {
        let out = cell.step(&mut st, &saturated_day(12.0, 0.0)).unwrap();
        assert_abs_diff_eq!(out.record.scalar(OutVar::Evap), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(cell.storage(&st), start, epsilon = 1e-6);
    }
}

#[test]
fn moisture_stays_within_bounds_through_storms() {
    let mut params = cell_params(vec![grass_tile(0.7)], Vec::new());
    params.config.options.dist_prcp = true;
    let cell = Cell::new(params).unwrap();
    let mut st = cell.initial_state().unwrap();
    for (i, p) in [60.0, 80.0, 0.0, 5.0, 120.0, 0.0, 0.0].into_iter().enumerate() {
        let out = cell.step(&mut st, &day(15.0, p, 220.0, 320.0, 1.0)).unwrap();
        assert!(out.diagnostics.water_error.abs() < 1e-6, "step {}", i);
        for tile in &st.tiles {
            for frac in &tile.fractions {
                cell.soil.check_bounds(&frac.layers).unwrap();
                for (l, layer) in frac.layers.iter().enumerate() {
                    assert!(layer.moist >= 0.0);
                    assert!(cell.soil.layer_water(layer) <= cell.soil.max_moist[l] + 1e-9);
                    assert!(layer.ice.values().iter().all(|&x| x >= 0.0));
                }
            }
        }
    }
}

#[test]
fn cell_flux_is_the_area_weighted_tile_sum() {
    let single = Cell::new(cell_params(vec![grass_tile(1.0)], Vec::new())).unwrap();
    let bands = vec![
        BandParams {
            area_fract: 0.25,
            elevation: 900.0,
            prcp_fract: 0.25,
            above_treeline: false,
        },
        BandParams {
            area_fract: 0.75,
            elevation: 900.0,
            prcp_fract: 0.75,
            above_treeline: false,
        },
    ];
    let split = Cell::new(cell_params(vec![grass_tile(0.375), grass_tile(0.625)], bands)).unwrap();
    let total: f64 = split.tile_weights().iter().sum();
    assert_abs_diff_eq!(total, 1.0, epsilon = 1e-15);

    let mut a = single.initial_state().unwrap();
    let mut b = split.initial_state().unwrap();
    for p in [0.0, 22.0, 3.0] {
        let f = day(9.0, p, 200.0, 300.0, 0.8);
        let ra = single.step(&mut a, &f).unwrap().record;
        let rb = split.step(&mut b, &f).unwrap().record;
        for var in [OutVar::Runoff, OutVar::Baseflow, OutVar::Evap, OutVar::Latent, OutVar::Swe] {
            assert_abs_diff_eq!(ra.scalar(var), rb.scalar(var), epsilon = 1e-9);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Scenarios
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn dry_down_from_saturation() {
    let reference = Cell::new(cell_params(Vec::new(), Vec::new())).unwrap();
    let mut params = cell_params(Vec::new(), Vec::new());
    for (p, max) in params.soil.layers.iter_mut().zip(&reference.soil.max_moist) {
        p.init_moist = *max;
    }
    params.config.options.full_energy = false;
    let cell = Cell::new(params).unwrap();
    let mut st = cell.initial_state().unwrap();

    let column = |st: &vic_rs::CellState| cell.soil.total_water(&st.tiles[0].fractions[0].layers);
    let mut last = column(&st);
    for _ in 0..30 {
        let out = cell.step(&mut st, &saturated_day(10.0, 0.0)).unwrap();
        assert_abs_diff_eq!(out.record.scalar(OutVar::Evap), 0.0, epsilon = 1e-9);
        let now = column(&st);
        assert!(now <= last + 1e-9);
        last = now;
    }
    let resid: f64 = cell.soil.resid.iter().sum();
    let max: f64 = cell.soil.max_moist.iter().sum();
    assert!(last < max);
    assert!(last >= resid);
}

#[test]
fn snow_accumulates_then_melts_out() {
    let cell = Cell::new(cell_params(Vec::new(), Vec::new())).unwrap();
    let mut st = cell.initial_state().unwrap();

    let mut last_swe: f64 = 0.0;
    for _ in 0..5 {
        let out = cell.step(&mut st, &day(-8.0, 10.0, 80.0, 220.0, 0.25)).unwrap();
        let swe = out.record.scalar(OutVar::Swe);
        assert!(swe > last_swe);
        last_swe = swe;
    }
    let peak = last_swe;
    assert!(peak > 30.0);

    let mut lost = 0.0;
    let mut ripe_steps = 0;
    let mut last_cover = st.tiles[0].snow.coverage;
    for _ in 0..30 {
        let out = cell.step(&mut st, &day(9.0, 0.0, 320.0, 330.0, svp(0.0))).unwrap();
        let r = &out.record;
        let loss = r.scalar(OutVar::SnowMelt) + r.scalar(OutVar::SubSnow) + r.scalar(OutVar::SubBlowing);
        let swe = r.scalar(OutVar::Swe);
        if st.tiles[0].snow.pack_temp == 0.0 {
            ripe_steps += 1;
            assert_abs_diff_eq!(last_swe - swe, loss, epsilon = 1e-9);
        }
        lost += loss;
        assert!(swe <= last_swe + 1e-9);
        let cover = st.tiles[0].snow.coverage;
        if swe < last_swe && swe > 0.0 {
            assert!(cover <= last_cover + 1e-12);
        }
        last_swe = swe;
        last_cover = cover;
    }
    assert!(ripe_steps > 0);
    assert_eq!(last_swe, 0.0);
    assert_abs_diff_eq!(lost, peak, epsilon = 1e-9);
}

#[test]
fn checkpoint_restart_matches_continuous_run() {
    let mut params = cell_params(vec![grass_tile(0.6)], Vec::new());
    params.config.options.dist_prcp = true;
    let forcing: Vec<AtmosForcingStep> = (0..6)
        .map(|i| {
            let t = if i < 3 { -4.0 } else { 6.0 };
            day(t, if i % 2 == 0 { 8.0 } else { 0.0 }, 150.0, 290.0, 0.4)
        })
        .collect();

    let full = run_cell(params.clone(), &forcing, None).unwrap();
    let first = run_cell(params.clone(), &forcing[..3], None).unwrap();

    let cell = Cell::new(params.clone()).unwrap();
    assert_eq!(first.final_state.len(), state::StateLayout::for_cell(&cell).size());
    let second = run_cell(params, &forcing[3..], Some(&first.final_state)).unwrap();

    assert_eq!(second.final_state, full.final_state);
    for (a, b) in second.records.iter().zip(&full.records[3..]) {
        assert_eq!(a.scalar(OutVar::Runoff), b.scalar(OutVar::Runoff));
        assert_eq!(a.scalar(OutVar::Swe), b.scalar(OutVar::Swe));
    }
    assert!(matches!(
        state::unpack(&cell, &first.final_state[1..]),
        Err(vic_rs::VicError::Checkpoint { .. })
    ));
}
