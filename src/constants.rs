// Physical constants and numerical thresholds shared by every sub-model.

// ═══════════════════════════════════════════════════════════════════════
// Physical constants
// ═══════════════════════════════════════════════════════════════════════

pub const KELVIN: f64 = 273.15; // Conversion factor C to K
pub const STEFAN_B: f64 = 5.6696e-8; // Stefan-Boltzmann constant (W/m^2/K^4)
pub const LF: f64 = 3.337e5; // Latent heat of freezing at 0C (J/kg)
pub const RHO_W: f64 = 1000.0; // Density of water (kg/m^3)
pub const RHO_ICE: f64 = 917.0; // Density of ice (kg/m^3)
pub const CP: f64 = 1010.0; // Specific heat of air at constant pressure (J/kg/K)
pub const CH_ICE: f64 = 2100.0e3; // Volumetric heat capacity of ice (J/m^3/K)
pub const CH_WATER: f64 = 4186.8e3; // Volumetric heat capacity of water (J/m^3/K)
pub const K_SNOW: f64 = 2.9302e-6; // Snow conductivity coefficient, k = K_SNOW * rho^2 (W/m/K)
pub const EPS: f64 = 0.62196351; // Ratio of molecular weights, water vapour / dry air
pub const G: f64 = 9.81; // Gravity (m/s^2)
pub const VON_K: f64 = 0.40; // Von Karman constant
pub const RGAS: f64 = 287.0; // Gas constant for dry air (J/K/kg)
pub const T_LAPSE: f64 = 6.5; // Temperature lapse rate (C/km)

// Saturated vapour pressure curve (kPa)
pub const A_SVP: f64 = 0.61078;
pub const B_SVP: f64 = 17.269;
pub const C_SVP: f64 = 237.3;

// Soil thermal conductivities (W/m/K)
pub const HCON_WAT: f64 = 0.57;
pub const HCON_ICE: f64 = 2.2;
pub const HCON_QUARTZ: f64 = 7.7;
pub const HCON_MINERAL: f64 = 2.2;
pub const CH_SOLIDS: f64 = 2.0e6; // Volumetric heat capacity of soil solids (J/m^3/K)

// ═══════════════════════════════════════════════════════════════════════
// Time constants
// ═══════════════════════════════════════════════════════════════════════

pub const SEC_PER_HOUR: f64 = 3600.0;
pub const SEC_PER_DAY: f64 = 86400.0;
pub const HOURS_PER_DAY: f64 = 24.0;

// ═══════════════════════════════════════════════════════════════════════
// Numerical constraints
// ═══════════════════════════════════════════════════════════════════════

pub const SMALL: f64 = 1.0e-12; // Smallest allowable positive number
pub const HUGE_RESIST: f64 = 1.0e20; // Resistance used for no exchange (s/m)
pub const MIN_SOIL_DEPTH: f64 = 0.001; // Minimum soil layer thickness (m)
pub const STORM_THRES: f64 = 0.001; // Precipitation declaring a new storm (mm)
pub const RI_LIMIT: f64 = 0.2; // Upper limit on the bulk Richardson number

// Bare soil surface
pub const BARE_SOIL_ALBEDO: f64 = 0.2;
pub const BARE_SOIL_ROUGHNESS: f64 = 0.001; // m

// ═══════════════════════════════════════════════════════════════════════
// Snow
// ═══════════════════════════════════════════════════════════════════════

pub const MAX_SURFACE_SWE: f64 = 0.125; // Maximum SWE of the surface snow layer (m)
pub const LIQUID_WATER_CAPACITY: f64 = 0.035; // Liquid holding capacity (fraction of SWE)
pub const MIN_SWQ: f64 = 1.0e-6; // SWE below which the pack is removed (m)
pub const NEW_SNOW_ALB: f64 = 0.85;
pub const SNOW_ALB_ACCUM_A: f64 = 0.94;
pub const SNOW_ALB_ACCUM_B: f64 = 0.58;
pub const SNOW_ALB_THAW_A: f64 = 0.82;
pub const SNOW_ALB_THAW_B: f64 = 0.46;
pub const SNOW_MAX_DENSITY_COLD: f64 = 300.0; // Max cold snow density (kg/m^3)
pub const SNOW_MAX_DENSITY_MELT: f64 = 500.0; // Max melting snow density (kg/m^3)
pub const SNOW_COMPACTION_HOURS: f64 = 200.0; // Compaction timescale (h)
pub const MIN_SNOW_COND_DEPTH: f64 = 0.05; // Depth floor for pack conduction (m)
pub const SNOW_INTERCEPT_LAI: f64 = 0.0005; // Canopy snow storage per unit LAI (m)
pub const SNOW_INTERCEPT_EFF: f64 = 0.6; // Fraction of snowfall caught by the canopy
pub const WDEW_PER_LAI: f64 = 0.2; // Fallback dew storage per unit LAI (mm)
pub const BLOWING_RATE: f64 = 2.0e-9; // Blowing snow sublimation scale (m/s per m/s)
pub const BLOWING_FETCH_SCALE: f64 = 1000.0; // Fetch length scale (m)
pub const SNOW_ROUGHNESS: f64 = 0.0005; // Snow surface roughness (m)
pub const TRACE_SNOW: f64 = 0.0001; // Snowfall that refreshes albedo (m)

// ═══════════════════════════════════════════════════════════════════════
// Lake
// ═══════════════════════════════════════════════════════════════════════

pub const LAKE_WATER_ALBEDO: f64 = 0.08;
pub const LAKE_ICE_ALBEDO: f64 = 0.6;
pub const LAKE_EMISSIVITY: f64 = 0.97;
pub const LAKE_ROUGHNESS: f64 = 0.001; // Open water roughness (m)
pub const K_ICE: f64 = 2.3; // Lake ice conductivity (W/m/K)
pub const FRAC_LIM: f64 = 0.1; // Ice thickness at which new ice spreads laterally (m)
pub const LAKE_DIFFUSIVITY: f64 = 1.4e-7; // Molecular diffusivity of water (m^2/s)
pub const LAKE_EDDY_DIFFUSIVITY: f64 = 2.0e-5; // Wind-driven mixing scale (m^2/s per m/s)
pub const LAKE_MIN_SURF_DZ: f64 = 0.1; // Minimum surface layer thickness (m)
