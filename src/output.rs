// Named flux and state record produced for every cell step.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! out_vars {
    ($($var:ident => $name:literal,)+) => {
        /// Output variables, named as the downstream writers expect.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum OutVar {
            $(#[serde(rename = $name)] $var,)+
        }

        impl OutVar {
            pub const ALL: &'static [OutVar] = &[$(OutVar::$var,)+];

            pub fn name(self) -> &'static str {
                match self {
                    $(OutVar::$var => $name,)+
                }
            }

            pub fn from_name(name: &str) -> Option<OutVar> {
                match name {
                    $($name => Some(OutVar::$var),)+
                    _ => None,
                }
            }
        }
    };
}

out_vars! {
    // Water balance (mm per step)
    Prec => "OUT_PREC",
    Rainf => "OUT_RAINF",
    Snowf => "OUT_SNOWF",
    Evap => "OUT_EVAP",
    EvapCanop => "OUT_EVAP_CANOP",
    TranspVeg => "OUT_TRANSP_VEG",
    EvapBare => "OUT_EVAP_BARE",
    EvapLake => "OUT_EVAP_LAKE",
    SubSnow => "OUT_SUB_SNOW",
    SubCanop => "OUT_SUB_CANOP",
    SubBlowing => "OUT_SUB_BLOWING",
    Runoff => "OUT_RUNOFF",
    Baseflow => "OUT_BASEFLOW",
    DelSoilMoist => "OUT_DELSOILMOIST",
    DelSwe => "OUT_DELSWE",
    WaterError => "OUT_WATER_ERROR",
    // Storages
    SoilMoist => "OUT_SOIL_MOIST",
    SoilIce => "OUT_SOIL_ICE",
    Swe => "OUT_SWE",
    SweBand => "OUT_SWE_BAND",
    SnowDepth => "OUT_SNOW_DEPTH",
    SnowCover => "OUT_SNOW_COVER",
    SnowCanopy => "OUT_SNOW_CANOPY",
    SnowMelt => "OUT_SNOW_MELT",
    Wdew => "OUT_WDEW",
    // Energy balance (W/m^2) and temperatures (C)
    NetShort => "OUT_NET_SHORT",
    NetLong => "OUT_NET_LONG",
    Sensible => "OUT_SENSIBLE",
    Latent => "OUT_LATENT",
    GrndFlux => "OUT_GRND_FLUX",
    DeltaH => "OUT_DELTAH",
    EnergyError => "OUT_ENERGY_ERROR",
    SurfTemp => "OUT_SURF_TEMP",
    SnowSurfTemp => "OUT_SNOW_SURF_TEMP",
    SnowPackTemp => "OUT_SNOW_PACK_TEMP",
    SoilTemp => "OUT_SOIL_TEMP",
    SoilTnode => "OUT_SOIL_TNODE",
    Fdepth => "OUT_FDEPTH",
    Tdepth => "OUT_TDEPTH",
    // Lake
    LakeDepth => "OUT_LAKE_DEPTH",
    LakeIceFract => "OUT_LAKE_ICE_FRACT",
    LakeSurfTemp => "OUT_LAKE_SURF_TEMP",
    LakeStorage => "OUT_LAKE_STORAGE",
}

impl fmt::Display for OutVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Variable → values for one cell step. Scalars hold one value; layered
/// variables hold one per layer, band, node or front.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub values: BTreeMap<OutVar, Vec<f64>>,
}

impl OutputRecord {
    pub fn set(&mut self, var: OutVar, values: Vec<f64>) {
        self.values.insert(var, values);
    }

    pub fn set_scalar(&mut self, var: OutVar, value: f64) {
        self.values.insert(var, vec![value]);
    }

    pub fn get(&self, var: OutVar) -> Option<&[f64]> {
        self.values.get(&var).map(|v| v.as_slice())
    }

    /// First value of `var`, 0 when unset.
    pub fn scalar(&self, var: OutVar) -> f64 {
        self.values.get(&var).and_then(|v| v.first().copied()).unwrap_or(0.0)
    }
}

/// Balance closure of one cell step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDiagnostics {
    pub step: usize,
    pub water_error: f64,     // mm
    pub energy_error: f64,    // W/m^2
    pub snow_mass_error: f64, // m
    pub warnings: Vec<String>,
}
