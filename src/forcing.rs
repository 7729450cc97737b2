use serde::{Deserialize, Serialize};

use crate::atmos::{air_density, svp};
use crate::error::{VicError, VicResult};

/// Atmospheric drivers for one record (a snow sub-step or the whole step).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AtmosRecord {
    pub air_temp: f64,  // C
    pub density: f64,   // kg/m^3
    pub longwave: f64,  // incoming longwave (W/m^2)
    pub prec: f64,      // precipitation over the record (mm)
    pub pressure: f64,  // kPa
    pub shortwave: f64, // incoming shortwave (W/m^2)
    pub vp: f64,        // vapour pressure (kPa)
    pub vpd: f64,       // vapour pressure deficit (kPa)
    pub wind: f64,      // m/s
}

impl AtmosRecord {
    /// Complete a record from the primary drivers.
    pub fn new(
        air_temp: f64,
        prec: f64,
        shortwave: f64,
        longwave: f64,
        pressure: f64,
        vp: f64,
        wind: f64,
    ) -> Self {
        AtmosRecord {
            air_temp,
            density: air_density(pressure, air_temp),
            longwave,
            prec,
            pressure,
            shortwave,
            vp,
            vpd: (svp(air_temp) - vp).max(0.0),
            wind,
        }
    }

    /// Elevation-band view: lapse-rate temperature shift and precipitation scaling.
    pub fn for_band(&self, tfactor: f64, pfactor: f64) -> Self {
        let air_temp = self.air_temp + tfactor;
        let vp = self.vp.min(svp(air_temp));
        AtmosRecord {
            air_temp,
            density: air_density(self.pressure, air_temp),
            prec: self.prec * pfactor,
            vp,
            vpd: (svp(air_temp) - vp).max(0.0),
            ..*self
        }
    }

    fn validate(&self) -> VicResult<()> {
        if !(self.prec >= 0.0) {
            return Err(VicError::parameter("prec", self.prec, "must be non-negative"));
        }
        if !(self.pressure > 0.0) {
            return Err(VicError::parameter("pressure", self.pressure, "must be positive"));
        }
        if !(self.wind >= 0.0) {
            return Err(VicError::parameter("wind", self.wind, "must be non-negative"));
        }
        if !(self.shortwave >= 0.0) || !(self.longwave >= 0.0) {
            return Err(VicError::parameter(
                "radiation",
                self.shortwave.min(self.longwave),
                "must be non-negative",
            ));
        }
        if !self.air_temp.is_finite() || !(self.vp >= 0.0) {
            return Err(VicError::parameter("air_temp", self.air_temp, "must be finite"));
        }
        Ok(())
    }
}

/// Which view of a forcing step to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepIndex {
    Sub(usize),
    Whole,
}

/// Read-only forcing for one model step: sub-step records plus their aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtmosForcingStep {
    pub month: usize, // 1..=12
    pub substeps: Vec<AtmosRecord>,
    pub whole: AtmosRecord,
}

impl AtmosForcingStep {
    /// Build a step from sub-step records; the aggregate averages states and
    /// sums precipitation.
    pub fn from_substeps(month: usize, substeps: Vec<AtmosRecord>) -> VicResult<Self> {
        if substeps.is_empty() {
            return Err(VicError::Shape {
                name: "forcing substeps",
                expected: 1,
                actual: 0,
            });
        }
        if !(1..=12).contains(&month) {
            return Err(VicError::parameter("month", month as f64, "must lie in 1..=12"));
        }
        for rec in &substeps {
            rec.validate()?;
        }
        let n = substeps.len() as f64;
        let mean = |f: fn(&AtmosRecord) -> f64| substeps.iter().map(f).sum::<f64>() / n;
        let whole = AtmosRecord {
            air_temp: mean(|r| r.air_temp),
            density: mean(|r| r.density),
            longwave: mean(|r| r.longwave),
            prec: substeps.iter().map(|r| r.prec).sum(),
            pressure: mean(|r| r.pressure),
            shortwave: mean(|r| r.shortwave),
            vp: mean(|r| r.vp),
            vpd: mean(|r| r.vpd),
            wind: mean(|r| r.wind),
        };
        Ok(AtmosForcingStep {
            month,
            substeps,
            whole,
        })
    }

    /// Single-record step, used when the snow step equals the model step.
    pub fn single(month: usize, record: AtmosRecord) -> VicResult<Self> {
        Self::from_substeps(month, vec![record])
    }

    pub fn n_substeps(&self) -> usize {
        self.substeps.len()
    }

    pub fn record(&self, index: StepIndex) -> &AtmosRecord {
        match index {
            StepIndex::Sub(i) => &self.substeps[i.min(self.substeps.len() - 1)],
            StepIndex::Whole => &self.whole,
        }
    }

    pub fn for_band(&self, tfactor: f64, pfactor: f64) -> Self {
        AtmosForcingStep {
            month: self.month,
            substeps: self
                .substeps
                .iter()
                .map(|r| r.for_band(tfactor, pfactor))
                .collect(),
            whole: self.whole.for_band(tfactor, pfactor),
        }
    }

    /// Copy of the step with every precipitation value scaled.
    pub fn with_prec_scaled(&self, factor: f64) -> Self {
        let mut out = self.clone();
        for r in out.substeps.iter_mut() {
            r.prec *= factor;
        }
        out.whole.prec *= factor;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn rec(t: f64, p: f64) -> AtmosRecord {
        AtmosRecord::new(t, p, 200.0, 300.0, 95.0, 0.5, 2.0)
    }

    #[test]
    fn whole_step_aggregates_substeps() {
        let step =
            AtmosForcingStep::from_substeps(3, vec![rec(0.0, 1.0), rec(4.0, 2.0)]).unwrap();
        assert_abs_diff_eq!(step.whole.air_temp, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(step.whole.prec, 3.0, epsilon = 1e-12);
        assert_eq!(step.record(StepIndex::Sub(1)).air_temp, 4.0);
        assert_eq!(step.record(StepIndex::Whole).prec, 3.0);
    }

    #[test]
    fn band_adjustment_shifts_temperature_and_scales_precipitation() {
        let r = rec(1.0, 10.0).for_band(-2.0, 1.5);
        assert_abs_diff_eq!(r.air_temp, -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(r.prec, 15.0, epsilon = 1e-12);
        assert!(r.vp <= svp(r.air_temp) + 1e-12);
    }

    #[test]
    fn negative_precipitation_is_rejected() {
        assert!(AtmosForcingStep::single(1, rec(0.0, -1.0)).is_err());
        assert!(AtmosForcingStep::single(13, rec(0.0, 1.0)).is_err());
    }
}
