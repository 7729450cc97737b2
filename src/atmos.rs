// Psychrometrics and turbulent exchange shared by the land, snow, canopy and
// lake energy balances. Temperatures in C, pressures in kPa.

use crate::constants::*;

// ═══════════════════════════════════════════════════════════════════════
// Vapour pressure
// ═══════════════════════════════════════════════════════════════════════

/// Saturated vapour pressure (kPa), over ice below freezing.
#[inline]
pub fn svp(t: f64) -> f64 {
    let es = A_SVP * (B_SVP * t / (C_SVP + t)).exp();
    if t < 0.0 {
        es * (1.0 + 0.00972 * t + 0.000042 * t * t)
    } else {
        es
    }
}

/// Slope of the saturated vapour pressure curve (kPa/C).
#[inline]
pub fn svp_slope(t: f64) -> f64 {
    B_SVP * C_SVP / ((C_SVP + t) * (C_SVP + t)) * svp(t)
}

/// Latent heat of vaporization (J/kg).
#[inline]
pub fn latent_heat_vaporization(t: f64) -> f64 {
    (2.501 - 0.002361 * t) * 1.0e6
}

/// Latent heat of sublimation (J/kg).
#[inline]
pub fn latent_heat_sublimation(t: f64) -> f64 {
    latent_heat_vaporization(t) + LF
}

/// Density of moist air (kg/m^3).
#[inline]
pub fn air_density(pressure: f64, t: f64) -> f64 {
    pressure * 1000.0 / (RGAS * (t + KELVIN))
}

/// Vapour flux (kg/m^2/s) driven by a vapour pressure difference through a
/// resistance (s/m).
#[inline]
pub fn vapor_flux(density: f64, pressure: f64, e_surf: f64, e_air: f64, resistance: f64) -> f64 {
    if resistance >= HUGE_RESIST {
        return 0.0;
    }
    density * EPS / pressure * (e_surf - e_air) / resistance
}

/// Sensible heat flux away from the surface (W/m^2).
#[inline]
pub fn sensible_heat(density: f64, t_surf: f64, t_air: f64, resistance: f64) -> f64 {
    if resistance >= HUGE_RESIST {
        return 0.0;
    }
    density * CP * (t_surf - t_air) / resistance
}

/// Net longwave absorbed by a surface of given emissivity (W/m^2).
#[inline]
pub fn net_longwave(longwave_in: f64, emissivity: f64, t_surf: f64) -> f64 {
    emissivity * (longwave_in - STEFAN_B * (t_surf + KELVIN).powi(4))
}

// ═══════════════════════════════════════════════════════════════════════
// Aerodynamic resistance (Louis et al. 1982 stability correction)
// ═══════════════════════════════════════════════════════════════════════

/// Geometry of the surface layer above one exchange surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExchangeGeometry {
    pub z_wind: f64,       // wind reference height above displacement (m)
    pub z_temp: f64,       // temperature reference height above displacement (m)
    pub roughness: f64,    // momentum roughness length (m)
    pub bstb: f64,         // stability slope parameter
}

impl ExchangeGeometry {
    pub fn new(z_wind: f64, z_temp: f64, roughness: f64) -> Self {
        let roughness = roughness.max(1.0e-4);
        ExchangeGeometry {
            z_wind: z_wind.max(2.0 * roughness),
            z_temp: z_temp.max(2.0 * roughness),
            roughness,
            bstb: 5.0,
        }
    }

    /// Heat exchange coefficient, optionally corrected for stability.
    pub fn exchange_coefficient(&self, t_air: f64, t_surf: f64, wind: f64) -> f64 {
        let z0 = self.roughness;
        let z0h = 0.1 * z0;
        let z_u = self.z_wind;
        let z_t = self.z_temp;

        // Neutral exchange coefficients
        let cd = (VON_K / (z_u / z0).ln()).powi(2);
        let ch = VON_K.powi(2) / ((z_u / z0).ln() * (z_t / z0h).ln());

        let ta = t_air + KELVIN;
        let rib = (G * (t_air - t_surf) * z_u.powi(2) / (z_t * ta * wind.powi(2))).min(RI_LIMIT);
        let fh = if rib > 0.0 {
            1.0 / (1.0 + 3.0 * self.bstb * rib * (1.0 + self.bstb * rib).sqrt())
        } else {
            1.0 - 3.0 * self.bstb * rib
                / (1.0 + 3.0 * self.bstb.powi(2) * cd * (-rib * z_u / z0).sqrt())
        };
        ch * fh
    }

    /// Aerodynamic resistance to heat and vapour transfer (s/m).
    pub fn resistance(&self, t_air: f64, t_surf: f64, wind: f64) -> f64 {
        if wind <= 0.0 {
            return HUGE_RESIST;
        }
        let ch = self.exchange_coefficient(t_air, t_surf, wind);
        if ch <= SMALL {
            HUGE_RESIST
        } else {
            1.0 / (ch * wind)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn svp_matches_reference_values() {
        assert_abs_diff_eq!(svp(0.0), 0.61078, epsilon = 1e-5);
        assert_abs_diff_eq!(svp(20.0), 2.338, epsilon = 1e-2);
        assert!(svp(-10.0) < svp(0.0));
    }

    #[test]
    fn svp_slope_is_consistent_with_finite_difference() {
        let t = 15.0;
        let fd = (svp(t + 0.01) - svp(t - 0.01)) / 0.02;
        assert_abs_diff_eq!(svp_slope(t), fd, epsilon = 1e-4);
    }

    #[test]
    fn stable_stratification_increases_resistance() {
        let geom = ExchangeGeometry::new(10.0, 2.0, 0.01);
        let neutral = geom.resistance(5.0, 5.0, 3.0);
        let stable = geom.resistance(5.0, -5.0, 3.0);
        let unstable = geom.resistance(5.0, 15.0, 3.0);
        assert!(stable > neutral);
        assert!(unstable < neutral);
    }

    #[test]
    fn sensible_heat_sign_follows_gradient() {
        let rho = air_density(100.0, 10.0);
        assert!(sensible_heat(rho, 15.0, 10.0, 50.0) > 0.0);
        assert!(sensible_heat(rho, 5.0, 10.0, 50.0) < 0.0);
        assert_eq!(sensible_heat(rho, 5.0, 10.0, HUGE_RESIST), 0.0);
    }
}
