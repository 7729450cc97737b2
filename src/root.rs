// Bracketed root finding (Brent's method) shared by every temperature and
// vapour-pressure search in the solver.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Termination criteria for a bracketed search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RootSolver {
    pub tolerance: f64,      // |R(x)| accepted as a root
    pub min_step: f64,       // bracket width at which the search stops
    pub max_iterations: usize,
    pub widen_factor: f64,   // bracket growth applied on the single retry
}

impl Default for RootSolver {
    fn default() -> Self {
        RootSolver {
            tolerance: 1.0e-3,
            min_step: 1.0e-6,
            max_iterations: 100,
            widen_factor: 20.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Root {
    pub value: f64,
    pub residual: f64,
    pub iterations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum RootError {
    #[error("root not bracketed: R({lower:.4}) = {f_lower:.4e}, R({upper:.4}) = {f_upper:.4e}")]
    NotBracketed {
        lower: f64,
        upper: f64,
        f_lower: f64,
        f_upper: f64,
    },
    #[error("no convergence after {iterations} iterations (x = {value:.4}, R = {residual:.4e})")]
    MaxIterations {
        iterations: usize,
        value: f64,
        residual: f64,
    },
    #[error("residual is not finite at x = {value}")]
    NonFinite { value: f64 },
}

/// Which end of a bracket may move when the search is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Widen {
    Both,
    Lower,
    Upper,
}

impl RootSolver {
    /// Brent's method on `[lower, upper]`.
    ///
    /// Converges when `|R(x)| < tolerance` or the bracket shrinks below
    /// `min_step`. A bracket without a sign change is a definite failure.
    pub fn brent<F: FnMut(f64) -> f64>(
        &self,
        lower: f64,
        upper: f64,
        mut f: F,
    ) -> Result<Root, RootError> {
        let mut a = lower;
        let mut b = upper;
        let mut fa = f(a);
        if !fa.is_finite() {
            return Err(RootError::NonFinite { value: a });
        }
        let mut fb = f(b);
        if !fb.is_finite() {
            return Err(RootError::NonFinite { value: b });
        }
        if fa.abs() < self.tolerance {
            return Ok(Root { value: a, residual: fa, iterations: 0 });
        }
        if fb.abs() < self.tolerance {
            return Ok(Root { value: b, residual: fb, iterations: 0 });
        }
        if fa.signum() == fb.signum() {
            return Err(RootError::NotBracketed {
                lower,
                upper,
                f_lower: fa,
                f_upper: fb,
            });
        }

        let mut c = b;
        let mut fc = fb;
        let mut d = b - a;
        let mut e = d;

        for iter in 1..=self.max_iterations {
            if fb.signum() == fc.signum() {
                c = a;
                fc = fa;
                d = b - a;
                e = d;
            }
            if fc.abs() < fb.abs() {
                a = b;
                b = c;
                c = a;
                fa = fb;
                fb = fc;
                fc = fa;
            }
            let tol1 = 2.0 * f64::EPSILON * b.abs() + 0.5 * self.min_step;
            let xm = 0.5 * (c - b);
            if xm.abs() <= tol1 || fb.abs() < self.tolerance {
                log::trace!("brent converged in {} iterations at {:.6}", iter, b);
                return Ok(Root { value: b, residual: fb, iterations: iter });
            }

            if e.abs() >= tol1 && fa.abs() > fb.abs() {
                // Inverse quadratic interpolation or secant step
                let s = fb / fa;
                let (mut p, mut q);
                if a == c {
                    p = 2.0 * xm * s;
                    q = 1.0 - s;
                } else {
                    let qq = fa / fc;
                    let r = fb / fc;
                    p = s * (2.0 * xm * qq * (qq - r) - (b - a) * (r - 1.0));
                    q = (qq - 1.0) * (r - 1.0) * (s - 1.0);
                }
                if p > 0.0 {
                    q = -q;
                }
                p = p.abs();
                let min1 = 3.0 * xm * q - (tol1 * q).abs();
                let min2 = (e * q).abs();
                if 2.0 * p < min1.min(min2) {
                    e = d;
                    d = p / q;
                } else {
                    d = xm;
                    e = d;
                }
            } else {
                d = xm;
                e = d;
            }

            a = b;
            fa = fb;
            if d.abs() > tol1 {
                b += d;
            } else {
                b += tol1.copysign(xm);
            }
            fb = f(b);
            if !fb.is_finite() {
                return Err(RootError::NonFinite { value: b });
            }
        }

        Err(RootError::MaxIterations {
            iterations: self.max_iterations,
            value: b,
            residual: fb,
        })
    }

    /// Brent search with at most one widened retry when the first bracket
    /// does not enclose a sign change.
    pub fn solve<F: FnMut(f64) -> f64>(
        &self,
        lower: f64,
        upper: f64,
        widen: Widen,
        f: F,
    ) -> Result<Root, RootError> {
        self.solve_within(lower, upper, widen, (f64::NEG_INFINITY, f64::INFINITY), f)
    }

    /// As `solve`, with the widened bracket clamped to `limits`. Residuals
    /// outside the limits are never evaluated.
    pub fn solve_within<F: FnMut(f64) -> f64>(
        &self,
        lower: f64,
        upper: f64,
        widen: Widen,
        limits: (f64, f64),
        mut f: F,
    ) -> Result<Root, RootError> {
        let (min, max) = limits;
        let lower = lower.max(min);
        let upper = upper.min(max);
        match self.brent(lower, upper, &mut f) {
            Err(RootError::NotBracketed { .. }) => {
                let width = upper - lower;
                let grow = (self.widen_factor - 1.0).max(0.0) * width;
                let (lo, hi) = match widen {
                    Widen::Both => (lower - 0.5 * grow, upper + 0.5 * grow),
                    Widen::Lower => (lower - grow, upper),
                    Widen::Upper => (lower, upper + grow),
                };
                let (lo, hi) = (lo.max(min), hi.min(max));
                log::debug!(
                    "widening bracket [{:.3}, {:.3}] -> [{:.3}, {:.3}]",
                    lower,
                    upper,
                    lo,
                    hi
                );
                self.brent(lo, hi, &mut f)
            }
            other => other,
        }
    }

    /// Search a bracket of the given half-width centred on `center`.
    pub fn solve_about<F: FnMut(f64) -> f64>(
        &self,
        center: f64,
        half_width: f64,
        f: F,
    ) -> Result<Root, RootError> {
        self.solve(center - half_width, center + half_width, Widen::Both, f)
    }

    /// As `solve_about`, clamped to `limits`.
    pub fn solve_about_within<F: FnMut(f64) -> f64>(
        &self,
        center: f64,
        half_width: f64,
        limits: (f64, f64),
        f: F,
    ) -> Result<Root, RootError> {
        self.solve_within(center - half_width, center + half_width, Widen::Both, limits, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn linear_residual_converges_within_iteration_bound() {
        let solver = RootSolver::default();
        let root = solver.brent(-10.0, 10.0, |t| -2.0 * (t - 3.7)).unwrap();
        assert!(root.residual.abs() < solver.tolerance);
        assert!(root.iterations <= solver.max_iterations);
        assert_abs_diff_eq!(root.value, 3.7, epsilon = 1e-3);
    }

    #[test]
    fn nonlinear_residual_converges() {
        let solver = RootSolver {
            tolerance: 1e-9,
            ..RootSolver::default()
        };
        let root = solver.brent(0.0, 2.0, |x| x * x * x - 2.0).unwrap();
        assert_abs_diff_eq!(root.value, 2.0_f64.cbrt(), epsilon = 1e-6);
    }

    #[test]
    fn unbracketed_root_is_a_definite_failure() {
        let solver = RootSolver::default();
        let err = solver.brent(0.0, 1.0, |t| t + 5.0).unwrap_err();
        assert!(matches!(err, RootError::NotBracketed { .. }));
    }

    #[test]
    fn single_widening_retry_recovers_nearby_root() {
        let solver = RootSolver {
            widen_factor: 10.0,
            ..RootSolver::default()
        };
        // Root at -3 lies outside [-1, 0] but inside the widened lower bracket
        let root = solver.solve(-1.0, 0.0, Widen::Lower, |t| -(t + 3.0)).unwrap();
        assert_abs_diff_eq!(root.value, -3.0, epsilon = 1e-3);
    }

    #[test]
    fn widening_happens_only_once() {
        let solver = RootSolver {
            widen_factor: 2.0,
            ..RootSolver::default()
        };
        let err = solver.solve_about(0.0, 1.0, |t| t - 100.0).unwrap_err();
        assert!(matches!(err, RootError::NotBracketed { .. }));
    }

    #[test]
    fn widened_bracket_stays_inside_limits() {
        let solver = RootSolver::default();
        let mut lowest = f64::INFINITY;
        // Default widening would reach -260; the pole at -237.3 must stay out of reach
        let root = solver
            .solve_within(-13.0, 0.0, Widen::Lower, (-100.0, 100.0), |t| {
                lowest = lowest.min(t);
                1000.0 * (crate::atmos::svp(t) - crate::atmos::svp(-40.0))
            })
            .unwrap();
        assert_abs_diff_eq!(root.value, -40.0, epsilon = 1e-2);
        assert!(lowest >= -100.0);
    }

    #[test]
    fn limits_do_not_rescue_a_root_beyond_them() {
        let solver = RootSolver::default();
        let err = solver
            .solve_within(-13.0, 0.0, Widen::Lower, (-100.0, 100.0), |t| t + 150.0)
            .unwrap_err();
        assert!(matches!(err, RootError::NotBracketed { lower, .. } if lower == -100.0));
    }

    #[test]
    fn iteration_limit_is_reported() {
        let solver = RootSolver {
            tolerance: 0.0,
            min_step: 0.0,
            max_iterations: 3,
            widen_factor: 1.0,
        };
        let err = solver.brent(-1.0, 1.0, |x| x.powi(3) - 0.123).unwrap_err();
        assert!(matches!(err, RootError::MaxIterations { iterations: 3, .. }));
    }
}
