//! Single-diode photovoltaic cell model.
//!
//! The cell obeys the implicit equation
//!
//! ```text
//! I = Iph - I0 * (exp((V + I*Rs) / (n*Vth)) - 1) - (V + I*Rs) / Rsh
//! ```
//!
//! which is solved in closed form with the principal branch of the Lambert W
//! function. The W arguments overflow `f64` for realistic shunt resistances
//! (the open-circuit argument is around `exp(67000)`), so W is evaluated from
//! the logarithm of its argument.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const BOLTZMANN: f64 = 1.3806488e-23; // J/K
const ELEMENTARY_CHARGE: f64 = 1.60217657e-19; // C
const ZERO_CELSIUS: f64 = 273.15; // K

const W_MAX_ITERATIONS: usize = 64;
const W_TOLERANCE: f64 = 1e-14;
const MPP_TOLERANCE: f64 = 1e-12;

/// Errors raised by the diode model.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DiodeError {
    #[error("invalid diode parameter {name} = {value}")]
    InvalidParameter { name: &'static str, value: f64 },

    #[error("Lambert W did not converge for ln(x) = {ln_x} after {iterations} iterations")]
    NonConvergent { ln_x: f64, iterations: usize },
}

/// Thermal voltage `kT/q` at a cell temperature in degrees Celsius.
pub fn thermal_voltage(celsius: f64) -> f64 {
    BOLTZMANN * (ZERO_CELSIUS + celsius) / ELEMENTARY_CHARGE
}

/// Equivalent-circuit parameters of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiodeParameters {
    /// Series resistance Rs (ohm).
    pub series_resistance: f64,
    /// Shunt resistance Rsh (ohm).
    pub shunt_resistance: f64,
    /// Diode ideality factor n.
    pub ideality_factor: f64,
    /// Reverse saturation current I0 (A).
    pub saturation_current: f64,
    /// Photogenerated current Iph (A).
    pub photocurrent: f64,
    /// Thermal voltage Vth (V).
    pub thermal_voltage: f64,
}

impl Default for DiodeParameters {
    /// A small perovskite cell at 29 °C.
    fn default() -> Self {
        Self {
            series_resistance: 9.28,
            shunt_resistance: 1e6,
            ideality_factor: 3.58,
            saturation_current: 260.4e-9,
            photocurrent: 6.293e-3,
            thermal_voltage: thermal_voltage(29.0),
        }
    }
}

impl DiodeParameters {
    /// The same circuit with the thermal voltage of a cell at `celsius`.
    pub fn at_temperature(self, celsius: f64) -> Self {
        Self {
            thermal_voltage: thermal_voltage(celsius),
            ..self
        }
    }

    fn validate(&self) -> Result<(), DiodeError> {
        let strictly_positive = [
            ("series_resistance", self.series_resistance),
            ("shunt_resistance", self.shunt_resistance),
            ("ideality_factor", self.ideality_factor),
            ("saturation_current", self.saturation_current),
            ("thermal_voltage", self.thermal_voltage),
        ];
        for (name, value) in strictly_positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(DiodeError::InvalidParameter { name, value });
            }
        }
        if !self.photocurrent.is_finite() || self.photocurrent < 0.0 {
            return Err(DiodeError::InvalidParameter {
                name: "photocurrent",
                value: self.photocurrent,
            });
        }
        Ok(())
    }
}

/// Principal branch `W0(x)` for `x = exp(ln_x)`.
///
/// Large arguments are solved as `w + ln(w) = ln_x` by Newton iteration so the
/// argument itself is never formed. Small arguments use Halley iteration on
/// `w * exp(w) = x`.
pub fn lambert_w0_ln(ln_x: f64) -> Result<f64, DiodeError> {
    let non_convergent = DiodeError::NonConvergent {
        ln_x,
        iterations: W_MAX_ITERATIONS,
    };
    if ln_x.is_nan() || ln_x == f64::INFINITY {
        return Err(non_convergent);
    }

    if ln_x < 1.0 {
        let x = ln_x.exp();
        if x == 0.0 {
            return Ok(0.0);
        }
        let mut w = x.ln_1p();
        for _ in 0..W_MAX_ITERATIONS {
            let ew = w.exp();
            let f = w * ew - x;
            let next = w - f / (ew * (w + 1.0) - (w + 2.0) * f / (2.0 * w + 2.0));
            if !next.is_finite() {
                return Err(non_convergent);
            }
            if (next - w).abs() <= W_TOLERANCE * next.abs().max(1.0) {
                return Ok(next);
            }
            w = next;
        }
    } else {
        // ln_x - ln(ln_x) is positive for every ln_x >= 1
        let mut w = ln_x - ln_x.ln();
        for _ in 0..W_MAX_ITERATIONS {
            let f = w + w.ln() - ln_x;
            let mut next = w - f / (1.0 + 1.0 / w);
            if next <= 0.0 {
                next = w / 2.0;
            }
            if !next.is_finite() {
                return Err(non_convergent);
            }
            if (next - w).abs() <= W_TOLERANCE * next.abs().max(1.0) {
                return Ok(next);
            }
            w = next;
        }
    }
    Err(non_convergent)
}

/// A validated single-diode cell.
#[derive(Debug, Clone)]
pub struct DiodeModel {
    params: DiodeParameters,
}

impl DiodeModel {
    /// Validate the parameters and build the model.
    ///
    /// Every parameter must be finite; resistances, ideality, saturation
    /// current and thermal voltage must be positive and the photocurrent
    /// non-negative.
    pub fn new(params: DiodeParameters) -> Result<Self, DiodeError> {
        params.validate()?;
        let model = Self { params };
        // Reject parameter sets whose open-circuit point cannot be solved.
        model.open_circuit_voltage()?;
        Ok(model)
    }

    pub fn parameters(&self) -> &DiodeParameters {
        &self.params
    }

    /// `n * Vth`
    fn modified_thermal_voltage(&self) -> f64 {
        self.params.ideality_factor * self.params.thermal_voltage
    }

    /// Terminal current at an applied voltage.
    pub fn current_at(&self, voltage: f64) -> Result<f64, DiodeError> {
        let p = &self.params;
        let a = self.modified_thermal_voltage();
        let rs = p.series_resistance;
        let rsh = p.shunt_resistance;
        let r_total = rs + rsh;

        let source = (p.saturation_current + p.photocurrent) * rsh;
        let drop = rs * (source - voltage);
        let ln_x =
            (p.saturation_current * rs * rsh / (a * r_total)).ln() + (drop / r_total + voltage) / a;

        let w = lambert_w0_ln(ln_x)?;
        let current = (drop - a * r_total * w) / (rs * r_total);
        if !current.is_finite() {
            return Err(DiodeError::NonConvergent { ln_x, iterations: 0 });
        }
        Ok(current)
    }

    /// Voltage at which the terminal current is zero.
    pub fn open_circuit_voltage(&self) -> Result<f64, DiodeError> {
        let p = &self.params;
        let a = self.modified_thermal_voltage();
        let rsh = p.shunt_resistance;

        let source = (p.saturation_current + p.photocurrent) * rsh;
        let ln_x = (p.saturation_current * rsh / a).ln() + source / a;
        let w = lambert_w0_ln(ln_x)?;
        Ok(source - a * w)
    }

    /// Analytic maximum power point `(voltage, power)` on `[0, Voc]`.
    ///
    /// Golden-section search; `P(V)` is unimodal on that interval.
    pub fn max_power_point(&self) -> Result<(f64, f64), DiodeError> {
        let inv_phi = (5f64.sqrt() - 1.0) / 2.0;
        let power = |v: f64| self.current_at(v).map(|i| v * i);

        let mut lo = 0.0;
        let mut hi = self.open_circuit_voltage()?;
        let mut x1 = hi - inv_phi * (hi - lo);
        let mut x2 = lo + inv_phi * (hi - lo);
        let mut p1 = power(x1)?;
        let mut p2 = power(x2)?;
        while hi - lo > MPP_TOLERANCE {
            if p1 < p2 {
                lo = x1;
                x1 = x2;
                p1 = p2;
                x2 = lo + inv_phi * (hi - lo);
                p2 = power(x2)?;
            } else {
                hi = x2;
                x2 = x1;
                p2 = p1;
                x1 = hi - inv_phi * (hi - lo);
                p1 = power(x1)?;
            }
        }
        let v = (lo + hi) / 2.0;
        Ok((v, power(v)?))
    }
}
