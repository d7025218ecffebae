//! Readings, sweep specifications and I-V curves.

use crate::config::TrackerConfig;

/// One sourcemeter reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Measured voltage (V).
    pub voltage: f64,
    /// Measured current (A).
    pub current: f64,
    /// Seconds since the run origin (device time until the origin is known).
    pub timestamp: f64,
    /// Instrument status word.
    pub status: u32,
}

impl Measurement {
    pub fn new(voltage: f64, current: f64, timestamp: f64, status: u32) -> Self {
        Self {
            voltage,
            current,
            timestamp,
            status,
        }
    }

    pub fn power(&self) -> f64 {
        self.voltage * self.current
    }

    /// The same reading with the connection polarity applied to the current.
    pub fn with_polarity(self, polarity: Polarity) -> Self {
        Self {
            current: self.current * polarity.sign(),
            ..self
        }
    }

    /// The same reading with its timestamp shifted to start at `origin`.
    pub fn relative_to(self, origin: f64) -> Self {
        Self {
            timestamp: self.timestamp - origin,
            ..self
        }
    }
}

/// How the device is wired to the output terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Polarity {
    #[default]
    Normal,
    Reversed,
}

impl Polarity {
    pub fn from_reversed(reversed: bool) -> Self {
        if reversed {
            Polarity::Reversed
        } else {
            Polarity::Normal
        }
    }

    pub fn sign(self) -> f64 {
        match self {
            Polarity::Normal => 1.0,
            Polarity::Reversed => -1.0,
        }
    }
}

/// Linear voltage sweep used to find the initial operating point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepSpec {
    pub start_voltage: f64,
    pub end_voltage: f64,
    pub point_count: usize,
    /// Current compliance limit (A).
    pub max_current: f64,
    /// Source delay between points (s).
    pub step_delay: f64,
}

impl SweepSpec {
    /// Sweep from the open-circuit voltage down to short circuit.
    pub fn from_open_circuit(voc: f64, config: &TrackerConfig) -> Self {
        Self {
            start_voltage: voc,
            end_voltage: 0.0,
            point_count: config.sweep_points,
            max_current: config.max_current,
            step_delay: config.step_delay,
        }
    }

    /// Nominal step, `|end - start| / point_count`.
    pub fn nominal_step(&self) -> f64 {
        (self.end_voltage - self.start_voltage).abs() / self.point_count as f64
    }
}

/// Readings in acquisition order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IvCurve {
    points: Vec<Measurement>,
}

impl IvCurve {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, measurement: Measurement) {
        self.points.push(measurement);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Measurement] {
        &self.points
    }

    pub fn last(&self) -> Option<&Measurement> {
        self.points.last()
    }

    /// Index of the highest-power point.
    ///
    /// Ties resolve to the lowest index. Points whose power is not finite are
    /// skipped.
    pub fn argmax_power(&self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (index, point) in self.points.iter().enumerate() {
            let power = point.power();
            if !power.is_finite() {
                continue;
            }
            match best {
                Some((_, best_power)) if power <= best_power => {}
                _ => best = Some((index, power)),
            }
        }
        best.map(|(index, _)| index)
    }

    /// The highest-power point.
    pub fn max_power_point(&self) -> Option<&Measurement> {
        self.argmax_power().map(|index| &self.points[index])
    }
}

impl FromIterator<Measurement> for IvCurve {
    fn from_iter<I: IntoIterator<Item = Measurement>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(voltage: f64, current: f64) -> Measurement {
        Measurement::new(voltage, current, 0.0, 0)
    }

    #[test]
    fn test_argmax_prefers_lowest_index_on_ties() {
        let curve: IvCurve = [point(1.0, 2.0), point(2.0, 1.0), point(0.5, 1.0)]
            .into_iter()
            .collect();
        assert_eq!(curve.argmax_power(), Some(0));
        assert_eq!(curve.max_power_point().unwrap().voltage, 1.0);
    }

    #[test]
    fn test_argmax_skips_nan_power() {
        let curve: IvCurve = [point(f64::NAN, 1.0), point(0.4, 0.01), point(0.5, 0.011)]
            .into_iter()
            .collect();
        assert_eq!(curve.argmax_power(), Some(2));
    }

    #[test]
    fn test_argmax_of_empty_curve() {
        assert_eq!(IvCurve::new().argmax_power(), None);
    }

    #[test]
    fn test_polarity_flips_current_only() {
        let m = Measurement::new(0.5, 0.004, 12.0, 0).with_polarity(Polarity::Reversed);
        assert_eq!(m.voltage, 0.5);
        assert_eq!(m.current, -0.004);
        assert_eq!(m.timestamp, 12.0);
    }

    #[test]
    fn test_relative_timestamp() {
        let m = Measurement::new(0.5, 0.004, 112.5, 0).relative_to(100.0);
        assert_eq!(m.timestamp, 12.5);
    }

    #[test]
    fn test_sweep_spec_from_open_circuit() {
        let config = TrackerConfig::default();
        let spec = SweepSpec::from_open_circuit(1.001, &config);
        assert_eq!(spec.start_voltage, 1.001);
        assert_eq!(spec.end_voltage, 0.0);
        assert_eq!(spec.point_count, 1001);
        assert!((spec.nominal_step() - 0.001).abs() < 1e-15);
    }
}
