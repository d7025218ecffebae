//! A sourcemeter that answers from the single-diode model.
//!
//! Every reading blocks the clock for a fixed latency, modelling instrument
//! integration time, and sweeps accumulate one latency per point.

use std::time::Duration;

use tracing::debug;

use crate::clock::Clock;
use crate::device::{Command, DeviceError, Quantity, SourceMeter};
use crate::diode::{DiodeError, DiodeModel};
use crate::measurement::Measurement;

/// Default time one simulated reading takes.
pub const DEFAULT_LATENCY: Duration = Duration::from_millis(10);

/// Simulated Keithley-style sourcemeter wired to a [`DiodeModel`].
#[derive(Debug)]
pub struct SimulatedSourceMeter<C: Clock> {
    model: DiodeModel,
    clock: C,
    origin: Duration,
    latency: Duration,
    voltage: f64,
    current: f64,
    sweep_mode: bool,
    sweep_points: usize,
    sweep_start: f64,
    sweep_stop: f64,
    status: u32,
    closed: bool,
}

impl<C: Clock> SimulatedSourceMeter<C> {
    /// Start at 0 V; timestamps count from the moment of creation.
    pub fn new(model: DiodeModel, clock: C) -> Result<Self, DiodeError> {
        let current = model.current_at(0.0)?;
        let origin = clock.elapsed();
        debug!(origin = ?origin, "Simulated sourcemeter created");
        Ok(Self {
            model,
            clock,
            origin,
            latency: DEFAULT_LATENCY,
            voltage: 0.0,
            current,
            sweep_mode: false,
            sweep_points: 1001,
            sweep_start: 1.0,
            sweep_stop: 0.0,
            status: 0,
            closed: false,
        })
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn model(&self) -> &DiodeModel {
        &self.model
    }

    /// Voltage currently applied to the simulated cell.
    pub fn voltage(&self) -> f64 {
        self.voltage
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn apply_voltage(&mut self, voltage: f64) -> Result<(), DiodeError> {
        self.current = self.model.current_at(voltage)?;
        self.voltage = voltage;
        Ok(())
    }

    fn open_circuit(&mut self) -> Result<(), DiodeError> {
        self.voltage = self.model.open_circuit_voltage()?;
        self.current = 0.0;
        Ok(())
    }

    fn sample(&self) -> Measurement {
        self.clock.sleep(self.latency);
        let elapsed = self.clock.elapsed().saturating_sub(self.origin);
        Measurement::new(self.voltage, self.current, elapsed.as_secs_f64(), self.status)
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        if self.closed {
            Err(DeviceError::Closed)
        } else {
            Ok(())
        }
    }
}

impl<C: Clock> SourceMeter for SimulatedSourceMeter<C> {
    fn write(&mut self, command: &Command) -> Result<(), DeviceError> {
        self.ensure_open()?;
        match command {
            Command::SourceCurrent(amps) if *amps == 0.0 => self.open_circuit()?,
            Command::SourceCurrent(amps) => {
                return Err(DeviceError::Unsupported(format!(
                    "sourcing {amps} A (only open circuit is simulated)"
                )));
            }
            Command::LinearVoltageSweep => self.sweep_mode = true,
            Command::FixedMode(Quantity::Voltage) => self.sweep_mode = false,
            Command::SweepPoints(points) => self.sweep_points = *points,
            Command::SweepStart(volts) => self.sweep_start = *volts,
            Command::SweepStop(volts) => self.sweep_stop = *volts,
            Command::SourceVoltage(volts) => self.apply_voltage(*volts)?,
            _ => {}
        }
        Ok(())
    }

    fn query_scalar(&mut self) -> Result<Measurement, DeviceError> {
        self.ensure_open()?;
        if self.sweep_mode {
            return Err(DeviceError::Unsupported(
                "scalar reading while in sweep mode".to_string(),
            ));
        }
        Ok(self.sample())
    }

    fn query_sweep(&mut self) -> Result<Vec<Measurement>, DeviceError> {
        self.ensure_open()?;
        if !self.sweep_mode {
            return Ok(vec![self.sample()]);
        }

        let points = self.sweep_points;
        let span = self.sweep_stop - self.sweep_start;
        let mut readings = Vec::with_capacity(points);
        for k in 0..points {
            let voltage = if points > 1 {
                self.sweep_start + span * k as f64 / (points - 1) as f64
            } else {
                self.sweep_start
            };
            self.apply_voltage(voltage)?;
            readings.push(self.sample());
        }
        Ok(readings)
    }

    fn query_step_size(&mut self) -> Result<f64, DeviceError> {
        self.ensure_open()?;
        if self.sweep_points == 0 {
            return Err(DeviceError::Unsupported(
                "step size of a zero-point sweep".to_string(),
            ));
        }
        Ok((self.sweep_stop - self.sweep_start) / self.sweep_points as f64)
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::diode::DiodeParameters;

    fn simulator() -> (SimulatedSourceMeter<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        let model = DiodeModel::new(DiodeParameters::default()).unwrap();
        (SimulatedSourceMeter::new(model, clock.clone()).unwrap(), clock)
    }

    #[test]
    fn test_reading_blocks_for_latency() {
        let (mut sim, clock) = simulator();
        let m = sim.query_scalar().unwrap();
        assert_eq!(clock.elapsed(), DEFAULT_LATENCY);
        assert!((m.timestamp - 0.01).abs() < 1e-12);
        assert_eq!(m.status, 0);
        assert_eq!(m.voltage, 0.0);
        assert!((m.current - 6.293e-3).abs() < 1e-6);
    }

    #[test]
    fn test_zero_current_forces_open_circuit() {
        let (mut sim, _) = simulator();
        sim.write(&Command::SourceCurrent(0.0)).unwrap();
        let m = sim.query_scalar().unwrap();
        assert!((m.voltage - 0.9408).abs() < 1e-3);
        assert_eq!(m.current, 0.0);
        assert!(matches!(
            sim.write(&Command::SourceCurrent(0.001)),
            Err(DeviceError::Unsupported(_))
        ));
    }

    #[test]
    fn test_sweep_covers_endpoints_inclusive() {
        let (mut sim, clock) = simulator();
        for command in [
            Command::LinearVoltageSweep,
            Command::SweepPoints(11),
            Command::SweepStart(1.0),
            Command::SweepStop(0.0),
        ] {
            sim.write(&command).unwrap();
        }
        assert!((sim.query_step_size().unwrap() + 1.0 / 11.0).abs() < 1e-15);

        let readings = sim.query_sweep().unwrap();
        assert_eq!(readings.len(), 11);
        assert_eq!(readings[0].voltage, 1.0);
        assert_eq!(readings[10].voltage, 0.0);
        assert!((readings[5].voltage - 0.5).abs() < 1e-15);
        assert_eq!(clock.elapsed(), DEFAULT_LATENCY * 11);
        assert!(readings.windows(2).all(|w| w[1].timestamp > w[0].timestamp));
    }

    #[test]
    fn test_set_voltage_updates_current() {
        let (mut sim, _) = simulator();
        sim.write(&Command::SourceVoltage(0.5)).unwrap();
        let m = sim.query_scalar().unwrap();
        assert_eq!(m.voltage, 0.5);
        let expected = sim.model().current_at(0.5).unwrap();
        assert_eq!(m.current, expected);
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let (mut sim, _) = simulator();
        sim.close().unwrap();
        sim.close().unwrap();
        assert!(sim.is_closed());
        assert!(matches!(sim.query_scalar(), Err(DeviceError::Closed)));
    }
}
