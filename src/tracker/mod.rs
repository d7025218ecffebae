//! The maximum power point tracker.
//!
//! A run is a fixed sequence: instrument setup, the initial sweep, a walk to
//! the sweep's Mpp, then dwell and exploration cycles until the time budget
//! is exhausted. Phases take the [`TrackerState`] by value and hand back the
//! updated state. The budget is checked after every emitted reading; when it
//! runs out an [`Interrupt`] propagates through `?` to [`run`], which performs
//! the single teardown.

pub mod dwell;
pub mod explore;
pub mod homing;
pub mod sweep;

use std::convert::Infallible;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{RunParameters, StatusPolicy, TrackerConfig};
use crate::device::{Command, DeviceError, Quantity, SourceMeter};
use crate::error::{Phase, TrackerError};
use crate::measurement::Measurement;
use crate::output::DataStream;

pub use explore::CycleReport;
pub use sweep::SweepOutcome;

/// Why a phase stopped early.
#[derive(Debug)]
pub enum Interrupt {
    /// The run's time budget is spent; this is a normal end of run.
    BudgetExhausted { elapsed: f64 },
    Failed(TrackerError),
}

impl From<TrackerError> for Interrupt {
    fn from(err: TrackerError) -> Self {
        Interrupt::Failed(err)
    }
}

impl From<std::io::Error> for Interrupt {
    fn from(err: std::io::Error) -> Self {
        Interrupt::Failed(TrackerError::Output(err))
    }
}

pub type Step<T> = std::result::Result<T, Interrupt>;

/// Scan direction along the voltage axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }

    pub fn sign(self) -> f64 {
        match self {
            Direction::Up => 1.0,
            Direction::Down => -1.0,
        }
    }

    /// Direction that moves `from` towards `to`.
    pub fn towards(from: f64, to: f64) -> Self {
        if to >= from {
            Direction::Up
        } else {
            Direction::Down
        }
    }

    /// Whether `voltage` lies strictly past `pivot` when moving this way.
    pub fn is_past(self, voltage: f64, pivot: f64) -> bool {
        match self {
            Direction::Up => voltage > pivot,
            Direction::Down => voltage < pivot,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

/// Operating state carried from phase to phase.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerState {
    /// Where to dwell next.
    pub vmpp: f64,
    /// Open-circuit voltage from the initial sweep.
    pub voc: f64,
    /// Short-circuit current from the initial sweep.
    pub isc: f64,
    /// Voltage step magnitude, always positive.
    pub dv: f64,
    /// Voltage last written to the source.
    pub set_voltage: f64,
    pub scan_direction: Direction,
    pub previous_scan_start_direction: Direction,
    /// Angle of the dwell-ending reading, the zero of `dAngle`.
    pub angle_mpp: f64,
    /// `Voc/Isc` normalization used by the angle metric this cycle.
    pub angle_scale: f64,
    /// Dwell-ending current of the first cycle, for rescaled normalization.
    pub reference_current: Option<f64>,
}

impl TrackerState {
    pub fn new(voc: f64, isc: f64, dv: f64, vmpp: f64) -> Self {
        Self {
            vmpp,
            voc,
            isc,
            dv,
            set_voltage: 0.0,
            scan_direction: Direction::Up,
            // the first exploration starts upwards
            previous_scan_start_direction: Direction::Down,
            angle_mpp: 0.0,
            angle_scale: voc / isc,
            reference_current: None,
        }
    }
}

/// What a finished run did.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub initial: Option<SweepOutcome>,
    pub cycles: Vec<CycleReport>,
    /// Latest Mpp estimate.
    pub vmpp: Option<f64>,
    /// Readings written to the data stream.
    pub measurements: usize,
    /// Timestamp of the last reading written.
    pub last_timestamp: Option<f64>,
}

/// Exclusive owner of the device, clock and data stream for one run.
pub struct Session<D: SourceMeter, C: Clock> {
    device: D,
    clock: C,
    stream: DataStream,
    params: RunParameters,
    config: TrackerConfig,
    phase: Phase,
    origin: Option<f64>,
    measurements: usize,
    last_timestamp: Option<f64>,
}

impl<D: SourceMeter, C: Clock> Session<D, C> {
    pub fn new(
        device: D,
        clock: C,
        stream: DataStream,
        params: RunParameters,
        config: TrackerConfig,
    ) -> Self {
        Self {
            device,
            clock,
            stream,
            params,
            config,
            phase: Phase::Setup,
            origin: None,
            measurements: 0,
            last_timestamp: None,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn params(&self) -> &RunParameters {
        &self.params
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn enter(&mut self, phase: Phase) {
        debug!(%phase, "Entering phase");
        self.phase = phase;
    }

    /// Time on the session clock.
    pub(crate) fn now(&self) -> Duration {
        self.clock.elapsed()
    }

    pub(crate) fn sleep(&self, duration: Duration) {
        self.clock.sleep(duration);
    }

    fn device_error(&self, source: DeviceError) -> TrackerError {
        TrackerError::Device {
            phase: self.phase,
            source,
        }
    }

    pub(crate) fn write(&mut self, command: Command) -> Step<()> {
        debug!(%command, "write");
        self.device
            .write(&command)
            .map_err(|e| self.device_error(e))?;
        Ok(())
    }

    pub(crate) fn set_voltage(&mut self, voltage: f64) -> Step<()> {
        self.write(Command::SourceVoltage(voltage))
    }

    pub(crate) fn query_step_size(&mut self) -> Step<f64> {
        let step = self
            .device
            .query_step_size()
            .map_err(|e| self.device_error(e))?;
        Ok(step)
    }

    /// Polarity-corrected reading relative to the run origin.
    fn correct(&self, raw: Measurement) -> Measurement {
        let corrected = raw.with_polarity(self.params.polarity);
        match self.origin {
            Some(origin) => corrected.relative_to(origin),
            None => corrected,
        }
    }

    /// Take the reading that defines the run origin; its timestamp becomes 0.
    pub(crate) fn read_origin(&mut self) -> Step<Measurement> {
        let raw = self
            .device
            .query_scalar()
            .map_err(|e| self.device_error(e))?;
        self.origin = Some(raw.timestamp);
        Ok(self.correct(raw))
    }

    /// Read without emitting.
    pub(crate) fn read(&mut self) -> Step<Measurement> {
        let raw = self
            .device
            .query_scalar()
            .map_err(|e| self.device_error(e))?;
        Ok(self.correct(raw))
    }

    /// Run the configured sweep without emitting.
    pub(crate) fn read_sweep(&mut self) -> Step<Vec<Measurement>> {
        let raw = self
            .device
            .query_sweep()
            .map_err(|e| self.device_error(e))?;
        Ok(raw.into_iter().map(|m| self.correct(m)).collect())
    }

    /// Emit a reading, then apply the status policy and the time budget.
    pub(crate) fn record(&mut self, exploring: bool, measurement: &Measurement) -> Step<()> {
        self.stream.record(exploring, measurement)?;
        self.measurements += 1;
        self.last_timestamp = Some(measurement.timestamp);
        self.check_status(measurement)?;
        if self.params.budget.is_exhausted(measurement.timestamp) {
            return Err(Interrupt::BudgetExhausted {
                elapsed: measurement.timestamp,
            });
        }
        Ok(())
    }

    /// Read, emit and check.
    pub(crate) fn measure(&mut self, exploring: bool) -> Step<Measurement> {
        let measurement = self.read()?;
        self.record(exploring, &measurement)?;
        Ok(measurement)
    }

    fn check_status(&self, measurement: &Measurement) -> Step<()> {
        let fault = measurement.status & self.config.fault_mask;
        if fault == 0 {
            return Ok(());
        }
        match self.config.status_policy {
            StatusPolicy::Ignore => Ok(()),
            StatusPolicy::Log => {
                warn!(
                    phase = %self.phase,
                    status = format!("{:#06x}", measurement.status),
                    voltage = measurement.voltage,
                    "Device reported a fault status"
                );
                Ok(())
            }
            StatusPolicy::Abort => Err(Interrupt::Failed(TrackerError::DeviceFault {
                phase: self.phase,
                status: measurement.status,
                voltage: measurement.voltage,
            })),
        }
    }

    /// Reset the instrument, close the session and flush every sink.
    ///
    /// All three steps are attempted; the first failure is returned.
    pub(crate) fn teardown(&mut self) -> crate::error::Result<()> {
        self.enter(Phase::Teardown);
        let reset = self
            .device
            .write(&Command::Reset)
            .map_err(|e| self.device_error(e));
        let close = self.device.close().map_err(|e| self.device_error(e));
        let flush = self.stream.flush().map_err(TrackerError::from);
        reset.and(close).and(flush)
    }
}

/// Track the maximum power point until the time budget is exhausted.
///
/// Returns `Ok` when the budget ends the run. Any device or output failure is
/// returned after the instrument has been reset and closed.
pub fn run<D: SourceMeter, C: Clock>(
    session: &mut Session<D, C>,
) -> crate::error::Result<RunSummary> {
    info!(
        "mppTracking {} with {:?} dwell intervals.",
        session.params.budget, session.params.dwell
    );

    let mut summary = RunSummary::default();
    let outcome = drive(session, &mut summary);
    let teardown = session.teardown();
    summary.measurements = session.measurements;
    summary.last_timestamp = session.last_timestamp;

    match outcome {
        Ok(never) => match never {},
        Err(Interrupt::BudgetExhausted { elapsed }) => {
            teardown?;
            info!(elapsed, "Finished with no errors.");
            Ok(summary)
        }
        Err(Interrupt::Failed(err)) => {
            if let Err(teardown_err) = teardown {
                warn!(error = %teardown_err, "Teardown after failure also failed");
            }
            Err(err)
        }
    }
}

fn drive<D: SourceMeter, C: Clock>(
    session: &mut Session<D, C>,
    summary: &mut RunSummary,
) -> Step<Infallible> {
    session.stream.write_header()?;
    sweep::configure_instrument(session)?;

    let (state, outcome) = sweep::initial_sweep(session)?;
    let vmpp = outcome.vmpp;
    summary.initial = Some(outcome);
    summary.vmpp = Some(vmpp);

    info!("Walking back to Mpp...");
    session.enter(Phase::Homing);
    session.write(Command::FixedMode(Quantity::Voltage))?;
    session.write(Command::TriggerCount(1))?;
    let (mut state, _) = homing::walk_to(session, state, 0.0, vmpp, true)?;
    info!("Mpp reached.");

    loop {
        let (dwelled, pivot) = dwell::dwell(session, state)?;
        let (explored, report) = explore::explore(session, dwelled, pivot)?;
        summary.vmpp = Some(explored.vmpp);
        summary.cycles.push(report);
        state = explored;
    }
}
