//! Instrument setup and the initial open-circuit read and I-V sweep.

use tracing::{info, warn};

use crate::clock::Clock;
use crate::device::{Command, Quantity, SourceMeter};
use crate::error::{Phase, TrackerError};
use crate::measurement::{IvCurve, SweepSpec};

use super::{Session, Step, TrackerState};

/// Integration time for the open-circuit reading (power-line cycles).
const OPEN_CIRCUIT_NPLC: f64 = 10.0;
/// Integration time while sweeping and tracking (power-line cycles).
const TRACKING_NPLC: f64 = 0.5;
/// Relative difference between the reported and the nominal step that is
/// still treated as the same sweep.
const STEP_TOLERANCE: f64 = 0.01;

/// True when the instrument's step agrees with the configured sweep.
fn step_matches(reported: f64, nominal: f64) -> bool {
    (reported - nominal).abs() <= STEP_TOLERANCE * nominal
}

/// What the initial sweep established.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepOutcome {
    pub voc: f64,
    /// Current measured while forcing zero current.
    pub open_circuit_current: f64,
    pub isc: f64,
    pub dv: f64,
    pub vmpp: f64,
    pub pmpp: f64,
    /// Readings the sweep returned.
    pub points: usize,
}

/// Reset the instrument and select concurrent V/I readings with timestamps.
pub fn configure_instrument<D: SourceMeter, C: Clock>(session: &mut Session<D, C>) -> Step<()> {
    session.enter(Phase::Setup);
    let terminals = session.params().terminals;
    for command in [
        Command::Reset,
        Command::ClearTrace,
        Command::HighImpedanceOutputOff,
        Command::AutoZero(true),
        Command::ConcurrentSense,
        Command::ReadingElements,
        Command::Terminals(terminals),
    ] {
        session.write(command)?;
    }
    Ok(())
}

/// Measure Voc, sweep from Voc to 0 V and derive the starting state.
///
/// Every sweep point is emitted in acquisition order, with the budget checked
/// after each one.
pub fn initial_sweep<D: SourceMeter, C: Clock>(
    session: &mut Session<D, C>,
) -> Step<(TrackerState, SweepOutcome)> {
    session.enter(Phase::OpenCircuit);
    let compliance = session.config().open_circuit_compliance;
    for command in [
        Command::SourceFunction(Quantity::Current),
        Command::FixedMode(Quantity::Current),
        Command::SourceCurrentRangeMin,
        Command::SourceCurrent(0.0),
        Command::Compliance(Quantity::Voltage, compliance),
        Command::SenseRange(Quantity::Voltage, compliance),
        Command::IntegrationTime(OPEN_CIRCUIT_NPLC),
        Command::DisplayDigits(7),
        Command::Output(true),
    ] {
        session.write(command)?;
    }

    info!("Waiting to measure Voc...");
    session.sleep(session.config().settle_time());
    info!("Measuring Voc:");
    let open_circuit = session.read_origin()?;
    let voc = open_circuit.voltage;
    info!(voc, "Voc measured");
    session.write(Command::Output(false))?;
    session.record(true, &open_circuit)?;

    session.enter(Phase::Sweep);
    let spec = SweepSpec::from_open_circuit(voc, session.config());
    for command in [
        Command::SourceFunction(Quantity::Voltage),
        Command::LinearVoltageSweep,
        Command::SourceDelay(spec.step_delay),
        Command::TriggerCount(spec.point_count),
        Command::SweepPoints(spec.point_count),
        Command::SweepStart(spec.start_voltage),
        Command::SweepStop(spec.end_voltage),
    ] {
        session.write(command)?;
    }

    let dv = session.query_step_size()?.abs();
    if !dv.is_finite() || dv <= 0.0 {
        return Err(TrackerError::InvalidStep(dv).into());
    }
    let nominal = spec.nominal_step();
    if !step_matches(dv, nominal) {
        warn!(dv, nominal, "Instrument step differs from the configured sweep");
    }

    for command in [
        Command::SourceVoltageRange(spec.start_voltage),
        Command::SweepRangingBest,
        Command::Compliance(Quantity::Current, spec.max_current),
        Command::SenseRange(Quantity::Current, spec.max_current),
        Command::IntegrationTime(TRACKING_NPLC),
        Command::DisplayDigits(5),
        Command::SourceVoltage(spec.start_voltage),
        Command::Output(true),
    ] {
        session.write(command)?;
    }

    info!("Doing initial exploratory sweep...");
    let readings = session.read_sweep()?;
    info!("Exploratory sweep done!");
    for reading in &readings {
        session.record(true, reading)?;
    }

    let curve: IvCurve = readings.into_iter().collect();
    let best = *curve.max_power_point().ok_or(TrackerError::EmptySweep)?;
    let isc = curve.last().ok_or(TrackerError::EmptySweep)?.current;
    info!(
        "Initial Mpp found: {:.4} mW @ {:.4} V",
        best.power() * 1000.0,
        best.voltage
    );

    let outcome = SweepOutcome {
        voc,
        open_circuit_current: open_circuit.current,
        isc,
        dv,
        vmpp: best.voltage,
        pmpp: best.power(),
        points: curve.len(),
    };
    let state = TrackerState::new(voc, isc, dv, best.voltage);
    Ok((state, outcome))
}
