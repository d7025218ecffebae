//! Re-estimation of the maximum power point around the dwell voltage.
//!
//! Exploration measures how far the curve has bent away from the dwell point
//! with an angle metric: `atan((I/V) * (Voc/Isc))` in degrees is a bounded,
//! dimensionless slope that stays comparable as the curve drifts. One cycle:
//!
//! 1. start on the opposite side from the previous cycle's start,
//! 2. walk out until the angle deviates by `d_angle_max` (window edge),
//! 3. reverse and record readings across the window to the other edge,
//! 4. reverse again and record a second pass,
//! 5. average the two recorded maxima into the new Mpp,
//! 6. walk back to it.

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::AngleNormalization;
use crate::device::SourceMeter;
use crate::error::Phase;
use crate::measurement::{IvCurve, Measurement};

use super::homing;
use super::{Direction, Session, Step, TrackerState};

/// The exploration window never extends past this multiple of Voc.
const VOLTAGE_CEILING_FACTOR: f64 = 1.2;

/// One exploration cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub start_direction: Direction,
    /// Dwell voltage the cycle started from.
    pub pivot_voltage: f64,
    pub first_estimate: f64,
    pub second_estimate: f64,
    /// Fused estimate, the next dwell voltage.
    pub vmpp: f64,
    /// Readings taken during the cycle.
    pub steps: usize,
}

/// Normalized slope angle of a reading, in degrees.
pub fn angle_degrees(measurement: &Measurement, scale: f64) -> f64 {
    (measurement.current / measurement.voltage * scale)
        .atan()
        .to_degrees()
}

/// Combine the two pass estimates.
pub fn fuse_estimates(first: f64, second: f64) -> f64 {
    (first + second) / 2.0
}

/// `Voc/Isc'` for this cycle.
fn angle_scale(
    state: &mut TrackerState,
    pivot: &Measurement,
    normalization: AngleNormalization,
) -> f64 {
    let frozen = state.voc / state.isc;
    match normalization {
        AngleNormalization::Frozen => frozen,
        AngleNormalization::Rescaled => {
            let reference = *state.reference_current.get_or_insert(pivot.current);
            let isc = state.isc * pivot.current / reference;
            if isc.is_finite() && isc > 0.0 {
                state.voc / isc
            } else {
                warn!(isc, "Rescaled Isc unusable, keeping the initial normalization");
                frozen
            }
        }
    }
}

enum ScanStop {
    Edge,
    VoltageLimit,
}

/// Step in `state.scan_direction` until the angle leaves the window.
///
/// With `must_pass_pivot`, the edge only counts once the set voltage has gone
/// past the pivot, so a scan that starts on one edge crosses to the other.
/// Every reading is pushed to `curve` when one is given.
fn scan<D: SourceMeter, C: Clock>(
    session: &mut Session<D, C>,
    state: &mut TrackerState,
    pivot_voltage: f64,
    must_pass_pivot: bool,
    mut curve: Option<&mut IvCurve>,
    steps: &mut usize,
) -> Step<(Measurement, ScanStop)> {
    let d_angle_max = session.config().d_angle_max;
    let ceiling = state.voc * VOLTAGE_CEILING_FACTOR;
    loop {
        let voltage = state.set_voltage + state.dv * state.scan_direction.sign();
        session.set_voltage(voltage)?;
        state.set_voltage = voltage;
        let measurement = session.measure(true)?;
        *steps += 1;
        if let Some(curve) = curve.as_deref_mut() {
            curve.push(measurement);
        }

        if voltage <= 0.0 || voltage >= ceiling {
            return Ok((measurement, ScanStop::VoltageLimit));
        }
        let d_angle = angle_degrees(&measurement, state.angle_scale) - state.angle_mpp;
        let past_pivot = !must_pass_pivot || state.scan_direction.is_past(voltage, pivot_voltage);
        if past_pivot && (!d_angle.is_finite() || d_angle.abs() >= d_angle_max) {
            return Ok((measurement, ScanStop::Edge));
        }
    }
}

fn log_stop(direction: Direction, stop: ScanStop) {
    let limit = match direction {
        Direction::Up => "Upper",
        Direction::Down => "Lower",
    };
    match stop {
        ScanStop::Edge => info!("{limit} exploration voltage limit reached."),
        ScanStop::VoltageLimit => warn!("{limit} exploration stopped at the source voltage limit."),
    }
}

/// One recorded pass across the window, seeded with the reading it starts from.
fn recorded_pass<D: SourceMeter, C: Clock>(
    session: &mut Session<D, C>,
    state: &mut TrackerState,
    pivot_voltage: f64,
    seed: Measurement,
    steps: &mut usize,
) -> Step<(f64, Measurement)> {
    state.scan_direction = state.scan_direction.flip();
    info!(
        "Scanning walking {} in voltage...",
        state.scan_direction.label()
    );
    let mut curve = IvCurve::new();
    curve.push(seed);
    let (last, stop) = scan(session, state, pivot_voltage, true, Some(&mut curve), steps)?;
    log_stop(state.scan_direction, stop);

    // the seed guarantees a point; it is only absent if every power is NaN
    let estimate = curve
        .max_power_point()
        .map(|m| m.voltage)
        .unwrap_or(pivot_voltage);
    info!(
        "Voltage for Mpp in {} scan found at {:.4e} V",
        if state.scan_direction == Direction::Up { "forward" } else { "reverse" },
        estimate
    );
    Ok((estimate, last))
}

/// Run one exploration cycle from the dwell-ending reading `pivot`.
pub fn explore<D: SourceMeter, C: Clock>(
    session: &mut Session<D, C>,
    mut state: TrackerState,
    pivot: Measurement,
) -> Step<(TrackerState, CycleReport)> {
    session.enter(Phase::Exploration);
    info!("Exploring for new Mpp...");

    let normalization = session.config().normalization;
    state.angle_scale = angle_scale(&mut state, &pivot, normalization);
    state.angle_mpp = angle_degrees(&pivot, state.angle_scale);
    let pivot_voltage = state.vmpp;
    state.set_voltage = pivot_voltage;
    debug!(
        angle_mpp = state.angle_mpp,
        angle_scale = state.angle_scale,
        "Exploration reference"
    );

    let start_direction = state.previous_scan_start_direction.flip();
    state.previous_scan_start_direction = start_direction;
    state.scan_direction = start_direction;
    let mut steps = 0;

    info!(
        "Walking {} in voltage for starting scan...",
        start_direction.label()
    );
    let (edge, stop) = scan(session, &mut state, pivot_voltage, false, None, &mut steps)?;
    log_stop(state.scan_direction, stop);

    let (first_estimate, last) =
        recorded_pass(session, &mut state, pivot_voltage, edge, &mut steps)?;
    let (second_estimate, _) =
        recorded_pass(session, &mut state, pivot_voltage, last, &mut steps)?;

    let vmpp = fuse_estimates(first_estimate, second_estimate);
    info!("New Mpp found at {:.4e} V:", vmpp);
    state.vmpp = vmpp;

    state.scan_direction = state.scan_direction.flip();
    info!("Walking back to Mpp...");
    let start = state.set_voltage + state.dv * state.scan_direction.sign();
    let (state, walked) = homing::walk_to(session, state, start, vmpp, true)?;
    steps += walked;
    info!("Mpp reached.");

    let report = CycleReport {
        start_direction,
        pivot_voltage,
        first_estimate,
        second_estimate,
        vmpp,
        steps,
    };
    Ok((state, report))
}
