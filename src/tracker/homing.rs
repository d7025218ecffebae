//! Fixed-step walk of the source voltage to a target.

use tracing::debug;

use crate::clock::Clock;
use crate::device::SourceMeter;

use super::{Direction, Session, Step, TrackerState};

/// Slack on `distance / dv` so that float noise on an exact multiple of the
/// step does not add a step.
const STEP_SLACK: f64 = 1e-9;

/// Steps needed to come within one `dv` of the target: `ceil(|target - start| / dv)`.
pub fn step_count(start: f64, target: f64, dv: f64) -> usize {
    let ratio = (target - start).abs() / dv;
    let nearest = ratio.round();
    if (ratio - nearest).abs() <= STEP_SLACK * nearest.max(1.0) {
        nearest as usize
    } else {
        ratio.ceil() as usize
    }
}

/// Walk from `start` to `target` in steps of `state.dv`.
///
/// Sets `start + k * dv` towards the target for `k` in `0..step_count`,
/// reading and emitting after each, then sets exactly `target`. Returns the
/// state with `set_voltage == target` and the number of steps taken.
pub fn walk_to<D: SourceMeter, C: Clock>(
    session: &mut Session<D, C>,
    mut state: TrackerState,
    start: f64,
    target: f64,
    exploring: bool,
) -> Step<(TrackerState, usize)> {
    let direction = Direction::towards(start, target);
    let steps = step_count(start, target, state.dv);
    debug!(start, target, steps, direction = direction.label(), "Homing");

    for k in 0..steps {
        let voltage = start + k as f64 * state.dv * direction.sign();
        session.set_voltage(voltage)?;
        state.set_voltage = voltage;
        session.measure(exploring)?;
    }

    session.set_voltage(target)?;
    state.set_voltage = target;
    Ok((state, steps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Interrupt;
    use crate::tracker::testing::session;
    use proptest::prelude::*;

    #[test]
    fn test_step_count_is_ceiling_of_distance() {
        assert_eq!(step_count(0.0, 0.5, 0.001), 500);
        assert_eq!(step_count(0.0, 0.5005, 0.001), 501);
        assert_eq!(step_count(0.7, 0.2, 0.1), 5);
        assert_eq!(step_count(0.3, 0.3, 0.001), 0);
    }

    #[test]
    fn test_walk_up_ends_exactly_on_target() {
        let (mut session, _) = session(0.0);
        let state = TrackerState::new(0.6, 0.005, 0.001, 0.4567);
        let (state, steps) = walk_to(&mut session, state, 0.0, 0.4567, true).unwrap();

        assert_eq!(steps, 457);
        assert_eq!(state.set_voltage, 0.4567);
        let written = &session.device().written;
        assert_eq!(written.len(), steps + 1);
        assert_eq!(written[0], 0.0);
        assert_eq!(*written.last().unwrap(), 0.4567);
        let last_step = written[written.len() - 2];
        assert!(0.4567 - last_step <= 0.001 && last_step < 0.4567);
        assert_eq!(session.measurements, steps);
    }

    #[test]
    fn test_walk_down() {
        let (mut session, _) = session(0.0);
        let state = TrackerState::new(0.6, 0.005, 0.01, 0.2);
        let (state, steps) = walk_to(&mut session, state, 0.55, 0.2, true).unwrap();
        assert_eq!(steps, 35);
        assert_eq!(state.set_voltage, 0.2);
        let written = &session.device().written;
        assert!(written.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_walk_stops_when_budget_runs_out() {
        let (mut session, _) = session(0.1);
        let state = TrackerState::new(0.6, 0.005, 0.001, 0.5);
        let result = walk_to(&mut session, state, 0.0, 0.5, true);
        assert!(matches!(result, Err(Interrupt::BudgetExhausted { .. })));
        // ten readings fit in 0.1 s, the eleventh crosses the budget
        assert_eq!(session.measurements, 11);
    }

    proptest! {
        #[test]
        fn prop_walk_takes_ceiling_steps_and_lands_on_target(
            start in 0.0f64..1.0,
            target in 0.0f64..1.0,
            dv in 0.0005f64..0.05,
        ) {
            let (mut session, _) = session(0.0);
            let state = TrackerState::new(1.0, 0.01, dv, target);
            let (state, steps) = walk_to(&mut session, state, start, target, false).unwrap();

            let expected = ((target - start).abs() / dv).ceil() as usize;
            prop_assert!(steps == expected || steps + 1 == expected);
            prop_assert_eq!(state.set_voltage, target);
            if steps > 0 {
                let written = &session.device().written;
                let last_step = written[written.len() - 2];
                prop_assert!((target - last_step).abs() <= dv * (1.0 + 1e-9));
            }
        }
    }
}
