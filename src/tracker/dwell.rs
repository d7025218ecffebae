//! Hold the source at Mpp and stream readings.

use tracing::info;

use crate::clock::Clock;
use crate::device::SourceMeter;
use crate::error::Phase;
use crate::measurement::Measurement;

use super::{Session, Step, TrackerState};

/// Sample at the current set voltage until the dwell time has elapsed.
///
/// Takes at least one reading. Returns the last one, which becomes the pivot
/// of the following exploration.
pub fn dwell<D: SourceMeter, C: Clock>(
    session: &mut Session<D, C>,
    state: TrackerState,
) -> Step<(TrackerState, Measurement)> {
    session.enter(Phase::Dwell);
    let duration = session.params().dwell;
    info!("Dwelling @ Mpp for {:?}...", duration);

    let started = session.now();
    let last = loop {
        let measurement = session.measure(false)?;
        if session.now().saturating_sub(started) >= duration {
            break measurement;
        }
    };

    info!(
        "Stabilized power at Mpp: {:.4} mW @ {:.4} V",
        last.power() * 1000.0,
        last.voltage
    );
    Ok((state, last))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{RunParameters, TrackerConfig};
    use crate::output::DataStream;
    use crate::tracker::Interrupt;
    use crate::tracker::testing::{FakeMeter, LATENCY};

    fn dwell_session(
        dwell_seconds: f64,
        total_seconds: f64,
    ) -> Session<FakeMeter, ManualClock> {
        let clock = ManualClock::new();
        let params = RunParameters::new(dwell_seconds, total_seconds, false, false).unwrap();
        Session::new(
            FakeMeter::new(clock.clone()),
            clock,
            DataStream::new(),
            params,
            TrackerConfig::default(),
        )
    }

    #[test]
    fn test_dwell_samples_for_the_configured_time() {
        let mut session = dwell_session(1.0, 0.0);
        let state = TrackerState::new(0.6, 0.005, 0.001, 0.3);
        let started = session.now();
        let (_, last) = dwell(&mut session, state).unwrap();

        assert_eq!(session.now() - started, Duration::from_secs(1));
        assert_eq!(session.measurements, 100);
        assert!((last.timestamp - 1.0).abs() < 1e-9);
        // dwell never moves the source
        assert!(session.device().written.is_empty());
    }

    #[test]
    fn test_zero_dwell_still_takes_one_reading() {
        let mut session = dwell_session(0.0, 0.0);
        let state = TrackerState::new(0.6, 0.005, 0.001, 0.3);
        dwell(&mut session, state).unwrap();
        assert_eq!(session.measurements, 1);
        assert_eq!(session.now(), LATENCY);
    }

    #[test]
    fn test_dwell_honours_total_budget() {
        let mut session = dwell_session(60.0, 0.5);
        let state = TrackerState::new(0.6, 0.005, 0.001, 0.3);
        match dwell(&mut session, state) {
            Err(Interrupt::BudgetExhausted { elapsed }) => {
                assert!(elapsed > 0.5 && elapsed <= 0.5 + LATENCY.as_secs_f64() + 1e-9);
            }
            other => panic!("expected budget interrupt, got {other:?}"),
        }
    }
}
