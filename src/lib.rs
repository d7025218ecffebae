//! Maximum power point tracking for photovoltaic devices on a source-measure unit.
//!
//! The tracker drives a [`SourceMeter`] through an initial open-circuit read and
//! I-V sweep, walks to the maximum power point, then alternates between dwelling
//! at that point and re-exploring the curve until the run's time budget is spent.
//! Every measurement is streamed as a CSV line to the configured [`DataStream`].
//!
//! The device is either real hardware (the `keithley` feature, over VISA) or a
//! [`SimulatedSourceMeter`] backed by the single-diode [`DiodeModel`].

pub mod clock;
pub mod config;
pub mod device;
pub mod diode;
pub mod error;
#[cfg(feature = "keithley")]
pub mod keithley;
pub mod measurement;
pub mod output;
pub mod simulator;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AngleNormalization, RunParameters, StatusPolicy, TimeBudget, TrackerConfig};
pub use device::{Command, DeviceError, SourceMeter};
pub use diode::{DiodeError, DiodeModel, DiodeParameters};
pub use error::{Phase, TrackerError};
pub use measurement::{IvCurve, Measurement, Polarity, SweepSpec};
pub use output::DataStream;
pub use simulator::SimulatedSourceMeter;
pub use tracker::{run, CycleReport, Direction, RunSummary, Session, TrackerState};
