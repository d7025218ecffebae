//! Tracker error types.

use std::fmt;

use thiserror::Error;

use crate::device::DeviceError;

/// The stage of a run an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    OpenCircuit,
    Sweep,
    Homing,
    Dwell,
    Exploration,
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Setup => "instrument setup",
            Phase::OpenCircuit => "open-circuit measurement",
            Phase::Sweep => "initial sweep",
            Phase::Homing => "walk to Mpp",
            Phase::Dwell => "dwell",
            Phase::Exploration => "exploration",
            Phase::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

/// Errors that stop a tracking run.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The sourcemeter failed to execute a command or query.
    #[error("device error during {phase}: {source}")]
    Device {
        phase: Phase,
        #[source]
        source: DeviceError,
    },

    /// A reading carried a status word matching the fault mask.
    #[error("device reported fault status {status:#06x} during {phase} at {voltage:.4} V")]
    DeviceFault {
        phase: Phase,
        status: u32,
        voltage: f64,
    },

    /// The initial sweep produced no readings.
    #[error("initial sweep returned no points")]
    EmptySweep,

    /// The sourcemeter resolved the sweep to a step that cannot be walked.
    #[error("sourcemeter reported an unusable sweep step of {0} V")]
    InvalidStep(f64),

    /// Writing to a data sink failed.
    #[error("failed to write data stream: {0}")]
    Output(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TrackerError>;
