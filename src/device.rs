//! The sourcemeter capability the tracker drives.
//!
//! Commands are typed; [`Command`]'s `Display` renders the Keithley 2400 SCPI
//! text so a hardware adapter can send it verbatim, while the simulator
//! matches on the variants it models.

use std::fmt;

use thiserror::Error;

use crate::diode::DiodeError;
use crate::measurement::Measurement;

/// Errors raised by a sourcemeter implementation.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[cfg(feature = "keithley")]
    #[error("VISA error: {0}")]
    Visa(#[from] visa_rs::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed reply to {query}: {reply:?}")]
    Malformed { query: &'static str, reply: String },

    #[error("unsupported by this device: {0}")]
    Unsupported(String),

    #[error("session already closed")]
    Closed,

    #[error("device model error: {0}")]
    Model(#[from] DiodeError),
}

/// A measured or sourced quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Voltage,
    Current,
}

impl Quantity {
    fn scpi(self) -> &'static str {
        match self {
            Quantity::Voltage => "voltage",
            Quantity::Current => "current",
        }
    }
}

/// Which set of output terminals is routed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Terminals {
    #[default]
    Front,
    Rear,
}

impl Terminals {
    pub fn from_rear(rear: bool) -> Self {
        if rear {
            Terminals::Rear
        } else {
            Terminals::Front
        }
    }
}

/// Configuration and actuation commands.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Reset,
    ClearTrace,
    HighImpedanceOutputOff,
    AutoZero(bool),
    /// Measure voltage and current on every reading.
    ConcurrentSense,
    /// Readings report time, voltage, current and status.
    ReadingElements,
    Terminals(Terminals),
    SourceFunction(Quantity),
    FixedMode(Quantity),
    LinearVoltageSweep,
    SourceCurrentRangeMin,
    SourceCurrent(f64),
    SourceVoltage(f64),
    SourceVoltageRange(f64),
    SourceDelay(f64),
    TriggerCount(usize),
    SweepPoints(usize),
    SweepStart(f64),
    SweepStop(f64),
    SweepRangingBest,
    Compliance(Quantity, f64),
    SenseRange(Quantity, f64),
    /// Integration time in power-line cycles, for both voltage and current.
    IntegrationTime(f64),
    DisplayDigits(u8),
    Output(bool),
}

fn on_off(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Reset => write!(f, "*RST"),
            Command::ClearTrace => write!(f, ":trace:clear"),
            Command::HighImpedanceOutputOff => write!(f, ":output:smode himpedance"),
            Command::AutoZero(on) => write!(f, ":system:azero {}", on_off(*on)),
            Command::ConcurrentSense => write!(
                f,
                ":sense:function:concurrent on;:sense:function \"current:dc\", \"voltage:dc\""
            ),
            Command::ReadingElements => write!(f, ":format:elements time,voltage,current,status"),
            Command::Terminals(Terminals::Front) => write!(f, ":rout:term front"),
            Command::Terminals(Terminals::Rear) => write!(f, ":rout:term rear"),
            Command::SourceFunction(q) => write!(f, ":source:function {}", q.scpi()),
            Command::FixedMode(q) => write!(f, ":source:{}:mode fixed", q.scpi()),
            Command::LinearVoltageSweep => {
                write!(f, ":source:voltage:mode sweep;:source:sweep:spacing linear")
            }
            Command::SourceCurrentRangeMin => write!(f, ":source:current:range min"),
            Command::SourceCurrent(amps) => write!(f, ":source:current {amps:.6}"),
            Command::SourceVoltage(volts) => write!(f, ":source:voltage {volts:.4}"),
            Command::SourceVoltageRange(volts) => write!(f, ":source:voltage:range {volts:.4}"),
            Command::SourceDelay(seconds) => write!(f, ":source:delay {seconds:.3}"),
            Command::TriggerCount(count) => write!(f, ":trigger:count {count}"),
            Command::SweepPoints(count) => write!(f, ":source:sweep:points {count}"),
            Command::SweepStart(volts) => write!(f, ":source:voltage:start {volts:.4}"),
            Command::SweepStop(volts) => write!(f, ":source:voltage:stop {volts:.4}"),
            Command::SweepRangingBest => write!(f, ":source:sweep:ranging best"),
            Command::Compliance(q, limit) => write!(f, ":sense:{}:protection {limit:.6}", q.scpi()),
            Command::SenseRange(q, range) => write!(f, ":sense:{}:range {range:.6}", q.scpi()),
            Command::IntegrationTime(nplc) => write!(
                f,
                ":sense:voltage:nplcycles {nplc};:sense:current:nplcycles {nplc}"
            ),
            Command::DisplayDigits(digits) => write!(f, ":display:digits {digits}"),
            Command::Output(on) => write!(f, ":output {}", on_off(*on)),
        }
    }
}

/// A source-measure unit that can be configured, read and swept.
///
/// Implemented by the VISA-backed Keithley adapter and by the diode-model
/// simulator; the tracker does not know which one it drives.
pub trait SourceMeter {
    /// Fire-and-forget configuration or actuation.
    fn write(&mut self, command: &Command) -> Result<(), DeviceError>;

    /// One blocking reading.
    fn query_scalar(&mut self) -> Result<Measurement, DeviceError>;

    /// One blocking acquisition of the configured sweep.
    fn query_sweep(&mut self) -> Result<Vec<Measurement>, DeviceError>;

    /// Voltage increment resolved for the configured sweep.
    fn query_step_size(&mut self) -> Result<f64, DeviceError>;

    /// Release the session. Calling it again, or after a failure, is harmless.
    fn close(&mut self) -> Result<(), DeviceError>;
}

impl<T: SourceMeter + ?Sized> SourceMeter for Box<T> {
    fn write(&mut self, command: &Command) -> Result<(), DeviceError> {
        (**self).write(command)
    }

    fn query_scalar(&mut self) -> Result<Measurement, DeviceError> {
        (**self).query_scalar()
    }

    fn query_sweep(&mut self) -> Result<Vec<Measurement>, DeviceError> {
        (**self).query_sweep()
    }

    fn query_step_size(&mut self) -> Result<f64, DeviceError> {
        (**self).query_step_size()
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        (**self).close()
    }
}

/// Parse an ASCII `READ?` reply of `voltage,current,time,status` groups.
pub fn parse_readings(query: &'static str, reply: &str) -> Result<Vec<Measurement>, DeviceError> {
    let malformed = || DeviceError::Malformed {
        query,
        reply: reply.trim().to_string(),
    };

    let values = reply
        .trim()
        .split(',')
        .map(|field| field.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| malformed())?;
    if values.is_empty() || values.len() % 4 != 0 {
        return Err(malformed());
    }

    Ok(values
        .chunks_exact(4)
        .map(|chunk| Measurement::new(chunk[0], chunk[1], chunk[2], chunk[3] as u32))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_scpi_text() {
        assert_eq!(Command::SourceVoltage(0.5).to_string(), ":source:voltage 0.5000");
        assert_eq!(Command::SourceCurrent(0.0).to_string(), ":source:current 0.000000");
        assert_eq!(
            Command::Compliance(Quantity::Current, 0.01).to_string(),
            ":sense:current:protection 0.010000"
        );
        assert_eq!(
            Command::FixedMode(Quantity::Voltage).to_string(),
            ":source:voltage:mode fixed"
        );
        assert_eq!(Command::Terminals(Terminals::Rear).to_string(), ":rout:term rear");
        assert_eq!(Command::Output(false).to_string(), ":output off");
        assert_eq!(
            Command::IntegrationTime(0.5).to_string(),
            ":sense:voltage:nplcycles 0.5;:sense:current:nplcycles 0.5"
        );
    }

    #[test]
    fn test_parse_single_reading() {
        let readings =
            parse_readings("READ?", "+6.201E-01,-1.0E-09,+1.234567E+01,+1.4336E+04\n").unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].voltage, 0.6201);
        assert_eq!(readings[0].current, -1.0e-9);
        assert_eq!(readings[0].timestamp, 12.34567);
        assert_eq!(readings[0].status, 14336);
    }

    #[test]
    fn test_parse_sweep_reply() {
        let readings = parse_readings("READ?", "0.6,0.0,1.0,0,0.3,0.006,1.1,0").unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[1].voltage, 0.3);
    }

    #[test]
    fn test_parse_rejects_partial_group() {
        let err = parse_readings("READ?", "0.6,0.0,1.0").unwrap_err();
        assert!(matches!(err, DeviceError::Malformed { query: "READ?", .. }));
        assert!(parse_readings("READ?", "").is_err());
        assert!(parse_readings("READ?", "a,b,c,d").is_err());
    }
}
