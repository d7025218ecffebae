//! Keithley 2400 series sourcemeter over VISA.

use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

use tracing::{debug, info};
use visa_rs::prelude::*;

use crate::device::{Command, DeviceError, SourceMeter, parse_readings};
use crate::measurement::Measurement;

/// Timeout for opening the session.
const OPEN_TIMEOUT: Duration = Duration::from_secs(1);
/// I/O timeout; a full 1001-point sweep must fit inside it.
const IO_TIMEOUT_MS: u32 = 50_000;

pub fn io_to_vs_err(err: std::io::Error) -> visa_rs::Error {
    visa_rs::io_to_vs_err(err)
}

/// An open VISA session to the sourcemeter.
pub struct KeithleySourceMeter {
    // dropped before the resource manager that owns the session
    instr: Option<Instrument>,
    _rm: DefaultRM,
}

impl KeithleySourceMeter {
    /// Open the resource, e.g. `GPIB0::24::INSTR` or `ASRL/dev/ttyUSB0::INSTR`.
    pub fn open(address: &str) -> Result<Self, DeviceError> {
        info!("Connecting to {address} ...");
        let rm = DefaultRM::new()?;
        let resource = CString::new(address).map_err(|_| DeviceError::Malformed {
            query: "resource name",
            reply: address.to_string(),
        })?;
        let instr = rm.open(&resource.into(), AccessMode::NO_LOCK, OPEN_TIMEOUT)?;
        instr.set_attr(
            visa_rs::attribute::AttrTmoValue::new_checked(IO_TIMEOUT_MS)
                .ok_or(DeviceError::Unsupported("VISA I/O timeout".to_string()))?,
        )?;
        info!("Connection established.");
        Ok(Self {
            instr: Some(instr),
            _rm: rm,
        })
    }

    /// Clear errors and ask the instrument to identify itself.
    pub fn identify(&mut self) -> Result<String, DeviceError> {
        info!("Querying device type...");
        self.send("*CLS")?;
        let identity = self.query("*IDN?")?;
        info!("Sourcemeter found: {}", identity.trim());
        Ok(identity.trim().to_string())
    }

    fn instrument(&mut self) -> Result<&mut Instrument, DeviceError> {
        self.instr.as_mut().ok_or(DeviceError::Closed)
    }

    fn send(&mut self, text: &str) -> Result<(), DeviceError> {
        debug!(text, "send");
        let instr = self.instrument()?;
        instr
            .write_all(format!("{text}\n").as_bytes())
            .map_err(io_to_vs_err)?;
        Ok(())
    }

    fn query(&mut self, text: &str) -> Result<String, DeviceError> {
        self.send(text)?;
        let instr = self.instrument()?;
        let mut response = String::new();
        {
            // scope the reader so the instrument is free again afterwards
            let mut reader = BufReader::new(&*instr);
            reader.read_line(&mut response).map_err(io_to_vs_err)?;
        }
        Ok(response)
    }
}

impl SourceMeter for KeithleySourceMeter {
    fn write(&mut self, command: &Command) -> Result<(), DeviceError> {
        self.send(&command.to_string())
    }

    fn query_scalar(&mut self) -> Result<Measurement, DeviceError> {
        let reply = self.query("READ?")?;
        parse_readings("READ?", &reply)?
            .into_iter()
            .next()
            .ok_or(DeviceError::Malformed {
                query: "READ?",
                reply,
            })
    }

    fn query_sweep(&mut self) -> Result<Vec<Measurement>, DeviceError> {
        let reply = self.query("READ?")?;
        parse_readings("READ?", &reply)
    }

    fn query_step_size(&mut self) -> Result<f64, DeviceError> {
        const QUERY: &str = ":source:voltage:step?";
        let reply = self.query(QUERY)?;
        reply.trim().parse().map_err(|_| DeviceError::Malformed {
            query: QUERY,
            reply: reply.trim().to_string(),
        })
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.instr.take().is_some() {
            info!("Sourcemeter session closed.");
        }
        Ok(())
    }
}
