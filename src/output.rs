//! The measurement data stream.
//!
//! One header line, then one line per reading:
//! `exploring,time,voltage,current` with numbers in 4-decimal scientific
//! notation (`6.2930e-03`). Every line goes to every sink, in order, and is
//! flushed immediately.

use std::io::{self, Write};

use crate::measurement::Measurement;

pub const HEADER: &str = "#exploring,time,voltage,current";

/// Fan-out writer for the data stream.
#[derive(Default)]
pub struct DataStream {
    sinks: Vec<Box<dyn Write>>,
}

impl DataStream {
    /// A stream with no sinks; lines are discarded.
    pub fn new() -> Self {
        Self::default()
    }

    /// A stream writing to standard output.
    pub fn stdout() -> Self {
        Self::new().with_sink(io::stdout())
    }

    pub fn with_sink(mut self, sink: impl Write + 'static) -> Self {
        self.add_sink(Box::new(sink));
        self
    }

    pub fn add_sink(&mut self, sink: Box<dyn Write>) {
        self.sinks.push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn write_header(&mut self) -> io::Result<()> {
        self.write_line(HEADER)
    }

    pub fn record(&mut self, exploring: bool, measurement: &Measurement) -> io::Result<()> {
        self.write_line(&format_line(exploring, measurement))
    }

    pub fn flush(&mut self) -> io::Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        for sink in &mut self.sinks {
            writeln!(sink, "{line}")?;
            sink.flush()?;
        }
        Ok(())
    }
}

/// `exploring,time,voltage,current`
pub fn format_line(exploring: bool, measurement: &Measurement) -> String {
    format!(
        "{},{},{},{}",
        u8::from(exploring),
        scientific(measurement.timestamp),
        scientific(measurement.voltage),
        scientific(measurement.current)
    )
}

/// Four decimals of scientific notation with a signed two-digit exponent.
pub fn scientific(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let formatted = format!("{value:.4e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.abs())
        }
        None => formatted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

    impl SharedBuffer {
        fn text(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_scientific_formatting() {
        assert_eq!(scientific(0.0), "0.0000e+00");
        assert_eq!(scientific(6.293e-3), "6.2930e-03");
        assert_eq!(scientific(-6.293e-3), "-6.2930e-03");
        assert_eq!(scientific(123.456), "1.2346e+02");
        assert_eq!(scientific(1.5e-120), "1.5000e-120");
        assert_eq!(scientific(f64::NAN), "nan");
        assert_eq!(scientific(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn test_line_format() {
        let m = Measurement::new(0.6201, 0.0051, 12.5, 0);
        assert_eq!(
            format_line(true, &m),
            "1,1.2500e+01,6.2010e-01,5.1000e-03"
        );
        assert!(format_line(false, &m).starts_with("0,"));
    }

    #[test]
    fn test_every_sink_gets_identical_lines() {
        let first = SharedBuffer::default();
        let second = SharedBuffer::default();
        let mut stream = DataStream::new()
            .with_sink(first.clone())
            .with_sink(second.clone());
        assert_eq!(stream.sink_count(), 2);

        stream.write_header().unwrap();
        stream
            .record(false, &Measurement::new(0.5, 0.005, 1.0, 0))
            .unwrap();
        stream
            .record(true, &Measurement::new(0.51, 0.0049, 1.01, 0))
            .unwrap();

        let text = first.text();
        assert_eq!(text, second.text());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].starts_with("0,1.0000e+00"));
        assert!(lines[2].starts_with("1,1.0100e+00"));
    }

    #[test]
    fn test_file_sink_matches_memory_sink() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let memory = SharedBuffer::default();
        let mut stream = DataStream::new()
            .with_sink(file.reopen().unwrap())
            .with_sink(memory.clone());
        stream.write_header().unwrap();
        stream
            .record(true, &Measurement::new(0.9408, 0.0, 0.0, 0))
            .unwrap();
        drop(stream);

        let on_disk = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(on_disk, memory.text());
    }
}
