//! Max power point tracker for solar cells using a Keithley 2400 sourcemeter.
//!
//! Data is written to stdout (and optionally a file); human readable messages
//! go to stderr.

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mpp_tracker::config::{AngleNormalization, RunParameters, StatusPolicy, TrackerConfig};
use mpp_tracker::device::{DeviceError, SourceMeter};
use mpp_tracker::{run, DataStream, DiodeModel, Session, SimulatedSourceMeter, SystemClock};

#[derive(Parser, Debug)]
#[command(name = "mpp-tracker", version)]
#[command(
    about = "Max power point tracker for solar cells using a Keithley 2400 sourcemeter (hopefully robust enough for perovskites). Data is written to stdout and human readable messages are written to stderr."
)]
struct Args {
    /// VISA resource name for sourcemeter
    address: String,

    /// Total number of seconds for the dwell phase(s)
    t_dwell: f64,

    /// Total number of seconds to run for (0 runs forever)
    t_total: f64,

    /// Run in dummy mode (doesn't need sourcemeter, generates simulated device data)
    #[arg(long)]
    dummy: bool,

    /// Swaps voltage polarity on output terminals
    #[arg(long)]
    reverse_polarity: bool,

    /// Write output data stream to this file in addition to stdout
    #[arg(long)]
    file: Option<PathBuf>,

    /// Use the rear terminals
    #[arg(long)]
    rear: bool,

    /// TOML file overriding tracker constants
    #[arg(long)]
    config: Option<PathBuf>,

    /// What to do when a reading reports a fault status
    #[arg(long, value_enum)]
    status_policy: Option<StatusPolicy>,

    /// Angle metric normalization between exploration cycles
    #[arg(long, value_enum)]
    normalization: Option<AngleNormalization>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// Failures before tracking starts, reported with their own exit codes.
#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("unable to connect to instrument {address}")]
    Connection {
        address: String,
        #[source]
        source: DeviceError,
    },

    #[error("unable to perform \"*IDN?\" query")]
    Identification(#[source] DeviceError),
}

impl StartupError {
    fn exit_code(&self) -> u8 {
        match self {
            // -1 and -2 as unsigned process exit codes
            StartupError::Connection { .. } => 255,
            StartupError::Identification(_) => 254,
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "mpp_tracker=debug"
    } else {
        "mpp_tracker=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(args: &Args) -> anyhow::Result<TrackerConfig> {
    let mut config = match &args.config {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::default(),
    };
    if let Some(policy) = args.status_policy {
        config.status_policy = policy;
    }
    if let Some(normalization) = args.normalization {
        config.normalization = normalization;
    }
    config.validate()?;
    Ok(config)
}

fn data_stream(args: &Args) -> anyhow::Result<DataStream> {
    let mut stream = DataStream::stdout();
    if let Some(path) = &args.file {
        let file = File::create(path)
            .with_context(|| format!("failed to create data file {}", path.display()))?;
        stream.add_sink(Box::new(file));
    }
    Ok(stream)
}

#[cfg(feature = "keithley")]
fn connect(address: &str) -> anyhow::Result<Box<dyn SourceMeter>> {
    use mpp_tracker::keithley::KeithleySourceMeter;

    let mut meter =
        KeithleySourceMeter::open(address).map_err(|source| StartupError::Connection {
            address: address.to_string(),
            source,
        })?;
    if let Err(err) = meter.identify() {
        let _ = meter.close();
        return Err(StartupError::Identification(err).into());
    }
    Ok(Box::new(meter))
}

#[cfg(not(feature = "keithley"))]
fn connect(address: &str) -> anyhow::Result<Box<dyn SourceMeter>> {
    Err(StartupError::Connection {
        address: address.to_string(),
        source: DeviceError::Unsupported(
            "built without the `keithley` feature; use --dummy or rebuild with it".to_string(),
        ),
    }
    .into())
}

fn try_main(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    let params = RunParameters::new(args.t_dwell, args.t_total, args.reverse_polarity, args.rear)?;
    let clock = SystemClock::new();

    let device: Box<dyn SourceMeter> = if args.dummy {
        info!("Dummy mode initiated...");
        let model = DiodeModel::new(config.simulator.diode).context("invalid simulated diode")?;
        let simulator = SimulatedSourceMeter::new(model, clock)
            .context("invalid simulated diode")?
            .with_latency(config.simulator.latency());
        Box::new(simulator)
    } else {
        connect(&args.address)?
    };

    let stream = data_stream(&args)?;
    let mut session = Session::new(device, clock, stream, params, config);
    let summary = run(&mut session)?;
    info!(
        measurements = summary.measurements,
        cycles = summary.cycles.len(),
        vmpp = summary.vmpp,
        "Run complete"
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match try_main(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            let code = err
                .downcast_ref::<StartupError>()
                .map(StartupError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}
