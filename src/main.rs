//! Photometer command-line front end
//!
//! ```bash
//! # List serial ports
//! photometer ports
//!
//! # Calibrate to 10000 counts, then take three measurements
//! photometer --config photometer.toml run --user op1 --sample water \
//!     --output data/run.csv --target 10000 --measurements 3
//!
//! # Same against the built-in simulator
//! photometer --simulate run --user op1 --sample water --output run.csv --level
//!
//! # Dump the channel table stored in the device EEPROM
//! photometer table
//! ```

use clap::{Parser, Subcommand};
use photometer_daq::adapters::{Link, SimulatedInstrument};
use photometer_daq::calibration::CalibrationMode;
use photometer_daq::config::Settings;
use photometer_daq::data::CsvRecorder;
use photometer_daq::error::{AppResult, DaqError};
use photometer_daq::instrument::Photometer;
use photometer_daq::logging;
use photometer_daq::measurement::MeasurementMode;
use photometer_daq::metadata::MetadataBuilder;
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

/// Protocol and calibration front end for the 16-channel photometer
#[derive(Parser, Debug)]
#[command(name = "photometer")]
#[command(version)]
#[command(about = "Calibrate and measure with the 16-channel photometer", long_about = None)]
struct Args {
    /// Configuration file (TOML); PHOTOMETER_* variables override it
    #[arg(short, long, default_value = "config/photometer.toml")]
    config: PathBuf,

    /// Talk to the built-in simulator instead of the serial port
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the serial ports on this machine
    Ports,

    /// Print the device's channel table as JSON
    Table,

    /// Calibrate, then measure, recording everything to CSV
    Run {
        #[arg(long)]
        user: String,

        #[arg(long)]
        sample: String,

        /// Raw data file; absorbance goes next to it as `<name>_log.csv`
        #[arg(long)]
        output: PathBuf,

        /// Calibrate every channel to this pulse-1 count
        #[arg(long, conflicts_with = "level")]
        target: Option<u16>,

        /// Capture the present light levels as the reference
        #[arg(long)]
        level: bool,

        /// Number of calibrated measurements to take
        #[arg(long, default_value_t = 1)]
        measurements: u32,

        /// Take one averaged measurement of this many cycles instead
        #[arg(long)]
        average: Option<u32>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let settings = match Settings::load_from(&args.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            process::exit(2);
        }
    };
    if let Err(e) = logging::init_from_settings(&settings) {
        eprintln!("{e}");
    }

    if let Err(e) = run(args, settings).await {
        error!("{}", e);
        process::exit(1);
    }
}

async fn run(args: Args, settings: Settings) -> AppResult<()> {
    match args.command {
        Command::Ports => {
            for port in available_ports()? {
                println!("{port}");
            }
            Ok(())
        }
        Command::Table => {
            let mut photometer = Photometer::new(
                open_link(args.simulate, &settings)?,
                photometer_daq::data::MemoryRecorder::new(),
                &settings,
            );
            photometer.connect().await?;
            photometer.read_table().await?;
            let table = photometer.register().settings_table();
            let json = serde_json::to_string_pretty(&table)
                .map_err(|e| DaqError::Configuration(format!("cannot render table: {e}")))?;
            println!("{json}");
            photometer.shutdown().await
        }
        Command::Run {
            user,
            sample,
            output,
            target,
            level,
            measurements,
            average,
        } => {
            let mut photometer = Photometer::new(
                open_link(args.simulate, &settings)?,
                CsvRecorder::new(&output),
                &settings,
            );
            photometer.connect().await?;
            photometer.read_table().await?;
            photometer
                .set_metadata(MetadataBuilder::new().user_id(&user).sample(&sample).build())
                .await?;

            let mode = match (target, level) {
                (Some(target), _) => Some(CalibrationMode::Target(target)),
                (None, true) => Some(CalibrationMode::Level),
                (None, false) => None,
            };
            if let Some(mode) = mode {
                let outcome = photometer.calibrate(mode).await?;
                for warning in &outcome.report.warnings {
                    println!("warning: {warning}");
                }
                println!("{}", outcome.report.run.label());
            }

            match average {
                Some(cycles) => {
                    let outcomes = photometer.averaged_measurement(cycles).await?;
                    info!("Averaged measurement of {} cycles recorded", outcomes.len());
                }
                None => {
                    for _ in 0..measurements {
                        let outcome = photometer.measure(MeasurementMode::Calibrated).await?;
                        println!("{}", outcome.record.label);
                    }
                }
            }
            photometer.shutdown().await
        }
    }
}

fn open_link(simulate: bool, settings: &Settings) -> AppResult<Box<dyn Link>> {
    if simulate {
        return Ok(Box::new(SimulatedInstrument::new()));
    }
    serial_link(settings)
}

#[cfg(feature = "instrument_serial")]
fn serial_link(settings: &Settings) -> AppResult<Box<dyn Link>> {
    Ok(Box::new(photometer_daq::adapters::SerialLink::new(
        &settings.serial.port,
        settings.serial.baud_rate,
    )))
}

#[cfg(not(feature = "instrument_serial"))]
fn serial_link(_settings: &Settings) -> AppResult<Box<dyn Link>> {
    Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
}

#[cfg(feature = "instrument_serial")]
fn available_ports() -> AppResult<Vec<String>> {
    photometer_daq::adapters::SerialLink::available_ports()
}

#[cfg(not(feature = "instrument_serial"))]
fn available_ports() -> AppResult<Vec<String>> {
    Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
}
