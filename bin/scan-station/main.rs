use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{LevelFilter, error, info, warn};
use ndarray::Array1;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use scan_station::{
    CrossSection, DailyRun, FitTerm, ScanRecord, SimulatedHardware, SimulatedScene, Station,
    StationConfig, load_config, plot_record,
};

/// Pixels of the simulated spectrometer
const SIMULATED_PIXELS: usize = 1024;
/// Wavelength range of the simulated spectrometer in nm
const SIMULATED_RANGE: (f64, f64) = (280.0, 360.0);
/// Plume column density at its centre, molec/cm^2
const SIMULATED_PEAK_COLUMN: f64 = 5e17;

#[derive(Parser, Debug)]
#[command(name = "scan-station")]
#[command(about = "Scanning DOAS station control and SO2 retrieval")]
struct Args {
    /// Log level (trace, debug, info, warn, error). Defaults to the
    /// configured console verbosity.
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate a station configuration
    CheckConfig {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Run the operating loop against simulated hardware
    Simulate {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Stop after this many scans
        #[arg(short, long)]
        scans: Option<u32>,

        /// Scan immediately instead of waiting for the operating window
        #[arg(long)]
        ignore_window: bool,

        /// Plot the SO2 column density of every finished scan
        #[arg(long)]
        plot: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config_path = match &args.command {
        Command::CheckConfig { config } | Command::Simulate { config, .. } => config.clone(),
    };
    let config = match load_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            initialize_logging(args.log_level.as_deref().unwrap_or("info"))?;
            error!("{}", e);
            return Err(e.into());
        }
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.console.verbosity.clone());
    initialize_logging(&log_level)?;

    match args.command {
        Command::CheckConfig { .. } => {
            log_config(&config);
            println!("Configuration OK");
            Ok(())
        }
        Command::Simulate {
            scans,
            ignore_window,
            plot,
            ..
        } => {
            log_config(&config);
            let run = DailyRun {
                max_scans: scans,
                ignore_window,
                ..Default::default()
            };
            run_simulation(config, &run, plot)
        }
    }
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .try_init()?;

    Ok(())
}

fn log_config(config: &StationConfig) {
    info!("=== Scan station '{}' ===", config.station_name);
    info!(
        "Operating window: {} to {}",
        config.start_time, config.stop_time
    );
    info!(
        "Scan: {} positions, {} steps apart, {} steps to start, home at {:.1} deg ({} deg/step)",
        config.specs_per_scan,
        config.steps_per_spec,
        config.steps_to_start,
        config.home_angle,
        config.angle_per_step
    );
    info!(
        "Exposure: start {} ms x {}, range {}-{} ms in steps of {}, target {} counts",
        config.start_int_time,
        config.start_coadds,
        config.min_int_time,
        config.max_int_time,
        config.int_time_step,
        config.target_int
    );
    info!(
        "Fit window {:.1}-{:.1} nm, {} parameters:",
        config.fit_control.fit_window[0],
        config.fit_control.fit_window[1],
        config.fit_parameters.len()
    );
    for p in config.fit_parameters.iter() {
        let bounds = match (p.lo_bound, p.hi_bound) {
            (None, None) => String::new(),
            (lo, hi) => format!(
                " bounds [{}, {}]",
                lo.map_or("-inf".to_string(), |v| format!("{:e}", v)),
                hi.map_or("inf".to_string(), |v| format!("{:e}", v))
            ),
        };
        let fixed = if p.vary { "" } else { " (fixed)" };
        info!("  {:<10} {:<28} = {:e}{}{}", p.name, describe_term(&p.term), p.value, bounds, fixed);
    }
}

fn describe_term(term: &FitTerm) -> String {
    match term {
        FitTerm::Background { order } => format!("background x^{}", order),
        FitTerm::Offset { order } => format!("offset x^{}", order),
        FitTerm::Shift { order } => format!("shift dl^{}", order),
        FitTerm::Absorber { xpath } => format!("absorber {}", xpath.display()),
    }
}

/// Build a simulated sky with an SO2 plume centred on the home angle, using
/// the configured SO2 cross-section when it can be read.
fn simulated_hardware(config: &StationConfig) -> SimulatedHardware {
    let (lo, hi) = SIMULATED_RANGE;
    let wavelengths = Array1::linspace(lo, hi, SIMULATED_PIXELS);
    // Full scale at roughly the target integration time
    let counts_per_ms =
        config.target_int as f64 / ((config.min_int_time + config.max_int_time) / 2).max(1) as f64;
    let mut scene = SimulatedScene::clear_sky(wavelengths.clone(), counts_per_ms);

    let so2 = config.fit_parameters.get("so2").and_then(|p| match &p.term {
        FitTerm::Absorber { xpath } => Some(xpath.clone()),
        _ => None,
    });
    match so2.map(|path| (CrossSection::load(&path), path)) {
        Some((Ok(xsec), path)) => {
            info!("Simulated plume uses {}", path.display());
            scene = scene.with_plume(
                xsec.resample(&wavelengths),
                SIMULATED_PEAK_COLUMN,
                config.home_angle,
            );
        }
        Some((Err(e), path)) => {
            warn!("Cannot read {} ({}), simulating clear sky", path.display(), e);
        }
        None => warn!("No so2 parameter configured, simulating clear sky"),
    }

    SimulatedHardware::new(scene, config.home_angle, config.angle_per_step)
}

fn report_scan(record: &ScanRecord, plot: bool) {
    info!(
        "Scan {} {}: {}/{} positions, {} converged, {} failed, {:.1} s",
        record.scan_number(),
        if record.is_complete() { "complete" } else { "partial" },
        record.len(),
        record.expected_positions(),
        record.valid_fits(),
        record.failed_fits(),
        (record.finished_at() - record.started_at()).num_milliseconds() as f64 / 1000.0
    );
    match record.peak_angle("so2") {
        Some((angle, column)) => info!("SO2 peak {:.3e} molec/cm^2 at {:.1} deg", column, angle),
        None => warn!("No converged SO2 retrieval in scan {}", record.scan_number()),
    }

    if plot {
        if let Err(e) = plot_record(record, "so2", None, None) {
            warn!("Plotting failed: {}", e);
        }
    }
}

/// Run the daily loop on simulated hardware and report results
fn run_simulation(
    config: StationConfig,
    run: &DailyRun,
    plot: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let hardware = simulated_hardware(&config);
    let mut station = Station::new(config, hardware)?;

    let shutdown_flag = setup_shutdown_handler()?;
    station.set_shutdown_flag(Arc::clone(&shutdown_flag));
    info!(
        "Status published to {}",
        station.status_file().path().display()
    );

    let result = station.run_daily(run, |record| report_scan(record, plot));
    let actions = station.with_hardware(|hw| hw.total_actions());

    match result {
        Ok(scans) => {
            if shutdown_flag.load(Ordering::SeqCst) {
                info!("✓ Stopped by user after {} scan(s)", scans);
            } else {
                info!("✓ {} scan(s) finished", scans);
            }
            info!("{} hardware actions issued", actions);
            Ok(())
        }
        Err(e) => {
            error!("✗ Station stopped: {}", e);
            Err(e.into())
        }
    }
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - finishing the current step and returning home...");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
    })?;

    Ok(shutdown_flag)
}
