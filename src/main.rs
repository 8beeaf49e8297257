mod acquisition_controller;
mod board_controller;
mod camera_controller;
mod common;
mod error;
mod laser_controller;
mod pmt_calibration;
mod signal_controller;
#[cfg(test)]
mod testing;
mod user_config;

use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{builder::PossibleValuesParser, value_parser, Arg, ArgAction, ArgMatches, Command};
use simplelog::{
    ColorChoice, CombinedLogger, LevelFilter, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};

use crate::{
    acquisition_controller::AcquisitionLoop,
    board_controller::{initialize_board, open_rpi_board, RpiBoard, TriggerBoard},
    camera_controller::{
        set_usbfs_memory, Camera, ImageHandler, ImageSink, ImageWriter, SaveTarget, V4l2Camera,
    },
    common::{
        str_time, AcquisitionMode, CalibrationResult, CalibrationStrategy, ShutdownToken,
        SystemClock,
    },
    error::HapiError,
    laser_controller::{Laser, ObisLaser},
    pmt_calibration::calibrate_board,
    signal_controller::install_shutdown_handler,
    user_config::{CameraSettings, Config, HardwareSettings, RunSettings, DEFAULT_CONFIG_PATH},
};

const DEFAULT_CALIBRATION_MS: &str = "5000";
const CAMERA_OPEN_ATTEMPTS: u32 = 6;
const CAMERA_RETRY_DELAY: Duration = Duration::from_secs(1);

/**
 * Everything opened for a run, so it can be put back in a safe state however
 * the run ends.
 */
struct Session<B, L, K, H> {
    board: Option<B>,
    laser: Option<L>,
    camera: Option<K>,
    sink: Option<H>,
}

type HardwareSession = Session<RpiBoard<SystemClock>, ObisLaser, V4l2Camera, ImageSink>;

impl<B, L, K, H> Default for Session<B, L, K, H> {
    fn default() -> Self {
        Self {
            board: None,
            laser: None,
            camera: None,
            sink: None,
        }
    }
}

impl<B: TriggerBoard, L: Laser, K: Camera, H: ImageHandler> Session<B, L, K, H> {
    /// Laser off, camera closed, board disarmed, queued images saved.
    fn cleanup(&mut self) {
        log::info!("Cleaning up.");
        if let Some(laser) = self.laser.as_mut() {
            if let Err(e) = laser.set_emission(false) {
                log::error!("Failed to turn laser off: {e}");
            }
        }
        if let Some(camera) = self.camera.as_mut() {
            camera.release();
        }
        if let Some(board) = self.board.as_mut() {
            board.disarm();
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.finish();
        }
    }
}

fn make_cli() -> Command {
    Command::new("hapi")
        .about("PMT triggered imaging with the HAPI-E trigger board")
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .help("Acquisition mode")
                .value_parser(PossibleValuesParser::new([
                    "trigger", "interval", "test", "align", "cw",
                ]))
                .ignore_case(true)
                .default_value("trigger"),
        )
        .arg(
            Arg::new("calibrate_ms")
                .short('c')
                .long("calibrate")
                .help("Calibrate the PMT before acquiring, observing each setting for this many ms")
                .value_name("ms")
                .num_args(0..=1)
                .default_missing_value(DEFAULT_CALIBRATION_MS)
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .help("Path to the config file")
                .global(true)
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .help("Also write debug logs to this file")
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Log debug messages to the terminal")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(Command::new("new").about("Make a template configuration file"))
        .subcommand(
            Command::new("calibrate")
                .about("Only calibrate the PMT and print the gain and threshold")
                .arg(
                    Arg::new("interval")
                        .long("interval")
                        .help("Observation window per setting in ms")
                        .value_parser(value_parser!(u64)),
                )
                .arg(
                    Arg::new("strategy")
                        .long("strategy")
                        .value_parser(PossibleValuesParser::new(["binary", "linear"]))
                        .ignore_case(true),
                )
                .arg(
                    Arg::new("write")
                        .long("write")
                        .help("Save the result into the config file")
                        .action(ArgAction::SetTrue),
                ),
        )
}

fn init_logging(verbose: bool, log_file: Option<&String>) {
    let term_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    loggers.push(TermLogger::new(
        term_level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ));
    if let Some(path) = log_file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => loggers.push(WriteLogger::new(
                LevelFilter::Debug,
                simplelog::Config::default(),
                file,
            )),
            Err(e) => eprintln!("Could not open log file {path}: {e}"),
        }
    }
    if let Err(e) = CombinedLogger::init(loggers) {
        eprintln!("Could not create logging: {e}");
    }
}

fn make_template_config(path: &Path) -> Result<(), HapiError> {
    if path.exists() {
        return Err(HapiError::ConfigExists(path.to_path_buf()));
    }
    log::info!("Making a template config at {}...", path.to_string_lossy());
    Config::with_defaults().save(path)?;
    log::info!("Done.");
    Ok(())
}

fn _calibrate(
    board: &mut RpiBoard<SystemClock>,
    clock: SystemClock,
    hardware: &HardwareSettings,
    window: Duration,
    strategy: CalibrationStrategy,
    shutdown: &ShutdownToken,
) -> Result<CalibrationResult, HapiError> {
    initialize_board(board, hardware, AcquisitionMode::Triggered)?;
    Ok(calibrate_board(board, clock, window, strategy, shutdown)?)
}

fn run_calibration(
    config_path: &Path,
    args: &ArgMatches,
    shutdown: &ShutdownToken,
) -> Result<(), HapiError> {
    let mut config = Config::load(config_path);
    let hardware = HardwareSettings::from_config(&config)?;
    let run = RunSettings::from_config(&config)?;
    let window = args
        .get_one::<u64>("interval")
        .map(|ms| Duration::from_millis(*ms))
        .unwrap_or(run.calibration_window);
    let strategy = args
        .get_one::<String>("strategy")
        .and_then(|strategy| CalibrationStrategy::from_str(strategy))
        .unwrap_or(run.calibration_strategy);

    let clock = SystemClock::new(run.poll);
    let mut board = open_rpi_board(&hardware, clock)?;
    let result = _calibrate(&mut board, clock, &hardware, window, strategy, shutdown);
    board.disarm();
    let result = result?;

    println!("Gain: 0x{:02X}", result.gain);
    println!("Threshold: 0x{:02X}", result.threshold);

    if args.get_flag("write") {
        config.set("pmt_gain", format!("0x{:02X}", result.gain));
        config.set("pmt_threshold", format!("0x{:02X}", result.threshold));
        config.save(config_path)?;
        log::info!("Saved calibration to {}.", config_path.to_string_lossy());
    }
    Ok(())
}

fn _run_session(
    session: &mut HardwareSession,
    config: &Config,
    mode: AcquisitionMode,
    calibration_window: Option<Duration>,
    shutdown: &ShutdownToken,
) -> Result<(), HapiError> {
    let hardware = HardwareSettings::from_config(config)?;
    let run = RunSettings::from_config(config)?;
    let clock = SystemClock::new(run.poll);

    if mode.uses_camera() && run.usbfs_memory_mb > 0 && !set_usbfs_memory(run.usbfs_memory_mb)? {
        return Err(HapiError::UsbfsMemory(run.usbfs_memory_mb));
    }

    log::info!("Initializing board.");
    let board = session.board.insert(open_rpi_board(&hardware, clock)?);
    initialize_board(board, &hardware, mode)?;

    if let Some(window) = calibration_window {
        log::info!("Calibrating PMT.");
        let result = calibrate_board(board, clock, window, run.calibration_strategy, shutdown)?;
        log::info!(
            "Calibrated gain {:#04x}, threshold {:#04x}.",
            result.gain,
            result.threshold
        );
        board.set_pmt_gain(result.gain)?;
        board.set_pmt_threshold(result.threshold)?;
        board.set_trigger_source(mode.trigger_source());
        board.reset();
    }

    if let Some(device) = &run.laser_device {
        log::info!("Initializing laser on {}.", device);
        let laser = session.laser.insert(ObisLaser::open(device, run.laser_baud)?);
        laser.initialize()?;
    }

    if mode.uses_camera() {
        log::info!("Initializing camera.");
        let settings = CameraSettings::from_config(config)?;
        session.camera = Some(V4l2Camera::open_with_retry(
            settings.clone(),
            CAMERA_OPEN_ATTEMPTS,
            CAMERA_RETRY_DELAY,
            shutdown,
        )?);
        let writer = match mode {
            AcquisitionMode::Alignment => ImageWriter::new(
                SaveTarget::Alignment,
                run.latest_dir.clone(),
                settings.thumbnail_width,
            ),
            _ => ImageWriter::for_run(
                run.output_dir.join(str_time()),
                run.latest_dir.clone(),
                settings.thumbnail_width,
            ),
        };
        session.sink = Some(ImageSink::start(writer));
    }

    let mut acquisition =
        AcquisitionLoop::new(board, clock, mode, run.interval, shutdown.clone());
    if let (Some(camera), Some(sink)) = (session.camera.as_mut(), session.sink.as_mut()) {
        acquisition = acquisition.with_camera(camera, sink);
    }
    if let Some(laser) = session.laser.as_mut() {
        acquisition = acquisition.with_laser(laser);
    }
    acquisition.run()?;
    Ok(())
}

fn run_acquisition(
    config_path: &Path,
    mode: AcquisitionMode,
    calibration_window: Option<Duration>,
    shutdown: &ShutdownToken,
) -> Result<(), HapiError> {
    log::info!("Mode: {}", mode);
    let config = Config::load(config_path);

    let mut session = HardwareSession::default();
    let result = _run_session(&mut session, &config, mode, calibration_window, shutdown);
    session.cleanup();
    result
}

fn main() {
    let matches = make_cli().get_matches();

    init_logging(
        matches.get_flag("verbose"),
        matches.get_one::<String>("log-file"),
    );

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if let Some(("new", _)) = matches.subcommand() {
        if let Err(e) = make_template_config(&config_path) {
            log::error!("{e}");
            std::process::exit(-1);
        }
        return;
    }

    let shutdown = ShutdownToken::new();
    if let Err(e) = install_shutdown_handler(shutdown.clone()) {
        log::error!("Failed to install signal handlers: {e}");
        std::process::exit(-1);
    }

    let result = match matches.subcommand() {
        Some(("calibrate", args)) => run_calibration(&config_path, args, &shutdown),
        _ => {
            let mode = matches
                .get_one::<String>("mode")
                .and_then(|mode| AcquisitionMode::from_str(mode))
                .unwrap_or(AcquisitionMode::Triggered);
            let calibration_window = matches
                .get_one::<u64>("calibrate_ms")
                .map(|ms| Duration::from_millis(*ms));
            run_acquisition(&config_path, mode, calibration_window, &shutdown)
        }
    };

    match result {
        Ok(()) => log::info!("Done."),
        Err(e) => {
            log::error!("{e}");
            std::process::exit(-1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BoardEvent, CollectedImages, EventLog, StubBoard, StubCamera, StubLaser};

    #[test]
    fn cli_parses_modes_and_the_optional_calibration_window() {
        let matches = make_cli()
            .try_get_matches_from(["hapi", "-m", "Interval", "-c"])
            .unwrap();
        let mode = matches.get_one::<String>("mode").unwrap();
        assert_eq!(
            AcquisitionMode::from_str(mode),
            Some(AcquisitionMode::Interval)
        );
        assert_eq!(matches.get_one::<u64>("calibrate_ms"), Some(&5000));

        let matches = make_cli()
            .try_get_matches_from(["hapi", "--calibrate", "250"])
            .unwrap();
        assert_eq!(matches.get_one::<String>("mode").unwrap(), "trigger");
        assert_eq!(matches.get_one::<u64>("calibrate_ms"), Some(&250));

        let matches = make_cli().try_get_matches_from(["hapi"]).unwrap();
        assert_eq!(matches.get_one::<u64>("calibrate_ms"), None);

        assert!(make_cli()
            .try_get_matches_from(["hapi", "-m", "burst"])
            .is_err());
    }

    #[test]
    fn calibrate_subcommand_takes_its_own_options() {
        let matches = make_cli()
            .try_get_matches_from([
                "hapi",
                "calibrate",
                "--interval",
                "100",
                "--strategy",
                "linear",
                "--write",
                "--config",
                "/tmp/hapi.json",
            ])
            .unwrap();
        let Some(("calibrate", args)) = matches.subcommand() else {
            panic!("expected the calibrate subcommand");
        };
        assert_eq!(args.get_one::<u64>("interval"), Some(&100));
        assert_eq!(args.get_one::<String>("strategy").unwrap(), "linear");
        assert!(args.get_flag("write"));
        assert_eq!(
            matches.get_one::<String>("config").unwrap(),
            "/tmp/hapi.json"
        );
    }

    #[test]
    fn template_config_is_never_written_over_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hapi.json");
        make_template_config(&path).unwrap();
        let template = Config::read(&path).unwrap();
        assert_eq!(template.get::<String>("pmt_gain").unwrap(), "0xFF");
        assert!(matches!(
            make_template_config(&path),
            Err(HapiError::ConfigExists(_))
        ));
    }

    #[test]
    fn cleanup_leaves_every_device_safe() {
        let log = EventLog::default();
        let mut session: Session<StubBoard, StubLaser, StubCamera, CollectedImages> =
            Session::default();
        let board = session.board.insert(StubBoard::new().with_log(log.clone()));
        board.arm();
        let laser = session.laser.insert(StubLaser::default());
        laser.set_emission(true).unwrap();
        let camera = session.camera.insert(StubCamera::new(log));
        camera.begin_acquisition().unwrap();
        session.sink = Some(CollectedImages::default());

        session.cleanup();

        let board = session.board.as_ref().unwrap();
        assert!(!board.is_armed());
        assert_eq!(board.events().last(), Some(&BoardEvent::Disarm));
        assert!(!session.laser.as_ref().unwrap().emitting);
        let camera = session.camera.as_ref().unwrap();
        assert!(camera.released);
        assert!(!camera.acquiring);
        assert!(session.sink.as_ref().unwrap().finished);
    }

    #[test]
    fn cleanup_of_a_session_that_never_opened_anything_is_a_no_op() {
        let mut session: Session<StubBoard, StubLaser, StubCamera, CollectedImages> =
            Session::default();
        session.cleanup();
        assert!(session.board.is_none() && session.camera.is_none());
    }
}
