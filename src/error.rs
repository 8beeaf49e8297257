use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum BoardError {
    #[error("Board failed to open GPIO line: {0}")]
    Gpio(#[from] rppal::gpio::Error),
    #[error("Board failed to talk to the PMT over I2C: {0}")]
    I2c(#[from] rppal::i2c::Error),
    #[error("Value {value} does not fit in the {bits} {field} lines")]
    ValueTooWide {
        field: &'static str,
        value: u32,
        bits: usize,
    },
    #[error("Board register bus write failed: {0}")]
    Bus(String),
}

#[derive(Debug, Error)]
pub(crate) enum CalibrationError {
    #[error("Could not find values for the gain and threshold that worked")]
    NoPassingRegion,
    #[error("Calibration was cancelled before a result was found")]
    Cancelled,
    #[error("Calibration failed due to board error: {0}")]
    Board(#[from] BoardError),
}

#[derive(Debug, Error)]
pub(crate) enum CameraError {
    #[error("Could not open camera {0}: {1}")]
    Open(String, String),
    #[error("Camera failed to start acquisition: {0}")]
    Start(String),
    #[error("Camera capture failed: {0}")]
    Capture(#[from] std::io::Error),
    #[error("Image incomplete: {0}")]
    Incomplete(String),
    #[error("Camera is not initialized")]
    NotInitialized,
    #[error("JPEG coding failed: {0}")]
    Jpeg(#[from] turbojpeg::Error),
}

#[derive(Debug, Error)]
pub(crate) enum LaserError {
    #[error("Laser serial port failed: {0}")]
    Serial(#[from] serialport::Error),
    #[error("Laser serial IO failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Laser replied with an unexpected response to '{command}': {response}")]
    BadResponse { command: String, response: String },
    #[error("Laser reported fault code {0:#08x}")]
    Fault(u32),
}

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config file could not be parsed as JSON: {0}")]
    ParsingError(#[from] json::Error),
    #[error("Config has no value for key '{0}'")]
    MissingKey(String),
    #[error("Config value for key '{key}' is invalid: {value}")]
    BadValue { key: String, value: String },
    #[error("Config could not find file {0:?}")]
    BadFilePath(PathBuf),
}

#[derive(Debug, Error)]
pub(crate) enum AcquisitionError {
    #[error("Acquisition failed due to camera error: {0}")]
    Camera(#[from] CameraError),
}

#[derive(Debug, Error)]
pub(crate) enum HapiError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Board(#[from] BoardError),
    #[error("{0}")]
    Calibration(#[from] CalibrationError),
    #[error("{0}")]
    Camera(#[from] CameraError),
    #[error("{0}")]
    Laser(#[from] LaserError),
    #[error("{0}")]
    Acquisition(#[from] AcquisitionError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to set usbfs memory to {0}mb")]
    UsbfsMemory(u32),
    #[error("Refusing to overwrite existing config file {0:?}")]
    ConfigExists(PathBuf),
}
