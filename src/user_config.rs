use std::{
    fs::{read_to_string, write},
    path::{Path, PathBuf},
    time::Duration,
};

use json::JsonValue;

use crate::{
    common::{CalibrationStrategy, PollStrategy},
    error::ConfigError,
};

pub(crate) const DEFAULT_CONFIG_PATH: &str = "/opt/hapi/hapi.json";

pub(crate) const DELAY_BITS: usize = 4;
pub(crate) const EXP_BITS: usize = 4;
pub(crate) const PULSE_BITS: usize = 5;

/// Gain range the camera sensor accepts, in dB.
pub(crate) const CAMERA_GAIN_RANGE: std::ops::RangeInclusive<f64> = 1.0..=47.994267;

/**
 * Key/value configuration backed by a flat JSON object. Every key has a
 * default, and a config file only needs to name the keys it overrides.
 */
#[derive(Debug, Clone)]
pub(crate) struct Config {
    items: JsonValue,
}

/// Conversion from a raw config value into a typed one.
pub(crate) trait FromConfigValue: Sized {
    fn from_config_value(key: &str, value: &JsonValue) -> Result<Self, ConfigError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PinMap {
    pub(crate) arm: u8,
    pub(crate) done: u8,
    pub(crate) trigger: u8,
    pub(crate) trigger_source: u8,
    pub(crate) delay: [u8; DELAY_BITS],
    pub(crate) exp: [u8; EXP_BITS],
    pub(crate) pulse: [u8; PULSE_BITS],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BoardTiming {
    /// Wait after every GPIO line write.
    pub(crate) line_settle: Duration,
    /// Wait after every PMT register write; the DAC is slower than a line.
    pub(crate) bus_settle: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HardwareSettings {
    pub(crate) pins: PinMap,
    pub(crate) timing: BoardTiming,
    pub(crate) pmt_i2c_bus: u8,
    pub(crate) pmt_i2c_address: u16,
    pub(crate) delay: u8,
    pub(crate) exp: u8,
    pub(crate) pulse: u8,
    pub(crate) pmt_gain: u8,
    pub(crate) pmt_threshold: u8,
}

/// How triggered frames reach the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CameraTrigger {
    /// The board's trigger line drives the sensor; every queued frame is an event.
    Hardware,
    /// The camera streams freely and the frame following each completion is kept.
    Software,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CameraSettings {
    pub(crate) device_path: String,
    pub(crate) resolution: (u32, u32), // (width, height)
    pub(crate) buffers: u32,
    pub(crate) thumbnail_width: usize,
    /// dB, within `CAMERA_GAIN_RANGE`.
    pub(crate) gain: f64,
    /// V4L2 absolute exposure, in units of 100us.
    pub(crate) exposure: u32,
    pub(crate) trigger: CameraTrigger,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunSettings {
    pub(crate) output_dir: PathBuf,
    pub(crate) latest_dir: PathBuf,
    pub(crate) interval: Duration,
    pub(crate) laser_device: Option<String>,
    pub(crate) laser_baud: u32,
    pub(crate) calibration_strategy: CalibrationStrategy,
    pub(crate) calibration_window: Duration,
    pub(crate) usbfs_memory_mb: u32,
    pub(crate) poll: PollStrategy,
}

///////////////////
// Implementations
///////////////////
impl Config {
    /// Config holding only the built-in defaults.
    pub(crate) fn with_defaults() -> Self {
        let mut items = JsonValue::new_object();
        items["output"] = ".".into();
        items["latest_dir"] = "/var/www/hapi".into();
        items["delay"] = "0b1000".into();
        items["exp"] = "0b0010".into();
        items["pulse"] = "0b11111".into();
        items["pmt_gain"] = "0xFF".into();
        items["pmt_threshold"] = "0x10".into();
        items["interval"] = 3000.into();
        items["camera_device"] = "/dev/video0".into();
        items["camera_width"] = 1280.into();
        items["camera_height"] = 720.into();
        items["camera_buffers"] = 4.into();
        items["camera_gain"] = "47.994267".into();
        items["camera_exposure"] = 200.into();
        items["camera_trigger"] = "software".into();
        items["thumbnail_width"] = 600.into();
        items["laser_device"] = "".into();
        items["laser_baud"] = 115200.into();
        items["pmt_i2c_bus"] = 1.into();
        items["pmt_i2c_address"] = "0x2C".into();
        items["line_settle_us"] = 1.into();
        items["bus_settle_ms"] = 5.into();
        items["calibration_strategy"] = "binary".into();
        items["calibration_window"] = 5000.into();
        items["usbfs_memory_mb"] = 0.into();
        items["poll_strategy"] = "yield".into();
        items["poll_sleep_us"] = 100.into();
        items["arm_pin"] = 17.into();
        items["done_pin"] = 27.into();
        items["trigger_pin"] = 22.into();
        items["trigger_source_pin"] = 23.into();
        items["delay_pins"] = vec![5u8, 6, 13, 19].into();
        items["exp_pins"] = vec![12u8, 16, 20, 21].into();
        items["pulse_pins"] = vec![18u8, 24, 25, 8, 7].into();
        Self { items }
    }

    /// Read a config file on top of the defaults. Fails if the file is missing
    /// or is not a JSON object.
    pub(crate) fn read(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let raw = read_to_string(config_path)?;
        let parsed = json::parse(&raw)?;
        if !parsed.is_object() {
            return Err(ConfigError::BadValue {
                key: String::from("<root>"),
                value: parsed.dump(),
            });
        }

        let mut config = Self::with_defaults();
        for (key, value) in parsed.entries() {
            config.items[key] = value.clone();
        }
        Ok(config)
    }

    /// Like `read`, but never fails: a missing or broken file falls back to
    /// the defaults.
    pub(crate) fn load(config_path: &Path) -> Self {
        log::info!("Loading config from {}.", config_path.to_string_lossy());
        let config = match Self::read(config_path) {
            Ok(config) => config,
            Err(ConfigError::BadFilePath(_)) => {
                log::warn!("Config file not found. Using defaults.");
                Self::with_defaults()
            }
            Err(e) => {
                log::error!("Failed to load config: {e}. Using defaults.");
                Self::with_defaults()
            }
        };
        log::info!("Config:");
        for (key, value) in config.items.entries() {
            log::info!("    {}: {}", key, value.dump());
        }
        config
    }

    pub(crate) fn get<T: FromConfigValue>(&self, key: &str) -> Result<T, ConfigError> {
        let value = &self.items[key];
        if value.is_null() {
            return Err(ConfigError::MissingKey(String::from(key)));
        }
        T::from_config_value(key, value)
    }

    pub(crate) fn set<V: Into<JsonValue>>(&mut self, key: &str, value: V) {
        self.items[key] = value.into();
    }

    pub(crate) fn save(&self, config_path: &Path) -> Result<(), ConfigError> {
        write(config_path, json::stringify_pretty(self.items.clone(), 4))?;
        Ok(())
    }
}

/**
 * Parses an integer literal in decimal, `0x` hexadecimal or `0b` binary form.
 * Pin patterns in the config are usually written in binary so the bit layout
 * is visible.
 */
pub(crate) fn parse_literal(text: &str) -> Option<u64> {
    let text = text.trim().to_lowercase();
    if let Some(hex) = text.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = text.strip_prefix("0b") {
        u64::from_str_radix(bin, 2).ok()
    } else {
        text.parse().ok()
    }
}

fn _bad_value(key: &str, value: &JsonValue) -> ConfigError {
    ConfigError::BadValue {
        key: String::from(key),
        value: value.dump(),
    }
}

fn _integer_value(key: &str, value: &JsonValue) -> Result<u64, ConfigError> {
    let parsed = if let Some(text) = value.as_str() {
        parse_literal(text)
    } else {
        value.as_u64()
    };
    parsed.ok_or_else(|| _bad_value(key, value))
}

macro_rules! impl_integer_config_value {
    ($($ty:ty),*) => {
        $(
            impl FromConfigValue for $ty {
                fn from_config_value(key: &str, value: &JsonValue) -> Result<Self, ConfigError> {
                    let raw = _integer_value(key, value)?;
                    <$ty>::try_from(raw).map_err(|_| _bad_value(key, value))
                }
            }
        )*
    };
}

impl_integer_config_value!(u8, u16, u32, u64);

impl FromConfigValue for f64 {
    fn from_config_value(key: &str, value: &JsonValue) -> Result<Self, ConfigError> {
        let parsed = match value.as_str() {
            Some(text) => text.trim().parse().ok(),
            None => value.as_f64(),
        };
        parsed
            .filter(|number: &f64| number.is_finite())
            .ok_or_else(|| _bad_value(key, value))
    }
}

impl FromConfigValue for String {
    fn from_config_value(key: &str, value: &JsonValue) -> Result<Self, ConfigError> {
        value
            .as_str()
            .map(String::from)
            .ok_or_else(|| _bad_value(key, value))
    }
}

impl FromConfigValue for PathBuf {
    fn from_config_value(key: &str, value: &JsonValue) -> Result<Self, ConfigError> {
        String::from_config_value(key, value).map(PathBuf::from)
    }
}

impl FromConfigValue for Vec<u8> {
    fn from_config_value(key: &str, value: &JsonValue) -> Result<Self, ConfigError> {
        if !value.is_array() {
            return Err(_bad_value(key, value));
        }
        value
            .members()
            .map(|member| u8::from_config_value(key, member))
            .collect()
    }
}

fn _pin_array<const N: usize>(config: &Config, key: &str) -> Result<[u8; N], ConfigError> {
    let pins: Vec<u8> = config.get(key)?;
    pins.as_slice()
        .try_into()
        .map_err(|_| ConfigError::BadValue {
            key: String::from(key),
            value: format!("expected {N} pins, found {}", pins.len()),
        })
}

fn _bcd_value(config: &Config, key: &str, bits: usize) -> Result<u8, ConfigError> {
    let value: u8 = config.get(key)?;
    if (value as u32) >> bits != 0 {
        return Err(ConfigError::BadValue {
            key: String::from(key),
            value: format!("{value:#b} is wider than {bits} bits"),
        });
    }
    Ok(value)
}

impl HardwareSettings {
    pub(crate) fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let pins = PinMap {
            arm: config.get("arm_pin")?,
            done: config.get("done_pin")?,
            trigger: config.get("trigger_pin")?,
            trigger_source: config.get("trigger_source_pin")?,
            delay: _pin_array(config, "delay_pins")?,
            exp: _pin_array(config, "exp_pins")?,
            pulse: _pin_array(config, "pulse_pins")?,
        };
        let timing = BoardTiming {
            line_settle: Duration::from_micros(config.get("line_settle_us")?),
            bus_settle: Duration::from_millis(config.get("bus_settle_ms")?),
        };
        if timing.line_settle.is_zero() || timing.bus_settle.is_zero() {
            return Err(ConfigError::BadValue {
                key: String::from("line_settle_us/bus_settle_ms"),
                value: String::from("settling delays must be non-zero"),
            });
        }

        Ok(Self {
            pins,
            timing,
            pmt_i2c_bus: config.get("pmt_i2c_bus")?,
            pmt_i2c_address: config.get("pmt_i2c_address")?,
            delay: _bcd_value(config, "delay", DELAY_BITS)?,
            exp: _bcd_value(config, "exp", EXP_BITS)?,
            pulse: _bcd_value(config, "pulse", PULSE_BITS)?,
            pmt_gain: config.get("pmt_gain")?,
            pmt_threshold: config.get("pmt_threshold")?,
        })
    }
}

impl CameraSettings {
    pub(crate) fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            device_path: config.get("camera_device")?,
            resolution: (config.get("camera_width")?, config.get("camera_height")?),
            buffers: config.get("camera_buffers")?,
            thumbnail_width: config.get::<u32>("thumbnail_width")? as usize,
            gain: _camera_gain(config)?,
            exposure: config.get("camera_exposure")?,
            trigger: _camera_trigger(config)?,
        })
    }
}

fn _camera_gain(config: &Config) -> Result<f64, ConfigError> {
    let gain: f64 = config.get("camera_gain")?;
    if !CAMERA_GAIN_RANGE.contains(&gain) {
        return Err(ConfigError::BadValue {
            key: String::from("camera_gain"),
            value: format!(
                "{gain} is outside {}..={}",
                CAMERA_GAIN_RANGE.start(),
                CAMERA_GAIN_RANGE.end()
            ),
        });
    }
    Ok(gain)
}

/// Accepts the names or the 1/0 flag older config files use.
fn _camera_trigger(config: &Config) -> Result<CameraTrigger, ConfigError> {
    let trigger: String = match config.get::<u8>("camera_trigger") {
        Ok(1) => return Ok(CameraTrigger::Hardware),
        Ok(0) => return Ok(CameraTrigger::Software),
        _ => config.get("camera_trigger")?,
    };
    match trigger.trim().to_lowercase().as_str() {
        "hardware" => Ok(CameraTrigger::Hardware),
        "software" => Ok(CameraTrigger::Software),
        _ => Err(ConfigError::BadValue {
            key: String::from("camera_trigger"),
            value: trigger,
        }),
    }
}

impl RunSettings {
    pub(crate) fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let laser_device: String = config.get("laser_device")?;
        let strategy: String = config.get("calibration_strategy")?;
        let calibration_strategy =
            CalibrationStrategy::from_str(&strategy).ok_or_else(|| ConfigError::BadValue {
                key: String::from("calibration_strategy"),
                value: strategy.clone(),
            })?;

        Ok(Self {
            output_dir: config.get("output")?,
            latest_dir: config.get("latest_dir")?,
            interval: Duration::from_millis(config.get("interval")?),
            laser_device: if laser_device.trim().is_empty() {
                None
            } else {
                Some(laser_device)
            },
            laser_baud: config.get("laser_baud")?,
            calibration_strategy,
            calibration_window: Duration::from_millis(config.get("calibration_window")?),
            usbfs_memory_mb: config.get("usbfs_memory_mb")?,
            poll: _poll_strategy(config)?,
        })
    }
}

/// How spin-waits pass the time between polls of the board.
fn _poll_strategy(config: &Config) -> Result<PollStrategy, ConfigError> {
    let strategy: String = config.get("poll_strategy")?;
    match strategy.trim().to_lowercase().as_str() {
        "yield" => Ok(PollStrategy::Yield),
        "spin" => Ok(PollStrategy::Spin),
        "sleep" => Ok(PollStrategy::Sleep(Duration::from_micros(
            config.get("poll_sleep_us")?,
        ))),
        _ => Err(ConfigError::BadValue {
            key: String::from("poll_strategy"),
            value: strategy,
        }),
    }
}
