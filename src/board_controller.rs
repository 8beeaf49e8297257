use std::collections::HashMap;

use rppal::{
    gpio::{Gpio, InputPin, Level, OutputPin},
    i2c::I2c,
};

use crate::{
    common::{AcquisitionMode, Clock, TriggerSource},
    error::BoardError,
    user_config::{BoardTiming, HardwareSettings, PinMap},
};

/// PMT gain DAC register.
pub(crate) const GAIN_REGISTER: u8 = 0x00;
/// PMT discriminator threshold DAC register.
pub(crate) const THRESHOLD_REGISTER: u8 = 0x01;

/**
 * Digital lines of the trigger board, addressed by BCM pin number.
 */
pub(crate) trait GpioLines {
    fn write(&mut self, pin: u8, high: bool);
    fn read(&self, pin: u8) -> bool;
}

/**
 * Low speed bus carrying the PMT gain and threshold registers.
 */
pub(crate) trait RegisterBus {
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), BoardError>;
}

/**
 * Everything the calibration engine and the acquisition loop need from the
 * HAPI-E trigger board. Line writes can't fail once the board is open; only
 * range checks and the register bus can.
 */
pub(crate) trait TriggerBoard {
    fn arm(&mut self);
    fn disarm(&mut self);
    fn is_armed(&self) -> bool;
    /// Polls the done line. Never blocks.
    fn is_done(&self) -> bool;
    fn set_trigger_source(&mut self, source: TriggerSource);
    /// Pulses the trigger line. Does nothing unless the source is
    /// `ProgramDriven`.
    fn trigger(&mut self);
    fn set_delay(&mut self, delay: u8) -> Result<(), BoardError>;
    fn set_exposure(&mut self, exposure: u8) -> Result<(), BoardError>;
    fn set_pulse(&mut self, pulse: u8) -> Result<(), BoardError>;
    fn set_pmt_gain(&mut self, gain: u8) -> Result<(), BoardError>;
    fn set_pmt_threshold(&mut self, threshold: u8) -> Result<(), BoardError>;

    fn reset(&mut self) {
        self.arm();
        self.disarm();
    }
}

pub(crate) struct HardwareBoard<L, B, C> {
    lines: L,
    bus: B,
    clock: C,
    pins: PinMap,
    timing: BoardTiming,
    armed: bool,
    source: TriggerSource,
}

pub(crate) type RpiBoard<C> = HardwareBoard<RpiLines, RpiBus, C>;

/**
 * GPIO lines owned through rppal. Output lines start low.
 */
pub(crate) struct RpiLines {
    outputs: HashMap<u8, OutputPin>,
    inputs: HashMap<u8, InputPin>,
}

pub(crate) struct RpiBus {
    i2c: I2c,
}

///////////////////
// Implementations
///////////////////
impl<L: GpioLines, B: RegisterBus, C: Clock> HardwareBoard<L, B, C> {
    pub(crate) fn new(lines: L, bus: B, clock: C, pins: PinMap, timing: BoardTiming) -> Self {
        Self {
            lines,
            bus,
            clock,
            pins,
            timing,
            armed: false,
            source: TriggerSource::SensorDriven,
        }
    }

    fn _settle_line(&self) {
        self.clock.settle(self.timing.line_settle);
    }

    fn _write_register(&mut self, register: u8, value: u8) -> Result<(), BoardError> {
        self.bus.write_register(register, value)?;
        self.clock.settle(self.timing.bus_settle);
        Ok(())
    }

    /// Writes `value` across `pins`, least significant bit on `pins[0]`.
    fn _write_pattern(
        lines: &mut L,
        field: &'static str,
        pins: &[u8],
        value: u8,
    ) -> Result<(), BoardError> {
        if (value as u32) >> pins.len() != 0 {
            return Err(BoardError::ValueTooWide {
                field,
                value: value as u32,
                bits: pins.len(),
            });
        }
        for (bit, pin) in pins.iter().enumerate() {
            lines.write(*pin, (value >> bit) & 1 == 1);
        }
        Ok(())
    }
}

impl<L: GpioLines, B: RegisterBus, C: Clock> TriggerBoard for HardwareBoard<L, B, C> {
    fn arm(&mut self) {
        self.lines.write(self.pins.arm, true);
        self.armed = true;
        self._settle_line();
    }

    fn disarm(&mut self) {
        self.lines.write(self.pins.arm, false);
        self.armed = false;
        self._settle_line();
    }

    fn is_armed(&self) -> bool {
        self.armed
    }

    fn is_done(&self) -> bool {
        self.lines.read(self.pins.done)
    }

    fn set_trigger_source(&mut self, source: TriggerSource) {
        self.lines.write(
            self.pins.trigger_source,
            source == TriggerSource::ProgramDriven,
        );
        self.source = source;
        self._settle_line();
    }

    fn trigger(&mut self) {
        if self.source == TriggerSource::SensorDriven {
            log::debug!("Ignoring program trigger while the PMT drives the board.");
            return;
        }
        self.lines.write(self.pins.trigger, true);
        self._settle_line();
        self.lines.write(self.pins.trigger, false);
        self._settle_line();
    }

    fn set_delay(&mut self, delay: u8) -> Result<(), BoardError> {
        Self::_write_pattern(&mut self.lines, "delay", &self.pins.delay, delay)?;
        self._settle_line();
        Ok(())
    }

    fn set_exposure(&mut self, exposure: u8) -> Result<(), BoardError> {
        Self::_write_pattern(&mut self.lines, "exposure", &self.pins.exp, exposure)?;
        self._settle_line();
        Ok(())
    }

    fn set_pulse(&mut self, pulse: u8) -> Result<(), BoardError> {
        Self::_write_pattern(&mut self.lines, "pulse", &self.pins.pulse, pulse)?;
        self._settle_line();
        Ok(())
    }

    fn set_pmt_gain(&mut self, gain: u8) -> Result<(), BoardError> {
        self._write_register(GAIN_REGISTER, gain)
    }

    fn set_pmt_threshold(&mut self, threshold: u8) -> Result<(), BoardError> {
        self._write_register(THRESHOLD_REGISTER, threshold)
    }
}

impl RpiLines {
    pub(crate) fn open(pins: &PinMap) -> Result<Self, BoardError> {
        let gpio = Gpio::new()?;

        let mut outputs = HashMap::new();
        let output_pins = [pins.arm, pins.trigger, pins.trigger_source]
            .into_iter()
            .chain(pins.delay)
            .chain(pins.exp)
            .chain(pins.pulse);
        for pin in output_pins {
            outputs.insert(pin, gpio.get(pin)?.into_output_low());
        }

        let mut inputs = HashMap::new();
        inputs.insert(pins.done, gpio.get(pins.done)?.into_input());

        Ok(Self { outputs, inputs })
    }
}

impl GpioLines for RpiLines {
    fn write(&mut self, pin: u8, high: bool) {
        match self.outputs.get_mut(&pin) {
            Some(output) => output.write(if high { Level::High } else { Level::Low }),
            None => log::error!("GPIO {} is not configured as an output.", pin),
        }
    }

    fn read(&self, pin: u8) -> bool {
        match self.inputs.get(&pin) {
            Some(input) => input.is_high(),
            None => {
                log::error!("GPIO {} is not configured as an input.", pin);
                false
            }
        }
    }
}

impl RpiBus {
    pub(crate) fn open(bus: u8, address: u16) -> Result<Self, BoardError> {
        let mut i2c = I2c::with_bus(bus)?;
        i2c.set_slave_address(address)?;
        Ok(Self { i2c })
    }
}

impl RegisterBus for RpiBus {
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), BoardError> {
        self.i2c.smbus_write_byte(register, value)?;
        Ok(())
    }
}

/**
 * Opens the GPIO lines and the PMT bus. Failure here means the instrument
 * can't be driven at all.
 */
pub(crate) fn open_rpi_board<C: Clock>(
    settings: &HardwareSettings,
    clock: C,
) -> Result<RpiBoard<C>, BoardError> {
    let lines = RpiLines::open(&settings.pins)?;
    let bus = RpiBus::open(settings.pmt_i2c_bus, settings.pmt_i2c_address)?;
    Ok(HardwareBoard::new(
        lines,
        bus,
        clock,
        settings.pins.clone(),
        settings.timing,
    ))
}

/**
 * Writes the configured timing, PMT operating point and trigger source,
 * then resets the board so it starts disarmed.
 */
pub(crate) fn initialize_board<B: TriggerBoard>(
    board: &mut B,
    settings: &HardwareSettings,
    mode: AcquisitionMode,
) -> Result<(), BoardError> {
    log::info!("Setting delay, exposure, and pulse width.");
    board.set_delay(settings.delay)?;
    board.set_exposure(settings.exp)?;
    board.set_pulse(settings.pulse)?;

    log::info!("Setting PMT gain and threshold.");
    board.set_pmt_gain(settings.pmt_gain)?;
    board.set_pmt_threshold(settings.pmt_threshold)?;

    let source = mode.trigger_source();
    board.set_trigger_source(source);
    match source {
        TriggerSource::ProgramDriven => log::info!("Using PI as trigger source."),
        TriggerSource::SensorDriven => log::info!("Using PMT as trigger source."),
    }

    log::info!("Resetting board.");
    board.reset();
    Ok(())
}
