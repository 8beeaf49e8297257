use std::{
    io::{BufRead, BufReader, Write},
    time::Duration,
};

use serialport::SerialPort;

use crate::{error::LaserError, user_config::parse_literal};

/// Bit field of active laser faults; zero means healthy.
pub(crate) type FaultCode = u32;

const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// OBIS fault bits and what they mean.
const FAULT_BITS: [(FaultCode, &str); 20] = [
    (0x000001, "Base plate temperature out of range"),
    (0x000002, "Diode temperature out of range"),
    (0x000004, "Internal temperature out of range"),
    (0x000008, "No electrical power to laser diode"),
    (0x000010, "I2C bus error"),
    (0x000020, "Diode over current"),
    (0x000040, "EEPROM checksum error in at least one section"),
    (0x000080, "EEPROM was restored to default settings"),
    (0x000100, "Bus message buffer overflow"),
    (0x000200, "Warm-up time limit exceeded"),
    (0x000400, "TE controller driver failure"),
    (0x000800, "RS-485 bus error"),
    (0x001000, "Diode temperature off by > 5C from set point"),
    (0x002000, "Fail to emit at set power level"),
    (0x004000, "Negative photodiode readout"),
    (0x008000, "Irrecoverable system failure"),
    (0x010000, "Errors encountered during firmware startup"),
    (0x020000, "Firmware resumed from watchdog reset"),
    (0x040000, "Errors encountered during field calibration"),
    (0x100000, "Output power above limit"),
];

/**
 * What the acquisition loop needs from the illumination laser.
 */
pub(crate) trait Laser {
    fn fault(&mut self) -> Result<FaultCode, LaserError>;
    fn set_emission(&mut self, on: bool) -> Result<(), LaserError>;
}

/**
 * Coherent OBIS diode laser on a USB serial port, driven with handshaking on
 * so every command is acknowledged with `OK`.
 */
pub(crate) struct ObisLaser {
    writer: Box<dyn SerialPort>,
    reader: BufReader<Box<dyn SerialPort>>,
}

///////////////////
// Implementations
///////////////////

/// Human readable names of every fault bit set in `fault`.
pub(crate) fn describe_faults(fault: FaultCode) -> Vec<&'static str> {
    FAULT_BITS
        .iter()
        .filter(|(bit, _)| fault & bit != 0)
        .map(|(_, description)| *description)
        .collect()
}

impl ObisLaser {
    pub(crate) fn open(device: &str, baud: u32) -> Result<Self, LaserError> {
        let writer = serialport::new(device, baud)
            .timeout(RESPONSE_TIMEOUT)
            .open()?;
        let reader = BufReader::new(writer.try_clone()?);
        Ok(Self { writer, reader })
    }

    /**
     * Puts the laser into digital modulation so the board's pulse line gates
     * emission, and turns it on. A laser that reports a fault afterwards is
     * not usable.
     */
    pub(crate) fn initialize(&mut self) -> Result<(), LaserError> {
        self._command("syst:comm:hand on")?;
        self._command("syst:cdrh off")?;
        self._command("sour:am:ext dig")?;
        self._command("syst:aut on")?;
        self.set_emission(true)?;

        log::info!("Laser info:");
        log::info!("    IDN: {}", self._query("*idn?")?);
        log::info!("    Wavelength: {}", self._query("syst:inf:wav?")?);
        log::info!("    Laser hours: {}", self._query("syst:hour?")?);

        let fault = self.fault()?;
        if fault != 0 {
            for description in describe_faults(fault) {
                log::error!("Laser fault: {}", description);
            }
            return Err(LaserError::Fault(fault));
        }
        Ok(())
    }

    fn _send(&mut self, command: &str) -> Result<Vec<String>, LaserError> {
        self.writer.write_all(format!("{command}\r\n").as_bytes())?;
        self.writer.flush()?;

        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line)?;
            let line = line.trim();
            if line == "OK" {
                return Ok(lines);
            }
            if line.starts_with("ERR") || line.is_empty() {
                return Err(LaserError::BadResponse {
                    command: String::from(command),
                    response: String::from(line),
                });
            }
            lines.push(String::from(line));
        }
    }

    fn _command(&mut self, command: &str) -> Result<(), LaserError> {
        self._send(command).map(|_| ())
    }

    fn _query(&mut self, query: &str) -> Result<String, LaserError> {
        let mut lines = self._send(query)?;
        if lines.is_empty() {
            return Err(LaserError::BadResponse {
                command: String::from(query),
                response: String::from("OK"),
            });
        }
        Ok(lines.remove(0))
    }
}

impl Laser for ObisLaser {
    fn fault(&mut self) -> Result<FaultCode, LaserError> {
        let response = self._query("syst:faul?")?;
        parse_literal(&response)
            .and_then(|code| FaultCode::try_from(code).ok())
            .ok_or(LaserError::BadResponse {
                command: String::from("syst:faul?"),
                response,
            })
    }

    fn set_emission(&mut self, on: bool) -> Result<(), LaserError> {
        self._command(if on { "sour:am:stat on" } else { "sour:am:stat off" })
    }
}
