//! Register layout of the Diematic regulator.
//!
//! The tables below are the only place that knows which registers exist.
//! They are immutable and shared through [`DIEMATIC`].
use crate::{Error, Result};
use std::fmt;
use tokio_modbus::{Address, Quantity};

/// A contiguous range of registers fetched with one read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBlock {
    pub start: Address,
    pub count: Quantity,
}

impl ReadBlock {
    pub const fn new(start: Address, count: Quantity) -> Self {
        Self { start, count }
    }

    /// One past the last register, widened so blocks may end at `0xFFFF`.
    pub fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.count)
    }

    pub fn contains(&self, address: Address) -> bool {
        (u32::from(self.start)..self.end()).contains(&u32::from(address))
    }

    /// Number of data bytes the device returns for this block.
    pub fn byte_count(&self) -> usize {
        2 * usize::from(self.count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterEntry {
    pub address: Address,
    pub name: &'static str,
    /// Divisor turning the raw value into the published unit.
    pub scale: u16,
}

const fn entry(address: Address, name: &'static str, scale: u16) -> RegisterEntry {
    RegisterEntry {
        address,
        name,
        scale,
    }
}

/// How a bus payload is turned into a register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Decimal number multiplied by 10 and truncated, e.g. a temperature.
    Tenths,
    /// Plain unsigned integer, e.g. a mode code.
    Integer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritableParameter {
    pub name: &'static str,
    pub address: Address,
    pub encoding: Encoding,
}

/// A write to be sent to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCommand {
    pub address: Address,
    pub values: Vec<u16>,
}

impl WritableParameter {
    /// Parses a bus payload into a write command for this parameter.
    pub fn encode(&self, payload: &str) -> Result<WriteCommand> {
        let invalid = || Error::InvalidValue {
            parameter: self.name.to_string(),
            value: payload.to_string(),
        };
        let payload = payload.trim();
        let value = match self.encoding {
            Encoding::Integer => payload.parse::<u16>().map_err(|_| invalid())?,
            Encoding::Tenths => {
                let value = payload.parse::<f64>().map_err(|_| invalid())?;
                // The epsilon keeps inputs like "20.3" from truncating to 202.
                let tenths = (value * 10.0 + 1e-6).trunc();
                if value < 0.0 || !tenths.is_finite() || tenths > f64::from(u16::MAX) {
                    return Err(invalid());
                }
                tenths as u16
            }
        };
        Ok(WriteCommand {
            address: self.address,
            values: vec![value],
        })
    }
}

/// A decoded register value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Unscaled register content.
    Raw(u16),
    Scaled(f64),
}

impl Value {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Raw(raw) => f64::from(raw),
            Value::Scaled(value) => value,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Raw(raw) => write!(f, "{raw}"),
            // Whole numbers keep their ".0".
            Value::Scaled(value) => write!(f, "{value:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub name: &'static str,
    pub value: Value,
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Applies a register scale: scale 1 keeps the raw value, anything else divides.
pub fn scale_value(raw: u16, scale: u16) -> Value {
    if scale <= 1 {
        Value::Raw(raw)
    } else {
        Value::Scaled(f64::from(raw) / f64::from(scale))
    }
}

pub const POWER_NAME: &str = "power";
pub const IONIZATION_CURRENT_REG_ADDR: Address = 451;
pub const RPM_REG_ADDR: Address = 455;
/// Fan speed at full burner load.
pub const POWER_FULL_LOAD_RPM: f64 = 5900.0;
/// Burner output in kW at full load.
pub const POWER_FULL_LOAD_KW: f64 = 24.5;

/// Burner output derived from the fan speed, zero while no flame is detected.
pub fn burner_power(ionization_current: u16, rpm: u16) -> f64 {
    if ionization_current == 0 {
        0.0
    } else {
        f64::from(rpm) / POWER_FULL_LOAD_RPM * POWER_FULL_LOAD_KW
    }
}

pub static READ_BLOCKS: [ReadBlock; 3] = [
    ReadBlock::new(7, 14),
    ReadBlock::new(89, 8),
    ReadBlock::new(427, 33),
];

/// Published registers, sorted by address.
pub static REGISTERS: [RegisterEntry; 24] = [
    entry(7, "exttemp", 10),
    entry(8, "sumwintemp", 10),
    entry(9, "antifreezeexttemp", 10),
    entry(10, "onoffstatepump", 1),
    entry(11, "speedpump", 1),
    entry(13, "daysantifreeze", 1),
    entry(14, "daytemp", 10),
    entry(15, "nighttemp", 10),
    entry(16, "antifreezetemp", 10),
    entry(17, "mode", 1),
    entry(20, "slope", 10),
    entry(89, "baseecs", 1),
    entry(94, "telecmd1", 1),
    entry(95, "telecmd2", 1),
    entry(96, "watertempnight", 10),
    entry(437, "onoffboilerflow", 1),
    entry(438, "largetemp", 10),
    entry(451, "ionizationcurrent", 10),
    entry(452, "supplytemp", 10),
    entry(453, "returntemp", 10),
    entry(454, "exhausttemp", 10),
    entry(455, "rpm", 1),
    entry(456, "pressure", 10),
    entry(459, "watertemp", 10),
];

pub static WRITABLE_PARAMETERS: [WritableParameter; 7] = [
    WritableParameter {
        name: "sumwin",
        address: 8,
        encoding: Encoding::Tenths,
    },
    WritableParameter {
        name: "daytemp",
        address: 14,
        encoding: Encoding::Tenths,
    },
    WritableParameter {
        name: "nighttemp",
        address: 15,
        encoding: Encoding::Tenths,
    },
    WritableParameter {
        name: "mode",
        address: 17,
        encoding: Encoding::Integer,
    },
    WritableParameter {
        name: "telecmd1",
        address: 94,
        encoding: Encoding::Integer,
    },
    WritableParameter {
        name: "telecmd2",
        address: 95,
        encoding: Encoding::Integer,
    },
    WritableParameter {
        name: "watertempnight",
        address: 96,
        encoding: Encoding::Tenths,
    },
];

/// The register map of one controller family.
#[derive(Debug)]
pub struct RegisterMap {
    blocks: &'static [ReadBlock],
    entries: &'static [RegisterEntry],
    writable: &'static [WritableParameter],
}

/// Register map of the Diematic regulator.
pub static DIEMATIC: RegisterMap =
    RegisterMap::new(&READ_BLOCKS, &REGISTERS, &WRITABLE_PARAMETERS);

impl RegisterMap {
    /// `entries` must be sorted by address.
    pub const fn new(
        blocks: &'static [ReadBlock],
        entries: &'static [RegisterEntry],
        writable: &'static [WritableParameter],
    ) -> Self {
        Self {
            blocks,
            entries,
            writable,
        }
    }

    pub fn blocks_to_poll(&self) -> &'static [ReadBlock] {
        self.blocks
    }

    pub fn entries(&self) -> &'static [RegisterEntry] {
        self.entries
    }

    pub fn writable_parameters(&self) -> &'static [WritableParameter] {
        self.writable
    }

    pub fn entry(&self, address: Address) -> Option<&'static RegisterEntry> {
        self.entries
            .binary_search_by_key(&address, |entry| entry.address)
            .ok()
            .map(|index| &self.entries[index])
    }

    pub fn writable(&self, name: &str) -> Option<&'static WritableParameter> {
        self.writable.iter().find(|parameter| parameter.name == name)
    }

    /// Finds the configured block whose reply carries `byte_count` data bytes.
    pub fn block_for_byte_count(&self, byte_count: usize) -> Option<&'static ReadBlock> {
        self.blocks
            .iter()
            .find(|block| block.byte_count() == byte_count)
    }

    /// Decodes the register data of a read reply starting at `start`.
    ///
    /// Unmapped addresses are skipped. The derived burner power follows the
    /// rpm register when the ionization current was part of the same payload.
    pub fn decode(&self, start: Address, payload: &[u8]) -> Vec<Measurement> {
        let mut measurements = Vec::new();
        let mut ionization_current = None;
        for (index, word) in payload.chunks_exact(2).enumerate() {
            let address = start.wrapping_add(index as u16);
            let raw = u16::from_be_bytes([word[0], word[1]]);
            if let Some(entry) = self.entry(address) {
                measurements.push(Measurement {
                    name: entry.name,
                    value: scale_value(raw, entry.scale),
                });
            }
            match address {
                IONIZATION_CURRENT_REG_ADDR => ionization_current = Some(raw),
                RPM_REG_ADDR => {
                    if let Some(current) = ionization_current {
                        measurements.push(Measurement {
                            name: POWER_NAME,
                            value: Value::Scaled(burner_power(current, raw)),
                        });
                    }
                }
                _ => {}
            }
        }
        measurements
    }
}
