//! DI-245 command frame encoding.
//!
//! The DI-245 uses two framings:
//! - **Long commands** (`chn`, `xrate`): space separated ASCII arguments terminated by a
//!   carriage return. The device echoes the whole frame once the CR arrives.
//! - **Short commands** (two characters): preceded by a null byte, no terminator. The null
//!   is not echoed, each command character is.
//!
//! Everything here is pure; writing frames is the transport's job.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AppResult, DaqError};

/// Internal clock of the device used by the burst rate formula.
pub const BASE_RATE_HZ: f64 = 8000.0;

/// Highest physical channel number representable in the 4-bit channel field.
pub const MAX_PHYSICAL_CHANNEL: u8 = 15;

/// Framing of a command on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `name arg arg \r`, echoed in full.
    Long,
    /// `\0XY`, only `XY` is echoed.
    Short,
}

/// An encoded command ready to be written to the port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    bytes: Vec<u8>,
    kind: FrameKind,
}

impl CommandFrame {
    fn long(text: String) -> Self {
        Self {
            bytes: text.into_bytes(),
            kind: FrameKind::Long,
        }
    }

    fn short(code: [u8; 2]) -> Self {
        Self {
            bytes: vec![0x00, code[0], code[1]],
            kind: FrameKind::Short,
        }
    }

    /// Raw bytes to write.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Framing of this command.
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Bytes the device sends back when it accepts the command.
    pub fn echo(&self) -> &[u8] {
        match self.kind {
            FrameKind::Long => &self.bytes,
            FrameKind::Short => &self.bytes[1..],
        }
    }

    /// Printable form without the null prefix and CR terminator, for logs and errors.
    pub fn label(&self) -> String {
        String::from_utf8_lossy(self.echo()).trim().to_string()
    }
}

impl fmt::Display for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Input range or thermocouple type of a channel.
///
/// The discriminant is the 5-bit code the device expects in bits 8..=12 of the channel
/// configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[repr(u8)]
pub enum GainCode {
    /// ±10 mV
    Millivolts10 = 0b00101,
    /// ±25 mV
    Millivolts25 = 0b00100,
    /// ±50 mV
    Millivolts50 = 0b00011,
    /// ±100 mV
    Millivolts100 = 0b00010,
    /// ±250 mV
    Millivolts250 = 0b00001,
    /// ±500 mV
    Millivolts500 = 0b00000,
    /// ±1 V
    Volts1 = 0b01101,
    /// ±2.5 V
    Volts2p5 = 0b01100,
    /// ±5 V
    Volts5 = 0b01011,
    /// ±10 V
    Volts10 = 0b01010,
    /// ±25 V
    Volts25 = 0b01001,
    /// ±50 V
    Volts50 = 0b01000,
    /// Type B thermocouple
    ThermocoupleB = 0b10000,
    /// Type E thermocouple
    ThermocoupleE = 0b10001,
    /// Type J thermocouple
    ThermocoupleJ = 0b10010,
    /// Type K thermocouple
    ThermocoupleK = 0b10011,
    /// Type N thermocouple
    ThermocoupleN = 0b10100,
    /// Type R thermocouple
    ThermocoupleR = 0b10101,
    /// Type S thermocouple
    ThermocoupleS = 0b10110,
    /// Type T thermocouple
    ThermocoupleT = 0b10111,
}

/// Voltage ranges in full-scale volts, in the order of the device manual.
const VOLTAGE_RANGES: [(f64, GainCode); 12] = [
    (0.010, GainCode::Millivolts10),
    (0.025, GainCode::Millivolts25),
    (0.05, GainCode::Millivolts50),
    (0.1, GainCode::Millivolts100),
    (0.25, GainCode::Millivolts250),
    (0.5, GainCode::Millivolts500),
    (1.0, GainCode::Volts1),
    (2.5, GainCode::Volts2p5),
    (5.0, GainCode::Volts5),
    (10.0, GainCode::Volts10),
    (25.0, GainCode::Volts25),
    (50.0, GainCode::Volts50),
];

const THERMOCOUPLES: [(char, GainCode); 8] = [
    ('B', GainCode::ThermocoupleB),
    ('E', GainCode::ThermocoupleE),
    ('J', GainCode::ThermocoupleJ),
    ('K', GainCode::ThermocoupleK),
    ('N', GainCode::ThermocoupleN),
    ('R', GainCode::ThermocoupleR),
    ('S', GainCode::ThermocoupleS),
    ('T', GainCode::ThermocoupleT),
];

impl GainCode {
    /// All codes known to the device.
    pub const ALL: [GainCode; 20] = [
        GainCode::Millivolts10,
        GainCode::Millivolts25,
        GainCode::Millivolts50,
        GainCode::Millivolts100,
        GainCode::Millivolts250,
        GainCode::Millivolts500,
        GainCode::Volts1,
        GainCode::Volts2p5,
        GainCode::Volts5,
        GainCode::Volts10,
        GainCode::Volts25,
        GainCode::Volts50,
        GainCode::ThermocoupleB,
        GainCode::ThermocoupleE,
        GainCode::ThermocoupleJ,
        GainCode::ThermocoupleK,
        GainCode::ThermocoupleN,
        GainCode::ThermocoupleR,
        GainCode::ThermocoupleS,
        GainCode::ThermocoupleT,
    ];

    /// The 5-bit device code.
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// Look up a raw 5-bit code.
    pub fn from_bits(bits: u8) -> AppResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|code| code.bits() == bits)
            .ok_or_else(|| DaqError::UnknownSensorCode(format!("{bits:#07b}")))
    }

    /// Full-scale range in volts, `None` for thermocouple inputs.
    pub fn full_scale_volts(self) -> Option<f64> {
        VOLTAGE_RANGES
            .iter()
            .find(|(_, code)| *code == self)
            .map(|(volts, _)| *volts)
    }

    /// Whether the channel measures a thermocouple.
    pub fn is_thermocouple(self) -> bool {
        self.bits() & 0b10000 != 0
    }

    /// Canonical tag, accepted back by [`FromStr`].
    pub fn tag(self) -> String {
        if let Some(volts) = self.full_scale_volts() {
            return format!("{volts}");
        }
        let letter = THERMOCOUPLES
            .iter()
            .find(|(_, code)| *code == self)
            .map(|(letter, _)| *letter)
            .unwrap_or('?');
        format!("{letter}-type")
    }
}

impl FromStr for GainCode {
    type Err = DaqError;

    /// Accepts full-scale volts (`"0.010"`, `"2.5"`, `"5"`) and thermocouple tags
    /// (`"N"`, `"N-type"`, `"N-thrmc"`, case insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim();
        if let Ok(volts) = tag.parse::<f64>() {
            return VOLTAGE_RANGES
                .iter()
                .find(|(range, _)| (range - volts).abs() < 1e-9)
                .map(|(_, code)| *code)
                .ok_or_else(|| DaqError::UnknownSensorCode(tag.to_string()));
        }

        let upper = tag.to_ascii_uppercase();
        let letter = upper
            .strip_suffix("-TYPE")
            .or_else(|| upper.strip_suffix("-THRMC"))
            .unwrap_or(&upper);
        let mut chars = letter.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => THERMOCOUPLES
                .iter()
                .find(|(l, _)| *l == c)
                .map(|(_, code)| *code)
                .ok_or_else(|| DaqError::UnknownSensorCode(tag.to_string())),
            _ => Err(DaqError::UnknownSensorCode(tag.to_string())),
        }
    }
}

impl TryFrom<String> for GainCode {
    type Error = DaqError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GainCode> for String {
    fn from(code: GainCode) -> Self {
        code.tag()
    }
}

impl fmt::Display for GainCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.full_scale_volts() {
            Some(volts) if volts < 1.0 => write!(f, "±{} mV", volts * 1000.0),
            Some(volts) => write!(f, "±{volts} V"),
            None => f.write_str(&self.tag()),
        }
    }
}

/// Configuration value of a channel: `000 ccccc 0000 pppp`.
pub fn channel_config_value(physical_channel: u8, code: GainCode) -> AppResult<u16> {
    if physical_channel > MAX_PHYSICAL_CHANNEL {
        return Err(DaqError::InvalidChannel(physical_channel));
    }
    Ok((u16::from(code.bits()) << 8) | u16::from(physical_channel))
}

/// Encode `chn <scan_position> <value> \r`.
pub fn encode_channel_config(
    scan_position: u8,
    physical_channel: u8,
    code: GainCode,
) -> AppResult<CommandFrame> {
    let value = channel_config_value(physical_channel, code)?;
    Ok(CommandFrame::long(format!("chn {scan_position} {value} \r")))
}

/// Encode `xrate <config_value> <burst_hz> \r`.
///
/// `config_value` must equal `SF + AF*256` for the divisors that give
/// `burst_hz = 8000 / ((SF+1)*(AF+3))`; see [`RateConfig`] for computing both.
pub fn encode_rate(config_value: u16, burst_hz: u32) -> CommandFrame {
    CommandFrame::long(format!("xrate {config_value} {burst_hz} \r"))
}

/// Encode a two character short command.
pub fn encode_query(code: [u8; 2]) -> CommandFrame {
    CommandFrame::short(code)
}

/// Start scanning: the device answers with a continuous binary stream.
pub fn encode_start() -> CommandFrame {
    CommandFrame::short(*b"S1")
}

/// Stop scanning.
pub fn encode_stop() -> CommandFrame {
    CommandFrame::short(*b"S0")
}

/// Descriptor queries issued once at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryCode {
    /// `A1`: device name.
    DeviceName,
    /// `A2`: firmware version.
    FirmwareVersion,
    /// `A7`: last calibration date, hex encoded.
    CalibrationDate,
    /// `NZ`: serial number.
    SerialNumber,
}

impl QueryCode {
    /// Two character command code.
    pub fn code(self) -> [u8; 2] {
        match self {
            QueryCode::DeviceName => *b"A1",
            QueryCode::FirmwareVersion => *b"A2",
            QueryCode::CalibrationDate => *b"A7",
            QueryCode::SerialNumber => *b"NZ",
        }
    }

    /// Encoded frame.
    pub fn frame(self) -> CommandFrame {
        encode_query(self.code())
    }
}

/// Sampling/averaging divisors that set the burst (scan) rate.
///
/// `burst_hz = 8000 / ((SF + 1) * (AF + 3))` and the device receives `SF + AF*256`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateConfig {
    /// SF
    pub sampling_divisor: u8,
    /// AF
    pub averaging_divisor: u8,
}

impl Default for RateConfig {
    /// 10 Hz: SF = 79, AF = 7.
    fn default() -> Self {
        Self::from_divisors(79, 7)
    }
}

impl RateConfig {
    /// Build from SF and AF.
    pub fn from_divisors(sampling_divisor: u8, averaging_divisor: u8) -> Self {
        Self {
            sampling_divisor,
            averaging_divisor,
        }
    }

    /// Split a device configuration value back into SF and AF.
    pub fn from_config_value(value: u16) -> Self {
        let [sampling_divisor, averaging_divisor] = value.to_le_bytes();
        Self::from_divisors(sampling_divisor, averaging_divisor)
    }

    /// `SF + AF*256`
    pub fn config_value(&self) -> u16 {
        u16::from(self.sampling_divisor) + u16::from(self.averaging_divisor) * 256
    }

    /// Scan cycles per second.
    pub fn burst_hz(&self) -> f64 {
        let sf = f64::from(self.sampling_divisor) + 1.0;
        let af = f64::from(self.averaging_divisor) + 3.0;
        BASE_RATE_HZ / (sf * af)
    }

    /// Divisors whose burst rate is closest to `target_hz`.
    ///
    /// Ties go to the larger averaging divisor, which gives quieter readings at the same
    /// rate.
    pub fn nearest(target_hz: f64) -> AppResult<Self> {
        if !target_hz.is_finite() || target_hz <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "burst rate must be a positive number of Hz, got {target_hz}"
            )));
        }

        let mut best = Self::from_divisors(0, 0);
        let mut best_error = f64::INFINITY;
        for af in 0..=u8::MAX {
            for sf in 0..=u8::MAX {
                let candidate = Self::from_divisors(sf, af);
                let error = (candidate.burst_hz() - target_hz).abs();
                if error <= best_error + 1e-12 {
                    best = candidate;
                    best_error = error;
                }
            }
        }
        Ok(best)
    }

    /// `xrate` frame for these divisors, burst rate rounded to whole Hz.
    pub fn encode(&self) -> CommandFrame {
        encode_rate(self.config_value(), self.burst_hz().round() as u32)
    }
}

impl fmt::Display for RateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SF={} AF={} ({} -> {:.3} Hz)",
            self.sampling_divisor,
            self.averaging_divisor,
            self.config_value(),
            self.burst_hz()
        )
    }
}
