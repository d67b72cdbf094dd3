//! Pure protocol layer for the HP 3478A multimeter.
//!
//! This module contains the typed command grammar and the decoders for the
//! fixed-width binary replies of the instrument. Nothing in here performs
//! I/O; rendering a command yields the exact bytes to put on the wire and
//! decoding consumes the exact bytes read back. The page numbers in the
//! doc comments refer to the HP 3478A operator's manual.

use bitflags::bitflags;

/// Errors raised by the protocol codecs.
///
/// Out-of-range arguments are rejected here, before any I/O happens.
/// Decode errors only cover malformed framing (wrong length or shape);
/// data-validity conditions are reported through fields, not errors.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("reply has wrong length: expected {expected} bytes, got {actual}")]
    ReplyLength { expected: usize, actual: usize },
    #[error("malformed reply: {0:?}")]
    MalformedReply(Vec<u8>),
    #[error("number of digits out of range: {0}, must be 3, 4 or 5")]
    DigitsOutOfRange(u8),
    #[error("invalid function code: {0}")]
    FunctionCode(u8),
    #[error("invalid range exponent: {0}")]
    RangeExponent(i8),
    #[error("display text must be printable ASCII")]
    DisplayText,
    #[error("NTC parameters must all be positive")]
    NtcParameters,
    #[error("cannot convert resistance {0} to a temperature")]
    ThermistorResistance(f64),
}

/// The measurement functions. `Ntc` and `Ntcf` are pseudo-functions: on the
/// wire they select 2-wire/4-wire resistance, the thermistor conversion
/// happens on the host. See page 55 of the manual for the extended ohms mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionType {
    Dcv = 1,
    Acv = 2,
    Ohm = 3,
    OhmF = 4,
    Dci = 5,
    Aci = 6,
    OhmExt = 7,
    Ntc = 8,
    Ntcf = 9,
}

impl FunctionType {
    /// Decodes the 3-bit function field of the status reply.
    pub fn decode(value: u8) -> Result<Self, Error> {
        Ok(match value {
            1 => FunctionType::Dcv,
            2 => FunctionType::Acv,
            3 => FunctionType::Ohm,
            4 => FunctionType::OhmF,
            5 => FunctionType::Dci,
            6 => FunctionType::Aci,
            7 => FunctionType::OhmExt,
            _ => return Err(Error::FunctionCode(value)),
        })
    }

    /// The function digit sent with the `F` command. The NTC pseudo-functions
    /// map to their underlying resistance modes.
    pub fn wire_code(&self) -> u8 {
        match self {
            FunctionType::Ntc => FunctionType::Ohm as u8,
            FunctionType::Ntcf => FunctionType::OhmF as u8,
            other => *other as u8,
        }
    }

    /// Whether this is a client-side pseudo-function.
    pub fn is_ntc(&self) -> bool {
        matches!(self, FunctionType::Ntc | FunctionType::Ntcf)
    }

    /// The range bits of the status reply are relative to the function in
    /// use; this correction turns them into the absolute exponent of
    /// [`Range`].
    fn range_correction(&self) -> i8 {
        match self {
            FunctionType::Dcv => -3,
            FunctionType::Acv | FunctionType::Dci | FunctionType::Aci => -2,
            FunctionType::Ohm
            | FunctionType::OhmF
            | FunctionType::OhmExt
            | FunctionType::Ntc
            | FunctionType::Ntcf => 1,
        }
    }
}

impl std::fmt::Display for FunctionType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            FunctionType::Dcv => "DCV",
            FunctionType::Acv => "ACV",
            FunctionType::Ohm => "OHM",
            FunctionType::OhmF => "OHMF",
            FunctionType::Dci => "DCI",
            FunctionType::Aci => "ACI",
            FunctionType::OhmExt => "OHM_EXT",
            FunctionType::Ntc => "NTC",
            FunctionType::Ntcf => "NTCF",
        };
        write!(f, "{name}")
    }
}

/// The measurement range. The fixed ranges are named after the full-scale
/// value in the unit of the selected function (volts, amperes or ohms).
/// See page 20 of the manual for details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Range {
    Range30m,
    Range300m,
    Range3,
    Range30,
    Range300,
    Range3k,
    Range30k,
    Range300k,
    Range3Meg,
    Range30Meg,
    Auto,
}

impl Range {
    /// The decimal exponent of the range, `None` for autorange.
    /// `Range30m` is 30e-3, so -2; `Range30Meg` is 30e6, so 7.
    pub fn exponent(&self) -> Option<i8> {
        match self {
            Range::Range30m => Some(-2),
            Range::Range300m => Some(-1),
            Range::Range3 => Some(0),
            Range::Range30 => Some(1),
            Range::Range300 => Some(2),
            Range::Range3k => Some(3),
            Range::Range30k => Some(4),
            Range::Range300k => Some(5),
            Range::Range3Meg => Some(6),
            Range::Range30Meg => Some(7),
            Range::Auto => None,
        }
    }

    pub fn from_exponent(exponent: i8) -> Result<Self, Error> {
        Ok(match exponent {
            -2 => Range::Range30m,
            -1 => Range::Range300m,
            0 => Range::Range3,
            1 => Range::Range30,
            2 => Range::Range300,
            3 => Range::Range3k,
            4 => Range::Range30k,
            5 => Range::Range300k,
            6 => Range::Range3Meg,
            7 => Range::Range30Meg,
            _ => return Err(Error::RangeExponent(exponent)),
        })
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Range::Range30m => "30m",
            Range::Range300m => "300m",
            Range::Range3 => "3",
            Range::Range30 => "30",
            Range::Range300 => "300",
            Range::Range3k => "3k",
            Range::Range30k => "30k",
            Range::Range300k => "300k",
            Range::Range3Meg => "3M",
            Range::Range30Meg => "30M",
            Range::Auto => "auto",
        };
        write!(f, "{name}")
    }
}

/// The triggers supported by the DMM. See page 53 of the manual.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TriggerType {
    Internal = 1,
    External = 2,
    Single = 3,
    Hold = 4,
    Fast = 5,
}

/// The front panel display settings. See page 12 of the manual.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisplayType {
    Normal = 1,
    ShowText = 2,
    ShowTextAndFreeze = 3,
}

/// The position of the front/rear binding posts switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrontRearSwitchPosition {
    Rear = 0,
    Front = 1,
}

impl std::fmt::Display for FrontRearSwitchPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FrontRearSwitchPosition::Rear => write!(f, "rear"),
            FrontRearSwitchPosition::Front => write!(f, "front"),
        }
    }
}

bitflags! {
    /// The device status register. See page 61 of the manual.
    /// Bit 7 is always zero.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u8 {
        const INTERNAL_TRIGGER_ENABLED = 1 << 0;
        const AUTO_RANGE_ENABLED = 1 << 1;
        const AUTO_ZERO_ENABLED = 1 << 2;
        const LINE_FREQUENCY_50_HZ = 1 << 3;
        const FRONT_SWITCH_ENABLED = 1 << 4;
        const CAL_RAM_ENABLED = 1 << 5;
        const EXTERNAL_TRIGGER_ENABLED = 1 << 6;
    }

    /// The service request mask set with the `M` command. See page 47 of
    /// the manual. Bit 1 is always zero.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SrqMask: u8 {
        const DATA_READY = 1 << 0;
        const SYNTAX_ERROR = 1 << 2;
        const HARDWARE_ERROR = 1 << 3;
        const FRONT_PANEL_SRQ = 1 << 4;
        const CALIBRATION_FAILURE = 1 << 5;
    }

    /// The error register, the result of the power-on self-test. See page
    /// 62 of the manual.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ErrorFlags: u8 {
        const CAL_RAM_CHECKSUM = 1 << 0;
        const RAM_FAILURE = 1 << 1;
        const ROM_FAILURE = 1 << 2;
        const AD_SLOPE_CONVERGENCE = 1 << 3;
        const AD_SELFTEST_FAILURE = 1 << 4;
        const AD_LINK_FAILURE = 1 << 5;
    }

    /// The serial poll register as returned by SPOLL. See page 50 of the
    /// manual. Bit 1 is always zero.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SerialPollFlags: u8 {
        const SRQ_ON_DATA_READY = 1 << 0;
        const SRQ_ON_SYNTAX_ERROR = 1 << 2;
        const SRQ_ON_HARDWARE_ERROR = 1 << 3;
        const SRQ_ON_SRQ_BUTTON = 1 << 4;
        const SRQ_ON_CAL_FAILURE = 1 << 5;
        const SRQ_ON_HAS_SRQ = 1 << 6;
        const SRQ_ON_POWER_ON = 1 << 7;
    }
}

/// A decoded snapshot of the device status (`B` query).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DmmStatus {
    pub function: FunctionType,
    pub range: Range,
    pub ndigits: u8,
    pub status: StatusFlags,
    pub srq_flags: SerialPollFlags,
    pub error_flags: ErrorFlags,
    pub dac_value: u8,
}

/// The Steinhart-Hart coefficients of an NTC thermistor plus its
/// resistance at 25 °C. Used to convert resistance readings to a
/// temperature when [`FunctionType::Ntc`] or [`FunctionType::Ntcf`] is
/// selected:
///
/// 1/T = a + b*ln(Rt/R25) + c*ln(Rt/R25)^2 + d*ln(Rt/R25)^3
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NtcParameters {
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    rt25: f64,
}

impl NtcParameters {
    /// All coefficients and the reference resistance must be positive.
    pub fn new(a: f64, b: f64, c: f64, d: f64, rt25: f64) -> Result<Self, Error> {
        if a > 0.0 && b > 0.0 && c > 0.0 && d > 0.0 && rt25 > 0.0 {
            Ok(Self { a, b, c, d, rt25 })
        } else {
            Err(Error::NtcParameters)
        }
    }

    /// Converts a resistance in ohms to a temperature in kelvin.
    pub fn temperature_from_resistance(&self, resistance: f64) -> Result<f64, Error> {
        if resistance <= 0.0 {
            return Err(Error::ThermistorResistance(resistance));
        }
        let x = (resistance / self.rt25).ln();
        Ok(1.0 / (self.a + self.b * x + self.c * x * x + self.d * x * x * x))
    }
}

impl Default for NtcParameters {
    /// Constants of the Amphenol DC95 (Material Type 10kY) thermistor.
    fn default() -> Self {
        Self {
            rt25: 10e3,
            a: 3.3540153e-3,
            b: 2.7867185e-4,
            c: 4.0006637e-6,
            d: 1.5575628e-7,
        }
    }
}

/// Query commands with fixed renderings.
pub const STATUS_QUERY: &[u8] = b"B";
pub const ERROR_REGISTER_QUERY: &[u8] = b"E";
pub const FRONT_REAR_SWITCH_QUERY: &[u8] = b"S";
/// Clears the serial poll register.
pub const CLEAR_SERIAL_POLL_COMMAND: &[u8] = b"K";
/// DCV, autorange, autozero, single trigger, 4.5 digits, buffers erased.
pub const RESET_COMMAND: &[u8] = b"H0";

/// The `B` query returns exactly this many bytes, without a terminator.
pub const STATUS_REPLY_LENGTH: usize = 5;

pub fn function_command(value: FunctionType) -> Vec<u8> {
    format!("F{}", value.wire_code()).into_bytes()
}

pub fn range_command(value: Range) -> Vec<u8> {
    match value.exponent() {
        Some(exponent) => format!("R{exponent}").into_bytes(),
        None => b"RA".to_vec(),
    }
}

pub fn trigger_command(value: TriggerType) -> Vec<u8> {
    format!("T{}", value as u8).into_bytes()
}

/// Renders the display command. In [`DisplayType::Normal`] mode no text is
/// allowed; otherwise the text is trimmed and terminated with a newline as
/// the instrument requires a control character after the text.
pub fn display_command(value: DisplayType, text: &str) -> Result<Vec<u8>, Error> {
    if value == DisplayType::Normal {
        return Ok(format!("D{}", value as u8).into_bytes());
    }
    let text = text.trim_end();
    if !text.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err(Error::DisplayText);
    }
    Ok(format!("D{}{}\n", value as u8, text).into_bytes())
}

pub fn autozero_command(enable: bool) -> Vec<u8> {
    if enable {
        b"Z1".to_vec()
    } else {
        b"Z0".to_vec()
    }
}

/// Renders the `N` command. The instrument displays 3.5 to 5.5 digits;
/// anything outside 3..=5 is rejected before any I/O takes place.
pub fn number_of_digits_command(digits: u8) -> Result<Vec<u8>, Error> {
    if !(3..=5).contains(&digits) {
        return Err(Error::DigitsOutOfRange(digits));
    }
    Ok(format!("N{digits}").into_bytes())
}

/// The SRQ mask is sent as a two-digit octal number.
pub fn srq_mask_command(mask: SrqMask) -> Vec<u8> {
    format!("M{:02o}", mask.bits()).into_bytes()
}

/// Reads one byte of the calibration NVRAM. Undocumented command.
pub fn cal_read_command(address: u8) -> [u8; 2] {
    [b'W', address]
}

/// Writes one byte of the calibration NVRAM. Undocumented command; only
/// honored when the front panel CAL switch is enabled.
pub fn cal_write_command(address: u8, value: u8) -> [u8; 3] {
    [b'X', address, value]
}

/// Decodes the 5-byte binary status reply of the `B` query.
pub fn decode_status(bytes: &[u8]) -> Result<DmmStatus, Error> {
    if bytes.len() != STATUS_REPLY_LENGTH {
        return Err(Error::ReplyLength {
            expected: STATUS_REPLY_LENGTH,
            actual: bytes.len(),
        });
    }
    let function = FunctionType::decode((bytes[0] >> 5) & 0b111)?;
    let range_bits = ((bytes[0] >> 2) & 0b111) as i8;
    Ok(DmmStatus {
        function,
        range: Range::from_exponent(range_bits + function.range_correction())?,
        ndigits: 6 - (bytes[0] & 0b11),
        status: StatusFlags::from_bits_truncate(bytes[1]),
        srq_flags: SerialPollFlags::from_bits_truncate(bytes[2]),
        error_flags: ErrorFlags::from_bits_truncate(bytes[3]),
        dac_value: bytes[4],
    })
}

/// Decodes the reply of the `E` query, a two-digit octal ASCII number.
pub fn decode_error_register(bytes: &[u8]) -> Result<ErrorFlags, Error> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::MalformedReply(bytes.to_vec()))?
        .trim();
    let value = u8::from_str_radix(text, 8).map_err(|_| Error::MalformedReply(bytes.to_vec()))?;
    Ok(ErrorFlags::from_bits_truncate(value))
}

/// Decodes the single-byte serial poll reply.
pub fn decode_serial_poll(byte: u8) -> SerialPollFlags {
    SerialPollFlags::from_bits_truncate(byte)
}

/// Decodes the reply of the `S` query.
pub fn decode_front_rear_switch(bytes: &[u8]) -> Result<FrontRearSwitchPosition, Error> {
    match std::str::from_utf8(bytes).map(str::trim) {
        Ok("0") => Ok(FrontRearSwitchPosition::Rear),
        Ok("1") => Ok(FrontRearSwitchPosition::Front),
        _ => Err(Error::MalformedReply(bytes.to_vec())),
    }
}

/// A decoded measurement reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Value(f64),
    /// The instrument returned the overload sentinel.
    Overload,
}

/// The instrument answers overloaded inputs with this sentinel.
const OVERLOAD_SENTINEL: &[u8] = b"+9.99999E+9";

/// Decodes an ASCII reading of the form `[+-]d.dddddE[+-]d`. A trailing
/// line terminator is tolerated.
pub fn decode_reading(bytes: &[u8]) -> Result<Reading, Error> {
    let bytes = bytes
        .strip_suffix(b"\r\n")
        .or_else(|| bytes.strip_suffix(b"\n"))
        .unwrap_or(bytes);
    if bytes == OVERLOAD_SENTINEL {
        return Ok(Reading::Overload);
    }
    if !is_numeric_reply(bytes) {
        return Err(Error::MalformedReply(bytes.to_vec()));
    }
    // The shape check guarantees plain ASCII.
    let text = std::str::from_utf8(bytes).map_err(|_| Error::MalformedReply(bytes.to_vec()))?;
    text.parse::<f64>()
        .map(Reading::Value)
        .map_err(|_| Error::MalformedReply(bytes.to_vec()))
}

/// Matches `^[+-]\d+\.\d+E[+-]\d$`, the reading format of the instrument.
fn is_numeric_reply(bytes: &[u8]) -> bool {
    let mut rest = match bytes.first() {
        Some(b'+') | Some(b'-') => &bytes[1..],
        _ => return false,
    };
    let mantissa_len = rest.iter().take_while(|b| b.is_ascii_digit()).count();
    if mantissa_len == 0 {
        return false;
    }
    rest = &rest[mantissa_len..];
    if rest.first() != Some(&b'.') {
        return false;
    }
    rest = &rest[1..];
    let fraction_len = rest.iter().take_while(|b| b.is_ascii_digit()).count();
    if fraction_len == 0 {
        return false;
    }
    rest = &rest[fraction_len..];
    matches!(rest, [b'E', b'+' | b'-', digit] if digit.is_ascii_digit())
}
