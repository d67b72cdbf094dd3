use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use hp3478a_lib::protocol as proto;
use std::path::PathBuf;
use std::time::Duration;

fn parse_function(s: &str) -> Result<proto::FunctionType, String> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "dcv" => proto::FunctionType::Dcv,
        "acv" => proto::FunctionType::Acv,
        "ohm" | "2w-ohm" => proto::FunctionType::Ohm,
        "ohmf" | "4w-ohm" => proto::FunctionType::OhmF,
        "dci" => proto::FunctionType::Dci,
        "aci" => proto::FunctionType::Aci,
        "ohm-ext" => proto::FunctionType::OhmExt,
        "ntc" => proto::FunctionType::Ntc,
        "ntcf" => proto::FunctionType::Ntcf,
        _ => {
            return Err(format!(
                "Unknown function '{s}'. Supported: dcv, acv, ohm, ohmf, dci, aci, ohm-ext, ntc, ntcf."
            ));
        }
    })
}

// Case-sensitive on the multiplier: "30m" is 30 milli, "30M" is 30 mega.
fn parse_range(s: &str) -> Result<proto::Range, String> {
    Ok(match s {
        "auto" => proto::Range::Auto,
        "30m" => proto::Range::Range30m,
        "300m" => proto::Range::Range300m,
        "3" => proto::Range::Range3,
        "30" => proto::Range::Range30,
        "300" => proto::Range::Range300,
        "3k" => proto::Range::Range3k,
        "30k" => proto::Range::Range30k,
        "300k" => proto::Range::Range300k,
        "3M" => proto::Range::Range3Meg,
        "30M" => proto::Range::Range30Meg,
        _ => {
            return Err(format!(
                "Unknown range '{s}'. Supported: auto, 30m, 300m, 3, 30, 300, 3k, 30k, 300k, 3M, 30M."
            ));
        }
    })
}

fn parse_trigger(s: &str) -> Result<proto::TriggerType, String> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "internal" => proto::TriggerType::Internal,
        "external" => proto::TriggerType::External,
        "single" => proto::TriggerType::Single,
        "hold" => proto::TriggerType::Hold,
        "fast" => proto::TriggerType::Fast,
        _ => {
            return Err(format!(
                "Unknown trigger '{s}'. Supported: internal, external, single, hold, fast."
            ));
        }
    })
}

fn parse_gpib_address(s: &str) -> Result<u8, String> {
    let address = s
        .parse::<u8>()
        .map_err(|e| format!("Invalid GPIB address format: {e}"))?;
    if address > 30 {
        return Err(format!(
            "GPIB address {address} out of range, must be 0 to 30."
        ));
    }
    Ok(address)
}

fn parse_digits(s: &str) -> Result<u8, String> {
    let digits = s
        .parse::<u8>()
        .map_err(|e| format!("Invalid digit count format: {e}"))?;
    if !(3..=5).contains(&digits) {
        return Err(format!("Digit count {digits} out of range, must be 3 to 5."));
    }
    Ok(digits)
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCalCommands {
    /// Read the full calibration memory and save it to a file.
    /// The file holds the raw 256-byte nibble-armored block as read from
    /// the instrument (printable ASCII).
    #[clap(verbatim_doc_comment)]
    Backup {
        /// Destination file for the calibration image.
        file: PathBuf,
    },

    /// Write a previously saved calibration image back to the instrument.
    /// The front panel CAL ENABLE switch must be in the enabled position,
    /// otherwise the instrument silently discards the writes.
    /// **Warning:** Writing a wrong image destroys the calibration.
    #[clap(verbatim_doc_comment)]
    Restore {
        /// Calibration image file created by the `backup` command.
        file: PathBuf,
    },

    /// Read the calibration memory and display the decoded entries:
    /// per-entry offset, gain and checksum validity.
    Show,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Trigger and read a single measurement with the current instrument
    /// settings (or the function/range given as options).
    Read {
        /// Measurement function to select before reading.
        /// Supported: dcv, acv, ohm, ohmf, dci, aci, ohm-ext, ntc, ntcf.
        /// The ntc/ntcf functions measure resistance and report the
        /// temperature of an Amphenol DC95 10k thermistor in Kelvin.
        #[arg(short, long, value_parser = parse_function, verbatim_doc_comment)]
        function: Option<proto::FunctionType>,

        /// Measurement range to select before reading.
        /// Supported: auto, 30m, 300m, 3, 30, 300, 3k, 30k, 300k, 3M, 30M.
        #[arg(short, long, value_parser = parse_range, verbatim_doc_comment)]
        range: Option<proto::Range>,
    },

    /// Continuously read measurements and print them to standard output.
    /// The data-ready service request is used for pacing, so readings are
    /// never skipped or read twice.
    #[clap(verbatim_doc_comment)]
    Monitor {
        /// Measurement function to select before reading.
        #[arg(short, long, value_parser = parse_function)]
        function: Option<proto::FunctionType>,

        /// Measurement range to select before reading.
        #[arg(short, long, value_parser = parse_range)]
        range: Option<proto::Range>,
    },

    /// Read and display the decoded status register: function, range,
    /// digits and the instrument status flags.
    Status,

    /// Read and display the error register (power-on self-test result).
    ErrorRegister,

    /// Display whether the front or rear binding posts are selected.
    SwitchPosition,

    /// Select the measurement function.
    SetFunction {
        /// Supported: dcv, acv, ohm, ohmf, dci, aci, ohm-ext, ntc, ntcf.
        #[arg(value_parser = parse_function)]
        function: proto::FunctionType,
    },

    /// Select the measurement range.
    SetRange {
        /// Supported: auto, 30m, 300m, 3, 30, 300, 3k, 30k, 300k, 3M, 30M.
        #[arg(value_parser = parse_range)]
        range: proto::Range,
    },

    /// Select the trigger mode.
    SetTrigger {
        /// Supported: internal, external, single, hold, fast.
        #[arg(value_parser = parse_trigger)]
        trigger: proto::TriggerType,
    },

    /// Set the number of displayed digits (plus the half digit).
    /// This also selects the integration time: 5 digits integrates over
    /// 10 power line cycles, 3 digits over 0.1.
    #[clap(verbatim_doc_comment)]
    SetDigits {
        /// Number of digits, 3 to 5.
        #[arg(value_parser = parse_digits)]
        digits: u8,
    },

    /// Enable or disable auto-zeroing between readings.
    SetAutozero {
        #[arg(action = clap::ArgAction::Set)]
        enable: bool,
    },

    /// Show a text on the front panel display, or return the display to
    /// normal measurement mode when no text is given.
    SetDisplay {
        /// Up to 12 characters of printable ASCII.
        text: Option<String>,
    },

    /// Reset the instrument: DCV, autorange, autozero, single trigger,
    /// 4.5 digits, buffered output erased.
    Reset,

    /// Return the instrument to local (front panel) control.
    Local,

    /// Back up, restore or inspect the battery-backed calibration memory.
    Cal {
        #[command(subcommand)]
        command: CliCalCommands,
    },
}

const fn about_text() -> &'static str {
    "HP 3478A multimeter CLI - Control an HP 3478A via a Prologix GPIB-Ethernet adapter."
}

#[derive(Parser, Debug)]
#[command(name="dmmctl", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is off.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// The IP address or hostname and port of the Prologix GPIB-Ethernet
    /// adapter. Example: "192.168.1.100:1234".
    pub adapter: String,

    /// The GPIB address of the multimeter (0 to 30).
    #[arg(short, long, default_value_t = 27, value_parser = parse_gpib_address)]
    pub gpib_address: u8,

    /// The command to execute.
    #[command(subcommand)]
    pub command: CliCommands,

    /// I/O timeout for one command/reply exchange.
    /// Must cover the integration time; 5 digit readings can take over
    /// 200ms per conversion. Examples: "1s", "500ms".
    #[arg(global = true, long, default_value = "1s", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_is_case_sensitive() {
        assert_eq!(parse_range("30m"), Ok(proto::Range::Range30m));
        assert_eq!(parse_range("30M"), Ok(proto::Range::Range30Meg));
        assert!(parse_range("30meg").is_err());
    }

    #[test]
    fn test_parse_function_aliases() {
        assert_eq!(parse_function("DCV"), Ok(proto::FunctionType::Dcv));
        assert_eq!(parse_function("2w-ohm"), Ok(proto::FunctionType::Ohm));
        assert_eq!(parse_function("4w-ohm"), Ok(proto::FunctionType::OhmF));
        assert!(parse_function("frequency").is_err());
    }

    #[test]
    fn test_parse_bounds() {
        assert!(parse_gpib_address("31").is_err());
        assert_eq!(parse_gpib_address("27"), Ok(27));
        assert!(parse_digits("6").is_err());
        assert_eq!(parse_digits("5"), Ok(5));
    }
}
