//! HP 3478A Multimeter CLI
//!
//! A command-line interface (CLI) application for controlling HP 3478A
//! 5.5 digit bench multimeters over GPIB, using a Prologix GPIB-Ethernet
//! adapter.
//!
//! This tool allows users to:
//! - Trigger and read single measurements, or monitor continuously.
//! - Select the measurement function, range, trigger mode and digit count.
//! - Display text on the front panel or return it to normal operation.
//! - Read the decoded status and error registers.
//! - Back up, restore and inspect the battery-backed calibration memory.
//!
//! The CLI leverages the `hp3478a_lib` crate for protocol definitions and
//! client operations.

use anyhow::{Context, Result, bail};
use clap::Parser;
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use futures::StreamExt;
use hp3478a_lib::{
    calram, protocol as proto, tokio_async_client::Hp3478a, transport::PrologixTransport,
};
use log::*;
use std::panic;

mod commandline;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0)); // Provide defaults

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic", // Optional target for filtering
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

/// The unit of a reading, determined by the selected function.
fn reading_unit(function: proto::FunctionType) -> &'static str {
    match function {
        proto::FunctionType::Dcv | proto::FunctionType::Acv => "V",
        proto::FunctionType::Dci | proto::FunctionType::Aci => "A",
        proto::FunctionType::Ohm | proto::FunctionType::OhmF | proto::FunctionType::OhmExt => "Ohm",
        proto::FunctionType::Ntc | proto::FunctionType::Ntcf => "K",
    }
}

/// Applies the function/range options shared by the read and monitor
/// commands, then reports the active function for unit display.
async fn apply_measurement_options(
    dmm: &mut Hp3478a<PrologixTransport>,
    function: &Option<proto::FunctionType>,
    range: &Option<proto::Range>,
) -> Result<proto::FunctionType> {
    if let Some(function) = function {
        dmm.set_function(*function)
            .await
            .with_context(|| format!("Cannot select function {function}"))?;
    }
    if let Some(range) = range {
        dmm.set_range(*range)
            .await
            .with_context(|| format!("Cannot select range {range}"))?;
    }
    match function {
        Some(function) => Ok(*function),
        None => {
            let status = dmm.get_status().await.with_context(|| "Cannot read status")?;
            Ok(status.function)
        }
    }
}

fn print_status(status: &proto::DmmStatus) {
    println!("Function:      {}", status.function);
    println!("Range:         {}", status.range);
    println!("Digits:        {}.5", status.ndigits);
    println!("Status flags:  {:?}", status.status);
    println!("SRQ flags:     {:?}", status.srq_flags);
    println!("Error flags:   {:?}", status.error_flags);
    println!("DAC value:     {}", status.dac_value);
}

async fn handle_cal_backup(dmm: &mut Hp3478a<PrologixTransport>, file: &std::path::Path) -> Result<()> {
    info!("Executing: Calibration Backup to {}", file.display());
    println!("Reading calibration memory (256 addresses, this takes a while)...");
    let raw = dmm
        .get_cal_ram_raw()
        .await
        .with_context(|| "Cannot read calibration memory")?;

    // Warn about bad checksums but back up anyway, a partial image is
    // better than none.
    let memory = calram::decode_cal_data(&raw)?;
    let invalid = memory.entries.iter().filter(|e| !e.is_valid).count();
    if invalid > 0 {
        warn!("{invalid} of {} calibration entries have bad checksums", memory.entries.len());
    }

    std::fs::write(file, &raw)
        .with_context(|| format!("Cannot write calibration image to {}", file.display()))?;
    println!("Calibration image saved to {}.", file.display());
    Ok(())
}

async fn handle_cal_restore(
    dmm: &mut Hp3478a<PrologixTransport>,
    file: &std::path::Path,
) -> Result<()> {
    info!("Executing: Calibration Restore from {}", file.display());
    let image = std::fs::read(file)
        .with_context(|| format!("Cannot read calibration image {}", file.display()))?;
    // Tolerate a trailing newline added by text editors.
    let raw: Vec<u8> = image
        .into_iter()
        .filter(|b| *b != b'\r' && *b != b'\n')
        .collect();
    if raw.len() != calram::BLOCK_LENGTH {
        bail!(
            "Calibration image {} has {} bytes, expected {}",
            file.display(),
            raw.len(),
            calram::BLOCK_LENGTH
        );
    }

    println!(
        "WARNING: This will overwrite the calibration memory of the instrument.\n\
         A wrong image destroys the calibration; the only way back is a full\n\
         recalibration against reference standards."
    );
    println!(
        "The front panel CAL ENABLE switch must be set to ENABLED, otherwise\n\
         the instrument silently ignores the write."
    );
    if !Confirm::new()
        .with_prompt("Are you sure you want to proceed with the restore?")
        .default(false)
        .show_default(true)
        .interact()?
    {
        info!("Calibration restore aborted by user.");
        return Ok(());
    }

    println!("Writing calibration memory (256 addresses, this takes a while)...");
    dmm.set_cal_ram_raw(&raw)
        .await
        .with_context(|| "Cannot write calibration memory")?;
    println!("Calibration image restored successfully.");
    Ok(())
}

async fn handle_cal_show(dmm: &mut Hp3478a<PrologixTransport>) -> Result<()> {
    info!("Executing: Calibration Show");
    println!("Reading calibration memory (256 addresses, this takes a while)...");
    let raw = dmm
        .get_cal_ram_raw()
        .await
        .with_context(|| "Cannot read calibration memory")?;
    let memory = calram::decode_cal_data(&raw)?;

    println!("Raw calibration memory:");
    println!("{}", calram::format_cal_string(&raw));
    println!(
        "CAL ENABLE switch: {}",
        if memory.cal_enabled { "enabled" } else { "disabled" }
    );
    println!("Entry  Offset   Gain      Checksum");
    for (index, entry) in memory.entries.iter().enumerate() {
        println!(
            "{index:>5}  {:>7}  {:.6}  {}",
            entry.offset,
            entry.gain,
            if entry.is_valid { "ok" } else { "BAD" }
        );
    }
    Ok(())
}

async fn run_command(
    dmm: &mut Hp3478a<PrologixTransport>,
    command: &commandline::CliCommands,
) -> Result<()> {
    match command {
        commandline::CliCommands::Read { function, range } => {
            info!("Executing: Read");
            let function = apply_measurement_options(dmm, function, range).await?;
            dmm.set_trigger(proto::TriggerType::Single)
                .await
                .with_context(|| "Cannot trigger measurement")?;
            let value = dmm.read().await.with_context(|| "Cannot read measurement")?;
            println!("{value} {}", reading_unit(function));
        }
        commandline::CliCommands::Monitor { function, range } => {
            info!("Executing: Monitor");
            let function = apply_measurement_options(dmm, function, range).await?;
            dmm.set_trigger(proto::TriggerType::Internal)
                .await
                .with_context(|| "Cannot enable internal trigger")?;
            let unit = reading_unit(function);
            let stream = dmm.read_all();
            futures::pin_mut!(stream);
            while let Some(reading) = stream.next().await {
                let value = reading.with_context(|| "Cannot read measurement")?;
                println!("{value} {unit}");
            }
        }
        commandline::CliCommands::Status => {
            info!("Executing: Read Status");
            let status = dmm.get_status().await.with_context(|| "Cannot read status")?;
            print_status(&status);
        }
        commandline::CliCommands::ErrorRegister => {
            info!("Executing: Read Error Register");
            let errors = dmm
                .get_error_register()
                .await
                .with_context(|| "Cannot read error register")?;
            if errors.is_empty() {
                println!("No errors.");
            } else {
                println!("Errors: {errors:?}");
            }
        }
        commandline::CliCommands::SwitchPosition => {
            info!("Executing: Read Front/Rear Switch Position");
            let position = dmm
                .get_front_rear_switch_position()
                .await
                .with_context(|| "Cannot read switch position")?;
            println!("Active binding posts: {position}");
        }
        commandline::CliCommands::SetFunction { function } => {
            info!("Executing: Set Function to {function}");
            dmm.set_function(*function)
                .await
                .with_context(|| format!("Cannot select function {function}"))?;
            println!("Function set to {function}.");
        }
        commandline::CliCommands::SetRange { range } => {
            info!("Executing: Set Range to {range}");
            dmm.set_range(*range)
                .await
                .with_context(|| format!("Cannot select range {range}"))?;
            println!("Range set to {range}.");
        }
        commandline::CliCommands::SetTrigger { trigger } => {
            info!("Executing: Set Trigger to {trigger:?}");
            dmm.set_trigger(*trigger)
                .await
                .with_context(|| format!("Cannot select trigger {trigger:?}"))?;
            println!("Trigger set to {trigger:?}.");
        }
        commandline::CliCommands::SetDigits { digits } => {
            info!("Executing: Set Digits to {digits}");
            dmm.set_number_of_digits(*digits)
                .await
                .with_context(|| format!("Cannot set digit count to {digits}"))?;
            println!("Display set to {digits}.5 digits.");
        }
        commandline::CliCommands::SetAutozero { enable } => {
            info!("Executing: Set Autozero to {enable}");
            dmm.set_autozero(*enable)
                .await
                .with_context(|| "Cannot set autozero")?;
            println!(
                "Auto-zero {}.",
                if *enable { "enabled" } else { "disabled" }
            );
        }
        commandline::CliCommands::SetDisplay { text } => match text {
            Some(text) => {
                info!("Executing: Set Display Text to '{text}'");
                dmm.set_display(proto::DisplayType::ShowText, text)
                    .await
                    .with_context(|| "Cannot set display text")?;
                println!("Display text set.");
            }
            None => {
                info!("Executing: Set Display to Normal");
                dmm.set_display(proto::DisplayType::Normal, "")
                    .await
                    .with_context(|| "Cannot reset display")?;
                println!("Display returned to normal operation.");
            }
        },
        commandline::CliCommands::Reset => {
            info!("Executing: Reset");
            dmm.reset().await.with_context(|| "Cannot reset instrument")?;
            println!("Instrument reset to default settings.");
        }
        commandline::CliCommands::Local => {
            info!("Executing: Local");
            dmm.local()
                .await
                .with_context(|| "Cannot return instrument to local control")?;
            println!("Instrument returned to local control.");
        }
        commandline::CliCommands::Cal { command } => match command {
            commandline::CliCalCommands::Backup { file } => handle_cal_backup(dmm, file).await?,
            commandline::CliCalCommands::Restore { file } => handle_cal_restore(dmm, file).await?,
            commandline::CliCalCommands::Show => handle_cal_show(dmm).await?,
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "HP 3478A CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Connect to the adapter and the instrument
    info!(
        "Attempting to connect via {} to GPIB address {}...",
        args.adapter, args.gpib_address
    );
    let transport = PrologixTransport::connect(&args.adapter, args.gpib_address)
        .await
        .with_context(|| format!("Failed to connect to GPIB adapter at {}", args.adapter))?;
    let mut dmm = Hp3478a::new(transport);
    dmm.set_timeout(args.timeout);
    dmm.connect()
        .await
        .with_context(|| "Failed to initialize the instrument")?;

    // 3. Execute the command, then hand the instrument back to the front
    // panel even if the command failed
    let result = run_command(&mut dmm, &args.command).await;
    if let Err(error) = dmm.disconnect().await {
        warn!("Disconnect failed: {error}");
    }
    result
}
