//! Diematic gateway CLI
//!
//! A command-line interface (CLI) application for De Dietrich Diematic heating
//! regulators reached through a serial to TCP adapter.
//!
//! This tool allows users to:
//! - Read all published register values once.
//! - Change a writable parameter (setpoints, operating mode, telecommands).
//! - Run in a continuous daemon mode to poll the regulator and either print
//!   the values to the console or bridge them to an MQTT broker.
//! - List the register layout and the writable parameters.
//!
//! The CLI leverages the `diematic_lib` crate for the protocol and the gateway.

use anyhow::{bail, Context, Result};
use clap::Parser;
use diematic_lib::{
    gateway::{DeviceGateway, GatewayConfig, LinkState, MeasurementSink},
    poller::WriteOutcome,
    registers::{self, Measurement},
};
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::panic;
use tokio_util::sync::CancellationToken;

mod commandline;
mod mqtt;

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

/// Prints every measurement on its own line.
struct ConsoleSink;

impl MeasurementSink for ConsoleSink {
    fn publish(&self, measurement: &Measurement) {
        println!("{:<20} {}", measurement.name, measurement.value);
    }

    fn link_state_changed(&self, state: LinkState) {
        if state == LinkState::Disconnected {
            println!("-- disconnected --");
        }
    }
}

/// Cancels `cancel` on Ctrl-C.
fn install_shutdown_handler(cancel: &CancellationToken) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trace!("Received Ctrl-C");
            cancel.cancel();
        }
    });
}

fn print_registers() {
    println!("Polled blocks:");
    for block in registers::DIEMATIC.blocks_to_poll() {
        println!("  {:>4} .. {:>4}", block.start, block.end() - 1);
    }
    println!("Published registers:");
    for entry in registers::DIEMATIC.entries() {
        println!("  {:>4} {:<20} scale {}", entry.address, entry.name, entry.scale);
    }
    println!(
        "  derived {:<17} from registers {} and {}",
        registers::POWER_NAME,
        registers::IONIZATION_CURRENT_REG_ADDR,
        registers::RPM_REG_ADDR
    );
    println!("Writable parameters:");
    for parameter in registers::DIEMATIC.writable_parameters() {
        println!(
            "  {:<20} register {:>4} ({:?})",
            parameter.name, parameter.address, parameter.encoding
        );
    }
}

async fn handle_write(config: GatewayConfig, parameter: &str, value: &str) -> Result<()> {
    info!("Executing: Write {parameter}={value}");
    let gateway = DeviceGateway::new(config, ConsoleSink);
    gateway
        .submit_write(parameter, value)
        .with_context(|| format!("Cannot write {parameter}"))?;
    let report = gateway
        .poll_once(&CancellationToken::new())
        .await
        .with_context(|| "Poll cycle failed")?;
    match report.write {
        Some(WriteOutcome::Acknowledged) => {
            println!("Parameter {parameter} set to {value} successfully.");
            Ok(())
        }
        _ => bail!("Write of {parameter}={value} was not acknowledged by the regulator"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "Diematic CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Commands without a connection
    let (address, device_address, command) = match &args.connection {
        commandline::CliConnection::Registers => {
            print_registers();
            return Ok(());
        }
        commandline::CliConnection::Tcp {
            address,
            device_address,
            command,
        } => (address, *device_address, command),
    };
    let config = args.gateway_config(address, device_address);

    // 3. Execute the command
    match command {
        commandline::CliCommands::Daemon { output } => {
            info!("Starting daemon mode: output={output:?}");
            let cancel = CancellationToken::new();
            install_shutdown_handler(&cancel);
            match output {
                commandline::DaemonOutput::Console => {
                    DeviceGateway::new(config, ConsoleSink).run(&cancel).await?;
                }
                commandline::DaemonOutput::Mqtt { config_file } => {
                    mqtt::run_daemon(config, config_file, cancel).await?;
                }
            }
        }
        commandline::CliCommands::Read => {
            info!("Executing: Read all registers");
            let report = DeviceGateway::new(config, ConsoleSink)
                .poll_once(&CancellationToken::new())
                .await
                .with_context(|| "Cannot read registers")?;
            if report.timeouts > 0 {
                warn!("{} register blocks did not answer", report.timeouts);
            }
        }
        commandline::CliCommands::Write { parameter, value } => {
            handle_write(config, parameter, value).await?;
        }
    }

    Ok(())
}
