use crate::mqtt::MqttConfig;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use diematic_lib::{gateway as gw, protocol as proto};
use std::time::Duration;

fn parse_device_address(s: &str) -> Result<u8, String> {
    let address =
        clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid device address format: {e}"))?;
    if (1..=247).contains(&address) {
        Ok(address)
    } else {
        Err(format!("Device address {address} is out of range (1-247)"))
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliConnection {
    /// Connect to the regulator through a serial to TCP adapter.
    Tcp {
        /// The IP address or hostname and port of the adapter.
        /// Example: "192.168.178.7:88" or "heating-gw.local:88".
        #[clap(verbatim_doc_comment)]
        address: String,

        /// The Modbus address of the regulator.
        /// Can be specified in decimal or hexadecimal (e.g., "10" or "0x0A").
        #[arg(short, long, default_value_t = proto::DEFAULT_DEVICE_ADDRESS, value_parser = parse_device_address, verbatim_doc_comment)]
        device_address: u8,

        /// Commands for the connected regulator.
        #[command(subcommand)]
        command: CliCommands,
    },
    /// List the polled registers and the writable parameters.
    Registers,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously poll the regulator and print the values to the standard output (console).
    Console,
    /// Continuously poll the regulator, publish the values to an MQTT broker
    /// and apply parameter changes received on `<topic root>/set/<parameter>`.
    #[clap(verbatim_doc_comment)]
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run in daemon mode: poll all register blocks continuously and
    /// reconnect automatically when the link fails.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// Specifies the output.
        #[command(subcommand)]
        output: DaemonOutput,
    },

    /// Run a single poll cycle and display all decoded values.
    Read,

    /// Write a parameter, then run one poll cycle to send it.
    /// Temperatures are given in °C (e.g., "21.5"), modes and telecommands as integers.
    #[clap(verbatim_doc_comment)]
    Write {
        /// Name of the writable parameter (see the `registers` command).
        parameter: String,
        /// New value of the parameter.
        value: String,
    },
}

const fn about_text() -> &'static str {
    "Diematic gateway - Poll De Dietrich Diematic heating regulators and bridge them to MQTT."
}

#[derive(Parser, Debug)]
#[command(name="diematic", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -q for warnings only, -v for debug, -vv for trace. Default is info.
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Specifies the connection and device commands.
    #[command(subcommand)]
    pub connection: CliConnection,

    /// Maximum time to establish the TCP connection.
    #[arg(global = true, long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub connect_timeout: Duration,

    /// Silence on the line after which the next request is sent.
    /// Examples: "700ms", "1s".
    #[arg(global = true, long, default_value = "700ms", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub read_timeout: Duration,

    /// Maximum wait for the reply to a single request.
    #[arg(global = true, long, default_value = "6s", value_parser = humantime::parse_duration)]
    pub request_timeout: Duration,

    /// Grace period before reconnecting after a link failure.
    #[arg(global = true, long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub reconnect_delay: Duration,

    /// Consecutive request timeouts after which the connection is re-established.
    #[arg(global = true, long, default_value_t = gw::DEFAULT_MAX_CONSECUTIVE_TIMEOUTS)]
    pub max_timeouts: u32,
}

impl CliArgs {
    pub fn gateway_config(&self, address: &str, device_address: u8) -> gw::GatewayConfig {
        let mut config = gw::GatewayConfig::new(address);
        config.device = tokio_modbus::Slave(device_address);
        config.connect_timeout = self.connect_timeout;
        config.read_timeout = self.read_timeout;
        config.request_timeout = self.request_timeout;
        config.reconnect_delay = self.reconnect_delay;
        config.max_consecutive_timeouts = self.max_timeouts;
        config
    }
}
