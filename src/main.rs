// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

// SAM3X line relay and file fetcher
mod ack;
mod fetch;
mod protocol;
mod relay;
mod rpc;
mod serial;
mod service;
mod source;
mod timeout;

use std::path::PathBuf;
use std::time::Duration;
use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use serialport::{DataBits, Parity, StopBits};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use protocol::*;
use relay::RelayConfig;
use rpc::{FetchArgs, Incoming, RelayArgs, ReplyHandle, Request, Response};
use serial::RealSerialPort;
use service::Service;

#[derive(Parser)]
#[command(name = "sam3x-relay")]
#[command(about = "Relay G-code files to a SAM3X controller and fetch them over HTTP", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port of the controller (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long, default_value_t = DEFAULT_BAUD)]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name = "BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name = "BITS")]
    stop_bits: u8,

    /// Supervisory timer period in milliseconds
    #[arg(long, default_value = "100", value_name = "MS")]
    tick_ms: u64,

    /// Ticks to wait for the first acknowledgment
    #[arg(long, default_value_t = INITIAL_TIMEOUT_TICKS, value_name = "TICKS")]
    initial_ticks: u32,

    /// Ticks to wait for each following acknowledgment
    #[arg(long, default_value_t = STEADY_TIMEOUT_TICKS, value_name = "TICKS")]
    steady_ticks: u32,

    /// Longest line sent to the controller, longer lines are truncated
    #[arg(long, default_value_t = MAX_LINE_LENGTH, value_name = "BYTES")]
    max_line: usize,

    /// Controller output buffered while waiting for an acknowledgment
    #[arg(long, default_value_t = RESPONSE_CAPACITY, value_name = "BYTES",
          value_parser = parse_response_capacity)]
    response_capacity: usize,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer JSON requests on stdin, one per line, replies on stdout
    Serve,
    /// Download a file over HTTP
    Fetch {
        /// Source URL
        url: String,
        /// Destination file
        file: PathBuf,
    },
    /// Relay a file to the controller line by line
    Relay {
        /// File to relay
        file: PathBuf,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
enum ConfigError {
    #[error("Invalid data bits: {0}. Must be 5, 6, 7, or 8")]
    DataBits(u8),
    #[error("Invalid parity: {0}. Must be 'none', 'odd', or 'even'")]
    Parity(String),
    #[error("Invalid stop bits: {0}. Must be 1 or 2")]
    StopBits(u8),
}

fn parse_data_bits(bits: u8) -> Result<DataBits, ConfigError> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(ConfigError::DataBits(bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, ConfigError> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(ConfigError::Parity(parity.to_string())),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, ConfigError> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(ConfigError::StopBits(bits)),
    }
}

fn parse_response_capacity(value: &str) -> Result<usize, String> {
    let capacity: usize = value.parse().map_err(|e| format!("{}", e))?;
    if capacity < ACK_TOKEN.len() {
        return Err(format!("must hold at least {} bytes", ACK_TOKEN.len()));
    }
    Ok(capacity)
}

struct SerialSettings {
    port: Option<String>,
    baud: u32,
    data_bits: u8,
    parity: String,
    stop_bits: u8,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr, stdout carries replies
    let default_filter = if cli.debug { "sam3x_relay=debug" } else { "sam3x_relay=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = RelayConfig {
        tick_period: Duration::from_millis(cli.tick_ms.max(1)),
        initial_ticks: cli.initial_ticks,
        steady_ticks: cli.steady_ticks,
        max_line_len: cli.max_line,
        response_capacity: cli.response_capacity,
    };
    let settings = SerialSettings {
        port: cli.port,
        baud: cli.baud,
        data_bits: cli.data_bits,
        parity: cli.parity,
        stop_bits: cli.stop_bits,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start event loop")?;

    runtime.block_on(async {
        match cli.command {
            Commands::Serve => serve(settings, config).await,
            Commands::Fetch { url, file } => {
                let request = Request::Fetch(FetchArgs {
                    url: Some(url),
                    file: Some(file.display().to_string()),
                });
                one_shot(None, config, request).await
            }
            Commands::Relay { file } => {
                let request = Request::Relay(RelayArgs { file: Some(file.display().to_string()) });
                one_shot(Some(settings), config, request).await
            }
        }
    })
}

/// Opens the controller link and starts forwarding its output.
fn open_serial(settings: SerialSettings, config: &RelayConfig) -> anyhow::Result<(RealSerialPort, mpsc::UnboundedReceiver<Vec<u8>>)> {
    let port_name = settings.port.ok_or_else(|| anyhow!("--port is required for this command"))?;
    let data_bits = parse_data_bits(settings.data_bits)?;
    let parity = parse_parity(&settings.parity)?;
    let stop_bits = parse_stop_bits(settings.stop_bits)?;

    info!("Opening serial port: {}", port_name);
    info!("Settings: {} baud, {:?}, {:?}, {:?}", settings.baud, data_bits, parity, stop_bits);

    let port = RealSerialPort::open(&port_name, settings.baud, data_bits, parity, stop_bits)
        .with_context(|| format!("Failed to open serial port {}", port_name))?;
    let reader = port.try_clone_reader()
        .with_context(|| format!("Failed to clone serial port {}", port_name))?;

    let (tx, rx) = mpsc::unbounded_channel();
    serial::spawn_reader(reader, tx, config.tick_period);
    Ok((port, rx))
}

async fn serve(settings: SerialSettings, config: RelayConfig) -> anyhow::Result<()> {
    let (port, serial_rx) = open_serial(settings, &config)?;
    let service = Service::new(port, reqwest::Client::new(), config);

    let (req_tx, req_rx) = mpsc::channel(16);
    let (resp_tx, resp_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(rpc::write_responses(tokio::io::stdout(), resp_rx));
    let reader = tokio::spawn(rpc::read_frames(BufReader::new(tokio::io::stdin()), req_tx, resp_tx));

    info!("Waiting for requests");
    service.run(req_rx, serial_rx).await;

    reader.await?.context("Failed to read requests")?;
    writer.await?.context("Failed to write replies")?;
    Ok(())
}

/// Issues a single request, prints its reply and fails if it was an error.
async fn one_shot(settings: Option<SerialSettings>, config: RelayConfig, request: Request) -> anyhow::Result<()> {
    let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
    let reply = ReplyHandle::new(None, resp_tx);

    match (request, settings) {
        (Request::Fetch(args), _) => {
            fetch::start_fetch(&reqwest::Client::new(), args, reply);
        }
        (request, settings) => {
            let settings = settings.ok_or_else(|| anyhow!("--port is required for this command"))?;
            let (port, serial_rx) = open_serial(settings, &config)?;
            let service = Service::new(port, reqwest::Client::new(), config);

            let (req_tx, req_rx) = mpsc::channel(1);
            req_tx.send(Incoming { request, reply }).await
                .map_err(|_| anyhow!("Service stopped before accepting the request"))?;
            drop(req_tx);
            service.run(req_rx, serial_rx).await;
        }
    }

    let response = resp_rx.recv().await.ok_or_else(|| anyhow!("Request ended without a reply"))?;
    print_response(&response)
}

fn print_response(response: &Response) -> anyhow::Result<()> {
    match (&response.result, &response.error) {
        (_, Some(error)) => bail!("{}", error),
        (Some(result), None) => {
            println!("{}", result);
            Ok(())
        }
        (None, None) => bail!("Empty reply"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc::RpcError;
    use serde_json::json;

    #[test]
    fn test_parse_serial_settings() {
        assert_eq!(parse_data_bits(7), Ok(DataBits::Seven));
        assert_eq!(parse_data_bits(9), Err(ConfigError::DataBits(9)));
        assert_eq!(parse_parity("EVEN"), Ok(Parity::Even));
        assert_eq!(parse_parity("mark"), Err(ConfigError::Parity("mark".into())));
        assert_eq!(parse_stop_bits(2), Ok(StopBits::Two));
        assert_eq!(parse_stop_bits(3), Err(ConfigError::StopBits(3)));
    }

    #[test]
    fn test_response_capacity_must_fit_token() {
        assert_eq!(parse_response_capacity("256"), Ok(256));
        assert!(parse_response_capacity("3").is_err());
        assert!(parse_response_capacity("lots").is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["sam3x-relay", "relay", "part.gcode"]).unwrap();
        assert_eq!(cli.baud, 115_200);
        assert_eq!(cli.initial_ticks, 500);
        assert_eq!(cli.steady_ticks, 100);
        assert_eq!(cli.max_line, 200);
        assert!(cli.port.is_none());
        assert!(matches!(cli.command, Commands::Relay { .. }));
    }

    #[test]
    fn test_print_response() {
        let ok = Response { id: None, result: Some(json!({"Status": "OK"})), error: None };
        assert!(print_response(&ok).is_ok());

        let err = Response { id: None, result: None, error: Some(RpcError::new(500, "cannot open x")) };
        assert_eq!(print_response(&err).unwrap_err().to_string(), "error 500: cannot open x");
    }

    #[tokio::test]
    async fn test_relay_requires_port() {
        let request = Request::Relay(RelayArgs { file: Some("part.gcode".into()) });
        let settings = SerialSettings {
            port: None,
            baud: DEFAULT_BAUD,
            data_bits: 8,
            parity: "none".into(),
            stop_bits: 1,
        };
        let err = one_shot(Some(settings), RelayConfig::default(), request).await.unwrap_err();
        assert!(err.to_string().contains("--port"));
    }
}
