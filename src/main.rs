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

// Serial upload protocol implementation
mod clock;
mod connection;
mod protocol;
mod report;
mod serial;
mod session;

use clap::Parser;
use std::path::PathBuf;
use clock::SystemClock;
use protocol::{DEFAULT_BAUD, DEFAULT_CHUNK_SIZE, DEFAULT_FILE, DEFAULT_PORT};
use report::ConsoleReporter;
use serial::{RealSerialPort, SerialPort};
use session::{SessionError, TransferConfig};

#[derive(Parser)]
#[command(name = "serial-upload")]
#[command(about = "Upload a file to an embedded device over a serial link", long_about = None)]
struct Cli {
    /// File to upload
    #[arg(default_value = DEFAULT_FILE)]
    file: PathBuf,

    /// Serial port to use (e.g., /dev/ttyACM0 or COM3)
    #[arg(short, long, default_value = DEFAULT_PORT)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value_t = DEFAULT_BAUD)]
    baud: u32,

    /// Bytes per chunk; must match the receiver's chunk size
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE as u32, value_name = "BYTES",
          value_parser = clap::value_parser!(u32).range(1..))]
    chunk_size: u32,

    /// Enable debug output
    #[arg(long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();
}

fn open_port(config: &TransferConfig) -> Result<Box<dyn SerialPort>, SessionError> {
    let port = RealSerialPort::open(&config.port, config.baud_rate)?;
    Ok(Box::new(port))
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = TransferConfig {
        file: cli.file,
        port: cli.port,
        baud_rate: cli.baud,
        chunk_size: cli.chunk_size as usize,
    };

    match session::run(&config, open_port, Box::new(SystemClock), Box::new(ConsoleReporter::new())) {
        Ok(report) => {
            log::debug!("Uploaded {} of {} bytes", report.bytes_sent, report.file_size);
        }
        Err(e) => {
            println!("Error: {}", e);
            if let SessionError::FileMissing(path) = &e {
                let dir = path.parent().map(|p| p.display().to_string()).unwrap_or_default();
                println!("Ensure the file is inside '{}' next to where you run this.", dir);
            }
        }
    }
}
