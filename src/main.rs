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

// XMODEM protocol implementation
mod checksum;
mod packet;
mod protocol;
mod receiver;
mod sender;
mod serial;

use clap::{Parser, Subcommand};
use protocol::ChecksumMode;
use serial::{PortSettings, RealSerialPort};
use serialport::{DataBits, Parity, StopBits};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "xmodem")]
#[command(about = "XMODEM file transfer over a serial line", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "9600")]
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

    /// Delay in milliseconds between sending each byte of a data packet
    #[arg(long, default_value = "0", value_name = "MS")]
    byte_delay: u8,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file
    Send {
        /// File to send
        file: PathBuf,
    },
    /// Receive a file
    Receive {
        /// Where to write the received data
        file: PathBuf,

        /// Request CRC-16 error detection instead of the 8-bit checksum
        #[arg(long)]
        crc: bool,
    },
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_target(false)
        .init();

    let data_bits = match parse_data_bits(cli.data_bits) {
        Ok(db) => db,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let parity = match parse_parity(&cli.parity) {
        Ok(p) => p,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let stop_bits = match parse_stop_bits(cli.stop_bits) {
        Ok(sb) => sb,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let settings = PortSettings {
        baud: cli.baud,
        data_bits,
        parity,
        stop_bits,
    };

    info!(
        "opening {} ({} baud, {:?}, {:?}, {:?})",
        cli.port, settings.baud, settings.data_bits, settings.parity, settings.stop_bits
    );

    let serial_port = match RealSerialPort::open(&cli.port, &settings) {
        Ok(port) => port,
        Err(e) => {
            error!("failed to open serial port: {}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Send { file } => {
            info!("sending {}", file.display());
            if let Err(e) = send_file(serial_port, file, cli.byte_delay) {
                error!("send failed: {}", e);
                std::process::exit(1);
            }
            info!("file sent successfully");
        }
        Commands::Receive { file, crc } => {
            let mode = if crc {
                ChecksumMode::Crc
            } else {
                ChecksumMode::Checksum
            };
            info!("receiving into {}", file.display());
            if let Err(e) = receive_file(serial_port, file, mode) {
                error!("receive failed: {}", e);
                std::process::exit(1);
            }
            info!("file received successfully");
        }
    }
}

fn send_file(
    serial_port: RealSerialPort,
    file: PathBuf,
    byte_delay: u8,
) -> Result<(), sender::SenderError> {
    use sender::{SenderError, SenderFsm};

    if !file.exists() {
        return Err(SenderError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("File not found: {}", file.display()),
        )));
    }

    let mut state = SenderFsm::new(Box::new(serial_port), file, byte_delay);

    loop {
        match state.step() {
            Ok(next_state) => {
                state = next_state;
            }
            Err(SenderError::TransferComplete) => {
                return Ok(());
            }
            Err(e) => {
                return Err(e);
            }
        }
    }
}

fn receive_file(
    serial_port: RealSerialPort,
    file: PathBuf,
    mode: ChecksumMode,
) -> Result<(), receiver::ReceiverError> {
    use receiver::{ReceiverError, ReceiverFsm};

    let mut state = ReceiverFsm::new(Box::new(serial_port), file, mode);

    loop {
        match state.step() {
            Ok(next_state) => {
                state = next_state;
            }
            Err(ReceiverError::TransferComplete) => {
                return Ok(());
            }
            Err(e) => {
                return Err(e);
            }
        }
    }
}

// ============================================================================
// End-to-End Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use receiver::{ReceiverError, ReceiverFsm, ReceiverState};
    use sender::{SenderError, SenderFsm, SenderState};
    use serial::ChannelPort;

    fn run_sender(mut fsm: Box<dyn SenderState>) -> Result<(), SenderError> {
        loop {
            match fsm.step() {
                Ok(next) => fsm = next,
                Err(SenderError::TransferComplete) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn run_receiver(mut fsm: Box<dyn ReceiverState>) -> Result<(), ReceiverError> {
        loop {
            match fsm.step() {
                Ok(next) => fsm = next,
                Err(ReceiverError::TransferComplete) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Push `content` through a sender and receiver wired back to back and
    /// return what lands in the output file.
    fn loopback_transfer(name: &str, content: &[u8], mode: ChecksumMode) -> Vec<u8> {
        let input = std::env::temp_dir().join(format!("{name}_in"));
        let output = std::env::temp_dir().join(format!("{name}_out"));
        std::fs::write(&input, content).unwrap();
        std::fs::remove_file(&output).ok();

        let (sender_port, receiver_port) = ChannelPort::pair();

        let input_path = input.clone();
        let sender_thread = std::thread::spawn(move || {
            run_sender(SenderFsm::new(Box::new(sender_port), input_path, 0))
        });

        run_receiver(ReceiverFsm::new(Box::new(receiver_port), output.clone(), mode))
            .expect("receive should complete");
        sender_thread
            .join()
            .unwrap()
            .expect("send should complete");

        let received = std::fs::read(&output).unwrap();
        std::fs::remove_file(&input).ok();
        std::fs::remove_file(&output).ok();
        received
    }

    #[test]
    fn test_end_to_end_checksum_mode() {
        assert_eq!(
            loopback_transfer("e2e_sum", b"AB\n", ChecksumMode::Checksum),
            b"AB\n"
        );
    }

    #[test]
    fn test_end_to_end_crc_mode() {
        // Interior 0x1A bytes must survive; only trailing padding is trimmed
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(
            loopback_transfer("e2e_crc", &content, ChecksumMode::Crc),
            content
        );
    }

    #[test]
    fn test_end_to_end_exact_block_multiple() {
        let content: Vec<u8> = (0..384u32).map(|i| (i % 97 + 1) as u8).collect();
        assert_eq!(
            loopback_transfer("e2e_exact", &content, ChecksumMode::Checksum),
            content
        );
    }
}
