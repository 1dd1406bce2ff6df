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

use serialport::{DataBits, Parity, SerialPort as SerialPortTrait, StopBits};
use std::time::Duration;

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Trait for serial port operations needed by the protocol engine
pub trait SerialPort: Send {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;

    /// Fill `buf` completely, applying `timeout` to each underlying read.
    fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_timeout(&mut buf[filled..], timeout)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "port returned no data",
                ));
            }
            filled += n;
        }
        Ok(())
    }
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Serial line parameters kept outside the protocol engine
pub struct PortSettings {
    pub baud: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(port_name: &str, settings: &PortSettings) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, settings.baud)
            .data_bits(settings.data_bits)
            .parity(settings.parity)
            .stop_bits(settings.stop_bits)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(RealSerialPort { port })
    }
}

impl SerialPort for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| std::io::Error::other(e))?;
        self.port.read(buf)
    }
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

#[cfg(test)]
pub struct MockSerialPort {
    // Scripted reads; a None entry produces one timeout
    reads: std::collections::VecDeque<Option<u8>>,
    // Everything the code under test wrote, checked on drop
    written: Vec<u8>,
    expected: Vec<u8>,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(reads: Vec<Option<u8>>, expected: Vec<u8>) -> Self {
        MockSerialPort {
            reads: reads.into(),
            written: Vec::new(),
            expected,
        }
    }
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.written.extend_from_slice(buf);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> std::io::Result<usize> {
        match self.reads.pop_front() {
            // Script exhausted, or an explicit timeout marker
            None | Some(None) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "mock timeout",
            )),
            Some(Some(first)) => {
                buf[0] = first;
                let mut filled = 1;
                while filled < buf.len() {
                    match self.reads.front().copied() {
                        Some(Some(byte)) => {
                            buf[filled] = byte;
                            filled += 1;
                            self.reads.pop_front();
                        }
                        // Stop at a timeout marker or script end
                        _ => break,
                    }
                }
                Ok(filled)
            }
        }
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        assert!(
            self.reads.is_empty(),
            "MockSerialPort dropped with {} unconsumed responses",
            self.reads.len()
        );

        assert_eq!(
            &self.written, &self.expected,
            "MockSerialPort write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected.len(),
            self.expected,
            self.written.len(),
            self.written
        );
    }
}

// ============================================================================
// Loopback Port Pair for End-to-End Tests
// ============================================================================

#[cfg(test)]
pub struct ChannelPort {
    tx: std::sync::mpsc::Sender<u8>,
    rx: std::sync::mpsc::Receiver<u8>,
}

#[cfg(test)]
impl ChannelPort {
    /// Two ports wired back to back; what one writes the other reads.
    pub fn pair() -> (ChannelPort, ChannelPort) {
        let (a_tx, b_rx) = std::sync::mpsc::channel();
        let (b_tx, a_rx) = std::sync::mpsc::channel();
        (
            ChannelPort { tx: a_tx, rx: a_rx },
            ChannelPort { tx: b_tx, rx: b_rx },
        )
    }
}

#[cfg(test)]
impl SerialPort for ChannelPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        for &byte in buf {
            self.tx
                .send(byte)
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer closed"))?;
        }
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        use std::sync::mpsc::RecvTimeoutError;

        buf[0] = self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "channel timeout")
            }
            RecvTimeoutError::Disconnected => {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer closed")
            }
        })?;

        let mut filled = 1;
        while filled < buf.len() {
            match self.rx.try_recv() {
                Ok(byte) => {
                    buf[filled] = byte;
                    filled += 1;
                }
                Err(_) => break,
            }
        }
        Ok(filled)
    }
}
