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

//! XMODEM protocol constants

/// Start of header - begins a 128-byte data packet
pub const SOH: u8 = 0x01;

/// End of transmission - sender signals the file is exhausted
pub const EOT: u8 = 0x04;

/// Acknowledge - receiver accepts the last packet or the EOT
pub const ACK: u8 = 0x06;

/// Negative acknowledge - receiver rejects the last packet, or selects
/// checksum mode when sent as the opening handshake byte
pub const NAK: u8 = 0x15;

/// CRC mode request - receiver selects CRC-16 mode at session start
pub const CRC_REQUEST: u8 = b'C';

/// Padding character filling the unused tail of a short final block
pub const PAD: u8 = 0x1A;

/// Payload size of every data packet
pub const BLOCK_SIZE: usize = 128;

/// Consecutive failures (NAK, junk byte, timeout) tolerated before a
/// transfer is abandoned
pub const MAX_RETRIES: usize = 10;

/// Session-wide error detection mode, fixed by the receiver's opening byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    /// 8-bit arithmetic sum, truncated modulo 256
    Checksum,
    /// CRC-16/XMODEM, two trailer bytes, high byte first
    Crc,
}

impl ChecksumMode {
    /// Number of trailer bytes following the payload
    pub fn trailer_len(self) -> usize {
        match self {
            ChecksumMode::Checksum => 1,
            ChecksumMode::Crc => 2,
        }
    }

    /// Byte the receiver emits to request this mode from the sender
    pub fn request_byte(self) -> u8 {
        match self {
            ChecksumMode::Checksum => NAK,
            ChecksumMode::Crc => CRC_REQUEST,
        }
    }
}
