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

//! Data packet framing

use crate::checksum::block_check;
use crate::protocol::{BLOCK_SIZE, ChecksumMode, SOH};

/// Largest possible frame: header, number, complement, payload, CRC trailer
pub const MAX_FRAME_LEN: usize = 3 + BLOCK_SIZE + 2;

/// Total wire size of a framed data packet under the given mode.
pub fn frame_len(mode: ChecksumMode) -> usize {
    3 + BLOCK_SIZE + mode.trailer_len()
}

/// A decoded data packet. Fields are parsed as-is; the receiving state
/// machine validates the complement, check value, and sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub block: u8,
    pub complement: u8,
    pub payload: [u8; BLOCK_SIZE],
    pub check: u16,
}

impl Packet {
    /// Frame a payload into wire bytes: SOH, block number, complement,
    /// 128 payload bytes, then a 1-byte sum or 2-byte CRC (high byte first).
    pub fn encode(block: u8, payload: &[u8; BLOCK_SIZE], mode: ChecksumMode) -> Vec<u8> {
        let mut frame = Vec::with_capacity(frame_len(mode));
        frame.push(SOH);
        frame.push(block);
        frame.push(255 - block);
        frame.extend_from_slice(payload);

        let check = block_check(payload, mode);
        match mode {
            ChecksumMode::Checksum => frame.push(check as u8),
            ChecksumMode::Crc => frame.extend_from_slice(&check.to_be_bytes()),
        }

        frame
    }

    /// Parse wire bytes back into a packet. Returns None only if the frame
    /// has the wrong length or does not begin with SOH.
    pub fn decode(bytes: &[u8], mode: ChecksumMode) -> Option<Packet> {
        if bytes.len() != frame_len(mode) || bytes[0] != SOH {
            return None;
        }

        let mut payload = [0u8; BLOCK_SIZE];
        payload.copy_from_slice(&bytes[3..3 + BLOCK_SIZE]);

        let check = match mode {
            ChecksumMode::Checksum => bytes[3 + BLOCK_SIZE] as u16,
            ChecksumMode::Crc => u16::from_be_bytes([bytes[3 + BLOCK_SIZE], bytes[4 + BLOCK_SIZE]]),
        };

        Some(Packet {
            block: bytes[1],
            complement: bytes[2],
            payload,
            check,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
