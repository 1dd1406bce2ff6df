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

use crate::checksum::block_check;
use crate::packet::{MAX_FRAME_LEN, Packet, frame_len};
use crate::protocol::*;
use crate::serial::SerialPort;
use std::fs::File;
use std::io::Write;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("block sequence violation: expected {expected}, got {got}")]
    OutOfSequence { expected: u8, got: u8 },
    #[error("gave up after {0} consecutive failed attempts")]
    RetriesExhausted(usize),
    #[error("transfer complete")]
    TransferComplete,
}

// ============================================================================
// States
// ============================================================================

pub struct SendHandshake;
pub struct AwaitHeader;
pub struct ReadPacket;
pub struct CheckPacket;
pub struct Finish;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    path: PathBuf,
    file: Option<File>,
    mode: ChecksumMode,
    frame: [u8; MAX_FRAME_LEN],
    // Last accepted payload, held back until the next leading byte shows
    // whether it was the final block (EOT) and needs its padding trimmed
    pending: Option<[u8; BLOCK_SIZE]>,
    next_block: u8,
    retries: usize,
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiverState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError>;
}

// ============================================================================
// Helpers
// ============================================================================

impl<S> ReceiverFsm<S> {
    fn transition<T>(self) -> Box<ReceiverFsm<T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            serial: self.serial,
            path: self.path,
            file: self.file,
            mode: self.mode,
            frame: self.frame,
            pending: self.pending,
            next_block: self.next_block,
            retries: self.retries,
        })
    }

    fn io_error(&self, e: std::io::Error) -> ReceiverError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        ReceiverError::Io(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name),
        ))
    }

    /// Reject the current exchange and go back to reading a leading byte,
    /// so a retransmitted SOH is consumed as a header.
    fn nak_and_retry(mut self) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        self.serial.write_all(&[NAK])?;
        self.retries += 1;
        if self.retries >= MAX_RETRIES {
            Err(ReceiverError::RetriesExhausted(self.retries))
        } else {
            Ok(self.transition::<AwaitHeader>() as Box<dyn ReceiverState>)
        }
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl ReceiverState for ReceiverFsm<SendHandshake> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        if fsm.file.is_none() {
            fsm.file = Some(File::create(&fsm.path)?);
            debug!("created {:?}", fsm.path);
        }

        fsm.serial.write_all(&[fsm.mode.request_byte()])?;
        debug!("requested {:?} mode", fsm.mode);

        let next = fsm.transition::<AwaitHeader>();
        Ok(next as Box<dyn ReceiverState>)
    }
}

impl ReceiverState for ReceiverFsm<AwaitHeader> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        let mut buf = [0u8; 1];
        match fsm.serial.read_timeout(&mut buf, Duration::from_secs(5)) {
            Ok(_) if buf[0] == SOH => {
                let next = fsm.transition::<ReadPacket>();
                Ok(next as Box<dyn ReceiverState>)
            }
            Ok(_) if buf[0] == EOT => {
                debug!("received EOT");
                let next = fsm.transition::<Finish>();
                Ok(next as Box<dyn ReceiverState>)
            }
            Ok(_) => {
                debug!("unexpected byte 0x{:02X}, sending NAK", buf[0]);
                fsm.nak_and_retry()
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                fsm.retries += 1;
                if fsm.retries >= MAX_RETRIES {
                    Err(ReceiverError::RetriesExhausted(fsm.retries))
                } else if fsm.pending.is_none() {
                    // Sender may have missed the opening handshake; repeat it
                    debug!("sender not started, repeating mode request");
                    let next = fsm.transition::<SendHandshake>();
                    Ok(next as Box<dyn ReceiverState>)
                } else {
                    debug!("timed out waiting for a header, sending NAK");
                    fsm.serial.write_all(&[NAK])?;
                    Ok(Box::new(fsm) as Box<dyn ReceiverState>)
                }
            }
            Err(e) => Err(fsm.io_error(e)),
        }
    }
}

impl ReceiverState for ReceiverFsm<ReadPacket> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        let len = frame_len(fsm.mode);
        fsm.frame[0] = SOH;
        match fsm
            .serial
            .read_exact_timeout(&mut fsm.frame[1..len], Duration::from_secs(2))
        {
            Ok(()) => {
                let next = fsm.transition::<CheckPacket>();
                Ok(next as Box<dyn ReceiverState>)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                debug!("packet truncated, sending NAK");
                fsm.nak_and_retry()
            }
            Err(e) => Err(fsm.io_error(e)),
        }
    }
}

impl ReceiverState for ReceiverFsm<CheckPacket> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        let len = frame_len(fsm.mode);
        let Some(packet) = Packet::decode(&fsm.frame[..len], fsm.mode) else {
            return fsm.nak_and_retry();
        };

        if packet.block as u16 + packet.complement as u16 != 255 {
            debug!("complement mismatch on block {}", packet.block);
            return fsm.nak_and_retry();
        }

        if block_check(&packet.payload, fsm.mode) != packet.check {
            debug!("check value mismatch on block {}", packet.block);
            return fsm.nak_and_retry();
        }

        if fsm.pending.is_some() && packet.block == fsm.next_block.wrapping_sub(1) {
            // Retransmission of a block we already accepted; the sender
            // missed our ACK. Acknowledge again and drop the copy.
            debug!("duplicate block {}, re-acknowledging", packet.block);
            fsm.serial.write_all(&[ACK])?;
            let next = fsm.transition::<AwaitHeader>();
            return Ok(next as Box<dyn ReceiverState>);
        }

        if packet.block != fsm.next_block {
            return Err(ReceiverError::OutOfSequence {
                expected: fsm.next_block,
                got: packet.block,
            });
        }

        // A new block proves the held one was not the last; flush it in full
        if let Some(block) = fsm.pending.take() {
            if let Some(ref mut file) = fsm.file {
                file.write_all(&block)?;
            }
        }

        fsm.pending = Some(packet.payload);
        fsm.next_block = fsm.next_block.wrapping_add(1);
        fsm.retries = 0;

        fsm.serial.write_all(&[ACK])?;
        debug!("accepted block {}", packet.block);

        let next = fsm.transition::<AwaitHeader>();
        Ok(next as Box<dyn ReceiverState>)
    }
}

impl ReceiverState for ReceiverFsm<Finish> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        if let Some(block) = fsm.pending.take() {
            // The final block: strip the 0x1A padding the sender appended.
            // An all-padding block yields nothing to write.
            let data_len = block.iter().rposition(|&b| b != PAD).map_or(0, |i| i + 1);
            if let Some(ref mut file) = fsm.file {
                file.write_all(&block[..data_len])?;
            }
            debug!("final block trimmed to {} bytes", data_len);
        }

        fsm.file = None;
        fsm.serial.write_all(&[ACK])?;
        debug!("acknowledged EOT");

        Err(ReceiverError::TransferComplete)
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl ReceiverFsm<SendHandshake> {
    pub fn new(
        serial: Box<dyn SerialPort>,
        path: PathBuf,
        mode: ChecksumMode,
    ) -> Box<dyn ReceiverState> {
        Box::new(ReceiverFsm {
            state: PhantomData::<SendHandshake>,
            serial,
            path,
            file: None,
            mode,
            frame: [0; MAX_FRAME_LEN],
            pending: None,
            next_block: 1,
            retries: 0,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
