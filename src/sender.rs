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

use crate::packet::Packet;
use crate::protocol::*;
use crate::serial::SerialPort;
use std::fs::File;
use std::io::Read;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected handshake byte 0x{0:02X} from receiver")]
    ModeNegotiation(u8),
    #[error("gave up after {0} consecutive failed attempts")]
    RetriesExhausted(usize),
    #[error("transfer complete")]
    TransferComplete,
}

// ============================================================================
// States
// ============================================================================

pub struct AwaitMode;
pub struct PrepareBlock;
pub struct TransmitBlock;
pub struct AwaitAck;
pub struct SendEot;
pub struct AwaitEotAck;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SenderFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    path: PathBuf,
    file: Option<File>,
    mode: ChecksumMode,
    buffer: [u8; BLOCK_SIZE],
    block_num: u8,
    retransmit: bool,
    retries: usize,
    byte_delay: u8,
}

// ============================================================================
// Trait
// ============================================================================

pub trait SenderState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError>;
}

// ============================================================================
// Helpers
// ============================================================================

impl<S> SenderFsm<S> {
    fn transition<T>(self) -> Box<SenderFsm<T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            serial: self.serial,
            path: self.path,
            file: self.file,
            mode: self.mode,
            buffer: self.buffer,
            block_num: self.block_num,
            retransmit: self.retransmit,
            retries: self.retries,
            byte_delay: self.byte_delay,
        })
    }

    fn io_error(&self, e: std::io::Error) -> SenderError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        SenderError::Io(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name),
        ))
    }
}

fn read_chunk(file: &mut File, buf: &mut [u8; BLOCK_SIZE]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// ============================================================================
// State Implementations
// ============================================================================

impl SenderState for SenderFsm<AwaitMode> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        let mut buf = [0u8; 1];
        match fsm.serial.read_timeout(&mut buf, Duration::from_secs(5)) {
            Ok(_) if buf[0] == NAK => {
                fsm.mode = ChecksumMode::Checksum;
                debug!("receiver requested checksum mode");
                fsm.file = Some(File::open(&fsm.path)?);
                fsm.retries = 0;
                let next = fsm.transition::<PrepareBlock>();
                Ok(next as Box<dyn SenderState>)
            }
            Ok(_) if buf[0] == CRC_REQUEST => {
                fsm.mode = ChecksumMode::Crc;
                debug!("receiver requested CRC mode");
                fsm.file = Some(File::open(&fsm.path)?);
                fsm.retries = 0;
                let next = fsm.transition::<PrepareBlock>();
                Ok(next as Box<dyn SenderState>)
            }
            Ok(_) => Err(SenderError::ModeNegotiation(buf[0])),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                debug!("receiver not ready");
                fsm.retries += 1;
                if fsm.retries >= MAX_RETRIES {
                    Err(SenderError::RetriesExhausted(fsm.retries))
                } else {
                    Ok(Box::new(fsm) as Box<dyn SenderState>)
                }
            }
            Err(e) => Err(fsm.io_error(e)),
        }
    }
}

impl SenderState for SenderFsm<PrepareBlock> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        let is_eof = if fsm.retransmit {
            // Reuse the prepared buffer so the retransmission is
            // byte-identical on the wire
            fsm.retransmit = false;
            debug!("retransmitting block {}", fsm.block_num);
            false
        } else {
            let bytes_read = if let Some(ref mut file) = fsm.file {
                read_chunk(file, &mut fsm.buffer)?
            } else {
                0
            };

            if bytes_read == 0 {
                true
            } else {
                for slot in fsm.buffer[bytes_read..].iter_mut() {
                    *slot = PAD;
                }
                debug!("prepared block {} ({} file bytes)", fsm.block_num, bytes_read);
                false
            }
        };

        if is_eof {
            let next = fsm.transition::<SendEot>();
            Ok(next as Box<dyn SenderState>)
        } else {
            let next = fsm.transition::<TransmitBlock>();
            Ok(next as Box<dyn SenderState>)
        }
    }
}

impl SenderState for SenderFsm<TransmitBlock> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        let frame = Packet::encode(fsm.block_num, &fsm.buffer, fsm.mode);

        if fsm.byte_delay > 0 {
            // Pace the frame byte-by-byte for receivers with shallow buffers
            for &byte in &frame {
                fsm.serial.write_all(&[byte])?;
                std::thread::sleep(Duration::from_millis(fsm.byte_delay as u64));
            }
        } else {
            fsm.serial.write_all(&frame)?;
        }

        debug!("sent block {} ({} bytes on wire)", fsm.block_num, frame.len());

        let next = fsm.transition::<AwaitAck>();
        Ok(next as Box<dyn SenderState>)
    }
}

impl SenderState for SenderFsm<AwaitAck> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        let mut buf = [0u8; 1];
        match fsm.serial.read_timeout(&mut buf, Duration::from_secs(2)) {
            Ok(_) if buf[0] == ACK => {
                debug!("block {} acknowledged", fsm.block_num);
                fsm.block_num = fsm.block_num.wrapping_add(1);
                fsm.retries = 0;
                let next = fsm.transition::<PrepareBlock>();
                Ok(next as Box<dyn SenderState>)
            }
            Ok(_) => {
                // Anything other than ACK calls for a retransmission
                debug!("got 0x{:02X}, retransmitting block {}", buf[0], fsm.block_num);
                fsm.retransmit = true;
                fsm.retries += 1;
                if fsm.retries >= MAX_RETRIES {
                    Err(SenderError::RetriesExhausted(fsm.retries))
                } else {
                    let next = fsm.transition::<PrepareBlock>();
                    Ok(next as Box<dyn SenderState>)
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                debug!("no reply for block {}, retransmitting", fsm.block_num);
                fsm.retransmit = true;
                fsm.retries += 1;
                if fsm.retries >= MAX_RETRIES {
                    Err(SenderError::RetriesExhausted(fsm.retries))
                } else {
                    let next = fsm.transition::<PrepareBlock>();
                    Ok(next as Box<dyn SenderState>)
                }
            }
            Err(e) => Err(fsm.io_error(e)),
        }
    }
}

impl SenderState for SenderFsm<SendEot> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        fsm.file = None;
        fsm.serial.write_all(&[EOT])?;
        debug!("sent EOT");

        let next = fsm.transition::<AwaitEotAck>();
        Ok(next as Box<dyn SenderState>)
    }
}

impl SenderState for SenderFsm<AwaitEotAck> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        let mut buf = [0u8; 1];
        match fsm.serial.read_timeout(&mut buf, Duration::from_secs(2)) {
            Ok(_) if buf[0] == ACK => {
                debug!("EOT acknowledged");
                Err(SenderError::TransferComplete)
            }
            Ok(_) => {
                debug!("got 0x{:02X}, resending EOT", buf[0]);
                fsm.retries += 1;
                if fsm.retries >= MAX_RETRIES {
                    Err(SenderError::RetriesExhausted(fsm.retries))
                } else {
                    let next = fsm.transition::<SendEot>();
                    Ok(next as Box<dyn SenderState>)
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                debug!("no reply to EOT, resending");
                fsm.retries += 1;
                if fsm.retries >= MAX_RETRIES {
                    Err(SenderError::RetriesExhausted(fsm.retries))
                } else {
                    let next = fsm.transition::<SendEot>();
                    Ok(next as Box<dyn SenderState>)
                }
            }
            Err(e) => Err(fsm.io_error(e)),
        }
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl SenderFsm<AwaitMode> {
    pub fn new(serial: Box<dyn SerialPort>, path: PathBuf, byte_delay: u8) -> Box<dyn SenderState> {
        Box::new(SenderFsm {
            state: PhantomData::<AwaitMode>,
            serial,
            path,
            file: None,
            mode: ChecksumMode::Checksum,
            buffer: [0; BLOCK_SIZE],
            block_num: 1,
            retransmit: false,
            retries: 0,
            byte_delay,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockSerialPort;

    fn run_sender(mut fsm: Box<dyn SenderState>) -> Result<(), SenderError> {
        loop {
            match fsm.step() {
                Ok(next) => fsm = next,
                Err(SenderError::TransferComplete) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn write_temp(name: &str, content: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn padded_block(data: &[u8]) -> [u8; BLOCK_SIZE] {
        let mut block = [PAD; BLOCK_SIZE];
        block[..data.len()].copy_from_slice(data);
        block
    }

    #[test]
    fn test_sender_full_transfer_checksum_mode() {
        let path = write_temp("sender_small.txt", b"AB\n");

        let responses = vec![Some(NAK), Some(ACK), Some(ACK)];

        let mut expected_writes = Packet::encode(1, &padded_block(b"AB\n"), ChecksumMode::Checksum);
        expected_writes.push(EOT);

        let mock = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = SenderFsm::new(mock, path.clone(), 0);

        run_sender(fsm).expect("transfer should complete");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sender_honors_crc_mode_from_first_block() {
        let path = write_temp("sender_crc.txt", b"crc mode");

        let responses = vec![Some(CRC_REQUEST), Some(ACK), Some(ACK)];

        let mut expected_writes = Packet::encode(1, &padded_block(b"crc mode"), ChecksumMode::Crc);
        expected_writes.push(EOT);

        let mock = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = SenderFsm::new(mock, path.clone(), 0);

        run_sender(fsm).expect("transfer should complete");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sender_nak_retransmits_identical_bytes() {
        let path = write_temp("sender_retry.txt", b"retry");

        let responses = vec![Some(NAK), Some(NAK), Some(ACK), Some(ACK)];

        let frame = Packet::encode(1, &padded_block(b"retry"), ChecksumMode::Checksum);
        let mut expected_writes = frame.clone();
        expected_writes.extend_from_slice(&frame);
        expected_writes.push(EOT);

        let mock = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = SenderFsm::new(mock, path.clone(), 0);

        run_sender(fsm).expect("transfer should complete");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sender_empty_file_sends_only_eot() {
        let path = write_temp("sender_empty.txt", b"");

        let responses = vec![Some(NAK), Some(ACK)];
        let expected_writes = vec![EOT];

        let mock = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = SenderFsm::new(mock, path.clone(), 0);

        run_sender(fsm).expect("transfer should complete");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sender_exact_multiple_has_no_padding() {
        let content: Vec<u8> = (0..256u32).map(|i| (i % 251) as u8).collect();
        let path = write_temp("sender_multiple.txt", &content);

        let responses = vec![Some(NAK), Some(ACK), Some(ACK), Some(ACK)];

        let mut first = [0u8; BLOCK_SIZE];
        first.copy_from_slice(&content[..128]);
        let mut second = [0u8; BLOCK_SIZE];
        second.copy_from_slice(&content[128..]);

        let mut expected_writes = Packet::encode(1, &first, ChecksumMode::Checksum);
        expected_writes.extend_from_slice(&Packet::encode(2, &second, ChecksumMode::Checksum));
        expected_writes.push(EOT);

        let mock = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = SenderFsm::new(mock, path.clone(), 0);

        run_sender(fsm).expect("transfer should complete");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sender_pads_short_final_block() {
        // 130 bytes: one full block, then one block with 126 pad bytes
        let content: Vec<u8> = (0..130u32).map(|i| (i + 1) as u8).collect();
        let path = write_temp("sender_130.txt", &content);

        let responses = vec![Some(NAK), Some(ACK), Some(ACK), Some(ACK)];

        let mut first = [0u8; BLOCK_SIZE];
        first.copy_from_slice(&content[..128]);
        let second = padded_block(&content[128..]);
        assert_eq!(second.iter().filter(|&&b| b == PAD).count(), 126);

        let mut expected_writes = Packet::encode(1, &first, ChecksumMode::Checksum);
        expected_writes.extend_from_slice(&Packet::encode(2, &second, ChecksumMode::Checksum));
        expected_writes.push(EOT);

        let mock = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = SenderFsm::new(mock, path.clone(), 0);

        run_sender(fsm).expect("transfer should complete");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sender_aborts_on_unknown_handshake_byte() {
        let path = write_temp("sender_abort.txt", b"never sent");

        let responses = vec![Some(0x00)];
        // No data packet may reach the wire
        let expected_writes = vec![];

        let mock = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = SenderFsm::new(mock, path.clone(), 0);

        match run_sender(fsm) {
            Err(SenderError::ModeNegotiation(0x00)) => {}
            other => panic!("expected mode negotiation failure, got {:?}", other.err()),
        }

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sender_gives_up_after_retry_ceiling() {
        let path = write_temp("sender_ceiling.txt", b"stubborn");

        let mut responses = vec![Some(NAK)];
        responses.extend(std::iter::repeat(Some(NAK)).take(MAX_RETRIES));

        let frame = Packet::encode(1, &padded_block(b"stubborn"), ChecksumMode::Checksum);
        let mut expected_writes = Vec::new();
        for _ in 0..MAX_RETRIES {
            expected_writes.extend_from_slice(&frame);
        }

        let mock = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = SenderFsm::new(mock, path.clone(), 0);

        match run_sender(fsm) {
            Err(SenderError::RetriesExhausted(n)) => assert_eq!(n, MAX_RETRIES),
            other => panic!("expected retries exhausted, got {:?}", other.err()),
        }

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sender_resends_eot_until_acknowledged() {
        let path = write_temp("sender_eot.txt", b"x");

        let responses = vec![Some(NAK), Some(ACK), Some(NAK), Some(ACK)];

        let mut expected_writes = Packet::encode(1, &padded_block(b"x"), ChecksumMode::Checksum);
        expected_writes.push(EOT);
        expected_writes.push(EOT);

        let mock = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = SenderFsm::new(mock, path.clone(), 0);

        run_sender(fsm).expect("transfer should complete");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sender_retries_handshake_on_timeout() {
        let path = write_temp("sender_slow_receiver.txt", b"y");

        let responses = vec![None, Some(NAK), Some(ACK), Some(ACK)];

        let mut expected_writes = Packet::encode(1, &padded_block(b"y"), ChecksumMode::Checksum);
        expected_writes.push(EOT);

        let mock = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = SenderFsm::new(mock, path.clone(), 0);

        run_sender(fsm).expect("transfer should complete");

        std::fs::remove_file(&path).ok();
    }
}
