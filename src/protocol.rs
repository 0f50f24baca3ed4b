//! Frame encoding and validation for the Diematic register protocol.
//!
//! The regulator speaks Modbus RTU framing tunnelled through a serial to TCP
//! adapter. Every frame sent to the device carries one extra filler byte
//! after the checksum which is not covered by it.
use crc::{Crc, CRC_16_MODBUS};
use tokio_modbus::{Address, FunctionCode, Quantity, Slave};

/// Raw frame as it travels over the wire.
pub type Frame = Vec<u8>;

pub const DEFAULT_DEVICE_ADDRESS: u8 = 0x0A;

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Filler byte appended to every request.
pub const FRAME_FILLER: u8 = 0x00;

pub const ANSWER_FRAME_MAX_LENGTH: usize = 0x100;
pub const WRITE_ACK_LENGTH: usize = 8;
pub const MAX_WRITE_QUANTITY: usize = 123;

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Per-frame validation failures. None of them is fatal for the link.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Reply from device {actual:#04x}, expected {expected:#04x}")]
    AddressMismatch { expected: u8, actual: u8 },
    #[error("Unknown function code {0:#04x}")]
    UnknownFunction(u8),
    #[error("Reply too short: {actual} bytes, expected at least {expected}")]
    LengthError { expected: usize, actual: usize },
    #[error("Checksum mismatch: computed {computed:#06x}, received {received:#06x}")]
    ChecksumError { computed: u16, received: u16 },
    #[error("Cannot write {0} registers in one frame")]
    TooManyRegisters(usize),
}

/// A validated reply, borrowing from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedReply<'a> {
    pub function: u8,
    /// Declared byte count for reads, always 4 for write acknowledgements.
    pub byte_count: u8,
    /// Register data for reads, the echoed start address and quantity for writes.
    pub payload: &'a [u8],
    /// Number of bytes the frame occupies, checksum included.
    pub frame_len: usize,
}

impl ParsedReply<'_> {
    pub fn is_read(&self) -> bool {
        self.function == READ_HOLDING_REGISTERS
    }

    /// Start address and quantity echoed by a write acknowledgement.
    pub fn write_echo(&self) -> Option<(Address, Quantity)> {
        match self.payload {
            [a_hi, a_lo, q_hi, q_lo] if !self.is_read() => Some((
                u16::from_be_bytes([*a_hi, *a_lo]),
                u16::from_be_bytes([*q_hi, *q_lo]),
            )),
            _ => None,
        }
    }
}

/// CRC-16 as used by Modbus RTU.
pub fn checksum(bytes: &[u8]) -> u16 {
    CRC_MODBUS.checksum(bytes)
}

fn seal(mut frame: Frame) -> Frame {
    let crc = checksum(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.push(FRAME_FILLER);
    frame
}

pub fn encode_read_request(device: Slave, start: Address, count: Quantity) -> Frame {
    let mut frame = Vec::with_capacity(9);
    frame.push(device.0);
    frame.push(FunctionCode::ReadHoldingRegisters.value());
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    seal(frame)
}

pub fn encode_write_request(
    device: Slave,
    start: Address,
    values: &[u16],
) -> Result<Frame, FrameError> {
    if values.is_empty() || values.len() > MAX_WRITE_QUANTITY {
        return Err(FrameError::TooManyRegisters(values.len()));
    }
    let mut frame = Vec::with_capacity(10 + 2 * values.len());
    frame.push(device.0);
    frame.push(FunctionCode::WriteMultipleRegisters.value());
    frame.extend_from_slice(&start.to_be_bytes());
    frame.push(0x00);
    frame.push(values.len() as u8);
    frame.push(2 * values.len() as u8);
    for value in values {
        frame.extend_from_slice(&value.to_be_bytes());
    }
    Ok(seal(frame))
}

/// Builds the acknowledgement the device echoes for a write request.
///
/// Returns `None` if `request` is not a write request.
pub fn expected_write_ack(request: &[u8]) -> Option<[u8; WRITE_ACK_LENGTH]> {
    if request.len() < 6 || request[1] != WRITE_MULTIPLE_REGISTERS {
        return None;
    }
    let mut ack = [0u8; WRITE_ACK_LENGTH];
    ack[..6].copy_from_slice(&request[..6]);
    let crc = checksum(&ack[..6]);
    ack[6..].copy_from_slice(&crc.to_le_bytes());
    Some(ack)
}

fn verify_checksum(frame: &[u8]) -> Result<(), FrameError> {
    let (body, trailer) = frame.split_at(frame.len() - 2);
    let computed = checksum(body);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    if computed == received {
        Ok(())
    } else {
        Err(FrameError::ChecksumError { computed, received })
    }
}

fn require_len(bytes: &[u8], expected: usize) -> Result<(), FrameError> {
    if bytes.len() < expected {
        Err(FrameError::LengthError {
            expected,
            actual: bytes.len(),
        })
    } else {
        Ok(())
    }
}

/// Validates a reply received from `device`.
///
/// Bytes past the declared end of the frame (filler or the start of the next
/// frame) are ignored; `ParsedReply::frame_len` tells how many were consumed.
pub fn validate_reply(bytes: &[u8], device: Slave) -> Result<ParsedReply<'_>, FrameError> {
    require_len(bytes, 2)?;
    if bytes[0] != device.0 {
        return Err(FrameError::AddressMismatch {
            expected: device.0,
            actual: bytes[0],
        });
    }
    match FunctionCode::new(bytes[1]) {
        FunctionCode::ReadHoldingRegisters => {
            require_len(bytes, 3)?;
            let byte_count = bytes[2];
            let frame_len = 5 + usize::from(byte_count);
            require_len(bytes, frame_len)?;
            verify_checksum(&bytes[..frame_len])?;
            Ok(ParsedReply {
                function: READ_HOLDING_REGISTERS,
                byte_count,
                payload: &bytes[3..frame_len - 2],
                frame_len,
            })
        }
        FunctionCode::WriteMultipleRegisters => {
            require_len(bytes, WRITE_ACK_LENGTH)?;
            verify_checksum(&bytes[..WRITE_ACK_LENGTH])?;
            Ok(ParsedReply {
                function: WRITE_MULTIPLE_REGISTERS,
                byte_count: 4,
                payload: &bytes[2..6],
                frame_len: WRITE_ACK_LENGTH,
            })
        }
        _ => Err(FrameError::UnknownFunction(bytes[1])),
    }
}
