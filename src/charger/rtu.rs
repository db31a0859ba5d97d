//! Register-protocol RTU framing: request builders and response validation.
//!
//! Frames are `[address, function, payload.., crc_lo, crc_hi]` with the
//! standard CRC-16/MODBUS trailer.

use crate::error::{Result, ZeroGridError};

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
const EXCEPTION_FLAG: u8 = 0x80;

/// Bytes of a response that identify how long the rest of it is
pub const HEADER_LEN: usize = 3;

pub fn crc(data: &[u8]) -> u16 {
    crc16::State::<crc16::MODBUS>::calculate(data)
}

fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

pub fn read_request(address: u8, start: u16, count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(address);
    frame.push(READ_HOLDING_REGISTERS);
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    with_crc(frame)
}

pub fn write_request(address: u8, register: u16, value: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(address);
    frame.push(WRITE_SINGLE_REGISTER);
    frame.extend_from_slice(&register.to_be_bytes());
    frame.extend_from_slice(&value.to_be_bytes());
    with_crc(frame)
}

/// Bytes still to read after the first [`HEADER_LEN`] bytes of a response.
/// Unrecognised function codes are sized like an exception so the frame is
/// consumed and then rejected by validation.
pub fn remaining_len(function: u8, third: u8) -> usize {
    match function {
        READ_HOLDING_REGISTERS => third as usize + 2,
        WRITE_SINGLE_REGISTER => 5,
        _ => 2,
    }
}

pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        _ => "Unknown Exception",
    }
}

/// Check length, CRC, address and function; return the payload between the
/// function byte and the CRC.
fn validate<'a>(address: u8, function: u8, frame: &'a [u8]) -> Result<&'a [u8]> {
    if frame.len() < 5 {
        return Err(ZeroGridError::protocol(format!(
            "RTU frame too short: {} bytes",
            frame.len()
        )));
    }
    let body_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
    let calculated = crc(&frame[..body_len]);
    if received != calculated {
        return Err(ZeroGridError::protocol(format!(
            "CRC mismatch: expected 0x{calculated:04X}, got 0x{received:04X}"
        )));
    }
    if frame[0] != address {
        return Err(ZeroGridError::protocol(format!(
            "Response from unexpected address {} (expected {})",
            frame[0], address
        )));
    }
    if frame[1] == function | EXCEPTION_FLAG {
        return Err(ZeroGridError::protocol(format!(
            "Device exception 0x{:02X}: {}",
            frame[2],
            exception_description(frame[2])
        )));
    }
    if frame[1] != function {
        return Err(ZeroGridError::protocol(format!(
            "Function code mismatch: expected 0x{function:02X}, got 0x{:02X}",
            frame[1]
        )));
    }
    Ok(&frame[2..body_len])
}

pub fn parse_read_response(address: u8, count: u16, frame: &[u8]) -> Result<Vec<u16>> {
    let payload = validate(address, READ_HOLDING_REGISTERS, frame)?;
    let byte_count = payload[0] as usize;
    let data = &payload[1..];
    if byte_count != count as usize * 2 || data.len() != byte_count {
        return Err(ZeroGridError::protocol(format!(
            "Expected {} registers, got {} bytes",
            count,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

pub fn parse_write_response(address: u8, register: u16, value: u16, frame: &[u8]) -> Result<()> {
    let payload = validate(address, WRITE_SINGLE_REGISTER, frame)?;
    if payload.len() != 4 {
        return Err(ZeroGridError::protocol("Malformed write echo"));
    }
    let echoed_register = u16::from_be_bytes([payload[0], payload[1]]);
    let echoed_value = u16::from_be_bytes([payload[2], payload[3]]);
    if echoed_register != register || echoed_value != value {
        return Err(ZeroGridError::protocol(format!(
            "Write echo mismatch: {}={} (sent {}={})",
            echoed_register, echoed_value, register, value
        )));
    }
    Ok(())
}
