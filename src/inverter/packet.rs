//! 8-byte power command understood by the grid-tie inverter.
//!
//! `[0x24, 0x56, 0x00, 0x21, power_hi, power_lo, 0x80, checksum]` with
//! `checksum = (264 - power_hi - power_lo) mod 256`.

use crate::error::{Result, ZeroGridError};

pub const HEADER: [u8; 4] = [36, 86, 0, 33];
pub const MARKER: u8 = 128;
pub const PACKET_LEN: usize = 8;

pub fn checksum(high: u8, low: u8) -> u8 {
    (264 - i32::from(high) - i32::from(low)).rem_euclid(256) as u8
}

/// Clamp into `[0, max_power]` watts
pub fn clamp_power(watts: i64, max_power: u16) -> u16 {
    watts.clamp(0, i64::from(max_power)) as u16
}

/// Encode a power command, clamping the value first
pub fn build_packet(watts: i64, max_power: u16) -> [u8; PACKET_LEN] {
    let [high, low] = clamp_power(watts, max_power).to_be_bytes();
    [
        HEADER[0],
        HEADER[1],
        HEADER[2],
        HEADER[3],
        high,
        low,
        MARKER,
        checksum(high, low),
    ]
}

/// Recover the commanded watts from a packet, validating every fixed byte
pub fn decode_packet(packet: &[u8]) -> Result<u16> {
    if packet.len() != PACKET_LEN {
        return Err(ZeroGridError::protocol(format!(
            "Inverter packet must be {} bytes, got {}",
            PACKET_LEN,
            packet.len()
        )));
    }
    if packet[..4] != HEADER {
        return Err(ZeroGridError::protocol("Inverter packet header mismatch"));
    }
    if packet[6] != MARKER {
        return Err(ZeroGridError::protocol(format!(
            "Inverter packet marker 0x{:02X} != 0x{:02X}",
            packet[6], MARKER
        )));
    }
    let (high, low) = (packet[4], packet[5]);
    let expected = checksum(high, low);
    if packet[7] != expected {
        return Err(ZeroGridError::protocol(format!(
            "Inverter packet checksum 0x{:02X} != 0x{:02X}",
            packet[7], expected
        )));
    }
    Ok(u16::from_be_bytes([high, low]))
}
