//! Serial datagram framing
//!
//! Units are SLIP escaped, carry a trailing big endian CRC32 of the payload
//! and are terminated by [`END`].

use crate::protocol::{crc32, ProtocolError};

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

const CRC_SIZE: usize = 4;

/// Largest unit accepted, bridge frames with their CRC are far smaller
pub const MAX_UNIT_SIZE: usize = 256;

/// Frame a payload for the stream layer
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + CRC_SIZE + 8);

    for b in data.iter().chain(crc32(data).to_be_bytes().iter()) {
        match *b {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            b => out.push(b),
        }
    }

    out.push(END);
    out
}

/// Incremental decoder for serial datagrams
///
/// Partial units are kept across calls so a read timeout in the middle of a
/// unit does not lose data.
#[derive(Default, Debug)]
pub struct Decoder {
    buff: Vec<u8>,
    escaped: bool,
    invalid: bool,
    overflow: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partially received unit
    pub fn reset(&mut self) {
        self.buff.clear();
        self.escaped = false;
        self.invalid = false;
        self.overflow = false;
    }

    /// Feed one byte, returning a result once a unit delimiter is seen
    pub fn push(&mut self, b: u8) -> Option<Result<Vec<u8>, ProtocolError>> {
        if b == END {
            let invalid = self.invalid || self.escaped;
            let overflow = self.overflow;
            let unit = std::mem::take(&mut self.buff);
            self.reset();

            if overflow {
                return Some(Err(ProtocolError::Decode("serial datagram too long".into())));
            }
            if invalid {
                return Some(Err(ProtocolError::Decode("invalid escape sequence".into())));
            }
            // Leading or repeated delimiters
            if unit.is_empty() {
                return None;
            }
            return Some(check_crc(unit));
        }

        if self.overflow {
            return None;
        }
        if self.buff.len() >= MAX_UNIT_SIZE {
            // Drop the unit until the next delimiter
            self.overflow = true;
            self.buff.clear();
            self.escaped = false;
            return None;
        }

        if self.escaped {
            self.escaped = false;
            match b {
                ESC_END => self.buff.push(END),
                ESC_ESC => self.buff.push(ESC),
                _ => self.invalid = true,
            }
        } else if b == ESC {
            self.escaped = true;
        } else {
            self.buff.push(b);
        }

        None
    }
}

fn check_crc(mut unit: Vec<u8>) -> Result<Vec<u8>, ProtocolError> {
    if unit.len() < CRC_SIZE {
        return Err(ProtocolError::Decode("serial datagram too short".into()));
    }

    let mut expected = [0u8; CRC_SIZE];
    expected.copy_from_slice(&unit[unit.len() - CRC_SIZE..]);
    let expected = u32::from_be_bytes(expected);

    unit.truncate(unit.len() - CRC_SIZE);
    let computed = crc32(&unit);

    if expected != computed {
        return Err(ProtocolError::CrcMismatch { expected, computed });
    }

    Ok(unit)
}
