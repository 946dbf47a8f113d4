//! CAN datagram encoding and fragmentation
//!
//! A datagram is laid out as
//! `version | crc32 | destination count | destinations | data length | data`
//! with big endian integers, and the CRC covering everything after the CRC
//! field. Datagrams are carried in CAN frames of up to 8 bytes, the first
//! frame of a datagram is flagged with [`START_OF_DATAGRAM_MASK`].

use crate::protocol::{crc32, ProtocolError};

pub const DATAGRAM_VERSION: u8 = 1;

pub const START_OF_DATAGRAM_MASK: u16 = 1 << 7;
pub const ID_FIELD_MASK: u16 = 0x7f;

/// Maximum payload carried by a single CAN frame
pub const FRAME_DATA_MAX: usize = 8;

/// Upper bound for the declared data length of a received datagram
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

const HEADER_SIZE: usize = 1 + 4 + 1;

/// CAN frame as exchanged with the bridge
#[derive(Clone, PartialEq, Debug)]
pub struct Frame {
    pub id: u16,
    pub extended: bool,
    pub rtr: bool,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(id: u16, data: &[u8]) -> Self {
        Self {
            id,
            extended: false,
            rtr: false,
            data: data.to_vec(),
        }
    }

    /// Node id of the frame sender
    pub fn source(&self) -> u8 {
        (self.id & ID_FIELD_MASK) as u8
    }

    pub fn is_start_of_datagram(&self) -> bool {
        self.id & START_OF_DATAGRAM_MASK != 0
    }
}

/// Complete datagram received from the bus
#[derive(Clone, PartialEq, Debug)]
pub struct Datagram {
    pub source: u8,
    pub destinations: Vec<u8>,
    pub data: Vec<u8>,
}

/// Outcome of decoding a reassembly buffer
#[derive(Clone, PartialEq, Debug)]
pub enum Decoded {
    /// The buffer holds a valid prefix, more frames are needed
    Incomplete,
    /// The buffer holds exactly one datagram
    Complete { destinations: Vec<u8>, data: Vec<u8> },
}

/// Wrap data into a datagram addressed to the given node ids
pub fn encode_datagram(data: &[u8], destinations: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + destinations.len() + 4 + data.len());
    body.push(destinations.len() as u8);
    body.extend_from_slice(destinations);
    body.extend_from_slice(&(data.len() as u32).to_be_bytes());
    body.extend_from_slice(data);

    let mut datagram = Vec::with_capacity(HEADER_SIZE + body.len());
    datagram.push(DATAGRAM_VERSION);
    datagram.extend_from_slice(&crc32(&body).to_be_bytes());
    datagram.extend_from_slice(&body);
    datagram
}

/// Split a datagram into CAN frames sent by `source`
pub fn datagram_to_frames(datagram: &[u8], source: u8) -> Vec<Frame> {
    let id = source as u16 & ID_FIELD_MASK;

    datagram
        .chunks(FRAME_DATA_MAX)
        .enumerate()
        .map(|(i, c)| {
            let start = if i == 0 { START_OF_DATAGRAM_MASK } else { 0 };
            Frame::new(start | id, c)
        })
        .collect()
}

/// Decode a reassembly buffer
///
/// The header is validated as soon as each field is available, so a corrupt
/// buffer is reported without waiting for more frames. A buffer longer than
/// its declared length is malformed.
pub fn decode_datagram(buff: &[u8]) -> Result<Decoded, ProtocolError> {
    if buff.is_empty() {
        return Ok(Decoded::Incomplete);
    }
    if buff[0] != DATAGRAM_VERSION {
        return Err(ProtocolError::VersionMismatch(buff[0]));
    }
    if buff.len() < HEADER_SIZE {
        return Ok(Decoded::Incomplete);
    }

    let count = buff[5] as usize;
    if count == 0 {
        return Err(ProtocolError::MalformedDatagram("no destinations"));
    }

    let len_offset = HEADER_SIZE + count;
    let data_offset = len_offset + 4;
    if buff.len() < data_offset {
        return Ok(Decoded::Incomplete);
    }

    let mut len = [0u8; 4];
    len.copy_from_slice(&buff[len_offset..data_offset]);
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_DATAGRAM_SIZE {
        return Err(ProtocolError::MalformedDatagram("declared length too large"));
    }

    let total = data_offset + len;
    if buff.len() < total {
        return Ok(Decoded::Incomplete);
    }
    if buff.len() > total {
        return Err(ProtocolError::MalformedDatagram("trailing bytes after datagram"));
    }

    let mut expected = [0u8; 4];
    expected.copy_from_slice(&buff[1..5]);
    let expected = u32::from_be_bytes(expected);
    let computed = crc32(&buff[5..]);
    if expected != computed {
        return Err(ProtocolError::CrcMismatch { expected, computed });
    }

    Ok(Decoded::Complete {
        destinations: buff[HEADER_SIZE..len_offset].to_vec(),
        data: buff[data_offset..].to_vec(),
    })
}
