//! CAN bridge frame encoding
//!
//! The bridge accepts commands as `[command, arguments]` msgpack arrays and
//! reports received bus frames as `[extended, rtr, id, data]`.

use std::convert::TryFrom;

use crate::can::Frame;
use crate::protocol::{decode_value, encode_value, ProtocolError, Value};

/// Bridge command transmitting a frame on the bus
pub const BRIDGE_TX_FRAME: u8 = 0;

fn frame_to_value(frame: &Frame) -> Value {
    Value::Array(vec![
        Value::Boolean(frame.extended),
        Value::Boolean(frame.rtr),
        Value::from(frame.id),
        Value::Binary(frame.data.clone()),
    ])
}

fn frame_from_value(value: Value) -> Result<Frame, ProtocolError> {
    let fields = match value {
        Value::Array(fields) if fields.len() == 4 => fields,
        other => {
            return Err(ProtocolError::UnexpectedValue(format!("bridge frame {}", other)))
        }
    };

    let mut fields = fields.into_iter();
    let (extended, rtr, id, data) = match (fields.next(), fields.next(), fields.next(), fields.next()) {
        (
            Some(Value::Boolean(extended)),
            Some(Value::Boolean(rtr)),
            Some(id),
            Some(Value::Binary(data)),
        ) => (extended, rtr, id, data),
        _ => return Err(ProtocolError::UnexpectedValue("bridge frame fields".into())),
    };

    let id = id
        .as_u64()
        .and_then(|id| u16::try_from(id).ok())
        .ok_or_else(|| ProtocolError::UnexpectedValue(format!("frame id {}", id)))?;

    Ok(Frame {
        id,
        extended,
        rtr,
        data,
    })
}

/// Wrap a frame into a bridge transmit command
pub fn encode_frame_command(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    encode_value(&Value::Array(vec![
        Value::from(BRIDGE_TX_FRAME),
        frame_to_value(frame),
    ]))
}

/// Parse a bridge transmit command back into its frame
pub fn decode_frame_command(data: &[u8]) -> Result<Frame, ProtocolError> {
    match decode_value(data)? {
        Value::Array(mut v) if v.len() == 2 && v[0] == Value::from(BRIDGE_TX_FRAME) => {
            frame_from_value(v.remove(1))
        }
        other => Err(ProtocolError::UnexpectedValue(format!("bridge command {}", other))),
    }
}

/// Encode a frame as reported by the bridge
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    encode_value(&frame_to_value(frame))
}

/// Decode a frame reported by the bridge
pub fn decode_frame(data: &[u8]) -> Result<Frame, ProtocolError> {
    frame_from_value(decode_value(data)?)
}
