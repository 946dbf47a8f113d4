//! Bootloader command set and codec level definitions

use std::collections::BTreeMap;
use std::fmt;

pub use rmpv::Value;

/// Version of the command set understood by the bootloader
pub const COMMAND_SET_VERSION: u8 = 2;

/// Default erase page size
pub const PAGE_SIZE: usize = 2048;

/// Default transfer chunk size for write commands
pub const CHUNK_SIZE: usize = 2048;

/// Node id used by the host when originating commands
pub const HOST_ID: u8 = 0;

/// Highest node id that fits in a CAN frame id
pub const MAX_NODE_ID: u8 = 0x7f;

/// Config key holding the application size in bytes
pub const APPLICATION_SIZE_KEY: &str = "application_size";

/// Config key holding the CRC32 of the application image
pub const APPLICATION_CRC_KEY: &str = "application_crc";

/// Partial bootloader config, keys missing here are left untouched on the node
pub type Config = BTreeMap<String, Value>;

/// Codec level errors
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid destinations: {0}")]
    InvalidDestinations(&'static str),

    #[error("failed to encode value: {0}")]
    Encode(String),

    #[error("failed to decode value: {0}")]
    Decode(String),

    #[error("malformed datagram: {0}")]
    MalformedDatagram(&'static str),

    #[error("datagram version {0} not supported")]
    VersionMismatch(u8),

    #[error("CRC mismatch (expected 0x{expected:08x}, computed 0x{computed:08x})")]
    CrcMismatch { expected: u32, computed: u32 },

    #[error("unexpected value: {0}")]
    UnexpectedValue(String),
}

/// Non-empty set of unique node ids a command is addressed to
#[derive(Clone, PartialEq, Debug)]
pub struct Destinations(Vec<u8>);

impl Destinations {
    /// Validate and build a destination set, preserving the given order
    pub fn new<I: IntoIterator<Item = u8>>(ids: I) -> Result<Self, ProtocolError> {
        let mut nodes: Vec<u8> = Vec::new();

        for id in ids {
            if id == HOST_ID || id > MAX_NODE_ID {
                return Err(ProtocolError::InvalidDestinations("node ids must be in 1..=127"));
            }
            if nodes.contains(&id) {
                return Err(ProtocolError::InvalidDestinations("duplicate node id"));
            }
            nodes.push(id);
        }

        if nodes.is_empty() {
            return Err(ProtocolError::InvalidDestinations("at least one node is required"));
        }

        Ok(Self(nodes))
    }

    /// Destination set containing a single node
    pub fn single(id: u8) -> Result<Self, ProtocolError> {
        Self::new(Some(id))
    }

    pub fn ids(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: u8) -> bool {
        self.0.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.iter().copied()
    }
}

impl fmt::Display for Destinations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.0.iter().map(|id| id.to_string()).collect();
        write!(f, "{}", ids.join(", "))
    }
}

/// Bootloader commands
#[derive(Debug, PartialEq, Clone)]
pub enum Command<'a> {
    /// Leaves the bootloader and starts the application
    JumpToMain,

    /// Computes the CRC32 of a flash region
    CrcRegion { address: u32, length: u32 },

    /// Erases the flash page containing the address
    ErasePage { address: u32, device_class: &'a str },

    /// Writes data to flash starting at the address
    WriteFlash {
        address: u32,
        device_class: &'a str,
        data: &'a [u8],
    },

    /// Checks that a node is alive
    Ping,

    /// Merges the given keys into the node config
    UpdateConfig(&'a Config),

    /// Persists the node config to flash
    SaveConfig,

    /// Reads back the whole node config
    ReadConfig,
}

impl<'a> Command<'a> {
    /// Numeric command code on the wire
    pub fn code(&self) -> u8 {
        match self {
            Command::JumpToMain => 1,
            Command::CrcRegion { .. } => 2,
            Command::ErasePage { .. } => 3,
            Command::WriteFlash { .. } => 4,
            Command::Ping => 5,
            Command::UpdateConfig(_) => 7,
            Command::SaveConfig => 8,
            Command::ReadConfig => 9,
        }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Command::JumpToMain => "jump-to-main",
            Command::CrcRegion { .. } => "crc-region",
            Command::ErasePage { .. } => "erase-page",
            Command::WriteFlash { .. } => "write-flash",
            Command::Ping => "ping",
            Command::UpdateConfig(_) => "update-config",
            Command::SaveConfig => "save-config",
            Command::ReadConfig => "read-config",
        }
    }

    fn arguments(&self) -> Vec<Value> {
        match self {
            Command::JumpToMain | Command::Ping | Command::SaveConfig | Command::ReadConfig => {
                vec![]
            }
            Command::CrcRegion { address, length } => {
                vec![Value::from(*address), Value::from(*length)]
            }
            Command::ErasePage {
                address,
                device_class,
            } => vec![Value::from(*address), Value::from(*device_class)],
            Command::WriteFlash {
                address,
                device_class,
                data,
            } => vec![
                Value::from(*address),
                Value::from(*device_class),
                Value::Binary(data.to_vec()),
            ],
            Command::UpdateConfig(config) => vec![config_to_value(config)],
        }
    }

    /// Encode the command as `version | code | [arguments]`
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buff = Vec::new();

        for v in &[
            Value::from(COMMAND_SET_VERSION),
            Value::from(self.code()),
            Value::Array(self.arguments()),
        ] {
            rmpv::encode::write_value(&mut buff, v)
                .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        }

        Ok(buff)
    }
}

/// Convert a config into a msgpack map
pub fn config_to_value(config: &Config) -> Value {
    Value::Map(
        config
            .iter()
            .map(|(k, v)| (Value::from(k.as_str()), v.clone()))
            .collect(),
    )
}

/// Convert a msgpack map with string keys back into a config
pub fn config_from_value(value: Value) -> Result<Config, ProtocolError> {
    let entries = match value {
        Value::Map(entries) => entries,
        other => return Err(ProtocolError::UnexpectedValue(format!("expected map, got {}", other))),
    };

    let mut config = Config::new();
    for (k, v) in entries {
        match k {
            Value::String(s) => match s.into_str() {
                Some(key) => {
                    config.insert(key, v);
                }
                None => return Err(ProtocolError::UnexpectedValue("non UTF-8 config key".into())),
            },
            other => {
                return Err(ProtocolError::UnexpectedValue(format!("config key {}", other)))
            }
        }
    }

    Ok(config)
}

/// Decode a single msgpack value from a response payload
pub fn decode_value(data: &[u8]) -> Result<Value, ProtocolError> {
    let mut rd = data;
    let v = rmpv::decode::read_value(&mut rd).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    if !rd.is_empty() {
        return Err(ProtocolError::Decode(format!("{} trailing bytes", rd.len())));
    }
    Ok(v)
}

/// Encode a single msgpack value
pub fn encode_value(value: &Value) -> Result<Vec<u8>, ProtocolError> {
    let mut buff = Vec::new();
    rmpv::encode::write_value(&mut buff, value).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(buff)
}

/// CRC32 (IEEE) as used for images, datagrams and serial framing
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(mut data: &[u8]) -> Vec<Value> {
        let mut values = vec![];
        while !data.is_empty() {
            values.push(rmpv::decode::read_value(&mut data).unwrap());
        }
        values
    }

    #[test]
    fn destinations_validation() {
        assert!(Destinations::new(vec![1, 2, 3]).is_ok());
        assert_eq!(
            Destinations::new(vec![]),
            Err(ProtocolError::InvalidDestinations("at least one node is required"))
        );
        assert!(Destinations::new(vec![0]).is_err());
        assert!(Destinations::new(vec![128]).is_err());
        assert!(Destinations::new(vec![4, 5, 4]).is_err());

        let d = Destinations::new(vec![3, 1]).unwrap();
        assert_eq!(d.ids(), &[3, 1]);
        assert_eq!(d.to_string(), "3, 1");
    }

    #[test]
    fn encode_write_flash() {
        let cmd = Command::WriteFlash {
            address: 0x0800_0000,
            device_class: "motor-board",
            data: &[1, 2, 3],
        };

        let values = read_all(&cmd.encode().unwrap());
        assert_eq!(
            values,
            vec![
                Value::from(2u8),
                Value::from(4u8),
                Value::Array(vec![
                    Value::from(0x0800_0000u32),
                    Value::from("motor-board"),
                    Value::Binary(vec![1, 2, 3]),
                ]),
            ]
        );
    }

    #[test]
    fn encode_parameterless() {
        for cmd in &[Command::JumpToMain, Command::SaveConfig, Command::Ping, Command::ReadConfig] {
            let values = read_all(&cmd.encode().unwrap());
            assert_eq!(values[1], Value::from(cmd.code()));
            assert_eq!(values[2], Value::Array(vec![]));
        }
    }

    #[test]
    fn encode_update_config() {
        let mut config = Config::new();
        config.insert(APPLICATION_SIZE_KEY.into(), Value::from(5000u32));

        let values = read_all(&Command::UpdateConfig(&config).encode().unwrap());
        assert_eq!(values[1], Value::from(7u8));
        assert_eq!(
            values[2],
            Value::Array(vec![Value::Map(vec![(
                Value::from("application_size"),
                Value::from(5000u32)
            )])])
        );

        let back = match &values[2] {
            Value::Array(args) => config_from_value(args[0].clone()).unwrap(),
            _ => unreachable!(),
        };
        assert_eq!(back, config);
    }

    #[test]
    fn config_requires_string_keys() {
        let v = Value::Map(vec![(Value::from(1u8), Value::from(2u8))]);
        assert!(config_from_value(v).is_err());
        assert!(config_from_value(Value::from(true)).is_err());
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut data = encode_value(&Value::from(12u8)).unwrap();
        assert_eq!(decode_value(&data), Ok(Value::from(12u8)));

        data.push(0xc0);
        assert!(decode_value(&data).is_err());
    }

    #[test]
    fn crc32_matches_zlib() {
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
        assert_eq!(crc32(&[]), 0);
    }
}
