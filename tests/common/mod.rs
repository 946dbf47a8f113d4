//! Simulated CAN bridge with bootloader nodes attached

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::io::ErrorKind;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use can_flasher::protocol::{self, Config, Value, COMMAND_SET_VERSION, HOST_ID};
use can_flasher::{bridge, can, serial_datagram, Options, Programmer};

pub const ERASED: u8 = 0xff;

pub const JUMP_TO_MAIN: u8 = 1;
pub const CRC_REGION: u8 = 2;
pub const ERASE_PAGE: u8 = 3;
pub const WRITE_FLASH: u8 = 4;
pub const PING: u8 = 5;
pub const UPDATE_CONFIG: u8 = 7;
pub const SAVE_CONFIG: u8 = 8;
pub const READ_CONFIG: u8 = 9;

/// Command as seen on the bus
#[derive(Clone, Debug, PartialEq)]
pub struct Received {
    pub destinations: Vec<u8>,
    pub code: u8,
    pub args: Vec<Value>,
}

impl Received {
    pub fn address(&self) -> u32 {
        uint(&self.args[0])
    }

    pub fn data(&self) -> &[u8] {
        match &self.args[2] {
            Value::Binary(b) => b,
            v => panic!("expected binary, got {}", v),
        }
    }
}

fn uint(v: &Value) -> u32 {
    v.as_u64().expect("unsigned argument") as u32
}

pub struct Node {
    pub id: u8,
    pub page_size: u32,
    pub memory: BTreeMap<u32, u8>,
    pub config: Config,
    pub saved: Option<Config>,
    /// Every key written by a config update, in order
    pub config_writes: Vec<String>,
    pub writes: usize,
    /// Index of a write command to silently ignore
    pub drop_write: Option<usize>,
    /// Never answer requests
    pub silent: bool,
    /// Answer requests with this value instead
    pub reply: Option<Value>,
    /// Damage the payload of every answer
    pub corrupt: bool,
    pub running: bool,
}

impl Node {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            page_size: 2048,
            memory: BTreeMap::new(),
            config: Config::new(),
            saved: None,
            config_writes: vec![],
            writes: 0,
            drop_write: None,
            silent: false,
            reply: None,
            corrupt: false,
            running: false,
        }
    }

    pub fn read(&self, address: u32, length: u32) -> Vec<u8> {
        (address..address + length)
            .map(|a| *self.memory.get(&a).unwrap_or(&ERASED))
            .collect()
    }

    fn apply(&mut self, code: u8, args: &[Value]) -> Option<Value> {
        match code {
            JUMP_TO_MAIN => {
                self.running = true;
                None
            }
            CRC_REGION => {
                let data = self.read(uint(&args[0]), uint(&args[1]));
                Some(Value::from(protocol::crc32(&data)))
            }
            ERASE_PAGE => {
                let address = uint(&args[0]);
                let start = address - address % self.page_size;
                for a in start..start + self.page_size {
                    self.memory.remove(&a);
                }
                None
            }
            WRITE_FLASH => {
                let index = self.writes;
                self.writes += 1;
                if self.drop_write == Some(index) {
                    return None;
                }

                let address = uint(&args[0]);
                if let Value::Binary(data) = &args[2] {
                    for (i, b) in data.iter().enumerate() {
                        self.memory.insert(address + i as u32, *b);
                    }
                }
                None
            }
            PING => Some(Value::Boolean(true)),
            UPDATE_CONFIG => {
                let update = protocol::config_from_value(args[0].clone()).unwrap();
                for (k, v) in update {
                    self.config_writes.push(k.clone());
                    self.config.insert(k, v);
                }
                None
            }
            SAVE_CONFIG => {
                self.saved = Some(self.config.clone());
                None
            }
            READ_CONFIG => Some(protocol::config_to_value(&self.config)),
            other => panic!("unknown command {}", other),
        }
    }
}

pub struct Bus {
    pub nodes: Vec<Node>,
    pub log: Vec<Received>,
    /// Fail writes once this many commands went through
    pub fail_after: Option<usize>,
    pub read_timeouts: usize,
    rx: VecDeque<u8>,
    decoder: serial_datagram::Decoder,
    reassembly: Vec<u8>,
}

impl Bus {
    pub fn new(ids: &[u8]) -> Self {
        Self {
            nodes: ids.iter().map(|id| Node::new(*id)).collect(),
            log: vec![],
            fail_after: None,
            read_timeouts: 0,
            rx: VecDeque::new(),
            decoder: serial_datagram::Decoder::new(),
            reassembly: vec![],
        }
    }

    pub fn node(&self, id: u8) -> &Node {
        self.nodes.iter().find(|n| n.id == id).unwrap()
    }

    pub fn node_mut(&mut self, id: u8) -> &mut Node {
        self.nodes.iter_mut().find(|n| n.id == id).unwrap()
    }

    pub fn commands(&self, code: u8) -> Vec<&Received> {
        self.log.iter().filter(|r| r.code == code).collect()
    }

    pub fn codes(&self) -> Vec<u8> {
        self.log.iter().map(|r| r.code).collect()
    }

    fn receive_unit(&mut self, unit: &[u8]) {
        let frame = bridge::decode_frame_command(unit).unwrap();
        assert_eq!(frame.source(), HOST_ID);

        if frame.is_start_of_datagram() {
            self.reassembly.clear();
        }
        self.reassembly.extend_from_slice(&frame.data);

        if let can::Decoded::Complete { destinations, data } =
            can::decode_datagram(&self.reassembly).unwrap()
        {
            self.reassembly.clear();
            self.handle(destinations, &data);
        }
    }

    fn handle(&mut self, destinations: Vec<u8>, data: &[u8]) {
        let mut rd = data;
        let version = rmpv::decode::read_value(&mut rd).unwrap();
        let code = rmpv::decode::read_value(&mut rd).unwrap();
        let args = rmpv::decode::read_value(&mut rd).unwrap();

        assert_eq!(version, Value::from(COMMAND_SET_VERSION));
        let code = code.as_u64().unwrap() as u8;
        let args = match args {
            Value::Array(a) => a,
            v => panic!("arguments must be an array, got {}", v),
        };

        let mut responses = vec![];
        for node in self.nodes.iter_mut().filter(|n| destinations.contains(&n.id)) {
            if let Some(v) = node.apply(code, &args) {
                if !node.silent {
                    let v = node.reply.clone().unwrap_or(v);
                    responses.push((node.id, v, node.corrupt));
                }
            }
        }

        self.log.push(Received {
            destinations,
            code,
            args,
        });

        for (id, v, corrupt) in responses {
            self.respond(id, &v, corrupt);
        }
    }

    fn respond(&mut self, id: u8, v: &Value, corrupt: bool) {
        let data = protocol::encode_value(v).unwrap();
        let mut datagram = can::encode_datagram(&data, &[HOST_ID]);
        if corrupt {
            *datagram.last_mut().unwrap() ^= 0xff;
        }

        for frame in can::datagram_to_frames(&datagram, id) {
            let unit = serial_datagram::encode(&bridge::encode_frame(&frame).unwrap());
            self.rx.extend(unit);
        }
    }
}

impl Write<u8> for Bus {
    type Error = ErrorKind;

    fn write(&mut self, word: u8) -> nb::Result<(), ErrorKind> {
        if let Some(n) = self.fail_after {
            if self.log.len() >= n {
                return Err(nb::Error::Other(ErrorKind::BrokenPipe));
            }
        }

        if let Some(unit) = self.decoder.push(word) {
            self.receive_unit(&unit.unwrap());
        }
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), ErrorKind> {
        Ok(())
    }
}

impl Read<u8> for Bus {
    type Error = ErrorKind;

    fn read(&mut self) -> nb::Result<u8, ErrorKind> {
        match self.rx.pop_front() {
            Some(b) => Ok(b),
            None => {
                self.read_timeouts += 1;
                Err(nb::Error::WouldBlock)
            }
        }
    }
}

/// Delay recording requested periods instead of sleeping
#[derive(Clone, Default)]
pub struct Delays(pub Rc<RefCell<Vec<u32>>>);

impl DelayMs<u32> for Delays {
    fn delay_ms(&mut self, ms: u32) {
        self.0.borrow_mut().push(ms);
    }
}

pub fn options() -> Options {
    Options {
        read_timeout_ms: 200,
        response_timeout_ms: 1000,
        ..Options::default()
    }
}

pub fn programmer(bus: Bus, options: Options) -> (Programmer<Bus, Delays, ErrorKind>, Delays) {
    let delays = Delays::default();
    (Programmer::new(bus, delays.clone(), options), delays)
}
