//! CAN bus bootloader flasher.
//!
//! Drives the bootloader of CAN nodes through a serial or TCP CAN bridge:
//! pages are erased, the image is written in chunks, the application size and
//! CRC are stored in the node config and each node is then asked for the CRC
//! of the written region.

use core::fmt::Debug;
use core::marker::PhantomData;
use std::convert::TryFrom;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read as _, Write as _};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod bridge;
pub mod can;
pub mod protocol;
pub mod serial_datagram;
pub mod transport;

pub use can::Datagram;
use can::Decoded;
use protocol::{crc32, APPLICATION_CRC_KEY, APPLICATION_SIZE_KEY, HOST_ID};
pub use protocol::{Command, Config, Destinations, ProtocolError, Value};
pub use transport::Transport;

/// Session phase of the programmer
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Idle,
    Erasing,
    Writing,
    Finalizing,
    Verifying,
}

#[derive(Debug, thiserror::Error)]
pub enum Error<E: Debug> {
    #[error("transport error: {0:?}")]
    Transport(E),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("no response within {0} ms")]
    ResponseTimeout(u32),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Flash erase page size in bytes
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "2048"))]
    pub page_size: usize,

    /// Image bytes sent per write command
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "2048"))]
    pub chunk_size: usize,

    /// Period to wait after each command for nodes to process it
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "300"))]
    pub settle_delay_ms: u32,

    /// Transport read timeout
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "200"))]
    pub read_timeout_ms: u32,

    /// Timeout to wait for node responses, 0 waits forever
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5000"))]
    pub response_timeout_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: protocol::PAGE_SIZE,
            chunk_size: protocol::CHUNK_SIZE,
            settle_delay_ms: 300,
            read_timeout_ms: 200,
            response_timeout_ms: 5000,
        }
    }
}

/// Nodes from `destinations` missing in the `valid` set
pub fn failed_nodes(destinations: &Destinations, valid: &[u8]) -> Vec<u8> {
    destinations.iter().filter(|n| !valid.contains(n)).collect()
}

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    rx: serial_datagram::Decoder,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: Transport<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            state: State::Idle,
            options,
            port,
            delay,
            rx: serial_datagram::Decoder::new(),
            _err: PhantomData,
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Release the programmer, returning the transport
    pub fn into_inner(self) -> P {
        self.port
    }

    /// Send a command from the host to the given nodes
    pub fn dispatch(
        &mut self,
        command: &Command,
        destinations: &Destinations,
    ) -> Result<(), Error<E>> {
        self.dispatch_from(command, destinations, HOST_ID)
    }

    /// Send a command to the given nodes with an explicit source id
    ///
    /// Blocks for the settle delay once written, the bootloader does not
    /// acknowledge commands.
    pub fn dispatch_from(
        &mut self,
        command: &Command,
        destinations: &Destinations,
        source: u8,
    ) -> Result<(), Error<E>> {
        debug!("Sending {} to nodes {}", command.name(), destinations);

        let datagram = can::encode_datagram(&command.encode()?, destinations.ids());

        for frame in can::datagram_to_frames(&datagram, source) {
            let unit = serial_datagram::encode(&bridge::encode_frame_command(&frame)?);
            trace!("tx {}", hex::encode(&unit));

            for b in unit {
                block!(self.port.write(b)).map_err(Error::Transport)?;
            }
        }
        block!(self.port.flush()).map_err(Error::Transport)?;

        self.delay.delay_ms(self.options.settle_delay_ms);

        Ok(())
    }

    /// Erase, write and finalize an image on all destinations
    pub fn flash(
        &mut self,
        image: &[u8],
        base_address: u32,
        device_class: &str,
        destinations: &Destinations,
    ) -> Result<(), Error<E>> {
        self.flash_with_progress(image, base_address, device_class, destinations, |_, _, _| ())
    }

    /// Flash an image, calling `progress(phase, done, total)` after each command
    pub fn flash_with_progress<F>(
        &mut self,
        image: &[u8],
        base_address: u32,
        device_class: &str,
        destinations: &Destinations,
        mut progress: F,
    ) -> Result<(), Error<E>>
    where
        F: FnMut(State, usize, usize),
    {
        let page_size = self.options.page_size;
        let chunk_size = self.options.chunk_size;
        if page_size == 0 || chunk_size == 0 {
            return Err(Error::InvalidArgument("page and chunk sizes must be non-zero"));
        }
        let length = Self::region_length(image, base_address)?;

        // Erase every page touched by the image
        info!(
            "Erasing {} bytes at 0x{:08x} on nodes {}",
            image.len(),
            base_address,
            destinations
        );
        self.state = State::Erasing;

        let pages = div_ceil(image.len(), page_size);
        for (i, offset) in (0..image.len()).step_by(page_size).enumerate() {
            let cmd = Command::ErasePage {
                address: base_address + offset as u32,
                device_class,
            };
            self.dispatch(&cmd, destinations)?;
            progress(State::Erasing, i + 1, pages);
        }

        // Then write the image in chunks
        info!("Writing {} bytes", image.len());
        self.state = State::Writing;

        let chunks = div_ceil(image.len(), chunk_size);
        for (i, data) in image.chunks(chunk_size).enumerate() {
            let offset = i * chunk_size;
            let cmd = Command::WriteFlash {
                address: base_address + offset as u32,
                device_class,
                data,
            };
            self.dispatch(&cmd, destinations)?;
            progress(State::Writing, i + 1, chunks);
        }

        // Finally store the application size and CRC
        info!("Updating application size and CRC");
        self.state = State::Finalizing;

        let mut config = Config::new();
        config.insert(APPLICATION_SIZE_KEY.to_string(), Value::from(length));
        config.insert(APPLICATION_CRC_KEY.to_string(), Value::from(crc32(image)));
        self.update_config(&config, destinations)?;
        progress(State::Finalizing, 1, 1);

        self.state = State::Idle;

        Ok(())
    }

    /// Merge `config` into the node configs and persist it
    ///
    /// Keys absent from `config` are left unchanged on the nodes.
    pub fn update_config(
        &mut self,
        config: &Config,
        destinations: &Destinations,
    ) -> Result<(), Error<E>> {
        self.dispatch(&Command::UpdateConfig(config), destinations)?;
        self.dispatch(&Command::SaveConfig, destinations)
    }

    /// Check the image CRC on each destination, returning the matching nodes
    ///
    /// Nodes that do not answer or answer garbage are reported as failing,
    /// transport errors abort the check.
    pub fn check_image(
        &mut self,
        image: &[u8],
        base_address: u32,
        destinations: &Destinations,
    ) -> Result<Vec<u8>, Error<E>> {
        let length = Self::region_length(image, base_address)?;
        let expected = crc32(image);

        self.state = State::Verifying;

        let mut valid = Vec::with_capacity(destinations.len());
        for node in destinations.iter() {
            match self.crc_region(base_address, length, node) {
                Ok(crc) if crc == expected => {
                    debug!("Node {} CRC ok", node);
                    valid.push(node);
                }
                Ok(crc) => warn!(
                    "Node {} CRC mismatch (expected 0x{:08x}, got 0x{:08x})",
                    node, expected, crc
                ),
                Err(Error::Transport(e)) => return Err(Error::Transport(e)),
                Err(e) => warn!("Node {} verification failed: {}", node, e),
            }
        }

        self.state = State::Idle;

        Ok(valid)
    }

    /// Ask a single node for the CRC32 of a flash region
    pub fn crc_region(&mut self, base_address: u32, length: u32, node: u8) -> Result<u32, Error<E>> {
        let cmd = Command::CrcRegion {
            address: base_address,
            length,
        };

        let v = self.request(&cmd, node)?;
        match v.as_u64().and_then(|c| u32::try_from(c).ok()) {
            Some(crc) => Ok(crc),
            None => Err(ProtocolError::UnexpectedValue(format!("CRC {}", v)).into()),
        }
    }

    /// Check a node is running the bootloader
    pub fn ping(&mut self, node: u8) -> Result<bool, Error<E>> {
        match self.request(&Command::Ping, node)? {
            Value::Boolean(b) => Ok(b),
            v => Err(ProtocolError::UnexpectedValue(format!("ping response {}", v)).into()),
        }
    }

    /// Read the whole config of a node
    pub fn read_config(&mut self, node: u8) -> Result<Config, Error<E>> {
        let v = self.request(&Command::ReadConfig, node)?;
        Ok(protocol::config_from_value(v)?)
    }

    /// Start the application on all destinations
    pub fn run_application(&mut self, destinations: &Destinations) -> Result<(), Error<E>> {
        info!("Starting application on nodes {}", destinations);
        self.dispatch(&Command::JumpToMain, destinations)
    }

    fn request(&mut self, command: &Command, node: u8) -> Result<Value, Error<E>> {
        let destinations = Destinations::single(node)?;

        // Partial units from an earlier exchange are not part of this answer
        self.rx.reset();
        self.dispatch(command, &destinations)?;

        // One budget for the whole exchange, other nodes cannot extend it
        let mut waited = 0u32;
        loop {
            let d = self.read_datagram_within(&mut waited)?;
            if d.source == node {
                return Ok(protocol::decode_value(&d.data)?);
            }
            warn!(
                "Discarding datagram from node {} while waiting for node {}",
                d.source, node
            );
            self.charge(&mut waited)?;
        }
    }

    /// Read a complete datagram from the bus
    ///
    /// Read timeouts are retried until `response_timeout_ms` worth of them
    /// have elapsed. Discarded units and frames count as one read timeout.
    pub fn read_datagram(&mut self) -> Result<Datagram, Error<E>> {
        let mut waited = 0u32;
        self.read_datagram_within(&mut waited)
    }

    fn read_datagram_within(&mut self, waited: &mut u32) -> Result<Datagram, Error<E>> {
        let mut buff = Vec::new();
        let mut source: Option<u8> = None;

        loop {
            let unit = match self.read_unit(waited)? {
                Some(u) => u,
                None => {
                    self.charge(waited)?;
                    continue;
                }
            };

            let frame = bridge::decode_frame(&unit)?;

            let s = match (frame.is_start_of_datagram(), source) {
                (true, _) => {
                    if !buff.is_empty() {
                        warn!("Dropping incomplete datagram ({} bytes)", buff.len());
                        buff.clear();
                    }
                    frame.source()
                }
                (false, Some(s)) if frame.source() == s => s,
                (false, Some(s)) => {
                    warn!(
                        "Discarding frame 0x{:03x} inside datagram from node {}",
                        frame.id, s
                    );
                    self.charge(waited)?;
                    continue;
                }
                (false, None) => {
                    warn!("Discarding frame 0x{:03x} outside of a datagram", frame.id);
                    self.charge(waited)?;
                    continue;
                }
            };
            source = Some(s);

            buff.extend_from_slice(&frame.data);

            match can::decode_datagram(&buff)? {
                Decoded::Incomplete => (),
                Decoded::Complete { destinations, data } => {
                    debug!("Received {} byte datagram from node {}", data.len(), s);
                    return Ok(Datagram {
                        source: s,
                        destinations,
                        data,
                    });
                }
            }
        }
    }

    /// Account one read timeout against the response budget
    fn charge(&self, waited: &mut u32) -> Result<(), Error<E>> {
        *waited = waited.saturating_add(self.options.read_timeout_ms.max(1));

        let timeout = self.options.response_timeout_ms;
        if timeout != 0 && *waited >= timeout {
            error!("Receive timeout");
            return Err(Error::ResponseTimeout(timeout));
        }
        Ok(())
    }

    /// Image length, checking the region fits the 32 bit address space
    fn region_length(image: &[u8], base_address: u32) -> Result<u32, Error<E>> {
        let end = base_address as u64 + image.len() as u64;
        if end > 1 << 32 {
            return Err(Error::InvalidArgument("image does not fit the address space"));
        }
        Ok(image.len() as u32)
    }

    /// Read one serial unit, `None` when the transport times out
    fn read_unit(&mut self, waited: &mut u32) -> Result<Option<Vec<u8>>, Error<E>> {
        loop {
            let b = match self.port.read() {
                Ok(b) => b,
                Err(nb::Error::WouldBlock) => return Ok(None),
                Err(nb::Error::Other(e)) => return Err(Error::Transport(e)),
            };

            match self.rx.push(b) {
                None => (),
                Some(Ok(unit)) => {
                    trace!("rx {}", hex::encode(&unit));
                    return Ok(Some(unit));
                }
                Some(Err(e)) => {
                    warn!("Discarding serial datagram: {}", e);
                    self.charge(waited)?;
                }
            }
        }
    }
}

fn div_ceil(n: usize, d: usize) -> usize {
    n / d + (n % d != 0) as usize
}
