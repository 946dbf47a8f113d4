//! Byte stream transports carrying the bridge protocol

use std::io::{BufWriter, ErrorKind as IoErrorKind, Read as _, Write as _};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::{Options, Programmer};

/// Default TCP port of the network bridge
pub const DEFAULT_TCP_PORT: u16 = 1337;

/// Duplex byte stream used by the [`Programmer`](crate::Programmer)
///
/// Reads return `nb::Error::WouldBlock` once the underlying read timeout
/// elapses without data. The transport is released when dropped.
pub trait Transport<E>: Write<u8, Error = E> + Read<u8, Error = E> {}

impl<T, E> Transport<E> for T where T: Write<u8, Error = E> + Read<u8, Error = E> {}

/// Split a `host[:port]` string, defaulting to [`DEFAULT_TCP_PORT`]
pub fn parse_host(s: &str) -> Result<(String, u16), String> {
    match s.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|e| format!("invalid port '{}': {}", port, e))?;
            if host.is_empty() {
                return Err(format!("missing host in '{}'", s));
            }
            Ok((host.to_string(), port))
        }
        None if s.is_empty() => Err("missing host".to_string()),
        None => Ok((s.to_string(), DEFAULT_TCP_PORT)),
    }
}

/// TCP connection to a network bridge
pub struct TcpTransport {
    reader: TcpStream,
    writer: BufWriter<TcpStream>,
}

impl TcpTransport {
    /// Connect to a bridge, reads time out after `read_timeout_ms`
    pub fn connect(host: &str, port: u16, read_timeout_ms: u32) -> std::io::Result<Self> {
        debug!("Connecting to {}:{}", host, port);

        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_millis(read_timeout_ms.max(1) as u64)))?;

        let writer = BufWriter::new(stream.try_clone()?);

        Ok(Self {
            reader: stream,
            writer,
        })
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        let _ = self.reader.shutdown(Shutdown::Both);
    }
}

impl Read<u8> for TcpTransport {
    type Error = IoErrorKind;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        let mut b = [0u8; 1];

        match self.reader.read(&mut b) {
            Ok(1) => Ok(b[0]),
            Ok(_) => Err(nb::Error::Other(IoErrorKind::UnexpectedEof)),
            Err(e) => match e.kind() {
                IoErrorKind::WouldBlock | IoErrorKind::TimedOut | IoErrorKind::Interrupted => {
                    Err(nb::Error::WouldBlock)
                }
                kind => Err(nb::Error::Other(kind)),
            },
        }
    }
}

impl Write<u8> for TcpTransport {
    type Error = IoErrorKind;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.writer
            .write_all(&[word])
            .map_err(|e| nb::Error::Other(e.kind()))
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        self.writer.flush().map_err(|e| nb::Error::Other(e.kind()))
    }
}

impl Programmer<TcpTransport, StdDelay, IoErrorKind> {
    /// Create a new programmer attached to a network CAN bridge
    pub fn tcp(host: &str, port: u16, options: Options) -> std::io::Result<Self> {
        let t = TcpTransport::connect(host, port, options.read_timeout_ms)?;

        Ok(Self::new(t, StdDelay, options))
    }
}

/// Blocking delay based on `std::thread::sleep`
#[derive(Clone, Copy, Debug, Default)]
pub struct StdDelay;

impl DelayMs<u32> for StdDelay {
    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}
