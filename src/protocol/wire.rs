//! Framing primitives over one TCP connection.
//!
//! ```text
//! string:  [len: u32 BE][UTF-8 bytes]
//! bytes:   [len: u32 BE][raw bytes]
//! packet:  string(header) bytes(content)
//! sync:    string("sync")   client -> server, request fully written
//! cnys:    string("cnys")   server -> client, result ready
//! ```

use super::packet::Packet;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

/// Largest frame the `u32` length prefix can describe.
pub const MAX_FRAME_LEN: usize = u32::MAX as usize;

/// Client barrier: the request has been written completely.
pub(crate) const SYNC: &str = "sync";

/// Server barrier: the result is ready.
pub(crate) const CNYS: &str = "cnys";

/// A framed connection.
pub(crate) struct Wire {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    read_limit: usize,
}

impl Wire {
    /// Open a connection to `addr`.
    pub(crate) fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).map_err(Error::Connection)?;
        Self::from_stream(stream).map_err(Error::Connection)
    }

    /// Wrap an accepted connection.
    pub(crate) fn from_stream(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: BufWriter::new(stream),
            read_limit: MAX_FRAME_LEN,
        })
    }

    /// Reject incoming frames longer than `limit` bytes.
    pub(crate) fn set_read_limit(&mut self, limit: usize) {
        self.read_limit = limit.min(MAX_FRAME_LEN);
    }

    /// Address of the peer.
    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.writer.get_ref().peer_addr().ok()
    }

    pub(crate) fn write_utf(&mut self, value: &str) -> std::io::Result<()> {
        self.write_bytes(value.as_bytes())
    }

    pub(crate) fn write_bytes(&mut self, value: &[u8]) -> std::io::Result<()> {
        let len = frame_len(value.len())?;
        self.write_frame(len, value)
    }

    /// Both frame lengths are checked before anything is written.
    pub(crate) fn write_packet(&mut self, packet: &Packet) -> std::io::Result<()> {
        let header_len = frame_len(packet.header().len())?;
        let content_len = frame_len(packet.content().len())?;
        self.write_frame(header_len, packet.header().as_bytes())?;
        self.write_frame(content_len, packet.content())
    }

    fn write_frame(&mut self, len: u32, value: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(&len.to_be_bytes())?;
        self.writer.write_all(value)?;
        tracing::trace!(len, "wrote frame");
        Ok(())
    }

    /// Send the client barrier and flush.
    pub(crate) fn sync(&mut self) -> std::io::Result<()> {
        self.write_utf(SYNC)?;
        self.flush()
    }

    /// Send the server barrier and flush.
    pub(crate) fn cnys(&mut self) -> std::io::Result<()> {
        self.write_utf(CNYS)?;
        self.flush()
    }

    pub(crate) fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    pub(crate) fn read_bytes(&mut self, what: &str) -> Result<Bytes> {
        let mut prefix = [0u8; 4];
        self.reader
            .read_exact(&mut prefix)
            .map_err(|e| Error::protocol_io(what, e))?;

        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.read_limit {
            return Err(Error::Protocol(format!(
                "{what} frame of {len} bytes exceeds limit of {}",
                self.read_limit
            )));
        }

        let mut value = vec![0u8; len];
        self.reader
            .read_exact(&mut value)
            .map_err(|e| Error::protocol_io(what, e))?;
        tracing::trace!(len, what, "read frame");
        Ok(Bytes::from(value))
    }

    pub(crate) fn read_utf(&mut self, what: &str) -> Result<String> {
        let bytes = self.read_bytes(what)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Protocol(format!("{what} is not valid UTF-8")))
    }

    pub(crate) fn read_packet(&mut self) -> Result<Packet> {
        let header = self.read_utf("packet header")?;
        let content = self.read_bytes("packet content")?;
        Ok(Packet::new(header, content))
    }

    /// Read a barrier and check that it is `expected`.
    pub(crate) fn read_marker(&mut self, expected: &str) -> Result<()> {
        let marker = self.read_utf("synchronization marker")?;
        if marker != expected {
            return Err(Error::Protocol(format!(
                "expected marker {expected:?}, got {marker:?}"
            )));
        }
        Ok(())
    }

    /// Flush and shut the connection down in both directions.
    pub(crate) fn close(mut self) -> std::io::Result<()> {
        self.flush()?;
        match self.writer.get_ref().shutdown(Shutdown::Both) {
            Err(e) if e.kind() != std::io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

fn frame_len(len: usize) -> std::io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("frame of {len} bytes does not fit a u32 length prefix"),
        )
    })
}
