//! Peer side of the protocol.
//!
//! A [`Responder`] is what the resource manager runs for each accepted
//! connection: read one request, do the work through the shared blocks it
//! names, then signal completion. Tests and demos use it to stand in for
//! the real resource manager.

use super::packet::RequestView;
use super::wire::{SYNC, Wire};
use crate::error::{Error, Result};
use std::net::{SocketAddr, TcpListener, TcpStream};

/// Server end of one session.
///
/// # Example
///
/// ```rust,ignore
/// let listener = TcpListener::bind(("0.0.0.0", 55677))?;
/// loop {
///     let mut responder = Responder::accept(&listener)?;
///     let request = responder.receive()?;
///     for arg in request.arguments().iter().filter(|a| a.is_buffer()) {
///         let block = alloc.open(arg.identity().unwrap_or_default())?;
///         // ... run the kernel on block.payload() ...
///     }
///     responder.complete()?;
/// }
/// ```
pub struct Responder {
    wire: Wire,
    peer: Option<SocketAddr>,
}

impl Responder {
    /// Wrap an accepted connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the socket cannot be configured.
    pub fn new(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr().ok();
        let wire = Wire::from_stream(stream).map_err(Error::Connection)?;
        Ok(Self { wire, peer })
    }

    /// Accept the next connection on `listener`.
    pub fn accept(listener: &TcpListener) -> Result<Self> {
        let (stream, _) = listener.accept().map_err(Error::Connection)?;
        Self::new(stream)
    }

    /// Reject requests whose header or content frame is longer than
    /// `limit` bytes. The default accepts any frame a `u32` prefix can
    /// describe.
    pub fn with_frame_limit(mut self, limit: usize) -> Self {
        self.wire.set_read_limit(limit);
        self
    }

    /// Address of the client.
    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Read the request and the client barrier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on a short read, a malformed packet or a
    /// missing `sync` barrier.
    pub fn receive(&mut self) -> Result<RequestView> {
        let packet = self.wire.read_packet()?;
        self.wire.read_marker(SYNC)?;

        let view = RequestView::from_packet(&packet)?;
        tracing::debug!(
            peer = ?self.peer,
            kind = view.kind(),
            arguments = view.len(),
            "received request"
        );
        Ok(view)
    }

    /// Signal that the result is ready and close the connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the barrier cannot be written.
    pub fn complete(mut self) -> Result<()> {
        self.wire.cnys().map_err(Error::Connection)?;
        tracing::debug!(peer = ?self.peer, "signalled completion");
        self.wire.close().map_err(Error::Connection)
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder").field("peer", &self.peer).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::CNYS;
    use std::thread;

    #[test]
    fn test_receive_requires_sync() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || {
            let mut wire = Wire::connect(addr).unwrap();
            let packet = crate::Request::new("k").pack().unwrap();
            wire.write_packet(&packet).unwrap();
            wire.write_utf("nope").unwrap();
            wire.flush().unwrap();
            wire
        });

        let mut responder = Responder::accept(&listener).unwrap();
        assert!(matches!(responder.receive(), Err(Error::Protocol(_))));
        drop(client.join().unwrap());
    }

    #[test]
    fn test_frame_limit_rejects_large_content() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || {
            let payload = vec![1u8; 64];
            let mut request = crate::Request::new("big");
            request.arg(&payload);
            let mut wire = Wire::connect(addr).unwrap();
            wire.write_packet(&request.pack().unwrap()).unwrap();
            wire.sync().unwrap();
            wire
        });

        let mut responder = Responder::accept(&listener).unwrap().with_frame_limit(32);
        let err = responder.receive().unwrap_err();
        assert!(matches!(err, Error::Protocol(msg) if msg.contains("packet content")));
        drop(client.join().unwrap());
    }

    #[test]
    fn test_complete_sends_cnys() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || {
            let mut wire = Wire::connect(addr).unwrap();
            wire.read_marker(CNYS)
        });

        let responder = Responder::accept(&listener).unwrap();
        assert!(responder.peer_addr().is_some());
        responder.complete().unwrap();
        client.join().unwrap().unwrap();
    }
}
