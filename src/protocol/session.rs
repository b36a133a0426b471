//! Client side of the protocol: submit a request, wait for its result.

use super::wire::{CNYS, Wire};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::request::Request;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Progress of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Not connected yet.
    Idle,
    /// Connection established.
    Connected,
    /// Packet written.
    Sent,
    /// Client barrier flushed; the resource manager owns the buffers.
    AwaitingResult,
    /// Result received and buffer arguments marked clean.
    Completed,
    /// An I/O or protocol error ended the session.
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connected => "connected",
            SessionState::Sent => "sent",
            SessionState::AwaitingResult => "awaiting result",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Client of the resource manager.
///
/// Every [`submit`](Self::submit) opens its own connection, so several
/// requests can be in flight at once; the resource manager decides the order
/// in which they run.
///
/// # Example
///
/// ```rust,ignore
/// use coral_runtime::{Config, Coral, Request};
///
/// let coral = Coral::new(&Config::from_env()?);
///
/// let mut request = Request::new("vecadd");
/// request.arg(&a).arg(&b).arg(&c).arg(a.len() as i32);
///
/// let mut session = coral.submit(&request)?;
/// // ... submit more work here ...
/// session.wait()?;
/// ```
#[derive(Debug, Clone)]
pub struct Coral {
    config: Config,
}

impl Coral {
    /// Create a client for the resource manager described by `config`.
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// The configuration in use.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Send `request` and return without waiting for the result.
    ///
    /// The request and every buffer it references stay borrowed until the
    /// returned session is dropped, so they cannot be mutated while the
    /// resource manager may still read them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the address cannot be resolved or the
    /// connection or a write fails, and [`Error::ArgumentType`] if the
    /// request cannot be packed. No session exists afterwards.
    pub fn submit<'r>(&self, request: &'r Request<'r>) -> Result<Session<'r>> {
        let mut session = Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            request,
            wire: None,
            state: SessionState::Idle,
        };

        let packet = request.pack()?;
        let addr = self.config.resolve()?;
        session.connect(addr)?;
        session.send(&packet)?;

        tracing::debug!(
            session = session.id,
            kind = request.kind(),
            arguments = request.len(),
            %addr,
            "submitted request"
        );
        Ok(session)
    }

    /// Block until `session` completes. See [`Session::wait`].
    pub fn wait(&self, session: &mut Session<'_>) -> Result<()> {
        session.wait()
    }
}

/// One submitted request travelling over its own connection.
///
/// Obtained from [`Coral::submit`]; finished with [`wait`](Self::wait).
/// Dropping an unfinished session closes the connection without marking
/// any buffer clean.
pub struct Session<'r> {
    id: u64,
    request: &'r Request<'r>,
    wire: Option<Wire>,
    state: SessionState,
}

impl<'r> Session<'r> {
    /// Process-unique identifier used in log fields.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The request this session carries.
    #[inline]
    pub fn request(&self) -> &'r Request<'r> {
        self.request
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<()> {
        match Wire::connect(addr) {
            Ok(wire) => {
                self.wire = Some(wire);
                self.state = SessionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    fn send(&mut self, packet: &super::Packet) -> Result<()> {
        let Some(wire) = self.wire.as_mut() else {
            return Err(Error::Misuse(format!("session {} is not connected", self.id)));
        };

        let result = wire.write_packet(packet).and_then(|()| {
            self.state = SessionState::Sent;
            wire.sync()
        });
        match result {
            Ok(()) => {
                self.state = SessionState::AwaitingResult;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                self.wire = None;
                Err(Error::Connection(e))
            }
        }
    }

    /// Block until the resource manager signals completion.
    ///
    /// On success every buffer argument of the request is marked clean and
    /// the connection is closed. On failure the session becomes
    /// [`SessionState::Failed`] and dirty flags are left as they were, so a
    /// retry resends the data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Misuse`] if the session is not awaiting a result
    /// (for example a second `wait`), and [`Error::Protocol`] if the
    /// connection breaks or the peer sends anything but the completion marker.
    pub fn wait(&mut self) -> Result<()> {
        if self.state != SessionState::AwaitingResult {
            return Err(Error::Misuse(format!(
                "wait on session {} in state {}",
                self.id, self.state
            )));
        }
        let Some(mut wire) = self.wire.take() else {
            self.state = SessionState::Failed;
            return Err(Error::Misuse(format!("session {} has no connection", self.id)));
        };

        if let Err(e) = wire.read_marker(CNYS) {
            self.state = SessionState::Failed;
            tracing::debug!(session = self.id, error = %e, "session failed");
            return Err(e);
        }

        self.state = SessionState::Completed;
        self.request.cleanup();

        if let Err(e) = wire.close() {
            tracing::warn!(session = self.id, error = %e, "failed to close connection");
        }
        tracing::debug!(session = self.id, kind = self.request.kind(), "request completed");
        Ok(())
    }
}

impl std::fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.request.kind())
            .field("state", &self.state)
            .field("peer", &self.wire.as_ref().and_then(Wire::peer_addr))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Responder;
    use std::net::TcpListener;
    use std::thread;

    fn local_config(listener: &TcpListener) -> Config {
        Config::default()
            .with_hostname("127.0.0.1")
            .with_port(listener.local_addr().unwrap().port())
    }

    #[test]
    fn test_submit_then_wait() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let coral = Coral::new(&local_config(&listener));

        let server = thread::spawn(move || {
            let mut responder = Responder::accept(&listener).unwrap();
            let view = responder.receive().unwrap();
            responder.complete().unwrap();
            view
        });

        let mut request = Request::new("noop");
        request.arg(5u8);
        let mut session = coral.submit(&request).unwrap();
        assert_eq!(session.state(), SessionState::AwaitingResult);

        session.wait().unwrap();
        assert_eq!(session.state(), SessionState::Completed);

        let view = server.join().unwrap();
        assert_eq!(view.kind(), "noop");
        assert_eq!(view.argument(0).unwrap().scalar::<u8>(), Some(5));
    }

    #[test]
    fn test_second_wait_is_misuse() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let coral = Coral::new(&local_config(&listener));
        let server = thread::spawn(move || {
            let mut responder = Responder::accept(&listener).unwrap();
            responder.receive().unwrap();
            responder.complete().unwrap();
        });

        let request = Request::new("noop");
        let mut session = coral.submit(&request).unwrap();
        coral.wait(&mut session).unwrap();
        server.join().unwrap();

        assert!(matches!(session.wait(), Err(Error::Misuse(_))));
    }

    #[test]
    fn test_submit_without_server_fails() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let coral = Coral::new(&Config::default().with_hostname("127.0.0.1").with_port(port));

        let request = Request::new("noop");
        assert!(matches!(coral.submit(&request), Err(Error::Connection(_))));
    }

    #[test]
    fn test_peer_hangup_fails_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let coral = Coral::new(&local_config(&listener));
        let server = thread::spawn(move || {
            let mut responder = Responder::accept(&listener).unwrap();
            responder.receive().unwrap();
        });

        let request = Request::new("noop");
        let mut session = coral.submit(&request).unwrap();
        server.join().unwrap();

        assert!(matches!(session.wait(), Err(Error::Protocol(_))));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(session.wait(), Err(Error::Misuse(_))));
    }

    #[test]
    fn test_session_ids_are_unique() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let coral = Coral::new(&local_config(&listener));
        let server = thread::spawn(move || {
            for _ in 0..2 {
                let mut responder = Responder::accept(&listener).unwrap();
                responder.receive().unwrap();
                responder.complete().unwrap();
            }
        });

        let request = Request::new("noop");
        let mut first = coral.submit(&request).unwrap();
        let mut second = coral.submit(&request).unwrap();
        assert_ne!(first.id(), second.id());

        first.wait().unwrap();
        second.wait().unwrap();
        server.join().unwrap();
    }
}
