//! Socket protocol between the client and the resource manager.
//!
//! One request travels over one TCP connection:
//!
//! ```text
//! client                                   resource manager
//!   | connect                                     |
//!   | packet (header string, content bytes) ----> |
//!   | "sync" -----------------------------------> |
//!   |            ... work on shared blocks ...    |
//!   | <------------------------------------ "cnys" |
//!   | cleanup: buffer arguments marked clean      |
//!   | close                                       |
//! ```
//!
//! [`Coral::submit`] returns as soon as the client barrier is flushed;
//! [`Session::wait`] blocks for the server barrier. Buffer payloads never
//! cross the socket: a buffer argument carries only its block identity and
//! dirty bit, and the peer maps the block itself.

mod packet;
mod responder;
mod session;
mod wire;

pub use packet::{ArgumentView, Packet, RequestView};
pub use responder::Responder;
pub use session::{Coral, Session, SessionState};
pub use wire::MAX_FRAME_LEN;
