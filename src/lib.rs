//! # Coral runtime
//!
//! Client runtime for an FPGA resource manager that exchanges data through
//! shared memory instead of socket payloads.
//!
//! ## Features
//!
//! - **Named shared blocks**: file-backed `MAP_SHARED` regions the resource
//!   manager maps by identity
//! - **Change tracking**: buffers record in shared memory whether their
//!   contents changed since the last transmission, so unchanged data is
//!   never copied again
//! - **Typed requests**: scalars, strings, sequences and buffers packed into
//!   a two-part packet
//! - **Submit/wait sessions**: one connection per request, synchronous I/O,
//!   concurrency driven by the caller
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use coral_runtime::prelude::*;
//!
//! let config = Config::from_env()?;
//! let alloc = SharedBlockAllocator::new(&config)?;
//! let coral = Coral::new(&config);
//!
//! let a = TrackedBuffer::from_elem_in(1.0f32, 1000, &alloc)?;
//! let b = TrackedBuffer::from_elem_in(2.0f32, 1000, &alloc)?;
//! let c = TrackedBuffer::from_elem_in(0.0f32, 1000, &alloc)?;
//!
//! let mut request = Request::new("vecadd");
//! request.arg(&a).arg(&b).arg(&c).arg(1000i32);
//!
//! let mut session = coral.submit(&request)?;
//! session.wait()?;
//! assert!(!a.is_dirty());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod request;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::{BitRef, Element, Tracked, TrackedBitBuffer, TrackedBuffer};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::memory::{SharedBlock, SharedBlockAllocator};
    pub use crate::protocol::{Coral, Responder, Session, SessionState};
    pub use crate::request::{ArgFlags, Argument, Request};
}

pub use config::Config;
pub use error::{Error, Result};
pub use protocol::{Coral, Session};
pub use request::{ArgFlags, Request};
