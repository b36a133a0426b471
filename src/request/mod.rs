//! Remote-call descriptors.
//!
//! A [`Request`] names a callable on the resource manager (the *type*, e.g.
//! a kernel name) and carries its arguments in declaration order. Requests
//! borrow their arguments: while a request (or a session submitted from it)
//! is alive, the buffers it refers to cannot be mutated.
//!
//! # Example
//!
//! ```rust,ignore
//! use coral_runtime::{ArgFlags, Request};
//!
//! let mut request = Request::new("vecadd");
//! request
//!     .arg(&a)
//!     .arg(&b)
//!     .arg_with_flags(&c, ArgFlags::INTERMEDIATE)?
//!     .arg(1000i32);
//! println!("{request}");
//! ```

mod argument;

pub use argument::{ArgFlags, Argument, BUFFER_TAG};
pub(crate) use argument::parse_buffer_header;

use crate::error::{Error, Result};
use crate::protocol::Packet;
use bytes::{BufMut, BytesMut};
use std::fmt::{self, Write as _};

/// A named remote call with ordered arguments.
#[derive(Clone, Debug, Default)]
pub struct Request<'a> {
    kind: String,
    arguments: Vec<Argument<'a>>,
}

impl<'a> Request<'a> {
    /// Create a request for the callable `kind` with no arguments.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            arguments: Vec::new(),
        }
    }

    /// Replace the callable name.
    pub fn set_type(&mut self, kind: impl Into<String>) -> &mut Self {
        self.kind = kind.into();
        self
    }

    /// The callable name.
    #[inline]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Append an argument.
    pub fn arg(&mut self, value: impl Into<Argument<'a>>) -> &mut Self {
        self.arguments.push(value.into());
        self
    }

    /// Append an argument with protocol flags.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArgumentType`] if flags are given for a non-buffer value.
    pub fn arg_with_flags(
        &mut self,
        value: impl Into<Argument<'a>>,
        flags: ArgFlags,
    ) -> Result<&mut Self> {
        let argument = value.into().with_flags(flags)?;
        self.arguments.push(argument);
        Ok(self)
    }

    /// Set the argument at `index`, replacing any previous one.
    ///
    /// Skipped indices below `index` are filled with [`Argument::Empty`].
    pub fn arg_at(&mut self, index: usize, value: impl Into<Argument<'a>>) -> &mut Self {
        self.place(index, value.into());
        self
    }

    /// Set the argument at `index` with protocol flags.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArgumentType`] if flags are given for a non-buffer
    /// value; the request is unchanged in that case.
    pub fn arg_at_with_flags(
        &mut self,
        index: usize,
        value: impl Into<Argument<'a>>,
        flags: ArgFlags,
    ) -> Result<&mut Self> {
        let argument = value.into().with_flags(flags)?;
        self.place(index, argument);
        Ok(self)
    }

    fn place(&mut self, index: usize, argument: Argument<'a>) {
        if index >= self.arguments.len() {
            self.arguments.resize(index + 1, Argument::Empty);
        }
        self.arguments[index] = argument;
    }

    /// The arguments in index order.
    #[inline]
    pub fn arguments(&self) -> &[Argument<'a>] {
        &self.arguments
    }

    /// Number of argument slots, placeholders included.
    #[inline]
    pub fn len(&self) -> usize {
        self.arguments.len()
    }

    /// Returns true if the request has no arguments.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }

    /// Serialize into a [`Packet`].
    ///
    /// The header is the callable name followed by one line per argument
    /// header. The content is each argument's bytes, in index order, each
    /// preceded by its length as a big-endian `u32`. Buffer arguments
    /// contribute their identity and current dirty bit, never their payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArgumentType`] if the name contains a line break or
    /// an argument does not fit a `u32` length.
    pub fn pack(&self) -> Result<Packet> {
        if self.kind.contains('\n') {
            return Err(Error::ArgumentType(format!(
                "request type {:?} contains a line break",
                self.kind
            )));
        }

        let mut header = self.kind.clone();
        let mut content = BytesMut::new();
        for (index, argument) in self.arguments.iter().enumerate() {
            header.push('\n');
            header.push_str(&argument.header());

            let bytes = argument.content();
            let len = u32::try_from(bytes.len()).map_err(|_| {
                Error::ArgumentType(format!("argument {index} is too large to send"))
            })?;
            content.reserve(4 + bytes.len());
            content.put_u32(len);
            content.put_slice(&bytes);
        }

        Ok(Packet::new(header, content.freeze()))
    }

    /// Mark every buffer argument clean. Other arguments are unaffected.
    ///
    /// Called by `wait` once the request has been delivered and answered.
    pub fn cleanup(&self) {
        for argument in &self.arguments {
            argument.unset_dirty();
        }
    }

    /// Multi-line dump of what `pack` would send.
    pub fn packet_view(&self) -> String {
        let mut out = format!("type: {}\n", self.kind);
        for (index, argument) in self.arguments.iter().enumerate() {
            if argument.is_placeholder() {
                let _ = writeln!(out, "[{index}] <empty>");
                continue;
            }

            let _ = write!(out, "[{index}] {} ", argument.header());
            let _ = write_content(&mut out, argument.is_printable(), &argument.content());
            out.push('\n');
        }
        out
    }
}

/// Printable content as quoted text, anything else as hex.
pub(crate) fn write_content(out: &mut impl fmt::Write, printable: bool, bytes: &[u8]) -> fmt::Result {
    match (printable, std::str::from_utf8(bytes)) {
        (true, Ok(text)) => write!(out, "{text:?}"),
        _ => {
            out.write_str("0x")?;
            for byte in bytes {
                write!(out, "{byte:02x}")?;
            }
            Ok(())
        }
    }
}

impl fmt::Display for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind)?;
        for (index, argument) in self.arguments.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            match argument {
                Argument::Empty => f.write_str("_")?,
                Argument::Buffer { .. } => {
                    write!(f, "{}:", argument.header())?;
                    write_content(f, true, &argument.content())?;
                }
                other => write_content(f, other.is_printable(), &other.content())?,
            }
        }
        f.write_str(")")
    }
}
