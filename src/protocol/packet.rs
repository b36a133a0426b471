//! Packet codec.
//!
//! ```text
//! header:  "<type>\n<arg0 header>\n<arg1 header>..."        (UTF-8)
//! content: [len: u32 BE][arg0 bytes][len: u32 BE][arg1 bytes]...
//! ```
//!
//! On the wire a packet is its header as a length-prefixed string followed by
//! its content as a length-prefixed byte array.

use crate::error::{Error, Result};
use crate::request::{ArgFlags, BUFFER_TAG, parse_buffer_header, write_content};
use bytes::{Buf, Bytes};
use std::fmt;
use zerocopy::FromBytes;

/// The serialized form of a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    header: String,
    content: Bytes,
}

impl Packet {
    /// Create a packet from its two parts.
    pub fn new(header: String, content: Bytes) -> Self {
        Self { header, content }
    }

    /// The descriptive text part.
    #[inline]
    pub fn header(&self) -> &str {
        &self.header
    }

    /// The opaque byte part.
    #[inline]
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Decompose into header and content.
    pub fn into_parts(self) -> (String, Bytes) {
        (self.header, self.content)
    }
}

/// One decoded argument of a [`RequestView`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgumentView {
    header: String,
    content: Bytes,
}

impl ArgumentView {
    /// The argument header as sent.
    #[inline]
    pub fn header(&self) -> &str {
        &self.header
    }

    /// The argument content as sent.
    #[inline]
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Returns true for a skipped index.
    pub fn is_placeholder(&self) -> bool {
        self.header.is_empty() && self.content.is_empty()
    }

    /// Returns true if the argument refers to a shared block.
    pub fn is_buffer(&self) -> bool {
        self.header.starts_with(BUFFER_TAG)
    }

    /// Protocol flags of a buffer argument; empty otherwise.
    pub fn flags(&self) -> ArgFlags {
        parse_buffer_header(&self.header).map_or(ArgFlags::NONE, |(flags, _)| flags)
    }

    /// Whether the sender reported the buffer as modified since its last transmission.
    pub fn is_dirty(&self) -> bool {
        parse_buffer_header(&self.header).is_some_and(|(_, dirty)| dirty)
    }

    /// Block identity of a buffer argument.
    ///
    /// Returns `None` for non-buffer arguments; an empty buffer has an empty identity.
    pub fn identity(&self) -> Option<&str> {
        if !self.is_buffer() {
            return None;
        }
        std::str::from_utf8(&self.content).ok()
    }

    /// Content of a string argument.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }

    /// Read a scalar of type `T` from the content.
    ///
    /// Returns `None` if the content is not exactly `size_of::<T>()` bytes.
    pub fn scalar<T: FromBytes>(&self) -> Option<T> {
        T::read_from_bytes(&self.content).ok()
    }
}

/// A request decoded from a [`Packet`], as seen by the resource manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestView {
    kind: String,
    arguments: Vec<ArgumentView>,
}

impl RequestView {
    /// Decode a packet produced by [`Request::pack`](crate::Request::pack).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if a length prefix runs past the content or
    /// the number of headers does not match the number of contents.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        let mut lines = packet.header.split('\n');
        let kind = lines.next().unwrap_or_default().to_string();
        let headers: Vec<&str> = lines.collect();

        let mut content = packet.content.clone();
        let mut contents = Vec::with_capacity(headers.len());
        while content.has_remaining() {
            if content.remaining() < 4 {
                return Err(Error::Protocol("truncated argument length".into()));
            }
            let len = content.get_u32() as usize;
            if content.remaining() < len {
                return Err(Error::Protocol(format!(
                    "argument {} claims {len} bytes, {} left",
                    contents.len(),
                    content.remaining()
                )));
            }
            contents.push(content.split_to(len));
        }

        if contents.len() != headers.len() {
            return Err(Error::Protocol(format!(
                "packet has {} argument headers but {} contents",
                headers.len(),
                contents.len()
            )));
        }

        let arguments = headers
            .into_iter()
            .zip(contents)
            .map(|(header, content)| ArgumentView {
                header: header.to_string(),
                content,
            })
            .collect();

        Ok(Self { kind, arguments })
    }

    /// The callable name.
    #[inline]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The decoded arguments in index order.
    #[inline]
    pub fn arguments(&self) -> &[ArgumentView] {
        &self.arguments
    }

    /// Argument at `index`.
    pub fn argument(&self, index: usize) -> Option<&ArgumentView> {
        self.arguments.get(index)
    }

    /// Number of argument slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.arguments.len()
    }

    /// Returns true if the request has no arguments.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }
}

impl fmt::Display for RequestView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind)?;
        for (index, argument) in self.arguments.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            if argument.is_placeholder() {
                f.write_str("_")?;
            } else if argument.is_buffer() {
                write!(f, "{}:", argument.header)?;
                write_content(f, true, &argument.content)?;
            } else {
                write_content(f, false, &argument.content)?;
            }
        }
        f.write_str(")")
    }
}
