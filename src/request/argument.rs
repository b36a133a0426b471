//! Typed request arguments.

use crate::buffer::{Element, Tracked, TrackedBitBuffer, TrackedBuffer};
use crate::error::{Error, Result};
use std::borrow::Cow;
use std::fmt;
use std::ops::BitOr;
use zerocopy::{Immutable, IntoBytes};

/// Header tag of a buffer argument.
pub const BUFFER_TAG: &str = "Cube";

/// Names of the bits of `(flags << 1) | dirty`, lowest bit first.
const FLAG_NAMES: [&str; 2] = ["dirty", "intermediate"];

/// Protocol flags of a buffer argument.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ArgFlags(u32);

impl ArgFlags {
    /// No flags.
    pub const NONE: Self = Self(0);

    /// The buffer holds intermediate data the resource manager may keep
    /// on the device between requests.
    pub const INTERMEDIATE: Self = Self(1);

    /// Raw flag bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Rebuild flags from raw bits, dropping unknown ones.
    #[inline]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::INTERMEDIATE.0)
    }

    /// Returns true if no flag is set.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if every flag in `other` is set.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ArgFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Format the header of a buffer argument.
///
/// `Cube` alone when neither the dirty bit nor any flag is set, otherwise
/// `Cube<name,...>` listing the active names.
pub(crate) fn buffer_header(flags: ArgFlags, dirty: bool) -> String {
    let combined = (flags.bits() << 1) | dirty as u32;
    let names: Vec<&str> = FLAG_NAMES
        .iter()
        .enumerate()
        .filter(|(bit, _)| combined & (1 << bit) != 0)
        .map(|(_, name)| *name)
        .collect();

    if names.is_empty() {
        BUFFER_TAG.to_string()
    } else {
        format!("{BUFFER_TAG}<{}>", names.join(","))
    }
}

/// Parse the flag names of a buffer header back into `(flags, dirty)`.
///
/// Returns `None` if `header` is not a buffer header.
pub(crate) fn parse_buffer_header(header: &str) -> Option<(ArgFlags, bool)> {
    let rest = header.strip_prefix(BUFFER_TAG)?;
    if rest.is_empty() {
        return Some((ArgFlags::NONE, false));
    }

    let names = rest.strip_prefix('<')?.strip_suffix('>')?;
    let mut combined = 0u32;
    for name in names.split(',') {
        let bit = FLAG_NAMES.iter().position(|n| *n == name)?;
        combined |= 1 << bit;
    }
    Some((ArgFlags::from_bits_truncate(combined >> 1), combined & 1 != 0))
}

/// One parameter of a [`Request`](super::Request).
///
/// Scalars are copied when the argument is built; everything else is
/// borrowed, so a buffer cannot be mutated while a request refers to it.
///
/// Raw pointers are not arguments: scalar and sequence conversions require
/// `zerocopy::IntoBytes`, which pointer types do not implement.
#[derive(Clone)]
pub enum Argument<'a> {
    /// Placeholder for an index that was skipped by `arg_at`.
    Empty,
    /// The raw bytes of a plain value.
    Scalar(Vec<u8>),
    /// Raw bytes of a plain sequence.
    Bytes(&'a [u8]),
    /// A printable string.
    Text(&'a str),
    /// A change-tracking buffer, sent by identity.
    Buffer {
        /// The referenced buffer.
        buffer: &'a dyn Tracked,
        /// Protocol flags.
        flags: ArgFlags,
    },
}

impl<'a> Argument<'a> {
    /// A scalar argument holding a copy of `value`'s bytes.
    pub fn scalar<T: IntoBytes + Immutable + ?Sized>(value: &T) -> Self {
        Argument::Scalar(value.as_bytes().to_vec())
    }

    /// A sequence argument borrowing the bytes of `values`.
    pub fn slice<T: IntoBytes + Immutable>(values: &'a [T]) -> Self {
        Argument::Bytes(values.as_bytes())
    }

    /// A buffer argument with explicit flags.
    pub fn buffer(buffer: &'a dyn Tracked, flags: ArgFlags) -> Self {
        Argument::Buffer { buffer, flags }
    }

    /// Apply protocol flags.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArgumentType`] if flags are given for an argument that
    /// is not a buffer.
    pub fn with_flags(self, flags: ArgFlags) -> Result<Self> {
        if flags.is_empty() {
            return Ok(self);
        }

        match self {
            Argument::Buffer { buffer, flags: own } => Ok(Argument::Buffer {
                buffer,
                flags: own | flags,
            }),
            other => Err(Error::ArgumentType(format!(
                "flags {:#x} are only supported on buffer arguments, not {}",
                flags.bits(),
                other.kind_name()
            ))),
        }
    }

    /// Returns true for the placeholder variant.
    #[inline]
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Argument::Empty)
    }

    /// Returns true if the content is text meant for display.
    #[inline]
    pub fn is_printable(&self) -> bool {
        matches!(self, Argument::Text(_) | Argument::Buffer { .. })
    }

    /// The protocol flags; always empty for non-buffer arguments.
    pub fn flags(&self) -> ArgFlags {
        match self {
            Argument::Buffer { flags, .. } => *flags,
            _ => ArgFlags::NONE,
        }
    }

    /// The referenced buffer, if this is a buffer argument.
    pub fn tracked(&self) -> Option<&'a dyn Tracked> {
        match self {
            Argument::Buffer { buffer, .. } => Some(*buffer),
            _ => None,
        }
    }

    /// Short text header describing type, size and flags.
    pub fn header(&self) -> String {
        match self {
            Argument::Empty => String::new(),
            Argument::Scalar(bytes) => bytes.len().to_string(),
            Argument::Bytes(bytes) => bytes.len().to_string(),
            Argument::Text(text) => text.len().to_string(),
            Argument::Buffer { buffer, flags } => buffer_header(*flags, buffer.is_dirty()),
        }
    }

    /// Content bytes; a buffer contributes its block identity, never its payload.
    pub fn content(&self) -> Cow<'_, [u8]> {
        match self {
            Argument::Empty => Cow::Borrowed(&[]),
            Argument::Scalar(bytes) => Cow::Borrowed(bytes),
            Argument::Bytes(bytes) => Cow::Borrowed(bytes),
            Argument::Text(text) => Cow::Borrowed(text.as_bytes()),
            Argument::Buffer { buffer, .. } => Cow::Owned(buffer.identity().into_bytes()),
        }
    }

    /// Mark a buffer argument clean. Does nothing for other variants.
    pub fn unset_dirty(&self) {
        if let Argument::Buffer { buffer, .. } = self {
            buffer.unset_dirty();
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Argument::Empty => "a placeholder",
            Argument::Scalar(_) => "a scalar",
            Argument::Bytes(_) => "a byte sequence",
            Argument::Text(_) => "a string",
            Argument::Buffer { .. } => "a buffer",
        }
    }
}

impl fmt::Debug for Argument<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Argument::Empty => f.write_str("Empty"),
            Argument::Scalar(bytes) => f.debug_tuple("Scalar").field(bytes).finish(),
            Argument::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Argument::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Argument::Buffer { buffer, flags } => f
                .debug_struct("Buffer")
                .field("id", &buffer.identity())
                .field("dirty", &buffer.is_dirty())
                .field("flags", flags)
                .finish(),
        }
    }
}

macro_rules! impl_scalar_argument {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Argument<'_> {
                fn from(value: $ty) -> Self {
                    Argument::scalar(&value)
                }
            }
        )*
    };
}

impl_scalar_argument!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool);

impl<'a> From<&'a str> for Argument<'a> {
    fn from(value: &'a str) -> Self {
        Argument::Text(value)
    }
}

impl<'a> From<&'a String> for Argument<'a> {
    fn from(value: &'a String) -> Self {
        Argument::Text(value)
    }
}

impl<'a, T: Element> From<&'a [T]> for Argument<'a> {
    fn from(value: &'a [T]) -> Self {
        Argument::slice(value)
    }
}

impl<'a, T: Element> From<&'a Vec<T>> for Argument<'a> {
    fn from(value: &'a Vec<T>) -> Self {
        Argument::slice(value)
    }
}

impl<'a, T: Element> From<&'a TrackedBuffer<T>> for Argument<'a> {
    fn from(value: &'a TrackedBuffer<T>) -> Self {
        Argument::buffer(value, ArgFlags::NONE)
    }
}

impl<'a> From<&'a TrackedBitBuffer> for Argument<'a> {
    fn from(value: &'a TrackedBitBuffer) -> Self {
        Argument::buffer(value, ArgFlags::NONE)
    }
}
