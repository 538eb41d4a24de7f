//! Explicit-width serialization for capture log payloads.
//!
//! Numbers are written little-endian at their declared width, never in their
//! in-memory form, so a log recorded on one machine can be replayed on
//! another.
//!
//! Slices, vectors and strings are written as an unsigned LEB128 element
//! count followed by the elements. An `Option<T>` is a one-byte tag (0 or 1)
//! followed by the value when present. `bool` is a single byte.
//!
//! References are transparent to serialization: a reference value is simply
//! serialized the way its referent would be.

use std::convert::TryFrom;
use std::{io, mem};

/// A type that can be written to a log payload.
pub trait Serialize {
    /// Serialize a single `Self` value.
    fn serialize<W: io::Write>(&self, stream: &mut W) -> io::Result<()>;

    /// Serialize a `[Self]` slice: a count, then the elements.
    ///
    /// Types that can be written as a single block should override this.
    fn serialize_seq<W: io::Write>(seq: &[Self], stream: &mut W) -> io::Result<()>
    where
        Self: Sized,
    {
        write_len(stream, seq.len())?;
        for elt in seq {
            elt.serialize(stream)?;
        }
        Ok(())
    }
}

/// A type that can be read back from a log payload.
///
/// Deserializing advances `buf` past the bytes consumed.
pub trait Deserialize<'b>: Sized {
    fn deserialize(buf: &mut &'b [u8]) -> Result<Self, DeserializeError>;

    /// Read `len` consecutive `Self` values.
    fn deserialize_seq(buf: &mut &'b [u8], len: usize) -> Result<Vec<Self>, DeserializeError> {
        // Don't trust `len` for the allocation: every element takes at least
        // one byte.
        let mut vec = Vec::with_capacity(len.min(buf.len()));
        for _ in 0..len {
            vec.push(Deserialize::deserialize(buf)?);
        }
        Ok(vec)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeserializeError {
    #[error("serialized payload truncated")]
    UnexpectedEof,
    #[error("serialized payload included bad UTF-8")]
    BadUTF8,
    #[error("serialized payload included a malformed LEB128 count")]
    BadLeb128,
    #[error("serialized payload included an invalid {what}: {value}")]
    BadValue { what: &'static str, value: u64 },
}

impl From<leb128::read::Error> for DeserializeError {
    fn from(err: leb128::read::Error) -> DeserializeError {
        match err {
            leb128::read::Error::IoError(_) => DeserializeError::UnexpectedEof,
            leb128::read::Error::Overflow => DeserializeError::BadLeb128,
        }
    }
}

/// Write a sequence length as unsigned LEB128.
pub fn write_len<W: io::Write>(stream: &mut W, len: usize) -> io::Result<()> {
    leb128::write::unsigned(stream, len as u64)?;
    Ok(())
}

/// Read a sequence length written by `write_len`.
pub fn read_len(buf: &mut &[u8]) -> Result<usize, DeserializeError> {
    let len = leb128::read::unsigned(buf)?;
    usize::try_from(len).map_err(|_| DeserializeError::BadValue { what: "length", value: len })
}

/// Borrow the next `count` bytes of `buf`, and advance past them.
pub fn take<'b>(buf: &mut &'b [u8], count: usize) -> Result<&'b [u8], DeserializeError> {
    if buf.len() < count {
        return Err(DeserializeError::UnexpectedEof);
    }
    let (head, tail) = buf.split_at(count);
    *buf = tail;
    Ok(head)
}

macro_rules! fixed_width {
    ( $( $type:ty ),* ) => {
        $(
            impl Serialize for $type {
                fn serialize<W: io::Write>(&self, stream: &mut W) -> io::Result<()> {
                    stream.write_all(&self.to_le_bytes())
                }
            }

            impl<'b> Deserialize<'b> for $type {
                fn deserialize(buf: &mut &'b [u8]) -> Result<$type, DeserializeError> {
                    let mut bytes = [0_u8; mem::size_of::<$type>()];
                    bytes.copy_from_slice(take(buf, mem::size_of::<$type>())?);
                    Ok(<$type>::from_le_bytes(bytes))
                }
            }
        )*
    }
}

fixed_width!(u16, u32, u64, i32, i64, f32, f64);

impl Serialize for u8 {
    fn serialize<W: io::Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_all(&[*self])
    }

    /// Byte sequences go out as a single block.
    fn serialize_seq<W: io::Write>(seq: &[u8], stream: &mut W) -> io::Result<()> {
        write_len(stream, seq.len())?;
        stream.write_all(seq)
    }
}

impl<'b> Deserialize<'b> for u8 {
    fn deserialize(buf: &mut &'b [u8]) -> Result<u8, DeserializeError> {
        Ok(take(buf, 1)?[0])
    }

    fn deserialize_seq(buf: &mut &'b [u8], len: usize) -> Result<Vec<u8>, DeserializeError> {
        Ok(take(buf, len)?.to_vec())
    }
}

impl Serialize for bool {
    fn serialize<W: io::Write>(&self, stream: &mut W) -> io::Result<()> {
        (*self as u8).serialize(stream)
    }
}

impl<'b> Deserialize<'b> for bool {
    fn deserialize(buf: &mut &'b [u8]) -> Result<bool, DeserializeError> {
        match u8::deserialize(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DeserializeError::BadValue { what: "bool", value: other as u64 }),
        }
    }
}

impl<T: Serialize + ?Sized> Serialize for &T {
    fn serialize<W: io::Write>(&self, stream: &mut W) -> io::Result<()> {
        (*self).serialize(stream)
    }
}

impl<T: Serialize> Serialize for [T] {
    fn serialize<W: io::Write>(&self, stream: &mut W) -> io::Result<()> {
        T::serialize_seq(self, stream)
    }
}

impl<T: Serialize> Serialize for Vec<T> {
    fn serialize<W: io::Write>(&self, stream: &mut W) -> io::Result<()> {
        T::serialize_seq(self, stream)
    }
}

impl<'b, T: Deserialize<'b>> Deserialize<'b> for Vec<T> {
    fn deserialize(buf: &mut &'b [u8]) -> Result<Vec<T>, DeserializeError> {
        let len = read_len(buf)?;
        T::deserialize_seq(buf, len)
    }
}

impl Serialize for str {
    fn serialize<W: io::Write>(&self, stream: &mut W) -> io::Result<()> {
        self.as_bytes().serialize(stream)
    }
}

impl Serialize for String {
    fn serialize<W: io::Write>(&self, stream: &mut W) -> io::Result<()> {
        self.as_str().serialize(stream)
    }
}

impl<'b> Deserialize<'b> for &'b str {
    fn deserialize(buf: &mut &'b [u8]) -> Result<&'b str, DeserializeError> {
        let len = read_len(buf)?;
        std::str::from_utf8(take(buf, len)?).map_err(|_| DeserializeError::BadUTF8)
    }
}

impl<'b> Deserialize<'b> for String {
    fn deserialize(buf: &mut &'b [u8]) -> Result<String, DeserializeError> {
        <&str>::deserialize(buf).map(str::to_owned)
    }
}

impl<T: Serialize> Serialize for Option<T> {
    fn serialize<W: io::Write>(&self, stream: &mut W) -> io::Result<()> {
        match self {
            None => 0_u8.serialize(stream),
            Some(value) => {
                1_u8.serialize(stream)?;
                value.serialize(stream)
            }
        }
    }
}

impl<'b, T: Deserialize<'b>> Deserialize<'b> for Option<T> {
    fn deserialize(buf: &mut &'b [u8]) -> Result<Option<T>, DeserializeError> {
        match u8::deserialize(buf)? {
            0 => Ok(None),
            1 => Ok(Some(T::deserialize(buf)?)),
            other => Err(DeserializeError::BadValue { what: "option tag", value: other as u64 }),
        }
    }
}

impl<A: Serialize, B: Serialize> Serialize for (A, B) {
    fn serialize<W: io::Write>(&self, stream: &mut W) -> io::Result<()> {
        self.0.serialize(stream)?;
        self.1.serialize(stream)
    }
}

impl<'b, A: Deserialize<'b>, B: Deserialize<'b>> Deserialize<'b> for (A, B) {
    fn deserialize(buf: &mut &'b [u8]) -> Result<(A, B), DeserializeError> {
        let a = A::deserialize(buf)?;
        let b = B::deserialize(buf)?;
        Ok((a, b))
    }
}

/// Define plain-data structs whose serialized form is their fields in order.
macro_rules! serialized_struct {
    ( $( $(#[$attr:meta])* pub struct $name:ident { $( $(#[$fattr:meta])* pub $field:ident : $type:ty ),* $(,)? } )* ) => {
        $(
            $(#[$attr])*
            #[derive(Clone, Debug, Default, PartialEq)]
            pub struct $name {
                $( $(#[$fattr])* pub $field: $type, )*
            }

            impl $crate::serialize::Serialize for $name {
                fn serialize<W: std::io::Write>(&self, stream: &mut W) -> std::io::Result<()> {
                    $( $crate::serialize::Serialize::serialize(&self.$field, stream)?; )*
                    Ok(())
                }
            }

            impl<'b> $crate::serialize::Deserialize<'b> for $name {
                fn deserialize(buf: &mut &'b [u8]) -> Result<$name, $crate::serialize::DeserializeError> {
                    Ok($name {
                        $( $field: $crate::serialize::Deserialize::deserialize(buf)?, )*
                    })
                }
            }
        )*
    }
}

pub(crate) use serialized_struct;

#[test]
fn test_fixed_width_is_little_endian() {
    let mut buf = vec![];
    0x0102_u16.serialize(&mut buf).unwrap();
    0x03040506_u32.serialize(&mut buf).unwrap();
    (-2_i32).serialize(&mut buf).unwrap();
    assert_eq!(buf, [0x02, 0x01, 0x06, 0x05, 0x04, 0x03, 0xfe, 0xff, 0xff, 0xff]);

    let mut rest = &buf[..];
    assert_eq!(u16::deserialize(&mut rest), Ok(0x0102));
    assert_eq!(u32::deserialize(&mut rest), Ok(0x03040506));
    assert_eq!(i32::deserialize(&mut rest), Ok(-2));
    assert!(rest.is_empty());
}

#[test]
fn test_length_prefixes() {
    let mut buf = vec![];
    vec![1_u8, 2, 3].serialize(&mut buf).unwrap();
    "hi".serialize(&mut buf).unwrap();
    assert_eq!(buf, [3, 1, 2, 3, 2, b'h', b'i']);

    // A 200-element sequence needs a two-byte LEB128 count.
    let mut buf = vec![];
    vec![7_u8; 200].serialize(&mut buf).unwrap();
    assert_eq!(&buf[..2], &[0xc8, 0x01]);
    assert_eq!(buf.len(), 202);
}

#[test]
fn test_option_and_bool() {
    let mut buf = vec![];
    Some(5_u32).serialize(&mut buf).unwrap();
    None::<u32>.serialize(&mut buf).unwrap();
    true.serialize(&mut buf).unwrap();
    assert_eq!(buf, [1, 5, 0, 0, 0, 0, 1]);

    let mut bad: &[u8] = &[2];
    assert_eq!(
        bool::deserialize(&mut bad),
        Err(DeserializeError::BadValue { what: "bool", value: 2 })
    );
}

#[test]
fn test_truncated_input() {
    let mut short: &[u8] = &[1, 2, 3];
    assert_eq!(u32::deserialize(&mut short), Err(DeserializeError::UnexpectedEof));

    // Claims five bytes of text, supplies two.
    let mut short: &[u8] = &[5, b'a', b'b'];
    assert_eq!(String::deserialize(&mut short), Err(DeserializeError::UnexpectedEof));

    let mut bad_utf8: &[u8] = &[2, 0xff, 0xfe];
    assert_eq!(String::deserialize(&mut bad_utf8), Err(DeserializeError::BadUTF8));

    // An unterminated LEB128 count.
    let mut bad_len: &[u8] = &[0x80];
    assert_eq!(Vec::<u8>::deserialize(&mut bad_len), Err(DeserializeError::UnexpectedEof));
}
