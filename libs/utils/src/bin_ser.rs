//! Binary serialization helpers for the fixed-layout structures that live on
//! disk (little-endian) and on the replication wire (big-endian).
//!
//! [`LeSer`] and [`BeSer`] are blanket-implemented for every type, so pick
//! the byte order at the call site. Importing both traits into the same
//! scope makes method calls ambiguous; use fully qualified calls there.

#![warn(missing_docs)]

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};
use std::io::{self, Read, Write};
use thiserror::Error;

/// An error that occurred during a deserialize operation
///
/// This could happen because the input data was too short,
/// or because an invalid value was encountered.
#[derive(Debug, Error)]
pub enum DeserializeError {
    /// The deserializer isn't able to deserialize the supplied data.
    #[error("deserialize error")]
    BadInput,
    /// While deserializing from a `Read` source, an `io::Error` occurred.
    #[error("deserialize error: {0}")]
    Io(io::Error),
}

impl From<bincode::Error> for DeserializeError {
    fn from(e: bincode::Error) -> Self {
        match *e {
            bincode::ErrorKind::Io(io_err) => DeserializeError::Io(io_err),
            _ => DeserializeError::BadInput,
        }
    }
}

/// An error that occurred during a serialize operation
#[derive(Debug, Error)]
pub enum SerializeError {
    /// The serializer isn't able to serialize the supplied data.
    #[error("serialize error")]
    BadInput,
    /// While serializing into a `Write` sink, an `io::Error` occurred.
    #[error("serialize error: {0}")]
    Io(io::Error),
}

impl From<bincode::Error> for SerializeError {
    fn from(e: bincode::Error) -> Self {
        match *e {
            bincode::ErrorKind::Io(io_err) => SerializeError::Io(io_err),
            _ => SerializeError::BadInput,
        }
    }
}

/// Big-endian, fixed-width integers, no trailing bytes allowed.
pub fn be_coder() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
}

/// Little-endian, fixed-width integers, no trailing bytes allowed.
pub fn le_coder() -> impl Options {
    bincode::DefaultOptions::new()
        .with_little_endian()
        .with_fixint_encoding()
}

/// Binary serialize/deserialize helper functions (Big Endian)
pub trait BeSer {
    /// Serialize into a byte slice
    fn ser_into_slice(&self, mut b: &mut [u8]) -> Result<(), SerializeError>
    where
        Self: Serialize,
    {
        self.ser_into(&mut b)
    }

    /// Serialize into a borrowed writer
    fn ser_into<W: Write>(&self, w: &mut W) -> Result<(), SerializeError>
    where
        Self: Serialize,
    {
        be_coder().serialize_into(w, &self).map_err(|e| e.into())
    }

    /// Serialize into a new heap-allocated buffer
    fn ser(&self) -> Result<Vec<u8>, SerializeError>
    where
        Self: Serialize,
    {
        be_coder().serialize(&self).map_err(|e| e.into())
    }

    /// Deserialize from the full contents of a byte slice
    fn des(buf: &[u8]) -> Result<Self, DeserializeError>
    where
        Self: DeserializeOwned,
    {
        be_coder()
            .deserialize(buf)
            .or(Err(DeserializeError::BadInput))
    }

    /// Deserialize from a prefix of the byte slice
    fn des_prefix(buf: &[u8]) -> Result<Self, DeserializeError>
    where
        Self: DeserializeOwned,
    {
        be_coder()
            .allow_trailing_bytes()
            .deserialize(buf)
            .or(Err(DeserializeError::BadInput))
    }

    /// Deserialize from a reader
    fn des_from<R: Read>(r: &mut R) -> Result<Self, DeserializeError>
    where
        Self: DeserializeOwned,
    {
        be_coder().deserialize_from(r).map_err(|e| e.into())
    }
}

/// Binary serialize/deserialize helper functions (Little Endian)
pub trait LeSer {
    /// Serialize into a byte slice
    fn ser_into_slice(&self, mut b: &mut [u8]) -> Result<(), SerializeError>
    where
        Self: Serialize,
    {
        self.ser_into(&mut b)
    }

    /// Serialize into a borrowed writer
    fn ser_into<W: Write>(&self, w: &mut W) -> Result<(), SerializeError>
    where
        Self: Serialize,
    {
        le_coder().serialize_into(w, &self).map_err(|e| e.into())
    }

    /// Serialize into a new heap-allocated buffer
    fn ser(&self) -> Result<Vec<u8>, SerializeError>
    where
        Self: Serialize,
    {
        le_coder().serialize(&self).map_err(|e| e.into())
    }

    /// Deserialize from the full contents of a byte slice
    fn des(buf: &[u8]) -> Result<Self, DeserializeError>
    where
        Self: DeserializeOwned,
    {
        le_coder()
            .deserialize(buf)
            .or(Err(DeserializeError::BadInput))
    }

    /// Deserialize from a prefix of the byte slice
    ///
    /// On-disk structures are usually followed by payload or zero padding,
    /// so this is what most readers want.
    fn des_prefix(buf: &[u8]) -> Result<Self, DeserializeError>
    where
        Self: DeserializeOwned,
    {
        le_coder()
            .allow_trailing_bytes()
            .deserialize(buf)
            .or(Err(DeserializeError::BadInput))
    }

    /// Deserialize from a reader
    fn des_from<R: Read>(r: &mut R) -> Result<Self, DeserializeError>
    where
        Self: DeserializeOwned,
    {
        le_coder().deserialize_from(r).map_err(|e| e.into())
    }

    /// Compute the serialized size of a data structure
    fn serialized_size(&self) -> Result<u64, SerializeError>
    where
        Self: Serialize,
    {
        le_coder().serialized_size(self).map_err(|e| e.into())
    }
}

impl<T> BeSer for T {}
impl<T> LeSer for T {}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ShortStruct {
        a: u8,
        b: u32,
    }

    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StatusUpdate {
        pub tag: u8,
        pub write_lsn: u64,
        pub flush_lsn: u64,
        pub apply_lsn: u64,
        pub timestamp: i64,
        pub reply_requested: u8,
    }

    #[test]
    fn be_short() {
        use super::BeSer;

        let x = ShortStruct { a: 7, b: 65536 };
        assert_eq!(x.ser().unwrap(), vec![7, 0, 1, 0, 0]);

        let decoded = ShortStruct::des(&[8u8, 7, 3, 0, 0]).unwrap();
        assert_eq!(decoded, ShortStruct { a: 8, b: 0x07030000 });

        // trailing data is only accepted by des_prefix
        let raw = [8u8, 7, 3, 0, 0, 0xFF, 0xFF, 0xFF];
        ShortStruct::des(&raw).unwrap_err();
        ShortStruct::des_prefix(&raw).unwrap();
    }

    #[test]
    fn le_short() {
        use super::LeSer;

        let x = ShortStruct { a: 7, b: 65536 };
        assert_eq!(x.ser().unwrap(), vec![7, 0, 0, 1, 0]);
        assert_eq!(x.serialized_size().unwrap(), 5);

        let mut reader = &[8u8, 0, 0, 3, 7][..];
        let decoded = ShortStruct::des_from(&mut reader).unwrap();
        assert_eq!(decoded, ShortStruct { a: 8, b: 0x07030000 });

        let mut buf = [0u8; 5];
        x.ser_into_slice(&mut buf).unwrap();
        assert_eq!(buf, [7, 0, 0, 1, 0]);
        // too small
        let mut buf = [0u8; 3];
        x.ser_into_slice(&mut buf).unwrap_err();
    }

    #[test]
    fn be_status_update() {
        use super::BeSer;

        let msg = StatusUpdate {
            tag: b'r',
            write_lsn: 0x1000_2000_3000_4000,
            flush_lsn: 0x1234_2345_3456_4567,
            apply_lsn: 0,
            timestamp: -1,
            reply_requested: 1,
        };

        let encoded = msg.ser().unwrap();
        assert_eq!(encoded.len(), 34);
        assert_eq!(encoded[0], b'r');
        assert_eq!(&encoded[1..9], &[0x10, 0x00, 0x20, 0x00, 0x30, 0x00, 0x40, 0x00]);
        assert_eq!(&encoded[25..33], &[0xFF; 8]);

        let mut reader = &encoded[..];
        assert_eq!(StatusUpdate::des_from(&mut reader).unwrap(), msg);
    }
}
