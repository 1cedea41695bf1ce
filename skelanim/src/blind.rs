//! Opaque plugin payloads carried inside plugin commands.
//!
//! Payloads are little-endian. The reader never reads past the end of the payload.

use crate::Error;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BlindData(Arc<[u8]>);

impl BlindData {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }

    pub fn builder() -> BlindDataBuilder {
        BlindDataBuilder::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Size in 4-byte command words, rounded up.
    pub fn num_words(&self) -> usize {
        self.0.len().div_ceil(4)
    }

    pub fn reader(&self) -> BlindDataReader<'_> {
        BlindDataReader {
            bytes: &self.0,
            cursor: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct BlindDataBuilder {
    bytes: Vec<u8>,
}

impl BlindDataBuilder {
    pub fn u8(mut self, v: u8) -> Self {
        self.bytes.push(v);
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        // Writing into a Vec cannot fail.
        let _ = self.bytes.write_u32::<LittleEndian>(v);
        self
    }

    pub fn i32(mut self, v: i32) -> Self {
        let _ = self.bytes.write_i32::<LittleEndian>(v);
        self
    }

    pub fn f32(mut self, v: f32) -> Self {
        let _ = self.bytes.write_f32::<LittleEndian>(v);
        self
    }

    pub fn bytes(mut self, v: &[u8]) -> Self {
        self.bytes.extend_from_slice(v);
        self
    }

    pub fn build(self) -> BlindData {
        BlindData::new(self.bytes)
    }
}

pub struct BlindDataReader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> BlindDataReader<'a> {
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.cursor
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.remaining() < n {
            return Err(Error::BlindDataEof {
                offset: self.cursor,
                wanted: n,
                len: self.bytes.len(),
            });
        }
        let out = &self.bytes[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, Error> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_i32(&mut self) -> Result<i32, Error> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn read_f32(&mut self) -> Result<f32, Error> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        self.take(n)
    }
}
