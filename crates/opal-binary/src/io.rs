use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::BinaryError;

/// Cursor over an immutable byte buffer. All multi-byte reads are
/// little-endian; the wire format is fixed-layout, not self-describing.
#[derive(Debug, Clone)]
pub struct BinaryReader {
    buffer: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct BinaryWriter {
    buffer: BytesMut,
}

impl BinaryReader {
    pub fn new(buffer: Bytes) -> Self {
        Self { buffer }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            buffer: Bytes::copy_from_slice(data),
        }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.remaining()
    }

    fn ensure(&self, needed: usize) -> Result<(), BinaryError> {
        if self.buffer.remaining() < needed {
            return Err(BinaryError::UnexpectedEof {
                needed,
                remaining: self.buffer.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, BinaryError> {
        self.ensure(1)?;
        Ok(self.buffer.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16, BinaryError> {
        self.ensure(2)?;
        Ok(self.buffer.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, BinaryError> {
        self.ensure(4)?;
        Ok(self.buffer.get_u32_le())
    }

    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<(), BinaryError> {
        self.ensure(dst.len())?;
        self.buffer.copy_to_slice(dst);
        Ok(())
    }
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.put_u16_le(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.put_u32_le(value);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.put_slice(data);
    }

    pub fn freeze(self) -> Bytes {
        self.buffer.freeze()
    }
}
