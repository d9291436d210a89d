//! Fixed-layout datagram framing.
//!
//! Every datagram on the wire is one segment: a 17-byte little-endian header
//! followed by up to [`MAX_DATA`] payload bytes. The transmitted size is
//! exactly `HEADER_SIZE + len`.

use bytes::Bytes;
use opal_binary::{BinaryError, BinaryReader, BinaryWriter, Readable, Writable};

/// Full record size of one datagram on the wire.
pub const SEGMENT_PAYLOAD: usize = 512;
/// seq + ack + ts (u32 each) + wnd + len (u16 each) + flags (u8).
pub const HEADER_SIZE: usize = 17;
/// Payload bytes available after the header.
pub const MAX_DATA: usize = SEGMENT_PAYLOAD - HEADER_SIZE;

const FLAG_EOF: u8 = 0x01;
const FLAG_FLN: u8 = 0x02;
const FLAG_POT: u8 = 0x04;
const FLAG_WND: u8 = 0x08;
const FLAG_POB: u8 = 0x10;

/// Single-bit segment flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentFlags {
    /// Last segment of the file.
    pub eof: bool,
    /// Payload carries a filename request.
    pub fln: bool,
    /// Payload carries a private port number (or acknowledges one).
    pub pot: bool,
    /// Window update.
    pub wnd: bool,
    /// Window probe.
    pub pob: bool,
}

impl SegmentFlags {
    pub fn bits(&self) -> u8 {
        let mut bits = 0;
        if self.eof {
            bits |= FLAG_EOF;
        }
        if self.fln {
            bits |= FLAG_FLN;
        }
        if self.pot {
            bits |= FLAG_POT;
        }
        if self.wnd {
            bits |= FLAG_WND;
        }
        if self.pob {
            bits |= FLAG_POB;
        }
        bits
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            eof: bits & FLAG_EOF != 0,
            fln: bits & FLAG_FLN != 0,
            pot: bits & FLAG_POT != 0,
            wnd: bits & FLAG_WND != 0,
            pob: bits & FLAG_POB != 0,
        }
    }
}

/// One framed datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Sender-assigned monotonic datagram number.
    pub seq: u32,
    /// Cumulative ACK: next seq expected by the receiver.
    pub ack: u32,
    /// Millisecond timestamp set by the sender, echoed in ACKs. Zero means
    /// "no RTT sample" (Karn's rule).
    pub ts: u32,
    /// Receiver-advertised free slots in its window.
    pub wnd: u16,
    /// Bytes of valid payload.
    pub len: u16,
    pub flags: SegmentFlags,
    pub data: [u8; MAX_DATA],
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            seq: 0,
            ack: 0,
            ts: 0,
            wnd: 0,
            len: 0,
            flags: SegmentFlags::default(),
            data: [0; MAX_DATA],
        }
    }
}

impl Segment {
    /// The valid portion of the payload.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn set_payload(&mut self, payload: &[u8]) -> Result<(), BinaryError> {
        if payload.len() > MAX_DATA {
            return Err(BinaryError::InvalidData(format!(
                "payload of {} bytes exceeds segment capacity {}",
                payload.len(),
                MAX_DATA
            )));
        }
        self.data[..payload.len()].copy_from_slice(payload);
        self.len = payload.len() as u16;
        Ok(())
    }

    /// Encodes to exactly `HEADER_SIZE + len` bytes.
    pub fn encode(&self) -> Result<Bytes, BinaryError> {
        let mut writer = BinaryWriter::new();
        self.write(&mut writer)?;
        Ok(writer.freeze())
    }

    /// Decodes a received datagram, zero-filling the record first.
    pub fn decode(data: &[u8]) -> Result<Self, BinaryError> {
        let mut reader = BinaryReader::from_slice(data);
        Self::read(&mut reader)
    }
}

impl Writable for Segment {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_u32(self.seq);
        writer.write_u32(self.ack);
        writer.write_u32(self.ts);
        writer.write_u16(self.wnd);
        writer.write_u16(self.len);
        writer.write_u8(self.flags.bits());
        writer.write_bytes(self.payload());
        Ok(())
    }
}

impl Readable for Segment {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        let mut segment = Segment::default();
        segment.seq = reader.read_u32()?;
        segment.ack = reader.read_u32()?;
        segment.ts = reader.read_u32()?;
        segment.wnd = reader.read_u16()?;
        segment.len = reader.read_u16()?;
        segment.flags = SegmentFlags::from_bits(reader.read_u8()?);
        if segment.len as usize > MAX_DATA {
            return Err(BinaryError::InvalidData(format!(
                "declared payload length {} exceeds segment capacity {}",
                segment.len, MAX_DATA
            )));
        }
        reader.read_bytes(&mut segment.data[..segment.len as usize])?;
        Ok(segment)
    }
}
