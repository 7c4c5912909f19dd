use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use super::constants::*;
use super::error::RawFrameError;

/// A single channel readout inside a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawHit {
    pub chip: u8,
    pub channel: u8,
    pub flags: u8,
    pub adc_high: u16,
    pub adc_low: u16,
}

impl RawHit {
    pub fn new(chip: u8, channel: u8, adc_high: u16, adc_low: u16) -> Self {
        Self {
            chip,
            channel,
            flags: HIT_BIT_MASK,
            adc_high,
            adc_low,
        }
    }

    /// Did the channel trigger (hit bit set)?
    pub fn is_hit(&self) -> bool {
        self.flags & HIT_BIT_MASK != 0
    }
}

/// Header of a raw frame. A frame is the readout of one slab for one trigger.
///
/// Layout (little endian): magic u16, cycle u32, bcid u16, slab u8, reserved u8, n_hits u16
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub cycle: u32,
    pub bcid: u16,
    pub slab: u8,
    pub n_hits: u16,
}

impl FrameHeader {
    /// Parse and structurally check a header. Only magic and hit count are checked here.
    pub fn from_bytes(buffer: &[u8; FRAME_HEADER_SIZE as usize]) -> Result<Self, RawFrameError> {
        let mut cursor = Cursor::new(&buffer[..]);
        let magic = cursor.read_u16::<LittleEndian>()?;
        if magic != FRAME_MAGIC {
            return Err(RawFrameError::BadMagic(magic));
        }
        let cycle = cursor.read_u32::<LittleEndian>()?;
        let bcid = cursor.read_u16::<LittleEndian>()?;
        let slab = cursor.read_u8()?;
        let _reserved = cursor.read_u8()?;
        let n_hits = cursor.read_u16::<LittleEndian>()?;
        if n_hits > MAX_HITS_PER_FRAME {
            return Err(RawFrameError::TooManyHits(n_hits));
        }
        Ok(Self {
            cycle,
            bcid,
            slab,
            n_hits,
        })
    }

    /// The trigger this frame belongs to. Frames sharing a key form one event.
    pub fn event_key(&self) -> (u32, u16) {
        (self.cycle, self.bcid)
    }

    /// Total size of the frame in bytes, header and trailer included
    pub fn frame_size(&self) -> u64 {
        FRAME_HEADER_SIZE + (self.n_hits as u64) * HIT_SIZE + FRAME_TRAILER_SIZE
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u16::<LittleEndian>(FRAME_MAGIC)?;
        writer.write_u32::<LittleEndian>(self.cycle)?;
        writer.write_u16::<LittleEndian>(self.bcid)?;
        writer.write_u8(self.slab)?;
        writer.write_u8(0)?;
        writer.write_u16::<LittleEndian>(self.n_hits)?;
        Ok(())
    }
}

/// A fully decoded frame
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawFrame {
    pub header: FrameHeader,
    pub hits: Vec<RawHit>,
}

impl RawFrame {
    pub fn new(cycle: u32, bcid: u16, slab: u8, hits: Vec<RawHit>) -> Self {
        Self {
            header: FrameHeader {
                cycle,
                bcid,
                slab,
                n_hits: hits.len() as u16,
            },
            hits,
        }
    }

    /// Read one frame, verifying the checksum and the chip/channel range of every hit
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, RawFrameError> {
        let mut header_bytes = [0u8; FRAME_HEADER_SIZE as usize];
        reader.read_exact(&mut header_bytes)?;
        let header = FrameHeader::from_bytes(&header_bytes)?;

        let mut hit_bytes = vec![0u8; (header.n_hits as u64 * HIT_SIZE) as usize];
        reader.read_exact(&mut hit_bytes)?;
        let stored = reader.read_u16::<LittleEndian>()?;
        let computed = checksum(&header_bytes, &hit_bytes);
        if stored != computed {
            return Err(RawFrameError::BadChecksum { stored, computed });
        }

        let mut cursor = Cursor::new(&hit_bytes[..]);
        let mut hits = Vec::with_capacity(header.n_hits as usize);
        for _ in 0..header.n_hits {
            let chip = cursor.read_u8()?;
            if chip >= NUMBER_OF_CHIPS {
                return Err(RawFrameError::BadChip(chip));
            }
            let channel = cursor.read_u8()?;
            if channel >= NUMBER_OF_CHANNELS {
                return Err(RawFrameError::BadChannel(channel));
            }
            let flags = cursor.read_u8()?;
            let _reserved = cursor.read_u8()?;
            let adc_high = cursor.read_u16::<LittleEndian>()?;
            let adc_low = cursor.read_u16::<LittleEndian>()?;
            hits.push(RawHit {
                chip,
                channel,
                flags,
                adc_high,
                adc_low,
            });
        }

        Ok(Self { header, hits })
    }

    /// Encode the frame, including its checksum
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let mut header_bytes = Vec::with_capacity(FRAME_HEADER_SIZE as usize);
        let header = FrameHeader {
            n_hits: self.hits.len() as u16,
            ..self.header
        };
        header.write_to(&mut header_bytes)?;

        let mut hit_bytes = Vec::with_capacity(self.hits.len() * HIT_SIZE as usize);
        for hit in self.hits.iter() {
            hit_bytes.write_u8(hit.chip)?;
            hit_bytes.write_u8(hit.channel)?;
            hit_bytes.write_u8(hit.flags)?;
            hit_bytes.write_u8(0)?;
            hit_bytes.write_u16::<LittleEndian>(hit.adc_high)?;
            hit_bytes.write_u16::<LittleEndian>(hit.adc_low)?;
        }

        writer.write_all(&header_bytes)?;
        writer.write_all(&hit_bytes)?;
        writer.write_u16::<LittleEndian>(checksum(&header_bytes, &hit_bytes))?;
        Ok(())
    }
}

/// Wrapping byte sum over header and hit payload
fn checksum(header: &[u8], hits: &[u8]) -> u16 {
    header
        .iter()
        .chain(hits.iter())
        .fold(0u16, |sum, b| sum.wrapping_add(*b as u16))
}
