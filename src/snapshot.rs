// State snapshots. A snapshot is a bitwise copy of the entire internal state
// (CPU registers, interrupt bytes, timer, DMA, MBC bank state, PPU including
// the pixel pipeline and video buffer, all RAM, APU channel state and wave
// RAM), serialized into a deflate-compressed block. The host decides where
// blocks live; slots are just identifiers 0 through 9 baked into the header.
use super::emulator::Emulator;
use super::status::{Error, Result};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

const MAGIC: [u8; 4] = *b"DMGS";
const VERSION: u8 = 1;

// Little-endian byte reader over a decompressed snapshot body. Every take
// checks the remaining length so a truncated or foreign block fails cleanly
// instead of restoring half a machine.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn take_u8(&mut self) -> Result<u8> {
        let b = self.take_bytes(1)?;
        Ok(b[0])
    }

    pub fn take_u16(&mut self) -> Result<u16> {
        let b = self.take_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn take_u32(&mut self) -> Result<u32> {
        let b = self.take_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn take_u64(&mut self) -> Result<u64> {
        let b = self.take_bytes(8)?;
        let mut raw = [0x00; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn take_bool(&mut self) -> Result<bool> {
        Ok(self.take_u8()? != 0)
    }

    pub fn take_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::Generic);
        }
        let b = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(b)
    }

    pub fn fill(&mut self, target: &mut [u8]) -> Result<()> {
        let n = target.len();
        target.copy_from_slice(self.take_bytes(n)?);
        Ok(())
    }

    pub fn done(&self) -> bool {
        self.pos == self.data.len()
    }
}

pub fn put_bool(w: &mut Vec<u8>, v: bool) {
    w.push(if v { 1 } else { 0 });
}

pub fn put_u16(w: &mut Vec<u8>, v: u16) {
    w.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u32(w: &mut Vec<u8>, v: u32) {
    w.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u64(w: &mut Vec<u8>, v: u64) {
    w.extend_from_slice(&v.to_le_bytes());
}

pub fn save(emulator: &Emulator, slot: u8) -> Result<Vec<u8>> {
    if slot > 9 {
        return Err(Error::InvalidArgument);
    }

    let mut body = Vec::new();
    emulator.save_state(&mut body);

    let mut block = Vec::with_capacity(body.len() / 2 + 16);
    block.extend_from_slice(&MAGIC);
    block.push(VERSION);
    block.push(slot);
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&body).map_err(|_| Error::Generic)?;
    block.extend_from_slice(&encoder.finish().map_err(|_| Error::Generic)?);

    rog::debugln!("State snapshot saved to slot {}", slot);
    Ok(block)
}

pub fn load(emulator: &mut Emulator, block: &[u8]) -> Result<u8> {
    if block.len() < 6 || block[0..4] != MAGIC {
        return Err(Error::Generic);
    }
    if block[4] != VERSION {
        return Err(Error::Unsupported);
    }
    let slot = block[5];
    if slot > 9 {
        return Err(Error::InvalidArgument);
    }

    let mut body = Vec::new();
    DeflateDecoder::new(&block[6..]).read_to_end(&mut body).map_err(|_| Error::Generic)?;

    let mut r = Reader::new(&body);
    emulator.load_state(&mut r)?;
    // Bank pointers are cached state derived from the bank numbers that were
    // just restored.
    if let Some(cart) = emulator.bus.cartridge.as_mut() {
        cart.reload_banks();
    }

    rog::debugln!("State snapshot loaded from slot {}", slot);
    Ok(slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_refuses_truncated_input() {
        let mut r = Reader::new(&[0x01, 0x02]);
        assert_eq!(r.take_u16().unwrap(), 0x0201);
        assert!(r.take_u8().is_err());
        assert!(r.done());
    }

    #[test]
    fn reader_round_trip() {
        let mut w = Vec::new();
        w.push(0xab);
        put_u16(&mut w, 0x1234);
        put_u32(&mut w, 0xdeadbeef);
        put_u64(&mut w, 0x0123_4567_89ab_cdef);
        put_bool(&mut w, true);
        let mut r = Reader::new(&w);
        assert_eq!(r.take_u8().unwrap(), 0xab);
        assert_eq!(r.take_u16().unwrap(), 0x1234);
        assert_eq!(r.take_u32().unwrap(), 0xdeadbeef);
        assert_eq!(r.take_u64().unwrap(), 0x0123_4567_89ab_cdef);
        assert!(r.take_bool().unwrap());
        assert!(r.done());
    }
}
