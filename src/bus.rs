// The address bus: the single read/write entry point the CPU sees, routing
// every 16-bit address to the owning component. The bus also owns the
// components outright, which is what breaks the PPU<->bus reference cycle:
// ports borrow for exactly one call.
use super::apu::Apu;
use super::cartridge::Cartridge;
use super::dma::Dma;
use super::intf::Intf;
use super::joypad::Joypad;
use super::memory::Memory;
use super::ppu::Ppu;
use super::serial::Serial;
use super::snapshot;
use super::status::{Error, Result};
use super::timer::Timer;
use std::cell::RefCell;
use std::rc::Rc;

const WRAM_SIZE: usize = 0x2000;
const HRAM_SIZE: usize = 0x7f;

pub struct Bus {
    // None until a cartridge is inserted; ROM and external RAM accesses
    // answer NotInitialized in that state.
    pub cartridge: Option<Box<dyn Cartridge>>,
    pub apu: Apu,
    pub ppu: Ppu,
    pub joypad: Joypad,
    pub serial: Serial,
    pub timer: Timer,
    pub dma: Dma,
    pub intf: Rc<RefCell<Intf>>,
    wram: [u8; WRAM_SIZE],
    hram: [u8; HRAM_SIZE],
}

impl Bus {
    pub fn power_up(cartridge: Box<dyn Cartridge>) -> Result<Self> {
        let intf = Rc::new(RefCell::new(Intf::power_up()));
        let mut bus = Self {
            cartridge: Some(cartridge),
            apu: Apu::power_up(),
            ppu: Ppu::power_up(intf.clone()),
            joypad: Joypad::power_up(intf.clone()),
            serial: Serial::power_up(intf.clone()),
            timer: Timer::power_up(intf.clone()),
            dma: Dma::power_up(),
            intf,
            wram: [0x00; WRAM_SIZE],
            hram: [0x00; HRAM_SIZE],
        };
        // I/O register state the boot ROM leaves behind. NR52 first: the APU
        // ignores register writes while powered off.
        bus.set(0xff05, 0x00)?;
        bus.set(0xff06, 0x00)?;
        bus.set(0xff07, 0x00)?;
        bus.set(0xff26, 0x80)?;
        bus.set(0xff10, 0x80)?;
        bus.set(0xff11, 0xbf)?;
        bus.set(0xff12, 0xf3)?;
        bus.set(0xff14, 0xbf)?;
        bus.set(0xff16, 0x3f)?;
        bus.set(0xff17, 0x00)?;
        bus.set(0xff19, 0xbf)?;
        bus.set(0xff1a, 0x7f)?;
        bus.set(0xff1b, 0xff)?;
        bus.set(0xff1c, 0x9f)?;
        bus.set(0xff1e, 0xbf)?;
        bus.set(0xff20, 0xff)?;
        bus.set(0xff21, 0x00)?;
        bus.set(0xff22, 0x00)?;
        bus.set(0xff23, 0xbf)?;
        bus.set(0xff24, 0x77)?;
        bus.set(0xff25, 0xf3)?;
        bus.set(0xff40, 0x91)?;
        bus.set(0xff42, 0x00)?;
        bus.set(0xff43, 0x00)?;
        bus.set(0xff45, 0x00)?;
        bus.set(0xff47, 0xfc)?;
        bus.set(0xff48, 0xff)?;
        bus.set(0xff49, 0xff)?;
        bus.set(0xff4a, 0x00)?;
        bus.set(0xff4b, 0x00)?;
        Ok(bus)
    }

    // Advance every peripheral by the machine cycles one CPU emulation cycle
    // spent: the timer counts each cycle, the DMA moves one byte, the PPU
    // runs four dots. The APU keeps its own time against the host audio
    // clock (see Apu::playback).
    pub fn next(&mut self, m_cycles: u32) -> Result<()> {
        for _ in 0..m_cycles {
            self.timer.next();
            if let Some((src, dst)) = self.dma.next() {
                let byte = self.get(src)?;
                self.ppu.set(dst, byte)?;
            }
            for _ in 0..4 {
                self.ppu.next();
            }
        }
        Ok(())
    }

    fn cartridge_ref(&self) -> Result<&dyn Cartridge> {
        match self.cartridge.as_ref() {
            Some(cart) => Ok(cart.as_ref()),
            None => Err(Error::NotInitialized),
        }
    }

    fn cartridge_mut(&mut self) -> Result<&mut Box<dyn Cartridge>> {
        match self.cartridge.as_mut() {
            Some(cart) => Ok(cart),
            None => Err(Error::NotInitialized),
        }
    }

    pub fn save_state(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(&self.wram);
        w.extend_from_slice(&self.hram);
        w.push(self.intf.borrow().flags);
        w.push(self.intf.borrow().enable);
        self.timer.save_state(w);
        self.dma.save_state(w);
        self.ppu.save_state(w);
        self.apu.save_state(w);
        if let Some(cart) = self.cartridge.as_ref() {
            cart.save_state(w);
        }
    }

    pub fn load_state(&mut self, r: &mut snapshot::Reader) -> Result<()> {
        r.fill(&mut self.wram)?;
        r.fill(&mut self.hram)?;
        self.intf.borrow_mut().flags = r.take_u8()?;
        self.intf.borrow_mut().enable = r.take_u8()?;
        self.timer.load_state(r)?;
        self.dma.load_state(r)?;
        self.ppu.load_state(r)?;
        self.apu.load_state(r)?;
        if let Some(cart) = self.cartridge.as_mut() {
            cart.load_state(r)?;
        }
        Ok(())
    }
}

impl Memory for Bus {
    fn get(&self, a: u16) -> Result<u8> {
        match a {
            0x0000..=0x7fff => self.cartridge_ref()?.get(a),
            0x8000..=0x9fff => self.ppu.get(a),
            0xa000..=0xbfff => self.cartridge_ref()?.get(a),
            0xc000..=0xdfff => Ok(self.wram[usize::from(a - 0xc000)]),
            // Echo RAM is not wired up; reads yield 0.
            0xe000..=0xfdff => Ok(0x00),
            0xfe00..=0xfe9f => {
                // The CPU is locked out of OAM while the DMA owns it.
                if self.dma.is_active() {
                    return Ok(0xff);
                }
                self.ppu.get(a)
            }
            0xfea0..=0xfeff => Ok(0x00),
            0xff00 => self.joypad.get(a),
            0xff01..=0xff02 => self.serial.get(a),
            0xff04..=0xff07 => self.timer.get(a),
            0xff0f => self.intf.borrow().get(a),
            0xff10..=0xff3f => self.apu.get(a),
            0xff40..=0xff4b => self.ppu.get(a),
            // Unmapped I/O reads as open bus.
            0xff03 | 0xff08..=0xff0e | 0xff4c..=0xff7f => Ok(0xff),
            0xff80..=0xfffe => Ok(self.hram[usize::from(a - 0xff80)]),
            0xffff => self.intf.borrow().get(a),
        }
    }

    fn set(&mut self, a: u16, v: u8) -> Result<()> {
        match a {
            0x0000..=0x7fff => self.cartridge_mut()?.set(a, v),
            0x8000..=0x9fff => self.ppu.set(a, v),
            0xa000..=0xbfff => self.cartridge_mut()?.set(a, v),
            0xc000..=0xdfff => {
                self.wram[usize::from(a - 0xc000)] = v;
                Ok(())
            }
            0xe000..=0xfdff => Ok(()),
            0xfe00..=0xfe9f => self.ppu.set(a, v),
            0xfea0..=0xfeff => Ok(()),
            0xff00 => self.joypad.set(a, v),
            0xff01..=0xff02 => self.serial.set(a, v),
            0xff04..=0xff07 => self.timer.set(a, v),
            0xff0f => self.intf.borrow_mut().set(a, v),
            0xff10..=0xff3f => self.apu.set(a, v),
            0xff46 => {
                // The register byte is readable like any other, but writing
                // it launches an OAM transfer.
                self.ppu.set(a, v)?;
                self.dma.start(v);
                Ok(())
            }
            0xff40..=0xff4b => self.ppu.set(a, v),
            0xff03 | 0xff08..=0xff0e | 0xff4c..=0xff7f => Ok(()),
            0xff80..=0xfffe => {
                self.hram[usize::from(a - 0xff80)] = v;
                Ok(())
            }
            0xffff => self.intf.borrow_mut().set(a, v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge;

    fn bus() -> Bus {
        let rom = cartridge::tests::build_rom(0x00, 0x00, 0x00, 2);
        Bus::power_up(cartridge::power_up(rom).unwrap()).unwrap()
    }

    #[test]
    fn echo_and_unusable_regions_read_zero_and_swallow_writes() {
        let mut b = bus();
        b.set(0xe000, 0x55).unwrap();
        assert_eq!(b.get(0xe000).unwrap(), 0x00);
        b.set(0xfea0, 0x55).unwrap();
        assert_eq!(b.get(0xfea0).unwrap(), 0x00);
    }

    #[test]
    fn wram_and_hram_round_trip() {
        let mut b = bus();
        b.set(0xc123, 0xab).unwrap();
        assert_eq!(b.get(0xc123).unwrap(), 0xab);
        b.set(0xff80, 0xcd).unwrap();
        assert_eq!(b.get(0xff80).unwrap(), 0xcd);
        b.set(0xfffe, 0xef).unwrap();
        assert_eq!(b.get(0xfffe).unwrap(), 0xef);
    }

    #[test]
    fn missing_cartridge_is_not_initialized() {
        let mut b = bus();
        b.cartridge = None;
        assert_eq!(b.get(0x0100).unwrap_err(), Error::NotInitialized);
        assert_eq!(b.set(0xa000, 0x00).unwrap_err(), Error::NotInitialized);
        // The rest of the bus still works.
        assert!(b.get(0xc000).is_ok());
    }

    #[test]
    fn dma_copies_oam_over_162_cycles() {
        let mut b = bus();
        for i in 0..0xa0u16 {
            b.set(0xc000 + i, i as u8).unwrap();
        }
        b.set(0xff46, 0xc0).unwrap();
        assert_eq!(b.get(0xff46).unwrap(), 0xc0);
        b.next(162).unwrap();
        assert!(!b.dma.is_active());
        for i in 0..0xa0u16 {
            assert_eq!(b.ppu.get(0xfe00 + i).unwrap(), i as u8);
        }
    }

    #[test]
    fn oam_reads_ff_while_dma_active() {
        let mut b = bus();
        b.set(0xfe00, 0x3c).unwrap();
        b.set(0xff46, 0xc0).unwrap();
        b.next(3).unwrap();
        assert!(b.dma.is_active());
        assert_eq!(b.get(0xfe00).unwrap(), 0xff);
        b.next(160).unwrap();
        assert_eq!(b.get(0xfe00).unwrap(), 0x00);
    }

    #[test]
    fn post_boot_io_defaults() {
        let b = bus();
        assert_eq!(b.get(0xff40).unwrap(), 0x91);
        assert_eq!(b.get(0xff47).unwrap(), 0xfc);
        // Boot leaves the APU on with channel 1 enabled.
        assert_eq!(b.get(0xff26).unwrap(), 0xf1);
    }
}
