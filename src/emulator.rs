// Top-level wiring. The emulator owns the CPU and the bus (which in turn
// owns every peripheral); one step() call advances exactly one CPU emulation
// cycle and then runs the peripherals for the machine cycles it spent.
// Everything the host needs to plug in, it plugs in here.
use super::bus::Bus;
use super::cartridge::{self, SaveHandler};
use super::cpu::Cpu;
use super::joypad::{JoypadKey, KeyState};
use super::memory::Memory;
use super::ppu::FrameSyncFn;
use super::snapshot;
use super::status::{Error, Result};

pub struct Emulator {
    pub bus: Bus,
    pub cpu: Cpu,
}

impl Emulator {
    // The ROM image comes in as bytes; reading it off disk is the host's
    // business.
    pub fn power_up(rom: Vec<u8>) -> Result<Self> {
        let cartridge = cartridge::power_up(rom)?;
        Ok(Self { bus: Bus::power_up(cartridge)?, cpu: Cpu::power_up() })
    }

    // One CPU emulation cycle plus its peripheral time. Returns the machine
    // cycles spent.
    pub fn step(&mut self) -> Result<u32> {
        let cycles = self.cpu.next(&mut self.bus)?;
        self.bus.next(cycles)?;
        Ok(cycles)
    }

    pub fn title(&self) -> String {
        self.bus.cartridge.as_ref().map_or(String::new(), |cart| cart.title())
    }

    // Host hook: called once per V-blank entry, for frame pacing.
    pub fn set_frame_sync(&mut self, callback: FrameSyncFn) {
        self.bus.ppu.set_frame_sync(callback);
    }

    // Host hook: receives the battery RAM image whenever the cartridge
    // flushes it.
    pub fn set_save_handler(&mut self, handler: SaveHandler) -> Result<()> {
        self.bus.cartridge.as_mut().ok_or(Error::NotInitialized)?.set_save_handler(handler);
        Ok(())
    }

    // Restores a previously saved battery image.
    pub fn load_sav(&mut self, bytes: &[u8]) -> Result<()> {
        self.bus.cartridge.as_mut().ok_or(Error::NotInitialized)?.load_sav(bytes);
        Ok(())
    }

    // Key events come from the host; a press raises the Joypad interrupt.
    pub fn key_update(&mut self, key: JoypadKey, state: KeyState) {
        self.bus.joypad.key_update(key, state);
    }

    // Host audio pull: fills an interleaved signed 16-bit stereo buffer,
    // advancing the APU clock the matching number of machine cycles.
    pub fn audio_playback(&mut self, buffer: &mut [i16], sample_rate: u32, volume_adjust: f32) {
        self.bus.apu.playback(buffer, sample_rate, volume_adjust);
    }

    // True once per completed frame; the frame buffer lives at
    // bus.ppu.buffer as 160x144 0xAARRGGBB pixels.
    pub fn check_and_reset_frame_updated(&mut self) -> bool {
        let updated = self.bus.ppu.updated;
        self.bus.ppu.updated = false;
        updated
    }

    // Unloads the cartridge, flushing unsaved battery RAM through the save
    // handler first.
    pub fn eject(&mut self) -> Result<()> {
        match self.bus.cartridge.as_mut() {
            Some(cart) => {
                cart.sav();
                self.bus.cartridge = None;
                Ok(())
            }
            None => Err(Error::NotInitialized),
        }
    }

    pub fn save_state(&self, w: &mut Vec<u8>) {
        self.cpu.save_state(w);
        self.bus.save_state(w);
    }

    pub fn load_state(&mut self, r: &mut snapshot::Reader) -> Result<()> {
        self.cpu.load_state(r)?;
        self.bus.load_state(r)?;
        Ok(())
    }

    // Convenience for hosts and tests that poke the machine directly.
    pub fn get(&self, a: u16) -> Result<u8> {
        self.bus.get(a)
    }

    pub fn set(&mut self, a: u16, v: u8) -> Result<()> {
        self.bus.set(a, v)
    }
}
