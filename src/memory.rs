// General Memory Map
// 0000-3FFF   16KB ROM Bank 00     (in cartridge, fixed at bank 00)
// 4000-7FFF   16KB ROM Bank 01..NN (in cartridge, switchable bank number)
// 8000-9FFF   8KB Video RAM (VRAM)
// A000-BFFF   8KB External RAM     (in cartridge, switchable bank, if any)
// C000-DFFF   8KB Work RAM (WRAM)
// E000-FDFF   Same as C000-DDFF (ECHO)    (typically not used)
// FE00-FE9F   Sprite Attribute Table (OAM)
// FEA0-FEFF   Not Usable
// FF00-FF7F   I/O Ports
// FF80-FFFE   High RAM (HRAM)
// FFFF        Interrupt Enable Register
//
// Every mapped component implements this trait as its bus port: the component
// subtracts its own base offset, so addressing inside it is local and an
// address outside its region answers AddressOutOfBound instead of wrapping.
use super::status::Result;

pub trait Memory {
    fn get(&self, a: u16) -> Result<u8>;

    fn set(&mut self, a: u16, v: u8) -> Result<()>;

    fn get_word(&self, a: u16) -> Result<u16> {
        Ok(u16::from(self.get(a)?) | (u16::from(self.get(a.wrapping_add(1))?) << 8))
    }

    fn set_word(&mut self, a: u16, v: u16) -> Result<()> {
        self.set(a, (v & 0xff) as u8)?;
        self.set(a.wrapping_add(1), (v >> 8) as u8)
    }
}
