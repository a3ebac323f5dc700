// OAM DMA. Writing a source page to FF46 starts a transfer of 160 bytes from
// page * 0x100 to FE00-FE9F. The transfer takes 2 preparation machine cycles
// followed by one byte per machine cycle. The state machine only computes
// addresses; the bus performs the actual copies, so the DMA holds no bus
// reference of its own.
use super::snapshot;
use super::status::Result;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DmaState {
    Idle,
    Preparing,
    Active,
}

pub struct Dma {
    pub state: DmaState,
    starting_addr: u16,
    current_offset: u16,
    prep_delay: u8,
}

pub const OAM_ADDR: u16 = 0xfe00;
pub const OAM_SIZE: u16 = 0x00a0;

impl Dma {
    pub fn power_up() -> Self {
        Self { state: DmaState::Idle, starting_addr: 0x0000, current_offset: 0x0000, prep_delay: 0 }
    }

    pub fn start(&mut self, page: u8) {
        self.state = DmaState::Preparing;
        self.starting_addr = u16::from(page) << 8;
        self.current_offset = 0x0000;
        self.prep_delay = 2;
    }

    pub fn is_active(&self) -> bool {
        self.state == DmaState::Active
    }

    // One machine cycle. Returns the (source, destination) pair to copy this
    // cycle, or None while idle or still preparing.
    pub fn next(&mut self) -> Option<(u16, u16)> {
        match self.state {
            DmaState::Idle => None,
            DmaState::Preparing => {
                self.prep_delay -= 1;
                if self.prep_delay == 0 {
                    self.state = DmaState::Active;
                }
                None
            }
            DmaState::Active => {
                let pair = (self.starting_addr + self.current_offset, OAM_ADDR + self.current_offset);
                self.current_offset += 1;
                if self.current_offset == OAM_SIZE {
                    self.state = DmaState::Idle;
                }
                Some(pair)
            }
        }
    }

    pub fn save_state(&self, w: &mut Vec<u8>) {
        w.push(match self.state {
            DmaState::Idle => 0,
            DmaState::Preparing => 1,
            DmaState::Active => 2,
        });
        snapshot::put_u16(w, self.starting_addr);
        snapshot::put_u16(w, self.current_offset);
        w.push(self.prep_delay);
    }

    pub fn load_state(&mut self, r: &mut snapshot::Reader) -> Result<()> {
        self.state = match r.take_u8()? {
            1 => DmaState::Preparing,
            2 => DmaState::Active,
            _ => DmaState::Idle,
        };
        self.starting_addr = r.take_u16()?;
        self.current_offset = r.take_u16()?;
        self.prep_delay = r.take_u8()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_takes_two_prep_plus_160_cycles() {
        let mut dma = Dma::power_up();
        dma.start(0xc0);
        assert_eq!(dma.next(), None);
        assert_eq!(dma.next(), None);
        for i in 0..160u16 {
            assert_eq!(dma.next(), Some((0xc000 + i, 0xfe00 + i)));
        }
        assert_eq!(dma.state, DmaState::Idle);
        assert_eq!(dma.next(), None);
    }

    #[test]
    fn restart_mid_transfer_rewinds() {
        let mut dma = Dma::power_up();
        dma.start(0x12);
        dma.next();
        dma.next();
        dma.next();
        dma.start(0x34);
        dma.next();
        dma.next();
        assert_eq!(dma.next(), Some((0x3400, 0xfe00)));
    }
}
