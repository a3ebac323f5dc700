// The eight buttons/direction keys are arranged as a 2x4 matrix. The program
// selects either the button or the direction row by writing to FF00, then
// reads the column bits (0 = pressed).
//
// FF00 - P1/JOYP - Joypad (R/W)
// Bit 7 - Not used (reads 1)
// Bit 6 - Not used (reads 1)
// Bit 5 - P15 Select Button Keys      (0=Select)
// Bit 4 - P14 Select Direction Keys   (0=Select)
// Bit 3 - P13 Input Down  or Start    (0=Pressed) (Read Only)
// Bit 2 - P12 Input Up    or Select   (0=Pressed) (Read Only)
// Bit 1 - P11 Input Left  or Button B (0=Pressed) (Read Only)
// Bit 0 - P10 Input Right or Button A (0=Pressed) (Read Only)
use super::intf::{Flag, Intf};
use super::memory::Memory;
use super::status::{Error, Result};
use std::cell::RefCell;
use std::rc::Rc;

#[rustfmt::skip]
#[derive(Clone, Copy)]
pub enum JoypadKey {
    Right  = 0b0000_0001,
    Left   = 0b0000_0010,
    Up     = 0b0000_0100,
    Down   = 0b0000_1000,
    A      = 0b0001_0000,
    B      = 0b0010_0000,
    Select = 0b0100_0000,
    Start  = 0b1000_0000,
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub enum KeyState {
    Pressed,
    Released,
}

pub struct Joypad {
    intf: Rc<RefCell<Intf>>,
    // All eight keys, 1 = released.
    matrix: u8,
    // Row select bits as written to FF00 bits 5..4.
    select: u8,
}

impl Joypad {
    pub fn power_up(intf: Rc<RefCell<Intf>>) -> Self {
        Self { intf, matrix: 0xff, select: 0x30 }
    }

    pub fn key_update(&mut self, key: JoypadKey, state: KeyState) {
        match state {
            KeyState::Pressed => {
                self.matrix &= !(key as u8);
                self.intf.borrow_mut().hi(Flag::Joypad);
            }
            KeyState::Released => self.matrix |= key as u8,
        }
    }
}

impl Memory for Joypad {
    fn get(&self, a: u16) -> Result<u8> {
        if a != 0xff00 {
            return Err(Error::AddressOutOfBound { address: a });
        }
        let base = 0xc0 | self.select;
        if self.select & 0x10 == 0x00 {
            return Ok(base | (self.matrix & 0x0f));
        }
        if self.select & 0x20 == 0x00 {
            return Ok(base | (self.matrix >> 4));
        }
        Ok(base | 0x0f)
    }

    fn set(&mut self, a: u16, v: u8) -> Result<()> {
        if a != 0xff00 {
            return Err(Error::AddressOutOfBound { address: a });
        }
        self.select = v & 0x30;
        Ok(())
    }
}
