// The chip behind the console: a Sharp LR35902 running at 4.194 MHz. One
// machine cycle is four clock ticks; every cycle count below is in machine
// cycles.
use super::intf::VECTORS;
use super::memory::Memory;
use super::register::Flag::{C, H, N, Z};
use super::register::Register;
use super::snapshot;
use super::status::{Error, Result};

pub const CLOCK_FREQUENCY: u32 = 4_194_304;

// Base machine-cycle cost per opcode; conditional branches add their extra
// cost only when taken (see extra_cycles).
//  0  1  2  3  4  5  6  7  8  9  a  b  c  d  e  f
const OP_CYCLES: [u32; 256] = [
    1, 3, 2, 2, 1, 1, 2, 1, 5, 2, 2, 2, 1, 1, 2, 1, // 0
    1, 3, 2, 2, 1, 1, 2, 1, 3, 2, 2, 2, 1, 1, 2, 1, // 1
    2, 3, 2, 2, 1, 1, 2, 1, 2, 2, 2, 2, 1, 1, 2, 1, // 2
    2, 3, 2, 2, 3, 3, 3, 1, 2, 2, 2, 2, 1, 1, 2, 1, // 3
    1, 1, 1, 1, 1, 1, 2, 1, 1, 1, 1, 1, 1, 1, 2, 1, // 4
    1, 1, 1, 1, 1, 1, 2, 1, 1, 1, 1, 1, 1, 1, 2, 1, // 5
    1, 1, 1, 1, 1, 1, 2, 1, 1, 1, 1, 1, 1, 1, 2, 1, // 6
    2, 2, 2, 2, 2, 2, 1, 2, 1, 1, 1, 1, 1, 1, 2, 1, // 7
    1, 1, 1, 1, 1, 1, 2, 1, 1, 1, 1, 1, 1, 1, 2, 1, // 8
    1, 1, 1, 1, 1, 1, 2, 1, 1, 1, 1, 1, 1, 1, 2, 1, // 9
    1, 1, 1, 1, 1, 1, 2, 1, 1, 1, 1, 1, 1, 1, 2, 1, // a
    1, 1, 1, 1, 1, 1, 2, 1, 1, 1, 1, 1, 1, 1, 2, 1, // b
    2, 3, 3, 4, 3, 4, 2, 4, 2, 4, 3, 1, 3, 6, 2, 4, // c
    2, 3, 3, 0, 3, 4, 2, 4, 2, 4, 3, 0, 3, 0, 2, 4, // d
    3, 3, 2, 0, 0, 4, 2, 4, 4, 1, 4, 0, 0, 0, 2, 4, // e
    3, 3, 2, 1, 0, 4, 2, 4, 3, 2, 4, 1, 0, 0, 2, 4, // f
];

//  0  1  2  3  4  5  6  7  8  9  a  b  c  d  e  f
const CB_CYCLES: [u32; 256] = [
    2, 2, 2, 2, 2, 2, 4, 2, 2, 2, 2, 2, 2, 2, 4, 2, // 0
    2, 2, 2, 2, 2, 2, 4, 2, 2, 2, 2, 2, 2, 2, 4, 2, // 1
    2, 2, 2, 2, 2, 2, 4, 2, 2, 2, 2, 2, 2, 2, 4, 2, // 2
    2, 2, 2, 2, 2, 2, 4, 2, 2, 2, 2, 2, 2, 2, 4, 2, // 3
    2, 2, 2, 2, 2, 2, 3, 2, 2, 2, 2, 2, 2, 2, 3, 2, // 4
    2, 2, 2, 2, 2, 2, 3, 2, 2, 2, 2, 2, 2, 2, 3, 2, // 5
    2, 2, 2, 2, 2, 2, 3, 2, 2, 2, 2, 2, 2, 2, 3, 2, // 6
    2, 2, 2, 2, 2, 2, 3, 2, 2, 2, 2, 2, 2, 2, 3, 2, // 7
    2, 2, 2, 2, 2, 2, 4, 2, 2, 2, 2, 2, 2, 2, 4, 2, // 8
    2, 2, 2, 2, 2, 2, 4, 2, 2, 2, 2, 2, 2, 2, 4, 2, // 9
    2, 2, 2, 2, 2, 2, 4, 2, 2, 2, 2, 2, 2, 2, 4, 2, // a
    2, 2, 2, 2, 2, 2, 4, 2, 2, 2, 2, 2, 2, 2, 4, 2, // b
    2, 2, 2, 2, 2, 2, 4, 2, 2, 2, 2, 2, 2, 2, 4, 2, // c
    2, 2, 2, 2, 2, 2, 4, 2, 2, 2, 2, 2, 2, 2, 4, 2, // d
    2, 2, 2, 2, 2, 2, 4, 2, 2, 2, 2, 2, 2, 2, 4, 2, // e
    2, 2, 2, 2, 2, 2, 4, 2, 2, 2, 2, 2, 2, 2, 4, 2, // f
];

// Extra machine cycles a conditional branch costs when taken.
fn extra_cycles(opcode: u8) -> u32 {
    match opcode {
        0x20 | 0x28 | 0x30 | 0x38 => 1,
        0xc2 | 0xca | 0xd2 | 0xda => 1,
        0xc0 | 0xc8 | 0xd0 | 0xd8 => 3,
        0xc4 | 0xcc | 0xd4 | 0xdc => 3,
        _ => 0,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunMode {
    Normal,
    Halted,
    Stopped,
}

pub struct Cpu {
    pub reg: Register,
    pub run_mode: RunMode,
    // Interrupt master enable plus the one-instruction delay slot EI uses.
    pub ime: bool,
    next_ime: bool,
    pub m_cycles: u64,
}

// ALU helpers. Flag behavior follows the published instruction tables; each
// helper leaves untouched exactly the flags the tables say it must.
impl Cpu {
    fn imm(&mut self, mem: &mut dyn Memory) -> Result<u8> {
        let v = mem.get(self.reg.pc)?;
        self.reg.pc = self.reg.pc.wrapping_add(1);
        Ok(v)
    }

    fn imm_word(&mut self, mem: &mut dyn Memory) -> Result<u16> {
        let v = mem.get_word(self.reg.pc)?;
        self.reg.pc = self.reg.pc.wrapping_add(2);
        Ok(v)
    }

    fn stack_add(&mut self, mem: &mut dyn Memory, v: u16) -> Result<()> {
        self.reg.sp = self.reg.sp.wrapping_sub(2);
        mem.set_word(self.reg.sp, v)
    }

    fn stack_pop(&mut self, mem: &mut dyn Memory) -> Result<u16> {
        let r = mem.get_word(self.reg.sp)?;
        self.reg.sp = self.reg.sp.wrapping_add(2);
        Ok(r)
    }

    // ADD: Z N=0 H=bit-3 carry C=bit-7 carry.
    fn alu_add(&mut self, n: u8) {
        let a = self.reg.a;
        let r = a.wrapping_add(n);
        self.reg.set_flag(C, u16::from(a) + u16::from(n) > 0xff);
        self.reg.set_flag(H, (a & 0x0f) + (n & 0x0f) > 0x0f);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        self.reg.a = r;
    }

    // ADC: as ADD including the previous carry in the operand.
    fn alu_adc(&mut self, n: u8) {
        let a = self.reg.a;
        let c = u8::from(self.reg.get_flag(C));
        let r = a.wrapping_add(n).wrapping_add(c);
        self.reg.set_flag(C, u16::from(a) + u16::from(n) + u16::from(c) > 0xff);
        self.reg.set_flag(H, (a & 0x0f) + (n & 0x0f) + c > 0x0f);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        self.reg.a = r;
    }

    // SUB: Z N=1 H=borrow from bit 4 C=borrow.
    fn alu_sub(&mut self, n: u8) {
        let a = self.reg.a;
        let r = a.wrapping_sub(n);
        self.reg.set_flag(C, u16::from(a) < u16::from(n));
        self.reg.set_flag(H, (a & 0x0f) < (n & 0x0f));
        self.reg.set_flag(N, true);
        self.reg.set_flag(Z, r == 0x00);
        self.reg.a = r;
    }

    // SBC: as SUB including the previous carry in the operand.
    fn alu_sbc(&mut self, n: u8) {
        let a = self.reg.a;
        let c = u8::from(self.reg.get_flag(C));
        let r = a.wrapping_sub(n).wrapping_sub(c);
        self.reg.set_flag(C, u16::from(a) < u16::from(n) + u16::from(c));
        self.reg.set_flag(H, (a & 0x0f) < (n & 0x0f) + c);
        self.reg.set_flag(N, true);
        self.reg.set_flag(Z, r == 0x00);
        self.reg.a = r;
    }

    // AND: Z N=0 H=1 C=0.
    fn alu_and(&mut self, n: u8) {
        let r = self.reg.a & n;
        self.reg.set_flag(C, false);
        self.reg.set_flag(H, true);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        self.reg.a = r;
    }

    // XOR: Z N=0 H=0 C=0.
    fn alu_xor(&mut self, n: u8) {
        let r = self.reg.a ^ n;
        self.reg.set_flag(C, false);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        self.reg.a = r;
    }

    // OR: Z N=0 H=0 C=0.
    fn alu_or(&mut self, n: u8) {
        let r = self.reg.a | n;
        self.reg.set_flag(C, false);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        self.reg.a = r;
    }

    // CP: SUB with the result thrown away.
    fn alu_cp(&mut self, n: u8) {
        let a = self.reg.a;
        self.alu_sub(n);
        self.reg.a = a;
    }

    // INC r8: Z N=0 H; C untouched.
    fn alu_inc(&mut self, a: u8) -> u8 {
        let r = a.wrapping_add(1);
        self.reg.set_flag(H, (a & 0x0f) + 0x01 > 0x0f);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    // DEC r8: Z N=1 H; C untouched.
    fn alu_dec(&mut self, a: u8) -> u8 {
        let r = a.wrapping_sub(1);
        self.reg.set_flag(H, a & 0x0f == 0x00);
        self.reg.set_flag(N, true);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    // ADD HL,rr: Z untouched, N=0, H=bit-11 carry, C=bit-15 carry.
    fn alu_add_hl(&mut self, n: u16) {
        let a = self.reg.get_hl();
        let r = a.wrapping_add(n);
        self.reg.set_flag(C, a > 0xffff - n);
        self.reg.set_flag(H, (a & 0x07ff) + (n & 0x07ff) > 0x07ff);
        self.reg.set_flag(N, false);
        self.reg.set_hl(r);
    }

    // Shared by ADD SP,s8 and LD HL,SP+s8: flags come from the low-byte
    // arithmetic, Z and N are cleared.
    fn alu_sp_signed(&mut self, n: u8) -> u16 {
        let a = self.reg.sp;
        let b = i16::from(n as i8) as u16;
        self.reg.set_flag(C, (a & 0x00ff) + (b & 0x00ff) > 0x00ff);
        self.reg.set_flag(H, (a & 0x000f) + (b & 0x000f) > 0x000f);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, false);
        a.wrapping_add(b)
    }

    // SWAP: Z N=0 H=0 C=0.
    fn alu_swap(&mut self, a: u8) -> u8 {
        self.reg.set_flag(C, false);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, a == 0x00);
        (a >> 4) | (a << 4)
    }

    // DAA adjusts A back to packed BCD after an addition or subtraction.
    // Z from the result, H always cleared, C set if the adjustment carried.
    fn alu_daa(&mut self) {
        let mut a = self.reg.a;
        let mut adjust = if self.reg.get_flag(C) { 0x60 } else { 0x00 };
        if self.reg.get_flag(H) {
            adjust |= 0x06;
        }
        if !self.reg.get_flag(N) {
            if a & 0x0f > 0x09 {
                adjust |= 0x06;
            }
            if a > 0x99 {
                adjust |= 0x60;
            }
            a = a.wrapping_add(adjust);
        } else {
            a = a.wrapping_sub(adjust);
        }
        self.reg.set_flag(C, adjust >= 0x60);
        self.reg.set_flag(H, false);
        self.reg.set_flag(Z, a == 0x00);
        self.reg.a = a;
    }

    // CPL: N=1 H=1, Z and C untouched.
    fn alu_cpl(&mut self) {
        self.reg.a = !self.reg.a;
        self.reg.set_flag(H, true);
        self.reg.set_flag(N, true);
    }

    // CCF: complements C, N=0 H=0.
    fn alu_ccf(&mut self) {
        let v = !self.reg.get_flag(C);
        self.reg.set_flag(C, v);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
    }

    // SCF: C=1 N=0 H=0.
    fn alu_scf(&mut self) {
        self.reg.set_flag(C, true);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
    }

    // Rotates and shifts: Z from the result, N=0 H=0, C from the shifted-out
    // bit. The accumulator variants RLCA/RLA/RRCA/RRA clear Z at the call
    // site instead.
    fn alu_rlc(&mut self, a: u8) -> u8 {
        let c = a & 0x80 != 0x00;
        let r = (a << 1) | u8::from(c);
        self.reg.set_flag(C, c);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    fn alu_rl(&mut self, a: u8) -> u8 {
        let c = a & 0x80 != 0x00;
        let r = (a << 1) | u8::from(self.reg.get_flag(C));
        self.reg.set_flag(C, c);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    fn alu_rrc(&mut self, a: u8) -> u8 {
        let c = a & 0x01 != 0x00;
        let r = if c { 0x80 | (a >> 1) } else { a >> 1 };
        self.reg.set_flag(C, c);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    fn alu_rr(&mut self, a: u8) -> u8 {
        let c = a & 0x01 != 0x00;
        let r = if self.reg.get_flag(C) { 0x80 | (a >> 1) } else { a >> 1 };
        self.reg.set_flag(C, c);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    fn alu_sla(&mut self, a: u8) -> u8 {
        let c = a & 0x80 != 0x00;
        let r = a << 1;
        self.reg.set_flag(C, c);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    fn alu_sra(&mut self, a: u8) -> u8 {
        let c = a & 0x01 != 0x00;
        let r = (a >> 1) | (a & 0x80);
        self.reg.set_flag(C, c);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    fn alu_srl(&mut self, a: u8) -> u8 {
        let c = a & 0x01 != 0x00;
        let r = a >> 1;
        self.reg.set_flag(C, c);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    // BIT: Z = NOT bit, N=0 H=1, C untouched.
    fn alu_bit(&mut self, a: u8, b: u8) {
        self.reg.set_flag(H, true);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, a & (1 << b) == 0x00);
    }

    // Relative jump by a signed 8-bit offset.
    fn alu_jr(&mut self, n: u8) {
        self.reg.pc = ((i32::from(self.reg.pc)) + i32::from(n as i8)) as u16;
    }
}

impl Cpu {
    pub fn power_up() -> Self {
        Self { reg: Register::power_up(), run_mode: RunMode::Normal, ime: false, next_ime: false, m_cycles: 0 }
    }

    // Runs one emulation cycle: interrupt servicing, or one instruction, or
    // one idle cycle while halted/stopped. Returns the machine cycles spent.
    pub fn next(&mut self, mem: &mut dyn Memory) -> Result<u32> {
        // An EI from the previous instruction commits after the one executed
        // in this call.
        let pending_ime = self.next_ime;

        // HALT wakes on any raised request flag, interrupts enabled or not.
        if self.run_mode == RunMode::Halted && mem.get(0xff0f)? & 0x1f != 0x00 {
            self.run_mode = RunMode::Normal;
        }

        if self.ime {
            if let Some(cycles) = self.service_interrupt(mem)? {
                self.m_cycles += u64::from(cycles);
                return Ok(cycles);
            }
        }

        if self.run_mode != RunMode::Normal {
            self.m_cycles += 1;
            return Ok(1);
        }

        let cycles = self.ex(mem)?;
        if pending_ime && self.next_ime {
            self.ime = true;
            self.next_ime = false;
        }
        self.m_cycles += u64::from(cycles);
        Ok(cycles)
    }

    // Services the highest-priority pending interrupt, at most one per
    // emulation cycle: clear its request bit, drop IME, push PC and jump to
    // the vector. Costs 5 machine cycles.
    fn service_interrupt(&mut self, mem: &mut dyn Memory) -> Result<Option<u32>> {
        let flags = mem.get(0xff0f)?;
        let pending = mem.get(0xffff)? & flags & 0x1f;
        if pending == 0x00 {
            return Ok(None);
        }
        let n = pending.trailing_zeros() as usize;
        mem.set(0xff0f, flags & !(1 << n))?;
        self.ime = false;
        self.next_ime = false;
        self.stack_add(mem, self.reg.pc)?;
        self.reg.pc = VECTORS[n];
        Ok(Some(5))
    }

    // r8 operand decode shared by the LD/ALU blocks and the CB prefix:
    // B C D E H L (HL) A.
    fn get_r8(&mut self, mem: &mut dyn Memory, idx: u8) -> Result<u8> {
        Ok(match idx {
            0 => self.reg.b,
            1 => self.reg.c,
            2 => self.reg.d,
            3 => self.reg.e,
            4 => self.reg.h,
            5 => self.reg.l,
            6 => mem.get(self.reg.get_hl())?,
            _ => self.reg.a,
        })
    }

    fn set_r8(&mut self, mem: &mut dyn Memory, idx: u8, v: u8) -> Result<()> {
        match idx {
            0 => self.reg.b = v,
            1 => self.reg.c = v,
            2 => self.reg.d = v,
            3 => self.reg.e = v,
            4 => self.reg.h = v,
            5 => self.reg.l = v,
            6 => mem.set(self.reg.get_hl(), v)?,
            _ => self.reg.a = v,
        }
        Ok(())
    }

    fn ex(&mut self, mem: &mut dyn Memory) -> Result<u32> {
        let opcode = self.imm(mem)?;
        let mut taken = false;

        match opcode {
            // 8-bit register-to-register loads and HALT in the middle.
            0x40..=0x75 | 0x77..=0x7f => {
                let v = self.get_r8(mem, opcode & 0x07)?;
                self.set_r8(mem, (opcode >> 3) & 0x07, v)?;
            }
            0x76 => self.run_mode = RunMode::Halted,

            // The ALU block: ADD ADC SUB SBC AND XOR OR CP against r8.
            0x80..=0xbf => {
                let v = self.get_r8(mem, opcode & 0x07)?;
                match (opcode >> 3) & 0x07 {
                    0 => self.alu_add(v),
                    1 => self.alu_adc(v),
                    2 => self.alu_sub(v),
                    3 => self.alu_sbc(v),
                    4 => self.alu_and(v),
                    5 => self.alu_xor(v),
                    6 => self.alu_or(v),
                    _ => self.alu_cp(v),
                }
            }

            0x00 => {}
            0x01 => {
                let v = self.imm_word(mem)?;
                self.reg.set_bc(v);
            }
            0x02 => mem.set(self.reg.get_bc(), self.reg.a)?,
            0x03 => {
                let v = self.reg.get_bc().wrapping_add(1);
                self.reg.set_bc(v);
            }
            0x04 => self.reg.b = self.alu_inc(self.reg.b),
            0x05 => self.reg.b = self.alu_dec(self.reg.b),
            0x06 => self.reg.b = self.imm(mem)?,
            0x07 => {
                self.reg.a = self.alu_rlc(self.reg.a);
                self.reg.set_flag(Z, false);
            }
            0x08 => {
                let a = self.imm_word(mem)?;
                mem.set_word(a, self.reg.sp)?;
            }
            0x09 => self.alu_add_hl(self.reg.get_bc()),
            0x0a => self.reg.a = mem.get(self.reg.get_bc())?,
            0x0b => {
                let v = self.reg.get_bc().wrapping_sub(1);
                self.reg.set_bc(v);
            }
            0x0c => self.reg.c = self.alu_inc(self.reg.c),
            0x0d => self.reg.c = self.alu_dec(self.reg.c),
            0x0e => self.reg.c = self.imm(mem)?,
            0x0f => {
                self.reg.a = self.alu_rrc(self.reg.a);
                self.reg.set_flag(Z, false);
            }
            0x10 => {
                // STOP is encoded with a padding byte; the CPU parks until a
                // reset. Joypad wake and the DIV reset are not modeled.
                self.reg.pc = self.reg.pc.wrapping_add(1);
                self.run_mode = RunMode::Stopped;
            }
            0x11 => {
                let v = self.imm_word(mem)?;
                self.reg.set_de(v);
            }
            0x12 => mem.set(self.reg.get_de(), self.reg.a)?,
            0x13 => {
                let v = self.reg.get_de().wrapping_add(1);
                self.reg.set_de(v);
            }
            0x14 => self.reg.d = self.alu_inc(self.reg.d),
            0x15 => self.reg.d = self.alu_dec(self.reg.d),
            0x16 => self.reg.d = self.imm(mem)?,
            0x17 => {
                self.reg.a = self.alu_rl(self.reg.a);
                self.reg.set_flag(Z, false);
            }
            0x18 => {
                let n = self.imm(mem)?;
                self.alu_jr(n);
            }
            0x19 => self.alu_add_hl(self.reg.get_de()),
            0x1a => self.reg.a = mem.get(self.reg.get_de())?,
            0x1b => {
                let v = self.reg.get_de().wrapping_sub(1);
                self.reg.set_de(v);
            }
            0x1c => self.reg.e = self.alu_inc(self.reg.e),
            0x1d => self.reg.e = self.alu_dec(self.reg.e),
            0x1e => self.reg.e = self.imm(mem)?,
            0x1f => {
                self.reg.a = self.alu_rr(self.reg.a);
                self.reg.set_flag(Z, false);
            }
            0x20 | 0x28 | 0x30 | 0x38 => {
                let n = self.imm(mem)?;
                if self.branch_condition(opcode) {
                    self.alu_jr(n);
                    taken = true;
                }
            }
            0x21 => {
                let v = self.imm_word(mem)?;
                self.reg.set_hl(v);
            }
            0x22 => {
                let a = self.reg.get_hl();
                mem.set(a, self.reg.a)?;
                self.reg.set_hl(a.wrapping_add(1));
            }
            0x23 => {
                let v = self.reg.get_hl().wrapping_add(1);
                self.reg.set_hl(v);
            }
            0x24 => self.reg.h = self.alu_inc(self.reg.h),
            0x25 => self.reg.h = self.alu_dec(self.reg.h),
            0x26 => self.reg.h = self.imm(mem)?,
            0x27 => self.alu_daa(),
            0x29 => self.alu_add_hl(self.reg.get_hl()),
            0x2a => {
                let a = self.reg.get_hl();
                self.reg.a = mem.get(a)?;
                self.reg.set_hl(a.wrapping_add(1));
            }
            0x2b => {
                let v = self.reg.get_hl().wrapping_sub(1);
                self.reg.set_hl(v);
            }
            0x2c => self.reg.l = self.alu_inc(self.reg.l),
            0x2d => self.reg.l = self.alu_dec(self.reg.l),
            0x2e => self.reg.l = self.imm(mem)?,
            0x2f => self.alu_cpl(),
            0x31 => self.reg.sp = self.imm_word(mem)?,
            0x32 => {
                let a = self.reg.get_hl();
                mem.set(a, self.reg.a)?;
                self.reg.set_hl(a.wrapping_sub(1));
            }
            0x33 => self.reg.sp = self.reg.sp.wrapping_add(1),
            0x34 => {
                let a = self.reg.get_hl();
                let v = mem.get(a)?;
                let v = self.alu_inc(v);
                mem.set(a, v)?;
            }
            0x35 => {
                let a = self.reg.get_hl();
                let v = mem.get(a)?;
                let v = self.alu_dec(v);
                mem.set(a, v)?;
            }
            0x36 => {
                let v = self.imm(mem)?;
                mem.set(self.reg.get_hl(), v)?;
            }
            0x37 => self.alu_scf(),
            0x39 => self.alu_add_hl(self.reg.sp),
            0x3a => {
                let a = self.reg.get_hl();
                self.reg.a = mem.get(a)?;
                self.reg.set_hl(a.wrapping_sub(1));
            }
            0x3b => self.reg.sp = self.reg.sp.wrapping_sub(1),
            0x3c => self.reg.a = self.alu_inc(self.reg.a),
            0x3d => self.reg.a = self.alu_dec(self.reg.a),
            0x3e => self.reg.a = self.imm(mem)?,
            0x3f => self.alu_ccf(),

            0xc0 | 0xc8 | 0xd0 | 0xd8 => {
                if self.branch_condition(opcode) {
                    self.reg.pc = self.stack_pop(mem)?;
                    taken = true;
                }
            }
            0xc1 => {
                let v = self.stack_pop(mem)?;
                self.reg.set_bc(v);
            }
            0xc2 | 0xca | 0xd2 | 0xda => {
                let pc = self.imm_word(mem)?;
                if self.branch_condition(opcode) {
                    self.reg.pc = pc;
                    taken = true;
                }
            }
            0xc3 => self.reg.pc = self.imm_word(mem)?,
            0xc4 | 0xcc | 0xd4 | 0xdc => {
                let pc = self.imm_word(mem)?;
                if self.branch_condition(opcode) {
                    self.stack_add(mem, self.reg.pc)?;
                    self.reg.pc = pc;
                    taken = true;
                }
            }
            0xc5 => self.stack_add(mem, self.reg.get_bc())?,
            0xc6 => {
                let v = self.imm(mem)?;
                self.alu_add(v);
            }
            0xc7 | 0xcf | 0xd7 | 0xdf | 0xe7 | 0xef | 0xf7 | 0xff => {
                self.stack_add(mem, self.reg.pc)?;
                self.reg.pc = u16::from(opcode & 0x38);
            }
            0xc9 => self.reg.pc = self.stack_pop(mem)?,
            0xcb => return self.cb_ex(mem),
            0xcd => {
                let pc = self.imm_word(mem)?;
                self.stack_add(mem, self.reg.pc)?;
                self.reg.pc = pc;
            }
            0xce => {
                let v = self.imm(mem)?;
                self.alu_adc(v);
            }
            0xd1 => {
                let v = self.stack_pop(mem)?;
                self.reg.set_de(v);
            }
            0xd5 => self.stack_add(mem, self.reg.get_de())?,
            0xd6 => {
                let v = self.imm(mem)?;
                self.alu_sub(v);
            }
            0xd9 => {
                self.reg.pc = self.stack_pop(mem)?;
                self.ime = true;
            }
            0xde => {
                let v = self.imm(mem)?;
                self.alu_sbc(v);
            }
            0xe0 => {
                let a = 0xff00 | u16::from(self.imm(mem)?);
                mem.set(a, self.reg.a)?;
            }
            0xe1 => {
                let v = self.stack_pop(mem)?;
                self.reg.set_hl(v);
            }
            0xe2 => mem.set(0xff00 | u16::from(self.reg.c), self.reg.a)?,
            0xe5 => self.stack_add(mem, self.reg.get_hl())?,
            0xe6 => {
                let v = self.imm(mem)?;
                self.alu_and(v);
            }
            0xe8 => {
                let n = self.imm(mem)?;
                self.reg.sp = self.alu_sp_signed(n);
            }
            0xe9 => self.reg.pc = self.reg.get_hl(),
            0xea => {
                let a = self.imm_word(mem)?;
                mem.set(a, self.reg.a)?;
            }
            0xee => {
                let v = self.imm(mem)?;
                self.alu_xor(v);
            }
            0xf0 => {
                let a = 0xff00 | u16::from(self.imm(mem)?);
                self.reg.a = mem.get(a)?;
            }
            0xf1 => {
                let v = self.stack_pop(mem)?;
                self.reg.set_af(v);
            }
            0xf2 => self.reg.a = mem.get(0xff00 | u16::from(self.reg.c))?,
            0xf3 => {
                self.ime = false;
                self.next_ime = false;
            }
            0xf5 => self.stack_add(mem, self.reg.get_af())?,
            0xf6 => {
                let v = self.imm(mem)?;
                self.alu_or(v);
            }
            0xf8 => {
                let n = self.imm(mem)?;
                let v = self.alu_sp_signed(n);
                self.reg.set_hl(v);
            }
            0xf9 => self.reg.sp = self.reg.get_hl(),
            0xfa => {
                let a = self.imm_word(mem)?;
                self.reg.a = mem.get(a)?;
            }
            0xfb => self.next_ime = true,
            0xfe => {
                let v = self.imm(mem)?;
                self.alu_cp(v);
            }
            0xd3 | 0xdb | 0xdd | 0xe3 | 0xe4 | 0xeb | 0xec | 0xed | 0xf4 | 0xfc | 0xfd => {
                return Err(Error::UndefinedInstruction { opcode, pc: self.reg.pc.wrapping_sub(1) });
            }
        }

        Ok(OP_CYCLES[usize::from(opcode)] + if taken { extra_cycles(opcode) } else { 0 })
    }

    // NZ Z NC C, encoded in opcode bits 4..3 for every conditional family.
    fn branch_condition(&self, opcode: u8) -> bool {
        match (opcode >> 3) & 0x03 {
            0 => !self.reg.get_flag(Z),
            1 => self.reg.get_flag(Z),
            2 => !self.reg.get_flag(C),
            _ => self.reg.get_flag(C),
        }
    }

    // The CB prefix decodes algorithmically: bits 7..6 select the family,
    // bits 5..3 the rotate kind or bit number, bits 2..0 the operand.
    fn cb_ex(&mut self, mem: &mut dyn Memory) -> Result<u32> {
        let cbcode = self.imm(mem)?;
        let operand = cbcode & 0x07;
        let bit = (cbcode >> 3) & 0x07;
        let value = self.get_r8(mem, operand)?;

        let result = match cbcode >> 6 {
            0x00 => Some(match bit {
                0 => self.alu_rlc(value),
                1 => self.alu_rrc(value),
                2 => self.alu_rl(value),
                3 => self.alu_rr(value),
                4 => self.alu_sla(value),
                5 => self.alu_sra(value),
                6 => self.alu_swap(value),
                _ => self.alu_srl(value),
            }),
            0x01 => {
                self.alu_bit(value, bit);
                None
            }
            0x02 => Some(value & !(1 << bit)),
            _ => Some(value | (1 << bit)),
        };
        if let Some(v) = result {
            self.set_r8(mem, operand, v)?;
        }
        Ok(CB_CYCLES[usize::from(cbcode)])
    }

    pub fn save_state(&self, w: &mut Vec<u8>) {
        let r = &self.reg;
        w.extend_from_slice(&[r.a, r.f, r.b, r.c, r.d, r.e, r.h, r.l]);
        snapshot::put_u16(w, r.sp);
        snapshot::put_u16(w, r.pc);
        w.push(match self.run_mode {
            RunMode::Normal => 0,
            RunMode::Halted => 1,
            RunMode::Stopped => 2,
        });
        snapshot::put_bool(w, self.ime);
        snapshot::put_bool(w, self.next_ime);
        snapshot::put_u64(w, self.m_cycles);
    }

    pub fn load_state(&mut self, r: &mut snapshot::Reader) -> Result<()> {
        let b = r.take_bytes(8)?;
        self.reg.a = b[0];
        self.reg.f = b[1] & 0xf0;
        self.reg.b = b[2];
        self.reg.c = b[3];
        self.reg.d = b[4];
        self.reg.e = b[5];
        self.reg.h = b[6];
        self.reg.l = b[7];
        self.reg.sp = r.take_u16()?;
        self.reg.pc = r.take_u16()?;
        self.run_mode = match r.take_u8()? {
            1 => RunMode::Halted,
            2 => RunMode::Stopped,
            _ => RunMode::Normal,
        };
        self.ime = r.take_bool()?;
        self.next_ime = r.take_bool()?;
        self.m_cycles = r.take_u64()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 64 KiB of flat RAM; enough of a bus for instruction tests.
    struct FlatMem {
        data: Vec<u8>,
    }

    impl FlatMem {
        fn new() -> Self {
            Self { data: vec![0x00; 0x10000] }
        }
    }

    impl Memory for FlatMem {
        fn get(&self, a: u16) -> Result<u8> {
            Ok(self.data[usize::from(a)])
        }

        fn set(&mut self, a: u16, v: u8) -> Result<()> {
            self.data[usize::from(a)] = v;
            Ok(())
        }
    }

    fn run(program: &[u8], steps: usize) -> (Cpu, FlatMem) {
        let mut cpu = Cpu::power_up();
        let mut mem = FlatMem::new();
        mem.data[0x0100..0x0100 + program.len()].copy_from_slice(program);
        for _ in 0..steps {
            cpu.next(&mut mem).unwrap();
        }
        (cpu, mem)
    }

    // Reference flag model for the 8-bit arithmetic family.
    fn reference_add(a: u8, n: u8, carry_in: u8) -> (u8, bool, bool, bool, bool) {
        let r = a.wrapping_add(n).wrapping_add(carry_in);
        let c = u16::from(a) + u16::from(n) + u16::from(carry_in) > 0xff;
        let h = (a & 0x0f) + (n & 0x0f) + carry_in > 0x0f;
        (r, r == 0, false, h, c)
    }

    fn reference_sub(a: u8, n: u8, carry_in: u8) -> (u8, bool, bool, bool, bool) {
        let r = a.wrapping_sub(n).wrapping_sub(carry_in);
        let c = u16::from(a) < u16::from(n) + u16::from(carry_in);
        let h = (a & 0x0f) < (n & 0x0f) + carry_in;
        (r, r == 0, true, h, c)
    }

    fn flags(cpu: &Cpu) -> (bool, bool, bool, bool) {
        (cpu.reg.get_flag(Z), cpu.reg.get_flag(N), cpu.reg.get_flag(H), cpu.reg.get_flag(C))
    }

    #[test]
    fn add_adc_sub_sbc_match_reference_for_all_operands() {
        for a in (0..=255u8).step_by(7) {
            for n in (0..=255u8).step_by(11) {
                for carry in 0..2u8 {
                    let mut cpu = Cpu::power_up();
                    cpu.reg.a = a;
                    cpu.reg.set_flag(C, carry == 1);
                    cpu.alu_adc(n);
                    let (r, z, nn, h, c) = reference_add(a, n, carry);
                    assert_eq!((cpu.reg.a, flags(&cpu)), (r, (z, nn, h, c)), "adc {:02x}+{:02x}+{}", a, n, carry);

                    let mut cpu = Cpu::power_up();
                    cpu.reg.a = a;
                    cpu.reg.set_flag(C, carry == 1);
                    cpu.alu_sbc(n);
                    let (r, z, nn, h, c) = reference_sub(a, n, carry);
                    assert_eq!((cpu.reg.a, flags(&cpu)), (r, (z, nn, h, c)), "sbc {:02x}-{:02x}-{}", a, n, carry);

                    let mut cpu = Cpu::power_up();
                    cpu.reg.a = a;
                    cpu.alu_add(n);
                    let (r, z, nn, h, c) = reference_add(a, n, 0);
                    assert_eq!((cpu.reg.a, flags(&cpu)), (r, (z, nn, h, c)));

                    let mut cpu = Cpu::power_up();
                    cpu.reg.a = a;
                    cpu.alu_sub(n);
                    let (r, z, nn, h, c) = reference_sub(a, n, 0);
                    assert_eq!((cpu.reg.a, flags(&cpu)), (r, (z, nn, h, c)));
                }
            }
        }
    }

    #[test]
    fn logic_ops_flag_contract() {
        for a in (0..=255u8).step_by(13) {
            for n in (0..=255u8).step_by(17) {
                let mut cpu = Cpu::power_up();
                cpu.reg.a = a;
                cpu.alu_and(n);
                assert_eq!(flags(&cpu), (a & n == 0, false, true, false));

                let mut cpu = Cpu::power_up();
                cpu.reg.a = a;
                cpu.alu_or(n);
                assert_eq!(flags(&cpu), (a | n == 0, false, false, false));

                let mut cpu = Cpu::power_up();
                cpu.reg.a = a;
                cpu.alu_xor(n);
                assert_eq!(flags(&cpu), (a ^ n == 0, false, false, false));

                // CP leaves A untouched.
                let mut cpu = Cpu::power_up();
                cpu.reg.a = a;
                cpu.alu_cp(n);
                assert_eq!(cpu.reg.a, a);
            }
        }
    }

    #[test]
    fn inc_dec_preserve_carry() {
        for v in 0..=255u8 {
            for carry in &[false, true] {
                let mut cpu = Cpu::power_up();
                cpu.reg.set_flag(C, *carry);
                cpu.alu_inc(v);
                assert_eq!(cpu.reg.get_flag(C), *carry);
                cpu.alu_dec(v);
                assert_eq!(cpu.reg.get_flag(C), *carry);
            }
        }
    }

    #[test]
    fn accumulator_rotates_clear_z() {
        // RLCA with A=0x80: result 0x01, C set, Z always clear.
        let (cpu, _) = run(&[0x07], 1);
        assert!(!cpu.reg.get_flag(Z));
        // A starts at 0x01 post-boot: RLCA -> 0x02.
        assert_eq!(cpu.reg.a, 0x02);

        let mut cpu = Cpu::power_up();
        let mut mem = FlatMem::new();
        cpu.reg.a = 0x00;
        cpu.reg.f = 0x00;
        mem.data[0x0100] = 0x07;
        cpu.next(&mut mem).unwrap();
        assert!(!cpu.reg.get_flag(Z));
    }

    #[test]
    fn swap_clears_carry() {
        let mut cpu = Cpu::power_up();
        cpu.reg.set_flag(C, true);
        assert_eq!(cpu.alu_swap(0xa5), 0x5a);
        assert!(!cpu.reg.get_flag(C));
    }

    #[test]
    fn daa_after_bcd_add() {
        // A = 0x09; ADD A,0x07 -> 0x10 with H set; DAA -> 0x16 with H clear.
        let (cpu, _) = run(&[0x3e, 0x09, 0xc6, 0x07, 0x27], 3);
        assert_eq!(cpu.reg.a, 0x16);
        assert!(!cpu.reg.get_flag(H));
        assert!(!cpu.reg.get_flag(N));
    }

    #[test]
    fn push_pop_round_trip() {
        // LD BC,0xbeef; PUSH BC; POP DE.
        let (cpu, _) = run(&[0x01, 0xef, 0xbe, 0xc5, 0xd1], 3);
        assert_eq!(cpu.reg.get_de(), 0xbeef);
        assert_eq!(cpu.reg.sp, 0xfffe);
    }

    #[test]
    fn pop_af_masks_low_nibble() {
        // LD BC,0x12ff; PUSH BC; POP AF.
        let (cpu, _) = run(&[0x01, 0xff, 0x12, 0xc5, 0xf1], 3);
        assert_eq!(cpu.reg.a, 0x12);
        assert_eq!(cpu.reg.f, 0xf0);
    }

    #[test]
    fn call_then_ret_restores_pc() {
        // CALL 0x0110; (at 0x0110) RET.
        let mut program = vec![0xcd, 0x10, 0x01];
        program.resize(0x10, 0x00);
        program.push(0xc9);
        let (cpu, _) = run(&program, 2);
        assert_eq!(cpu.reg.pc, 0x0103);
        assert_eq!(cpu.reg.sp, 0xfffe);
    }

    #[test]
    fn untaken_jr_costs_alternate_cycles() {
        // XOR A clears Z? No: XOR A sets Z. Use OR 1 to clear Z, then JR Z.
        let mut cpu = Cpu::power_up();
        let mut mem = FlatMem::new();
        mem.data[0x0100] = 0xf6; // OR 0x01
        mem.data[0x0101] = 0x01;
        mem.data[0x0102] = 0x28; // JR Z,+5
        mem.data[0x0103] = 0x05;
        cpu.next(&mut mem).unwrap();
        let cycles = cpu.next(&mut mem).unwrap();
        assert_eq!(cycles, 2);
        assert_eq!(cpu.reg.pc, 0x0104);
        // Taken variant costs 3.
        let mut cpu = Cpu::power_up();
        mem.data[0x0100] = 0xaf; // XOR A -> Z set
        cpu.next(&mut mem).unwrap();
        mem.data[0x0101] = 0x28;
        mem.data[0x0102] = 0x05;
        let cycles = cpu.next(&mut mem).unwrap();
        assert_eq!(cycles, 3);
        assert_eq!(cpu.reg.pc, 0x0108);
    }

    #[test]
    fn interrupt_priority_and_side_effects() {
        let mut cpu = Cpu::power_up();
        let mut mem = FlatMem::new();
        cpu.ime = true;
        // V-Blank, Timer and Joypad all pending and enabled.
        mem.set(0xffff, 0x1f).unwrap();
        mem.set(0xff0f, 0x15).unwrap();
        let cycles = cpu.next(&mut mem).unwrap();
        assert_eq!(cycles, 5);
        assert_eq!(cpu.reg.pc, 0x0040);
        assert!(!cpu.ime);
        // Only the V-Blank bit was consumed.
        assert_eq!(mem.get(0xff0f).unwrap(), 0x14);
        assert_eq!(cpu.reg.sp, 0xfffc);

        // Next in line: Timer, then Joypad.
        cpu.ime = true;
        cpu.next(&mut mem).unwrap();
        assert_eq!(cpu.reg.pc, 0x0050);
        cpu.ime = true;
        cpu.next(&mut mem).unwrap();
        assert_eq!(cpu.reg.pc, 0x0060);
        assert_eq!(mem.get(0xff0f).unwrap(), 0x00);
    }

    #[test]
    fn ei_is_delayed_one_instruction() {
        let mut cpu = Cpu::power_up();
        let mut mem = FlatMem::new();
        mem.set(0xffff, 0x01).unwrap();
        mem.set(0xff0f, 0x01).unwrap();
        mem.data[0x0100] = 0xfb; // EI
        mem.data[0x0101] = 0x00; // NOP
        mem.data[0x0102] = 0x00; // NOP
        cpu.next(&mut mem).unwrap();
        assert!(!cpu.ime);
        // The next instruction still runs with interrupts off.
        cpu.next(&mut mem).unwrap();
        assert!(cpu.ime);
        assert_eq!(cpu.reg.pc, 0x0102);
        // Now the pending interrupt is taken.
        cpu.next(&mut mem).unwrap();
        assert_eq!(cpu.reg.pc, 0x0040);
    }

    #[test]
    fn di_cancels_pending_ei() {
        let mut cpu = Cpu::power_up();
        let mut mem = FlatMem::new();
        mem.data[0x0100] = 0xfb; // EI
        mem.data[0x0101] = 0xf3; // DI
        cpu.next(&mut mem).unwrap();
        cpu.next(&mut mem).unwrap();
        assert!(!cpu.ime);
    }

    #[test]
    fn halt_wakes_on_request_flag_without_ime() {
        let mut cpu = Cpu::power_up();
        let mut mem = FlatMem::new();
        mem.data[0x0100] = 0x76; // HALT
        cpu.next(&mut mem).unwrap();
        assert_eq!(cpu.run_mode, RunMode::Halted);
        assert_eq!(cpu.next(&mut mem).unwrap(), 1);
        assert_eq!(cpu.run_mode, RunMode::Halted);
        // A raised flag wakes the CPU even with IME and IE clear.
        mem.set(0xff0f, 0x04).unwrap();
        cpu.next(&mut mem).unwrap();
        assert_eq!(cpu.run_mode, RunMode::Normal);
    }

    #[test]
    fn stop_advances_pc_by_two() {
        let (cpu, _) = run(&[0x10, 0x00], 1);
        assert_eq!(cpu.reg.pc, 0x0102);
        assert_eq!(cpu.run_mode, RunMode::Stopped);
    }

    #[test]
    fn undefined_opcode_is_an_error() {
        let mut cpu = Cpu::power_up();
        let mut mem = FlatMem::new();
        mem.data[0x0100] = 0xdd;
        match cpu.next(&mut mem) {
            Err(Error::UndefinedInstruction { opcode: 0xdd, pc: 0x0100 }) => {}
            other => panic!("expected undefined instruction, got {:?}", other),
        }
    }

    #[test]
    fn add_sp_signed_flag_semantics() {
        let mut cpu = Cpu::power_up();
        let mut mem = FlatMem::new();
        cpu.reg.sp = 0x00ff;
        mem.data[0x0100] = 0xe8; // ADD SP,+1
        mem.data[0x0101] = 0x01;
        cpu.next(&mut mem).unwrap();
        assert_eq!(cpu.reg.sp, 0x0100);
        assert!(cpu.reg.get_flag(C));
        assert!(cpu.reg.get_flag(H));
        assert!(!cpu.reg.get_flag(Z));
        assert!(!cpu.reg.get_flag(N));
    }

    #[test]
    fn cb_bit_res_set_family() {
        let mut cpu = Cpu::power_up();
        let mut mem = FlatMem::new();
        cpu.reg.b = 0x00;
        mem.data[0x0100] = 0xcb; // SET 3,B
        mem.data[0x0101] = 0xd8;
        mem.data[0x0102] = 0xcb; // BIT 3,B
        mem.data[0x0103] = 0x58;
        mem.data[0x0104] = 0xcb; // RES 3,B
        mem.data[0x0105] = 0x98;
        cpu.next(&mut mem).unwrap();
        assert_eq!(cpu.reg.b, 0x08);
        cpu.next(&mut mem).unwrap();
        assert!(!cpu.reg.get_flag(Z));
        cpu.next(&mut mem).unwrap();
        assert_eq!(cpu.reg.b, 0x00);
    }

    #[test]
    fn cb_hl_operand_reads_and_writes_memory() {
        let mut cpu = Cpu::power_up();
        let mut mem = FlatMem::new();
        cpu.reg.set_hl(0xc000);
        mem.data[0xc000] = 0x81;
        mem.data[0x0100] = 0xcb; // RLC (HL)
        mem.data[0x0101] = 0x06;
        let cycles = cpu.next(&mut mem).unwrap();
        assert_eq!(cycles, 4);
        assert_eq!(mem.data[0xc000], 0x03);
        assert!(cpu.reg.get_flag(C));
    }

    #[test]
    fn ld_hl_plus_and_minus_walk_hl() {
        let mut cpu = Cpu::power_up();
        let mut mem = FlatMem::new();
        cpu.reg.a = 0x7e;
        cpu.reg.set_hl(0xc000);
        mem.data[0x0100] = 0x22; // LD (HL+),A
        mem.data[0x0101] = 0x32; // LD (HL-),A
        cpu.next(&mut mem).unwrap();
        assert_eq!(cpu.reg.get_hl(), 0xc001);
        cpu.next(&mut mem).unwrap();
        assert_eq!(cpu.reg.get_hl(), 0xc000);
        assert_eq!(mem.data[0xc000], 0x7e);
        assert_eq!(mem.data[0xc001], 0x7e);
    }
}
