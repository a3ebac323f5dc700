// MBC3 real-time clock. The clock itself is a seconds counter anchored to
// host wall-clock time: each sync adds the elapsed wall-clock delta unless
// the HALT bit stops it. The five visible registers are a latched snapshot
// of that counter, decoupled from it until the next 0-to-1 latch command.
//
// The Clock Counter Registers
//  08h  RTC S   Seconds   0-59
//  09h  RTC M   Minutes   0-59
//  0Ah  RTC H   Hours     0-23
//  0Bh  RTC DL  Lower 8 bits of Day Counter
//  0Ch  RTC DH  Upper 1 bit of Day Counter, Carry Bit, Halt Flag
//        Bit 0  Most significant bit of Day Counter (Bit 8)
//        Bit 6  Halt (0=Active, 1=Stop Timer)
//        Bit 7  Day Counter Carry Bit (1=Counter Overflow, sticky)
use super::snapshot;
use super::status::{Error, Result};
use std::time::SystemTime;

const MAX_DAYS: u64 = 0x1ff;
const MAX_COUNTER: u64 = (MAX_DAYS + 1) * 24 * 60 * 60;

const DAY_MSB: u8 = 0x01;
const HALT: u8 = 0x40;
const DAY_OVERFLOW: u8 = 0x80;

// Reads return the shadow value ANDed with the per-register mask; the
// remaining bits do not exist.
const REG_MASKS: [u8; 5] = [0x3f, 0x3f, 0x1f, 0xff, 0xc1];

const REG_SECONDS: usize = 0;
const REG_MINUTES: usize = 1;
const REG_HOURS: usize = 2;
const REG_DAYS: usize = 3;
const REG_DAY_CTRL: usize = 4;

fn unix_now() -> u64 {
    SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

pub struct Rtc {
    enabled: bool,
    active_reg: usize,
    prev_latch: u8,
    // Seconds since the clock's origin, wrapped at 512 days.
    counter: u64,
    prev_sync: u64,
    regs: [u8; 5],
}

impl Rtc {
    pub fn power_up() -> Self {
        Self {
            enabled: false,
            active_reg: REG_SECONDS,
            prev_latch: 0xff,
            counter: 0,
            prev_sync: unix_now(),
            regs: [0x00; 5],
        }
    }

    // The same 0x0A write that enables cartridge RAM also gates the RTC
    // registers.
    pub fn enable(&mut self, enable: bool) {
        self.enabled = enable;
    }

    // MBC3 register select values are 0x08..0x0C.
    pub fn select_reg(&mut self, v: u8) -> Result<()> {
        if !(0x08..=0x0c).contains(&v) {
            return Err(Error::InvalidArgument);
        }
        self.active_reg = usize::from(v - 0x08);
        Ok(())
    }

    fn is_halted(&self) -> bool {
        self.regs[REG_DAY_CTRL] & HALT != 0x00
    }

    fn check_overflow(&mut self) {
        if self.counter / (24 * 60 * 60) > MAX_DAYS {
            self.counter %= MAX_COUNTER;
            self.regs[REG_DAY_CTRL] |= DAY_OVERFLOW;
        }
    }

    fn counter_to_regs(counter: u64, regs: &mut [u8; 5]) {
        regs[REG_SECONDS] = (counter % 60) as u8;
        regs[REG_MINUTES] = (counter / 60 % 60) as u8;
        regs[REG_HOURS] = (counter / 3600 % 24) as u8;
        let days = counter / (24 * 60 * 60);
        regs[REG_DAYS] = (days & 0xff) as u8;
        regs[REG_DAY_CTRL] &= !DAY_MSB;
        if days & 0x100 != 0 {
            regs[REG_DAY_CTRL] |= DAY_MSB;
        }
    }

    fn regs_to_counter(&mut self, regs: &[u8; 5]) {
        let days = (u64::from(regs[REG_DAY_CTRL] & DAY_MSB) << 8) | u64::from(regs[REG_DAYS]);
        self.counter = u64::from(regs[REG_SECONDS])
            + u64::from(regs[REG_MINUTES]) * 60
            + u64::from(regs[REG_HOURS]) * 3600
            + days * 24 * 60 * 60;
        self.check_overflow();
    }

    pub fn sync(&mut self) {
        self.sync_at(unix_now());
    }

    pub fn sync_at(&mut self, now: u64) {
        if self.is_halted() {
            return;
        }
        let delta = now.saturating_sub(self.prev_sync);
        self.counter += delta;
        self.prev_sync = now;
        self.check_overflow();
    }

    // A 0-then-1 write sequence latches the counter into the visible
    // registers; HALT and the overflow bit are preserved.
    pub fn latch(&mut self, v: u8) {
        self.latch_at(v, unix_now());
    }

    pub fn latch_at(&mut self, v: u8, now: u64) {
        if self.prev_latch == 0 && v == 1 {
            self.sync_at(now);
            let counter = self.counter;
            Self::counter_to_regs(counter, &mut self.regs);
        }
        self.prev_latch = v;
    }

    pub fn get(&self) -> u8 {
        if !self.enabled {
            return 0xff;
        }
        self.regs[self.active_reg] & REG_MASKS[self.active_reg]
    }

    pub fn set(&mut self, v: u8) {
        self.set_at(v, unix_now());
    }

    // While halted, a register write rewrites the counter by reversing the
    // shadow derivation. While running, only the HALT and overflow bits of
    // the day-control register can change.
    pub fn set_at(&mut self, v: u8, now: u64) {
        if !self.enabled {
            return;
        }
        if self.is_halted() {
            let mut mirror = [0x00; 5];
            let counter = self.counter;
            Self::counter_to_regs(counter, &mut mirror);
            mirror[self.active_reg] = v & REG_MASKS[self.active_reg];
            self.regs_to_counter(&mirror);
        }
        if self.active_reg == REG_DAY_CTRL {
            self.update_halt(v & HALT != 0x00, now);
            self.regs[REG_DAY_CTRL] &= !(DAY_OVERFLOW | HALT);
            self.regs[REG_DAY_CTRL] |= v & (DAY_OVERFLOW | HALT);
        }
    }

    fn update_halt(&mut self, halt: bool, now: u64) {
        if self.is_halted() && !halt {
            // Restarting: no time may leak in for the halted span.
            self.prev_sync = now;
        } else if !self.is_halted() && halt {
            self.sync_at(now);
        }
    }

    // Battery payload appended to the cartridge RAM image: the day-control
    // byte followed by the big-endian counter.
    pub const BATTERY_LEN: usize = 9;

    pub fn save_battery(&self, w: &mut Vec<u8>) {
        w.push(self.regs[REG_DAY_CTRL]);
        w.extend_from_slice(&self.counter.to_be_bytes());
    }

    pub fn load_battery(&mut self, b: &[u8]) {
        if b.len() < Self::BATTERY_LEN {
            return;
        }
        self.regs[REG_DAY_CTRL] = b[0];
        let mut raw = [0x00; 8];
        raw.copy_from_slice(&b[1..9]);
        self.counter = u64::from_be_bytes(raw);
        self.prev_sync = unix_now();
    }

    pub fn save_state(&self, w: &mut Vec<u8>) {
        snapshot::put_bool(w, self.enabled);
        w.push(self.active_reg as u8);
        w.push(self.prev_latch);
        snapshot::put_u64(w, self.counter);
        snapshot::put_u64(w, self.prev_sync);
        w.extend_from_slice(&self.regs);
    }

    pub fn load_state(&mut self, r: &mut snapshot::Reader) -> Result<()> {
        self.enabled = r.take_bool()?;
        self.active_reg = usize::from(r.take_u8()?.min(4));
        self.prev_latch = r.take_u8()?;
        self.counter = r.take_u64()?;
        self.prev_sync = r.take_u64()?;
        r.fill(&mut self.regs)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_rtc() -> Rtc {
        let mut rtc = Rtc::power_up();
        rtc.enable(true);
        rtc.prev_sync = 0;
        rtc
    }

    #[test]
    fn latch_derives_shadow_registers() {
        let mut rtc = running_rtc();
        // 2 days, 3 hours, 4 minutes, 5 seconds.
        let now = 2 * 86400 + 3 * 3600 + 4 * 60 + 5;
        rtc.latch_at(0, now);
        rtc.latch_at(1, now);
        rtc.select_reg(0x08).unwrap();
        assert_eq!(rtc.get(), 5);
        rtc.select_reg(0x09).unwrap();
        assert_eq!(rtc.get(), 4);
        rtc.select_reg(0x0a).unwrap();
        assert_eq!(rtc.get(), 3);
        rtc.select_reg(0x0b).unwrap();
        assert_eq!(rtc.get(), 2);
        rtc.select_reg(0x0c).unwrap();
        assert_eq!(rtc.get() & DAY_MSB, 0);
    }

    #[test]
    fn day_msb_and_overflow() {
        let mut rtc = running_rtc();
        rtc.latch_at(0, 300 * 86400);
        rtc.latch_at(1, 300 * 86400);
        rtc.select_reg(0x0c).unwrap();
        assert_eq!(rtc.get() & DAY_MSB, DAY_MSB);
        assert_eq!(rtc.get() & DAY_OVERFLOW, 0);

        // Past 511 days the counter wraps and the carry bit sticks.
        rtc.latch_at(0, 513 * 86400);
        rtc.latch_at(1, 513 * 86400);
        assert_eq!(rtc.get() & DAY_OVERFLOW, DAY_OVERFLOW);
        rtc.select_reg(0x0b).unwrap();
        assert_eq!(rtc.get(), 1);
    }

    #[test]
    fn reads_while_disabled_return_ff() {
        let mut rtc = running_rtc();
        rtc.enable(false);
        assert_eq!(rtc.get(), 0xff);
    }

    #[test]
    fn halt_stops_the_counter() {
        let mut rtc = running_rtc();
        rtc.sync_at(100);
        rtc.select_reg(0x0c).unwrap();
        rtc.set_at(HALT, 100);
        // Halted: wall-clock time passes without effect.
        rtc.sync_at(5000);
        rtc.select_reg(0x08).unwrap();
        rtc.set_at(30, 5000);
        rtc.select_reg(0x0c).unwrap();
        rtc.set_at(0x00, 5000);
        // Restarted at t=5000 with seconds rewritten to 30.
        rtc.latch_at(0, 5010);
        rtc.latch_at(1, 5010);
        rtc.select_reg(0x08).unwrap();
        assert_eq!(rtc.get(), 40);
    }

    #[test]
    fn writes_while_running_only_touch_day_ctrl_bits() {
        let mut rtc = running_rtc();
        rtc.sync_at(45);
        rtc.select_reg(0x08).unwrap();
        rtc.set_at(10, 45);
        rtc.latch_at(0, 45);
        rtc.latch_at(1, 45);
        assert_eq!(rtc.get(), 45);
    }
}
