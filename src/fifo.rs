// The pixel FIFO. A five-state producer keeps the 16-slot queue topped up
// with background/window pixels (sprites are mixed in at push time, which
// avoids a second queue), while the consumer side shifts one pixel per dot
// out to the screen as long as more than 8 items are buffered. The first
// SCX mod 8 shifted pixels of a line are discarded unless the window has
// taken over.
use super::fetcher::{self, Fetcher};
use super::lcd::{Lcd, Palette};
use super::oam::{ATTR_BG_PRIORITY, ATTR_PALETTE};
use super::ring::RingBuffer;
use super::snapshot;
use super::status::Result;

const FIFO_CAPACITY: usize = 16;
const PIXELS_PER_TILE: u8 = 8;

#[derive(Clone, Copy, Eq, PartialEq)]
pub enum FifoState {
    GetTileNum,
    GetDataLow,
    GetDataHigh,
    Sleep,
    Push,
}

#[derive(Clone, Copy, Default)]
pub struct FifoItem {
    // 2-bit color index, already sprite-mixed.
    pub color: u8,
    pub palette: Palette,
}

// One screen pixel leaving the pipeline.
pub struct PixelOut {
    pub x: u8,
    pub y: u8,
    pub color: u32,
}

pub struct Pxfifo {
    pub state: FifoState,
    pub fetcher: Fetcher,
    fifo: RingBuffer<FifoItem>,
    ticks: u32,
    // Pixels pushed into the queue this line; anchors sprite mixing.
    pushed_px: i32,
    // Pixels popped (including discarded) and rendered this line.
    popped_px: u8,
    render_px: u8,
}

impl Pxfifo {
    pub fn power_up() -> Self {
        Self {
            state: FifoState::GetTileNum,
            fetcher: Fetcher::power_up(),
            fifo: RingBuffer::power_up(FIFO_CAPACITY),
            ticks: 0,
            pushed_px: 0,
            popped_px: 0,
            render_px: 0,
        }
    }

    // Start-of-transfer reset; the window line counter survives.
    pub fn reset(&mut self) {
        self.fetcher.reset();
        self.fifo.clear();
        self.state = FifoState::GetTileNum;
        self.ticks = 0;
        self.pushed_px = 0;
        self.popped_px = 0;
        self.render_px = 0;
    }

    // One dot: advance the producer, then try to shift a pixel out.
    pub fn shift_pixel(&mut self, vram: &[u8], lcd: &Lcd) -> Option<PixelOut> {
        self.shift_in(vram, lcd);
        self.shift_out(lcd)
    }

    // Every fetch state consumes the dots up to the next odd tick; Push
    // retries every dot until the queue has room for a full tile.
    fn shift_in(&mut self, vram: &[u8], lcd: &Lcd) {
        match self.state {
            FifoState::GetTileNum => {
                if self.ticks & 1 == 1 {
                    self.fetcher.fetch_tile_number(vram, lcd);
                    self.state = FifoState::GetDataLow;
                }
            }
            FifoState::GetDataLow => {
                if self.ticks & 1 == 1 {
                    self.fetcher.fetch_tile_data(vram, lcd, 0);
                    self.state = FifoState::GetDataHigh;
                }
            }
            FifoState::GetDataHigh => {
                if self.ticks & 1 == 1 {
                    self.fetcher.fetch_tile_data(vram, lcd, 1);
                    self.state = FifoState::Sleep;
                }
            }
            FifoState::Sleep => {
                if self.ticks & 1 == 1 {
                    self.state = FifoState::Push;
                }
            }
            FifoState::Push => {
                self.push_data(lcd);
                return;
            }
        }
        self.ticks += 1;
    }

    fn push_data(&mut self, lcd: &Lcd) {
        if self.fifo.len() > 8 {
            // No room for a full tile yet; retry next dot.
            self.ticks += 1;
            return;
        }
        let x = i32::from(self.fetcher.x_index) * 8 - i32::from(8 - lcd.scx() % 8);
        for i in 0..PIXELS_PER_TILE {
            let mut item = FifoItem {
                color: if lcd.bgw_enabled() { self.fetcher.bgw_pixel_color_index(i) } else { 0 },
                palette: Palette::Bgw,
            };
            if lcd.obj_enabled() {
                mix_sprite_pixel(&self.fetcher, lcd, self.pushed_px, &mut item);
            }
            if x >= 0 {
                self.fifo.push(item);
                self.pushed_px += 1;
            }
        }
        self.ticks = 0;
        self.state = FifoState::GetTileNum;
    }

    fn shift_out(&mut self, lcd: &Lcd) -> Option<PixelOut> {
        // The pipeline keeps 8 pixels of lookahead; shifting below that would
        // let a sprite at the tile boundary miss its mix window.
        if self.fifo.len() <= 8 {
            return None;
        }
        let item = self.fifo.pop()?;
        let discard = self.popped_px < lcd.scx() % 8 && !on_a_window(lcd, self.popped_px);
        self.popped_px = self.popped_px.wrapping_add(1);
        if discard {
            return None;
        }
        let out = PixelOut {
            x: self.render_px,
            y: lcd.ly(),
            color: lcd.palette_color(item.palette, item.color),
        };
        self.render_px += 1;
        Some(out)
    }

    pub fn save_state(&self, w: &mut Vec<u8>) {
        w.push(self.state as u8);
        snapshot::put_u32(w, self.ticks);
        snapshot::put_u32(w, self.pushed_px as u32);
        w.push(self.popped_px);
        w.push(self.render_px);
        w.push(self.fifo.len() as u8);
        for item in self.fifo.iter() {
            w.push(item.color);
            w.push(match item.palette {
                Palette::Bgw => 0,
                Palette::Obp0 => 1,
                Palette::Obp1 => 2,
            });
        }
        let f = &self.fetcher;
        w.push(f.x_index);
        w.push(f.window_line);
        w.push(f.tile_num);
        w.push(f.data_low);
        w.push(f.data_high);
        w.push(f.scanned.len() as u8);
        for e in f.scanned.iter() {
            w.extend_from_slice(&[e.y, e.x, e.tile, e.attrs]);
        }
        w.push(f.sprites.len() as u8);
        for s in f.sprites.iter() {
            w.extend_from_slice(&[s.entry.y, s.entry.x, s.entry.tile, s.entry.attrs, s.data_low, s.data_high]);
        }
    }

    pub fn load_state(&mut self, r: &mut snapshot::Reader) -> Result<()> {
        self.state = match r.take_u8()? {
            0 => FifoState::GetTileNum,
            1 => FifoState::GetDataLow,
            2 => FifoState::GetDataHigh,
            3 => FifoState::Sleep,
            _ => FifoState::Push,
        };
        self.ticks = r.take_u32()?;
        self.pushed_px = r.take_u32()? as i32;
        self.popped_px = r.take_u8()?;
        self.render_px = r.take_u8()?;
        self.fifo.clear();
        let n = usize::from(r.take_u8()?).min(FIFO_CAPACITY);
        for _ in 0..n {
            let color = r.take_u8()?;
            let palette = match r.take_u8()? {
                1 => Palette::Obp0,
                2 => Palette::Obp1,
                _ => Palette::Bgw,
            };
            self.fifo.push(FifoItem { color, palette });
        }
        let f = &mut self.fetcher;
        f.x_index = r.take_u8()?;
        f.window_line = r.take_u8()?;
        f.tile_num = r.take_u8()?;
        f.data_low = r.take_u8()?;
        f.data_high = r.take_u8()?;
        f.scanned.clear();
        let n = usize::from(r.take_u8()?).min(10);
        for _ in 0..n {
            let b = r.take_bytes(4)?;
            f.scanned.push(super::oam::OamEntry { y: b[0], x: b[1], tile: b[2], attrs: b[3] });
        }
        f.sprites.clear();
        let n = usize::from(r.take_u8()?).min(10);
        for _ in 0..n {
            let b = r.take_bytes(6)?;
            f.sprites.push(fetcher::FetchedSprite {
                entry: super::oam::OamEntry { y: b[0], x: b[1], tile: b[2], attrs: b[3] },
                data_low: b[4],
                data_high: b[5],
            });
        }
        Ok(())
    }
}

// The first sprite (in X order) with a non-transparent pixel at this position
// wins; a sprite carrying BG priority only shows over background color 0.
fn mix_sprite_pixel(fetcher: &Fetcher, lcd: &Lcd, pushed_px: i32, bgw_pixel: &mut FifoItem) {
    for sprite in fetcher.sprites.iter() {
        let sprite_x = i32::from(sprite.entry.x) - 8 + i32::from(lcd.scx() % 8);
        if sprite_x + 8 < pushed_px {
            continue;
        }
        let offset = pushed_px - sprite_x;
        if !(0..=7).contains(&offset) {
            continue;
        }
        let sprite_color = fetcher::sprite_pixel_color_index(sprite, offset as u8);
        let bg_priority = sprite.entry.attrs & ATTR_BG_PRIORITY != 0x00;
        if sprite_color != 0 && (!bg_priority || bgw_pixel.color == 0) {
            bgw_pixel.palette =
                if sprite.entry.attrs & ATTR_PALETTE != 0x00 { Palette::Obp1 } else { Palette::Obp0 };
            bgw_pixel.color = sprite_color;
            break;
        }
    }
}

fn on_a_window(lcd: &Lcd, x: u8) -> bool {
    lcd.window_enabled() && lcd.ly() >= lcd.wy() && x >= lcd.wx().saturating_sub(7)
}
