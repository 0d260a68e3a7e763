//! The programmable timer: a free-running 16-bit system counter (`SYS`)
//! whose upper 8 bits are exposed as DIV, and a TIMA/TMA/TAC increment
//! protocol driven off a falling edge of a TAC-selected `SYS` bit.

use crate::cpu::InterruptSource;

#[derive(Clone, Copy, Default)]
pub struct Control(pub u8);

impl Control {
    fn enabled(self) -> bool {
        self.0 & 0b100 != 0
    }

    /// The `SYS` bit this TAC selects, per the documented 4096/262144/
    /// 65536/16384 Hz clock options.
    fn selected_bit(self) -> u16 {
        match self.0 & 0b11 {
            0b00 => 1 << 9,
            0b01 => 1 << 3,
            0b10 => 1 << 5,
            _ => 1 << 7,
        }
    }
}

pub struct Timer {
    sys: u16,
    tima: u8,
    tma: u8,
    tac: Control,
    /// Ticks remaining in the 3-dot TIMA-zero window before reload, or
    /// `None` outside that window.
    overflow: Option<u8>,
    /// Set for the one machine cycle after a reload; CPU writes to TIMA
    /// are ignored during it, and writes to TMA also land in TIMA.
    tima_writes_ignored: bool,
}

impl Default for Timer {
    fn default() -> Self {
        Self {
            sys: 0x1800,
            tima: 0,
            tma: 0,
            tac: Control(0xf8),
            overflow: None,
            tima_writes_ignored: false,
        }
    }
}

impl Timer {
    fn selected_bit_set(&self) -> bool {
        self.tac.enabled() && self.sys & self.tac.selected_bit() != 0
    }

    fn increment_tima(&mut self) {
        let (result, overflowed) = self.tima.overflowing_add(1);
        self.tima = result;
        if overflowed {
            // TIMA already reads 0 on this dot; two more dots of that
            // before the third reloads from TMA, matching the spec's
            // "stays at 0 for exactly 3 dot ticks" window.
            self.overflow = Some(2);
        }
    }

    /// Advance by one dot. Call four times per machine cycle.
    pub fn dot(&mut self) -> Option<InterruptSource> {
        let mut interrupt = None;

        self.tima_writes_ignored = false;
        if let Some(remaining) = self.overflow {
            if remaining == 0 {
                self.tima = self.tma;
                self.tima_writes_ignored = true;
                self.overflow = None;
                interrupt = Some(InterruptSource::Timer);
            } else {
                self.overflow = Some(remaining - 1);
            }
        }

        let was_set = self.selected_bit_set();
        self.sys = self.sys.wrapping_add(1);
        let is_set = self.selected_bit_set();
        if was_set && !is_set {
            self.increment_tima();
        }

        interrupt
    }

    pub fn read_div(&self) -> u8 {
        (self.sys >> 8) as u8
    }

    pub fn write_div(&mut self, _value: u8) {
        let was_set = self.selected_bit_set();
        self.sys = 0;
        if was_set {
            self.increment_tima();
        }
    }

    pub fn read_tima(&self) -> u8 {
        self.tima
    }

    pub fn write_tima(&mut self, value: u8) {
        if self.tima_writes_ignored {
            return;
        }
        // A write during the overflow window cancels the pending reload
        // and interrupt outright.
        self.overflow = None;
        self.tima = value;
    }

    pub fn read_tma(&self) -> u8 {
        self.tma
    }

    pub fn write_tma(&mut self, value: u8) {
        self.tma = value;
        if self.tima_writes_ignored {
            self.tima = value;
        }
    }

    pub fn read_tac(&self) -> u8 {
        self.tac.0 | 0xf8
    }

    pub fn write_tac(&mut self, value: u8) {
        let was_set = self.selected_bit_set();
        self.tac = Control(value);
        let is_set = self.selected_bit_set();
        if was_set && !is_set {
            self.increment_tima();
        }
    }
}
