//! IE (enable) and IF (request/flag) registers, and the priority logic
//! that picks which pending source services next.

use bitflags::bitflags;

use crate::cpu::InterruptSource;

bitflags! {
    /// Shared bit layout for both IE (0xFFFF) and IF (0xFF0F); the top
    /// three bits of IF always read back as 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct Mask: u8 {
        const V_BLANK = 1 << 0;
        const STAT    = 1 << 1;
        const TIMER   = 1 << 2;
        const SERIAL  = 1 << 3;
        const JOYPAD  = 1 << 4;
    }
}

impl Mask {
    fn of(source: InterruptSource) -> Self {
        Mask::from_bits_truncate(source.mask())
    }
}

/// The interrupt enable (IE) and flag (IF) register pair, plus the
/// priority-ordered dispatch they feed.
#[derive(Debug, Clone, Copy)]
pub struct Interrupts {
    enabled: Mask,
    requested: Mask,
}

impl Default for Interrupts {
    /// IF boots with VBlank already latched: the boot ROM's last frame
    /// ends mid-VBlank, and that request survives the handoff to the
    /// cartridge.
    fn default() -> Self {
        Self { enabled: Mask::empty(), requested: Mask::V_BLANK }
    }
}

impl Interrupts {
    pub fn read_ie(&self) -> u8 {
        self.enabled.bits()
    }

    pub fn write_ie(&mut self, value: u8) {
        self.enabled = Mask::from_bits_truncate(value);
    }

    /// IF reads back with the unused top three bits pinned high.
    pub fn read_if(&self) -> u8 {
        self.requested.bits() | 0xE0
    }

    pub fn write_if(&mut self, value: u8) {
        self.requested = Mask::from_bits_truncate(value);
    }

    pub fn request(&mut self, source: InterruptSource) {
        self.requested.insert(Mask::of(source));
    }

    pub fn clear(&mut self, source: InterruptSource) {
        self.requested.remove(Mask::of(source));
    }

    /// Enabled and requested sources, as a raw bitmask — nonzero means
    /// a wake from HALT is due, and (with IME set) a dispatch is due.
    pub fn pending(&self) -> u8 {
        (self.enabled & self.requested).bits()
    }

    pub fn pending_contains(&self, source: InterruptSource) -> bool {
        self.pending() & source.mask() != 0
    }

    /// The source that would be serviced next, in VBlank < STAT < Timer
    /// < Serial < Joypad priority order.
    pub fn highest_priority(&self) -> Option<InterruptSource> {
        InterruptSource::ALL_IN_PRIORITY_ORDER
            .into_iter()
            .find(|source| self.pending_contains(*source))
    }
}
