//! OAM DMA: copies 160 bytes from a configured source page into OAM,
//! one byte per machine cycle, after an 8-dot (two machine cycle)
//! request delay. A new request aborts any transfer in flight.

/// Which bus the DMA engine is reading from this cycle, for the
/// arbiter to route priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceBus {
    External,
    Video,
}

impl SourceBus {
    pub fn of(address: u16) -> SourceBus {
        match address & 0xff {
            0x80..=0x9f => SourceBus::Video,
            _ => SourceBus::External,
        }
    }
}

#[derive(Default)]
pub struct Dma {
    high_addr: u8,
    /// Machine cycles remaining before the transfer engages.
    requested: Option<u8>,
    /// Bytes remaining to copy, counting down from 160.
    pending: u16,
}

impl Dma {
    /// Writing the DMA register latches the source page and (re)starts
    /// the request delay, aborting anything already in flight.
    pub fn request(&mut self, high_addr: u8) {
        self.high_addr = high_addr;
        self.requested = Some(2);
        self.pending = 0;
    }

    pub fn high_addr(&self) -> u8 {
        self.high_addr
    }

    pub fn is_active(&self) -> bool {
        self.pending > 0
    }

    pub fn source_bus(&self) -> Option<SourceBus> {
        self.is_active().then(|| SourceBus::of((self.high_addr as u16) << 8))
    }

    /// Current source address, valid only while `is_active()`.
    fn source_address(&self) -> u16 {
        let index = 160 - self.pending;
        ((self.high_addr as u16) << 8).wrapping_add(index)
    }

    /// Advance one machine cycle. Returns `Some((source, dest_offset))`
    /// when a byte should be copied this cycle; the caller performs the
    /// actual bus read/write since only it can arbitrate them.
    pub fn tick(&mut self) -> Option<(u16, u8)> {
        if let Some(remaining) = self.requested {
            if remaining == 0 {
                self.requested = None;
                self.pending = 160;
            } else {
                self.requested = Some(remaining - 1);
                return None;
            }
        }

        if self.pending == 0 {
            return None;
        }

        let source = self.source_address();
        let dest_offset = (160 - self.pending) as u8;
        self.pending -= 1;
        Some((source, dest_offset))
    }
}
