//! The three arbitrated memory buses (external, video, OAM) and the
//! storage backing them: VRAM, OAM, work RAM, HRAM, and the cartridge.
//! I/O registers and HRAM live outside this contention model entirely —
//! the CPU always has exclusive access to them.

use crate::cartridge::Cartridge;
use crate::dma::{Dma, SourceBus};

/// Which of the three contended buses an address falls on, if any.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusId {
    External,
    Video,
    Oam,
}

impl BusId {
    pub fn of(address: u16) -> Option<BusId> {
        match address {
            0x0000..=0x7fff | 0xa000..=0xfdff => Some(BusId::External),
            0x8000..=0x9fff => Some(BusId::Video),
            0xfe00..=0xfe9f => Some(BusId::Oam),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    Cpu,
    Dma,
    Ppu,
}

/// The bus priority in effect for one machine cycle, recomputed at the
/// start of every cycle from the DMA and PPU's current state.
#[derive(Clone, Copy, Debug)]
pub struct Arbitration {
    external: Owner,
    video: Owner,
    oam: Owner,
}

impl Arbitration {
    pub fn compute(dma: &Dma, ppu_enabled: bool, ppu_mode_render: bool, ppu_mode_oamscan_or_render: bool) -> Self {
        let dma_source = dma.source_bus();

        let external = if dma_source == Some(SourceBus::External) { Owner::Dma } else { Owner::Cpu };

        let video = if dma_source == Some(SourceBus::Video) {
            Owner::Dma
        } else if ppu_enabled && ppu_mode_render {
            Owner::Ppu
        } else {
            Owner::Cpu
        };

        let oam = if dma.is_active() {
            Owner::Dma
        } else if ppu_enabled && ppu_mode_oamscan_or_render {
            Owner::Ppu
        } else {
            Owner::Cpu
        };

        Self { external, video, oam }
    }

    fn owner_of(&self, bus: BusId) -> Owner {
        match bus {
            BusId::External => self.external,
            BusId::Video => self.video,
            BusId::Oam => self.oam,
        }
    }

    fn cpu_owns(&self, bus: BusId) -> bool {
        self.owner_of(bus) == Owner::Cpu
    }
}

pub struct Bus {
    cartridge: Box<dyn Cartridge>,
    vram: [u8; 0x2000],
    oam: [u8; 0xa0],
    wram: [u8; 0x2000],
    hram: [u8; 0x7f],
}

impl Bus {
    pub fn new(cartridge: Box<dyn Cartridge>) -> Self {
        Self {
            cartridge,
            vram: [0; 0x2000],
            oam: [0; 0xa0],
            wram: [0; 0x2000],
            hram: [0; 0x7f],
        }
    }

    pub fn vram(&self) -> &[u8; 0x2000] {
        &self.vram
    }

    pub fn oam(&self) -> &[u8; 0xa0] {
        &self.oam
    }

    /// Work RAM is 8 KiB but addressable across 0xC000-0xFDFF; echo RAM
    /// (0xE000-0xFDFF) is a straight alias since both ranges share the
    /// same low 13 address bits.
    fn wram_index(address: u16) -> usize {
        (address & 0x1fff) as usize
    }

    fn raw_read(&self, address: u16) -> u8 {
        match address {
            0x0000..=0x7fff => self.cartridge.read_rom(address),
            0x8000..=0x9fff => self.vram[(address - 0x8000) as usize],
            0xa000..=0xbfff => self.cartridge.read_ram(address),
            0xc000..=0xfdff => self.wram[Self::wram_index(address)],
            0xfe00..=0xfe9f => self.oam[(address - 0xfe00) as usize],
            // Unusable region behind OAM; reads as 0xFF on DMG hardware.
            0xfea0..=0xfeff => 0xff,
            0xff80..=0xfffe => self.hram[(address - 0xff80) as usize],
            _ => 0xff,
        }
    }

    fn raw_write(&mut self, address: u16, value: u8) {
        match address {
            0x0000..=0x7fff => self.cartridge.write_rom(address, value),
            0x8000..=0x9fff => self.vram[(address - 0x8000) as usize] = value,
            0xa000..=0xbfff => self.cartridge.write_ram(address, value),
            0xc000..=0xfdff => self.wram[Self::wram_index(address)] = value,
            0xfe00..=0xfe9f => self.oam[(address - 0xfe00) as usize] = value,
            0xff80..=0xfffe => self.hram[(address - 0xff80) as usize] = value,
            _ => {}
        }
    }

    /// A CPU access to one of the three contended buses, denied (and
    /// logged) if the arbiter has granted this cycle to another owner.
    /// Addresses outside the three contended buses (I/O, HRAM, IE) are
    /// never denied.
    pub fn cpu_read(&self, address: u16, arbitration: &Arbitration) -> u8 {
        if let Some(bus) = BusId::of(address) {
            if !arbitration.cpu_owns(bus) {
                log::warn!("CPU read at {address:#06x} denied by bus arbitration");
                return 0xff;
            }
        }
        self.raw_read(address)
    }

    pub fn cpu_write(&mut self, address: u16, value: u8, arbitration: &Arbitration) {
        if let Some(bus) = BusId::of(address) {
            if !arbitration.cpu_owns(bus) {
                log::warn!("CPU write at {address:#06x} denied by bus arbitration");
                return;
            }
        }
        self.raw_write(address, value);
    }

    /// The DMA engine owns whichever bus its source lives on for the
    /// whole transfer, so its reads/writes never need to check priority.
    pub fn dma_read(&self, address: u16) -> u8 {
        self.raw_read(address)
    }

    pub fn dma_write_oam(&mut self, offset: u8, value: u8) {
        self.oam[offset as usize] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::NoMbc;

    fn bus() -> Bus {
        Bus::new(Box::new(NoMbc::new(vec![0; 0x8000], 0)))
    }

    #[test]
    fn echo_ram_mirrors_work_ram() {
        let mut bus = bus();
        let arb = Arbitration { external: Owner::Cpu, video: Owner::Cpu, oam: Owner::Cpu };
        bus.cpu_write(0xc012, 0x42, &arb);
        assert_eq!(bus.cpu_read(0xe012, &arb), 0x42);
    }

    #[test]
    fn contended_bus_reads_as_0xff() {
        let bus = bus();
        let arb = Arbitration { external: Owner::Cpu, video: Owner::Dma, oam: Owner::Cpu };
        assert_eq!(bus.cpu_read(0x8000, &arb), 0xff);
    }

    #[test]
    fn contended_bus_write_is_ignored() {
        let mut bus = bus();
        let cpu_arb = Arbitration { external: Owner::Cpu, video: Owner::Cpu, oam: Owner::Cpu };
        let dma_arb = Arbitration { external: Owner::Cpu, video: Owner::Dma, oam: Owner::Cpu };
        bus.cpu_write(0x8000, 0x11, &dma_arb);
        assert_eq!(bus.cpu_read(0x8000, &cpu_arb), 0x00);
    }

    #[test]
    fn unarbitrated_addresses_always_reach_the_cpu() {
        let mut bus = bus();
        let arb = Arbitration { external: Owner::Dma, video: Owner::Dma, oam: Owner::Dma };
        bus.cpu_write(0xff80, 0x7, &arb);
        assert_eq!(bus.cpu_read(0xff80, &arb), 0x7);
    }
}
