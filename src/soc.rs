//! The driver that ties every component to one shared machine-cycle
//! clock: computes bus arbitration, steps the CPU, then DMA, PPU, timer,
//! joypad and serial in that order, and settles any I/O-register read
//! the CPU issued against the state those steps just produced.

use rgb::RGBA8;

use crate::bus::{Arbitration, Bus};
use crate::cartridge::Cartridge;
use crate::cpu::microcode::BusAction;
use crate::cpu::{Cpu, CpuProcessor, InterruptSource};
use crate::dma::Dma;
use crate::interrupts::Interrupts;
use crate::joypad::{Button, Joypad};
use crate::ppu::Ppu;
use crate::serial::Serial;
use crate::timer::Timer;

fn is_io_register(address: u16) -> bool {
    (0xff00..=0xff7f).contains(&address)
}

/// Owns every component and the single in-flight [`CpuProcessor`], and
/// advances them all by one machine cycle at a time.
pub struct Soc {
    cpu: Cpu,
    processor: CpuProcessor,
    /// The byte the CPU's most recent `Read` resolved to, fed into the
    /// next call to `processor.step`. Reads from I/O-register addresses
    /// are deferred: the address is parked here mid-cycle and resolved
    /// only after DMA/PPU/timer/joypad have all run, so the CPU observes
    /// this cycle's end-of-cycle state rather than its start-of-cycle one.
    last_cpu_read: u8,
    bus: Bus,
    interrupts: Interrupts,
    timer: Timer,
    dma: Dma,
    ppu: Ppu,
    joypad: Joypad,
    joypad_nibble: u8,
    serial: Serial,
}

impl Soc {
    pub fn new(cartridge: Box<dyn Cartridge>) -> Self {
        let mut cpu = Cpu::default();
        let interrupts = Interrupts::default();
        let processor = CpuProcessor::begin(&mut cpu, &interrupts);
        let joypad = Joypad::default();
        let joypad_nibble = joypad.read_register() & 0x0f;
        Self {
            cpu,
            processor,
            last_cpu_read: 0,
            bus: Bus::new(cartridge),
            interrupts,
            timer: Timer::default(),
            dma: Dma::default(),
            ppu: Ppu::new(),
            joypad,
            joypad_nibble,
            serial: Serial::default(),
        }
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn ppu(&self) -> &Ppu {
        &self.ppu
    }

    pub fn framebuffer(&self) -> &[RGBA8] {
        self.ppu.framebuffer()
    }

    pub fn set_button(&mut self, button: Button, pressed: bool) {
        self.joypad.set_pressed(button, pressed);
    }

    pub fn drain_serial_output(&mut self) -> Vec<u8> {
        self.serial.drain_output()
    }

    /// Advances cycles until the CPU finishes one full instruction (or
    /// one full interrupt dispatch). Returns the number of machine
    /// cycles that took. Intended for single-stepping, not the main loop.
    pub fn step(&mut self) -> u32 {
        let mut cycles = 0;
        loop {
            let retired = self.tick();
            cycles += 1;
            if retired {
                return cycles;
            }
        }
    }

    /// Advances cycles until LY transitions to 144 (the start of
    /// VBlank). Returns the number of machine cycles that took.
    pub fn run_until_vblank(&mut self) -> u32 {
        let mut cycles = 0;
        loop {
            let was_vblank_start = self.ppu.read_ly() == 144;
            self.tick();
            cycles += 1;
            if !was_vblank_start && self.ppu.read_ly() == 144 {
                return cycles;
            }
        }
    }

    /// Advances exactly one frame's worth of dots (70224, i.e. 17556
    /// machine cycles), the host's per-frame entry point.
    pub fn step_frame(&mut self) -> u32 {
        const MACHINE_CYCLES_PER_FRAME: u32 = 70224 / 4;
        for _ in 0..MACHINE_CYCLES_PER_FRAME {
            self.tick();
        }
        MACHINE_CYCLES_PER_FRAME
    }

    /// Advances every component by exactly one machine cycle. Returns
    /// `true` if the CPU's in-flight instruction (or interrupt dispatch)
    /// fully retired during this cycle.
    fn tick(&mut self) -> bool {
        let arbitration = Arbitration::compute(
            &self.dma,
            self.ppu.enabled(),
            self.ppu.mode_is_render(),
            self.ppu.mode_is_oamscan_or_render(),
        );

        let (action, retired) = self.step_cpu();
        let mut deferred_read: Option<u16> = None;

        if let Some(action) = action {
            match action {
                BusAction::Read { address } => {
                    if address == 0xffff {
                        self.last_cpu_read = self.interrupts.read_ie();
                    } else if is_io_register(address) {
                        deferred_read = Some(address);
                    } else {
                        self.last_cpu_read = self.bus.cpu_read(address, &arbitration);
                    }
                }
                BusAction::Write { address, value } => {
                    if address == 0xffff {
                        self.interrupts.write_ie(value);
                    } else if is_io_register(address) {
                        self.io_write(address, value);
                    } else {
                        self.bus.cpu_write(address, value, &arbitration);
                    }
                }
                BusAction::Internal => {}
            }
        }

        if let Some((source, dest_offset)) = self.dma.tick() {
            let value = self.bus.dma_read(source);
            self.bus.dma_write_oam(dest_offset, value);
        }

        for _ in 0..4 {
            let out = self.ppu.dot(self.bus.vram(), self.bus.oam());
            if out.request_vblank {
                self.interrupts.request(InterruptSource::VBlank);
            }
            if out.request_stat {
                self.interrupts.request(InterruptSource::Stat);
            }
        }

        for _ in 0..4 {
            if let Some(interrupt) = self.timer.dot() {
                self.interrupts.request(interrupt);
            }
        }

        let (nibble, joypad_interrupt) = self.joypad.tick(self.joypad_nibble);
        self.joypad_nibble = nibble;
        if let Some(interrupt) = joypad_interrupt {
            self.interrupts.request(interrupt);
        }

        if self.serial.tick() {
            self.interrupts.request(InterruptSource::Serial);
        }

        if let Some(address) = deferred_read {
            self.last_cpu_read = self.io_read(address);
        }

        retired
    }

    /// Drives the CPU by one machine cycle. A CPU that is halted (or
    /// stuck on an unknown-opcode fault) emits no bus action at all;
    /// otherwise walks `processor` until it yields the cycle's action,
    /// beginning a fresh instruction whenever the previous one retires
    /// without costing an extra cycle.
    fn step_cpu(&mut self) -> (Option<BusAction>, bool) {
        // A fault is permanent: no interrupt will ever clear it, so unlike
        // a genuine HALT (which legitimately blocks `step`/`run_until_vblank`
        // until one arrives) every cycle reports retired rather than
        // stalling a caller that isn't polling `cpu().halted_on_fault`.
        if self.cpu.halted_on_fault.is_some() {
            return (None, true);
        }

        if self.cpu.halted {
            if self.interrupts.pending() == 0 {
                return (None, false);
            }
            self.cpu.halted = false;
            self.processor = CpuProcessor::begin(&mut self.cpu, &self.interrupts);
        }

        let mut retired = false;
        loop {
            match self.processor.step(&mut self.cpu, &mut self.interrupts, self.last_cpu_read) {
                Some(action) => return (Some(action), retired),
                None => {
                    retired = true;
                    if self.cpu.halted || self.cpu.halted_on_fault.is_some() {
                        if let Some(op) = self.cpu.halted_on_fault {
                            log::error!("CPU trapped on unassigned opcode {op:#04x}; halted");
                        }
                        return (None, retired);
                    }
                    self.processor = CpuProcessor::begin(&mut self.cpu, &self.interrupts);
                }
            }
        }
    }

    fn io_read(&self, address: u16) -> u8 {
        match address {
            0xff00 => self.joypad.read_register(),
            0xff01 => self.serial.read_sb(),
            0xff02 => self.serial.read_sc(),
            0xff04 => self.timer.read_div(),
            0xff05 => self.timer.read_tima(),
            0xff06 => self.timer.read_tma(),
            0xff07 => self.timer.read_tac(),
            0xff0f => self.interrupts.read_if(),
            0xff40 => self.ppu.read_lcdc(),
            0xff41 => self.ppu.read_stat(),
            0xff42 => self.ppu.read_scy(),
            0xff43 => self.ppu.read_scx(),
            0xff44 => self.ppu.read_ly(),
            0xff45 => self.ppu.read_lyc(),
            0xff46 => self.dma.high_addr(),
            0xff47 => self.ppu.read_bgp(),
            0xff48 => self.ppu.read_obp0(),
            0xff49 => self.ppu.read_obp1(),
            0xff4a => self.ppu.read_wy(),
            0xff4b => self.ppu.read_wx(),
            // Unimplemented I/O (APU, CGB-only registers) reads high.
            _ => 0xff,
        }
    }

    fn io_write(&mut self, address: u16, value: u8) {
        match address {
            0xff00 => self.joypad.write_register(value),
            0xff01 => self.serial.write_sb(value),
            0xff02 => self.serial.write_sc(value),
            0xff04 => self.timer.write_div(value),
            0xff05 => self.timer.write_tima(value),
            0xff06 => self.timer.write_tma(value),
            0xff07 => self.timer.write_tac(value),
            0xff0f => self.interrupts.write_if(value),
            0xff40 => self.ppu.write_lcdc(value),
            0xff41 => self.ppu.write_stat(value),
            0xff42 => self.ppu.write_scy(value),
            0xff43 => self.ppu.write_scx(value),
            0xff44 => {} // LY is read-only
            0xff45 => self.ppu.write_lyc(value),
            0xff46 => self.dma.request(value),
            0xff47 => self.ppu.write_bgp(value),
            0xff48 => self.ppu.write_obp0(value),
            0xff49 => self.ppu.write_obp1(value),
            0xff4a => self.ppu.write_wy(value),
            0xff4b => self.ppu.write_wx(value),
            // Unimplemented I/O (APU, CGB-only registers) is a no-op.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::NoMbc;

    fn soc_with_program(bytes: &[(u16, u8)]) -> Soc {
        let mut rom = vec![0u8; 0x8000];
        for &(address, value) in bytes {
            rom[address as usize] = value;
        }
        Soc::new(Box::new(NoMbc::new(rom, 0)))
    }

    #[test]
    fn nop_program_counter_advances_one_cycle_at_a_time() {
        let mut soc = soc_with_program(&[(0x0100, 0x00), (0x0101, 0x00)]);
        let cycles = soc.step();
        assert_eq!(cycles, 1);
        assert_eq!(soc.cpu().program_counter, 0x0101);
    }

    #[test]
    fn ei_delay_holds_off_a_pending_interrupt_for_one_instruction() {
        // EI; NOP; NOP, with timer IE set and an interrupt already pending.
        let mut soc = soc_with_program(&[
            (0x0100, 0xFB), // EI
            (0x0101, 0x00), // NOP
            (0x0102, 0x00), // NOP
        ]);
        soc.io_write(0xff0f, InterruptSource::Timer.mask());
        soc.io_write(0xffff, InterruptSource::Timer.mask());

        soc.step(); // EI retires; IME still disabled until the next instruction retires
        assert!(!soc.cpu().interrupts_enabled());
        assert_eq!(soc.cpu().program_counter, 0x0101);

        // The NOP at 0x0101 is the instruction EI is delayed behind. Once
        // it retires IME goes live, and since Timer is already pending,
        // dispatch begins immediately instead of fetching the next NOP.
        soc.step();
        soc.step();
        assert_eq!(soc.cpu().program_counter, InterruptSource::Timer.vector());
        assert!(!soc.cpu().interrupts_enabled(), "IME is cleared again as soon as the ISR is entered");
    }

    #[test]
    fn halt_bug_replays_the_following_opcode_byte() {
        // HALT with IME=0 and an interrupt already pending must not halt;
        // instead the CPU re-reads the HALT successor's first byte, which
        // here is 0x3C (INC A) read twice, so A ends up incremented twice
        // from one instruction fetch's worth of program bytes.
        let mut soc = soc_with_program(&[(0x0100, 0x76), (0x0101, 0x3C)]);
        soc.io_write(0xff0f, InterruptSource::Timer.mask());
        soc.io_write(0xffff, InterruptSource::Timer.mask());

        soc.step(); // HALT: arms the bug, does not halt
        assert!(!soc.cpu().halted);
        let a_before = soc.cpu().a;
        soc.step(); // first read of 0x3C, PC does not advance past it
        assert_eq!(soc.cpu().a, a_before.wrapping_add(1));
        assert_eq!(soc.cpu().program_counter, 0x0101);
        soc.step(); // second read of the same byte, PC now moves on normally
        assert_eq!(soc.cpu().a, a_before.wrapping_add(2));
        assert_eq!(soc.cpu().program_counter, 0x0102);
    }

    #[test]
    fn halt_with_ime_set_wakes_on_the_enabled_interrupt() {
        let mut soc = soc_with_program(&[(0x0100, 0xFB), (0x0101, 0x76), (0x0102, 0x00)]);
        // Clear the boot-time pending VBlank request so it doesn't preempt
        // the HALT opcode itself the instant IME goes live.
        soc.io_write(0xff0f, 0x00);
        soc.io_write(0xffff, InterruptSource::VBlank.mask());
        soc.step(); // EI
        soc.step(); // NOP (EI's delayed instruction); IME now live
        soc.step(); // HALT: genuinely halts, no interrupt pending yet

        assert!(soc.cpu().halted);

        // Tick until the PPU's next VBlank requests the interrupt; the CPU
        // should wake and service it rather than staying halted.
        for _ in 0..70224 {
            if !soc.cpu().halted {
                break;
            }
            soc.tick();
        }
        assert!(!soc.cpu().halted);
    }

    #[test]
    fn cpu_cannot_read_oam_while_dma_is_active() {
        let mut soc = soc_with_program(&[(0x0100, 0x00)]);
        soc.io_write(0xff46, 0xc0);
        // Two machine cycles of request delay; the third tick is the one
        // that actually engages the transfer.
        soc.tick();
        soc.tick();
        soc.tick();
        assert!(soc.dma.is_active());
        let arbitration = Arbitration::compute(&soc.dma, soc.ppu.enabled(), soc.ppu.mode_is_render(), soc.ppu.mode_is_oamscan_or_render());
        assert_eq!(soc.bus.cpu_read(0xfe00, &arbitration), 0xff);
    }

    #[test]
    fn dma_copies_160_bytes_from_source_to_oam() {
        let mut soc = soc_with_program(&[(0x0100, 0x00)]);
        // Park a known pattern in work RAM at 0xC000.
        let arbitration = Arbitration::compute(&soc.dma, false, false, false);
        for i in 0..160u16 {
            soc.bus.cpu_write(0xc000 + i, (i % 256) as u8, &arbitration);
        }
        soc.io_write(0xff46, 0xc0);
        // The CPU's own fetches from ROM are denied for most of this
        // window (DMA owns the external bus), so it churns through
        // whatever garbage opcode 0xFF decodes to; harmless here since
        // nothing it does can reach the OAM range before the transfer ends.
        for _ in 0..2 + 160 {
            soc.tick();
        }
        assert!(!soc.dma.is_active());
        assert_eq!(soc.bus.oam()[0], 0);
        assert_eq!(soc.bus.oam()[159], 159);
    }

    #[test]
    fn timer_overflow_requests_an_interrupt_that_the_cpu_observes_in_if() {
        let mut soc = soc_with_program(&[(0x0100, 0x00)]);
        soc.io_write(0xff06, 0x00); // TMA
        soc.io_write(0xff05, 0xff); // TIMA about to overflow
        soc.io_write(0xff07, 0x05); // TAC: enabled, bit 3 selected

        // Drive enough dots for a falling edge plus the 3-dot reload window.
        for _ in 0..64 {
            soc.tick();
        }
        assert_eq!(soc.io_read(0xff0f) & InterruptSource::Timer.mask(), InterruptSource::Timer.mask());
    }
}
