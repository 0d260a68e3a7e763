//! Crate-level sanity checks driven purely through the public [`Soc`] API
//! with synthetic ROM bytes, no external test-ROM fixtures required.

use pocketsoc_core::{Button, Soc, from_rom_bytes};

fn soc_with_program(bytes: &[(u16, u8)]) -> Soc {
    let mut rom = vec![0u8; 0x8000];
    rom[0x147] = 0x00; // ROM only
    rom[0x148] = 0x00; // 32 KiB
    rom[0x149] = 0x00; // no RAM
    for &(address, value) in bytes {
        rom[address as usize] = value;
    }
    Soc::new(from_rom_bytes(&rom).expect("well-formed synthetic ROM"))
}

#[test]
fn boots_at_the_cartridge_entry_point_with_no_fault_or_halt() {
    let soc = soc_with_program(&[]);
    assert_eq!(soc.cpu().program_counter, 0x0100);
    assert!(!soc.cpu().halted);
    assert!(soc.cpu().halted_on_fault.is_none());
}

#[test]
fn a_frame_advances_ly_through_the_full_scanline_count() {
    let mut soc = soc_with_program(&[]);
    let cycles = soc.step_frame();
    assert_eq!(cycles, 70224 / 4);
}

#[test]
fn framebuffer_is_the_expected_pixel_count() {
    let soc = soc_with_program(&[]);
    assert_eq!(soc.framebuffer().len(), 160 * 144);
}

#[test]
fn button_press_is_observable_on_the_joypad_register() {
    let mut soc = soc_with_program(&[]);
    soc.set_button(Button::A, true);
    // No assertion on the register bit pattern here: that polarity and
    // nibble-select protocol is covered directly in `joypad.rs`. This is
    // just confirming the host-facing entry point doesn't panic and the
    // button state is retained across ticks.
    for _ in 0..4 {
        soc.tick();
    }
    soc.set_button(Button::A, false);
}

#[test]
fn serial_output_drains_once_and_then_is_empty() {
    // LD A, 'H' ; LDH (0x01), A ; LD A, 0x81 ; LDH (0x02), A ; JR -2 (spin)
    let mut soc = soc_with_program(&[
        (0x0100, 0x3E),
        (0x0101, b'H'),
        (0x0102, 0xE0),
        (0x0103, 0x01),
        (0x0104, 0x3E),
        (0x0105, 0x81),
        (0x0106, 0xE0),
        (0x0107, 0x02),
        (0x0108, 0x18),
        (0x0109, 0xFE),
    ]);
    for _ in 0..4096 {
        soc.tick();
    }
    let drained = soc.drain_serial_output();
    assert_eq!(drained, vec![b'H']);
    assert!(soc.drain_serial_output().is_empty());
}

#[test]
fn unknown_opcode_halts_the_cpu_permanently_without_panicking() {
    let _ = env_logger::try_init();
    // 0xFD, 0xFC, 0xEC, 0xED, 0xDD, 0xD3, 0xDB, 0xE3, 0xE4, 0xF4 are all
    // unassigned on the SM83; 0xFD is conventionally used as a trap byte.
    let mut soc = soc_with_program(&[(0x0100, 0xFD)]);
    for _ in 0..16 {
        soc.step();
    }
    assert_eq!(soc.cpu().program_counter, 0x0101);
    assert_eq!(soc.cpu().halted_on_fault, Some(0xFD));
}
