//! Serial transfer stub. Models the two link-cable registers (SB, SC)
//! closely enough that software polling for a "transfer complete"
//! interrupt is satisfied, without modeling the 8-cycle-per-bit shift
//! timing of an actual link partner — there is never one attached.

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, Default)]
    pub struct Control: u8 {
        const TRANSFER_START = 0b1000_0000;
        const INTERNAL_CLOCK = 0b0000_0001;
    }
}

pub struct Serial {
    data: u8,
    control: Control,
    output: Vec<u8>,
    /// Set for the one cycle after a transfer completes, so the driver
    /// can request the interrupt on the next cycle boundary.
    interrupt_pending: bool,
}

impl Default for Serial {
    fn default() -> Self {
        Self {
            data: 0xff,
            control: Control::empty(),
            output: Vec::new(),
            interrupt_pending: false,
        }
    }
}

impl Serial {
    pub fn read_sb(&self) -> u8 {
        self.data
    }

    pub fn write_sb(&mut self, value: u8) {
        self.data = value;
    }

    pub fn read_sc(&self) -> u8 {
        self.control.bits() | 0x7e
    }

    /// Writing SC with both the start bit and the internal-clock bit set
    /// completes the transfer instantly: the current SB byte is appended
    /// to the output buffer, SB goes idle, and the interrupt is armed for
    /// the next cycle.
    pub fn write_sc(&mut self, value: u8) {
        self.control = Control::from_bits_retain(value);
        if self.control.contains(Control::TRANSFER_START | Control::INTERNAL_CLOCK) {
            self.output.push(self.data);
            self.data = 0xff;
            self.control.remove(Control::TRANSFER_START);
            self.interrupt_pending = true;
        }
    }

    /// Advance by one machine cycle. Returns true exactly once per
    /// completed transfer, the cycle after `write_sc` triggered it.
    pub fn tick(&mut self) -> bool {
        std::mem::take(&mut self.interrupt_pending)
    }

    pub fn drain_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }
}
