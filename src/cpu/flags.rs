use bitflags::bitflags;

bitflags! {
    /// The F register. The low nibble is always read back as zero.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u8 {
        const ZERO = 0b1000_0000;
        const NEGATIVE = 0b0100_0000;
        const HALF_CARRY = 0b0010_0000;
        const CARRY = 0b0001_0000;
    }
}

impl Flags {
    pub fn from_byte(byte: u8) -> Self {
        Flags::from_bits_truncate(byte & 0xf0)
    }

    pub fn to_byte(self) -> u8 {
        self.bits()
    }
}
