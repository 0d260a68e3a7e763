//! Flag-affecting value transforms, factored out of the microcode step
//! machine so each one reads as a direct transcription of the SM83 flag
//! tables.

use super::Cpu;
use super::flags::Flags;
use super::instruction::{AluOp, Carry, Direction};
use super::microcode::{PopAction, ReadAction, RmwOp};
use super::registers::Register16;

pub(super) fn daa(cpu: &mut Cpu) {
    let value = if cpu.flags.contains(Flags::NEGATIVE) {
        let mut adj = 0u8;
        if cpu.flags.contains(Flags::HALF_CARRY) {
            adj += 0x6;
        }
        if cpu.flags.contains(Flags::CARRY) {
            adj += 0x60;
        }
        cpu.a.wrapping_sub(adj)
    } else {
        let mut adj = 0u8;
        if cpu.flags.contains(Flags::HALF_CARRY) || cpu.a & 0xf > 0x9 {
            adj += 0x6;
        }
        if cpu.flags.contains(Flags::CARRY) || cpu.a > 0x99 {
            adj += 0x60;
            cpu.flags.insert(Flags::CARRY);
        }
        cpu.a.wrapping_add(adj)
    };
    cpu.flags.set(Flags::ZERO, value == 0);
    cpu.flags.remove(Flags::HALF_CARRY);
    cpu.a = value;
}

pub(super) fn read_action(cpu: &mut Cpu, action: ReadAction, value: u8) {
    match action {
        ReadAction::LoadRegisterHlPost(reg, delta) => {
            cpu.set_register8(reg, value);
            let hl = cpu.get_register16(Register16::Hl);
            cpu.set_register16(Register16::Hl, hl.wrapping_add(delta as u16));
        }
        ReadAction::AluA(op) => alu(cpu, op, value),
        ReadAction::BitTest(bit) => {
            cpu.flags.set(Flags::ZERO, value & (1 << bit) == 0);
            cpu.flags.remove(Flags::NEGATIVE);
            cpu.flags.insert(Flags::HALF_CARRY);
        }
    }
}

pub(super) fn alu(cpu: &mut Cpu, op: AluOp, value: u8) {
    match op {
        AluOp::Add => {
            let result = cpu.a.wrapping_add(value);
            cpu.flags.set(Flags::ZERO, result == 0);
            cpu.flags.remove(Flags::NEGATIVE);
            cpu.flags.set(Flags::HALF_CARRY, (cpu.a & 0xf) + (value & 0xf) > 0xf);
            cpu.flags.set(Flags::CARRY, cpu.a as u16 + value as u16 > 0xff);
            cpu.a = result;
        }
        AluOp::Sub => {
            let result = cpu.a.wrapping_sub(value);
            cpu.flags.set(Flags::ZERO, result == 0);
            cpu.flags.insert(Flags::NEGATIVE);
            cpu.flags.set(Flags::HALF_CARRY, (value & 0xf) > (cpu.a & 0xf));
            cpu.flags.set(Flags::CARRY, cpu.a < value);
            cpu.a = result;
        }
        AluOp::Adc => {
            let c = cpu.flags.contains(Flags::CARRY) as u8;
            let result = cpu.a.wrapping_add(value).wrapping_add(c);
            cpu.flags.set(Flags::ZERO, result == 0);
            cpu.flags.remove(Flags::NEGATIVE);
            cpu.flags.set(Flags::HALF_CARRY, (cpu.a & 0xf) + (value & 0xf) + c > 0xf);
            cpu.flags.set(Flags::CARRY, cpu.a as u16 + value as u16 + c as u16 > 0xff);
            cpu.a = result;
        }
        AluOp::Sbc => {
            let c = cpu.flags.contains(Flags::CARRY) as u8;
            let result = cpu.a.wrapping_sub(value).wrapping_sub(c);
            cpu.flags.set(Flags::ZERO, result == 0);
            cpu.flags.insert(Flags::NEGATIVE);
            cpu.flags.set(Flags::HALF_CARRY, (value & 0xf) + c > (cpu.a & 0xf));
            cpu.flags.set(Flags::CARRY, value as u16 + c as u16 > cpu.a as u16);
            cpu.a = result;
        }
        AluOp::Cp => {
            let result = cpu.a.wrapping_sub(value);
            cpu.flags.set(Flags::ZERO, result == 0);
            cpu.flags.insert(Flags::NEGATIVE);
            cpu.flags.set(Flags::HALF_CARRY, value & 0xf > cpu.a & 0xf);
            cpu.flags.set(Flags::CARRY, value > cpu.a);
        }
        AluOp::And => {
            cpu.a &= value;
            cpu.flags.set(Flags::ZERO, cpu.a == 0);
            cpu.flags.remove(Flags::NEGATIVE);
            cpu.flags.insert(Flags::HALF_CARRY);
            cpu.flags.remove(Flags::CARRY);
        }
        AluOp::Or => {
            cpu.a |= value;
            cpu.flags.set(Flags::ZERO, cpu.a == 0);
            cpu.flags.remove(Flags::NEGATIVE);
            cpu.flags.remove(Flags::HALF_CARRY);
            cpu.flags.remove(Flags::CARRY);
        }
        AluOp::Xor => {
            cpu.a ^= value;
            cpu.flags.set(Flags::ZERO, cpu.a == 0);
            cpu.flags.remove(Flags::NEGATIVE);
            cpu.flags.remove(Flags::HALF_CARRY);
            cpu.flags.remove(Flags::CARRY);
        }
    }
}

pub(super) fn rmw(cpu: &mut Cpu, op: RmwOp, value: u8) -> u8 {
    match op {
        RmwOp::Increment => {
            let result = value.wrapping_add(1);
            cpu.flags.set(Flags::ZERO, result == 0);
            cpu.flags.remove(Flags::NEGATIVE);
            cpu.flags.set(Flags::HALF_CARRY, result & 0xf == 0);
            result
        }
        RmwOp::Decrement => {
            let result = value.wrapping_sub(1);
            cpu.flags.set(Flags::ZERO, result == 0);
            cpu.flags.insert(Flags::NEGATIVE);
            cpu.flags.set(Flags::HALF_CARRY, result & 0xf == 0xf);
            result
        }
        RmwOp::Rotate(direction, carry) => {
            let (new_value, new_carry) = rotate(cpu, value, direction, carry);
            cpu.flags.set(Flags::ZERO, new_value == 0);
            cpu.flags.set(Flags::CARRY, new_carry);
            cpu.flags.remove(Flags::NEGATIVE);
            cpu.flags.remove(Flags::HALF_CARRY);
            new_value
        }
        RmwOp::ShiftArithmetic(direction) => {
            let new_value = match direction {
                Direction::Left => {
                    cpu.flags.set(Flags::CARRY, value & 0x80 != 0);
                    value << 1
                }
                Direction::Right => {
                    cpu.flags.set(Flags::CARRY, value & 0x01 != 0);
                    (value >> 1) | (value & 0x80)
                }
            };
            cpu.flags.remove(Flags::NEGATIVE);
            cpu.flags.remove(Flags::HALF_CARRY);
            cpu.flags.set(Flags::ZERO, new_value == 0);
            new_value
        }
        RmwOp::ShiftRightLogical => {
            let new_value = value >> 1;
            cpu.flags.set(Flags::CARRY, value & 0x01 != 0);
            cpu.flags.remove(Flags::NEGATIVE);
            cpu.flags.remove(Flags::HALF_CARRY);
            cpu.flags.set(Flags::ZERO, new_value == 0);
            new_value
        }
        RmwOp::Swap => {
            let new_value = (value << 4) | (value >> 4 & 0xf);
            cpu.flags = if new_value == 0 { Flags::ZERO } else { Flags::empty() };
            new_value
        }
        RmwOp::BitSet(bit) => value | (1 << bit),
        RmwOp::BitReset(bit) => value & !(1 << bit),
    }
}

pub(super) fn rotate(cpu: &Cpu, value: u8, direction: Direction, carry: Carry) -> (u8, bool) {
    let old_carry = cpu.flags.contains(Flags::CARRY);
    match (direction, carry) {
        (Direction::Left, Carry::SetOnly) => (value.rotate_left(1), value & 0x80 != 0),
        (Direction::Right, Carry::SetOnly) => (value.rotate_right(1), value & 0x01 != 0),
        (Direction::Left, Carry::Through) => {
            let new_carry = value & 0x80 != 0;
            ((value << 1) | old_carry as u8, new_carry)
        }
        (Direction::Right, Carry::Through) => {
            let new_carry = value & 0x01 != 0;
            ((value >> 1) | ((old_carry as u8) << 7), new_carry)
        }
    }
}

pub(super) fn pop(cpu: &mut Cpu, action: PopAction, low: u8, high: u8, sp: u16) {
    cpu.stack_pointer = sp.wrapping_add(2);
    let value = u16::from_le_bytes([low, high]);
    match action {
        PopAction::SetRegister(reg) => cpu.set_register16(reg, value),
        PopAction::SetPc => cpu.program_counter = value,
        PopAction::SetPcEnableInterrupts => {
            cpu.interrupt_master_enable = super::InterruptMasterEnable::Enabled;
            cpu.program_counter = value;
        }
    }
}
