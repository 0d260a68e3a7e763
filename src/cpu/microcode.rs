//! The microcode engine: turns a decoded [`Instruction`] into a sequence
//! of per-M-cycle [`BusAction`]s, and walks that sequence one M-cycle at
//! a time. Each instruction becomes a small [`Phase`] value; fetch is
//! always step zero, decoding happens the instant the last operand byte
//! comes back, and the decoded phase's own first M-cycle is folded into
//! that same call so no M-cycle is ever skipped or doubled.

use crate::interrupts::Interrupts;

use super::instruction::{
    Address, AluOp, Arithmetic, BitFlag, BitShift, Carry, CarryFlag, Condition, Direction,
    Instruction, Interrupt, Jump, JumpTarget, Load, Source16, Source8, Stack, Target8, decode,
    operand_count,
};
use super::registers::{Register16, Register8};
use super::{Cpu, EiDelay, InterruptMasterEnable};

/// What happens on the memory bus during one M-cycle.
#[derive(Debug, Clone, Copy)]
pub enum BusAction {
    Read { address: u16 },
    Write { address: u16, value: u8 },
    Internal,
}

/// What to do with a byte once it's been read from memory.
#[derive(Debug, Clone, Copy)]
pub enum ReadAction {
    LoadRegisterHlPost(Register8, i8),
    AluA(AluOp),
    BitTest(u8),
}

/// What to do once both bytes of a 16-bit stack pop have been read.
#[derive(Debug, Clone, Copy)]
pub enum PopAction {
    SetRegister(Register16),
    SetPc,
    SetPcEnableInterrupts,
}

/// A read-modify-write transform applied to a single memory byte.
#[derive(Debug, Clone, Copy)]
pub enum RmwOp {
    Increment,
    Decrement,
    Rotate(Direction, Carry),
    ShiftArithmetic(Direction),
    ShiftRightLogical,
    Swap,
    BitSet(u8),
    BitReset(u8),
}

/// The execution plan for the instruction currently being decoded/run,
/// expressed as a sequence of M-cycles. `Processor` walks this one
/// `BusAction` per call to `step`.
#[derive(Debug)]
enum Phase {
    /// Fetch the opcode and any operand bytes, then decode and fold
    /// straight into the decoded instruction's own phase.
    Fetch {
        pc: u16,
        opcode: Option<u8>,
        operands: [u8; 2],
        operands_read: u8,
        operands_needed: u8,
    },
    /// Interrupt dispatch: push PC, then resolve the vector fresh
    /// against `Interrupts` so a racing write to IE/IF during the push
    /// can cancel or redirect it (the IE-push-bug quirk).
    InterruptDispatch { sp: u16, pc_hi: u8, pc_lo: u8 },
    /// Nothing left to do after the fetch (NOP, register-register
    /// loads, ALU A,r, HALT, STOP, DAA, ...).
    Empty,
    /// One memory read, then apply `action` to the value.
    ReadOp { address: u16, action: ReadAction },
    /// Read a byte, transform it, write it back.
    ReadModifyWrite { address: u16, op: RmwOp },
    /// One memory write. `hl_post` adjusts HL by this delta once the
    /// write is issued (LDI/LDD through (HL)).
    WriteOp { address: u16, value: u8, hl_post: i8 },
    /// LD (nn),SP: two sequential writes, low byte first.
    Write16 { address: u16, lo: u8, hi: u8 },
    /// `count` cycles of internal (non-bus) work.
    InternalOp { count: u8 },
    /// Pop two bytes off the stack, then apply `action`. RET/RETI add a
    /// trailing internal cycle after the pop to land the new PC.
    Pop { sp: u16, action: PopAction },
    /// Push two bytes onto the stack (PUSH rr, CALL, RST).
    Push { sp: u16, hi: u8, lo: u8 },
    /// Conditional relative/absolute jump: one internal cycle if taken.
    CondJump { taken: bool },
    /// Conditional CALL: internal + two writes if taken.
    CondCall { taken: bool, sp: u16, hi: u8, lo: u8 },
    /// Conditional RET: one internal cycle to check the flag, then (if
    /// taken) two reads and a trailing internal cycle. Unconditional RET
    /// skips the condition-check cycle entirely and goes through `Pop`.
    CondReturn { taken: bool, sp: u16, action: PopAction },
}

/// Resolves a CPU-relative address operand against live register state.
fn resolve_address(cpu: &Cpu, address: Address) -> u16 {
    match address {
        Address::Fixed(addr) => addr,
        Address::High(offset) => 0xFF00 | offset as u16,
        Address::HighPlusC => 0xFF00 | cpu.c as u16,
        Address::Dereference(reg) => cpu.get_register16(reg),
        Address::DereferenceHlAndIncrement | Address::DereferenceHlAndDecrement => {
            cpu.get_register16(Register16::Hl)
        }
    }
}

fn hl_post_delta(address: Address) -> i8 {
    match address {
        Address::DereferenceHlAndIncrement => 1,
        Address::DereferenceHlAndDecrement => -1,
        _ => 0,
    }
}

fn read_source8(cpu: &Cpu, source: Source8) -> Option<u8> {
    match source {
        Source8::Constant(v) => Some(v),
        Source8::Register(reg) => Some(cpu.get_register8(reg)),
        Source8::Memory(_) => None,
    }
}

fn condition_met(cpu: &Cpu, condition: Condition) -> bool {
    match condition {
        Condition::Always => true,
        Condition::Zero => cpu.flags.contains(super::flags::Flags::ZERO),
        Condition::NotZero => !cpu.flags.contains(super::flags::Flags::ZERO),
        Condition::Carry => cpu.flags.contains(super::flags::Flags::CARRY),
        Condition::NotCarry => !cpu.flags.contains(super::flags::Flags::CARRY),
    }
}

/// Adds a signed 8-bit offset to SP the SM83 way: the low-byte carry and
/// half-carry are computed on unsigned byte arithmetic, not on the
/// signed sum, even though the overall result treats `offset` as signed.
fn add_sp_signed(cpu: &mut Cpu, offset: i8) -> u16 {
    use super::flags::Flags;
    let sp = cpu.stack_pointer;
    let unsigned = offset as u8;
    let result = sp.wrapping_add(offset as i16 as u16);
    cpu.flags.remove(Flags::ZERO);
    cpu.flags.remove(Flags::NEGATIVE);
    cpu.flags
        .set(Flags::HALF_CARRY, (sp & 0xf) + (unsigned as u16 & 0xf) > 0xf);
    cpu.flags
        .set(Flags::CARRY, (sp & 0xff) + (unsigned as u16) > 0xff);
    result
}

/// State machine that yields one [`BusAction`] per M-cycle for the
/// instruction (or interrupt dispatch) currently in flight.
#[derive(Debug)]
pub struct Processor {
    /// Preserved for the per-instruction trace point (`debugger` module).
    pub instruction: Instruction,
    step: u8,
    phase: Phase,
    scratch: u8,
}

impl Processor {
    /// Starts the next instruction cycle: resolves the delayed-EI state,
    /// then either installs the interrupt-dispatch microcode (if IME is
    /// set and an interrupt is pending) or begins a plain opcode fetch.
    ///
    /// Must not be called while `cpu.halted` is set; the driver keeps the
    /// CPU off the bus entirely until HALT resolves.
    pub fn begin(cpu: &mut Cpu, interrupts: &Interrupts) -> Self {
        cpu.tick_ei_delay();
        if cpu.interrupts_enabled() && interrupts.pending() != 0 {
            Self::interrupt(cpu)
        } else {
            Self::fetch(cpu.program_counter)
        }
    }

    fn fetch(pc: u16) -> Self {
        Self {
            instruction: Instruction::NoOperation,
            step: 0,
            phase: Phase::Fetch { pc, opcode: None, operands: [0; 2], operands_read: 0, operands_needed: 0 },
            scratch: 0,
        }
    }

    fn interrupt(cpu: &mut Cpu) -> Self {
        cpu.interrupt_master_enable = InterruptMasterEnable::Disabled;
        cpu.ei_delay = None;
        let pc = cpu.program_counter;
        Self {
            instruction: Instruction::NoOperation,
            step: 0,
            phase: Phase::InterruptDispatch {
                sp: cpu.stack_pointer,
                pc_hi: (pc >> 8) as u8,
                pc_lo: (pc & 0xFF) as u8,
            },
            scratch: 0,
        }
    }

    /// Advances by one M-cycle. `read_value` is the byte the previous
    /// M-cycle's `BusAction::Read` produced (ignored otherwise).
    /// Returns `None` once the instruction has fully retired.
    pub fn step(
        &mut self,
        cpu: &mut Cpu,
        interrupts: &mut Interrupts,
        read_value: u8,
    ) -> Option<BusAction> {
        let step = self.step;
        self.step += 1;

        match &mut self.phase {
            Phase::Fetch { pc, opcode, operands, operands_read, operands_needed } => {
                match *opcode {
                    None => {
                        if step == 0 {
                            return Some(BusAction::Read { address: *pc });
                        }
                        let op = read_value;
                        if cpu.halt_bug {
                            cpu.halt_bug = false;
                        } else {
                            *pc = pc.wrapping_add(1);
                        }
                        cpu.program_counter = *pc;
                        let needed = operand_count(op);
                        *operands_needed = needed;
                        *opcode = Some(op);
                        if needed == 0 {
                            self.decode_and_transition(cpu, interrupts, op, [0, 0]);
                            self.step = 0;
                            self.step(cpu, interrupts, 0)
                        } else {
                            Some(BusAction::Read { address: *pc })
                        }
                    }
                    Some(op) => {
                        operands[*operands_read as usize] = read_value;
                        *operands_read += 1;
                        *pc = pc.wrapping_add(1);
                        cpu.program_counter = *pc;
                        if *operands_read >= *operands_needed {
                            let bytes = *operands;
                            self.decode_and_transition(cpu, interrupts, op, bytes);
                            self.step = 0;
                            self.step(cpu, interrupts, 0)
                        } else {
                            Some(BusAction::Read { address: *pc })
                        }
                    }
                }
            }

            Phase::Empty => None,

            Phase::ReadOp { address, action } => match step {
                0 => Some(BusAction::Read { address: *address }),
                1 => {
                    super::apply::read_action(cpu, *action, read_value);
                    None
                }
                _ => None,
            },

            Phase::ReadModifyWrite { address, op } => {
                let address = *address;
                match step {
                    0 => Some(BusAction::Read { address }),
                    1 => {
                        let result = super::apply::rmw(cpu, *op, read_value);
                        Some(BusAction::Write { address, value: result })
                    }
                    _ => None,
                }
            }

            Phase::WriteOp { address, value, hl_post } => match step {
                0 => {
                    if *hl_post != 0 {
                        let hl = cpu.get_register16(Register16::Hl);
                        cpu.set_register16(Register16::Hl, hl.wrapping_add(*hl_post as u16));
                    }
                    Some(BusAction::Write { address: *address, value: *value })
                }
                _ => None,
            },

            Phase::Write16 { address, lo, hi } => {
                let address = *address;
                match step {
                    0 => Some(BusAction::Write { address, value: *lo }),
                    1 => Some(BusAction::Write { address: address.wrapping_add(1), value: *hi }),
                    _ => None,
                }
            }

            Phase::InternalOp { count } => {
                if step < *count {
                    Some(BusAction::Internal)
                } else {
                    None
                }
            }

            Phase::Pop { sp, action } => {
                let sp = *sp;
                match step {
                    0 => Some(BusAction::Read { address: sp }),
                    1 => {
                        self.scratch = read_value;
                        Some(BusAction::Read { address: sp.wrapping_add(1) })
                    }
                    2 => {
                        super::apply::pop(cpu, *action, self.scratch, read_value, sp);
                        let trailing = matches!(action, PopAction::SetPc | PopAction::SetPcEnableInterrupts);
                        if trailing { Some(BusAction::Internal) } else { None }
                    }
                    _ => None,
                }
            }

            Phase::Push { sp, hi, lo } => {
                let sp = *sp;
                match step {
                    0 => Some(BusAction::Internal),
                    1 => {
                        let addr = sp.wrapping_sub(1);
                        cpu.stack_pointer = addr;
                        Some(BusAction::Write { address: addr, value: *hi })
                    }
                    2 => {
                        let addr = sp.wrapping_sub(2);
                        cpu.stack_pointer = addr;
                        Some(BusAction::Write { address: addr, value: *lo })
                    }
                    _ => None,
                }
            }

            Phase::CondJump { taken } => match step {
                0 if *taken => Some(BusAction::Internal),
                _ => None,
            },

            Phase::CondCall { taken, sp, hi, lo } => {
                if !*taken {
                    return None;
                }
                let sp = *sp;
                match step {
                    0 => Some(BusAction::Internal),
                    1 => {
                        let addr = sp.wrapping_sub(1);
                        cpu.stack_pointer = addr;
                        Some(BusAction::Write { address: addr, value: *hi })
                    }
                    2 => {
                        let addr = sp.wrapping_sub(2);
                        cpu.stack_pointer = addr;
                        Some(BusAction::Write { address: addr, value: *lo })
                    }
                    _ => None,
                }
            }

            Phase::CondReturn { taken, sp, action } => {
                let sp = *sp;
                let taken = *taken;
                match step {
                    0 => Some(BusAction::Internal),
                    1 if !taken => None,
                    1 => Some(BusAction::Read { address: sp }),
                    2 => {
                        self.scratch = read_value;
                        Some(BusAction::Read { address: sp.wrapping_add(1) })
                    }
                    3 => {
                        super::apply::pop(cpu, *action, self.scratch, read_value, sp);
                        Some(BusAction::Internal)
                    }
                    _ => None,
                }
            }

            Phase::InterruptDispatch { sp, pc_hi, pc_lo } => {
                let sp = *sp;
                match step {
                    0 => Some(BusAction::Internal),
                    1 => Some(BusAction::Internal),
                    2 => {
                        let addr = sp.wrapping_sub(1);
                        cpu.stack_pointer = addr;
                        Some(BusAction::Write { address: addr, value: *pc_hi })
                    }
                    3 => {
                        let addr = sp.wrapping_sub(2);
                        cpu.stack_pointer = addr;
                        Some(BusAction::Write { address: addr, value: *pc_lo })
                    }
                    4 => {
                        match interrupts.highest_priority() {
                            Some(source) => {
                                interrupts.clear(source);
                                cpu.program_counter = source.vector();
                            }
                            None => cpu.program_counter = 0x0000,
                        }
                        Some(BusAction::Internal)
                    }
                    _ => None,
                }
            }
        }
    }

    /// Decodes the fully-fetched opcode and installs the phase that
    /// implements it. Runs once, the instant the last operand byte (if
    /// any) comes back from the `Fetch` phase.
    fn decode_and_transition(&mut self, cpu: &mut Cpu, interrupts: &Interrupts, opcode: u8, operand_bytes: [u8; 2]) {
        let needed = operand_count(opcode) as usize;
        let instruction = decode(opcode, &operand_bytes[..needed]);
        log::trace!("{:#06x}: {opcode:#04x} -> {instruction:?}", cpu.program_counter);

        let phase = match instruction {
            Instruction::Invalid(op) => {
                cpu.halted_on_fault = Some(op);
                Phase::Empty
            }
            Instruction::NoOperation => Phase::Empty,
            Instruction::DecimalAdjustAccumulator => {
                super::apply::daa(cpu);
                Phase::Empty
            }
            Instruction::ComplementAccumulator => {
                cpu.a = !cpu.a;
                cpu.flags
                    .insert(super::flags::Flags::NEGATIVE | super::flags::Flags::HALF_CARRY);
                Phase::Empty
            }
            Instruction::CarryFlag(cf) => {
                apply_carry_flag(cpu, cf);
                Phase::Empty
            }
            Instruction::Interrupt(Interrupt::Enable) => {
                if cpu.interrupt_master_enable != InterruptMasterEnable::Enabled {
                    cpu.ei_delay = Some(EiDelay::Pending);
                }
                Phase::Empty
            }
            Instruction::Interrupt(Interrupt::Disable) => {
                cpu.interrupt_master_enable = InterruptMasterEnable::Disabled;
                cpu.ei_delay = None;
                Phase::Empty
            }
            Instruction::Interrupt(Interrupt::Await) => {
                // The HALT bug: if IME is clear and an interrupt is already
                // pending at the moment HALT is fetched, the CPU never
                // actually halts; instead the next fetch re-reads the same
                // byte once, corrupting the following instruction's decode.
                if !cpu.interrupts_enabled() && interrupts.pending() != 0 {
                    cpu.halt_bug = true;
                } else {
                    cpu.halted = true;
                }
                Phase::Empty
            }
            Instruction::Stop => {
                // Low-power transitions aside, guest code rarely executes
                // STOP deliberately; treated as a no-op so it can't wedge
                // the pipeline.
                log::debug!("STOP opcode executed; treated as no-op");
                Phase::Empty
            }
            Instruction::Load(load) => build_load(cpu, load),
            Instruction::Arithmetic(arith) => build_arithmetic(cpu, arith),
            Instruction::BitShift(bs) => build_bit_shift(cpu, bs),
            Instruction::BitFlag(bf) => build_bit_flag(cpu, bf),
            Instruction::Jump(j) => build_jump(cpu, j),
            Instruction::Stack(s) => build_stack(cpu, s),
        };

        self.instruction = instruction;
        self.phase = phase;
    }
}

fn apply_carry_flag(cpu: &mut Cpu, cf: CarryFlag) {
    use super::flags::Flags;
    match cf {
        CarryFlag::Complement => {
            cpu.flags.remove(Flags::NEGATIVE);
            cpu.flags.remove(Flags::HALF_CARRY);
            cpu.flags.toggle(Flags::CARRY);
        }
        CarryFlag::Set => {
            cpu.flags.remove(Flags::NEGATIVE);
            cpu.flags.remove(Flags::HALF_CARRY);
            cpu.flags.insert(Flags::CARRY);
        }
    }
}

fn build_load(cpu: &mut Cpu, load: Load) -> Phase {
    match load {
        Load::Load8 { to, from } => {
            if let Some(value) = read_source8(cpu, from) {
                match to {
                    Target8::Register(reg) => {
                        cpu.set_register8(reg, value);
                        Phase::Empty
                    }
                    Target8::Memory(addr) => Phase::WriteOp {
                        address: resolve_address(cpu, addr),
                        value,
                        hl_post: hl_post_delta(addr),
                    },
                }
            } else if let Source8::Memory(addr) = from {
                let address = resolve_address(cpu, addr);
                let action = match to {
                    Target8::Register(reg) => ReadAction::LoadRegisterHlPost(reg, hl_post_delta(addr)),
                    Target8::Memory(_) => unreachable!("memory-to-memory load is not an SM83 encoding"),
                };
                Phase::ReadOp { address, action }
            } else {
                unreachable!()
            }
        }
        Load::Load16 { to, from } => {
            if let Source16::Constant(value) = from {
                cpu.set_register16(to, value);
            }
            Phase::Empty
        }
        Load::StoreSp(address) => {
            let [lo, hi] = cpu.stack_pointer.to_le_bytes();
            Phase::Write16 { address, lo, hi }
        }
        Load::LoadHlFromSpPlusOffset(offset) => {
            let result = add_sp_signed(cpu, offset);
            cpu.set_register16(Register16::Hl, result);
            Phase::InternalOp { count: 1 }
        }
        Load::LoadSpFromHl => {
            cpu.stack_pointer = cpu.get_register16(Register16::Hl);
            Phase::InternalOp { count: 1 }
        }
    }
}

fn build_arithmetic(cpu: &mut Cpu, arith: Arithmetic) -> Phase {
    match arith {
        Arithmetic::Alu8 { op, source } => {
            if let Some(value) = read_source8(cpu, source) {
                super::apply::alu(cpu, op, value);
                Phase::Empty
            } else if let Source8::Memory(addr) = source {
                Phase::ReadOp { address: resolve_address(cpu, addr), action: ReadAction::AluA(op) }
            } else {
                unreachable!()
            }
        }
        Arithmetic::Inc8(target) => rmw_or_register(cpu, target, RmwOp::Increment),
        Arithmetic::Dec8(target) => rmw_or_register(cpu, target, RmwOp::Decrement),
        Arithmetic::Inc16(reg) => {
            let v = cpu.get_register16(reg);
            cpu.set_register16(reg, v.wrapping_add(1));
            Phase::InternalOp { count: 1 }
        }
        Arithmetic::Dec16(reg) => {
            let v = cpu.get_register16(reg);
            cpu.set_register16(reg, v.wrapping_sub(1));
            Phase::InternalOp { count: 1 }
        }
        Arithmetic::AddHl(reg) => {
            use super::flags::Flags;
            let hl = cpu.get_register16(Register16::Hl);
            let rhs = cpu.get_register16(reg);
            let result = hl.wrapping_add(rhs);
            cpu.flags.remove(Flags::NEGATIVE);
            cpu.flags.set(Flags::HALF_CARRY, (hl & 0xFFF) + (rhs & 0xFFF) > 0xFFF);
            cpu.flags.set(Flags::CARRY, hl as u32 + rhs as u32 > 0xFFFF);
            cpu.set_register16(Register16::Hl, result);
            Phase::InternalOp { count: 1 }
        }
    }
}

/// INC/DEC/rotate/shift/swap all share this split: register forms apply
/// in place with no bus cycle, `(HL)` forms go through a read-modify-write.
fn rmw_or_register(cpu: &mut Cpu, target: Target8, op: RmwOp) -> Phase {
    match target {
        Target8::Register(reg) => {
            let value = super::apply::rmw(cpu, op, cpu.get_register8(reg));
            cpu.set_register8(reg, value);
            Phase::Empty
        }
        Target8::Memory(addr) => Phase::ReadModifyWrite { address: resolve_address(cpu, addr), op },
    }
}

fn build_bit_shift(cpu: &mut Cpu, bs: BitShift) -> Phase {
    use super::flags::Flags;
    match bs {
        BitShift::RotateA { direction, carry } => {
            let (value, new_carry) = super::apply::rotate(cpu, cpu.a, direction, carry);
            cpu.a = value;
            cpu.flags.remove(Flags::ZERO);
            cpu.flags.remove(Flags::NEGATIVE);
            cpu.flags.remove(Flags::HALF_CARRY);
            cpu.flags.set(Flags::CARRY, new_carry);
            Phase::Empty
        }
        BitShift::Rotate { target, direction, carry } => rmw_or_register(cpu, target, RmwOp::Rotate(direction, carry)),
        BitShift::ShiftArithmetic { target, direction } => rmw_or_register(cpu, target, RmwOp::ShiftArithmetic(direction)),
        BitShift::ShiftRightLogical(target) => rmw_or_register(cpu, target, RmwOp::ShiftRightLogical),
        BitShift::Swap(target) => rmw_or_register(cpu, target, RmwOp::Swap),
    }
}

fn build_bit_flag(cpu: &mut Cpu, bf: BitFlag) -> Phase {
    match bf {
        BitFlag::Test { bit, target } => match target {
            Target8::Register(reg) => {
                let value = cpu.get_register8(reg);
                super::apply::read_action(cpu, ReadAction::BitTest(bit), value);
                Phase::Empty
            }
            Target8::Memory(addr) => {
                Phase::ReadOp { address: resolve_address(cpu, addr), action: ReadAction::BitTest(bit) }
            }
        },
        BitFlag::Set { bit, target } => rmw_or_register(cpu, target, RmwOp::BitSet(bit)),
        BitFlag::Reset { bit, target } => rmw_or_register(cpu, target, RmwOp::BitReset(bit)),
    }
}

fn build_jump(cpu: &mut Cpu, jump: Jump) -> Phase {
    match jump {
        Jump::Absolute { condition, target } => match target {
            JumpTarget::Hl => {
                cpu.program_counter = cpu.get_register16(Register16::Hl);
                Phase::Empty
            }
            JumpTarget::Immediate(addr) => {
                let taken = condition_met(cpu, condition);
                if taken {
                    cpu.program_counter = addr;
                }
                Phase::CondJump { taken }
            }
        },
        Jump::Relative { condition, offset } => {
            let taken = condition_met(cpu, condition);
            if taken {
                cpu.program_counter = cpu.program_counter.wrapping_add(offset as i16 as u16);
            }
            Phase::CondJump { taken }
        }
        Jump::Call { condition, target } => {
            let taken = condition_met(cpu, condition);
            let [lo, hi] = cpu.program_counter.to_le_bytes();
            if taken {
                cpu.program_counter = target;
            }
            Phase::CondCall { taken, sp: cpu.stack_pointer, hi, lo }
        }
    }
}

fn build_stack(cpu: &mut Cpu, stack: Stack) -> Phase {
    match stack {
        Stack::Push(reg) => {
            let [hi, lo] = cpu.get_register16(reg).to_be_bytes();
            Phase::Push { sp: cpu.stack_pointer, hi, lo }
        }
        Stack::Pop(reg) => Phase::Pop { sp: cpu.stack_pointer, action: PopAction::SetRegister(reg) },
        Stack::Return { condition } => {
            // Unconditional RET has no condition-check cycle; RET cc does.
            if condition == Condition::Always {
                Phase::Pop { sp: cpu.stack_pointer, action: PopAction::SetPc }
            } else {
                let taken = condition_met(cpu, condition);
                Phase::CondReturn { taken, sp: cpu.stack_pointer, action: PopAction::SetPc }
            }
        }
        Stack::ReturnAndEnableInterrupts => {
            Phase::Pop { sp: cpu.stack_pointer, action: PopAction::SetPcEnableInterrupts }
        }
        Stack::Restart(vector) => {
            let [lo, hi] = cpu.program_counter.to_le_bytes();
            cpu.program_counter = vector as u16;
            Phase::Push { sp: cpu.stack_pointer, hi, lo }
        }
        Stack::Adjust(offset) => {
            let result = add_sp_signed(cpu, offset);
            cpu.stack_pointer = result;
            Phase::InternalOp { count: 2 }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::flags::Flags;
    use crate::interrupts::Interrupts;

    fn fresh_bus() -> Box<[u8; 0x10000]> {
        Box::new([0u8; 0x10000])
    }

    fn run_to_completion(cpu: &mut Cpu, interrupts: &mut Interrupts, bus: &mut [u8; 0x10000]) -> usize {
        let mut proc = Processor::begin(cpu, interrupts);
        let mut read_value = 0u8;
        let mut cycles = 0;
        loop {
            match proc.step(cpu, interrupts, read_value) {
                Some(BusAction::Read { address }) => {
                    read_value = bus[address as usize];
                    cycles += 1;
                }
                Some(BusAction::Write { address, value }) => {
                    bus[address as usize] = value;
                    cycles += 1;
                }
                Some(BusAction::Internal) => cycles += 1,
                None => break,
            }
        }
        cycles
    }

    #[test]
    fn nop_retires_in_one_mcycle() {
        let mut cpu = Cpu::default();
        cpu.program_counter = 0x0200;
        let mut interrupts = Interrupts::default();
        let mut bus = fresh_bus();
        bus[0x0200] = 0x00;
        let cycles = run_to_completion(&mut cpu, &mut interrupts, &mut bus);
        assert_eq!(cycles, 1);
        assert_eq!(cpu.program_counter, 0x0201);
    }

    #[test]
    fn cpl_complements_a_and_sets_n_and_h_leaving_z_and_c() {
        let mut cpu = Cpu::default();
        cpu.program_counter = 0x0200;
        cpu.a = 0x35;
        cpu.flags = Flags::ZERO | Flags::CARRY;
        let mut interrupts = Interrupts::default();
        let mut bus = fresh_bus();
        bus[0x0200] = 0x2F; // CPL

        run_to_completion(&mut cpu, &mut interrupts, &mut bus);
        assert_eq!(cpu.a, 0xCA);
        assert!(cpu.flags.contains(Flags::NEGATIVE));
        assert!(cpu.flags.contains(Flags::HALF_CARRY));
        assert!(cpu.flags.contains(Flags::ZERO), "Z must be left untouched");
        assert!(cpu.flags.contains(Flags::CARRY), "C must be left untouched");
    }

    #[test]
    fn unconditional_ret_is_four_mcycles() {
        let mut cpu = Cpu::default();
        cpu.program_counter = 0x0300;
        cpu.stack_pointer = 0xFFFC;
        let mut interrupts = Interrupts::default();
        let mut bus = fresh_bus();
        bus[0x0300] = 0xC9; // RET
        bus[0xFFFC] = 0x34;
        bus[0xFFFD] = 0x12;

        let cycles = run_to_completion(&mut cpu, &mut interrupts, &mut bus);
        assert_eq!(cycles, 4);
        assert_eq!(cpu.program_counter, 0x1234);
        assert_eq!(cpu.stack_pointer, 0xFFFE);
    }

    #[test]
    fn conditional_ret_not_taken_is_two_mcycles() {
        let mut cpu = Cpu::default();
        cpu.program_counter = 0x0300;
        cpu.flags = Flags::empty();
        cpu.flags.insert(Flags::ZERO);
        let mut interrupts = Interrupts::default();
        let mut bus = fresh_bus();
        bus[0x0300] = 0xC0; // RET NZ; Z is set, so NZ is not taken

        let cycles = run_to_completion(&mut cpu, &mut interrupts, &mut bus);
        assert_eq!(cycles, 2);
        assert_eq!(cpu.program_counter, 0x0301);
    }

    #[test]
    fn conditional_ret_taken_is_five_mcycles() {
        let mut cpu = Cpu::default();
        cpu.program_counter = 0x0300;
        cpu.stack_pointer = 0xFFFC;
        cpu.flags = Flags::empty();
        let mut interrupts = Interrupts::default();
        let mut bus = fresh_bus();
        bus[0x0300] = 0xC0; // RET NZ; Z is clear, so NZ is taken
        bus[0xFFFC] = 0x34;
        bus[0xFFFD] = 0x12;

        let cycles = run_to_completion(&mut cpu, &mut interrupts, &mut bus);
        assert_eq!(cycles, 5);
        assert_eq!(cpu.program_counter, 0x1234);
    }

    #[test]
    fn ei_takes_effect_after_the_following_instruction() {
        let mut cpu = Cpu::default();
        cpu.program_counter = 0x0400;
        let mut interrupts = Interrupts::default();
        let mut bus = fresh_bus();
        bus[0x0400] = 0xFB; // EI
        bus[0x0401] = 0x00; // NOP
        bus[0x0402] = 0x00; // NOP

        run_to_completion(&mut cpu, &mut interrupts, &mut bus);
        assert!(!cpu.interrupts_enabled(), "IME must not be set until after the instruction following EI");
        run_to_completion(&mut cpu, &mut interrupts, &mut bus);
        assert!(cpu.interrupts_enabled(), "IME must be set once the instruction following EI retires");
    }

    #[test]
    fn halt_bug_suppresses_one_pc_increment() {
        let mut cpu = Cpu::default();
        cpu.program_counter = 0x0500;
        cpu.halt_bug = true;
        let mut interrupts = Interrupts::default();
        let mut bus = fresh_bus();
        bus[0x0500] = 0x3C; // INC A

        run_to_completion(&mut cpu, &mut interrupts, &mut bus);
        assert_eq!(cpu.program_counter, 0x0500, "fetch must re-execute the same opcode byte once");
        assert!(!cpu.halt_bug);
    }

    #[test]
    fn halt_with_ime_clear_and_pending_interrupt_arms_the_bug_instead_of_halting() {
        let mut cpu = Cpu::default();
        cpu.program_counter = 0x0600;
        cpu.interrupt_master_enable = InterruptMasterEnable::Disabled;
        let mut interrupts = Interrupts::default();
        interrupts.write_ie(crate::cpu::InterruptSource::Timer.mask());
        interrupts.request(crate::cpu::InterruptSource::Timer);
        let mut bus = fresh_bus();
        bus[0x0600] = 0x76; // HALT

        run_to_completion(&mut cpu, &mut interrupts, &mut bus);
        assert!(!cpu.halted, "IME clear with a pending interrupt must not actually halt");
        assert!(cpu.halt_bug);
    }

    #[test]
    fn halt_with_no_pending_interrupt_halts_normally() {
        let mut cpu = Cpu::default();
        cpu.program_counter = 0x0600;
        cpu.interrupt_master_enable = InterruptMasterEnable::Disabled;
        let mut interrupts = Interrupts::default();
        let mut bus = fresh_bus();
        bus[0x0600] = 0x76; // HALT

        run_to_completion(&mut cpu, &mut interrupts, &mut bus);
        assert!(cpu.halted);
        assert!(!cpu.halt_bug);
    }

    #[test]
    fn interrupt_dispatch_pushes_pc_and_jumps_to_vector() {
        let mut cpu = Cpu::default();
        cpu.program_counter = 0x0150;
        cpu.stack_pointer = 0xFFFE;
        cpu.interrupt_master_enable = InterruptMasterEnable::Enabled;
        let mut interrupts = Interrupts::default();
        interrupts.write_ie(crate::cpu::InterruptSource::VBlank.mask());
        interrupts.request(crate::cpu::InterruptSource::VBlank);
        let mut bus = fresh_bus();

        let cycles = run_to_completion(&mut cpu, &mut interrupts, &mut bus);
        assert_eq!(cycles, 5);
        assert_eq!(cpu.program_counter, crate::cpu::InterruptSource::VBlank.vector());
        assert_eq!(cpu.stack_pointer, 0xFFFC);
        assert_eq!(u16::from_le_bytes([bus[0xFFFC], bus[0xFFFD]]), 0x0150);
        assert!(!interrupts.pending_contains(crate::cpu::InterruptSource::VBlank));
    }
}
