//! Core virtual machine implementation.
//!
//! The machine executes an encoded IL program with a register-based
//! architecture: 16 word-sized registers (R0-R12 general purpose, SP, IP,
//! CD), condition-flag predication, and a call/return stack in an owned
//! data memory region.
//!
//! # Execution model
//!
//! IP is a byte offset into the owned code buffer, never a raw address;
//! every fetch and every data access is bounds-checked. Each step fetches
//! and decodes the record at IP, evaluates its predicate mask against the
//! flags (conjunction: every flag in the mask must be set), dispatches to
//! the handler if the predicate passed, and finally advances. The
//! interpreter-internal NI flag drives the advance: handlers that set IP
//! themselves (BRANCH, CALL, RETURN) clear NI, telling the loop to leave IP
//! alone for this step and re-assert NI for the next one.
//!
//! Runs are bounded by a step limit so a program without a reachable HALT
//! terminates with an error instead of spinning forever.

use crate::debug;
use crate::errors::VmError;
use crate::il::code::Code;
use crate::il::isa::{Condition, Conditions, Mnemonic, CD, IP, REGISTER_COUNT, REGISTER_NAMES, SP};
use crate::il::operand::Operand;

/// Size of the owned data memory region (stack plus general storage).
pub const DEFAULT_MEMORY_SIZE: usize = 64 * 1024;

/// Steps a run may take before it is declared stuck.
pub const DEFAULT_STEP_LIMIT: u64 = 1 << 20;

/// Bit mask covering the low `width` bytes of a word.
const fn width_mask(width: u8) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width as u32 * 8)) - 1
    }
}

/// Bytecode virtual machine.
///
/// Owns the code buffer, the data memory region and the register file; two
/// machines never share state, so any number can run concurrently.
pub struct Machine {
    /// Encoded program; IP indexes into this buffer.
    code: Vec<u8>,
    /// Data memory; the stack grows down from the top.
    memory: Vec<u8>,
    /// R0-R12, SP, IP, CD. Flags live in the low bits of CD.
    regs: [u64; REGISTER_COUNT],
    /// Maximum steps per [`Machine::run`].
    step_limit: u64,
}

impl Machine {
    /// Creates a machine for the given program with the default memory size.
    pub fn new(code: Vec<u8>) -> Self {
        Self::with_memory_size(code, DEFAULT_MEMORY_SIZE)
    }

    /// Creates a machine with an explicit data memory size.
    ///
    /// Registers start zeroed, IP at the start of the code buffer, SP at the
    /// top of memory, and NI asserted so the first step advances normally.
    pub fn with_memory_size(code: Vec<u8>, memory_size: usize) -> Self {
        let mut machine = Self {
            code,
            memory: vec![0; memory_size],
            regs: [0; REGISTER_COUNT],
            step_limit: DEFAULT_STEP_LIMIT,
        };
        machine.regs[SP as usize] = memory_size as u64;
        machine.toggle_condition(Condition::Ni, true);
        machine
    }

    /// Replaces the default step limit.
    pub fn set_step_limit(&mut self, limit: u64) {
        self.step_limit = limit;
    }

    /// Current value of a register, full width.
    pub fn register(&self, id: u8) -> u64 {
        self.regs[id as usize]
    }

    /// Current condition flags (the low bits of CD).
    pub fn conditions(&self) -> Conditions {
        Conditions::from_bits(self.regs[CD as usize] as u8)
    }

    fn has_condition(&self, condition: Condition) -> bool {
        self.conditions().contains(condition)
    }

    fn toggle_condition(&mut self, condition: Condition, value: bool) {
        let mut conditions = self.conditions();
        conditions.toggle(condition, value);
        let cd = &mut self.regs[CD as usize];
        *cd = (*cd & !0xFF) | conditions.bits() as u64;
    }

    /// Executes until HALT, a fault, or the step limit.
    ///
    /// On a fault the machine state is left exactly as of the faulting step
    /// for inspection; there is no resynchronization.
    pub fn run(&mut self) -> Result<(), VmError> {
        let mut steps = 0u64;
        while !self.has_condition(Condition::Hlt) {
            if steps == self.step_limit {
                return Err(VmError::StepLimitExceeded {
                    limit: self.step_limit,
                });
            }
            steps += 1;
            self.step()?;
        }
        Ok(())
    }

    /// Executes a single fetch-decode-predicate-execute-advance cycle.
    pub fn step(&mut self) -> Result<(), VmError> {
        let offset = self.regs[IP as usize] as usize;
        let code = Code::decode(&self.code, offset)?;

        let mask = code.conditions().user();
        if mask.is_empty() || self.conditions().contains_all(mask) {
            debug!("{offset:#06x}: {code}");
            self.exec(&code)?;
        } else {
            debug!("{offset:#06x}: {code} (skipped)");
        }

        if self.has_condition(Condition::Ni) {
            self.regs[IP as usize] = self.regs[IP as usize].wrapping_add(code.size() as u64);
        } else {
            // The handler already determined the next IP; default sequencing
            // resumes on the following step.
            self.toggle_condition(Condition::Ni, true);
        }
        Ok(())
    }

    /// Dispatches a decoded instruction to its handler.
    fn exec(&mut self, code: &Code) -> Result<(), VmError> {
        match code.mnemonic() {
            Mnemonic::Set => self.op_set(code),
            Mnemonic::Add => self.op_binary(code, u64::wrapping_add),
            Mnemonic::Sub => self.op_binary(code, u64::wrapping_sub),
            Mnemonic::Mul => self.op_binary(code, u64::wrapping_mul),
            Mnemonic::And => self.op_binary(code, |a, b| a & b),
            Mnemonic::Or => self.op_binary(code, |a, b| a | b),
            Mnemonic::Xor => self.op_binary(code, |a, b| a ^ b),
            Mnemonic::ShiftL => self.op_binary(code, |a, b| a.wrapping_shl(b as u32)),
            Mnemonic::ShiftR => self.op_binary(code, |a, b| a.wrapping_shr(b as u32)),
            Mnemonic::Not => self.op_not(code),
            Mnemonic::Cmp => self.op_cmp(code),
            Mnemonic::Load => self.op_load(code),
            Mnemonic::Store => self.op_store(code),
            Mnemonic::Push => self.op_push(code),
            Mnemonic::Pop => self.op_pop(code),
            Mnemonic::Branch => self.op_branch(code),
            Mnemonic::Call => self.op_call(code),
            Mnemonic::Return => self.op_return(code),
            Mnemonic::Halt => self.op_halt(code),
        }
    }

    // ==================== Operand access ====================

    /// Reads the low `width` bytes of a register.
    fn read_register(&self, id: u8, width: u8) -> u64 {
        self.regs[id as usize] & width_mask(width)
    }

    /// Writes the low `width` bytes of a register, preserving the rest.
    fn write_register(&mut self, id: u8, value: u64, width: u8) {
        let mask = width_mask(width);
        let reg = &mut self.regs[id as usize];
        *reg = (*reg & !mask) | (value & mask);
    }

    /// Reads an operand's value at its own declared width.
    fn read_operand(&self, operand: &Operand) -> u64 {
        match operand {
            Operand::Register { id, width } => self.read_register(*id, *width),
            Operand::Immediate { value, width } => value & width_mask(*width),
        }
    }

    /// Reads an operand clamped to `max_width` (source reads in SET and the
    /// arithmetic handlers use the narrower of the two operand widths).
    fn read_operand_clamped(&self, operand: &Operand, max_width: u8) -> u64 {
        let width = operand.width().min(max_width);
        match operand {
            Operand::Register { id, .. } => self.read_register(*id, width),
            Operand::Immediate { value, .. } => value & width_mask(width),
        }
    }

    /// Fails unless the instruction carries exactly `expected` operands.
    fn expect_operands(code: &Code, expected: usize) -> Result<(), VmError> {
        let actual = code.operand_count() as usize;
        if actual != expected {
            return Err(VmError::OperandCountMismatch {
                instruction: code.mnemonic().as_str(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Fetches operand `index`, which must be a register reference.
    fn register_operand(code: &Code, index: u8) -> Result<(u8, u8), VmError> {
        match code.operand(index)? {
            Operand::Register { id, width } => Ok((*id, *width)),
            Operand::Immediate { .. } => Err(VmError::ExpectedRegisterOperand {
                instruction: code.mnemonic().as_str(),
                index,
            }),
        }
    }

    // ==================== Memory access ====================

    /// Reads `width` bytes from data memory, little-endian.
    fn read_memory(&self, address: u64, width: u8) -> Result<u64, VmError> {
        let slice = usize::try_from(address)
            .ok()
            .and_then(|start| start.checked_add(width as usize).map(|end| (start, end)))
            .and_then(|(start, end)| self.memory.get(start..end))
            .ok_or(VmError::MemoryOutOfBounds {
                address,
                size: width as usize,
                memory_size: self.memory.len(),
            })?;
        let mut raw = [0u8; 8];
        raw[..width as usize].copy_from_slice(slice);
        Ok(u64::from_le_bytes(raw))
    }

    /// Writes the low `width` bytes of `value` to data memory.
    fn write_memory(&mut self, address: u64, value: u64, width: u8) -> Result<(), VmError> {
        let memory_size = self.memory.len();
        let slice = usize::try_from(address)
            .ok()
            .and_then(|start| start.checked_add(width as usize).map(|end| (start, end)))
            .and_then(|(start, end)| self.memory.get_mut(start..end))
            .ok_or(VmError::MemoryOutOfBounds {
                address,
                size: width as usize,
                memory_size,
            })?;
        slice.copy_from_slice(&value.to_le_bytes()[..width as usize]);
        Ok(())
    }

    /// Pushes `width` bytes onto the stack, moving SP down.
    fn push_bytes(&mut self, value: u64, width: u8) -> Result<(), VmError> {
        let sp = self.regs[SP as usize];
        let new_sp = sp.checked_sub(width as u64).ok_or(VmError::StackOverflow {
            sp,
            size: width as usize,
        })?;
        self.write_memory(new_sp, value, width)?;
        self.regs[SP as usize] = new_sp;
        Ok(())
    }

    /// Pops `width` bytes off the stack, moving SP up.
    fn pop_bytes(&mut self, width: u8) -> Result<u64, VmError> {
        let sp = self.regs[SP as usize];
        if sp + width as u64 > self.memory.len() as u64 {
            return Err(VmError::StackUnderflow {
                sp,
                size: width as usize,
            });
        }
        let value = self.read_memory(sp, width)?;
        self.regs[SP as usize] = sp + width as u64;
        Ok(value)
    }

    // ==================== Handlers ====================

    fn op_set(&mut self, code: &Code) -> Result<(), VmError> {
        Self::expect_operands(code, 2)?;
        let (dst, dst_width) = Self::register_operand(code, 0)?;
        let value = self.read_operand_clamped(code.operand(1)?, dst_width);
        self.write_register(dst, value, dst_width);
        Ok(())
    }

    /// Shared body of the arithmetic and bitwise instructions:
    /// `dst = f(dst, src)` at the destination register's width.
    fn op_binary(&mut self, code: &Code, f: fn(u64, u64) -> u64) -> Result<(), VmError> {
        Self::expect_operands(code, 2)?;
        let (dst, dst_width) = Self::register_operand(code, 0)?;
        let a = self.read_register(dst, dst_width);
        let b = self.read_operand_clamped(code.operand(1)?, dst_width);
        self.write_register(dst, f(a, b), dst_width);
        Ok(())
    }

    fn op_not(&mut self, code: &Code) -> Result<(), VmError> {
        Self::expect_operands(code, 1)?;
        let (reg, width) = Self::register_operand(code, 0)?;
        let value = self.read_register(reg, width);
        self.write_register(reg, !value, width);
        Ok(())
    }

    fn op_cmp(&mut self, code: &Code) -> Result<(), VmError> {
        Self::expect_operands(code, 2)?;
        let a = self.read_operand(code.operand(0)?);
        let b = self.read_operand(code.operand(1)?);
        self.toggle_condition(Condition::Eq, a == b);
        self.toggle_condition(Condition::Neq, a != b);
        self.toggle_condition(Condition::Lt, a < b);
        self.toggle_condition(Condition::Gt, a > b);
        Ok(())
    }

    fn op_load(&mut self, code: &Code) -> Result<(), VmError> {
        Self::expect_operands(code, 2)?;
        let (dst, dst_width) = Self::register_operand(code, 0)?;
        let address = self.read_operand(code.operand(1)?);
        let value = self.read_memory(address, dst_width)?;
        self.write_register(dst, value, dst_width);
        Ok(())
    }

    fn op_store(&mut self, code: &Code) -> Result<(), VmError> {
        Self::expect_operands(code, 2)?;
        let address = self.read_operand(code.operand(0)?);
        let source = code.operand(1)?;
        let value = self.read_operand(source);
        self.write_memory(address, value, source.width())
    }

    fn op_push(&mut self, code: &Code) -> Result<(), VmError> {
        Self::expect_operands(code, 1)?;
        let source = code.operand(0)?;
        let value = self.read_operand(source);
        self.push_bytes(value, source.width())
    }

    fn op_pop(&mut self, code: &Code) -> Result<(), VmError> {
        Self::expect_operands(code, 1)?;
        let (dst, width) = Self::register_operand(code, 0)?;
        let value = self.pop_bytes(width)?;
        self.write_register(dst, value, width);
        Ok(())
    }

    fn op_branch(&mut self, code: &Code) -> Result<(), VmError> {
        Self::expect_operands(code, 1)?;
        let displacement = self.read_operand(code.operand(0)?);
        let ip = &mut self.regs[IP as usize];
        *ip = ip.wrapping_add(displacement);
        self.toggle_condition(Condition::Ni, false);
        Ok(())
    }

    fn op_call(&mut self, code: &Code) -> Result<(), VmError> {
        Self::expect_operands(code, 1)?;
        let return_address = self.regs[IP as usize].wrapping_add(code.size() as u64);
        self.push_bytes(return_address, 8)?;

        let displacement = self.read_operand(code.operand(0)?);
        let ip = &mut self.regs[IP as usize];
        *ip = ip.wrapping_add(displacement);
        self.toggle_condition(Condition::Ni, false);
        Ok(())
    }

    fn op_return(&mut self, code: &Code) -> Result<(), VmError> {
        Self::expect_operands(code, 0)?;
        let return_address = self.pop_bytes(8)?;
        self.regs[IP as usize] = return_address;
        self.toggle_condition(Condition::Ni, false);
        Ok(())
    }

    fn op_halt(&mut self, code: &Code) -> Result<(), VmError> {
        Self::expect_operands(code, 0)?;
        self.toggle_condition(Condition::Hlt, true);
        Ok(())
    }
}

impl std::fmt::Display for Machine {
    /// Formats the register file as a table, flags spelled out next to CD.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "============== MACHINE CONTEXT ==============")?;
        for (id, name) in REGISTER_NAMES.iter().enumerate() {
            let value = self.regs[id];
            write!(f, "{name:>3}: {value:016x} ({value})")?;
            if id == CD as usize {
                write!(f, " ({})", self.conditions())?;
            }
            writeln!(f)?;
        }
        write!(f, "=============================================")
    }
}
