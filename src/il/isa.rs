//! Instruction set definitions.
//!
//! The [`for_each_mnemonic!`](crate::for_each_mnemonic) macro holds the
//! canonical mnemonic table and invokes a callback macro for code generation,
//! so decoding, parsing and formatting share a single definition.
//!
//! This module generates:
//! - The [`Mnemonic`] enum with opcode mappings
//! - `TryFrom<u8>` for decoding opcodes
//! - Mnemonic name lookups in both directions
//!
//! It also defines the condition flags ([`Condition`], [`Conditions`]) and
//! the register name table.

use crate::errors::VmError;

/// Invokes a callback macro with the complete mnemonic definition list.
///
/// This macro enables code generation for the instruction set in multiple
/// modules without duplicating the definitions.
#[macro_export]
macro_rules! for_each_mnemonic {
    ($callback:ident) => {
        $callback! {
            /// SET dst, src ; dst = src
            Set = 0x00, "SET",
            /// ADD dst, src ; dst = dst + src
            Add = 0x01, "ADD",
            /// SUB dst, src ; dst = dst - src
            Sub = 0x02, "SUB",
            /// CMP a, b ; sets EQ/NEQ/LT/GT from unsigned comparison
            Cmp = 0x03, "CMP",
            /// LOAD dst, addr ; dst = memory[addr]
            Load = 0x04, "LOAD",
            /// STORE addr, val ; memory[addr] = val
            Store = 0x05, "STORE",
            /// BRANCH target ; ip = ip + target
            Branch = 0x06, "BRANCH",
            /// MUL dst, src ; dst = dst * src
            Mul = 0x07, "MUL",
            /// AND dst, src ; dst = dst & src
            And = 0x08, "AND",
            /// OR dst, src ; dst = dst | src
            Or = 0x09, "OR",
            /// XOR dst, src ; dst = dst ^ src
            Xor = 0x0A, "XOR",
            /// NOT reg ; reg = !reg
            Not = 0x0B, "NOT",
            /// SHIFTR dst, src ; dst = dst >> src
            ShiftR = 0x0C, "SHIFTR",
            /// SHIFTL dst, src ; dst = dst << src
            ShiftL = 0x0D, "SHIFTL",
            /// PUSH src ; sp -= width(src); memory[sp] = src
            Push = 0x0E, "PUSH",
            /// POP dst ; dst = memory[sp]; sp += width(dst)
            Pop = 0x0F, "POP",
            /// CALL target ; push return address; ip = ip + target
            Call = 0x10, "CALL",
            /// RETURN ; pop return address into ip
            Return = 0x11, "RETURN",
            /// HALT ; stop execution
            Halt = 0x12, "HALT",
        }
    };
}

#[macro_export]
macro_rules! define_mnemonics {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:literal, $mnemonic:literal
        ),* $(,)?
    ) => {
        /// Operation identifier of an instruction.
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub enum Mnemonic {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<u8> for Mnemonic {
            type Error = $crate::errors::VmError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(Mnemonic::$name), )*
                    _ => Err($crate::errors::VmError::InvalidMnemonic {
                        opcode: value,
                        offset: 0,
                    }),
                }
            }
        }

        impl Mnemonic {
            /// Returns the assembly name for this mnemonic.
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $( Mnemonic::$name => $mnemonic, )*
                }
            }

            /// Looks a mnemonic up by its assembly name (case-sensitive).
            pub fn from_str(name: &str) -> Result<Self, $crate::errors::VmError> {
                match name {
                    $( $mnemonic => Ok(Mnemonic::$name), )*
                    _ => Err($crate::errors::VmError::UnknownMnemonic {
                        name: name.to_string(),
                    }),
                }
            }
        }
    };
}

for_each_mnemonic!(define_mnemonics);

/// A single condition flag bit.
///
/// The five user-visible flags are settable by CMP and usable in predicate
/// masks. NI is interpreter-internal: it controls whether IP auto-advances
/// after a step and never participates in predicate evaluation.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Condition {
    Eq = 1 << 0,
    Neq = 1 << 1,
    Lt = 1 << 2,
    Gt = 1 << 3,
    Hlt = 1 << 4,
    Ni = 1 << 5,
}

impl Condition {
    /// All flags in bit order, NI included.
    const ALL: [Condition; 6] = [
        Condition::Eq,
        Condition::Neq,
        Condition::Lt,
        Condition::Gt,
        Condition::Hlt,
        Condition::Ni,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Condition::Eq => "EQ",
            Condition::Neq => "NEQ",
            Condition::Lt => "LT",
            Condition::Gt => "GT",
            Condition::Hlt => "HLT",
            Condition::Ni => "NI",
        }
    }

    /// Looks a user-visible condition up by name. NI is deliberately not
    /// nameable in source.
    pub fn from_str(name: &str) -> Result<Self, VmError> {
        match name {
            "EQ" => Ok(Condition::Eq),
            "NEQ" => Ok(Condition::Neq),
            "LT" => Ok(Condition::Lt),
            "GT" => Ok(Condition::Gt),
            "HLT" => Ok(Condition::Hlt),
            _ => Err(VmError::UnknownCondition {
                name: name.to_string(),
            }),
        }
    }
}

/// A set of condition flags, stored as the low 6 bits of a byte.
///
/// Doubles as the predicate mask of an instruction and the flag state of the
/// machine (the low bits of the CD register).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Conditions(u8);

impl Conditions {
    /// The empty set: an instruction with no predicate always executes.
    pub const NONE: Conditions = Conditions(0);

    /// All six storable bits.
    const FIELD_MASK: u8 = 0b0011_1111;
    /// The five flags visible to predicates and CMP.
    const USER_MASK: u8 = 0b0001_1111;

    /// Builds a set from raw bits, discarding anything past the 6-bit field.
    pub const fn from_bits(bits: u8) -> Self {
        Conditions(bits & Self::FIELD_MASK)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, condition: Condition) -> bool {
        self.0 & condition as u8 != 0
    }

    /// True if every flag in `other` is also set in `self`.
    pub const fn contains_all(self, other: Conditions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, condition: Condition) {
        self.0 |= condition as u8;
    }

    /// Sets or clears a single flag.
    pub fn toggle(&mut self, condition: Condition, value: bool) {
        if value {
            self.0 |= condition as u8;
        } else {
            self.0 &= !(condition as u8);
        }
    }

    /// The user-visible subset, with NI masked out.
    pub const fn user(self) -> Conditions {
        Conditions(self.0 & Self::USER_MASK)
    }
}

impl std::fmt::Display for Conditions {
    /// Formats set flags dot-joined in bit order, e.g. `EQ.NEQ.HLT`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for condition in Condition::ALL {
            if self.contains(condition) {
                if !first {
                    write!(f, ".")?;
                }
                write!(f, "{}", condition.as_str())?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Number of machine registers.
pub const REGISTER_COUNT: usize = 16;

/// Stack pointer register index.
pub const SP: u8 = 13;
/// Instruction pointer register index.
pub const IP: u8 = 14;
/// Condition flags register index.
pub const CD: u8 = 15;

/// Assembly names of the registers, in index order.
pub const REGISTER_NAMES: [&str; REGISTER_COUNT] = [
    "R0", "R1", "R2", "R3", "R4", "R5", "R6", "R7", "R8", "R9", "R10", "R11", "R12", "SP", "IP",
    "CD",
];

/// Looks a register up by name, case-insensitively. Names match exactly; a
/// width suffix must be stripped by the caller first.
pub fn register_from_str(name: &str) -> Option<u8> {
    REGISTER_NAMES
        .iter()
        .position(|reg| reg.eq_ignore_ascii_case(name))
        .map(|id| id as u8)
}

/// True for the operand widths the format can express.
pub const fn is_valid_width(width: u8) -> bool {
    matches!(width, 1 | 2 | 4 | 8)
}
