use ilvm_derive::Error;

/// Errors that can occur while parsing, assembling or executing IL programs.
#[derive(Debug, Error)]
pub enum VmError {
    /// Unrecognized instruction mnemonic during parsing.
    #[error("unknown mnemonic: {name}")]
    UnknownMnemonic { name: String },
    /// Unrecognized condition name inside a predicate list.
    #[error("unknown condition: {name}")]
    UnknownCondition { name: String },
    /// Register token malformed (bad name or bad width suffix).
    #[error("invalid register token: {token}")]
    InvalidRegister { token: String },
    /// Numeric literal malformed.
    #[error("invalid immediate: {token}")]
    InvalidImmediate { token: String },
    /// Operand width outside {1, 2, 4, 8}.
    #[error("invalid operand width: {width}")]
    InvalidOperandWidth { width: u8 },
    /// Register index exceeds the register file size.
    #[error("register index {index} out of bounds")]
    InvalidRegisterIndex { index: u8 },
    /// Condition list opened with `(` but never closed.
    #[error("malformed condition list in: {token}")]
    MalformedConditionList { token: String },
    /// Parse error with source line context.
    #[error("line {line}: {source}")]
    SyntaxError { line: usize, source: String },

    /// A location reference names a label no instruction carries.
    #[error("unresolved label: @{label}")]
    UnresolvedLabel { label: String },
    /// An instruction would encode more operands than the format allows.
    #[error("{mnemonic} has {count} operands, the encoding allows at most 3")]
    TooManyOperands { mnemonic: &'static str, count: usize },

    /// Unknown opcode encountered in the code buffer.
    #[error("invalid mnemonic {opcode:#04x} at offset {offset:#x}")]
    InvalidMnemonic { opcode: u8, offset: usize },
    /// Operand record with an unrecognized tag or inconsistent payload.
    #[error("malformed operand at offset {offset:#x}")]
    MalformedOperand { offset: usize },
    /// The code buffer ended in the middle of an instruction record.
    #[error("code ended at offset {offset:#x} while reading {requested} bytes ({available} available)")]
    UnexpectedEndOfCode {
        offset: usize,
        requested: usize,
        available: usize,
    },

    /// Wrong number of operands for an instruction.
    #[error("{instruction} expects {expected} operands, got {actual}")]
    OperandCountMismatch {
        instruction: &'static str,
        expected: usize,
        actual: usize,
    },
    /// An operand that must be a register is an immediate.
    #[error("{instruction} expects operand {index} to be a register")]
    ExpectedRegisterOperand {
        instruction: &'static str,
        index: u8,
    },
    /// Operand index past the instruction's operand count.
    #[error("operand index {index} out of range (instruction has {count})")]
    OperandIndexOutOfRange { index: u8, count: u8 },
    /// Data memory access outside the owned memory region.
    #[error("memory access of {size} bytes at address {address:#x} out of bounds (memory size {memory_size})")]
    MemoryOutOfBounds {
        address: u64,
        size: usize,
        memory_size: usize,
    },
    /// Push would move SP below the bottom of the memory region.
    #[error("stack overflow: push of {size} bytes with sp = {sp:#x}")]
    StackOverflow { sp: u64, size: usize },
    /// Pop would move SP past the top of the memory region.
    #[error("stack underflow: pop of {size} bytes with sp = {sp:#x}")]
    StackUnderflow { sp: u64, size: usize },

    /// The machine executed its maximum number of steps without halting.
    #[error("step limit of {limit} exceeded")]
    StepLimitExceeded { limit: u64 },

    /// File I/O error at the CLI boundary.
    #[error("io error on {path}: {source}")]
    IoError { path: String, source: String },
}
