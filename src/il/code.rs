//! Instruction record encoding and decoding.
//!
//! A record is a fixed 2-byte header followed by its operand records with no
//! padding. The header is a little-endian u16 packing:
//!
//! - bits 0-7: mnemonic opcode
//! - bits 8-13: predicate mask
//! - bits 14-15: operand count
//!
//! A record's total size is never stored. [`Code::decode`] recomputes it by
//! walking the operand records from the start of the instruction, which is
//! also the only way to reach operand *k*: operands are not independently
//! addressable.

use crate::errors::VmError;
use crate::il::isa::{Conditions, Mnemonic};
use crate::il::operand::Operand;

/// Encoded size of the instruction header.
pub const CODE_HEADER_SIZE: usize = 2;

/// Maximum operands one record can carry (2-bit count field).
pub const MAX_OPERANDS: usize = 3;

/// Encodes one instruction record.
///
/// Fails with [`VmError::TooManyOperands`] before emitting anything if
/// `operands` exceeds [`MAX_OPERANDS`].
pub fn encode(
    mnemonic: Mnemonic,
    conditions: Conditions,
    operands: &[Operand],
) -> Result<Vec<u8>, VmError> {
    let mut out = Vec::new();
    encode_into(&mut out, mnemonic, conditions, operands)?;
    Ok(out)
}

/// Appends one encoded instruction record to `out`.
pub fn encode_into(
    out: &mut Vec<u8>,
    mnemonic: Mnemonic,
    conditions: Conditions,
    operands: &[Operand],
) -> Result<(), VmError> {
    if operands.len() > MAX_OPERANDS {
        return Err(VmError::TooManyOperands {
            mnemonic: mnemonic.as_str(),
            count: operands.len(),
        });
    }

    let header = mnemonic as u16
        | ((conditions.bits() as u16) << 8)
        | ((operands.len() as u16) << 14);
    out.extend_from_slice(&header.to_le_bytes());

    for operand in operands {
        operand.encode_into(out);
    }
    Ok(())
}

/// A decoded instruction record.
///
/// Decoding walks every operand record once; afterwards the operands and the
/// total size are available without touching the code buffer again, so the
/// interpreter holds no borrow while handlers mutate machine state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Code {
    mnemonic: Mnemonic,
    conditions: Conditions,
    operands: Vec<Operand>,
    size: usize,
}

impl Code {
    /// Decodes the instruction record starting at `offset`.
    ///
    /// Fails with [`VmError::UnexpectedEndOfCode`] if the buffer ends inside
    /// the header, [`VmError::InvalidMnemonic`] if the opcode is outside the
    /// known range (the well-formedness check that runs before dispatch), and
    /// [`VmError::MalformedOperand`] if an operand record is corrupt.
    pub fn decode(bytes: &[u8], offset: usize) -> Result<Self, VmError> {
        let header = offset
            .checked_add(CODE_HEADER_SIZE)
            .and_then(|end| bytes.get(offset..end))
            .ok_or(VmError::UnexpectedEndOfCode {
                offset,
                requested: CODE_HEADER_SIZE,
                available: bytes.len().saturating_sub(offset),
            })?;
        let header = u16::from_le_bytes([header[0], header[1]]);

        let opcode = (header & 0xFF) as u8;
        let mnemonic =
            Mnemonic::try_from(opcode).map_err(|_| VmError::InvalidMnemonic { opcode, offset })?;
        let conditions = Conditions::from_bits(((header >> 8) & 0x3F) as u8);
        let operand_count = (header >> 14) as usize;

        let mut operands = Vec::with_capacity(operand_count);
        let mut cursor = offset + CODE_HEADER_SIZE;
        for _ in 0..operand_count {
            let (operand, consumed) = Operand::decode(bytes, cursor)?;
            operands.push(operand);
            cursor += consumed;
        }

        Ok(Code {
            mnemonic,
            conditions,
            operands,
            size: cursor - offset,
        })
    }

    pub fn mnemonic(&self) -> Mnemonic {
        self.mnemonic
    }

    pub fn conditions(&self) -> Conditions {
        self.conditions
    }

    pub fn operand_count(&self) -> u8 {
        self.operands.len() as u8
    }

    /// Returns operand `index`, failing if the record has fewer operands.
    pub fn operand(&self, index: u8) -> Result<&Operand, VmError> {
        self.operands
            .get(index as usize)
            .ok_or(VmError::OperandIndexOutOfRange {
                index,
                count: self.operands.len() as u8,
            })
    }

    /// Total encoded size: header plus the sum of the operand sizes. A
    /// zero-operand record still occupies the header size.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl std::fmt::Display for Code {
    /// Formats the record in assembly syntax, e.g. `SET(EQ) R0.4, 002a`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mnemonic.as_str())?;
        if !self.conditions.is_empty() {
            write!(f, "({})", self.conditions)?;
        }
        for (index, operand) in self.operands.iter().enumerate() {
            if index == 0 {
                write!(f, " {operand}")?;
            } else {
                write!(f, ", {operand}")?;
            }
        }
        Ok(())
    }
}
