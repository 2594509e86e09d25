//! Assembly language parser and two-pass assembler.
//!
//! Converts human-readable IL assembly into the flat encoded byte stream the
//! machine executes.
//!
//! # Syntax
//!
//! ```text
//! @loop                          # location label for the next instruction
//! MNEMONIC(COND1.COND2) op1, op2 # optional comment
//! ```
//!
//! - Mnemonics are uppercase (e.g., `SET`, `BRANCH`)
//! - A predicate is a dot-separated condition list in parentheses directly
//!   after the mnemonic (e.g., `BRANCH(EQ.GT) @done`)
//! - Registers are `R0`-`R12`, `SP`, `IP`, `CD` (case-insensitive), with an
//!   optional `.N` width suffix, N in {1, 2, 4, 8}; default width is 8
//! - Immediates are decimal (optionally negative), `0x` hex or `0b` binary
//!   literals, auto-sized to the smallest of {1, 2, 4, 8} bytes that holds
//!   the value
//! - Location references are written `@name`
//! - Comments start with `#`
//!
//! # Assembly
//!
//! Pass 1 lays every instruction out at its final offset, encoding each
//! location reference as an 8-byte zero immediate and recording a fixup.
//! Pass 2 resolves each fixup by linear scan over the instruction list
//! (first location match wins) and patches the start-relative displacement
//! in place. Displacements are always 8 bytes wide, so relocation can never
//! change the layout pass 1 computed.

use crate::errors::VmError;
use crate::il::code::{self, CODE_HEADER_SIZE};
use crate::il::isa::{register_from_str, Condition, Conditions, Mnemonic, is_valid_width};
use crate::il::operand::{Operand, OPERAND_HEADER_SIZE};
use std::fs;
use std::path::Path;

const COMMENT_CHAR: char = '#';
const LOCATION_PREFIX: char = '@';
const LOCATION_SUFFIX: char = ':';

/// Every location reference is encoded at this fixed width so that patching
/// a resolved displacement never resizes an instruction.
const DISPLACEMENT_WIDTH: u8 = 8;

/// An operand as parsed from source, before encoding.
///
/// `Location` exists only on this side of the assembler: it is replaced by
/// an 8-byte relative displacement during assembly and never reaches the
/// binary form directly.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AsmOperand {
    Register { id: u8, width: u8 },
    Immediate { value: u64, width: u8 },
    Location(String),
}

/// One parsed instruction: location label, mnemonic, predicate and operands.
///
/// The location is synthesized from the source line number when no `@label`
/// precedes the instruction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceInstruction {
    pub location: String,
    pub mnemonic: Mnemonic,
    pub conditions: Conditions,
    pub operands: Vec<AsmOperand>,
}

/// Parses a register token like `r4`, `SP`, `r0.2`.
///
/// Returns `None` when the token does not start with a register name, so the
/// caller can fall through to immediate parsing.
fn parse_register(token: &str) -> Option<Result<(u8, u8), VmError>> {
    let (name, suffix) = match token.split_once('.') {
        Some((name, suffix)) => (name, Some(suffix)),
        None => (token, None),
    };

    let id = register_from_str(name)?;

    let width = match suffix {
        None => 8,
        Some(suffix) => match suffix.parse::<u8>() {
            Ok(width) if is_valid_width(width) => width,
            Ok(width) => return Some(Err(VmError::InvalidOperandWidth { width })),
            Err(_) => {
                return Some(Err(VmError::InvalidRegister {
                    token: token.to_string(),
                }));
            }
        },
    };

    Some(Ok((id, width)))
}

/// Parses a numeric literal: decimal, `0x` hex or `0b` binary, with an
/// optional leading `-` (two's complement).
pub(crate) fn parse_immediate(token: &str) -> Result<u64, VmError> {
    let invalid = || VmError::InvalidImmediate {
        token: token.to_string(),
    };

    let (negative, body) = match token.strip_prefix('-') {
        Some(body) => (true, body),
        None => (false, token),
    };

    let value = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|_| invalid())?
    } else if let Some(bin) = body.strip_prefix("0b").or_else(|| body.strip_prefix("0B")) {
        u64::from_str_radix(bin, 2).map_err(|_| invalid())?
    } else {
        body.parse::<u64>().map_err(|_| invalid())?
    };

    Ok(if negative { value.wrapping_neg() } else { value })
}

/// The minimal-size rule: smallest of {1, 2, 4, 8} bytes that holds `value`.
pub(crate) fn immediate_width(value: u64) -> u8 {
    if value <= u8::MAX as u64 {
        1
    } else if value <= u16::MAX as u64 {
        2
    } else if value <= u32::MAX as u64 {
        4
    } else {
        8
    }
}

/// Parses one operand token: register, `@location` reference, or immediate.
fn parse_operand(token: &str) -> Result<AsmOperand, VmError> {
    if let Some(result) = parse_register(token) {
        let (id, width) = result?;
        return Ok(AsmOperand::Register { id, width });
    }

    if let Some(location) = token.strip_prefix(LOCATION_PREFIX) {
        return Ok(AsmOperand::Location(location.to_string()));
    }

    let value = parse_immediate(token)?;
    Ok(AsmOperand::Immediate {
        value,
        width: immediate_width(value),
    })
}

/// Parses one instruction line: mnemonic, optional condition list, operands.
fn parse_instruction_line(
    line: &str,
) -> Result<(Mnemonic, Conditions, Vec<AsmOperand>), VmError> {
    let mnemonic_end = line
        .find(|c: char| c == '(' || c.is_whitespace())
        .unwrap_or(line.len());
    let mnemonic = Mnemonic::from_str(&line[..mnemonic_end])?;
    let mut rest = line[mnemonic_end..].trim_start();

    let mut conditions = Conditions::NONE;
    if let Some(list) = rest.strip_prefix('(') {
        let end = list.find(')').ok_or_else(|| VmError::MalformedConditionList {
            token: line.to_string(),
        })?;
        for name in list[..end].split('.') {
            let name = name.trim();
            if !name.is_empty() {
                conditions.insert(Condition::from_str(name)?);
            }
        }
        rest = list[end + 1..].trim_start();
    }

    let mut operands = Vec::new();
    if !rest.is_empty() {
        for token in rest.split(',') {
            operands.push(parse_operand(token.trim())?);
        }
    }

    Ok((mnemonic, conditions, operands))
}

/// Parses assembly source into an instruction list.
///
/// `@label` lines attach a location to the next instruction; a label line may
/// carry a trailing `:`. Instructions without one get their 1-based source
/// line number as a synthesized location. Errors carry the source line.
pub fn parse_source(source: &str) -> Result<Vec<SourceInstruction>, VmError> {
    let mut instructions = Vec::new();
    let mut pending_location: Option<String> = None;

    for (index, raw_line) in source.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.split(COMMENT_CHAR).next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        if let Some(location) = line.strip_prefix(LOCATION_PREFIX) {
            let location = location.trim().trim_end_matches(LOCATION_SUFFIX);
            pending_location = Some(location.to_string());
            continue;
        }

        let (mnemonic, conditions, operands) =
            parse_instruction_line(line).map_err(|e| VmError::SyntaxError {
                line: line_no,
                source: e.to_string(),
            })?;

        let location = pending_location
            .take()
            .unwrap_or_else(|| line_no.to_string());

        instructions.push(SourceInstruction {
            location,
            mnemonic,
            conditions,
            operands,
        });
    }

    Ok(instructions)
}

/// A pending location reference recorded during the layout pass.
struct Fixup {
    /// Index of the referencing instruction in the input list.
    instruction_index: usize,
    /// Referenced label, resolved against instruction locations in pass 2.
    label: String,
    /// Absolute offset of the 8-byte placeholder payload in the output.
    patch_offset: usize,
}

/// Assembles a parsed instruction list into one contiguous byte stream.
///
/// Every location-reference operand ends up holding the start-relative
/// displacement `target_offset - referencing_offset` as an 8-byte immediate.
/// Fails with [`VmError::UnresolvedLabel`] if a referenced label matches no
/// instruction; nothing is returned on failure.
pub fn assemble(instructions: &[SourceInstruction]) -> Result<Vec<u8>, VmError> {
    let mut out = Vec::new();
    let mut offsets = Vec::with_capacity(instructions.len());
    let mut fixups: Vec<Fixup> = Vec::new();

    // Layout pass: every instruction encodes at its final offset.
    for (index, instruction) in instructions.iter().enumerate() {
        let start = out.len();
        offsets.push(start);

        let mut operands = Vec::with_capacity(instruction.operands.len());
        let mut operand_bytes = 0usize;
        for asm_operand in &instruction.operands {
            let operand = match asm_operand {
                AsmOperand::Register { id, width } => Operand::register(*id, *width)?,
                AsmOperand::Immediate { value, width } => Operand::immediate(*value, *width)?,
                AsmOperand::Location(label) => {
                    fixups.push(Fixup {
                        instruction_index: index,
                        label: label.clone(),
                        patch_offset: start
                            + CODE_HEADER_SIZE
                            + operand_bytes
                            + OPERAND_HEADER_SIZE,
                    });
                    Operand::immediate(0, DISPLACEMENT_WIDTH)?
                }
            };
            operand_bytes += operand.encoded_size();
            operands.push(operand);
        }

        code::encode_into(&mut out, instruction.mnemonic, instruction.conditions, &operands)?;
    }

    // Relocation pass: patch placeholders in place. Labels resolve by linear
    // scan; the first instruction carrying the location wins.
    for fixup in &fixups {
        let target_index = instructions
            .iter()
            .position(|instruction| instruction.location == fixup.label)
            .ok_or_else(|| VmError::UnresolvedLabel {
                label: fixup.label.clone(),
            })?;

        let displacement = offsets[target_index] as i64 - offsets[fixup.instruction_index] as i64;
        out[fixup.patch_offset..fixup.patch_offset + DISPLACEMENT_WIDTH as usize]
            .copy_from_slice(&(displacement as u64).to_le_bytes());
    }

    Ok(out)
}

/// Parses and assembles a full source string.
pub fn assemble_source(source: &str) -> Result<Vec<u8>, VmError> {
    let instructions = parse_source(source)?;
    assemble(&instructions)
}

/// Convenience: assemble directly from a file path.
pub fn assemble_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, VmError> {
    let path = path.as_ref();
    let source = fs::read_to_string(path).map_err(|e| VmError::IoError {
        path: path.display().to_string(),
        source: e.to_string(),
    })?;
    assemble_source(&source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::code::Code;

    // ==================== Operand parsing ====================

    #[test]
    fn parse_register_plain() {
        assert_eq!(parse_register("R0").unwrap().unwrap(), (0, 8));
        assert_eq!(parse_register("r12").unwrap().unwrap(), (12, 8));
        assert_eq!(parse_register("sp").unwrap().unwrap(), (13, 8));
        assert_eq!(parse_register("IP").unwrap().unwrap(), (14, 8));
        assert_eq!(parse_register("cd").unwrap().unwrap(), (15, 8));
    }

    #[test]
    fn parse_register_width_suffix() {
        assert_eq!(parse_register("R3.1").unwrap().unwrap(), (3, 1));
        assert_eq!(parse_register("r3.2").unwrap().unwrap(), (3, 2));
        assert_eq!(parse_register("R3.4").unwrap().unwrap(), (3, 4));
        assert_eq!(parse_register("R3.8").unwrap().unwrap(), (3, 8));
    }

    #[test]
    fn parse_register_distinguishes_r1_from_r10() {
        assert_eq!(parse_register("R1").unwrap().unwrap(), (1, 8));
        assert_eq!(parse_register("R10").unwrap().unwrap(), (10, 8));
        assert_eq!(parse_register("R10.4").unwrap().unwrap(), (10, 4));
    }

    #[test]
    fn parse_register_bad_width() {
        assert!(matches!(
            parse_register("R0.3").unwrap(),
            Err(VmError::InvalidOperandWidth { width: 3 })
        ));
        assert!(matches!(
            parse_register("R0.x").unwrap(),
            Err(VmError::InvalidRegister { .. })
        ));
    }

    #[test]
    fn parse_register_not_a_register() {
        assert!(parse_register("R13").is_none());
        assert!(parse_register("42").is_none());
        assert!(parse_register("@loop").is_none());
    }

    #[test]
    fn parse_immediate_radixes() {
        assert_eq!(parse_immediate("42").unwrap(), 42);
        assert_eq!(parse_immediate("0x2A").unwrap(), 0x2A);
        assert_eq!(parse_immediate("0XFF").unwrap(), 0xFF);
        assert_eq!(parse_immediate("0b1010").unwrap(), 0b1010);
        assert_eq!(parse_immediate("0B11").unwrap(), 3);
    }

    #[test]
    fn parse_immediate_negative_wraps() {
        assert_eq!(parse_immediate("-1").unwrap(), u64::MAX);
        assert_eq!(parse_immediate("-0x10").unwrap(), (-16i64) as u64);
    }

    #[test]
    fn parse_immediate_invalid() {
        for token in ["", "abc", "0x", "0xZZ", "0b2", "1.5", "--1"] {
            assert!(
                matches!(
                    parse_immediate(token),
                    Err(VmError::InvalidImmediate { .. })
                ),
                "expected failure for {token:?}"
            );
        }
    }

    #[test]
    fn immediate_width_minimal_size_rule() {
        assert_eq!(immediate_width(0), 1);
        assert_eq!(immediate_width(255), 1);
        assert_eq!(immediate_width(256), 2);
        assert_eq!(immediate_width(65535), 2);
        assert_eq!(immediate_width(65536), 4);
        assert_eq!(immediate_width(u32::MAX as u64), 4);
        assert_eq!(immediate_width(u32::MAX as u64 + 1), 8);
        assert_eq!(immediate_width(u64::MAX), 8);
    }

    // ==================== Line parsing ====================

    #[test]
    fn parse_source_simple_program() {
        let instructions = parse_source("SET R0, 5\nADD R0, 3\nHALT").unwrap();
        assert_eq!(instructions.len(), 3);
        assert_eq!(instructions[0].mnemonic, Mnemonic::Set);
        assert_eq!(
            instructions[0].operands,
            vec![
                AsmOperand::Register { id: 0, width: 8 },
                AsmOperand::Immediate { value: 5, width: 1 },
            ]
        );
        assert_eq!(instructions[2].mnemonic, Mnemonic::Halt);
        assert!(instructions[2].operands.is_empty());
    }

    #[test]
    fn parse_source_conditions() {
        let instructions = parse_source("BRANCH(EQ.GT) @done").unwrap();
        let mut expected = Conditions::NONE;
        expected.insert(Condition::Eq);
        expected.insert(Condition::Gt);
        assert_eq!(instructions[0].conditions, expected);
        assert_eq!(
            instructions[0].operands,
            vec![AsmOperand::Location("done".to_string())]
        );
    }

    #[test]
    fn parse_source_label_attaches_to_next_instruction() {
        let instructions = parse_source("@loop\nADD R0, 1\nBRANCH @loop").unwrap();
        assert_eq!(instructions[0].location, "loop");
        // Unlabeled instructions get their line number.
        assert_eq!(instructions[1].location, "3");
    }

    #[test]
    fn parse_source_label_with_colon_suffix() {
        let instructions = parse_source("@loop:\nHALT").unwrap();
        assert_eq!(instructions[0].location, "loop");
    }

    #[test]
    fn parse_source_comments_and_blank_lines() {
        let source = "# a comment\n\nSET R0, 1 # trailing comment\n   \nHALT";
        let instructions = parse_source(source).unwrap();
        assert_eq!(instructions.len(), 2);
    }

    #[test]
    fn parse_source_unknown_mnemonic_reports_line() {
        let err = parse_source("HALT\nFROB R0").unwrap_err();
        assert!(matches!(
            err,
            VmError::SyntaxError { line: 2, ref source } if source.contains("unknown mnemonic")
        ));
    }

    #[test]
    fn parse_source_unknown_condition_reports_line() {
        let err = parse_source("SET(XY) R0, 1").unwrap_err();
        assert!(matches!(
            err,
            VmError::SyntaxError { line: 1, ref source } if source.contains("unknown condition")
        ));
    }

    #[test]
    fn parse_source_unterminated_condition_list() {
        let err = parse_source("SET(EQ R0, 1").unwrap_err();
        assert!(matches!(
            err,
            VmError::SyntaxError { line: 1, ref source } if source.contains("condition list")
        ));
    }

    #[test]
    fn parse_source_bad_immediate_reports_line() {
        let err = parse_source("HALT\nHALT\nSET R0, 12abc").unwrap_err();
        assert!(matches!(
            err,
            VmError::SyntaxError { line: 3, ref source } if source.contains("invalid immediate")
        ));
    }

    // ==================== Assembly ====================

    #[test]
    fn assemble_empty_source() {
        assert!(assemble_source("").unwrap().is_empty());
    }

    #[test]
    fn assemble_single_instruction_layout() {
        // SET R0, 5: header(2) + register(2) + imm8(2) = 6 bytes
        let bytes = assemble_source("SET R0, 5").unwrap();
        assert_eq!(bytes.len(), 6);

        let code = Code::decode(&bytes, 0).unwrap();
        assert_eq!(code.mnemonic(), Mnemonic::Set);
        assert_eq!(code.operand_count(), 2);
        assert_eq!(
            *code.operand(1).unwrap(),
            Operand::Immediate { value: 5, width: 1 }
        );
    }

    #[test]
    fn assemble_is_deterministic() {
        let source = "@start\nSET R0, 5\nCMP R0, 5\nBRANCH(NEQ) @start\nHALT";
        let first = assemble_source(source).unwrap();
        let second = assemble_source(source).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn assemble_backward_reference_displacement() {
        // Offsets: SET@0 (6 bytes), ADD@6 (6 bytes), BRANCH@12.
        // Displacement = 6 - 12 = -6, stored at offset 12 + 2 + 1.
        let bytes = assemble_source("SET R0, 1\n@loop\nADD R0, 1\nBRANCH @loop").unwrap();
        assert_eq!(bytes.len(), 12 + 2 + 1 + 8);

        let patched = i64::from_le_bytes(bytes[15..23].try_into().unwrap());
        assert_eq!(patched, -6);

        let branch = Code::decode(&bytes, 12).unwrap();
        assert_eq!(
            *branch.operand(0).unwrap(),
            Operand::Immediate {
                value: (-6i64) as u64,
                width: 8
            }
        );
    }

    #[test]
    fn assemble_forward_reference_displacement() {
        // BRANCH@0 (11 bytes), HALT@11 (2 bytes), HALT@13 (target).
        let bytes = assemble_source("BRANCH @end\nHALT\n@end\nHALT").unwrap();
        let branch = Code::decode(&bytes, 0).unwrap();
        assert_eq!(
            *branch.operand(0).unwrap(),
            Operand::Immediate { value: 13, width: 8 }
        );
    }

    #[test]
    fn assemble_self_reference_is_zero() {
        let bytes = assemble_source("@loop\nBRANCH @loop").unwrap();
        let branch = Code::decode(&bytes, 0).unwrap();
        assert_eq!(
            *branch.operand(0).unwrap(),
            Operand::Immediate { value: 0, width: 8 }
        );
    }

    #[test]
    fn assemble_duplicate_label_first_match_wins() {
        // Both instructions claim @dup; scan order resolves to the first.
        let bytes = assemble_source("@dup\nHALT\n@dup\nHALT\nBRANCH @dup").unwrap();
        let branch = Code::decode(&bytes, 4).unwrap();
        assert_eq!(
            *branch.operand(0).unwrap(),
            Operand::Immediate {
                value: (-4i64) as u64,
                width: 8
            }
        );
    }

    #[test]
    fn assemble_unresolved_label() {
        let err = assemble_source("BRANCH @missing").unwrap_err();
        assert!(matches!(
            err,
            VmError::UnresolvedLabel { ref label } if label == "missing"
        ));
    }

    #[test]
    fn assemble_too_many_operands() {
        let instruction = SourceInstruction {
            location: "1".to_string(),
            mnemonic: Mnemonic::Set,
            conditions: Conditions::NONE,
            operands: vec![AsmOperand::Immediate { value: 0, width: 1 }; 4],
        };
        let err = assemble(&[instruction]).unwrap_err();
        assert!(matches!(
            err,
            VmError::TooManyOperands {
                mnemonic: "SET",
                count: 4
            }
        ));
    }

    #[test]
    fn assemble_location_reference_in_second_operand_slot() {
        // The fixup offset must account for the first operand's size.
        let bytes = assemble_source("@target\nSET R1, @target").unwrap();
        let code = Code::decode(&bytes, 0).unwrap();
        assert_eq!(
            *code.operand(1).unwrap(),
            Operand::Immediate { value: 0, width: 8 }
        );
    }

    #[test]
    fn assemble_conditions_survive_encoding() {
        let bytes = assemble_source("HALT\n@x\nBRANCH(EQ.LT) @x").unwrap();
        let branch = Code::decode(&bytes, 2).unwrap();
        assert!(branch.conditions().contains(Condition::Eq));
        assert!(branch.conditions().contains(Condition::Lt));
        assert!(!branch.conditions().contains(Condition::Gt));
    }

    #[test]
    fn assemble_register_width_suffix_encodes() {
        let bytes = assemble_source("PUSH R2.4").unwrap();
        let code = Code::decode(&bytes, 0).unwrap();
        assert_eq!(
            *code.operand(0).unwrap(),
            Operand::Register { id: 2, width: 4 }
        );
    }
}
