//! 32-bit PowerPC (SysV ABI) instruction decoding and back-chain unwinding.
//!
//! Instructions are fixed 4-byte big-endian words; every decoded control
//! transfer therefore has size 4.

use super::{caller_registers, format_flags, Decoded, RegisterLayout};
use crate::inferior::TargetAccess;
use crate::types::{FrameStatus, RegisterId, SimpleStackFrame, TargetAddress};

/// Stack pointer (`r1`).
pub const R1: usize = 1;
/// Frame pointer by convention (`r31`).
pub const R31: usize = 31;
pub const PC: usize = 32;
pub const MSR: usize = 33;
pub const CR: usize = 34;
pub const LR: usize = 35;
pub const CTR: usize = 36;
pub const XER: usize = 37;

pub static LAYOUT: RegisterLayout = RegisterLayout {
    names: &[
        "R0", "R1", "R2", "R3", "R4", "R5", "R6", "R7", "R8", "R9", "R10", "R11", "R12", "R13", "R14", "R15", "R16",
        "R17", "R18", "R19", "R20", "R21", "R22", "R23", "R24", "R25", "R26", "R27", "R28", "R29", "R30", "R31", "PC",
        "MSR", "CR", "LR", "CTR", "XER",
    ],
    sizes: &[4; 38],
    important: &[
        0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29,
        30, 31, PC, CR, LR, CTR, XER,
    ],
    pc: PC,
    sp: R1,
    fp: R31,
    flags: CR,
    caller_saved: &[0, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, LR, CTR, XER],
    runtime: &[
        0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29,
        30, 31,
    ],
    dwarf: &[
        (0, 0),
        (1, 1),
        (2, 2),
        (3, 3),
        (4, 4),
        (5, 5),
        (6, 6),
        (7, 7),
        (8, 8),
        (9, 9),
        (10, 10),
        (11, 11),
        (12, 12),
        (13, 13),
        (14, 14),
        (15, 15),
        (16, 16),
        (17, 17),
        (18, 18),
        (19, 19),
        (20, 20),
        (21, 21),
        (22, 22),
        (23, 23),
        (24, 24),
        (25, 25),
        (26, 26),
        (27, 27),
        (28, 28),
        (29, 29),
        (30, 30),
        (31, 31),
        (64, CR),
        (65, LR),
        (66, CTR),
        (76, XER),
    ],
};

const BLR: u32 = 0x4e80_0020;
const BCTR: u32 = 0x4e80_0420;
const BCTRL: u32 = 0x4e80_0421;
const MFLR_R0: u32 = 0x7c08_02a6;

/// Condition register field 0, numbered from the least significant bit.
const CR0_BITS: &[(u32, &str)] = &[(31, "LT"), (30, "GT"), (29, "EQ"), (28, "SO")];
const XER_BITS: &[(u32, &str)] = &[(31, "SO"), (30, "OV"), (29, "CA")];

fn read_word(memory: &dyn TargetAccess, address: TargetAddress) -> Option<u32>
{
    memory.read_integer(address).ok().map(|word| word as u32)
}

/// Target of an I-form branch (`b`, `bl`, `ba`, `bla`).
fn branch_target(word: u32, address: TargetAddress) -> TargetAddress
{
    // Sign-extend the 24-bit word displacement (LI || 0b00).
    let displacement = (((word & 0x03ff_fffc) << 6) as i32) >> 6;
    if word & 2 != 0 {
        address.with_value(u64::from(displacement as u32))
    } else {
        address.offset(i64::from(displacement))
    }
}

fn count_register(memory: &dyn TargetAccess, address: TargetAddress) -> Option<TargetAddress>
{
    let registers = memory.get_registers().ok()?;
    let value = registers.value(RegisterId::Index(CTR))?;
    (value != 0).then(|| address.with_value(value))
}

pub(crate) fn is_return_instruction(memory: &dyn TargetAccess, address: TargetAddress) -> bool
{
    read_word(memory, address) == Some(BLR)
}

pub(crate) fn get_call_target(memory: &dyn TargetAccess, address: TargetAddress) -> Option<Decoded>
{
    let word = read_word(memory, address)?;
    let target = if word >> 26 == 18 && word & 1 == 1 {
        branch_target(word, address)
    } else if word == BCTRL {
        count_register(memory, address)?
    } else {
        return None;
    };
    Some(Decoded { target, size: 4 })
}

pub(crate) fn get_jump_target(memory: &dyn TargetAccess, address: TargetAddress) -> Option<Decoded>
{
    let word = read_word(memory, address)?;
    let target = if word >> 26 == 18 && word & 1 == 0 {
        branch_target(word, address)
    } else if word == BCTR {
        count_register(memory, address)?
    } else {
        return None;
    };
    Some(Decoded { target, size: 4 })
}

/// Match `lis r0,hi; ori r0,r0,lo; b generic`.
pub(crate) fn match_trampoline(
    memory: &dyn TargetAccess,
    stub: TargetAddress,
    generic_trampoline: TargetAddress,
) -> Option<TargetAddress>
{
    let lis = read_word(memory, stub)?;
    let ori = read_word(memory, stub + 4)?;
    let branch = read_word(memory, stub + 8)?;
    if lis & 0xffff_0000 != 0x3c00_0000 || ori & 0xffff_0000 != 0x6000_0000 {
        return None;
    }
    if branch >> 26 != 18 || branch & 3 != 0 {
        return None;
    }
    if branch_target(branch, stub + 8) != generic_trampoline {
        return None;
    }
    let method = ((lis & 0xffff) << 16) | (ori & 0xffff);
    Some(stub.with_value(u64::from(method)))
}

/// Simulate `mflr r0; stwu r1,-N(r1); stw r0,N+4(r1)`.
pub(crate) fn unwind_prologue(
    frame: &SimpleStackFrame,
    memory: &dyn TargetAccess,
    code: &[u8],
    code_offset: usize,
) -> Option<SimpleStackFrame>
{
    let word = |index: usize| -> Option<u32> {
        let bytes: [u8; 4] = code.get(index * 4..index * 4 + 4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    };
    if word(0)? != MFLR_R0 || word(1)? >> 16 != 0x9421 || word(2)? >> 16 != 0x9001 {
        return None;
    }

    let sp = frame.stack_pointer;
    let mut registers = caller_registers(&frame.registers, &LAYOUT);

    // Until `stw r0` has run the return address is still in the link register.
    if code_offset < 12 {
        let return_address = frame.registers.value(RegisterId::Index(LR))?;
        let caller_sp = if code_offset < 8 {
            sp
        } else {
            memory.read_address(sp).ok()?
        };
        registers.set(RegisterId::Pc, return_address).ok()?;
        registers.set(RegisterId::Sp, caller_sp.value()).ok()?;
        return Some(frame.caller(registers, FrameStatus::Prologue));
    }

    back_chain(frame, memory).map(|mut caller| {
        caller.status = FrameStatus::Prologue;
        caller
    })
}

/// Follow the ABI back chain: `[sp]` is the caller's stack pointer and the
/// caller's LR save word at `caller_sp + 4` holds the return address.
pub(crate) fn back_chain(frame: &SimpleStackFrame, memory: &dyn TargetAccess) -> Option<SimpleStackFrame>
{
    let sp = frame.stack_pointer;
    if sp.is_null() {
        return None;
    }
    let caller_sp = memory.read_address(sp).ok()?;
    if caller_sp.is_null() || caller_sp <= sp {
        return None;
    }
    let slot = caller_sp + 4;
    let return_address = memory.read_address(slot).ok()?;
    if return_address.is_null() {
        return None;
    }

    let mut registers = caller_registers(&frame.registers, &LAYOUT);
    registers.set_from_memory(RegisterId::Pc, return_address.value(), slot).ok()?;
    registers.set_from_memory(RegisterId::Sp, caller_sp.value(), sp).ok()?;
    Some(frame.caller(registers, FrameStatus::FramePointer))
}

pub(crate) fn print_register(index: usize, value: u64) -> String
{
    match index {
        CR => format!("{value:08x} {}", format_flags(value, CR0_BITS)),
        XER => format!("{value:08x} {}", format_flags(value, XER_BITS)),
        _ => format!("{value:08x}"),
    }
}
