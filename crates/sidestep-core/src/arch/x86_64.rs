//! x86-64 instruction decoding, register table and prologue simulation.

use super::{caller_registers, format_flags, le_i32, le_u64, read_code, CallerStack, Decoded, RegisterLayout, UnwindSignature, EFLAGS_BITS};
use crate::inferior::TargetAccess;
use crate::types::{Architecture, FrameStatus, RegisterId, SimpleStackFrame, TargetAddress};

pub const R15: usize = 0;
pub const R14: usize = 1;
pub const R13: usize = 2;
pub const R12: usize = 3;
pub const RBP: usize = 4;
pub const RBX: usize = 5;
pub const R11: usize = 6;
pub const R10: usize = 7;
pub const R9: usize = 8;
pub const R8: usize = 9;
pub const RAX: usize = 10;
pub const RCX: usize = 11;
pub const RDX: usize = 12;
pub const RSI: usize = 13;
pub const RDI: usize = 14;
pub const ORIG_RAX: usize = 15;
pub const RIP: usize = 16;
pub const CS: usize = 17;
pub const EFLAGS: usize = 18;
pub const RSP: usize = 19;
pub const SS: usize = 20;
pub const FS_BASE: usize = 21;
pub const GS_BASE: usize = 22;
pub const DS: usize = 23;
pub const ES: usize = 24;
pub const FS: usize = 25;
pub const GS: usize = 26;

/// Register table in Linux `user_regs_struct` order.
pub static LAYOUT: RegisterLayout = RegisterLayout {
    names: &[
        "R15", "R14", "R13", "R12", "RBP", "RBX", "R11", "R10", "R9", "R8", "RAX", "RCX", "RDX", "RSI", "RDI",
        "ORIG_RAX", "RIP", "CS", "EFLAGS", "RSP", "SS", "FS_BASE", "GS_BASE", "DS", "ES", "FS", "GS",
    ],
    sizes: &[8; 27],
    important: &[
        RAX, RBX, RCX, RDX, RSI, RDI, RBP, RSP, R8, R9, R10, R11, R12, R13, R14, R15, RIP, EFLAGS,
    ],
    pc: RIP,
    sp: RSP,
    fp: RBP,
    flags: EFLAGS,
    caller_saved: &[RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11, EFLAGS],
    runtime: &[
        RAX, RCX, RDX, RBX, RSP, RBP, RSI, RDI, R8, R9, R10, R11, R12, R13, R14, R15,
    ],
    dwarf: &[
        (0, RAX),
        (1, RDX),
        (2, RCX),
        (3, RBX),
        (4, RSI),
        (5, RDI),
        (6, RBP),
        (7, RSP),
        (8, R8),
        (9, R9),
        (10, R10),
        (11, R11),
        (12, R12),
        (13, R13),
        (14, R14),
        (15, R15),
        (16, RIP),
        (49, EFLAGS),
    ],
};

const WORD: u64 = 8;

pub(crate) fn is_return_instruction(memory: &dyn TargetAccess, address: TargetAddress) -> bool
{
    match memory.read_byte(address) {
        Ok(0xc3 | 0xc2) => true,
        // rep ret
        Ok(0xf3) => matches!(memory.read_byte(address + 1), Ok(0xc3)),
        _ => false,
    }
}

pub(crate) fn get_call_target(memory: &dyn TargetAccess, address: TargetAddress) -> Option<Decoded>
{
    let code = read_code(memory, address, 8)?;
    if code.first() == Some(&0xe8) {
        let displacement = le_i32(&code, 1)?;
        return Some(Decoded {
            target: address.offset(5 + i64::from(displacement)),
            size: 5,
        });
    }
    decode_indirect(memory, address, &code, 2)
}

pub(crate) fn get_jump_target(memory: &dyn TargetAccess, address: TargetAddress) -> Option<Decoded>
{
    let code = read_code(memory, address, 8)?;
    decode_indirect(memory, address, &code, 4)
}

/// Decode `[rex] ff /opcode`.
///
/// Only a plain `0x41` (REX.B) prefix is accepted; it selects r8 to r15 as the
/// base register. `mod == 0, rm == 5` is RIP-relative, which covers both
/// `call *foo@GOTPCREL(%rip)` and the PLT's `jmp *disp(%rip)`.
fn decode_indirect(memory: &dyn TargetAccess, address: TargetAddress, code: &[u8], opcode: u8) -> Option<Decoded>
{
    let (prefix, extended) = match code.first()? {
        0x41 => (1, true),
        _ => (0, false),
    };
    if *code.get(prefix)? != 0xff {
        return None;
    }
    let modrm = *code.get(prefix + 1)?;
    if (modrm >> 3) & 7 != opcode {
        return None;
    }
    let mode = modrm >> 6;
    let rm = usize::from(modrm & 7);
    if rm == 4 && mode != 3 {
        return None;
    }

    let base = || -> Option<u64> {
        let registers = memory.get_registers().ok()?;
        let runtime = rm + if extended { 8 } else { 0 };
        registers.value(RegisterId::Index(LAYOUT.runtime[runtime]))
    };
    let domain = address.domain();
    let operand = prefix + 2;

    let (slot, size) = match mode {
        0 if rm == 5 => {
            let size = operand + 4;
            let displacement = le_i32(code, operand)?;
            (address.offset(size as i64 + i64::from(displacement)), size)
        }
        0 => (TargetAddress::new(domain, base()?), operand),
        1 => {
            let displacement = i64::from(*code.get(operand)? as i8);
            (TargetAddress::new(domain, base()?).offset(displacement), operand + 1)
        }
        2 => {
            let displacement = i64::from(le_i32(code, operand)?);
            (TargetAddress::new(domain, base()?).offset(displacement), operand + 4)
        }
        _ => {
            let target = TargetAddress::new(domain, base()?);
            return Some(Decoded { target, size: operand });
        }
    };

    let target = memory.read_address(slot).ok()?;
    (!target.is_null()).then_some(Decoded { target, size })
}

/// Match the specific trampoline `movabs $method, %r11; jmp generic`.
pub(crate) fn match_trampoline(
    memory: &dyn TargetAccess,
    stub: TargetAddress,
    generic_trampoline: TargetAddress,
) -> Option<TargetAddress>
{
    let code = memory.read_buffer(stub, 15).ok()?;
    if code.get(..2) != Some(&[0x49, 0xbb][..]) || code.get(10) != Some(&0xe9) {
        return None;
    }
    let method = le_u64(&code, 2)?;
    let destination = stub.offset(15 + i64::from(le_i32(&code, 11)?));
    if destination != generic_trampoline {
        return None;
    }
    Some(TargetAddress::new(stub.domain(), method))
}

/// Simulate `push %rbp; mov %rsp,%rbp; push <callee-saved>*`.
pub(crate) fn unwind_prologue(
    frame: &SimpleStackFrame,
    memory: &dyn TargetAccess,
    code: &[u8],
    code_offset: usize,
) -> Option<SimpleStackFrame>
{
    if code.first() != Some(&0x55) {
        return None;
    }
    let sp = frame.stack_pointer;
    let mut registers = caller_registers(&frame.registers, &LAYOUT);

    if code_offset == 0 {
        let return_address = memory.read_address(sp).ok()?;
        registers.set_from_memory(RegisterId::Pc, return_address.value(), sp).ok()?;
        registers.set(RegisterId::Sp, (sp + WORD).value()).ok()?;
        return Some(frame.caller(registers, FrameStatus::Prologue));
    }

    let mov = code.get(1..4)?;
    if mov != [0x48, 0x89, 0xe5] && mov != [0x48, 0x8b, 0xec] {
        return None;
    }

    if code_offset <= 3 {
        let saved_fp = memory.read_address(sp).ok()?;
        let return_address = memory.read_address(sp + WORD).ok()?;
        registers.set_from_memory(RegisterId::Fp, saved_fp.value(), sp).ok()?;
        registers.set_from_memory(RegisterId::Pc, return_address.value(), sp + WORD).ok()?;
        registers.set(RegisterId::Sp, (sp + 2 * WORD).value()).ok()?;
        return Some(frame.caller(registers, FrameStatus::Prologue));
    }

    let fp = frame.frame_address;
    let mut position = 4;
    let mut saved = 0;
    while position < code_offset {
        let (slot, length) = match (code.get(position), code.get(position + 1)) {
            (Some(0x53), _) => (RBX, 1),
            (Some(0x41), Some(0x54)) => (R12, 2),
            (Some(0x41), Some(0x55)) => (R13, 2),
            (Some(0x41), Some(0x56)) => (R14, 2),
            (Some(0x41), Some(0x57)) => (R15, 2),
            _ => break,
        };
        if position + length > code_offset {
            break;
        }
        saved += 1;
        let location = fp - WORD * saved;
        let value = memory.read_address(location).ok()?;
        registers.set_from_memory(RegisterId::Index(slot), value.value(), location).ok()?;
        position += length;
    }

    let saved_fp = memory.read_address(fp).ok()?;
    let return_address = memory.read_address(fp + WORD).ok()?;
    if return_address.is_null() {
        return None;
    }
    registers.set_from_memory(RegisterId::Fp, saved_fp.value(), fp).ok()?;
    registers.set_from_memory(RegisterId::Pc, return_address.value(), fp + WORD).ok()?;
    registers.set(RegisterId::Sp, (fp + 2 * WORD).value()).ok()?;
    Some(frame.caller(registers, FrameStatus::Prologue))
}

/// Signal-return stub of glibc's x86-64 port.
pub(crate) fn default_signatures() -> Vec<UnwindSignature>
{
    // __restore_rt: mov $0xf,%rax; syscall. The ucontext sits at sp, so the
    // interrupted rip/rbp/rsp are fixed offsets into its mcontext.
    vec![UnwindSignature {
        name: "__restore_rt".to_string(),
        architecture: Architecture::X86_64,
        pattern: vec![0x48, 0xc7, 0xc0, 0x0f, 0x00, 0x00, 0x00, 0x0f, 0x05],
        pattern_offset: 0,
        return_address_slot: 168,
        frame_pointer_slot: Some(120),
        caller_stack: CallerStack::Slot(160),
    }]
}

pub(crate) fn print_register(index: usize, value: u64) -> String
{
    match index {
        EFLAGS => format_flags(value, EFLAGS_BITS),
        _ => format!("{value:016x}"),
    }
}
