//! IA-32 instruction decoding, register table and prologue simulation.

use super::{caller_registers, format_flags, le_i32, read_code, CallerStack, Decoded, RegisterLayout, UnwindSignature, EFLAGS_BITS};
use crate::inferior::TargetAccess;
use crate::types::{Architecture, FrameStatus, RegisterId, SimpleStackFrame, TargetAddress};

pub const EBX: usize = 0;
pub const ECX: usize = 1;
pub const EDX: usize = 2;
pub const ESI: usize = 3;
pub const EDI: usize = 4;
pub const EBP: usize = 5;
pub const EAX: usize = 6;
pub const DS: usize = 7;
pub const ES: usize = 8;
pub const FS: usize = 9;
pub const GS: usize = 10;
pub const EIP: usize = 11;
pub const CS: usize = 12;
pub const EFLAGS: usize = 13;
pub const ESP: usize = 14;
pub const SS: usize = 15;

/// Register table in `user_regs_struct` order (without `orig_eax`).
pub static LAYOUT: RegisterLayout = RegisterLayout {
    names: &[
        "EBX", "ECX", "EDX", "ESI", "EDI", "EBP", "EAX", "DS", "ES", "FS", "GS", "EIP", "CS", "EFLAGS", "ESP", "SS",
    ],
    sizes: &[4; 16],
    important: &[EAX, EBX, ECX, EDX, ESI, EDI, EBP, ESP, EIP, EFLAGS],
    pc: EIP,
    sp: ESP,
    fp: EBP,
    flags: EFLAGS,
    caller_saved: &[EAX, ECX, EDX, EFLAGS],
    // Hardware encoding order, which is also the JIT's register numbering.
    runtime: &[EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI],
    dwarf: &[
        (0, EAX),
        (1, ECX),
        (2, EDX),
        (3, EBX),
        (4, ESP),
        (5, EBP),
        (6, ESI),
        (7, EDI),
        (8, EIP),
        (9, EFLAGS),
    ],
};

const WORD: u64 = 4;

pub(crate) fn is_return_instruction(memory: &dyn TargetAccess, address: TargetAddress) -> bool
{
    matches!(memory.read_byte(address), Ok(0xc3 | 0xc2))
}

pub(crate) fn get_call_target(memory: &dyn TargetAccess, address: TargetAddress) -> Option<Decoded>
{
    let code = read_code(memory, address, 7)?;
    match *code.first()? {
        0xe8 => {
            let displacement = le_i32(&code, 1)?;
            Some(Decoded {
                target: address.offset(5 + i64::from(displacement)),
                size: 5,
            })
        }
        0xff => decode_indirect(memory, address, &code, 2),
        _ => None,
    }
}

pub(crate) fn get_jump_target(memory: &dyn TargetAccess, address: TargetAddress) -> Option<Decoded>
{
    let code = read_code(memory, address, 7)?;
    match *code.first()? {
        0xff => decode_indirect(memory, address, &code, 4),
        _ => None,
    }
}

/// Decode `ff /opcode` with a ModRM operand.
///
/// Register-direct forms yield the register value; memory forms are
/// dereferenced, which is how `call *disp(%ebx)` through the GOT and
/// `jmp *abs32` in a PLT stub resolve to their final target. SIB forms are
/// not decoded.
fn decode_indirect(memory: &dyn TargetAccess, address: TargetAddress, code: &[u8], opcode: u8) -> Option<Decoded>
{
    let modrm = *code.get(1)?;
    if (modrm >> 3) & 7 != opcode {
        return None;
    }
    let mode = modrm >> 6;
    let rm = usize::from(modrm & 7);
    if rm == 4 && mode != 3 {
        return None;
    }

    let registers = memory.get_registers().ok()?;
    let base = || registers.value(RegisterId::Index(LAYOUT.runtime[rm]));
    let domain = address.domain();

    let (slot, size) = match mode {
        0 if rm == 5 => (TargetAddress::new(domain, u64::from(le_i32(code, 2)? as u32)), 6),
        0 => (TargetAddress::new(domain, base()?), 2),
        1 => {
            let displacement = i64::from(*code.get(2)? as i8);
            (TargetAddress::new(domain, base()?).offset(displacement), 3)
        }
        2 => (TargetAddress::new(domain, base()?).offset(i64::from(le_i32(code, 2)?)), 6),
        _ => {
            let target = TargetAddress::new(domain, base()?);
            return Some(Decoded { target, size: 2 });
        }
    };

    let target = memory.read_address(slot).ok()?;
    (!target.is_null()).then_some(Decoded { target, size })
}

/// Match the specific trampoline `push $method; jmp generic`.
pub(crate) fn match_trampoline(
    memory: &dyn TargetAccess,
    stub: TargetAddress,
    generic_trampoline: TargetAddress,
) -> Option<TargetAddress>
{
    let code = memory.read_buffer(stub, 10).ok()?;
    if code.first() != Some(&0x68) || code.get(5) != Some(&0xe9) {
        return None;
    }
    let method = le_i32(&code, 1)? as u32;
    let destination = stub.offset(10 + i64::from(le_i32(&code, 6)?));
    if destination != generic_trampoline {
        return None;
    }
    Some(TargetAddress::new(stub.domain(), u64::from(method)))
}

/// Simulate `push %ebp; mov %esp,%ebp; push <callee-saved>*`.
///
/// `code_offset` is how far into the method the frame's program counter is,
/// which tells how much of the prologue has executed.
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

    let mov = code.get(1..3)?;
    if mov != [0x89, 0xe5] && mov != [0x8b, 0xec] {
        return None;
    }

    if code_offset == 1 {
        let saved_fp = memory.read_address(sp).ok()?;
        let return_address = memory.read_address(sp + WORD).ok()?;
        registers.set_from_memory(RegisterId::Fp, saved_fp.value(), sp).ok()?;
        registers.set_from_memory(RegisterId::Pc, return_address.value(), sp + WORD).ok()?;
        registers.set(RegisterId::Sp, (sp + 2 * WORD).value()).ok()?;
        return Some(frame.caller(registers, FrameStatus::Prologue));
    }

    let fp = frame.frame_address;
    let mut position = 3;
    let mut saved = 0;
    while position < code_offset {
        let slot = match code.get(position) {
            Some(0x53) => EBX,
            Some(0x56) => ESI,
            Some(0x57) => EDI,
            _ => break,
        };
        saved += 1;
        let location = fp - WORD * saved;
        let value = memory.read_address(location).ok()?;
        registers.set_from_memory(RegisterId::Index(slot), value.value(), location).ok()?;
        position += 1;
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

/// Signatures for glibc's i386 syscall paths.
pub(crate) fn default_signatures() -> Vec<UnwindSignature>
{
    vec![
        // __kernel_vsyscall return path: pop %ebp; pop %edx; pop %ecx; ret
        UnwindSignature {
            name: "syscall-trampoline".to_string(),
            architecture: Architecture::I386,
            pattern: vec![0x5d, 0x5a, 0x59, 0xc3],
            pattern_offset: 0,
            return_address_slot: 12,
            frame_pointer_slot: Some(0),
            caller_stack: CallerStack::Adjust(16),
        },
        // pthread_cond_timedwait right after `call *%gs:0x10`
        UnwindSignature {
            name: "pthread_cond_timedwait".to_string(),
            architecture: Architecture::I386,
            pattern: vec![0x65, 0xff, 0x15, 0x10, 0x00, 0x00, 0x00],
            pattern_offset: -7,
            return_address_slot: 0x2c,
            frame_pointer_slot: Some(0x1c),
            caller_stack: CallerStack::Adjust(0x30),
        },
    ]
}

pub(crate) fn print_register(index: usize, value: u64) -> String
{
    match index {
        EFLAGS => format_flags(value, EFLAGS_BITS),
        _ => format!("{value:08x}"),
    }
}
