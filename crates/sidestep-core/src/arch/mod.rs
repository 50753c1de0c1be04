//! # Architecture Decoder
//!
//! Per-CPU instruction inspection, register tables and frame-pointer unwinding.
//!
//! The three supported architectures share almost no logic, so each lives in
//! its own module as a set of free functions plus static data tables. An
//! [`ArchitectureDecoder`] is selected once at attach time and dispatches on
//! the [`Architecture`] tag.
//!
//! ## Failure policy
//!
//! Nothing here returns an error for an instruction it does not understand.
//! Unreadable memory, unknown encodings and prologues that do not match the
//! expected template all yield `None`, which the stepping engine treats as
//! "single-step instead" and the unwinder treats as "try the next strategy".

pub mod i386;
pub mod powerpc;
pub mod x86_64;

use std::sync::Arc;

use crate::inferior::TargetAccess;
use crate::types::{Architecture, FrameStatus, RegisterId, Registers, SimpleStackFrame, TargetAddress};

/// A decoded control-transfer instruction.
///
/// Returned only when the target is known; an unrecognized instruction is
/// `None`, so a reported size is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded
{
    /// Destination of the call or jump.
    pub target: TargetAddress,
    /// Encoded length of the instruction in bytes.
    pub size: usize,
}

/// Static register metadata for one architecture.
#[derive(Debug)]
pub struct RegisterLayout
{
    /// Register names in slot order.
    pub names: &'static [&'static str],
    /// Register sizes in bytes, in slot order.
    pub sizes: &'static [u8],
    /// Slots worth showing to a user by default.
    pub important: &'static [usize],
    /// Program counter slot.
    pub pc: usize,
    /// Stack pointer slot.
    pub sp: usize,
    /// Frame pointer slot.
    pub fp: usize,
    /// Status/flags slot.
    pub flags: usize,
    /// Slots clobbered by a call and therefore unknown in a caller frame.
    pub caller_saved: &'static [usize],
    /// Slot for each of the runtime code generator's register numbers.
    pub runtime: &'static [usize],
    /// `(dwarf number, slot)` pairs.
    pub dwarf: &'static [(u16, usize)],
}

impl RegisterLayout
{
    /// Number of register slots.
    #[must_use]
    pub fn count(&self) -> usize
    {
        self.names.len()
    }

    /// Slot of the register called `name` (case-insensitive).
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize>
    {
        self.names.iter().position(|candidate| candidate.eq_ignore_ascii_case(name))
    }

    /// Slot for a DWARF register number.
    #[must_use]
    pub fn dwarf_slot(&self, dwarf: u16) -> Option<usize>
    {
        self.dwarf
            .iter()
            .find(|(number, _)| *number == dwarf)
            .map(|(_, slot)| *slot)
    }
}

/// Register layout for `architecture`.
#[must_use]
pub fn register_layout(architecture: Architecture) -> &'static RegisterLayout
{
    match architecture {
        Architecture::I386 => &i386::LAYOUT,
        Architecture::X86_64 => &x86_64::LAYOUT,
        Architecture::PowerPc => &powerpc::LAYOUT,
    }
}

/// Where the caller's stack pointer comes from in an [`UnwindSignature`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerStack
{
    /// The caller's stack pointer is `sp + n`.
    Adjust(u64),
    /// The caller's stack pointer is stored at `sp + n`.
    Slot(u64),
}

/// A named byte signature recognizing one hand-written libc code shape
///
/// The generic frame-pointer walk cannot see through code that does not keep a
/// frame pointer (the vsyscall trampoline, signal return stubs, some
/// `pthread_cond_*` builds). A signature describes such a shape as data: when
/// `pattern` is found at `pc + pattern_offset`, the caller's registers are read
/// from fixed stack slots. The defaults match specific glibc builds; they are
/// configuration, not a guarantee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindSignature
{
    /// Name used in logs.
    pub name: String,
    /// Architecture the signature applies to.
    pub architecture: Architecture,
    /// Exact instruction bytes to match.
    pub pattern: Vec<u8>,
    /// Position of the pattern relative to the frame's program counter.
    pub pattern_offset: i64,
    /// `sp`-relative slot holding the return address.
    pub return_address_slot: u64,
    /// `sp`-relative slot holding the caller's frame pointer, if saved.
    pub frame_pointer_slot: Option<u64>,
    /// How to compute the caller's stack pointer.
    pub caller_stack: CallerStack,
}

impl UnwindSignature
{
    /// Try to unwind `frame` with this signature.
    #[must_use]
    pub fn unwind(&self, frame: &SimpleStackFrame, memory: &dyn TargetAccess) -> Option<SimpleStackFrame>
    {
        if frame.registers.architecture() != self.architecture {
            return None;
        }
        let start = frame.address.offset(self.pattern_offset);
        let bytes = memory.read_buffer(start, self.pattern.len()).ok()?;
        if bytes != self.pattern {
            return None;
        }

        let sp = frame.stack_pointer;
        let return_address = memory.read_address(sp + self.return_address_slot).ok()?;
        if return_address.is_null() {
            return None;
        }
        let caller_sp = match self.caller_stack {
            CallerStack::Adjust(adjust) => sp + adjust,
            CallerStack::Slot(slot) => memory.read_address(sp + slot).ok()?,
        };

        let layout = register_layout(self.architecture);
        let mut registers = caller_registers(&frame.registers, layout);
        registers.set(RegisterId::Pc, return_address.value()).ok()?;
        registers.set(RegisterId::Sp, caller_sp.value()).ok()?;
        if let Some(slot) = self.frame_pointer_slot {
            let location = sp + slot;
            let fp = memory.read_address(location).ok()?;
            registers.set_from_memory(RegisterId::Fp, fp.value(), location).ok()?;
        }
        tracing::trace!(signature = %self.name, "unwound {} via libc signature", frame.address);
        Some(frame.caller(registers, FrameStatus::Heuristic))
    }
}

/// Default libc signatures for `architecture`.
#[must_use]
pub fn default_signatures(architecture: Architecture) -> Vec<UnwindSignature>
{
    match architecture {
        Architecture::I386 => i386::default_signatures(),
        Architecture::X86_64 => x86_64::default_signatures(),
        Architecture::PowerPc => Vec::new(),
    }
}

/// Capability object for one target architecture
///
/// Cheap to clone; every engine of a process holds one.
#[derive(Debug, Clone)]
pub struct ArchitectureDecoder
{
    architecture: Architecture,
    signatures: Arc<[UnwindSignature]>,
}

impl ArchitectureDecoder
{
    /// Decoder with the default libc signatures.
    #[must_use]
    pub fn new(architecture: Architecture) -> Self
    {
        Self::with_signatures(architecture, default_signatures(architecture))
    }

    /// Decoder with a custom set of libc signatures.
    ///
    /// Signatures for other architectures are ignored.
    #[must_use]
    pub fn with_signatures(architecture: Architecture, signatures: Vec<UnwindSignature>) -> Self
    {
        let signatures: Vec<_> = signatures
            .into_iter()
            .filter(|signature| signature.architecture == architecture)
            .collect();
        Self {
            architecture,
            signatures: signatures.into(),
        }
    }

    /// Architecture handled by this decoder.
    #[must_use]
    pub fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    /// Register metadata.
    #[must_use]
    pub fn layout(&self) -> &'static RegisterLayout
    {
        register_layout(self.architecture)
    }

    /// Installed libc signatures.
    #[must_use]
    pub fn signatures(&self) -> &[UnwindSignature]
    {
        &self.signatures
    }

    /// Whether the instruction at `address` returns from the current method.
    #[must_use]
    pub fn is_return_instruction(&self, memory: &dyn TargetAccess, address: TargetAddress) -> bool
    {
        match self.architecture {
            Architecture::I386 => i386::is_return_instruction(memory, address),
            Architecture::X86_64 => x86_64::is_return_instruction(memory, address),
            Architecture::PowerPc => powerpc::is_return_instruction(memory, address),
        }
    }

    /// Decode a call instruction at `address`.
    ///
    /// Indirect forms are resolved against the thread's current registers, so
    /// the answer is only meaningful when `address` is the current program
    /// counter.
    #[must_use]
    pub fn get_call_target(&self, memory: &dyn TargetAccess, address: TargetAddress) -> Option<Decoded>
    {
        match self.architecture {
            Architecture::I386 => i386::get_call_target(memory, address),
            Architecture::X86_64 => x86_64::get_call_target(memory, address),
            Architecture::PowerPc => powerpc::get_call_target(memory, address),
        }
    }

    /// Decode an unconditional jump at `address` (PLT stub detection).
    #[must_use]
    pub fn get_jump_target(&self, memory: &dyn TargetAccess, address: TargetAddress) -> Option<Decoded>
    {
        match self.architecture {
            Architecture::I386 => i386::get_jump_target(memory, address),
            Architecture::X86_64 => x86_64::get_jump_target(memory, address),
            Architecture::PowerPc => powerpc::get_jump_target(memory, address),
        }
    }

    /// Recover the method handle from a call into a JIT trampoline.
    ///
    /// `call_site` is the call instruction; the called stub must match the
    /// runtime's specific-trampoline template byte for byte and jump to
    /// `generic_trampoline`.
    #[must_use]
    pub fn get_trampoline(
        &self,
        memory: &dyn TargetAccess,
        call_site: TargetAddress,
        generic_trampoline: TargetAddress,
    ) -> Option<TargetAddress>
    {
        if generic_trampoline.is_null() {
            return None;
        }
        let call = self.get_call_target(memory, call_site)?;
        match self.architecture {
            Architecture::I386 => i386::match_trampoline(memory, call.target, generic_trampoline),
            Architecture::X86_64 => x86_64::match_trampoline(memory, call.target, generic_trampoline),
            Architecture::PowerPc => powerpc::match_trampoline(memory, call.target, generic_trampoline),
        }
    }

    /// Return address of a method whose prologue has not run yet.
    #[must_use]
    pub fn return_address_at_entry(&self, memory: &dyn TargetAccess, registers: &Registers) -> Option<TargetAddress>
    {
        let domain = memory.address_domain();
        let address = match self.architecture {
            Architecture::I386 | Architecture::X86_64 => {
                memory.read_address(TargetAddress::new(domain, registers.sp())).ok()?
            }
            Architecture::PowerPc => TargetAddress::new(domain, registers.value(RegisterId::Index(powerpc::LR))?),
        };
        (!address.is_null()).then_some(address)
    }

    /// Compute the caller of `frame`.
    ///
    /// With `code` (the machine code of the method containing the frame's
    /// address, `code_offset` bytes in) the prologue is simulated. Without it,
    /// or when the prologue does not match, the libc signatures and then the
    /// saved frame-pointer chain are tried. `None` means this is the outermost
    /// frame that can be determined.
    #[must_use]
    pub fn unwind_stack(
        &self,
        frame: &SimpleStackFrame,
        memory: &dyn TargetAccess,
        code: Option<&[u8]>,
        code_offset: usize,
    ) -> Option<SimpleStackFrame>
    {
        code.and_then(|code| self.unwind_prologue(frame, memory, code, code_offset))
            .or_else(|| self.unwind_heuristic(frame, memory))
    }

    /// Prologue simulation only.
    #[must_use]
    pub fn unwind_prologue(
        &self,
        frame: &SimpleStackFrame,
        memory: &dyn TargetAccess,
        code: &[u8],
        code_offset: usize,
    ) -> Option<SimpleStackFrame>
    {
        match self.architecture {
            Architecture::I386 => i386::unwind_prologue(frame, memory, code, code_offset),
            Architecture::X86_64 => x86_64::unwind_prologue(frame, memory, code, code_offset),
            Architecture::PowerPc => powerpc::unwind_prologue(frame, memory, code, code_offset),
        }
    }

    /// The libc signatures, then the saved frame-pointer (or back) chain.
    #[must_use]
    pub fn unwind_heuristic(&self, frame: &SimpleStackFrame, memory: &dyn TargetAccess) -> Option<SimpleStackFrame>
    {
        if let Some(caller) = self.signatures.iter().find_map(|signature| signature.unwind(frame, memory)) {
            return Some(caller);
        }

        match self.architecture {
            Architecture::I386 | Architecture::X86_64 => frame_pointer_chain(frame, memory),
            Architecture::PowerPc => powerpc::back_chain(frame, memory),
        }
    }

    /// Slot for a runtime code-generator register number.
    #[must_use]
    pub fn runtime_register_index(&self, runtime: usize) -> Option<usize>
    {
        self.layout().runtime.get(runtime).copied()
    }

    /// Slot for a DWARF register number.
    #[must_use]
    pub fn dwarf_register_index(&self, dwarf: u16) -> Option<usize>
    {
        self.layout().dwarf_slot(dwarf)
    }

    /// Format one register, decomposing flag registers.
    #[must_use]
    pub fn print_register(&self, registers: &Registers, index: usize) -> Option<String>
    {
        let register = registers.get(RegisterId::Index(index))?;
        if !register.valid {
            return Some("<invalid>".to_string());
        }
        Some(match self.architecture {
            Architecture::I386 => i386::print_register(index, register.value),
            Architecture::X86_64 => x86_64::print_register(index, register.value),
            Architecture::PowerPc => powerpc::print_register(index, register.value),
        })
    }

    /// Format the user-visible registers, several per line.
    #[must_use]
    pub fn print_registers(&self, registers: &Registers) -> String
    {
        let layout = self.layout();
        let per_line = match self.architecture {
            Architecture::X86_64 => 4,
            Architecture::I386 | Architecture::PowerPc => 6,
        };
        let cells: Vec<String> = layout
            .important
            .iter()
            .map(|&index| {
                let value = self.print_register(registers, index).unwrap_or_default();
                format!("{}={}", layout.names[index], value)
            })
            .collect();
        cells
            .chunks(per_line)
            .map(|line| line.join("  "))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Registers of a caller frame before any slot has been recovered.
///
/// Callee-saved registers keep the callee's values (they are unchanged until
/// the prologue or a CFI rule says otherwise); caller-saved ones are unknown.
pub(crate) fn caller_registers(registers: &Registers, layout: &RegisterLayout) -> Registers
{
    let mut caller = registers.clone();
    for &index in layout.caller_saved {
        caller.invalidate(RegisterId::Index(index));
    }
    caller
}

/// Walk one link of the saved frame-pointer chain (x86 and x86-64).
///
/// `[fp]` holds the caller's frame pointer and `[fp + word]` the return
/// address; the caller's stack pointer is `fp + 2 * word`.
fn frame_pointer_chain(frame: &SimpleStackFrame, memory: &dyn TargetAccess) -> Option<SimpleStackFrame>
{
    let fp = frame.frame_address;
    if fp.is_null() {
        return None;
    }
    let word = u64::from(memory.architecture().pointer_size_bytes());
    let saved_fp = memory.read_address(fp).ok()?;
    let return_address = memory.read_address(fp + word).ok()?;
    if return_address.is_null() {
        return None;
    }

    let layout = register_layout(frame.registers.architecture());
    let mut registers = caller_registers(&frame.registers, layout);
    registers.set(RegisterId::Pc, return_address.value()).ok()?;
    registers.set(RegisterId::Sp, (fp + 2 * word).value()).ok()?;
    registers.set_from_memory(RegisterId::Fp, saved_fp.value(), fp).ok()?;
    Some(frame.caller(registers, FrameStatus::FramePointer))
}

/// Bit names of the x86 EFLAGS register.
pub(crate) const EFLAGS_BITS: &[(u32, &str)] = &[
    (0, "CF"),
    (2, "PF"),
    (4, "AF"),
    (6, "ZF"),
    (7, "SF"),
    (8, "TF"),
    (9, "IF"),
    (10, "DF"),
    (11, "OF"),
    (14, "NT"),
    (16, "RF"),
    (17, "VM"),
    (18, "AC"),
    (19, "VIF"),
    (20, "VIP"),
    (21, "ID"),
];

/// Render the set bits of `value` named in `bits` as `[A B C]`.
pub(crate) fn format_flags(value: u64, bits: &[(u32, &str)]) -> String
{
    let names: Vec<&str> = bits
        .iter()
        .filter(|(bit, _)| value & (1 << bit) != 0)
        .map(|(_, name)| *name)
        .collect();
    format!("[{}]", names.join(" "))
}

/// Little-endian `i32` at `offset` in `bytes`.
pub(crate) fn le_i32(bytes: &[u8], offset: usize) -> Option<i32>
{
    let raw: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;
    Some(i32::from_le_bytes(raw))
}

/// Little-endian `u64` at `offset` in `bytes`.
pub(crate) fn le_u64(bytes: &[u8], offset: usize) -> Option<u64>
{
    let raw: [u8; 8] = bytes.get(offset..offset + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(raw))
}

/// Read up to `max` bytes, shrinking the request when the tail is unmapped.
pub(crate) fn read_code(memory: &dyn TargetAccess, address: TargetAddress, max: usize) -> Option<Vec<u8>>
{
    (1..=max).rev().find_map(|size| memory.read_buffer(address, size).ok())
}
