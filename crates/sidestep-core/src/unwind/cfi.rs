//! # Call Frame Information
//!
//! DWARF CFI unwinding from `.eh_frame` or `.debug_frame` data.
//!
//! Both sections hold Common Information Entries (register-recovery defaults)
//! and Frame Description Entries (an address range plus opcodes that refine
//! those defaults). `gimli` does the parsing and replays the opcodes up to the
//! frame's address; this module applies the resulting row to a
//! [`SimpleStackFrame`]. Both the 32-bit and the 64-bit DWARF length formats
//! are accepted.

use std::sync::Arc;

use gimli::{
    BaseAddresses, CfaRule, CieOrFde, DebugFrame, EhFrame, EndianSlice, Reader, Register, RegisterRule, RunTimeEndian,
    UnwindContext, UnwindSection, UnwindTableRow,
};
use object::{Object, ObjectSection};

use crate::arch::{register_layout, RegisterLayout};
use crate::error::{DebuggerError, Result};
use crate::inferior::TargetAccess;
use crate::types::{FrameStatus, RegisterId, Registers, SimpleStackFrame, TargetAddress};

/// Which section the table was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfiSectionKind
{
    /// `.eh_frame` (pointer encodings relative to the section).
    EhFrame,
    /// `.debug_frame`.
    DebugFrame,
}

/// One module's call frame information
#[derive(Debug, Clone)]
pub struct CfiTable
{
    kind: CfiSectionKind,
    data: Arc<[u8]>,
    section_address: u64,
    text_address: u64,
    load_bias: u64,
    endian: RunTimeEndian,
    address_size: u8,
}

impl CfiTable
{
    /// Wrap raw section bytes.
    ///
    /// `section_address` and `text_address` are the link-time addresses of the
    /// CFI section and of `.text`, used for pc-relative pointer encodings.
    #[must_use]
    pub fn new(
        kind: CfiSectionKind,
        data: impl Into<Arc<[u8]>>,
        section_address: u64,
        text_address: u64,
        endian: RunTimeEndian,
        address_size: u8,
    ) -> Self
    {
        Self {
            kind,
            data: data.into(),
            section_address,
            text_address,
            load_bias: 0,
            endian,
            address_size,
        }
    }

    /// Read the CFI of an ELF image, preferring `.eh_frame`.
    ///
    /// Returns `Ok(None)` when the image has neither section.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::InvalidArgument`] if the bytes are not a parseable
    /// object file or a section cannot be decompressed.
    pub fn from_elf(bytes: &[u8]) -> Result<Option<Self>>
    {
        let file = object::File::parse(bytes)
            .map_err(|err| DebuggerError::InvalidArgument(format!("failed to parse object file: {err}")))?;
        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };
        let address_size = if file.is_64() { 8 } else { 4 };
        let text_address = file.section_by_name(".text").map_or(0, |section| section.address());

        for (kind, name) in [(CfiSectionKind::EhFrame, ".eh_frame"), (CfiSectionKind::DebugFrame, ".debug_frame")] {
            let Some(section) = file.section_by_name(name) else {
                continue;
            };
            let data = section
                .uncompressed_data()
                .map_err(|err| DebuggerError::InvalidArgument(format!("failed to read {name}: {err}")))?;
            tracing::debug!(section = name, size = data.len(), "loaded call frame information");
            return Ok(Some(Self::new(
                kind,
                Arc::<[u8]>::from(data.as_ref()),
                section.address(),
                text_address,
                endian,
                address_size,
            )));
        }
        Ok(None)
    }

    /// Shift every address by the module's load bias (runtime minus link-time address).
    #[must_use]
    pub fn with_load_bias(mut self, bias: u64) -> Self
    {
        self.load_bias = bias;
        self
    }

    /// Section the table came from.
    #[must_use]
    pub fn kind(&self) -> CfiSectionKind
    {
        self.kind
    }

    /// Compute the caller of `frame`.
    ///
    /// `Ok(None)` means no entry covers the frame's address, or the entry
    /// marks the return address as undefined (outermost frame).
    ///
    /// ## Errors
    ///
    /// Malformed CFI data.
    pub fn unwind(&self, frame: &SimpleStackFrame, memory: &dyn TargetAccess) -> Result<Option<SimpleStackFrame>>
    {
        let pc = lookup_address(frame).value().wrapping_sub(self.load_bias);
        let data = EndianSlice::new(&self.data, self.endian);
        match self.kind {
            CfiSectionKind::EhFrame => {
                let bases = BaseAddresses::default()
                    .set_eh_frame(self.section_address)
                    .set_text(self.text_address);
                let mut section = EhFrame::from(data);
                section.set_address_size(self.address_size);
                self.unwind_with(&section, &bases, pc, frame, memory)
            }
            CfiSectionKind::DebugFrame => {
                let bases = BaseAddresses::default().set_text(self.text_address);
                let mut section = DebugFrame::from(data);
                section.set_address_size(self.address_size);
                self.unwind_with(&section, &bases, pc, frame, memory)
            }
        }
    }

    fn unwind_with<R, S>(
        &self,
        section: &S,
        bases: &BaseAddresses,
        pc: u64,
        frame: &SimpleStackFrame,
        memory: &dyn TargetAccess,
    ) -> Result<Option<SimpleStackFrame>>
    where
        R: Reader<Offset = usize>,
        S: UnwindSection<R>,
    {
        let mut entries = section.entries(bases);
        let mut context = UnwindContext::<usize>::new();
        while let Some(entry) = entries.next().map_err(|err| map_gimli_error("reading unwind entry", err))? {
            let CieOrFde::Fde(partial) = entry else {
                continue;
            };
            let fde = partial
                .parse(|unwind_section, base_addresses, cie_offset| {
                    unwind_section.cie_from_offset(base_addresses, cie_offset)
                })
                .map_err(|err| map_gimli_error("parsing frame description entry", err))?;
            if !fde.contains(pc) {
                continue;
            }

            let return_register = fde.cie().return_address_register();
            return match fde.unwind_info_for_address(section, bases, &mut context, pc) {
                Ok(row) => Ok(apply_row(row, return_register, frame, memory)),
                Err(gimli::Error::NoUnwindInfoForAddress) => Ok(None),
                Err(err) => Err(map_gimli_error("evaluating unwind row", err)),
            };
        }

        tracing::trace!("no CFI entry covers {}", frame.address);
        Ok(None)
    }
}

/// Address whose unwind row describes `frame`.
///
/// A caller's pc is a return address, which may already belong to the next
/// function when the call was the last instruction; look up the call itself.
#[must_use]
pub fn lookup_address(frame: &SimpleStackFrame) -> TargetAddress
{
    if frame.level > 0 && frame.address.value() > 0 {
        frame.address - 1
    } else {
        frame.address
    }
}

/// Turn an unwind row into the caller's frame.
fn apply_row(
    row: &UnwindTableRow<usize>,
    return_register: Register,
    frame: &SimpleStackFrame,
    memory: &dyn TargetAccess,
) -> Option<SimpleStackFrame>
{
    let layout = register_layout(frame.registers.architecture());
    let cfa = match row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => {
            let base = dwarf_value(layout, &frame.registers, *register)?;
            base.wrapping_add(*offset as u64)
        }
        CfaRule::Expression(_) => return None,
    };
    let cfa = frame.address.with_value(cfa);

    let mut registers = crate::arch::caller_registers(&frame.registers, layout);
    for (register, rule) in row.registers() {
        if *register == return_register {
            continue;
        }
        let Some(slot) = layout.dwarf_slot(register.0) else {
            continue;
        };
        apply_rule(layout, &mut registers, RegisterId::Index(slot), rule, cfa, frame, memory);
    }

    // The return address column becomes the caller's program counter.
    let rule = row.register(return_register);
    if matches!(rule, RegisterRule::Undefined) {
        return None;
    }
    let mut scratch = crate::arch::caller_registers(&frame.registers, layout);
    scratch.invalidate(RegisterId::Pc);
    apply_rule(layout, &mut scratch, RegisterId::Pc, &rule, cfa, frame, memory);
    let return_address = scratch.get(RegisterId::Pc).filter(|register| register.valid)?;
    if return_address.value == 0 {
        return None;
    }
    match return_address.location {
        Some(location) => registers.set_from_memory(RegisterId::Pc, return_address.value, location).ok()?,
        None => registers.set(RegisterId::Pc, return_address.value).ok()?,
    }
    registers.set(RegisterId::Sp, cfa.value()).ok()?;

    Some(frame.caller(registers, FrameStatus::Cfi))
}

fn apply_rule(
    layout: &RegisterLayout,
    registers: &mut Registers,
    target: RegisterId,
    rule: &RegisterRule<usize>,
    cfa: TargetAddress,
    frame: &SimpleStackFrame,
    memory: &dyn TargetAccess,
)
{
    let result = match rule {
        RegisterRule::Offset(offset) => {
            let location = cfa.offset(*offset);
            memory
                .read_address(location)
                .ok()
                .map(|value| registers.set_from_memory(target, value.value(), location))
        }
        RegisterRule::ValOffset(offset) => Some(registers.set(target, cfa.offset(*offset).value())),
        RegisterRule::Register(source) => {
            dwarf_value(layout, &frame.registers, *source).map(|value| registers.set(target, value))
        }
        RegisterRule::SameValue => frame.registers.value(target).map(|value| registers.set(target, value)),
        _ => None,
    };
    if !matches!(result, Some(Ok(()))) {
        registers.invalidate(target);
    }
}

fn dwarf_value(layout: &RegisterLayout, registers: &Registers, register: Register) -> Option<u64>
{
    let slot = layout.dwarf_slot(register.0)?;
    registers.value(RegisterId::Index(slot))
}

fn map_gimli_error(context: &str, err: gimli::Error) -> DebuggerError
{
    DebuggerError::InvalidArgument(format!("{context}: {err}"))
}
