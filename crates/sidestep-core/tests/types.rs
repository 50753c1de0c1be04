//! Tests for platform-agnostic types

use sidestep_core::arch::x86_64;
use sidestep_core::types::{
    AddressDomain, Architecture, LineEntry, MemoryRegion, Method, ProcessId, RegisterId, Registers, TargetAddress,
    ThreadId,
};
use sidestep_core::DebuggerError;

fn addr(value: u64) -> TargetAddress
{
    TargetAddress::global(value)
}

#[test]
fn test_process_and_thread_ids()
{
    let pid = ProcessId::from(12345);
    let value: u32 = pid.into();
    assert_eq!(value, 12345);

    let thread = ThreadId::from(77);
    assert_eq!(thread.raw(), 77);
    assert_eq!(thread.to_string(), "@77");
}

#[test]
fn test_architecture_from_target_triple()
{
    assert_eq!(Architecture::from_target_triple("x86_64-unknown-linux-gnu"), Some(Architecture::X86_64));
    assert_eq!(Architecture::from_target_triple("i686-pc-linux-gnu"), Some(Architecture::I386));
    assert_eq!(Architecture::from_target_triple("powerpc-apple-darwin"), Some(Architecture::PowerPc));
    assert_eq!(Architecture::from_target_triple("aarch64-apple-darwin"), None);

    assert_eq!(Architecture::I386.pointer_size_bytes(), 4);
    assert_eq!(Architecture::X86_64.pointer_size_bytes(), 8);
    assert!(Architecture::PowerPc.is_big_endian());
    assert!(!Architecture::X86_64.is_big_endian());
}

#[test]
fn test_address_arithmetic_and_display()
{
    let base = addr(0x1000);
    assert_eq!((base + 0x20).value(), 0x1020);
    assert_eq!((base - 0x20).value(), 0xfe0);
    assert!(base < base + 1);
    assert!(base.is_in_range(addr(0x1000), addr(0x1001)));
    assert!(!base.is_in_range(addr(0x0f00), addr(0x1000)));
    assert_eq!(addr(u64::MAX).checked_add(1), None);
    assert_eq!(base.to_string(), "0x00001000");
    assert!(TargetAddress::null(AddressDomain::global()).is_null());
}

#[test]
fn test_addresses_in_different_domains()
{
    let child = TargetAddress::new(AddressDomain::process(1), 0x1000);
    let parent = TargetAddress::new(AddressDomain::process(0), 0x1000);
    assert_ne!(child, parent);
    assert!(matches!(child.offset_from(parent), Err(DebuggerError::AddressDomainMismatch(..))));
    assert_eq!(AddressDomain::core_file().to_string(), "core");
}

#[test]
fn test_memory_region()
{
    let region = MemoryRegion::new(addr(0x1000), addr(0x2000), "r-xp", Some("/bin/true".to_string()));

    assert_eq!(region.size(), 0x1000);
    assert!(region.is_executable());
    assert!(region.contains(addr(0x1fff)));
    assert!(!region.contains(addr(0x2000)));

    let inverted = MemoryRegion::new(addr(0x2000), addr(0x1000), "rw-p", None);
    assert_eq!(inverted.size(), 0);
    assert!(!inverted.is_executable());
}

#[test]
fn test_registers_start_invalid()
{
    let mut registers = Registers::new(Architecture::X86_64);
    assert!(!registers.is_empty());
    assert_eq!(registers.value(RegisterId::Pc), None);
    assert_eq!(registers.pc(), 0);

    registers.set(RegisterId::Pc, 0x4000).unwrap();
    registers.set_from_memory(RegisterId::Fp, 0x7f00, addr(0x7ee0)).unwrap();
    assert_eq!(registers.value(RegisterId::Index(x86_64::RIP)), Some(0x4000));
    assert_eq!(registers.get(RegisterId::Fp).unwrap().location, Some(addr(0x7ee0)));

    registers.invalidate(RegisterId::Fp);
    assert_eq!(registers.value(RegisterId::Fp), None);
    assert_eq!(registers.get(RegisterId::Fp).unwrap().location, None);

    let out_of_range = registers.len() + 3;
    assert!(matches!(
        registers.set(RegisterId::Index(out_of_range), 1),
        Err(DebuggerError::NoSuchRegister(index)) if index == out_of_range
    ));
}

#[test]
fn test_registers_from_values()
{
    let registers = Registers::from_values(Architecture::I386, &[1, 2, 3]);
    assert_eq!(registers.architecture(), Architecture::I386);
    assert_eq!(registers.iter().filter(|register| register.valid).count(), 3);
    assert_eq!(registers.value(RegisterId::Index(2)), Some(3));
    assert_eq!(registers.value(RegisterId::Index(3)), None);
}

#[test]
fn test_method_line_ranges()
{
    let method = Method::new("compute", addr(0x1000), addr(0x1040))
        .with_body(addr(0x1008), addr(0x1038))
        .with_source(
            "compute.c",
            vec![
                LineEntry { address: addr(0x1020), line: 12 },
                LineEntry { address: addr(0x1000), line: 10 },
                LineEntry { address: addr(0x1010), line: 11 },
                LineEntry { address: addr(0x1018), line: 11 },
            ],
        );

    assert!(method.has_source());
    assert_eq!(method.code_size(), 0x40);
    assert!(method.is_in_prologue(addr(0x1004)));
    assert!(method.is_in_epilogue(addr(0x1038)));
    assert!(!method.is_in_epilogue(addr(0x1037)));

    // Consecutive rows for the same line merge into one range.
    let range = method.line_range(addr(0x1014)).unwrap();
    assert_eq!((range.start, range.end, range.line), (addr(0x1010), addr(0x1020), 11));
    let last = method.line_range(addr(0x1030)).unwrap();
    assert_eq!(last.end, addr(0x1040));
    assert_eq!(method.line_range(addr(0x1040)), None);

    let location = method.source_location(addr(0x1014)).unwrap();
    assert_eq!(location.line_offset, 4);
    assert_eq!(location.to_string(), "compute.c:11+0x4");
    assert_eq!(method.source_location(addr(0x1010)).unwrap().to_string(), "compute.c:11");
}

#[test]
fn test_method_without_source()
{
    let method = Method::new("stub", addr(0x3000), addr(0x3010)).wrapper();
    assert!(method.is_wrapper);
    assert!(!method.has_source());
    assert!(method.source_location(addr(0x3004)).is_none());
    assert!(!method.is_in_prologue(addr(0x3000)));
}
