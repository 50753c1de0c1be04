//! Instruction decoding, register tables and frame-pointer unwinding.

mod common;

use common::{addr, call, FlatMemory};
use sidestep_core::arch::{i386, powerpc, x86_64, CallerStack, UnwindSignature};
use sidestep_core::types::{Architecture, FrameStatus, RegisterId, Registers};
use sidestep_core::ArchitectureDecoder;

fn be_words(words: &[u32]) -> Vec<u8>
{
    words.iter().flat_map(|word| word.to_be_bytes()).collect()
}

#[test]
fn test_x86_64_direct_call()
{
    let memory = FlatMemory::new(Architecture::X86_64).with_bytes(0x1000, &call(0x1000, 0x1800));
    let decoder = ArchitectureDecoder::new(Architecture::X86_64);

    let decoded = decoder.get_call_target(&memory, addr(0x1000)).unwrap();
    assert_eq!(decoded.target, addr(0x1800));
    assert_eq!(decoded.size, 5);

    let backwards = FlatMemory::new(Architecture::X86_64).with_bytes(0x1000, &call(0x1000, 0x0800));
    assert_eq!(decoder.get_call_target(&backwards, addr(0x1000)).unwrap().target, addr(0x0800));
}

#[test]
fn test_x86_64_indirect_calls()
{
    let decoder = ArchitectureDecoder::new(Architecture::X86_64);

    // call *0x1000(%rip) reads the slot after the 6-byte instruction.
    let memory = FlatMemory::new(Architecture::X86_64)
        .with_bytes(0x1000, &[0xff, 0x15, 0x00, 0x10, 0x00, 0x00, 0x90, 0x90])
        .with_word(0x2006, 0x5000);
    let decoded = decoder.get_call_target(&memory, addr(0x1000)).unwrap();
    assert_eq!((decoded.target, decoded.size), (addr(0x5000), 6));

    // call *%rax
    let memory = FlatMemory::new(Architecture::X86_64)
        .with_bytes(0x1000, &[0xff, 0xd0])
        .with_register(x86_64::RAX, 0x6000);
    let decoded = decoder.get_call_target(&memory, addr(0x1000)).unwrap();
    assert_eq!((decoded.target, decoded.size), (addr(0x6000), 2));

    // call *%r11
    let memory = FlatMemory::new(Architecture::X86_64)
        .with_bytes(0x1000, &[0x41, 0xff, 0xd3])
        .with_register(x86_64::R11, 0x7000);
    let decoded = decoder.get_call_target(&memory, addr(0x1000)).unwrap();
    assert_eq!((decoded.target, decoded.size), (addr(0x7000), 3));

    // A null slot is not a target.
    let memory = FlatMemory::new(Architecture::X86_64)
        .with_bytes(0x1000, &[0xff, 0x15, 0x00, 0x10, 0x00, 0x00])
        .with_word(0x2006, 0);
    assert!(decoder.get_call_target(&memory, addr(0x1000)).is_none());
}

#[test]
fn test_x86_64_plt_jump_and_non_calls()
{
    let decoder = ArchitectureDecoder::new(Architecture::X86_64);
    let memory = FlatMemory::new(Architecture::X86_64)
        .with_bytes(0x1000, &[0xff, 0x25, 0xfa, 0x0f, 0x00, 0x00, 0x68, 0x00])
        .with_word(0x2000, 0x7fff_0000);

    let jump = decoder.get_jump_target(&memory, addr(0x1000)).unwrap();
    assert_eq!((jump.target, jump.size), (addr(0x7fff_0000), 6));
    // The same bytes are not a call.
    assert!(decoder.get_call_target(&memory, addr(0x1000)).is_none());

    let nops = FlatMemory::new(Architecture::X86_64).with_bytes(0x1000, &[0x90; 8]);
    assert!(decoder.get_call_target(&nops, addr(0x1000)).is_none());
    assert!(decoder.get_jump_target(&nops, addr(0x1000)).is_none());
    assert!(decoder.get_call_target(&nops, addr(0x9000)).is_none());
}

#[test]
fn test_return_instructions()
{
    let x86 = FlatMemory::new(Architecture::X86_64).with_bytes(0x1000, &[0xc3, 0xf3, 0xc3, 0x90, 0xc2, 0x08, 0x00]);
    let decoder = ArchitectureDecoder::new(Architecture::X86_64);
    assert!(decoder.is_return_instruction(&x86, addr(0x1000)));
    assert!(decoder.is_return_instruction(&x86, addr(0x1001)));
    assert!(!decoder.is_return_instruction(&x86, addr(0x1003)));
    assert!(decoder.is_return_instruction(&x86, addr(0x1004)));

    let i386 = FlatMemory::new(Architecture::I386).with_bytes(0x1000, &[0xf3, 0xc3]);
    assert!(!ArchitectureDecoder::new(Architecture::I386).is_return_instruction(&i386, addr(0x1000)));

    let ppc = FlatMemory::new(Architecture::PowerPc).with_bytes(0x1000, &be_words(&[0x4e80_0020, 0x6000_0000]));
    let decoder = ArchitectureDecoder::new(Architecture::PowerPc);
    assert!(decoder.is_return_instruction(&ppc, addr(0x1000)));
    assert!(!decoder.is_return_instruction(&ppc, addr(0x1004)));
}

#[test]
fn test_x86_64_trampoline()
{
    let mut stub = vec![0x49, 0xbb];
    stub.extend_from_slice(&0x1234_5678_9abc_u64.to_le_bytes());
    stub.push(0xe9);
    stub.extend_from_slice(&(0x3000_i32 - 0x200f).to_le_bytes());
    let memory = FlatMemory::new(Architecture::X86_64)
        .with_bytes(0x1000, &call(0x1000, 0x2000))
        .with_bytes(0x2000, &stub);
    let decoder = ArchitectureDecoder::new(Architecture::X86_64);

    assert_eq!(
        decoder.get_trampoline(&memory, addr(0x1000), addr(0x3000)),
        Some(addr(0x1234_5678_9abc))
    );
    // Jumping somewhere else is not a trampoline.
    assert_eq!(decoder.get_trampoline(&memory, addr(0x1000), addr(0x3100)), None);
    assert_eq!(decoder.get_trampoline(&memory, addr(0x1000), addr(0)), None);
}

#[test]
fn test_i386_call_and_trampoline()
{
    let mut stub = vec![0x68];
    stub.extend_from_slice(&0x0804_8000_u32.to_le_bytes());
    stub.push(0xe9);
    stub.extend_from_slice(&(0x3000_i32 - 0x200a).to_le_bytes());
    let memory = FlatMemory::new(Architecture::I386)
        .with_bytes(0x1000, &call(0x1000, 0x2000))
        .with_bytes(0x1100, &[0xff, 0x15, 0x00, 0x40, 0x00, 0x00, 0x90])
        .with_word(0x4000, 0x0805_0000)
        .with_bytes(0x2000, &stub);
    let decoder = ArchitectureDecoder::new(Architecture::I386);

    let direct = decoder.get_call_target(&memory, addr(0x1000)).unwrap();
    assert_eq!((direct.target, direct.size), (addr(0x2000), 5));
    let indirect = decoder.get_call_target(&memory, addr(0x1100)).unwrap();
    assert_eq!((indirect.target, indirect.size), (addr(0x0805_0000), 6));

    assert_eq!(
        decoder.get_trampoline(&memory, addr(0x1000), addr(0x3000)),
        Some(addr(0x0804_8000))
    );
}

#[test]
fn test_powerpc_branches()
{
    // bl +0x100; bl -0x10; b +0x20; bctrl; bctr
    let memory = FlatMemory::new(Architecture::PowerPc)
        .with_bytes(
            0x1000,
            &be_words(&[0x4800_0101, 0x4bff_fff1, 0x4800_0020, 0x4e80_0421, 0x4e80_0420]),
        )
        .with_register(powerpc::CTR, 0x8000);
    let decoder = ArchitectureDecoder::new(Architecture::PowerPc);

    let forward = decoder.get_call_target(&memory, addr(0x1000)).unwrap();
    assert_eq!((forward.target, forward.size), (addr(0x1100), 4));
    assert_eq!(decoder.get_call_target(&memory, addr(0x1004)).unwrap().target, addr(0x0ff4));
    assert!(decoder.get_call_target(&memory, addr(0x1008)).is_none());
    assert_eq!(decoder.get_jump_target(&memory, addr(0x1008)).unwrap().target, addr(0x1028));
    assert_eq!(decoder.get_call_target(&memory, addr(0x100c)).unwrap().target, addr(0x8000));
    assert_eq!(decoder.get_jump_target(&memory, addr(0x1010)).unwrap().target, addr(0x8000));
}

#[test]
fn test_powerpc_trampoline()
{
    // lis r0,0x1234; ori r0,r0,0x5678; b 0x3000
    let memory = FlatMemory::new(Architecture::PowerPc)
        .with_bytes(0x1000, &be_words(&[0x4800_1001]))
        .with_bytes(0x2000, &be_words(&[0x3c00_1234, 0x6000_5678, 0x4800_0ff8]));
    let decoder = ArchitectureDecoder::new(Architecture::PowerPc);

    assert_eq!(
        decoder.get_trampoline(&memory, addr(0x1000), addr(0x3000)),
        Some(addr(0x1234_5678))
    );
    assert_eq!(decoder.get_trampoline(&memory, addr(0x1000), addr(0x3004)), None);
}

#[test]
fn test_return_address_at_entry()
{
    let decoder = ArchitectureDecoder::new(Architecture::X86_64);
    let memory = FlatMemory::new(Architecture::X86_64)
        .with_register(x86_64::RSP, 0x7f00)
        .with_word(0x7f00, 0x4321);
    assert_eq!(decoder.return_address_at_entry(&memory, &memory.registers()), Some(addr(0x4321)));

    let empty = FlatMemory::new(Architecture::X86_64)
        .with_register(x86_64::RSP, 0x7f00)
        .with_word(0x7f00, 0);
    assert_eq!(decoder.return_address_at_entry(&empty, &empty.registers()), None);

    let decoder = ArchitectureDecoder::new(Architecture::I386);
    let memory = FlatMemory::new(Architecture::I386)
        .with_register(i386::ESP, 0x7f00)
        .with_word(0x7f00, 0x0804_9000);
    assert_eq!(decoder.return_address_at_entry(&memory, &memory.registers()), Some(addr(0x0804_9000)));

    let decoder = ArchitectureDecoder::new(Architecture::PowerPc);
    let memory = FlatMemory::new(Architecture::PowerPc).with_register(powerpc::LR, 0x1_0040);
    assert_eq!(decoder.return_address_at_entry(&memory, &memory.registers()), Some(addr(0x1_0040)));
}

const X86_64_PROLOGUE: [u8; 6] = [0x55, 0x48, 0x89, 0xe5, 0x53, 0x90];

#[test]
fn test_x86_64_prologue_before_push()
{
    let memory = FlatMemory::new(Architecture::X86_64)
        .with_register(x86_64::RIP, 0x2000)
        .with_register(x86_64::RSP, 0x7f00)
        .with_word(0x7f00, 0x4321);
    let decoder = ArchitectureDecoder::new(Architecture::X86_64);

    let caller = decoder
        .unwind_prologue(&memory.frame(), &memory, &X86_64_PROLOGUE, 0)
        .unwrap();

    assert_eq!(caller.address, addr(0x4321));
    assert_eq!(caller.stack_pointer, addr(0x7f08));
    assert_eq!(caller.level, 1);
    assert_eq!(caller.status, FrameStatus::Prologue);
    assert_eq!(caller.registers.get(RegisterId::Pc).unwrap().location, Some(addr(0x7f00)));
}

#[test]
fn test_x86_64_prologue_after_push()
{
    let memory = FlatMemory::new(Architecture::X86_64)
        .with_register(x86_64::RIP, 0x2001)
        .with_register(x86_64::RSP, 0x7ef8)
        .with_word(0x7ef8, 0x7f50)
        .with_word(0x7f00, 0x4321);
    let decoder = ArchitectureDecoder::new(Architecture::X86_64);

    let caller = decoder
        .unwind_prologue(&memory.frame(), &memory, &X86_64_PROLOGUE, 1)
        .unwrap();

    assert_eq!(caller.address, addr(0x4321));
    assert_eq!(caller.stack_pointer, addr(0x7f08));
    assert_eq!(caller.frame_address, addr(0x7f50));
}

#[test]
fn test_x86_64_prologue_in_body_restores_saved_registers()
{
    let memory = FlatMemory::new(Architecture::X86_64)
        .with_register(x86_64::RIP, 0x2005)
        .with_register(x86_64::RSP, 0x7ee8)
        .with_register(x86_64::RBP, 0x7ef0)
        .with_register(x86_64::RAX, 0x99)
        .with_word(0x7ee8, 0x77)
        .with_word(0x7ef0, 0x7f50)
        .with_word(0x7ef8, 0x4321);
    let decoder = ArchitectureDecoder::new(Architecture::X86_64);

    let caller = decoder
        .unwind_prologue(&memory.frame(), &memory, &X86_64_PROLOGUE, 5)
        .unwrap();

    assert_eq!(caller.address, addr(0x4321));
    assert_eq!(caller.stack_pointer, addr(0x7f00));
    assert_eq!(caller.frame_address, addr(0x7f50));
    let rbx = caller.registers.get(RegisterId::Index(x86_64::RBX)).unwrap();
    assert_eq!((rbx.value, rbx.location), (0x77, Some(addr(0x7ee8))));
    // Clobbered by the call.
    assert_eq!(caller.registers.value(RegisterId::Index(x86_64::RAX)), None);

    let no_prologue = [0x90, 0x90, 0x90, 0x90];
    assert!(decoder.unwind_prologue(&memory.frame(), &memory, &no_prologue, 2).is_none());
}

#[test]
fn test_i386_prologue_after_push()
{
    let memory = FlatMemory::new(Architecture::I386)
        .with_register(i386::EIP, 0x2001)
        .with_register(i386::ESP, 0x7ff8)
        .with_word(0x7ff8, 0x7ff0)
        .with_word(0x7ffc, 0x0804_9000);
    let decoder = ArchitectureDecoder::new(Architecture::I386);

    let caller = decoder
        .unwind_prologue(&memory.frame(), &memory, &[0x55, 0x89, 0xe5, 0x90], 1)
        .unwrap();

    assert_eq!(caller.address, addr(0x0804_9000));
    assert_eq!(caller.stack_pointer, addr(0x8000));
    assert_eq!(caller.frame_address, addr(0x7ff0));
}

#[test]
fn test_powerpc_prologue_and_back_chain()
{
    // mflr r0; stwu r1,-32(r1); stw r0,36(r1)
    let code = be_words(&[0x7c08_02a6, 0x9421_ffe0, 0x9001_0024, 0x6000_0000]);
    let decoder = ArchitectureDecoder::new(Architecture::PowerPc);

    let entry = FlatMemory::new(Architecture::PowerPc)
        .with_register(powerpc::PC, 0x2004)
        .with_register(powerpc::R1, 0x7000)
        .with_register(powerpc::LR, 0x1_0040);
    let caller = decoder.unwind_prologue(&entry.frame(), &entry, &code, 4).unwrap();
    assert_eq!(caller.address, addr(0x1_0040));
    assert_eq!(caller.stack_pointer, addr(0x7000));

    let body = FlatMemory::new(Architecture::PowerPc)
        .with_register(powerpc::PC, 0x200c)
        .with_register(powerpc::R1, 0x6fe0)
        .with_word(0x6fe0, 0x7000)
        .with_word(0x7004, 0x1_0040);
    let caller = decoder.unwind_prologue(&body.frame(), &body, &code, 12).unwrap();
    assert_eq!(caller.address, addr(0x1_0040));
    assert_eq!(caller.stack_pointer, addr(0x7000));
    assert_eq!(caller.status, FrameStatus::Prologue);

    let heuristic = decoder.unwind_heuristic(&body.frame(), &body).unwrap();
    assert_eq!(heuristic.address, addr(0x1_0040));
    assert_eq!(heuristic.status, FrameStatus::FramePointer);
}

#[test]
fn test_frame_pointer_chain()
{
    let memory = FlatMemory::new(Architecture::X86_64)
        .with_register(x86_64::RIP, 0x9000)
        .with_register(x86_64::RSP, 0x7e00)
        .with_register(x86_64::RBP, 0x7ef0)
        .with_word(0x7ef0, 0x7f50)
        .with_word(0x7ef8, 0x4321);
    let decoder = ArchitectureDecoder::new(Architecture::X86_64);

    let caller = decoder.unwind_heuristic(&memory.frame(), &memory).unwrap();
    assert_eq!(caller.address, addr(0x4321));
    assert_eq!(caller.stack_pointer, addr(0x7f00));
    assert_eq!(caller.frame_address, addr(0x7f50));
    assert_eq!(caller.status, FrameStatus::FramePointer);

    let no_frame = FlatMemory::new(Architecture::X86_64)
        .with_register(x86_64::RIP, 0x9000)
        .with_register(x86_64::RSP, 0x7e00)
        .with_register(x86_64::RBP, 0);
    assert!(decoder.unwind_heuristic(&no_frame.frame(), &no_frame).is_none());
}

#[test]
fn test_custom_unwind_signature()
{
    let syscall_stub = UnwindSignature {
        name: "syscall".to_string(),
        architecture: Architecture::X86_64,
        pattern: vec![0x0f, 0x05],
        pattern_offset: -2,
        return_address_slot: 0,
        frame_pointer_slot: None,
        caller_stack: CallerStack::Adjust(8),
    };
    let foreign = UnwindSignature {
        architecture: Architecture::I386,
        ..syscall_stub.clone()
    };
    let decoder = ArchitectureDecoder::with_signatures(Architecture::X86_64, vec![syscall_stub, foreign]);
    assert_eq!(decoder.signatures().len(), 1);

    let memory = FlatMemory::new(Architecture::X86_64)
        .with_bytes(0x3000, &[0x0f, 0x05])
        .with_register(x86_64::RIP, 0x3002)
        .with_register(x86_64::RSP, 0x7e00)
        .with_register(x86_64::RBP, 0x7ef0)
        .with_word(0x7e00, 0x4444);

    let caller = decoder.unwind_heuristic(&memory.frame(), &memory).unwrap();
    assert_eq!(caller.address, addr(0x4444));
    assert_eq!(caller.stack_pointer, addr(0x7e08));
    assert_eq!(caller.status, FrameStatus::Heuristic);
}

#[test]
fn test_default_signatures()
{
    let x86_64 = ArchitectureDecoder::new(Architecture::X86_64);
    assert_eq!(x86_64.signatures()[0].name, "__restore_rt");
    assert_eq!(ArchitectureDecoder::new(Architecture::I386).signatures().len(), 2);
    assert!(ArchitectureDecoder::new(Architecture::PowerPc).signatures().is_empty());
}

#[test]
fn test_register_layouts()
{
    let x86_64 = ArchitectureDecoder::new(Architecture::X86_64);
    assert_eq!(x86_64.layout().count(), 27);
    assert_eq!(x86_64.layout().index_of("rip"), Some(x86_64::RIP));
    assert_eq!(x86_64.dwarf_register_index(7), Some(x86_64::RSP));
    assert_eq!(x86_64.dwarf_register_index(16), Some(x86_64::RIP));
    assert_eq!(x86_64.runtime_register_index(4), Some(x86_64::RSP));
    assert_eq!(x86_64.runtime_register_index(16), None);

    let i386 = ArchitectureDecoder::new(Architecture::I386);
    assert_eq!(i386.layout().count(), 16);
    assert_eq!(i386.dwarf_register_index(8), Some(i386::EIP));

    let ppc = ArchitectureDecoder::new(Architecture::PowerPc);
    assert_eq!(ppc.layout().count(), 38);
    assert_eq!(ppc.dwarf_register_index(65), Some(powerpc::LR));
    assert_eq!(ppc.layout().sp, powerpc::R1);
}

#[test]
fn test_print_registers()
{
    let decoder = ArchitectureDecoder::new(Architecture::X86_64);
    let mut registers = Registers::from_values(Architecture::X86_64, &[0; 27]);
    registers.set(RegisterId::Index(x86_64::EFLAGS), 0x246).unwrap();
    registers.set(RegisterId::Index(x86_64::RAX), 0x10).unwrap();

    assert_eq!(decoder.print_register(&registers, x86_64::EFLAGS).unwrap(), "[PF ZF IF]");
    assert_eq!(decoder.print_register(&registers, x86_64::RAX).unwrap(), "0000000000000010");
    assert_eq!(decoder.print_register(&registers, 99), None);

    let printed = decoder.print_registers(&registers);
    assert_eq!(printed.lines().count(), 5);
    assert!(printed.starts_with("RAX=0000000000000010"));

    let unknown = Registers::new(Architecture::X86_64);
    assert_eq!(decoder.print_register(&unknown, x86_64::RAX).unwrap(), "<invalid>");

    let ppc = ArchitectureDecoder::new(Architecture::PowerPc);
    let mut registers = Registers::from_values(Architecture::PowerPc, &[0; 38]);
    registers.set(RegisterId::Index(powerpc::CR), 0x8000_0000).unwrap();
    assert_eq!(ppc.print_register(&registers, powerpc::CR).unwrap(), "80000000 [LT]");
}
