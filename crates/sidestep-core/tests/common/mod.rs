//! Shared fixtures for the integration tests.
//!
//! [`MockProcess`] is a tiny x86-64 machine: enough of the instruction set to
//! run a prologue, a call, a return and a few special opcodes. Stepping and
//! continuing execute synchronously and queue the resulting stop, which the
//! tests feed back through `SteppingEngine::process_event` with [`pump`].
//!
//! Supported encodings:
//! - `90` nop, `55` push rbp, `48 89 e5` mov rbp,rsp, `5d` pop rbp
//! - `e8 rel32` call, `c3` ret, `e9 rel32` jmp, `49 bb imm64` movabs r11
//! - `f1` faults with `SIGSEGV`, `f4` exits with `rax` as the code
//! - `eb fe` spins until the thread is stopped

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{mpsc, Arc, Mutex};

use sidestep_core::arch::x86_64::{R11, RAX, RBP, RIP, RSP};
use sidestep_core::engine::{CoordinatorAction, EngineContext, SteppingEngine, ThreadCoordinator};
use sidestep_core::error::{DebuggerError, Result};
use sidestep_core::events::TargetEventArgs;
use sidestep_core::inferior::{ChildEvent, Inferior, TargetAccess};
use sidestep_core::process::{GlobalThreadLock, WaitSource};
use sidestep_core::symbols::{LanguageBackend, SymbolTable, SymbolTableManager};
use sidestep_core::types::{
    AddressDomain, Architecture, LineEntry, MemoryRegion, Method, ProcessId, RegisterId, Registers, SourceMethod,
    Symbol, TargetAddress, ThreadId,
};
use sidestep_core::unwind::cfi::CfiTable;
use sidestep_core::{BreakpointId, EngineConfig};

pub const MAIN: ThreadId = ThreadId(1);

pub const CODE_BASE: u64 = 0x1000;
pub const STACK_BASE: u64 = 0x7000;
pub const STACK_TOP: u64 = 0x7f00;

// main.c
pub const MAIN_START: u64 = 0x1000;
pub const MAIN_BODY: u64 = 0x1004;
pub const CALL_HELPER: u64 = 0x1006;
pub const AFTER_HELPER: u64 = 0x100b;
pub const CALL_NO_SOURCE: u64 = 0x100c;
pub const AFTER_NO_SOURCE: u64 = 0x1011;
pub const EXIT: u64 = 0x1012;
pub const MAIN_EPILOGUE: u64 = 0x1013;
pub const MAIN_END: u64 = 0x1015;

// helper.c
pub const HELPER_START: u64 = 0x1100;
pub const HELPER_BODY: u64 = 0x1104;
pub const HELPER_LINE_12: u64 = 0x1105;
pub const HELPER_EPILOGUE: u64 = 0x1106;
pub const HELPER_END: u64 = 0x1108;

// Code without line information.
pub const NO_SOURCE: u64 = 0x1200;
pub const NO_SOURCE_END: u64 = 0x1203;

pub const FAULT: u64 = 0x1300;
pub const SPIN: u64 = 0x1400;
pub const NATIVE_FUNCTION: u64 = 0x1500;

// Runtime entry points of the mock language backend.
pub const COMPILE_METHOD: u64 = 0x1600;
pub const RUNTIME_INVOKE: u64 = 0x1700;
pub const GENERIC_TRAMPOLINE: u64 = 0x1800;

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn addr(value: u64) -> TargetAddress
{
    TargetAddress::global(value)
}

/// `call rel32` from `from` to `to`.
pub fn call(from: u64, to: u64) -> Vec<u8>
{
    rel32(0xe8, from, to)
}

/// `jmp rel32` from `from` to `to`.
pub fn jump(from: u64, to: u64) -> Vec<u8>
{
    rel32(0xe9, from, to)
}

fn rel32(opcode: u8, from: u64, to: u64) -> Vec<u8>
{
    let displacement = (to as i64 - (from as i64 + 5)) as i32;
    let mut bytes = vec![opcode];
    bytes.extend_from_slice(&displacement.to_le_bytes());
    bytes
}

#[derive(Debug, Clone, Copy)]
struct MockBreakpoint
{
    address: u64,
    enabled: bool,
}

#[derive(Debug)]
struct ThreadState
{
    registers: Registers,
    pending: VecDeque<ChildEvent>,
    running: bool,
}

enum Outcome
{
    Next,
    Event(ChildEvent),
    Spin,
}

struct Machine
{
    regions: Vec<(u64, Vec<u8>)>,
    threads: HashMap<ThreadId, ThreadState>,
    breakpoints: BTreeMap<u32, MockBreakpoint>,
    next_breakpoint: u32,
    call_results: HashMap<u64, (u64, u64)>,
    notifier: Option<mpsc::Sender<(ThreadId, i32)>>,
    panic_on_event: bool,
}

impl Machine
{
    fn read(&self, address: u64, size: usize) -> Option<Vec<u8>>
    {
        self.regions.iter().find_map(|(base, bytes)| {
            let start = usize::try_from(address.checked_sub(*base)?).ok()?;
            bytes.get(start..start + size).map(<[u8]>::to_vec)
        })
    }

    fn write(&mut self, address: u64, data: &[u8]) -> bool
    {
        for (base, bytes) in &mut self.regions {
            let Some(start) = address.checked_sub(*base) else {
                continue;
            };
            let start = start as usize;
            if let Some(slot) = bytes.get_mut(start..start + data.len()) {
                slot.copy_from_slice(data);
                return true;
            }
        }
        false
    }

    fn read_u64(&self, address: u64) -> Option<u64>
    {
        let bytes = self.read(address, 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    fn thread(&mut self, thread: ThreadId) -> Result<&mut ThreadState>
    {
        self.threads.get_mut(&thread).ok_or(DebuggerError::NoTarget)
    }

    fn enabled_breakpoint_at(&self, address: u64) -> Option<u32>
    {
        self.breakpoints
            .iter()
            .find(|(_, breakpoint)| breakpoint.enabled && breakpoint.address == address)
            .map(|(id, _)| *id)
    }

    fn queue(&mut self, thread: ThreadId, event: ChildEvent)
    {
        if let Some(state) = self.threads.get_mut(&thread) {
            state.pending.push_back(event);
            state.running = false;
        }
        if let Some(notifier) = &self.notifier {
            let _ = notifier.send((thread, 0));
        }
    }

    fn execute(&mut self, thread: ThreadId) -> Outcome
    {
        let Some(registers) = self.threads.get(&thread).map(|state| state.registers.clone()) else {
            return Outcome::Event(ChildEvent::Exited { code: -1 });
        };
        let pc = registers.pc();
        let sp = registers.sp();
        let Some(code) = self.read(pc, 1) else {
            return Outcome::Event(ChildEvent::Stopped { signal: libc::SIGSEGV });
        };
        let mut next = registers.clone();
        let mut set = |id: RegisterId, value: u64| {
            let _ = next.set(id, value);
        };
        match code[0] {
            0x90 => set(RegisterId::Pc, pc + 1),
            0x55 => {
                let fp = registers.fp();
                if !self.write(sp - 8, &fp.to_le_bytes()) {
                    return Outcome::Event(ChildEvent::Stopped { signal: libc::SIGSEGV });
                }
                set(RegisterId::Sp, sp - 8);
                set(RegisterId::Pc, pc + 1);
            }
            0x48 if self.read(pc, 3).as_deref() == Some(&[0x48, 0x89, 0xe5][..]) => {
                set(RegisterId::Fp, sp);
                set(RegisterId::Pc, pc + 3);
            }
            0x49 if self.read(pc, 2).as_deref() == Some(&[0x49, 0xbb][..]) => {
                let Some(value) = self.read_u64(pc + 2) else {
                    return Outcome::Event(ChildEvent::Stopped { signal: libc::SIGSEGV });
                };
                set(RegisterId::Index(R11), value);
                set(RegisterId::Pc, pc + 10);
            }
            0x5d => {
                let Some(value) = self.read_u64(sp) else {
                    return Outcome::Event(ChildEvent::Stopped { signal: libc::SIGSEGV });
                };
                set(RegisterId::Fp, value);
                set(RegisterId::Sp, sp + 8);
                set(RegisterId::Pc, pc + 1);
            }
            opcode @ (0xe8 | 0xe9) => {
                let Some(bytes) = self.read(pc + 1, 4) else {
                    return Outcome::Event(ChildEvent::Stopped { signal: libc::SIGSEGV });
                };
                let displacement = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                let target = (pc as i64 + 5 + i64::from(displacement)) as u64;
                if opcode == 0xe8 {
                    if !self.write(sp - 8, &(pc + 5).to_le_bytes()) {
                        return Outcome::Event(ChildEvent::Stopped { signal: libc::SIGSEGV });
                    }
                    set(RegisterId::Sp, sp - 8);
                }
                set(RegisterId::Pc, target);
            }
            0xc3 => {
                let Some(target) = self.read_u64(sp) else {
                    return Outcome::Event(ChildEvent::Stopped { signal: libc::SIGSEGV });
                };
                set(RegisterId::Sp, sp + 8);
                set(RegisterId::Pc, target);
            }
            0xf1 => return Outcome::Event(ChildEvent::Stopped { signal: libc::SIGSEGV }),
            0xf4 => {
                let code = registers.value(RegisterId::Index(RAX)).unwrap_or(0);
                return Outcome::Event(ChildEvent::Exited { code: code as i32 });
            }
            0xeb if self.read(pc, 2).as_deref() == Some(&[0xeb, 0xfe][..]) => return Outcome::Spin,
            _ => return Outcome::Event(ChildEvent::Stopped { signal: libc::SIGILL }),
        }
        if let Some(state) = self.threads.get_mut(&thread) {
            state.registers = next;
        }
        Outcome::Next
    }
}

/// Shared state of a mock debuggee; clones refer to the same process.
#[derive(Clone)]
pub struct MockProcess
{
    machine: Arc<Mutex<Machine>>,
    log: Log,
}

impl MockProcess
{
    /// An empty x86-64 process with a stack mapping and no threads.
    pub fn new() -> Self
    {
        let machine = Machine {
            regions: vec![(STACK_BASE, vec![0; 0x1000])],
            threads: HashMap::new(),
            breakpoints: BTreeMap::new(),
            next_breakpoint: 1,
            call_results: HashMap::new(),
            notifier: None,
            panic_on_event: false,
        };
        Self {
            machine: Arc::new(Mutex::new(machine)),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The test program, with the main thread stopped at the start of `main`.
    pub fn program() -> Self
    {
        let process = Self::new();
        let mut code = vec![0x90; 0x900];
        let mut put = |address: u64, bytes: &[u8]| {
            let start = (address - CODE_BASE) as usize;
            code[start..start + bytes.len()].copy_from_slice(bytes);
        };

        put(MAIN_START, &[0x55, 0x48, 0x89, 0xe5, 0x90, 0x90]);
        put(CALL_HELPER, &call(CALL_HELPER, HELPER_START));
        put(AFTER_HELPER, &[0x90]);
        put(CALL_NO_SOURCE, &call(CALL_NO_SOURCE, NO_SOURCE));
        put(AFTER_NO_SOURCE, &[0x90, 0xf4, 0x5d, 0xc3]);

        put(HELPER_START, &[0x55, 0x48, 0x89, 0xe5, 0x90, 0x90, 0x5d, 0xc3]);
        put(NO_SOURCE, &[0x90, 0x90, 0xc3]);
        put(FAULT, &[0xf1]);
        put(SPIN, &[0xeb, 0xfe]);
        put(NATIVE_FUNCTION, &[0xc3]);

        process.map(CODE_BASE, code);
        process.add_thread(MAIN, MAIN_START, STACK_TOP);
        process
    }

    pub fn map(&self, base: u64, bytes: Vec<u8>)
    {
        self.machine().regions.push((base, bytes));
    }

    pub fn write(&self, address: u64, bytes: &[u8])
    {
        assert!(self.machine().write(address, bytes), "write to unmapped {address:#x}");
    }

    pub fn write_u64(&self, address: u64, value: u64)
    {
        self.write(address, &value.to_le_bytes());
    }

    /// Add a stopped thread at `pc` with stack pointer `sp`.
    pub fn add_thread(&self, thread: ThreadId, pc: u64, sp: u64)
    {
        let mut registers = Registers::from_values(Architecture::X86_64, &[0; 27]);
        let _ = registers.set(RegisterId::Index(RIP), pc);
        let _ = registers.set(RegisterId::Index(RSP), sp);
        let _ = registers.set(RegisterId::Index(RBP), 0);
        self.machine().threads.insert(
            thread,
            ThreadState {
                registers,
                pending: VecDeque::new(),
                running: false,
            },
        );
    }

    /// Control surface for `thread`.
    pub fn inferior(&self, thread: ThreadId) -> Box<dyn Inferior>
    {
        Box::new(MockInferior {
            process: self.clone(),
            thread,
        })
    }

    /// Make decoding the next reported event panic.
    pub fn panic_on_next_event(&self)
    {
        self.machine().panic_on_event = true;
    }

    /// Make the next breakpoint insertion hand out `id`.
    pub fn set_next_breakpoint_id(&self, id: u32)
    {
        self.machine().next_breakpoint = id;
    }

    /// Result words reported by a synthetic call to `function`.
    pub fn set_call_result(&self, function: u64, data1: u64, data2: u64)
    {
        self.machine().call_results.insert(function, (data1, data2));
    }

    /// Report `event` for `thread` as if the OS delivered it.
    pub fn inject(&self, thread: ThreadId, event: ChildEvent)
    {
        self.machine().queue(thread, event);
    }

    /// Drop the events `thread` reported but nobody consumed yet.
    pub fn discard_pending(&self, thread: ThreadId)
    {
        if let Some(state) = self.machine().threads.get_mut(&thread) {
            state.pending.clear();
        }
    }

    /// Announce every queued event on `sender`, as a wait loop would.
    pub fn attach_notifier(&self, sender: mpsc::Sender<(ThreadId, i32)>)
    {
        self.machine().notifier = Some(sender);
    }

    pub fn registers(&self, thread: ThreadId) -> Registers
    {
        self.machine().threads[&thread].registers.clone()
    }

    pub fn set_register(&self, thread: ThreadId, index: usize, value: u64)
    {
        if let Some(state) = self.machine().threads.get_mut(&thread) {
            let _ = state.registers.set(RegisterId::Index(index), value);
        }
    }

    pub fn pc(&self, thread: ThreadId) -> u64
    {
        self.registers(thread).pc()
    }

    pub fn is_running(&self, thread: ThreadId) -> bool
    {
        self.machine().threads.get(&thread).is_some_and(|state| state.running)
    }

    pub fn has_pending(&self, thread: ThreadId) -> bool
    {
        self.machine()
            .threads
            .get(&thread)
            .is_some_and(|state| !state.pending.is_empty())
    }

    /// Installed breakpoints as `(address, enabled)`, by id.
    pub fn breakpoints(&self) -> Vec<(u64, bool)>
    {
        self.machine()
            .breakpoints
            .values()
            .map(|breakpoint| (breakpoint.address, breakpoint.enabled))
            .collect()
    }

    pub fn log(&self) -> Log
    {
        Arc::clone(&self.log)
    }

    pub fn entries(&self) -> Vec<String>
    {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_log(&self)
    {
        self.log.lock().unwrap().clear();
    }

    fn machine(&self) -> std::sync::MutexGuard<'_, Machine>
    {
        self.machine.lock().unwrap()
    }

    fn record(&self, entry: String)
    {
        self.log.lock().unwrap().push(entry);
    }
}

/// One thread of a [`MockProcess`].
pub struct MockInferior
{
    process: MockProcess,
    thread: ThreadId,
}

impl TargetAccess for MockInferior
{
    fn architecture(&self) -> Architecture
    {
        Architecture::X86_64
    }

    fn address_domain(&self) -> AddressDomain
    {
        AddressDomain::global()
    }

    fn read_buffer(&self, address: TargetAddress, size: usize) -> Result<Vec<u8>>
    {
        self.process
            .machine()
            .read(address.value(), size)
            .ok_or(DebuggerError::MemoryAccess(address))
    }

    fn get_registers(&self) -> Result<Registers>
    {
        let mut machine = self.process.machine();
        Ok(machine.thread(self.thread)?.registers.clone())
    }
}

impl Inferior for MockInferior
{
    fn thread_id(&self) -> ThreadId
    {
        self.thread
    }

    fn process_id(&self) -> ProcessId
    {
        ProcessId(4242)
    }

    fn write_buffer(&mut self, address: TargetAddress, data: &[u8]) -> Result<()>
    {
        if self.process.machine().write(address.value(), data) {
            Ok(())
        } else {
            Err(DebuggerError::MemoryAccess(address))
        }
    }

    fn set_registers(&mut self, registers: &Registers) -> Result<()>
    {
        let mut machine = self.process.machine();
        machine.thread(self.thread)?.registers = registers.clone();
        Ok(())
    }

    fn step(&mut self) -> Result<()>
    {
        self.process.record(format!("step {}", self.thread));
        let mut machine = self.process.machine();
        let pc = machine.thread(self.thread)?.registers.pc();
        let event = match machine.enabled_breakpoint_at(pc) {
            Some(id) => ChildEvent::Breakpoint {
                id: BreakpointId::from_raw(id),
            },
            None => match machine.execute(self.thread) {
                Outcome::Next | Outcome::Spin => ChildEvent::Stopped { signal: libc::SIGTRAP },
                Outcome::Event(event) => event,
            },
        };
        machine.queue(self.thread, event);
        Ok(())
    }

    fn continue_execution(&mut self) -> Result<()>
    {
        self.process.record(format!("continue {}", self.thread));
        let mut machine = self.process.machine();
        for _ in 0..10_000 {
            let pc = machine.thread(self.thread)?.registers.pc();
            if let Some(id) = machine.enabled_breakpoint_at(pc) {
                machine.queue(self.thread, ChildEvent::Breakpoint {
                    id: BreakpointId::from_raw(id),
                });
                return Ok(());
            }
            match machine.execute(self.thread) {
                Outcome::Next => {}
                Outcome::Event(event) => {
                    machine.queue(self.thread, event);
                    return Ok(());
                }
                Outcome::Spin => break,
            }
        }
        machine.thread(self.thread)?.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<bool>
    {
        self.process.record(format!("stop {}", self.thread));
        let mut machine = self.process.machine();
        if !machine.thread(self.thread)?.running {
            return Ok(false);
        }
        machine.queue(self.thread, ChildEvent::Interrupted);
        Ok(true)
    }

    fn stop_and_wait(&mut self) -> Result<Option<ChildEvent>>
    {
        self.process.record(format!("stop_and_wait {}", self.thread));
        let mut machine = self.process.machine();
        let state = machine.thread(self.thread)?;
        if state.running {
            state.running = false;
            return Ok(None);
        }
        Ok(state.pending.pop_front())
    }

    fn insert_breakpoint(&mut self, address: TargetAddress) -> Result<BreakpointId>
    {
        let mut machine = self.process.machine();
        let id = machine.next_breakpoint;
        machine.next_breakpoint += 1;
        machine.breakpoints.insert(
            id,
            MockBreakpoint {
                address: address.value(),
                enabled: true,
            },
        );
        drop(machine);
        self.process.record(format!("insert {:#x} #{id}", address.value()));
        Ok(BreakpointId::from_raw(id))
    }

    fn insert_hardware_breakpoint(&mut self, address: TargetAddress, index: u32) -> Result<BreakpointId>
    {
        if index > 3 {
            return Err(DebuggerError::InvalidArgument(format!("no debug register {index}")));
        }
        self.insert_breakpoint(address)
    }

    fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<()>
    {
        self.process.record(format!("remove #{}", id.raw()));
        self.process.machine().breakpoints.remove(&id.raw());
        Ok(())
    }

    fn enable_breakpoint(&mut self, id: BreakpointId) -> Result<()>
    {
        self.process.record(format!("enable #{}", id.raw()));
        let mut machine = self.process.machine();
        let breakpoint = machine
            .breakpoints
            .get_mut(&id.raw())
            .ok_or(DebuggerError::NoSuchBreakpoint(id))?;
        breakpoint.enabled = true;
        Ok(())
    }

    fn disable_breakpoint(&mut self, id: BreakpointId) -> Result<()>
    {
        self.process.record(format!("disable #{}", id.raw()));
        let mut machine = self.process.machine();
        let breakpoint = machine
            .breakpoints
            .get_mut(&id.raw())
            .ok_or(DebuggerError::NoSuchBreakpoint(id))?;
        breakpoint.enabled = false;
        Ok(())
    }

    fn call_method(&mut self, method: TargetAddress, arguments: &[u64], callback_id: u64) -> Result<()>
    {
        self.process
            .record(format!("call {:#x} {arguments:x?} #{callback_id}", method.value()));
        let mut machine = self.process.machine();
        let (data1, data2) = machine.call_results.get(&method.value()).copied().unwrap_or_default();
        let state = machine.thread(self.thread)?;
        // The callee clobbers whatever it likes.
        let _ = state.registers.set(RegisterId::Pc, method.value());
        let _ = state.registers.set(RegisterId::Index(RAX), 0xdead);
        machine.queue(self.thread, ChildEvent::Callback {
            id: callback_id,
            data1,
            data2,
        });
        Ok(())
    }

    fn process_event(&mut self, _status: i32) -> Result<ChildEvent>
    {
        let mut machine = self.process.machine();
        let event = machine
            .thread(self.thread)?
            .pending
            .pop_front()
            .ok_or_else(|| DebuggerError::Internal(format!("no pending event for thread {}", self.thread)));
        let fail = std::mem::take(&mut machine.panic_on_event);
        drop(machine);
        if fail {
            panic!("corrupt wait status for thread {}", self.thread);
        }
        event
    }

    fn new_thread(&self, thread: ThreadId) -> Result<Box<dyn Inferior>>
    {
        if !self.process.machine().threads.contains_key(&thread) {
            return Err(DebuggerError::NoTarget);
        }
        Ok(self.process.inferior(thread))
    }

    fn get_memory_maps(&self) -> Result<Vec<MemoryRegion>>
    {
        let machine = self.process.machine();
        Ok(machine
            .regions
            .iter()
            .map(|(base, bytes)| {
                let permissions = if *base == STACK_BASE { "rw-p" } else { "r-xp" };
                MemoryRegion::new(addr(*base), addr(*base + bytes.len() as u64), permissions, None)
            })
            .collect())
    }
}

/// Symbol table over a fixed list of methods.
#[derive(Default)]
pub struct MockSymbols
{
    methods: Vec<Arc<Method>>,
    symbols: Vec<(String, u64)>,
    cfi: Vec<(u64, u64, Arc<CfiTable>)>,
}

impl MockSymbols
{
    pub fn with_method(mut self, method: Method) -> Self
    {
        self.methods.push(Arc::new(method));
        self
    }

    pub fn with_symbol(mut self, name: &str, address: u64) -> Self
    {
        self.symbols.push((name.to_string(), address));
        self
    }

    pub fn with_cfi(mut self, start: u64, end: u64, table: CfiTable) -> Self
    {
        self.cfi.push((start, end, Arc::new(table)));
        self
    }
}

impl SymbolTable for MockSymbols
{
    fn lookup(&self, address: TargetAddress) -> Option<Arc<Method>>
    {
        self.methods.iter().find(|method| method.contains(address)).cloned()
    }

    fn simple_lookup(&self, address: TargetAddress, exact_match: bool) -> Option<Symbol>
    {
        self.symbols
            .iter()
            .filter(|(_, start)| *start <= address.value())
            .max_by_key(|(_, start)| *start)
            .filter(|(_, start)| !exact_match || *start == address.value())
            .map(|(name, start)| Symbol {
                name: name.clone(),
                address: addr(*start),
                offset: address.value() - start,
            })
    }

    fn cfi_table(&self, address: TargetAddress) -> Option<Arc<CfiTable>>
    {
        self.cfi
            .iter()
            .find(|(start, end, _)| (*start..*end).contains(&address.value()))
            .map(|(_, _, table)| Arc::clone(table))
    }
}

pub fn main_method() -> Method
{
    let lines = [
        (MAIN_START, 1),
        (MAIN_BODY, 2),
        (CALL_HELPER, 3),
        (AFTER_HELPER, 4),
        (CALL_NO_SOURCE, 5),
        (AFTER_NO_SOURCE, 6),
        (EXIT, 7),
        (MAIN_EPILOGUE, 8),
    ];
    Method::new("main", addr(MAIN_START), addr(MAIN_END))
        .with_body(addr(MAIN_BODY), addr(MAIN_EPILOGUE))
        .with_source("main.c", line_table(&lines))
}

pub fn helper_method() -> Method
{
    let lines = [(HELPER_START, 10), (HELPER_BODY, 11), (HELPER_LINE_12, 12), (HELPER_EPILOGUE, 13)];
    Method::new("helper", addr(HELPER_START), addr(HELPER_END))
        .with_body(addr(HELPER_BODY), addr(HELPER_EPILOGUE))
        .with_source("helper.c", line_table(&lines))
}

pub fn line_table(lines: &[(u64, u32)]) -> Vec<LineEntry>
{
    lines
        .iter()
        .map(|&(address, line)| LineEntry {
            address: addr(address),
            line,
        })
        .collect()
}

/// Symbols of [`MockProcess::program`].
pub fn program_symbols() -> MockSymbols
{
    MockSymbols::default()
        .with_method(main_method())
        .with_method(helper_method())
        .with_method(Method::new("no_source", addr(NO_SOURCE), addr(NO_SOURCE_END)))
        .with_symbol("fault", FAULT)
        .with_symbol("spin", SPIN)
}

pub fn program_context(config: EngineConfig) -> EngineContext
{
    let symbols = SymbolTableManager::new();
    symbols.add_module(Arc::new(program_symbols()));
    EngineContext::new(Architecture::X86_64, config).with_symbols(symbols)
}

/// Engine for the main thread of a fresh [`MockProcess::program`].
pub fn program_engine() -> (MockProcess, SteppingEngine)
{
    sidestep_utils::init_test_logging();
    let process = MockProcess::program();
    let engine = SteppingEngine::new(process.inferior(MAIN), program_context(EngineConfig::default()), true);
    (process, engine)
}

/// Feed queued stops to `engine` until one ends the running command.
pub fn pump(engine: &mut SteppingEngine, coordinator: &mut dyn ThreadCoordinator) -> Option<TargetEventArgs>
{
    for _ in 0..100 {
        match engine.process_event(0, coordinator) {
            Ok(Some(args)) => return Some(args),
            Ok(None) => {}
            Err(DebuggerError::Internal(_)) => return None,
            Err(error) => panic!("event processing failed: {error}"),
        }
    }
    panic!("engine never finished its command");
}

/// Run a command and pump its events until it finishes.
pub fn run(
    engine: &mut SteppingEngine,
    coordinator: &mut RecordingCoordinator,
    command: impl FnOnce(&mut SteppingEngine, &mut dyn ThreadCoordinator) -> Result<Option<TargetEventArgs>>,
) -> TargetEventArgs
{
    match command(engine, &mut *coordinator).expect("command rejected") {
        Some(args) => args,
        None => pump(engine, &mut *coordinator).expect("no event completed the command"),
    }
}

/// Line number of the frame an event stopped in.
pub fn stop_line(args: &TargetEventArgs) -> Option<u32>
{
    args.frame.as_ref()?.location.as_ref().map(|location| location.line)
}

pub fn stop_address(args: &TargetEventArgs) -> Option<u64>
{
    args.frame.as_ref().map(|frame| frame.address().value())
}

/// Single-engine coordinator that logs lock traffic into a shared log.
pub struct RecordingCoordinator
{
    lock: GlobalThreadLock,
    log: Log,
}

impl RecordingCoordinator
{
    pub fn new(log: Log) -> Self
    {
        Self {
            lock: GlobalThreadLock::new(),
            log,
        }
    }

    pub fn holder(&self) -> Option<ThreadId>
    {
        self.lock.holder()
    }
}

impl ThreadCoordinator for RecordingCoordinator
{
    fn acquire_global_thread_lock(&mut self, caller: ThreadId) -> Result<()>
    {
        if !self.lock.try_acquire(caller)? {
            return Err(DebuggerError::Internal("lock is held".to_string()));
        }
        self.log.lock().unwrap().push(format!("acquire {caller}"));
        Ok(())
    }

    fn release_global_thread_lock(&mut self, caller: ThreadId) -> Result<()>
    {
        self.lock.release(caller)?;
        self.log.lock().unwrap().push(format!("release {caller}"));
        Ok(())
    }

    fn holds_global_thread_lock(&self, caller: ThreadId) -> bool
    {
        self.lock.is_held_by(caller)
    }

    fn handle_child_event(
        &mut self,
        _thread: ThreadId,
        _inferior: &mut dyn Inferior,
        _event: &ChildEvent,
    ) -> Result<CoordinatorAction>
    {
        Ok(CoordinatorAction::Ignored)
    }
}

/// Runtime hooks with fixed entry points.
pub struct MockLanguage;

impl LanguageBackend for MockLanguage
{
    fn compile_method_func(&self) -> TargetAddress
    {
        addr(COMPILE_METHOD)
    }

    fn runtime_invoke_func(&self) -> TargetAddress
    {
        addr(RUNTIME_INVOKE)
    }

    fn generic_trampoline_address(&self) -> TargetAddress
    {
        addr(GENERIC_TRAMPOLINE)
    }

    fn get_trampoline_address(&self, _memory: &dyn TargetAccess, _address: TargetAddress) -> Option<(TargetAddress, bool)>
    {
        None
    }

    fn get_trampoline(&self, _memory: &dyn TargetAccess, _address: TargetAddress) -> Option<SourceMethod>
    {
        None
    }

    fn exception_type_name(&self, _memory: &dyn TargetAccess, _exception: TargetAddress) -> Option<String>
    {
        Some("System.InvalidOperationException".to_string())
    }

    fn exception_message(&self, _memory: &dyn TargetAccess, exception: TargetAddress) -> Option<String>
    {
        Some(format!("thrown at {exception}"))
    }
}

/// Wait source fed by [`MockProcess::attach_notifier`].
pub struct ChannelWait
{
    receiver: mpsc::Receiver<(ThreadId, i32)>,
}

impl ChannelWait
{
    pub fn new(receiver: mpsc::Receiver<(ThreadId, i32)>) -> Self
    {
        Self { receiver }
    }
}

impl WaitSource for ChannelWait
{
    fn wait(&mut self) -> Result<Option<(ThreadId, i32)>>
    {
        Ok(self.receiver.recv().ok())
    }
}

/// Plain memory and a register snapshot, for decoder and unwinder tests.
pub struct FlatMemory
{
    architecture: Architecture,
    regions: Vec<(u64, Vec<u8>)>,
    registers: Registers,
}

impl FlatMemory
{
    pub fn new(architecture: Architecture) -> Self
    {
        Self {
            architecture,
            regions: Vec::new(),
            registers: Registers::new(architecture),
        }
    }

    pub fn with_bytes(mut self, base: u64, bytes: &[u8]) -> Self
    {
        self.regions.push((base, bytes.to_vec()));
        self
    }

    /// Store a pointer-sized word in the target's byte order.
    pub fn with_word(self, address: u64, value: u64) -> Self
    {
        let bytes = match (self.architecture.pointer_size_bytes(), self.architecture.is_big_endian()) {
            (8, _) => value.to_le_bytes().to_vec(),
            (_, true) => (value as u32).to_be_bytes().to_vec(),
            (_, false) => (value as u32).to_le_bytes().to_vec(),
        };
        self.with_bytes(address, &bytes)
    }

    pub fn with_register(mut self, index: usize, value: u64) -> Self
    {
        self.registers.set(RegisterId::Index(index), value).unwrap();
        self
    }

    pub fn registers(&self) -> Registers
    {
        self.registers.clone()
    }

    /// Innermost frame for the current registers.
    pub fn frame(&self) -> sidestep_core::types::SimpleStackFrame
    {
        sidestep_core::types::SimpleStackFrame::from_registers(addr(0), self.registers.clone())
    }
}

impl TargetAccess for FlatMemory
{
    fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    fn address_domain(&self) -> AddressDomain
    {
        AddressDomain::global()
    }

    fn read_buffer(&self, address: TargetAddress, size: usize) -> Result<Vec<u8>>
    {
        // Later regions shadow earlier ones, so single words can be patched in.
        self.regions
            .iter()
            .rev()
            .find_map(|(base, bytes)| {
                let start = usize::try_from(address.value().checked_sub(*base)?).ok()?;
                bytes.get(start..start + size).map(<[u8]>::to_vec)
            })
            .ok_or(DebuggerError::MemoryAccess(address))
    }

    fn get_registers(&self) -> Result<Registers>
    {
        Ok(self.registers.clone())
    }
}
