//! # Inferior Control Surface
//!
//! The contract the stepping engine needs from a native backend.
//!
//! One [`Inferior`] represents one OS thread under control. The engine owns its
//! inferior exclusively and calls into it from the engine thread only; the
//! backend is responsible for the OS mechanism (ptrace, a remote stub, a core
//! file) behind these calls.
//!
//! [`TargetAccess`] is the read-only subset used by the instruction decoder and
//! the stack unwinder, so those can run against a mock or a core file too.

use crate::breakpoints::BreakpointId;
use crate::error::{DebuggerError, Result};
use crate::types::{AddressDomain, Architecture, MemoryRegion, ProcessId, Registers, TargetAddress, ThreadId};

/// Structured low-level event produced from a raw wait status
///
/// This is the vocabulary the engine's state machine consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent
{
    /// The thread (or process) exited normally.
    Exited
    {
        /// Exit code.
        code: i32
    },
    /// The thread stopped with a signal.
    ///
    /// Signal 0 and `SIGTRAP` mean a requested single-step completed.
    Stopped
    {
        /// Signal number.
        signal: i32
    },
    /// The thread was killed by a signal.
    Signaled
    {
        /// Signal number.
        signal: i32
    },
    /// The thread stopped because the debugger asked it to.
    Interrupted,
    /// The thread hit a breakpoint; the program counter already points at the
    /// breakpoint address.
    Breakpoint
    {
        /// Registry id, or [`BreakpointId::UNKNOWN`] when the backend could not tell.
        id: BreakpointId
    },
    /// A synthetic call issued with [`Inferior::call_method`] returned.
    Callback
    {
        /// The callback id passed to `call_method`.
        id: u64,
        /// First result word.
        data1: u64,
        /// Second result word.
        data2: u64,
    },
    /// A new OS thread was created and is stopped.
    CreatedThread
    {
        /// The new thread.
        thread: ThreadId
    },
    /// The process called `exit()` and is still inspectable.
    CalledExit,
    /// A notification from the embedded runtime.
    Notification
    {
        /// Runtime-specific notification kind.
        kind: u32,
        /// First payload word.
        data1: u64,
        /// Second payload word.
        data2: u64,
    },
    /// The runtime is about to throw an exception.
    ThrowException
    {
        /// The exception object.
        exception: TargetAddress,
        /// Throwing instruction.
        ip: TargetAddress,
        /// Stack pointer of the throwing frame.
        stack_pointer: TargetAddress,
    },
    /// The runtime found a handler for an exception.
    HandleException
    {
        /// The exception object.
        exception: TargetAddress,
        /// Address of the handler.
        ip: TargetAddress,
        /// Stack pointer of the handler frame.
        stack_pointer: TargetAddress,
    },
    /// No handler exists for the exception.
    UnhandledException
    {
        /// The exception object.
        exception: TargetAddress,
        /// Throwing instruction.
        ip: TargetAddress,
    },
}

impl ChildEvent
{
    /// Whether this event means the thread is gone.
    #[must_use]
    pub fn is_terminal(&self) -> bool
    {
        matches!(self, ChildEvent::Exited { .. } | ChildEvent::Signaled { .. })
    }
}

/// One raw frame as reported by a backend's own stack walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame
{
    /// Program counter.
    pub address: TargetAddress,
    /// Stack pointer.
    pub stack_pointer: TargetAddress,
    /// Frame pointer.
    pub frame_address: TargetAddress,
}

/// Read-only view of a target's memory and registers
///
/// Implementations should return errors for unreadable memory and never panic.
/// Multi-byte reads honour the architecture's byte order.
pub trait TargetAccess
{
    /// Architecture of the target.
    fn architecture(&self) -> Architecture;

    /// Address domain of this target's address space.
    fn address_domain(&self) -> AddressDomain;

    /// Read `size` bytes starting at `address`.
    fn read_buffer(&self, address: TargetAddress, size: usize) -> Result<Vec<u8>>;

    /// Current register values of the thread.
    fn get_registers(&self) -> Result<Registers>;

    /// Read one byte.
    fn read_byte(&self, address: TargetAddress) -> Result<u8>
    {
        let bytes = self.read_buffer(address, 1)?;
        bytes.first().copied().ok_or(DebuggerError::MemoryAccess(address))
    }

    /// Read a 32-bit integer.
    fn read_integer(&self, address: TargetAddress) -> Result<i32>
    {
        let bytes = self.read_buffer(address, 4)?;
        let value = decode_word(&bytes, self.architecture().is_big_endian()).ok_or(DebuggerError::MemoryAccess(address))?;
        Ok(value as i32)
    }

    /// Read a 64-bit integer.
    fn read_long_integer(&self, address: TargetAddress) -> Result<i64>
    {
        let bytes = self.read_buffer(address, 8)?;
        let value = decode_word(&bytes, self.architecture().is_big_endian()).ok_or(DebuggerError::MemoryAccess(address))?;
        Ok(value as i64)
    }

    /// Read a pointer-sized value as an address in this target's domain.
    fn read_address(&self, address: TargetAddress) -> Result<TargetAddress>
    {
        let size = usize::from(self.architecture().pointer_size_bytes());
        let bytes = self.read_buffer(address, size)?;
        let value = decode_word(&bytes, self.architecture().is_big_endian()).ok_or(DebuggerError::MemoryAccess(address))?;
        Ok(TargetAddress::new(self.address_domain(), value))
    }

    /// Read a NUL-terminated string of at most `max_length` bytes.
    fn read_string(&self, address: TargetAddress, max_length: usize) -> Result<String>
    {
        let mut bytes = Vec::new();
        let mut cursor = address;
        while bytes.len() < max_length {
            let byte = self.read_byte(cursor)?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            cursor = cursor + 1;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Control surface for one OS thread of the debuggee
///
/// Every call happens on the engine thread. Methods that resume the thread
/// (`step`, `continue_execution`, `call_method`) return immediately; the
/// resulting stop arrives later as a raw wait status which the engine hands
/// back to [`Inferior::process_event`].
pub trait Inferior: TargetAccess + Send
{
    /// OS thread this inferior controls.
    fn thread_id(&self) -> ThreadId;

    /// Process the thread belongs to.
    fn process_id(&self) -> ProcessId;

    /// Write `data` at `address`.
    fn write_buffer(&mut self, address: TargetAddress, data: &[u8]) -> Result<()>;

    /// Replace the thread's registers.
    fn set_registers(&mut self, registers: &Registers) -> Result<()>;

    /// Single-step one machine instruction.
    fn step(&mut self) -> Result<()>;

    /// Resume the thread.
    fn continue_execution(&mut self) -> Result<()>;

    /// Ask a running thread to stop; returns `false` if it was already stopped.
    ///
    /// The stop is reported later as [`ChildEvent::Interrupted`].
    fn stop(&mut self) -> Result<bool>;

    /// Stop the thread and wait for it synchronously.
    ///
    /// Returns the event the thread reported instead of the interrupt when it
    /// stopped on its own first (e.g. it hit a breakpoint), or `None` when the
    /// interrupt was consumed.
    fn stop_and_wait(&mut self) -> Result<Option<ChildEvent>>;

    /// Insert a software breakpoint; returns its id (> 0).
    fn insert_breakpoint(&mut self, address: TargetAddress) -> Result<BreakpointId>;

    /// Insert a hardware breakpoint using debug register `index`.
    fn insert_hardware_breakpoint(&mut self, address: TargetAddress, index: u32) -> Result<BreakpointId>;

    /// Remove a breakpoint.
    fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<()>;

    /// Re-arm a disabled breakpoint.
    fn enable_breakpoint(&mut self, id: BreakpointId) -> Result<()>;

    /// Temporarily restore the original instruction of a breakpoint.
    fn disable_breakpoint(&mut self, id: BreakpointId) -> Result<()>;

    /// Call `method` in the target with `arguments`.
    ///
    /// Completion is delivered as [`ChildEvent::Callback`] carrying `callback_id`.
    fn call_method(&mut self, method: TargetAddress, arguments: &[u64], callback_id: u64) -> Result<()>;

    /// Interpret a raw wait status.
    fn process_event(&mut self, status: i32) -> Result<ChildEvent>;

    /// Control surface for a thread reported by [`ChildEvent::CreatedThread`].
    fn new_thread(&self, thread: ThreadId) -> Result<Box<dyn Inferior>>;

    /// Mapped regions of the address space.
    fn get_memory_maps(&self) -> Result<Vec<MemoryRegion>>;

    /// Current program counter.
    fn current_frame(&self) -> Result<TargetAddress>
    {
        let registers = self.get_registers()?;
        Ok(TargetAddress::new(self.address_domain(), registers.pc()))
    }

    /// The backend's own stack walk, if it has one.
    fn get_backtrace(&self, max_frames: usize, stop_address: Option<TargetAddress>) -> Result<Vec<RawFrame>>
    {
        let _ = (max_frames, stop_address);
        Err(DebuggerError::NotImplemented("native backtrace"))
    }

    /// Write one byte.
    fn write_byte(&mut self, address: TargetAddress, value: u8) -> Result<()>
    {
        self.write_buffer(address, &[value])
    }

    /// Write a 32-bit integer.
    fn write_integer(&mut self, address: TargetAddress, value: i32) -> Result<()>
    {
        let bytes = encode_word(value as u32 as u64, 4, self.architecture().is_big_endian());
        self.write_buffer(address, &bytes)
    }

    /// Write a 64-bit integer.
    fn write_long_integer(&mut self, address: TargetAddress, value: i64) -> Result<()>
    {
        let bytes = encode_word(value as u64, 8, self.architecture().is_big_endian());
        self.write_buffer(address, &bytes)
    }

    /// Write a pointer-sized value.
    fn write_address(&mut self, address: TargetAddress, value: TargetAddress) -> Result<()>
    {
        let size = usize::from(self.architecture().pointer_size_bytes());
        let bytes = encode_word(value.value(), size, self.architecture().is_big_endian());
        self.write_buffer(address, &bytes)
    }
}

/// Decode up to eight bytes as an unsigned integer.
#[must_use]
pub fn decode_word(bytes: &[u8], big_endian: bool) -> Option<u64>
{
    if bytes.is_empty() || bytes.len() > 8 {
        return None;
    }
    let fold = |value: u64, byte: &u8| (value << 8) | u64::from(*byte);
    Some(if big_endian {
        bytes.iter().fold(0, fold)
    } else {
        bytes.iter().rev().fold(0, fold)
    })
}

/// Encode the low `size` bytes of `value`.
#[must_use]
pub fn encode_word(value: u64, size: usize, big_endian: bool) -> Vec<u8>
{
    let mut bytes: Vec<u8> = (0..size).map(|index| (value >> (index * 8)) as u8).collect();
    if big_endian {
        bytes.reverse();
    }
    bytes
}
