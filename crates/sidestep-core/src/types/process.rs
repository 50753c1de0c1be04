//! Process, thread and architecture identification types.

use std::fmt;

use super::TargetAddress;

/// Process identifier
///
/// On Linux this is the kernel PID of the thread-group leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

/// Thread identifier
///
/// Uniquely identifies one OS thread of the debuggee. Each thread is driven by
/// exactly one single-stepping engine, so this doubles as the engine key in the
/// thread manager.
///
/// The value `0` is never a real thread; the breakpoint registry uses it as the
/// "any thread" owner tag.
///
/// ## Example
///
/// ```rust
/// use sidestep_core::types::ThreadId;
///
/// let thread = ThreadId::from(12345);
/// assert_eq!(thread.raw(), 12345);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl ThreadId
{
    /// Get the raw `u64` representation of the thread identifier
    pub fn raw(&self) -> u64
    {
        self.0
    }
}

impl From<u64> for ThreadId
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "@{}", self.0)
    }
}

/// A mapped region of the target's address space
///
/// Returned by the inferior's memory-map query; mirrors one line of
/// `/proc/<pid>/maps` on Linux.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion
{
    /// Start address of the memory region (inclusive)
    pub start: TargetAddress,
    /// End address of the memory region (exclusive)
    pub end: TargetAddress,
    /// Memory permissions as a string such as `"r-xp"`
    pub permissions: String,
    /// Optional backing file or pseudo-name (`[heap]`, `[stack]`)
    pub name: Option<String>,
}

impl MemoryRegion
{
    /// Create a new memory region
    pub fn new(start: TargetAddress, end: TargetAddress, permissions: impl Into<String>, name: Option<String>) -> Self
    {
        Self {
            start,
            end,
            permissions: permissions.into(),
            name,
        }
    }

    /// Size of the region in bytes (0 if `end <= start`)
    pub fn size(&self) -> u64
    {
        self.end.value().saturating_sub(self.start.value())
    }

    /// Check if the region is executable
    pub fn is_executable(&self) -> bool
    {
        self.permissions.contains('x')
    }

    /// Check if `address` falls inside the region
    pub fn contains(&self, address: TargetAddress) -> bool
    {
        address.is_in_range(self.start, self.end)
    }
}

/// CPU architecture of the debuggee
///
/// Selected once at attach time (usually from the target triple) and used to
/// pick the instruction decoder, register layout and unwinding rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture
{
    /// 32-bit x86 (IA-32)
    I386,
    /// 64-bit x86 (Intel/AMD)
    X86_64,
    /// 32-bit big-endian PowerPC
    PowerPc,
}

impl Architecture
{
    /// Detect the architecture from a target triple such as `x86_64-unknown-linux-gnu`.
    #[must_use]
    pub fn from_target_triple(triple: &str) -> Option<Self>
    {
        let cpu = triple.split('-').next()?;
        match cpu {
            "i386" | "i486" | "i586" | "i686" | "x86" => Some(Architecture::I386),
            "x86_64" | "amd64" => Some(Architecture::X86_64),
            "powerpc" | "ppc" => Some(Architecture::PowerPc),
            _ => None,
        }
    }

    /// Size of a pointer in bytes for this architecture.
    #[must_use]
    pub const fn pointer_size_bytes(self) -> u8
    {
        match self {
            Architecture::I386 | Architecture::PowerPc => 4,
            Architecture::X86_64 => 8,
        }
    }

    /// Whether multi-byte values are stored most significant byte first.
    #[must_use]
    pub const fn is_big_endian(self) -> bool
    {
        matches!(self, Architecture::PowerPc)
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Architecture::I386 => write!(f, "i386"),
            Architecture::X86_64 => write!(f, "x86_64"),
            Architecture::PowerPc => write!(f, "powerpc"),
        }
    }
}
