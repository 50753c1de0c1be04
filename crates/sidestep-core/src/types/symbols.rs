//! Method, line-table and source location types.
//!
//! These are the shapes the engine consumes from symbol resolution; reading
//! them out of DWARF or a runtime's debug tables is the symbol reader's job.

use std::fmt;

use super::TargetAddress;

/// One row of a method's line table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry
{
    /// First address belonging to `line`.
    pub address: TargetAddress,
    /// Source line number.
    pub line: u32,
}

/// Address range covered by one source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange
{
    /// First address of the line (inclusive).
    pub start: TargetAddress,
    /// First address after the line (exclusive).
    pub end: TargetAddress,
    /// Source line number.
    pub line: u32,
}

/// A resolved source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation
{
    /// Source file path.
    pub file: String,
    /// 1-based line number.
    pub line: u32,
    /// Distance in bytes from the first address of the line.
    ///
    /// Non-zero means execution is in the middle of a line, which is never a
    /// good place to report a source-level stop.
    pub line_offset: u64,
}

impl fmt::Display for SourceLocation
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        if self.line_offset == 0 {
            write!(f, "{}:{}", self.file, self.line)
        } else {
            write!(f, "{}:{}+{:#x}", self.file, self.line, self.line_offset)
        }
    }
}

/// A method (function) known to symbol resolution
///
/// `start..end` is the whole machine code; `method_start..method_end` is the
/// body between prologue and epilogue. Source-level stepping never reports a
/// stop outside the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method
{
    /// Display name.
    pub name: String,
    /// First byte of the method's code.
    pub start: TargetAddress,
    /// First byte after the method's code.
    pub end: TargetAddress,
    /// First address after the prologue.
    pub method_start: TargetAddress,
    /// First address of the epilogue.
    pub method_end: TargetAddress,
    /// Source file, when debug information is available.
    pub file: Option<String>,
    /// Line table sorted by address.
    pub lines: Vec<LineEntry>,
    /// Whether this is a runtime-generated wrapper stub.
    pub is_wrapper: bool,
}

impl Method
{
    /// A method without source information covering `[start, end)`.
    #[must_use]
    pub fn new(name: impl Into<String>, start: TargetAddress, end: TargetAddress) -> Self
    {
        Self {
            name: name.into(),
            start,
            end,
            method_start: start,
            method_end: end,
            file: None,
            lines: Vec::new(),
            is_wrapper: false,
        }
    }

    /// Set the prologue/epilogue boundaries.
    #[must_use]
    pub fn with_body(mut self, method_start: TargetAddress, method_end: TargetAddress) -> Self
    {
        self.method_start = method_start;
        self.method_end = method_end;
        self
    }

    /// Attach a source file and line table.
    #[must_use]
    pub fn with_source(mut self, file: impl Into<String>, mut lines: Vec<LineEntry>) -> Self
    {
        lines.sort_by_key(|entry| entry.address.value());
        self.file = Some(file.into());
        self.lines = lines;
        self
    }

    /// Mark the method as a runtime wrapper.
    #[must_use]
    pub fn wrapper(mut self) -> Self
    {
        self.is_wrapper = true;
        self
    }

    /// Whether `address` is inside the method's code.
    #[must_use]
    pub fn contains(&self, address: TargetAddress) -> bool
    {
        address.is_in_range(self.start, self.end)
    }

    /// Whether line information is available.
    #[must_use]
    pub fn has_source(&self) -> bool
    {
        self.file.is_some() && !self.lines.is_empty()
    }

    /// Whether `address` lies before the end of the prologue.
    #[must_use]
    pub fn is_in_prologue(&self, address: TargetAddress) -> bool
    {
        address.is_in_range(self.start, self.method_start)
    }

    /// Whether `address` lies in the epilogue.
    #[must_use]
    pub fn is_in_epilogue(&self, address: TargetAddress) -> bool
    {
        address.is_in_range(self.method_end, self.end)
    }

    /// Size of the method's code in bytes.
    #[must_use]
    pub fn code_size(&self) -> u64
    {
        self.end.value().saturating_sub(self.start.value())
    }

    /// Address range of the source line containing `address`.
    #[must_use]
    pub fn line_range(&self, address: TargetAddress) -> Option<LineRange>
    {
        if !self.contains(address) {
            return None;
        }
        let position = self.lines.partition_point(|entry| entry.address.value() <= address.value());
        let entry = self.lines.get(position.checked_sub(1)?)?;
        let end = self.lines[position..]
            .iter()
            .find(|next| next.line != entry.line)
            .map_or(self.end, |next| next.address);
        Some(LineRange {
            start: entry.address,
            end,
            line: entry.line,
        })
    }

    /// Source location for `address`.
    #[must_use]
    pub fn source_location(&self, address: TargetAddress) -> Option<SourceLocation>
    {
        let file = self.file.as_ref()?;
        let range = self.line_range(address)?;
        Some(SourceLocation {
            file: file.clone(),
            line: range.line,
            line_offset: address.value() - range.start.value(),
        })
    }
}

impl fmt::Display for Method
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.name)
    }
}

/// A plain symbol-table hit (no line information).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol
{
    /// Symbol name.
    pub name: String,
    /// Address of the symbol.
    pub address: TargetAddress,
    /// Offset of the looked-up address from `address`.
    pub offset: u64,
}

impl fmt::Display for Symbol
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        if self.offset == 0 {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}+{:#x}", self.name, self.offset)
        }
    }
}

/// A method as described by the language runtime before it is compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMethod
{
    /// Method name.
    pub name: String,
    /// Whether stepping into it would reach user source.
    pub has_source: bool,
}
