//! Instrumentation hooks: event kinds, payloads and typed callbacks.
//!
//! A hook is registered for a set of [`HookType`] bits that must all belong
//! to the family of its [`HookCallback`]. Matching hooks run synchronously on
//! the thread executing the guest, in registration order.

mod context;
mod registry;

use bitflags::bitflags;

use crate::memory::{AccessFault, MemAccess};

pub use context::HookContext;
pub(crate) use registry::HookRegistry;

bitflags! {
    /// Event kinds a hook can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HookType: u32 {
        /// Interrupt or trap raised by an instruction.
        const INTR = 1 << 0;
        /// A specific instruction selected by the hook's extra id.
        const INSN = 1 << 1;
        /// Before each instruction.
        const CODE = 1 << 2;
        /// On entry to each basic block.
        const BLOCK = 1 << 3;
        /// Load from unmapped memory.
        const MEM_READ_UNMAPPED = 1 << 4;
        /// Store to unmapped memory.
        const MEM_WRITE_UNMAPPED = 1 << 5;
        /// Fetch from unmapped memory.
        const MEM_FETCH_UNMAPPED = 1 << 6;
        /// Load from non-readable memory.
        const MEM_READ_PROT = 1 << 7;
        /// Store to non-writable memory.
        const MEM_WRITE_PROT = 1 << 8;
        /// Fetch from non-executable memory.
        const MEM_FETCH_PROT = 1 << 9;
        /// Before a valid load.
        const MEM_READ = 1 << 10;
        /// Before a valid store.
        const MEM_WRITE = 1 << 11;
        /// After a valid load, with the value read.
        const MEM_READ_AFTER = 1 << 13;
        /// Undecodable instruction.
        const INSN_INVALID = 1 << 14;

        /// Any unmapped access.
        const MEM_UNMAPPED = Self::MEM_READ_UNMAPPED.bits()
            | Self::MEM_WRITE_UNMAPPED.bits()
            | Self::MEM_FETCH_UNMAPPED.bits();
        /// Any protection violation.
        const MEM_PROT = Self::MEM_READ_PROT.bits()
            | Self::MEM_WRITE_PROT.bits()
            | Self::MEM_FETCH_PROT.bits();
        /// Any faulting access.
        const MEM_INVALID = Self::MEM_UNMAPPED.bits() | Self::MEM_PROT.bits();
        /// Any valid data access.
        const MEM_VALID = Self::MEM_READ.bits() | Self::MEM_WRITE.bits();
    }
}

/// Opaque identifier of a registered hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookHandle(u64);

impl HookHandle {
    /// Raw handle value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Instruction-level event (`CODE` and `BLOCK`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeEvent {
    /// Address of the instruction or block.
    pub address: u64,
    /// Instruction length, or block length in bytes.
    pub size: u32,
}

/// Kind of memory event delivered to memory hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemEventKind {
    /// Valid load, before it happens.
    Read,
    /// Valid store, before it happens.
    Write,
    /// Valid load, after it happened.
    ReadAfter,
    /// Load from unmapped memory.
    ReadUnmapped,
    /// Store to unmapped memory.
    WriteUnmapped,
    /// Fetch from unmapped memory.
    FetchUnmapped,
    /// Load from non-readable memory.
    ReadProt,
    /// Store to non-writable memory.
    WriteProt,
    /// Fetch from non-executable memory.
    FetchProt,
}

impl MemEventKind {
    /// Fault event for an access refused by the address space.
    #[must_use]
    pub const fn fault(access: MemAccess, fault: AccessFault) -> Self {
        match (access, fault) {
            (MemAccess::Read, AccessFault::Unmapped) => Self::ReadUnmapped,
            (MemAccess::Write, AccessFault::Unmapped) => Self::WriteUnmapped,
            (MemAccess::Fetch, AccessFault::Unmapped) => Self::FetchUnmapped,
            (MemAccess::Read, AccessFault::Protected) => Self::ReadProt,
            (MemAccess::Write, AccessFault::Protected) => Self::WriteProt,
            (MemAccess::Fetch, AccessFault::Protected) => Self::FetchProt,
        }
    }

    /// The single hook type bit that subscribes to this event.
    #[must_use]
    pub const fn hook_type(self) -> HookType {
        match self {
            Self::Read => HookType::MEM_READ,
            Self::Write => HookType::MEM_WRITE,
            Self::ReadAfter => HookType::MEM_READ_AFTER,
            Self::ReadUnmapped => HookType::MEM_READ_UNMAPPED,
            Self::WriteUnmapped => HookType::MEM_WRITE_UNMAPPED,
            Self::FetchUnmapped => HookType::MEM_FETCH_UNMAPPED,
            Self::ReadProt => HookType::MEM_READ_PROT,
            Self::WriteProt => HookType::MEM_WRITE_PROT,
            Self::FetchProt => HookType::MEM_FETCH_PROT,
        }
    }
}

/// Memory access event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemEvent {
    /// What happened.
    pub kind: MemEventKind,
    /// First byte accessed.
    pub address: u64,
    /// Access width in bytes.
    pub size: usize,
    /// Value stored, value loaded for [`MemEventKind::ReadAfter`], else `0`.
    pub value: u64,
}

/// Port I/O event for `IN`/`OUT` instruction hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortEvent {
    /// Port number.
    pub port: u16,
    /// Access width in bytes.
    pub size: u8,
    /// Value written by `OUT`; `0` for `IN`.
    pub value: u32,
}

type CodeFn = dyn FnMut(&mut HookContext<'_>, &CodeEvent);
type MemFn = dyn FnMut(&mut HookContext<'_>, &MemEvent);
type FaultFn = dyn FnMut(&mut HookContext<'_>, &MemEvent) -> bool;
type InterruptFn = dyn FnMut(&mut HookContext<'_>, u32);
type FlagFn = dyn FnMut(&mut HookContext<'_>) -> bool;
type PortInFn = dyn FnMut(&mut HookContext<'_>, &PortEvent) -> u32;
type PortOutFn = dyn FnMut(&mut HookContext<'_>, &PortEvent);

/// A typed hook callback; the variant fixes which events it can receive.
pub enum HookCallback {
    /// `CODE` and `BLOCK` events.
    Code(Box<CodeFn>),
    /// `MEM_READ`, `MEM_WRITE` and `MEM_READ_AFTER` events.
    Mem(Box<MemFn>),
    /// Unmapped and protection faults; returning `true` claims the fault
    /// was fixed and the access is retried once.
    MemFault(Box<FaultFn>),
    /// `INTR` events carrying the interrupt number.
    Interrupt(Box<InterruptFn>),
    /// `INSN_INVALID`; returning `true` continues the run.
    InsnInvalid(Box<FlagFn>),
    /// Port input instruction; returns the value read.
    PortIn(Box<PortInFn>),
    /// Port output instruction.
    PortOut(Box<PortOutFn>),
    /// `CPUID`; returning `true` skips the built-in result.
    Cpuid(Box<FlagFn>),
}

impl HookCallback {
    /// Wraps a `CODE`/`BLOCK` closure.
    pub fn code(f: impl FnMut(&mut HookContext<'_>, &CodeEvent) + 'static) -> Self {
        Self::Code(Box::new(f))
    }

    /// Wraps a valid-access memory closure.
    pub fn mem(f: impl FnMut(&mut HookContext<'_>, &MemEvent) + 'static) -> Self {
        Self::Mem(Box::new(f))
    }

    /// Wraps a memory-fault closure.
    pub fn mem_fault(f: impl FnMut(&mut HookContext<'_>, &MemEvent) -> bool + 'static) -> Self {
        Self::MemFault(Box::new(f))
    }

    /// Wraps an interrupt closure.
    pub fn interrupt(f: impl FnMut(&mut HookContext<'_>, u32) + 'static) -> Self {
        Self::Interrupt(Box::new(f))
    }

    /// Wraps an invalid-instruction closure.
    pub fn insn_invalid(f: impl FnMut(&mut HookContext<'_>) -> bool + 'static) -> Self {
        Self::InsnInvalid(Box::new(f))
    }

    /// Wraps a port-input closure.
    pub fn port_in(f: impl FnMut(&mut HookContext<'_>, &PortEvent) -> u32 + 'static) -> Self {
        Self::PortIn(Box::new(f))
    }

    /// Wraps a port-output closure.
    pub fn port_out(f: impl FnMut(&mut HookContext<'_>, &PortEvent) + 'static) -> Self {
        Self::PortOut(Box::new(f))
    }

    /// Wraps a `CPUID` closure.
    pub fn cpuid(f: impl FnMut(&mut HookContext<'_>) -> bool + 'static) -> Self {
        Self::Cpuid(Box::new(f))
    }

    /// Every hook type this callback family can subscribe to.
    #[must_use]
    pub const fn family(&self) -> HookType {
        match self {
            Self::Code(_) => HookType::CODE.union(HookType::BLOCK),
            Self::Mem(_) => HookType::MEM_VALID.union(HookType::MEM_READ_AFTER),
            Self::MemFault(_) => HookType::MEM_INVALID,
            Self::Interrupt(_) => HookType::INTR,
            Self::InsnInvalid(_) => HookType::INSN_INVALID,
            Self::PortIn(_) | Self::PortOut(_) | Self::Cpuid(_) => HookType::INSN,
        }
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::Code(_) => "code",
            Self::Mem(_) => "mem",
            Self::MemFault(_) => "mem_fault",
            Self::Interrupt(_) => "interrupt",
            Self::InsnInvalid(_) => "insn_invalid",
            Self::PortIn(_) => "port_in",
            Self::PortOut(_) => "port_out",
            Self::Cpuid(_) => "cpuid",
        }
    }
}

impl std::fmt::Debug for HookCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HookCallback").field(&self.name()).finish()
    }
}
