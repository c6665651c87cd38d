use crate::engine::{Control, EngineInfo, QueryType};
use crate::memory::{AddressSpace, HostBuffer, MemRegion, Permissions};
use crate::registers::{Mmr, RegId, RegisterFile};
use crate::Result;

/// Engine access granted to a hook callback while the guest is running.
///
/// Registers and memory can be read and modified, and a stop can be
/// requested; it takes effect once the current instruction completes.
/// Hooks cannot be added or removed and a nested run cannot be started from
/// here. Memory operations behave exactly like their [`crate::Engine`]
/// counterparts and fire no hooks.
pub struct HookContext<'a> {
    regs: &'a mut dyn RegisterFile,
    memory: &'a mut AddressSpace,
    control: &'a Control,
    info: &'a EngineInfo,
}

impl<'a> HookContext<'a> {
    pub(crate) fn new(
        regs: &'a mut dyn RegisterFile,
        memory: &'a mut AddressSpace,
        control: &'a Control,
        info: &'a EngineInfo,
    ) -> Self {
        Self {
            regs,
            memory,
            control,
            info,
        }
    }

    /// Reads a scalar register.
    ///
    /// # Errors
    ///
    /// [`crate::Error::RegisterInvalid`] for identifiers the guest lacks.
    pub fn reg_read(&self, reg: impl Into<RegId>) -> Result<u64> {
        self.regs.reg_read(reg.into())
    }

    /// Writes a scalar register. Writing the program counter from a `CODE`
    /// hook skips the instruction about to execute.
    ///
    /// # Errors
    ///
    /// [`crate::Error::RegisterInvalid`] for identifiers the guest lacks.
    pub fn reg_write(&mut self, reg: impl Into<RegId>, value: u64) -> Result<()> {
        self.regs.reg_write(reg.into(), value)
    }

    /// Reads an aggregate register.
    ///
    /// # Errors
    ///
    /// [`crate::Error::RegisterInvalid`] for non-aggregate identifiers.
    pub fn reg_read_mmr(&self, reg: impl Into<RegId>) -> Result<Mmr> {
        self.regs.reg_read_mmr(reg.into())
    }

    /// Writes an aggregate register.
    ///
    /// # Errors
    ///
    /// [`crate::Error::RegisterInvalid`] for non-aggregate identifiers.
    pub fn reg_write_mmr(&mut self, reg: impl Into<RegId>, value: Mmr) -> Result<()> {
        self.regs.reg_write_mmr(reg.into(), value)
    }

    /// Current program counter.
    #[must_use]
    pub fn pc(&self) -> u64 {
        self.regs.pc()
    }

    /// Moves the program counter.
    pub fn set_pc(&mut self, pc: u64) {
        self.regs.set_pc(pc);
    }

    /// Reads `len` bytes.
    ///
    /// # Errors
    ///
    /// [`crate::Error::ReadUnmapped`] or [`crate::Error::ReadProt`].
    pub fn mem_read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.memory.read_vec(addr, len)
    }

    /// Reads into a caller-provided buffer.
    ///
    /// # Errors
    ///
    /// [`crate::Error::ReadUnmapped`] or [`crate::Error::ReadProt`].
    pub fn mem_read_into(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        self.memory.read(addr, dst)
    }

    /// Writes bytes.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WriteUnmapped`] or [`crate::Error::WriteProt`].
    pub fn mem_write(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.memory.write(addr, bytes)
    }

    /// Maps a zeroed region.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::map`].
    pub fn mem_map(&mut self, addr: u64, size: u64, perms: Permissions) -> Result<()> {
        self.memory.map(addr, size, perms)
    }

    /// Maps a host-backed region.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::map_backed`].
    pub fn mem_map_backed(
        &mut self,
        addr: u64,
        size: u64,
        perms: Permissions,
        buffer: HostBuffer,
    ) -> Result<()> {
        self.memory.map_backed(addr, size, perms, buffer)
    }

    /// Changes permissions of a mapped range.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::protect`].
    pub fn mem_protect(&mut self, addr: u64, size: u64, perms: Permissions) -> Result<()> {
        self.memory.protect(addr, size, perms)
    }

    /// Unmaps a mapped range.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::unmap`].
    pub fn mem_unmap(&mut self, addr: u64, size: u64) -> Result<()> {
        self.memory.unmap(addr, size)
    }

    /// Snapshot of the mapped regions.
    #[must_use]
    pub fn mem_regions(&self) -> Vec<MemRegion> {
        self.memory.regions()
    }

    /// Engine introspection, as [`crate::Engine::query`].
    #[must_use]
    pub fn query(&self, query: QueryType) -> u64 {
        self.info.query(query, self.control)
    }

    /// Requests that the run stop after the current instruction.
    pub fn stop(&self) {
        self.control.request_stop();
    }
}

impl std::fmt::Debug for HookContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookContext")
            .field("pc", &self.regs.pc())
            .field("regions", &self.memory.regions().len())
            .finish_non_exhaustive()
    }
}
