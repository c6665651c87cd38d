//! The engine instance: owns one address space, one register file, one hook
//! registry and the execution controller driving them.

mod config;
mod control;
mod dispatch;

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::arch::x86::X86Insn;
use crate::arch::{new_cpu, Arch, Cpu, Flow, Mode};
use crate::hook::{
    CodeEvent, HookCallback, HookContext, HookHandle, HookRegistry, HookType, MemEvent, PortEvent,
};
use crate::memory::{AddressSpace, HostBuffer, MemRegion, Permissions};
use crate::registers::{Mmr, RegId};
use crate::{Error, Result};

pub use config::{EngineConfig, QueryType, StartOptions, DEFAULT_MAX_BLOCK_INSTRUCTIONS};
pub(crate) use config::EngineInfo;
pub(crate) use control::Control;
pub use control::{EngineState, ExitReason, StopHandle};
use dispatch::Dispatch;

/// A CPU emulator instance.
///
/// Created by [`Engine::open`] for an architecture/mode pair. Memory,
/// registers and hooks are configured through `&mut self` methods, and
/// [`Engine::start`] runs guest code on the calling thread until one of the
/// run's exit conditions holds. Hooks observe the run through a
/// [`HookContext`]. The only operation available from another thread is
/// [`StopHandle::stop`].
pub struct Engine {
    cpu: Box<dyn Cpu>,
    memory: AddressSpace,
    hooks: HookRegistry,
    control: Arc<Control>,
    info: EngineInfo,
    config: EngineConfig,
    state: EngineState,
}

impl Engine {
    /// Opens an engine with the default configuration.
    ///
    /// # Errors
    ///
    /// [`Error::ModeInvalid`] for an unsupported architecture/mode pair.
    pub fn open(arch: Arch, mode: Mode) -> Result<Self> {
        Self::open_with_config(arch, mode, EngineConfig::default())
    }

    /// Opens an engine with an explicit configuration.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for an invalid configuration and
    /// [`Error::ModeInvalid`] for an unsupported architecture/mode pair.
    pub fn open_with_config(arch: Arch, mode: Mode, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let cpu = new_cpu(arch, mode)?;
        debug!(?arch, ?mode, page_size = config.page_size, "engine opened");
        Ok(Self {
            cpu,
            memory: AddressSpace::new(config.page_size),
            hooks: HookRegistry::default(),
            control: Arc::new(Control::default()),
            info: EngineInfo {
                arch,
                mode,
                page_size: config.page_size,
            },
            config,
            state: EngineState::Idle,
        })
    }

    /// Releases every region and hook. Closing twice is a no-op; every other
    /// operation on a closed engine fails with [`Error::InvalidHandle`].
    ///
    /// # Errors
    ///
    /// Currently infallible.
    pub fn close(&mut self) -> Result<()> {
        if self.control.close() {
            self.memory.clear();
            self.hooks.clear();
            debug!("engine closed");
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.control.is_closed() {
            return Err(Error::InvalidHandle);
        }
        Ok(())
    }

    /// Guest architecture.
    #[must_use]
    pub const fn arch(&self) -> Arch {
        self.info.arch
    }

    /// Guest mode.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.info.mode
    }

    /// Configuration the engine was opened with.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// State left by the last run.
    #[must_use]
    pub const fn state(&self) -> EngineState {
        self.state
    }

    /// Maps a zeroed region with every permission.
    ///
    /// # Errors
    ///
    /// See [`Engine::mem_map_prot`].
    pub fn mem_map(&mut self, addr: u64, size: u64) -> Result<()> {
        self.mem_map_prot(addr, size, Permissions::ALL)
    }

    /// Maps a zeroed region owned by the engine.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a zero or unaligned range,
    /// [`Error::MapExists`] for an exact duplicate and [`Error::MapOverlap`]
    /// when the range intersects another region.
    pub fn mem_map_prot(&mut self, addr: u64, size: u64, perms: Permissions) -> Result<()> {
        self.ensure_open()?;
        self.memory.map(addr, size, perms)
    }

    /// Maps a region whose bytes live in a host buffer. The engine keeps a
    /// shared reference to the buffer and never frees it; the host sees every
    /// guest write.
    ///
    /// # Errors
    ///
    /// As [`Engine::mem_map_prot`], plus [`Error::InvalidArgument`] when the
    /// buffer is shorter than `size`.
    pub fn mem_map_backed(
        &mut self,
        addr: u64,
        size: u64,
        perms: Permissions,
        buffer: HostBuffer,
    ) -> Result<()> {
        self.ensure_open()?;
        self.memory.map_backed(addr, size, perms, buffer)
    }

    /// Changes permissions, splitting regions at the range edges.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a zero or unaligned range and
    /// [`Error::NoMem`] when the range is not fully mapped.
    pub fn mem_protect(&mut self, addr: u64, size: u64, perms: Permissions) -> Result<()> {
        self.ensure_open()?;
        self.memory.protect(addr, size, perms)
    }

    /// Unmaps a range.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a zero or unaligned range and
    /// [`Error::NoMem`] when the range is not fully mapped.
    pub fn mem_unmap(&mut self, addr: u64, size: u64) -> Result<()> {
        self.ensure_open()?;
        self.memory.unmap(addr, size)
    }

    /// Snapshot of the mapped regions in ascending address order.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidHandle`] after close.
    pub fn mem_regions(&self) -> Result<Vec<MemRegion>> {
        self.ensure_open()?;
        Ok(self.memory.regions())
    }

    /// Reads `len` bytes. Fires no hooks.
    ///
    /// # Errors
    ///
    /// [`Error::ReadUnmapped`] or [`Error::ReadProt`].
    pub fn mem_read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.memory.read_vec(addr, len)
    }

    /// Reads into a caller-provided buffer. Fires no hooks.
    ///
    /// # Errors
    ///
    /// [`Error::ReadUnmapped`] or [`Error::ReadProt`].
    pub fn mem_read_into(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        self.memory.read(addr, dst)
    }

    /// Writes bytes. Fires no hooks.
    ///
    /// # Errors
    ///
    /// [`Error::WriteUnmapped`] or [`Error::WriteProt`].
    pub fn mem_write(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.memory.write(addr, bytes)
    }

    /// Reads a scalar register.
    ///
    /// # Errors
    ///
    /// [`Error::RegisterInvalid`] for identifiers the guest lacks.
    pub fn reg_read(&self, reg: impl Into<RegId>) -> Result<u64> {
        self.ensure_open()?;
        self.cpu.reg_read(reg.into())
    }

    /// Writes a scalar register.
    ///
    /// # Errors
    ///
    /// [`Error::RegisterInvalid`] for identifiers the guest lacks.
    pub fn reg_write(&mut self, reg: impl Into<RegId>, value: u64) -> Result<()> {
        self.ensure_open()?;
        self.cpu.reg_write(reg.into(), value)
    }

    /// Reads an aggregate register such as `GDTR`.
    ///
    /// # Errors
    ///
    /// [`Error::RegisterInvalid`] for non-aggregate identifiers.
    pub fn reg_read_mmr(&self, reg: impl Into<RegId>) -> Result<Mmr> {
        self.ensure_open()?;
        self.cpu.reg_read_mmr(reg.into())
    }

    /// Writes an aggregate register such as `GDTR`.
    ///
    /// # Errors
    ///
    /// [`Error::RegisterInvalid`] for non-aggregate identifiers.
    pub fn reg_write_mmr(&mut self, reg: impl Into<RegId>, value: Mmr) -> Result<()> {
        self.ensure_open()?;
        self.cpu.reg_write_mmr(reg.into(), value)
    }

    /// Reads several scalar registers in order.
    ///
    /// # Errors
    ///
    /// The first [`Error::RegisterInvalid`] encountered.
    pub fn reg_read_batch(&self, regs: &[RegId]) -> Result<Vec<u64>> {
        self.ensure_open()?;
        regs.iter().map(|&reg| self.cpu.reg_read(reg)).collect()
    }

    /// Writes several scalar registers in order, stopping at the first
    /// failure; earlier writes stay applied.
    ///
    /// # Errors
    ///
    /// The first [`Error::RegisterInvalid`] encountered.
    pub fn reg_write_batch(&mut self, writes: &[(RegId, u64)]) -> Result<()> {
        self.ensure_open()?;
        writes
            .iter()
            .try_for_each(|&(reg, value)| self.cpu.reg_write(reg, value))
    }

    /// Registers a hook.
    ///
    /// `range` limits `CODE`, `BLOCK` and memory hooks to addresses inside
    /// it; `None` or an inverted range matches everything. For
    /// [`HookType::INSN`], `extra[0]` selects the instruction (see
    /// [`X86Insn`]).
    ///
    /// # Errors
    ///
    /// [`Error::HookTypeInvalid`] when `types` is empty, mixes callback
    /// families, does not match the callback, or names an instruction the
    /// backend cannot hook.
    pub fn hook_add(
        &mut self,
        types: HookType,
        callback: HookCallback,
        range: Option<RangeInclusive<u64>>,
        extra: &[i32],
    ) -> Result<HookHandle> {
        self.ensure_open()?;
        let insn = if types.contains(HookType::INSN) {
            let id = extra.first().copied().ok_or(Error::HookTypeInvalid)?;
            Some(self.cpu.insn_hook(id).ok_or(Error::HookTypeInvalid)?)
        } else {
            None
        };
        self.hooks.add(types, callback, range, insn)
    }

    /// Removes a hook.
    ///
    /// # Errors
    ///
    /// [`Error::HookNotFound`] for an unknown or already removed handle.
    pub fn hook_del(&mut self, handle: HookHandle) -> Result<()> {
        self.ensure_open()?;
        self.hooks.remove(handle)
    }

    /// `CODE` hook: runs before every instruction in `range`.
    ///
    /// # Errors
    ///
    /// See [`Engine::hook_add`].
    pub fn add_code_hook(
        &mut self,
        range: Option<RangeInclusive<u64>>,
        f: impl FnMut(&mut HookContext<'_>, &CodeEvent) + 'static,
    ) -> Result<HookHandle> {
        self.hook_add(HookType::CODE, HookCallback::code(f), range, &[])
    }

    /// `BLOCK` hook: runs on entry to every basic block in `range`.
    ///
    /// # Errors
    ///
    /// See [`Engine::hook_add`].
    pub fn add_block_hook(
        &mut self,
        range: Option<RangeInclusive<u64>>,
        f: impl FnMut(&mut HookContext<'_>, &CodeEvent) + 'static,
    ) -> Result<HookHandle> {
        self.hook_add(HookType::BLOCK, HookCallback::code(f), range, &[])
    }

    /// Valid-access memory hook for any of `MEM_READ`, `MEM_WRITE` and
    /// `MEM_READ_AFTER`.
    ///
    /// # Errors
    ///
    /// See [`Engine::hook_add`].
    pub fn add_mem_hook(
        &mut self,
        types: HookType,
        range: Option<RangeInclusive<u64>>,
        f: impl FnMut(&mut HookContext<'_>, &MemEvent) + 'static,
    ) -> Result<HookHandle> {
        self.hook_add(types, HookCallback::mem(f), range, &[])
    }

    /// Memory fault hook; returning `true` retries the access once.
    ///
    /// # Errors
    ///
    /// See [`Engine::hook_add`].
    pub fn add_fault_hook(
        &mut self,
        types: HookType,
        range: Option<RangeInclusive<u64>>,
        f: impl FnMut(&mut HookContext<'_>, &MemEvent) -> bool + 'static,
    ) -> Result<HookHandle> {
        self.hook_add(types, HookCallback::mem_fault(f), range, &[])
    }

    /// Interrupt hook.
    ///
    /// # Errors
    ///
    /// See [`Engine::hook_add`].
    pub fn add_intr_hook(
        &mut self,
        f: impl FnMut(&mut HookContext<'_>, u32) + 'static,
    ) -> Result<HookHandle> {
        self.hook_add(HookType::INTR, HookCallback::interrupt(f), None, &[])
    }

    /// Invalid-instruction hook; returning `true` continues the run.
    ///
    /// # Errors
    ///
    /// See [`Engine::hook_add`].
    pub fn add_insn_invalid_hook(
        &mut self,
        f: impl FnMut(&mut HookContext<'_>) -> bool + 'static,
    ) -> Result<HookHandle> {
        self.hook_add(HookType::INSN_INVALID, HookCallback::insn_invalid(f), None, &[])
    }

    /// x86 `IN` hook supplying the value read.
    ///
    /// # Errors
    ///
    /// [`Error::HookTypeInvalid`] on guests without port I/O.
    pub fn add_port_in_hook(
        &mut self,
        f: impl FnMut(&mut HookContext<'_>, &PortEvent) -> u32 + 'static,
    ) -> Result<HookHandle> {
        self.hook_add(
            HookType::INSN,
            HookCallback::port_in(f),
            None,
            &[X86Insn::In.id()],
        )
    }

    /// x86 `OUT` hook.
    ///
    /// # Errors
    ///
    /// [`Error::HookTypeInvalid`] on guests without port I/O.
    pub fn add_port_out_hook(
        &mut self,
        f: impl FnMut(&mut HookContext<'_>, &PortEvent) + 'static,
    ) -> Result<HookHandle> {
        self.hook_add(
            HookType::INSN,
            HookCallback::port_out(f),
            None,
            &[X86Insn::Out.id()],
        )
    }

    /// x86 `CPUID` hook; returning `true` replaces the built-in result.
    ///
    /// # Errors
    ///
    /// [`Error::HookTypeInvalid`] on guests without `CPUID`.
    pub fn add_cpuid_hook(
        &mut self,
        f: impl FnMut(&mut HookContext<'_>) -> bool + 'static,
    ) -> Result<HookHandle> {
        self.hook_add(
            HookType::INSN,
            HookCallback::cpuid(f),
            None,
            &[X86Insn::Cpuid.id()],
        )
    }

    /// Runs from `begin` until the program counter reaches `until`.
    ///
    /// # Errors
    ///
    /// See [`Engine::start_with_options`].
    pub fn start(&mut self, begin: u64, until: u64) -> Result<()> {
        self.start_with_options(begin, until, StartOptions::default())
    }

    /// Runs from `begin` until the program counter reaches `until`, the
    /// instruction or time budget is used up, a stop is requested or the
    /// guest halts. All of these return `Ok`; [`Engine::state`] tells them
    /// apart.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidHandle`] after close, [`Error::ArchMismatch`] for an
    /// entry address the mode cannot execute, [`Error::AlreadyRunning`] when
    /// a run is in progress, and the fault that ended the run otherwise.
    pub fn start_with_options(
        &mut self,
        begin: u64,
        until: u64,
        options: StartOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        self.cpu.check_entry(begin)?;
        self.control.begin_run()?;
        self.cpu.set_pc(begin);
        self.state = EngineState::Running;
        debug!(
            begin,
            until,
            timeout = options.timeout,
            count = options.count,
            hooks = self.hooks.len(),
            "run started"
        );

        let outcome = self.run(until & self.info.mode.address_mask(), options);
        self.control.end_run();
        match outcome {
            Ok((reason, retired)) => {
                debug!(?reason, retired, pc = self.cpu.pc(), "run finished");
                self.state = EngineState::Stopped(reason);
                Ok(())
            }
            Err(error) => {
                debug!(%error, pc = self.cpu.pc(), "run faulted");
                self.state = EngineState::Faulted(error);
                Err(error)
            }
        }
    }

    fn run(&mut self, until: u64, options: StartOptions) -> Result<(ExitReason, u64)> {
        let deadline = if options.timeout == 0 {
            None
        } else {
            Instant::now().checked_add(Duration::from_micros(options.timeout))
        };
        let max_block = self.config.max_block_instructions;
        let Self {
            cpu,
            memory,
            hooks,
            control,
            info,
            ..
        } = self;
        let control: &Control = control;
        let mut bus = Dispatch::new(memory, hooks, control, info);
        // Every dispatch counts against the budget, including ones a hook
        // skipped or redirected; `retired` only counts completed instructions.
        let mut steps = 0_u64;
        let mut retired = 0_u64;
        let mut block_start = true;

        loop {
            let pc = cpu.pc();
            if pc == until {
                return Ok((ExitReason::Until, retired));
            }
            if options.count != 0 && steps >= options.count {
                return Ok((ExitReason::CountExhausted, retired));
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                control.mark_timed_out();
                return Ok((ExitReason::Timeout, retired));
            }
            if control.stop_requested() {
                return Ok((ExitReason::StopRequested, retired));
            }

            if block_start {
                block_start = false;
                trace!(pc, "block entry");
                if bus.wants_blocks() {
                    let size = cpu.block_size(&bus, pc, max_block);
                    bus.block(cpu.registers(), pc, size);
                    if cpu.pc() != pc {
                        steps += 1;
                        block_start = true;
                        continue;
                    }
                }
            }

            let flow = cpu.step(&mut bus)?;
            steps += 1;
            if flow.retired() {
                retired += 1;
            }
            if flow == Flow::Halt {
                return Ok((ExitReason::Halted, retired));
            }
            block_start = flow.ends_block();
        }
    }

    /// Requests that the current run stop at the next instruction boundary.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidHandle`] after close and [`Error::NotRunning`] when
    /// idle.
    pub fn stop(&self) -> Result<()> {
        self.control.stop()
    }

    /// Handle for stopping runs of this engine from another thread.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(Arc::clone(&self.control))
    }

    /// Engine introspection.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidHandle`] after close.
    pub fn query(&self, query: QueryType) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.info.query(query, &self.control))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.control.close();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("arch", &self.info.arch)
            .field("mode", &self.info.mode)
            .field("state", &self.state)
            .field("regions", &self.memory.regions().len())
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}
