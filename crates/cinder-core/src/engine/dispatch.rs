//! The run loop's [`Bus`]: guest memory accesses and architecture events
//! routed through the address space and the hook registry.

use tracing::debug;

use super::config::EngineInfo;
use super::control::Control;
use crate::arch::Bus;
use crate::hook::{
    CodeEvent, HookContext, HookRegistry, HookType, MemEvent, MemEventKind, PortEvent,
};
use crate::memory::{AddressSpace, MemAccess};
use crate::registers::RegisterFile;
use crate::{Error, Result};

pub(crate) struct Dispatch<'a> {
    memory: &'a mut AddressSpace,
    hooks: &'a mut HookRegistry,
    control: &'a Control,
    info: &'a EngineInfo,
    mask: u64,
}

impl<'a> Dispatch<'a> {
    pub(crate) fn new(
        memory: &'a mut AddressSpace,
        hooks: &'a mut HookRegistry,
        control: &'a Control,
        info: &'a EngineInfo,
    ) -> Self {
        Self {
            memory,
            hooks,
            control,
            info,
            mask: info.mode.address_mask(),
        }
    }

    /// Splits into the hook table and a context for its callbacks.
    fn split<'b>(
        &'b mut self,
        regs: &'b mut dyn RegisterFile,
    ) -> (&'b mut HookRegistry, HookContext<'b>) {
        let ctx = HookContext::new(regs, &mut *self.memory, self.control, self.info);
        (&mut *self.hooks, ctx)
    }

    pub(crate) fn wants_blocks(&self) -> bool {
        self.hooks.has(HookType::BLOCK)
    }

    /// Fires `BLOCK` hooks for the block entered at `address`.
    pub(crate) fn block(&mut self, regs: &mut dyn RegisterFile, address: u64, size: u32) {
        let event = CodeEvent { address, size };
        let (hooks, mut ctx) = self.split(regs);
        hooks.fire_code(&mut ctx, HookType::BLOCK, &event);
    }

    /// Permission check for a guest access. A fault is offered to the fault
    /// hooks; when one claims it the access is checked once more.
    fn ensure(
        &mut self,
        regs: &mut dyn RegisterFile,
        address: u64,
        size: usize,
        access: MemAccess,
        value: u64,
    ) -> Result<()> {
        let Err(fault) = self.memory.check(address, size, access) else {
            return Ok(());
        };
        let error = fault.error(access);
        let event = MemEvent {
            kind: MemEventKind::fault(access, fault),
            address,
            size,
            value,
        };

        let (hooks, mut ctx) = self.split(regs);
        let handled = hooks.fire_fault(&mut ctx, &event);
        if handled && self.memory.check(address, size, access).is_ok() {
            return Ok(());
        }
        debug!(address, size, ?access, handled, %error, "unhandled memory fault");
        Err(error)
    }

    fn fire_mem(&mut self, regs: &mut dyn RegisterFile, event: &MemEvent) {
        if self.hooks.has(event.kind.hook_type()) {
            let (hooks, mut ctx) = self.split(regs);
            hooks.fire_mem(&mut ctx, event);
        }
    }
}

impl Bus for Dispatch<'_> {
    fn fetch(&mut self, regs: &mut dyn RegisterFile, addr: u64, dst: &mut [u8]) -> Result<()> {
        let addr = addr & self.mask;
        self.ensure(regs, addr, dst.len(), MemAccess::Fetch, 0)?;
        self.memory.copy_out(addr, dst);
        Ok(())
    }

    fn load(&mut self, regs: &mut dyn RegisterFile, addr: u64, size: usize) -> Result<u64> {
        let address = addr & self.mask;
        let mut raw = [0; 8];
        let bytes = raw.get_mut(..size).ok_or(Error::InvalidArgument)?;
        self.ensure(regs, address, size, MemAccess::Read, 0)?;
        self.fire_mem(
            regs,
            &MemEvent {
                kind: MemEventKind::Read,
                address,
                size,
                value: 0,
            },
        );
        self.memory.copy_out(address, bytes);
        let value = u64::from_le_bytes(raw);
        self.fire_mem(
            regs,
            &MemEvent {
                kind: MemEventKind::ReadAfter,
                address,
                size,
                value,
            },
        );
        Ok(value)
    }

    fn store(
        &mut self,
        regs: &mut dyn RegisterFile,
        addr: u64,
        size: usize,
        value: u64,
    ) -> Result<()> {
        let address = addr & self.mask;
        let raw = value.to_le_bytes();
        let bytes = raw.get(..size).ok_or(Error::InvalidArgument)?;
        self.ensure(regs, address, size, MemAccess::Write, value)?;
        self.fire_mem(
            regs,
            &MemEvent {
                kind: MemEventKind::Write,
                address,
                size,
                value,
            },
        );
        self.memory.copy_in(address, bytes);
        Ok(())
    }

    fn peek(&self, addr: u64, dst: &mut [u8]) -> bool {
        let addr = addr & self.mask;
        if self.memory.check(addr, dst.len(), MemAccess::Fetch).is_err() {
            return false;
        }
        self.memory.copy_out(addr, dst);
        true
    }

    fn code(&mut self, regs: &mut dyn RegisterFile, addr: u64, size: u32) -> Result<()> {
        if self.hooks.has(HookType::CODE) {
            let event = CodeEvent {
                address: addr,
                size,
            };
            let (hooks, mut ctx) = self.split(regs);
            hooks.fire_code(&mut ctx, HookType::CODE, &event);
        }
        Ok(())
    }

    fn interrupt(&mut self, regs: &mut dyn RegisterFile, intno: u32) -> Result<()> {
        let (hooks, mut ctx) = self.split(regs);
        if hooks.fire_interrupt(&mut ctx, intno) {
            return Ok(());
        }
        debug!(intno, "interrupt without handler");
        Err(Error::Exception)
    }

    fn invalid_insn(&mut self, regs: &mut dyn RegisterFile) -> Result<()> {
        let pc = regs.pc();
        let (hooks, mut ctx) = self.split(regs);
        if hooks.fire_insn_invalid(&mut ctx) {
            return Ok(());
        }
        debug!(pc, "invalid instruction");
        Err(Error::InsnInvalid)
    }

    fn port_in(&mut self, regs: &mut dyn RegisterFile, port: u16, size: u8) -> u32 {
        let event = PortEvent {
            port,
            size,
            value: 0,
        };
        let (hooks, mut ctx) = self.split(regs);
        hooks.fire_port_in(&mut ctx, &event).unwrap_or(0)
    }

    fn port_out(&mut self, regs: &mut dyn RegisterFile, port: u16, size: u8, value: u32) {
        let event = PortEvent { port, size, value };
        let (hooks, mut ctx) = self.split(regs);
        hooks.fire_port_out(&mut ctx, &event);
    }

    fn cpuid(&mut self, regs: &mut dyn RegisterFile) -> bool {
        let (hooks, mut ctx) = self.split(regs);
        hooks.fire_cpuid(&mut ctx)
    }
}
