use std::ops::RangeInclusive;

use tracing::trace;

use super::{CodeEvent, HookCallback, HookContext, HookHandle, HookType, MemEvent, PortEvent};
use crate::arch::InsnHookKind;
use crate::{Error, Result};

#[derive(Debug)]
struct HookEntry {
    handle: HookHandle,
    types: HookType,
    range: Option<RangeInclusive<u64>>,
    callback: HookCallback,
}

impl HookEntry {
    /// Address filter. An inverted range (`start > end`) matches everything.
    fn covers(&self, address: u64) -> bool {
        self.range
            .as_ref()
            .is_none_or(|range| range.start() > range.end() || range.contains(&address))
    }
}

/// Registered hooks in registration order.
#[derive(Debug, Default)]
pub(crate) struct HookRegistry {
    entries: Vec<HookEntry>,
    next_handle: u64,
}

impl HookRegistry {
    /// Registers `callback` for `types`.
    ///
    /// `insn` is the backend's resolution of the hook's extra id and must be
    /// present exactly when `types` is `INSN`.
    pub(crate) fn add(
        &mut self,
        types: HookType,
        callback: HookCallback,
        range: Option<RangeInclusive<u64>>,
        insn: Option<InsnHookKind>,
    ) -> Result<HookHandle> {
        if types.is_empty() || !callback.family().contains(types) {
            return Err(Error::HookTypeInvalid);
        }
        let insn_matches = match (&callback, insn) {
            (HookCallback::PortIn(_), Some(InsnHookKind::PortIn))
            | (HookCallback::PortOut(_), Some(InsnHookKind::PortOut))
            | (HookCallback::Cpuid(_), Some(InsnHookKind::Cpuid)) => true,
            (HookCallback::PortIn(_) | HookCallback::PortOut(_) | HookCallback::Cpuid(_), _) => {
                false
            }
            (_, insn) => insn.is_none(),
        };
        if !insn_matches {
            return Err(Error::HookTypeInvalid);
        }

        self.next_handle += 1;
        let handle = HookHandle(self.next_handle);
        trace!(handle = handle.raw(), ?types, ?range, "hook added");
        self.entries.push(HookEntry {
            handle,
            types,
            range,
            callback,
        });
        Ok(handle)
    }

    pub(crate) fn remove(&mut self, handle: HookHandle) -> Result<()> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.handle == handle)
            .ok_or(Error::HookNotFound)?;
        self.entries.remove(index);
        trace!(handle = handle.raw(), "hook removed");
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether any hook subscribes to a bit of `types`.
    pub(crate) fn has(&self, types: HookType) -> bool {
        self.entries.iter().any(|entry| entry.types.intersects(types))
    }

    fn matching(
        &mut self,
        types: HookType,
        address: Option<u64>,
    ) -> impl Iterator<Item = &mut HookCallback> {
        self.entries
            .iter_mut()
            .filter(move |entry| {
                entry.types.intersects(types) && address.is_none_or(|addr| entry.covers(addr))
            })
            .map(|entry| &mut entry.callback)
    }

    /// `CODE` or `BLOCK` event.
    pub(crate) fn fire_code(
        &mut self,
        ctx: &mut HookContext<'_>,
        types: HookType,
        event: &CodeEvent,
    ) {
        for callback in self.matching(types, Some(event.address)) {
            if let HookCallback::Code(f) = callback {
                f(ctx, event);
            }
        }
    }

    /// Valid-access memory event.
    pub(crate) fn fire_mem(&mut self, ctx: &mut HookContext<'_>, event: &MemEvent) {
        for callback in self.matching(event.kind.hook_type(), Some(event.address)) {
            if let HookCallback::Mem(f) = callback {
                f(ctx, event);
            }
        }
    }

    /// Fault event. Stops at the first hook that claims the fault.
    pub(crate) fn fire_fault(&mut self, ctx: &mut HookContext<'_>, event: &MemEvent) -> bool {
        for callback in self.matching(event.kind.hook_type(), Some(event.address)) {
            if let HookCallback::MemFault(f) = callback {
                if f(ctx, event) {
                    return true;
                }
            }
        }
        false
    }

    /// Interrupt event; `false` when no hook is registered for it.
    pub(crate) fn fire_interrupt(&mut self, ctx: &mut HookContext<'_>, intno: u32) -> bool {
        let mut delivered = false;
        for callback in self.matching(HookType::INTR, None) {
            if let HookCallback::Interrupt(f) = callback {
                f(ctx, intno);
                delivered = true;
            }
        }
        delivered
    }

    /// Invalid instruction; `true` when any hook asks to continue.
    pub(crate) fn fire_insn_invalid(&mut self, ctx: &mut HookContext<'_>) -> bool {
        let mut handled = false;
        for callback in self.matching(HookType::INSN_INVALID, None) {
            if let HookCallback::InsnInvalid(f) = callback {
                handled |= f(ctx);
            }
        }
        handled
    }

    /// Port input; the first hook supplies the value.
    pub(crate) fn fire_port_in(
        &mut self,
        ctx: &mut HookContext<'_>,
        event: &PortEvent,
    ) -> Option<u32> {
        let mut value = None;
        for callback in self.matching(HookType::INSN, None) {
            if let HookCallback::PortIn(f) = callback {
                let read = f(ctx, event);
                if value.is_none() {
                    value = Some(read);
                }
            }
        }
        value
    }

    pub(crate) fn fire_port_out(&mut self, ctx: &mut HookContext<'_>, event: &PortEvent) {
        for callback in self.matching(HookType::INSN, None) {
            if let HookCallback::PortOut(f) = callback {
                f(ctx, event);
            }
        }
    }

    /// `CPUID`; `true` when any hook produced the result.
    pub(crate) fn fire_cpuid(&mut self, ctx: &mut HookContext<'_>) -> bool {
        let mut handled = false;
        for callback in self.matching(HookType::INSN, None) {
            if let HookCallback::Cpuid(f) = callback {
                handled |= f(ctx);
            }
        }
        handled
    }
}
