//! Ordered, non-overlapping region table with permission-checked access.

use std::collections::BTreeMap;

use tracing::debug;

use super::region::Region;
use super::{AccessFault, HostBuffer, MemAccess, MemRegion, Permissions};
use crate::{Error, Result};

/// The set of mapped regions of one engine, keyed by base address.
#[derive(Debug)]
pub struct AddressSpace {
    regions: BTreeMap<u64, Region>,
    page_size: u64,
}

impl AddressSpace {
    /// Creates an empty address space with the given mapping granularity.
    #[must_use]
    pub const fn new(page_size: u64) -> Self {
        Self {
            regions: BTreeMap::new(),
            page_size,
        }
    }

    /// Minimum mapping granularity in bytes.
    #[must_use]
    pub const fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Maps a zero-initialised region owned by the address space.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a zero, unaligned or wrapping range,
    /// [`Error::MapExists`] when the exact range is already mapped,
    /// [`Error::MapOverlap`] when it intersects another region, and
    /// [`Error::NoMem`] when storage cannot be allocated.
    pub fn map(&mut self, addr: u64, size: u64, perms: Permissions) -> Result<()> {
        let end = self.checked_range(addr, size)?;
        self.ensure_free(addr, end)?;
        let region = Region::owned(addr, end, perms)?;
        self.regions.insert(addr, region);
        debug!(addr, size, ?perms, "mapped region");
        Ok(())
    }

    /// Maps a region whose bytes live in `buffer`.
    ///
    /// # Errors
    ///
    /// As [`AddressSpace::map`], plus [`Error::InvalidArgument`] when the
    /// buffer is shorter than `size`.
    pub fn map_backed(
        &mut self,
        addr: u64,
        size: u64,
        perms: Permissions,
        buffer: HostBuffer,
    ) -> Result<()> {
        let end = self.checked_range(addr, size)?;
        if u64::try_from(buffer.len()).is_ok_and(|len| len < size) {
            return Err(Error::InvalidArgument);
        }
        self.ensure_free(addr, end)?;
        self.regions
            .insert(addr, Region::host(addr, end, perms, buffer));
        debug!(addr, size, ?perms, "mapped host-backed region");
        Ok(())
    }

    /// Changes permissions of a fully mapped range, splitting regions at its edges.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a bad range and [`Error::NoMem`] when
    /// part of it is not mapped.
    pub fn protect(&mut self, addr: u64, size: u64, perms: Permissions) -> Result<()> {
        let end = self.checked_range(addr, size)?;
        if !self.is_covered(addr, end) {
            return Err(Error::NoMem);
        }
        self.split_edges(addr, end);
        for (_, region) in self.regions.range_mut(addr..=end) {
            region.set_perms(perms);
        }
        debug!(addr, size, ?perms, "protected range");
        Ok(())
    }

    /// Unmaps a fully mapped range. Owned storage is released; host buffers
    /// only lose the engine's handle.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a bad range and [`Error::NoMem`] when
    /// part of it is not mapped.
    pub fn unmap(&mut self, addr: u64, size: u64) -> Result<()> {
        let end = self.checked_range(addr, size)?;
        if !self.is_covered(addr, end) {
            return Err(Error::NoMem);
        }
        self.split_edges(addr, end);
        let doomed: Vec<u64> = self.regions.range(addr..=end).map(|(&base, _)| base).collect();
        for base in doomed {
            self.regions.remove(&base);
        }
        debug!(addr, size, "unmapped range");
        Ok(())
    }

    /// Drops every region.
    pub fn clear(&mut self) {
        self.regions.clear();
    }

    /// Snapshot of all regions in ascending base order.
    #[must_use]
    pub fn regions(&self) -> Vec<MemRegion> {
        self.regions.values().map(Region::descriptor).collect()
    }

    /// Region containing `addr`, if any.
    #[must_use]
    pub fn find(&self, addr: u64) -> Option<&Region> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
    }

    /// Checks that `len` bytes from `addr` are mapped with `access` permission.
    ///
    /// Unmapped bytes take precedence over permission failures.
    ///
    /// # Errors
    ///
    /// Returns the [`AccessFault`] that refused the access.
    pub fn check(&self, addr: u64, len: usize, access: MemAccess) -> Result<(), AccessFault> {
        if len == 0 {
            return Ok(());
        }
        let last = u64::try_from(len - 1)
            .ok()
            .and_then(|span| addr.checked_add(span))
            .ok_or(AccessFault::Unmapped)?;

        let mut protected = false;
        let mut cursor = addr;
        loop {
            let region = self.find(cursor).ok_or(AccessFault::Unmapped)?;
            if !region.perms().contains(access.required()) {
                protected = true;
            }
            if region.end() >= last {
                break;
            }
            cursor = region.end() + 1;
        }

        if protected {
            Err(AccessFault::Protected)
        } else {
            Ok(())
        }
    }

    /// Engine-API read honouring `READ` permission. Fires no hooks.
    ///
    /// # Errors
    ///
    /// [`Error::ReadUnmapped`] or [`Error::ReadProt`].
    pub fn read(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        self.check(addr, dst.len(), MemAccess::Read)
            .map_err(|fault| fault.error(MemAccess::Read))?;
        self.copy_out(addr, dst);
        Ok(())
    }

    /// Like [`AddressSpace::read`] into a new buffer. The range is checked
    /// before anything is allocated.
    ///
    /// # Errors
    ///
    /// [`Error::ReadUnmapped`] or [`Error::ReadProt`].
    pub fn read_vec(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.check(addr, len, MemAccess::Read)
            .map_err(|fault| fault.error(MemAccess::Read))?;
        let mut bytes = vec![0; len];
        self.copy_out(addr, &mut bytes);
        Ok(bytes)
    }

    /// Engine-API write honouring `WRITE` permission. Fires no hooks.
    ///
    /// # Errors
    ///
    /// [`Error::WriteUnmapped`] or [`Error::WriteProt`].
    pub fn write(&mut self, addr: u64, src: &[u8]) -> Result<()> {
        self.check(addr, src.len(), MemAccess::Write)
            .map_err(|fault| fault.error(MemAccess::Write))?;
        self.copy_in(addr, src);
        Ok(())
    }

    /// Copies mapped bytes out without permission checks.
    ///
    /// Bytes that are not mapped read as zero; callers run [`AddressSpace::check`] first.
    pub fn copy_out(&self, addr: u64, dst: &mut [u8]) {
        let mut done = 0;
        while done < dst.len() {
            let cursor = addr.wrapping_add(done as u64);
            let Some(region) = self.find(cursor) else {
                dst[done..].fill(0);
                return;
            };
            let offset = usize::try_from(cursor - region.begin()).unwrap_or(usize::MAX);
            let available = usize::try_from(region.end() - cursor)
                .map_or(usize::MAX, |span| span.saturating_add(1));
            let chunk = available.min(dst.len() - done);
            region.read(offset, &mut dst[done..done + chunk]);
            done += chunk;
        }
    }

    /// Copies bytes in without permission checks; unmapped bytes are dropped.
    pub fn copy_in(&mut self, addr: u64, src: &[u8]) {
        let mut done = 0;
        while done < src.len() {
            let cursor = addr.wrapping_add(done as u64);
            let Some(base) = self.find(cursor).map(Region::begin) else {
                return;
            };
            let Some(region) = self.regions.get_mut(&base) else {
                return;
            };
            let offset = usize::try_from(cursor - region.begin()).unwrap_or(usize::MAX);
            let available = usize::try_from(region.end() - cursor)
                .map_or(usize::MAX, |span| span.saturating_add(1));
            let chunk = available.min(src.len() - done);
            region.write(offset, &src[done..done + chunk]);
            done += chunk;
        }
    }

    fn checked_range(&self, addr: u64, size: u64) -> Result<u64> {
        if size == 0 || addr % self.page_size != 0 || size % self.page_size != 0 {
            return Err(Error::InvalidArgument);
        }
        addr.checked_add(size - 1).ok_or(Error::InvalidArgument)
    }

    fn ensure_free(&self, addr: u64, end: u64) -> Result<()> {
        let Some((_, neighbour)) = self.regions.range(..=end).next_back() else {
            return Ok(());
        };
        if neighbour.end() < addr {
            return Ok(());
        }
        if neighbour.begin() == addr && neighbour.end() == end {
            Err(Error::MapExists)
        } else {
            Err(Error::MapOverlap)
        }
    }

    fn is_covered(&self, addr: u64, end: u64) -> bool {
        let mut cursor = addr;
        loop {
            let Some(region) = self.find(cursor) else {
                return false;
            };
            if region.end() >= end {
                return true;
            }
            cursor = region.end() + 1;
        }
    }

    fn split_edges(&mut self, addr: u64, end: u64) {
        self.split_at(addr);
        if let Some(after) = end.checked_add(1) {
            self.split_at(after);
        }
    }

    fn split_at(&mut self, at: u64) {
        let Some(base) = self
            .find(at)
            .map(Region::begin)
            .filter(|&begin| begin < at)
        else {
            return;
        };
        if let Some(region) = self.regions.get_mut(&base) {
            let tail = region.split_off(at);
            self.regions.insert(at, tail);
        }
    }
}
