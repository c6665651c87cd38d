//! Storage of a single mapped region.

use super::{HostBuffer, MemRegion, Permissions};
use crate::{Error, Result};

/// Bytes behind a region.
#[derive(Debug)]
pub enum Backing {
    /// Zero-initialised storage owned by the address space.
    Owned(Vec<u8>),
    /// Host-supplied storage; `offset` is where this region starts inside it.
    Host {
        /// Shared host buffer.
        buffer: HostBuffer,
        /// Byte offset of the region's first address within `buffer`.
        offset: usize,
    },
}

/// One contiguous mapped range with uniform permissions.
#[derive(Debug)]
pub struct Region {
    begin: u64,
    end: u64,
    perms: Permissions,
    backing: Backing,
}

impl Region {
    /// Allocates a zeroed, owned region covering `begin..=end`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMem`] when the host cannot provide the storage.
    pub fn owned(begin: u64, end: u64, perms: Permissions) -> Result<Self> {
        let len = usize::try_from(end - begin)
            .ok()
            .and_then(|last| last.checked_add(1))
            .ok_or(Error::NoMem)?;
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len).map_err(|_| Error::NoMem)?;
        bytes.resize(len, 0);
        Ok(Self {
            begin,
            end,
            perms,
            backing: Backing::Owned(bytes),
        })
    }

    /// Wraps a host buffer as the storage for `begin..=end`.
    #[must_use]
    pub const fn host(begin: u64, end: u64, perms: Permissions, buffer: HostBuffer) -> Self {
        Self {
            begin,
            end,
            perms,
            backing: Backing::Host { buffer, offset: 0 },
        }
    }

    /// First address.
    #[must_use]
    pub const fn begin(&self) -> u64 {
        self.begin
    }

    /// Last address (inclusive).
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end
    }

    /// Current permissions.
    #[must_use]
    pub const fn perms(&self) -> Permissions {
        self.perms
    }

    /// Replaces the permissions.
    pub const fn set_perms(&mut self, perms: Permissions) {
        self.perms = perms;
    }

    /// Returns `true` when `addr` lies inside the region.
    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.begin && addr <= self.end
    }

    /// Public snapshot descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> MemRegion {
        MemRegion {
            begin: self.begin,
            end: self.end,
            perms: self.perms,
        }
    }

    /// Storage behind the region.
    #[must_use]
    pub const fn backing(&self) -> &Backing {
        &self.backing
    }

    /// Copies bytes starting at region-relative `offset` into `dst`.
    ///
    /// Callers guarantee the range lies inside the region.
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        match &self.backing {
            Backing::Owned(bytes) => dst.copy_from_slice(&bytes[offset..offset + dst.len()]),
            Backing::Host {
                buffer,
                offset: base,
            } => {
                if buffer.read_at(base + offset, dst).is_err() {
                    dst.fill(0);
                }
            }
        }
    }

    /// Copies `src` into the region at region-relative `offset`.
    ///
    /// Callers guarantee the range lies inside the region.
    pub fn write(&mut self, offset: usize, src: &[u8]) {
        match &mut self.backing {
            Backing::Owned(bytes) => bytes[offset..offset + src.len()].copy_from_slice(src),
            Backing::Host {
                buffer,
                offset: base,
            } => {
                // Host buffers never shrink.
                let written = buffer.write_at(*base + offset, src);
                debug_assert!(written.is_ok(), "host buffer shorter than its region");
            }
        }
    }

    /// Splits the region at `at`, keeping `begin..at` and returning `at..=end`.
    ///
    /// Callers guarantee `begin < at <= end`. Byte contents are preserved on
    /// both sides.
    #[must_use]
    pub fn split_off(&mut self, at: u64) -> Self {
        debug_assert!(self.begin < at && at <= self.end);
        let relative = usize::try_from(at - self.begin).unwrap_or(usize::MAX);
        let backing = match &mut self.backing {
            Backing::Owned(bytes) => {
                let tail = bytes.split_off(relative);
                bytes.shrink_to_fit();
                Backing::Owned(tail)
            }
            Backing::Host { buffer, offset } => Backing::Host {
                buffer: buffer.clone(),
                offset: *offset + relative,
            },
        };
        let tail = Self {
            begin: at,
            end: self.end,
            perms: self.perms,
            backing,
        };
        self.end = at - 1;
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::{Backing, Region};
    use crate::memory::{HostBuffer, Permissions};

    #[test]
    fn owned_region_is_zero_initialised() {
        let region = Region::owned(0x1000, 0x1fff, Permissions::ALL).expect("allocates");
        let mut out = [0xFF; 16];
        region.read(0x100, &mut out);
        assert_eq!(out, [0; 16]);
        assert_eq!(region.descriptor().size(), 0x1000);
    }

    #[test]
    fn split_preserves_owned_contents_on_both_sides() {
        let mut region = Region::owned(0x1000, 0x2fff, Permissions::ALL).expect("allocates");
        region.write(0x0ffe, &[1, 2, 3, 4]);

        let tail = region.split_off(0x2000);

        assert_eq!(region.end(), 0x1fff);
        assert_eq!(tail.begin(), 0x2000);
        assert_eq!(tail.end(), 0x2fff);

        let mut head_bytes = [0; 2];
        region.read(0x0ffe, &mut head_bytes);
        assert_eq!(head_bytes, [1, 2]);

        let mut tail_bytes = [0; 2];
        tail.read(0, &mut tail_bytes);
        assert_eq!(tail_bytes, [3, 4]);
    }

    #[test]
    fn split_host_region_keeps_sharing_the_buffer() {
        let host = HostBuffer::new(0x2000);
        let mut region = Region::host(0x4000, 0x5fff, Permissions::READ, host.clone());
        let mut tail = region.split_off(0x5000);

        tail.write(0x10, &[0xCC]);
        assert_eq!(host.to_vec()[0x1010], 0xCC);
        assert!(matches!(tail.backing(), Backing::Host { offset: 0x1000, .. }));
        assert_eq!(host.share_count(), 3);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "host buffer shorter than its region")]
    fn write_past_a_short_host_buffer_is_caught_in_debug_builds() {
        let mut region = Region::host(0x1000, 0x1fff, Permissions::ALL, HostBuffer::new(0x10));
        region.write(0x100, &[1]);
    }
}
