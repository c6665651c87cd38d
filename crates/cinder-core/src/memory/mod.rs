//! Guest address space: region bookkeeping, permissions and host-backed storage.

/// Region storage and split bookkeeping.
pub mod region;
/// Ordered region table and access checks.
pub mod space;

use std::sync::{Arc, PoisonError, RwLock};

use bitflags::bitflags;

use crate::{Error, Result};

pub use space::AddressSpace;

/// Default minimum mapping granularity in bytes.
pub const DEFAULT_PAGE_SIZE: u64 = 0x1000;

/// Smallest page size an engine can be configured with.
pub const MIN_PAGE_SIZE: u64 = 0x400;

bitflags! {
    /// Access permissions of a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct Permissions: u32 {
        /// Region is readable by guest loads and API reads.
        const READ = 1;
        /// Region is writable by guest stores and API writes.
        const WRITE = 2;
        /// Instructions may be fetched from the region.
        const EXEC = 4;
        /// Read, write and execute.
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

/// Kind of a guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemAccess {
    /// Data load.
    Read,
    /// Data store.
    Write,
    /// Instruction fetch.
    Fetch,
}

impl MemAccess {
    /// Permission a region needs to satisfy this access.
    #[must_use]
    pub const fn required(self) -> Permissions {
        match self {
            Self::Read => Permissions::READ,
            Self::Write => Permissions::WRITE,
            Self::Fetch => Permissions::EXEC,
        }
    }

    /// Error reported when the access touches unmapped memory.
    #[must_use]
    pub const fn unmapped_error(self) -> Error {
        match self {
            Self::Read => Error::ReadUnmapped,
            Self::Write => Error::WriteUnmapped,
            Self::Fetch => Error::FetchUnmapped,
        }
    }

    /// Error reported when the access lacks permission.
    #[must_use]
    pub const fn protection_error(self) -> Error {
        match self {
            Self::Read => Error::ReadProt,
            Self::Write => Error::WriteProt,
            Self::Fetch => Error::FetchProt,
        }
    }
}

/// Why an access was refused by the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessFault {
    /// At least one touched byte is not mapped.
    Unmapped,
    /// Every byte is mapped but some region lacks the permission.
    Protected,
}

impl AccessFault {
    /// Maps this fault to the taxonomy error for `access`.
    #[must_use]
    pub const fn error(self, access: MemAccess) -> Error {
        match self {
            Self::Unmapped => access.unmapped_error(),
            Self::Protected => access.protection_error(),
        }
    }
}

/// Snapshot descriptor of one mapped region.
///
/// `end` is inclusive: a one-page region at `0x1000` reports `end == 0x1fff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct MemRegion {
    /// First mapped address.
    pub begin: u64,
    /// Last mapped address (inclusive).
    pub end: u64,
    /// Region permissions.
    pub perms: Permissions,
}

impl MemRegion {
    /// Region size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end - self.begin + 1
    }
}

/// Host-owned storage that can back a guest region.
///
/// Clones share the same bytes. The engine keeps one clone while the region
/// is mapped and drops only that clone on unmap or close, so the host's copy
/// always outlives the engine's use of it.
#[derive(Debug, Clone, Default)]
pub struct HostBuffer {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl HostBuffer {
    /// Allocates a zeroed buffer of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from(vec![0; len])
    }

    /// Buffer length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` for a zero-length buffer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the whole buffer out.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the range exceeds the buffer.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read().unwrap_or_else(PoisonError::into_inner);
        let src = offset
            .checked_add(dst.len())
            .and_then(|end| bytes.get(offset..end))
            .ok_or(Error::InvalidArgument)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Copies `src` into the buffer starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the range exceeds the buffer.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write().unwrap_or_else(PoisonError::into_inner);
        let dst = offset
            .checked_add(src.len())
            .and_then(|end| bytes.get_mut(offset..end))
            .ok_or(Error::InvalidArgument)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Number of live handles sharing this buffer, the engine's included.
    #[must_use]
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.bytes)
    }
}

impl From<Vec<u8>> for HostBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(bytes)),
        }
    }
}
