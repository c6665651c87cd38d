//! Engine and run configuration plus introspection queries.

use super::control::Control;
use crate::arch::{Arch, Mode};
use crate::memory::{DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::{Error, Result};

/// Default cap on instructions scanned when sizing a basic block.
pub const DEFAULT_MAX_BLOCK_INSTRUCTIONS: u32 = 512;

/// Immutable configuration chosen when an engine is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct EngineConfig {
    /// Mapping granularity; a power of two of at least `0x400`.
    pub page_size: u64,
    /// Upper bound on instructions reported in one `BLOCK` event.
    pub max_block_instructions: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_block_instructions: DEFAULT_MAX_BLOCK_INSTRUCTIONS,
        }
    }
}

impl EngineConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a page size that is not a power of two
    /// of at least `0x400`, or a zero block cap.
    pub const fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || self.page_size < MIN_PAGE_SIZE {
            return Err(Error::InvalidArgument);
        }
        if self.max_block_instructions == 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

/// Limits for one run. Zero means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct StartOptions {
    /// Wall-clock budget in microseconds, checked at instruction boundaries.
    pub timeout: u64,
    /// Maximum number of instruction dispatches, counting ones a hook
    /// skipped or redirected.
    pub count: u64,
}

impl StartOptions {
    /// Sets the wall-clock budget in microseconds.
    #[must_use]
    pub const fn with_timeout(mut self, micros: u64) -> Self {
        self.timeout = micros;
        self
    }

    /// Sets the instruction budget.
    #[must_use]
    pub const fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }
}

/// Engine introspection keys with stable numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum QueryType {
    /// Current mode bits.
    Mode = 1,
    /// Mapping granularity.
    PageSize = 2,
    /// Architecture code.
    Arch = 3,
    /// `1` when the last run ended on its wall-clock budget.
    Timeout = 4,
}

impl TryFrom<u32> for QueryType {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            1 => Ok(Self::Mode),
            2 => Ok(Self::PageSize),
            3 => Ok(Self::Arch),
            4 => Ok(Self::Timeout),
            _ => Err(Error::QueryInvalid),
        }
    }
}

/// Fixed facts about an engine, answerable from hooks as well.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EngineInfo {
    pub(crate) arch: Arch,
    pub(crate) mode: Mode,
    pub(crate) page_size: u64,
}

impl EngineInfo {
    pub(crate) fn query(&self, query: QueryType, control: &Control) -> u64 {
        match query {
            QueryType::Mode => u64::from(self.mode.bits()),
            QueryType::PageSize => self.page_size,
            QueryType::Arch => u64::from(self.arch.code()),
            QueryType::Timeout => u64::from(control.timed_out()),
        }
    }
}
