//! CPU emulation engine with memory mapping, register access and
//! instrumentation hooks.
//!
//! An [`Engine`] is opened for an [`Arch`]/[`Mode`] pair, given memory with
//! [`Engine::mem_map`] and guest code with [`Engine::mem_write`], and run with
//! [`Engine::start`]. Hooks registered through [`Engine::hook_add`] observe and
//! steer the run.

/// Error taxonomy with stable numeric codes.
pub mod error;
pub use error::{strerror, Error, ErrorClass, Result};

/// Guest address space and region storage.
pub mod memory;
pub use memory::{
    AccessFault, AddressSpace, HostBuffer, MemAccess, MemRegion, Permissions, DEFAULT_PAGE_SIZE,
    MIN_PAGE_SIZE,
};

/// Register identifiers and aggregate register values.
pub mod registers;
pub use registers::{Mmr, RegId};

/// Guest architectures and their backends.
pub mod arch;
pub use arch::riscv::RiscvReg;
pub use arch::x86::{X86Insn, X86Reg};
pub use arch::{arch_supported, Arch, Mode};

/// Hook types, event payloads and callbacks.
pub mod hook;
pub use hook::{
    CodeEvent, HookCallback, HookContext, HookHandle, HookType, MemEvent, MemEventKind, PortEvent,
};

/// Engine lifecycle and execution control.
pub mod engine;
pub use engine::{
    Engine, EngineConfig, EngineState, ExitReason, QueryType, StartOptions, StopHandle,
    DEFAULT_MAX_BLOCK_INSTRUCTIONS,
};

/// Major version of the engine API.
pub const API_MAJOR: u32 = 1;
/// Minor version of the engine API.
pub const API_MINOR: u32 = 0;

/// Returns `(API_MAJOR, API_MINOR)`.
#[must_use]
pub const fn version() -> (u32, u32) {
    (API_MAJOR, API_MINOR)
}

/// Validates a binding's compiled-in version expectation.
///
/// The major version must match exactly; the binding's minor version may
/// not be newer than the engine's.
///
/// # Errors
///
/// [`Error::VersionMismatch`] when the expectation cannot be met.
pub const fn check_version(major: u32, minor: u32) -> Result<()> {
    if major != API_MAJOR || minor > API_MINOR {
        return Err(Error::VersionMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{check_version, version, Error, API_MAJOR, API_MINOR};

    #[test]
    fn version_pair_is_checked() {
        assert_eq!(version(), (API_MAJOR, API_MINOR));
        assert_eq!(check_version(API_MAJOR, API_MINOR), Ok(()));
        assert_eq!(check_version(API_MAJOR + 1, 0), Err(Error::VersionMismatch));
        assert_eq!(
            check_version(API_MAJOR, API_MINOR + 1),
            Err(Error::VersionMismatch)
        );
    }
}
