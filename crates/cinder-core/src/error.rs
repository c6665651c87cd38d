use thiserror::Error;

/// Error classes used by callers that only care about the family of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// An access touched memory that is not mapped.
    Unmapped,
    /// An access touched mapped memory lacking the required permission.
    Protection,
    /// A mapping request conflicted with existing regions.
    Mapping,
    /// Hook registration or removal failed.
    Hook,
    /// Architecture, mode or version selection failed.
    Arch,
    /// The engine handle is no longer usable.
    Handle,
    /// Guest execution stopped on an unrecoverable condition.
    Execution,
    /// A caller-supplied argument was rejected.
    Argument,
}

/// Stable error taxonomy returned by every fallible engine operation.
///
/// The numeric codes are part of the boundary contract and never change
/// meaning. `Display` yields the fixed message for each code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u32)]
pub enum Error {
    /// Memory operation touched an unmapped range.
    #[error("no memory available or memory not present")]
    NoMem = 1,
    /// Unknown or unsupported architecture.
    #[error("invalid or unsupported architecture")]
    Arch = 2,
    /// The engine handle was closed.
    #[error("invalid engine handle")]
    InvalidHandle = 3,
    /// Mode is not valid for the selected architecture.
    #[error("invalid mode for architecture")]
    ModeInvalid = 4,
    /// Binding and core API versions differ.
    #[error("api version mismatch")]
    VersionMismatch = 5,
    /// Read from unmapped memory.
    #[error("invalid memory read: unmapped")]
    ReadUnmapped = 6,
    /// Write to unmapped memory.
    #[error("invalid memory write: unmapped")]
    WriteUnmapped = 7,
    /// Instruction fetch from unmapped memory.
    #[error("invalid memory fetch: unmapped")]
    FetchUnmapped = 8,
    /// Hook type unknown, inconsistent with its callback, or unsupported by the architecture.
    #[error("invalid hook type")]
    HookTypeInvalid = 9,
    /// Instruction could not be decoded.
    #[error("invalid instruction")]
    InsnInvalid = 10,
    /// Requested mapping overlaps an existing region.
    #[error("invalid memory mapping: overlaps an existing region")]
    MapOverlap = 11,
    /// Write to memory without write permission.
    #[error("write to write-protected memory")]
    WriteProt = 12,
    /// Read from memory without read permission.
    #[error("read from non-readable memory")]
    ReadProt = 13,
    /// Instruction fetch from memory without execute permission.
    #[error("fetch from non-executable memory")]
    FetchProt = 14,
    /// Invalid argument supplied to an engine operation.
    #[error("invalid argument")]
    InvalidArgument = 15,
    /// Instruction fetch from an address the architecture cannot execute from.
    #[error("unaligned instruction fetch")]
    FetchUnaligned = 16,
    /// Requested mapping duplicates an existing region exactly.
    #[error("invalid memory mapping: region already mapped")]
    MapExists = 17,
    /// No hook is registered under the given handle.
    #[error("hook not found")]
    HookNotFound = 18,
    /// Register identifier is unknown or not applicable to the architecture/mode.
    #[error("invalid register")]
    RegisterInvalid = 19,
    /// Query type is not supported.
    #[error("invalid query type")]
    QueryInvalid = 20,
    /// Guest raised an exception nobody handled.
    #[error("unhandled cpu exception")]
    Exception = 21,
    /// Start address is not valid for the architecture mode.
    #[error("start address invalid for architecture mode")]
    ArchMismatch = 22,
    /// Stop requested while no emulation is running.
    #[error("emulation is not running")]
    NotRunning = 23,
    /// Start requested while an emulation is already running.
    #[error("emulation is already running")]
    AlreadyRunning = 24,
    /// Emulation timed out.
    #[error("emulation timed out")]
    Timeout = 25,
}

/// Result alias used across the engine.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Ordered list of every error in the taxonomy.
    pub const ALL: [Self; 25] = [
        Self::NoMem,
        Self::Arch,
        Self::InvalidHandle,
        Self::ModeInvalid,
        Self::VersionMismatch,
        Self::ReadUnmapped,
        Self::WriteUnmapped,
        Self::FetchUnmapped,
        Self::HookTypeInvalid,
        Self::InsnInvalid,
        Self::MapOverlap,
        Self::WriteProt,
        Self::ReadProt,
        Self::FetchProt,
        Self::InvalidArgument,
        Self::FetchUnaligned,
        Self::MapExists,
        Self::HookNotFound,
        Self::RegisterInvalid,
        Self::QueryInvalid,
        Self::Exception,
        Self::ArchMismatch,
        Self::NotRunning,
        Self::AlreadyRunning,
        Self::Timeout,
    ];

    /// Returns the stable numeric code. Code `0` is reserved for success.
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Converts a stable numeric code back into an error.
    ///
    /// Returns `None` for `0` (success) and for codes outside the taxonomy.
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::NoMem),
            2 => Some(Self::Arch),
            3 => Some(Self::InvalidHandle),
            4 => Some(Self::ModeInvalid),
            5 => Some(Self::VersionMismatch),
            6 => Some(Self::ReadUnmapped),
            7 => Some(Self::WriteUnmapped),
            8 => Some(Self::FetchUnmapped),
            9 => Some(Self::HookTypeInvalid),
            10 => Some(Self::InsnInvalid),
            11 => Some(Self::MapOverlap),
            12 => Some(Self::WriteProt),
            13 => Some(Self::ReadProt),
            14 => Some(Self::FetchProt),
            15 => Some(Self::InvalidArgument),
            16 => Some(Self::FetchUnaligned),
            17 => Some(Self::MapExists),
            18 => Some(Self::HookNotFound),
            19 => Some(Self::RegisterInvalid),
            20 => Some(Self::QueryInvalid),
            21 => Some(Self::Exception),
            22 => Some(Self::ArchMismatch),
            23 => Some(Self::NotRunning),
            24 => Some(Self::AlreadyRunning),
            25 => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Returns the class this error belongs to.
    #[must_use]
    pub const fn class(self) -> ErrorClass {
        match self {
            Self::NoMem | Self::ReadUnmapped | Self::WriteUnmapped | Self::FetchUnmapped => {
                ErrorClass::Unmapped
            }
            Self::ReadProt | Self::WriteProt | Self::FetchProt => ErrorClass::Protection,
            Self::MapOverlap | Self::MapExists => ErrorClass::Mapping,
            Self::HookTypeInvalid | Self::HookNotFound => ErrorClass::Hook,
            Self::Arch | Self::ModeInvalid | Self::ArchMismatch | Self::VersionMismatch => {
                ErrorClass::Arch
            }
            Self::InvalidHandle => ErrorClass::Handle,
            Self::InsnInvalid
            | Self::Exception
            | Self::FetchUnaligned
            | Self::NotRunning
            | Self::AlreadyRunning
            | Self::Timeout => ErrorClass::Execution,
            Self::InvalidArgument | Self::RegisterInvalid | Self::QueryInvalid => {
                ErrorClass::Argument
            }
        }
    }

    /// Guest memory faults that a memory-fault hook may convert into success.
    #[must_use]
    pub const fn is_memory_fault(self) -> bool {
        matches!(
            self,
            Self::ReadUnmapped
                | Self::WriteUnmapped
                | Self::FetchUnmapped
                | Self::ReadProt
                | Self::WriteProt
                | Self::FetchProt
        )
    }
}

/// Returns the fixed message for a numeric error code.
#[must_use]
pub fn strerror(code: u32) -> String {
    match Error::from_code(code) {
        Some(error) => error.to_string(),
        None if code == 0 => "ok".to_string(),
        None => format!("unknown error code {code}"),
    }
}

#[cfg(test)]
mod tests {
    use super::{strerror, Error, ErrorClass};

    #[test]
    fn stable_code_roundtrip_is_bijective_for_defined_values() {
        for error in Error::ALL {
            assert_eq!(Error::from_code(error.code()), Some(error));
        }
        for (expected, error) in (1_u32..).zip(Error::ALL) {
            assert_eq!(error.code(), expected);
        }
    }

    #[test]
    fn success_and_unknown_codes_are_rejected() {
        assert!(Error::from_code(0).is_none());
        assert!(Error::from_code(26).is_none());
        assert!(Error::from_code(u32::MAX).is_none());
    }

    #[test]
    fn strerror_covers_success_taxonomy_and_unknown() {
        assert_eq!(strerror(0), "ok");
        assert_eq!(strerror(12), "write to write-protected memory");
        assert_eq!(strerror(99), "unknown error code 99");
    }

    #[test]
    fn unmapped_class_groups_api_and_guest_variants() {
        assert_eq!(Error::NoMem.class(), ErrorClass::Unmapped);
        assert_eq!(Error::ReadUnmapped.class(), ErrorClass::Unmapped);
        assert_eq!(Error::FetchUnmapped.class(), ErrorClass::Unmapped);
        assert_eq!(Error::MapExists.class(), ErrorClass::Mapping);
        assert_eq!(Error::ArchMismatch.class(), ErrorClass::Arch);
    }

    #[test]
    fn only_access_faults_are_hook_convertible() {
        let convertible: Vec<_> = Error::ALL
            .into_iter()
            .filter(|error| error.is_memory_fault())
            .collect();
        assert_eq!(
            convertible,
            vec![
                Error::ReadUnmapped,
                Error::WriteUnmapped,
                Error::FetchUnmapped,
                Error::WriteProt,
                Error::ReadProt,
                Error::FetchProt,
            ]
        );
    }
}
