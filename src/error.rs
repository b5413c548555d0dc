use thiserror::Error;


/// Status values shared by every plugin-facing entry point.
///
/// The numeric codes are part of the plugin ABI and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum VmiopError {
    #[error("invalid parameters")]
    Inval,
    #[error("resource unavailable")]
    Resource,
    #[error("offset or length out of range")]
    Range,
    #[error("write to read-only location")]
    ReadOnly,
    #[error("object not found")]
    NotFound,
    #[error("not enough address space")]
    NoAddressSpace,
    #[error("wait time expired")]
    Timeout,
    #[error("request not allowed in callback")]
    NotAllowedInCallback,
}


pub type Result<T> = std::result::Result<T, VmiopError>;


/// Code reported for successful completion.
pub const SUCCESS: u32 = 0;


impl VmiopError {
    pub const fn code(self) -> u32 {
        match self {
            VmiopError::Inval => 1,
            VmiopError::Resource => 2,
            VmiopError::Range => 3,
            VmiopError::ReadOnly => 4,
            VmiopError::NotFound => 5,
            VmiopError::NoAddressSpace => 6,
            VmiopError::Timeout => 7,
            VmiopError::NotAllowedInCallback => 8,
        }
    }

    /// Maps an ABI status code back to an error. `0` (success) and unknown
    /// codes yield `None`.
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(VmiopError::Inval),
            2 => Some(VmiopError::Resource),
            3 => Some(VmiopError::Range),
            4 => Some(VmiopError::ReadOnly),
            5 => Some(VmiopError::NotFound),
            6 => Some(VmiopError::NoAddressSpace),
            7 => Some(VmiopError::Timeout),
            8 => Some(VmiopError::NotAllowedInCallback),
            _ => None,
        }
    }

    /// Errors a caller may retry later without changing its request.
    pub const fn is_recoverable(self) -> bool {
        matches!(self, VmiopError::Resource | VmiopError::Timeout)
    }
}


/// Collapses a result into its ABI status code.
pub fn status_code<T>(result: &Result<T>) -> u32 {
    match result {
        Ok(_) => SUCCESS,
        Err(err) => err.code(),
    }
}
