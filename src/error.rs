//! Error types for the k2s Windows helpers

use thiserror::Error;

/// `ERROR_PROC_NOT_FOUND`
pub const ERROR_PROC_NOT_FOUND: u32 = 127;
/// `ERROR_INVALID_PARAMETER`
pub const ERROR_INVALID_PARAMETER: u32 = 87;
/// `ERROR_FILENAME_EXCED_RANGE`
pub const ERROR_FILENAME_EXCED_RANGE: u32 = 206;
/// `ERROR_GEN_FAILURE`, reported for a failure that carries no code of its own
pub const ERROR_GEN_FAILURE: u32 = 31;

/// Win32 error code wrapped in a `FACILITY_WIN32` HRESULT, other HRESULTs verbatim
pub fn win32_from_hresult(hresult: i32) -> u32 {
    let hr = hresult as u32;
    if hr & 0xFFFF_0000 == 0x8007_0000 {
        hr & 0xFFFF
    } else {
        hr
    }
}

/// Code carried by a failed `windows` call, read when the call failed
#[cfg(windows)]
pub fn win32_code(err: &windows::core::Error) -> u32 {
    win32_from_hresult(err.code().0)
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("LoadLibrary({library}) failed err={code}")]
    LibraryLoad { library: &'static str, code: u32 },

    #[error("{symbol} is not exported by {library}")]
    ProcNotFound {
        library: &'static str,
        symbol: &'static str,
    },

    #[error("Thread snapshot failed err={0}")]
    Snapshot(u32),

    #[error("OpenThread({thread_id}) failed err={code}")]
    OpenThread { thread_id: u32, code: u32 },

    #[error("QueueUserAPC failed thread={thread_id} err={code}")]
    QueueApc { thread_id: u32, code: u32 },

    #[error("Invalid IPv4 address: {0}")]
    InvalidIpv4(String),

    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Name exceeds {max} UTF-16 units: {name}")]
    NameTooLong { name: String, max: usize },

    #[error("VFP operation failed: status 0x{0:08X}")]
    Vfp(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Win32-style result code returned verbatim by the exported entry points.
    /// Never 0, which callers read as success.
    pub fn code(&self) -> u32 {
        let code = match self {
            Error::LibraryLoad { code, .. } => *code,
            Error::ProcNotFound { .. } => ERROR_PROC_NOT_FOUND,
            Error::Snapshot(code) => *code,
            Error::OpenThread { code, .. } => *code,
            Error::QueueApc { code, .. } => *code,
            Error::InvalidIpv4(_)
            | Error::InvalidMac(_)
            | Error::InvalidArgument(_)
            | Error::Json(_) => ERROR_INVALID_PARAMETER,
            Error::NameTooLong { .. } => ERROR_FILENAME_EXCED_RANGE,
            Error::Vfp(status) => *status,
            Error::Io(e) => e.raw_os_error().map(|c| c as u32).unwrap_or(ERROR_GEN_FAILURE),
        };
        if code == 0 {
            ERROR_GEN_FAILURE
        } else {
            code
        }
    }

    /// True when a required export or library was missing
    pub fn is_dependency_missing(&self) -> bool {
        matches!(self, Error::LibraryLoad { .. } | Error::ProcNotFound { .. })
    }
}
