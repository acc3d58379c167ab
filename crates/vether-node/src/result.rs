//! Entry-point result codes.
//!
//! Fatal codes are below 1000: the engine is unusable and the host should
//! tear it down. Codes at or above 1000 describe a problem with the request
//! itself.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCode {
    Ok = 0,

    // Fatal (0 < code < 1000)
    FatalOutOfMemory = 1,
    FatalDataStoreFailed = 2,
    FatalInternal = 3,

    // Non-fatal (code >= 1000)
    NetworkNotFound = 1000,
    UnsupportedOperation = 1001,
    BadParameter = 1002,
}

impl ResultCode {
    /// True for errors that leave the engine unusable.
    #[must_use]
    pub fn is_fatal(self) -> bool {
        let code = self as u32;
        code > 0 && code < 1000
    }

    #[must_use]
    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultCode::Ok => "OK",
            ResultCode::FatalOutOfMemory => "FATAL_OUT_OF_MEMORY",
            ResultCode::FatalDataStoreFailed => "FATAL_DATA_STORE_FAILED",
            ResultCode::FatalInternal => "FATAL_INTERNAL",
            ResultCode::NetworkNotFound => "NETWORK_NOT_FOUND",
            ResultCode::UnsupportedOperation => "UNSUPPORTED_OPERATION",
            ResultCode::BadParameter => "BAD_PARAMETER",
        };
        f.write_str(name)
    }
}
