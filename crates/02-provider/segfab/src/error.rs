use thiserror::Error;

use segfab_interconnect::HwError;
use segfab_transport::TransportError;

pub type FabricResult<T> = Result<T, FabricError>;

/// Numeric codes carried in completion and event error entries.
pub mod errno {
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const ENOSYS: i32 = 38;
    pub const ENODATA: i32 = 61;
    pub const EMSGSIZE: i32 = 90;
    pub const EADDRINUSE: i32 = 98;
    pub const ECONNABORTED: i32 = 103;
    pub const ENOTCONN: i32 = 107;
    pub const ETIMEDOUT: i32 = 110;
    pub const EREMOTEIO: i32 = 121;
    pub const ECANCELED: i32 = 125;
    pub const ENOKEY: i32 = 126;
    pub const EKEYREJECTED: i32 = 129;
    pub const FI_EOTHER: i32 = 256;
    pub const FI_ETOOSMALL: i32 = 257;
    pub const FI_EAVAIL: i32 = 259;
    pub const FI_EBADFLAGS: i32 = 260;
    pub const FI_ENOEQ: i32 = 261;
}

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("operation would block")]
    Again,

    #[error("address already in use")]
    AddrInUse,

    #[error("connection aborted")]
    ConnAborted,

    #[error("interconnect failure: {0}")]
    Other(#[from] HwError),

    #[error("no event queue bound")]
    NoEq,

    #[error("invalid argument: {0}")]
    Inval(&'static str),

    #[error("out of memory")]
    NoMem,

    #[error("no data available")]
    NoData,

    #[error("buffer too small")]
    TooSmall,

    #[error("error entry available")]
    Avail,

    #[error("timed out")]
    TimedOut,

    #[error("no space left: {0}")]
    NoSpc(&'static str),

    #[error("remote I/O error")]
    RemoteIo,

    #[error("key rejected")]
    KeyRejected,

    #[error("key not available")]
    NoKey,

    #[error("bad flags")]
    BadFlags,

    #[error("not supported: {0}")]
    NoSys(&'static str),

    #[error("endpoint not connected")]
    NotConn,

    #[error("message too long")]
    MsgSize,

    #[error("operation canceled")]
    Canceled,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl FabricError {
    /// Positive error number matching the fabric interface conventions.
    pub fn errno(&self) -> i32 {
        match self {
            FabricError::Again => errno::EAGAIN,
            FabricError::AddrInUse => errno::EADDRINUSE,
            FabricError::ConnAborted => errno::ECONNABORTED,
            FabricError::Other(_) => errno::FI_EOTHER,
            FabricError::NoEq => errno::FI_ENOEQ,
            FabricError::Inval(_) => errno::EINVAL,
            FabricError::NoMem | FabricError::Transport(_) => errno::ENOMEM,
            FabricError::NoData => errno::ENODATA,
            FabricError::TooSmall => errno::FI_ETOOSMALL,
            FabricError::Avail => errno::FI_EAVAIL,
            FabricError::TimedOut => errno::ETIMEDOUT,
            FabricError::NoSpc(_) => errno::ENOSPC,
            FabricError::RemoteIo => errno::EREMOTEIO,
            FabricError::KeyRejected => errno::EKEYREJECTED,
            FabricError::NoKey => errno::ENOKEY,
            FabricError::BadFlags => errno::FI_EBADFLAGS,
            FabricError::NoSys(_) => errno::ENOSYS,
            FabricError::NotConn => errno::ENOTCONN,
            FabricError::MsgSize => errno::EMSGSIZE,
            FabricError::Canceled => errno::ECANCELED,
        }
    }

    pub fn is_again(&self) -> bool {
        matches!(self, FabricError::Again)
    }
}

/// Human-readable text for an error number found in a completion entry.
pub fn strerror(code: i32) -> &'static str {
    match code.abs() {
        0 => "success",
        errno::EAGAIN => "operation would block",
        errno::ENOMEM => "out of memory",
        errno::EINVAL => "invalid argument",
        errno::ENOSPC => "no space left",
        errno::ENOSYS => "not supported",
        errno::ENODATA => "no data available",
        errno::EMSGSIZE => "message too long",
        errno::EADDRINUSE => "address already in use",
        errno::ECONNABORTED => "connection aborted",
        errno::ENOTCONN => "endpoint not connected",
        errno::ETIMEDOUT => "timed out",
        errno::EREMOTEIO => "remote I/O error",
        errno::ECANCELED => "operation canceled",
        errno::ENOKEY => "key not available",
        errno::EKEYREJECTED => "key rejected",
        errno::FI_EOTHER => "unspecified interconnect error",
        errno::FI_ETOOSMALL => "buffer too small",
        errno::FI_EAVAIL => "error entry available",
        errno::FI_EBADFLAGS => "bad flags",
        errno::FI_ENOEQ => "no event queue bound",
        _ => "unknown error",
    }
}
