//! Stable error taxonomy for the crate, mirroring the reference
//! implementation's small negative `LC_ERROR_*` codes one-for-one, plus a
//! couple of variants for ambient OS failures the original left to a bare
//! `errno`.

use std::io;

use errno::Errno;

/// Every fallible operation in this crate returns this error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid parameters")]
    InvalidParams,

    #[error("unknown message attribute")]
    MsgAttrUnknown,

    #[error("allocation failure")]
    Alloc,

    #[error("channel has no bound socket")]
    SocketRequired,

    #[error("socket is already listening")]
    AlreadyListening,

    #[error("socket bind failed: {0}")]
    SocketBind(Errno),

    #[error("setsockopt failed: {0}")]
    SetSockOpt(Errno),

    #[error("failed to signal listener cancellation: {0}")]
    CancelFailed(Errno),

    #[error("failed to join listener thread")]
    JoinFailed,

    #[error("multicast join failed on every interface: {0}")]
    McastJoin(Errno),

    #[error("multicast leave failed on every interface: {0}")]
    McastPart(Errno),

    #[error("invalid base multicast address")]
    InvalidBaseAddr,

    #[error("message payload is empty but a non-zero length was given")]
    MessageEmpty,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("OS call failed: {0}")]
    Errno(Errno),
}

impl Error {
    /// Captures `errno::errno()` at the call site, for wrapping a single OS
    /// call the way the reference implementation leaves `errno` set on
    /// return.
    pub(crate) fn last_os_error() -> Self {
        Error::Errno(errno::errno())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
