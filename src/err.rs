#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tun device error: {0}")]
    Tun(#[from] tidy_tuntap::error::Error),

    /// A bound/pending/established resource already exists for this
    /// identity (e.g. `bind` called twice on the same port).
    #[error("already exists")]
    Exists,

    /// The connection is in the process of tearing down and can no longer
    /// accept new work.
    #[error("connection is closing")]
    Closing,

    /// No connection or listener is registered for the identity this call
    /// addressed (includes the peer having already been removed after
    /// Closed).
    #[error("no such connection or listener")]
    NotExist,

    /// The connection was reset, by the peer or by a protocol violation.
    #[error("connection reset")]
    Reset,

    /// The operation could not complete without blocking and no blocking
    /// variant was requested.
    #[error("operation would block")]
    WouldBlock,

    /// A bounded resource (e.g. the accept backlog) is exhausted.
    #[error("no memory available for this operation")]
    NoMem,
}
