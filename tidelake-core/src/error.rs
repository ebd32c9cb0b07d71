/// A type alias for `anyhow::Error`, representing any error type.
///
/// This type is used throughout the crate to represent errors that can be of any type,
/// leveraging the flexibility of the `anyhow` crate for error handling.
pub type AnyError = anyhow::Error;

/// A type alias for `Result<T, E>` where `E` defaults to [`AnyError`](AnyError).
///
/// This type provides a convenient way to return results that can contain any error type,
/// defaulting to [`AnyError`] if no specific error type is specified.
///
/// # Type Parameters
///
/// * `T` - The type of the successful result.
/// * `E` - The error type, defaulting to [`AnyError`].
pub type AnyResult<T, E = AnyError> = std::result::Result<T, E>;
#[macro_export]
macro_rules! bail_into {
    ($msg:literal $(,)?) => {
        return Err(::anyhow::anyhow!($msg).into())
    };
    ($err:expr $(,)?) => {
        return Err(::anyhow::anyhow!($err).into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err(::anyhow::anyhow!($fmt, $($arg)*).into())
    };
}

/// Addressing failures: a message aimed at a service or worker id that
/// doesn't (or no longer) exists. Always surfaced as an error reply, never
/// as a panic or a dropped message — see spec.md §7.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum AddressingError {
    #[error("call dead service.")]
    DeadService,
    #[error("message addressed to unknown worker, dropping")]
    UnknownWorker,
}

/// Transport failures: socket-level errors during accept, connect, or
/// listen. On the request path these become an error reply; on the
/// listener's own accept loop they're logged and the loop keeps running.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("tcp listen failed: {0}")]
    Listen(std::io::Error),
    #[error("tcp accept error: {0}")]
    Accept(std::io::Error),
    #[error("tcp connect error: {0}")]
    Connect(std::io::Error),
}
