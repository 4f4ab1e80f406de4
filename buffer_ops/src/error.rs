use thiserror::Error;
use tracing::error;

/// Errors raised while configuring or running a buffer operation.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller buffers or options violate an operation's contract. Detected
    /// before anything is dispatched.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An operation reached a state its own bookkeeping rules out.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("unknown program `{0}`")]
    UnknownProgram(String),

    #[error("program `{program}` has no kernel `{entry}`")]
    UnknownKernel { program: String, entry: String },

    #[error("kernel `{kernel}` launched without parameter `{name}`")]
    MissingParam { kernel: String, name: String },

    #[error("parameter `{name}` of kernel `{kernel}` has the wrong type")]
    ParamType { kernel: String, name: String },

    #[error("buffer #{0} is not allocated on this device")]
    InvalidBuffer(u64),

    #[error("access to elements {start}..{end} of buffer #{id} holding {count}")]
    OutOfBounds {
        id: u64,
        start: usize,
        end: usize,
        count: usize,
    },

    /// The same buffer was bound to two slots of one launch.
    #[error("buffer #{0} is bound twice in one launch")]
    BufferBusy(u64),

    #[error("stride of {stride} bytes is not a positive multiple of {required}")]
    InvalidStride { stride: usize, required: usize },

    #[error("kernel `{0}` dispatched with an empty grid")]
    ZeroSizedDispatch(String),

    #[cfg(feature = "cuda")]
    #[error(transparent)]
    Cuda(#[from] cust::error::CudaError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Logs and builds a caller configuration error.
pub(crate) fn config(message: impl Into<String>) -> Error {
    let message = message.into();
    error!(%message, "rejected buffer operation");
    Error::Config(message)
}

/// Logs and builds an internal invariant violation.
pub(crate) fn internal(message: impl Into<String>) -> Error {
    let message = message.into();
    error!(%message, "internal invariant violated");
    Error::Internal(message)
}
