use thiserror::Error;

/// Stable error kinds shared by every layer of the toolkit.
///
/// Pointer-returning operations report recoverable conditions as `Ok(None)`
/// and reserve these kinds for genuine failures. The core never aborts the
/// process and never logs; recovery is the caller's.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("bad parameters: {0}")]
    BadParameters(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("object in use: {0}")]
    ObjectInUse(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("file error: {0}")]
    FileError(#[from] std::io::Error),

    #[error("unsafe operation: {0}")]
    UnsafeOperation(String),

    // Session-layer kind; declared for API stability, never raised here.
    #[error("maximum users reached")]
    MaximumUsers,
}

impl DbError {
    /// The kind name, independent of the payload. Handy for harness output
    /// and for callers that dispatch on kind rather than message.
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::BadParameters(_) => "bad_parameters",
            DbError::OutOfMemory(_) => "out_of_memory",
            DbError::NotFound(_) => "not_found",
            DbError::ObjectInUse(_) => "object_in_use",
            DbError::OperationFailed(_) => "operation_failed",
            DbError::FileError(_) => "file_error",
            DbError::UnsafeOperation(_) => "unsafe_operation",
            DbError::MaximumUsers => "maximum_users",
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
