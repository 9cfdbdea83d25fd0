use core::fmt;

/// Error returned by client-logic operations.
#[derive(Clone, Debug)]
pub struct Error {
    /// Primary category of the failure.
    pub code: ErrorCode,
    /// Optional human-readable error message from the native library or wrapper.
    pub message: Option<String>,
}

/// Result alias used across the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Failure categories surfaced to the embedding driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// The native library reported a failure.
    Native,
    /// Statement or key operation rejected before any server round-trip.
    ClientSide,
    /// API misuse (bad handle, bad index, malformed input).
    Misuse,
    /// The foreign connection failed to produce a resultset.
    Foreign,
}

impl Error {
    /// Create an error with only a primary code.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// Create an error with a primary code and owned message text.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// Build an error from a library-reported message, using `fallback` when
    /// the library left it empty.
    pub fn from_native(code: ErrorCode, message: Option<String>, fallback: &str) -> Self {
        match message {
            Some(msg) if !msg.is_empty() => Self::with_message(code, msg),
            _ => Self::with_message(code, fallback),
        }
    }

    /// Create an error for a failed foreign-connection round-trip.
    pub fn foreign(message: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::Foreign, message)
    }

    /// Whether the native library rejected the request before reaching the server.
    ///
    /// Client-side rejections must not be retried against the server.
    pub fn is_client_side(&self) -> bool {
        self.code == ErrorCode::ClientSide
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}", msg),
            None => write!(f, "client logic error {:?}", self.code),
        }
    }
}

impl std::error::Error for Error {}
