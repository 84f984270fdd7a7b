use backtrace::Backtrace;
use parking_lot::Mutex;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

/// Error kinds for kiln operations.
///
/// Each kind describes one category of failure so callers can branch on the
/// cause without parsing messages. Programming errors (`TransactionRequired`,
/// `MetaMismatch`, `InvalidOperation`) are never retried; driver errors are
/// passed through with their original kind even when wrapped.
///
/// # Examples
///
/// ```rust
/// use kiln::errors::{ErrorKind, KilnError, KilnResult};
///
/// fn example() -> KilnResult<()> {
///     Err(KilnError::new("operation requires a transaction", ErrorKind::TransactionRequired))
/// }
///
/// assert_eq!(example().unwrap_err().kind(), &ErrorKind::TransactionRequired);
/// ```
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorKind {
    // Programming errors
    /// A locking or unsafe bulk operation was attempted outside a transaction
    TransactionRequired,
    /// The provided model does not match the model managed by the manager
    MetaMismatch,
    /// The operation is not valid with the supplied arguments
    InvalidOperation,

    // Model and query errors
    /// A model failed its validation hook
    ValidationError,
    /// A filter, update, sort or field could not be translated
    TranslationError,
    /// The provided ID is malformed
    InvalidId,
    /// Error encoding or decoding a document
    EncodingError,

    // Driver errors
    /// No document matched a single document operation
    NoDocuments,
    /// A unique constraint was violated
    DuplicateKey,
    /// A transactional write conflicted with a concurrent write
    WriteConflict,
    /// The transaction has been aborted and cannot be used anymore
    TransactionAborted,
    /// The change feed no longer contains the requested resume point
    HistoryLost,
    /// The driver could not be reached or the URI is not supported
    ConnectionError,
    /// The store has already been closed
    StoreAlreadyClosed,

    // Context errors
    /// The operation context has been cancelled
    Cancelled,
    /// The operation context deadline has passed
    DeadlineExceeded,

    // Stream errors
    /// The watched collection or database has been dropped or renamed
    Invalidated,
    /// Returned by a stream receiver to stop the stream
    Stop,

    /// Internal error (usually indicates a bug)
    InternalError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::TransactionRequired => write!(f, "Transaction required"),
            ErrorKind::MetaMismatch => write!(f, "Meta mismatch"),
            ErrorKind::InvalidOperation => write!(f, "Invalid operation"),
            ErrorKind::ValidationError => write!(f, "Validation error"),
            ErrorKind::TranslationError => write!(f, "Translation error"),
            ErrorKind::InvalidId => write!(f, "Invalid ID"),
            ErrorKind::EncodingError => write!(f, "Encoding error"),
            ErrorKind::NoDocuments => write!(f, "No documents"),
            ErrorKind::DuplicateKey => write!(f, "Duplicate key"),
            ErrorKind::WriteConflict => write!(f, "Write conflict"),
            ErrorKind::TransactionAborted => write!(f, "Transaction aborted"),
            ErrorKind::HistoryLost => write!(f, "Change history lost"),
            ErrorKind::ConnectionError => write!(f, "Connection error"),
            ErrorKind::StoreAlreadyClosed => write!(f, "Store already closed"),
            ErrorKind::Cancelled => write!(f, "Cancelled"),
            ErrorKind::DeadlineExceeded => write!(f, "Deadline exceeded"),
            ErrorKind::Invalidated => write!(f, "Invalidated"),
            ErrorKind::Stop => write!(f, "Stop"),
            ErrorKind::InternalError => write!(f, "Internal error"),
        }
    }
}

/// Custom kiln error type.
///
/// `KilnError` carries a message, a kind, an optional cause and a lazily
/// resolved backtrace. Wrapping an error with [`KilnError::wrap`] keeps the
/// kind of the wrapped error, so classification helpers such as
/// [`is_missing`] and [`is_duplicate`] keep working on wrapped errors.
#[derive(Clone)]
pub struct KilnError {
    message: String,
    error_kind: ErrorKind,
    cause: Option<Box<KilnError>>,
    backtrace: Arc<Mutex<Backtrace>>,
}

impl KilnError {
    /// Creates a new `KilnError` with the specified message and error kind.
    pub fn new(message: &str, error_kind: ErrorKind) -> Self {
        KilnError {
            message: message.to_string(),
            error_kind,
            cause: None,
            backtrace: Arc::new(Mutex::new(Backtrace::new_unresolved())),
        }
    }

    /// Creates a new `KilnError` with a cause error.
    pub fn new_with_cause(message: &str, error_kind: ErrorKind, cause: KilnError) -> Self {
        KilnError {
            message: message.to_string(),
            error_kind,
            cause: Some(Box::new(cause)),
            backtrace: Arc::new(Mutex::new(Backtrace::new_unresolved())),
        }
    }

    /// Wraps an error with the name of the operation that produced it. The
    /// kind of the wrapped error is preserved.
    pub fn wrap(operation: &str, cause: KilnError) -> Self {
        let message = format!("{}: {}", operation, cause.message);
        let kind = cause.error_kind.clone();
        KilnError::new_with_cause(&message, kind, cause)
    }

    /// The error a stream receiver returns to stop the stream.
    pub fn stop() -> Self {
        KilnError::new("stop", ErrorKind::Stop)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.error_kind
    }

    pub fn cause(&self) -> Option<&KilnError> {
        self.cause.as_deref()
    }

    /// Returns the innermost error of the cause chain.
    pub fn root_cause(&self) -> &KilnError {
        let mut current = self;
        while let Some(cause) = current.cause.as_deref() {
            current = cause;
        }
        current
    }
}

impl Display for KilnError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Debug for KilnError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // print error message with stack trace followed by cause
        match &self.cause {
            Some(cause) => write!(f, "{}\nCaused by: {:?}", self.message, cause),
            None => {
                let mut backtrace = self.backtrace.lock();
                backtrace.resolve();
                write!(f, "{}\n{:?}", self.message, *backtrace)
            }
        }
    }
}

impl Error for KilnError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.cause {
            Some(cause) => Some(cause.as_ref()),
            None => None,
        }
    }
}

/// A result type alias for kiln operations.
pub type KilnResult<T> = Result<T, KilnError>;

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::new(&format!("encoding error: {}", err), ErrorKind::EncodingError)
    }
}

impl From<anyhow::Error> for KilnError {
    fn from(err: anyhow::Error) -> Self {
        KilnError::new(&format!("{:#}", err), ErrorKind::ValidationError)
    }
}

impl From<regex::Error> for KilnError {
    fn from(err: regex::Error) -> Self {
        KilnError::new(&format!("invalid regex: {}", err), ErrorKind::TranslationError)
    }
}

/// Returns whether the error describes a missing document.
pub fn is_missing(err: &KilnError) -> bool {
    err.kind() == &ErrorKind::NoDocuments
}

/// Returns whether the error describes a duplicate document.
pub fn is_duplicate(err: &KilnError) -> bool {
    err.kind() == &ErrorKind::DuplicateKey
}

/// Returns whether the error describes a transactional write conflict.
pub fn is_conflict(err: &KilnError) -> bool {
    err.kind() == &ErrorKind::WriteConflict
}

/// Returns whether the error is the stop signal of a stream receiver.
pub fn is_stop(err: &KilnError) -> bool {
    err.kind() == &ErrorKind::Stop
}

pub(crate) fn transaction_required() -> KilnError {
    KilnError::new("operation requires a transaction", ErrorKind::TransactionRequired)
}

pub(crate) fn meta_mismatch() -> KilnError {
    KilnError::new(
        "provided model does not match managed model",
        ErrorKind::MetaMismatch,
    )
}
