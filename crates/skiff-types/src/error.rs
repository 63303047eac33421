use thiserror::Error;

pub type Result<T> = std::result::Result<T, SkiffError>;

#[derive(Debug, Error)]
pub enum SkiffError {
    /// Transport-level failure from a backend (connection reset, 5xx, ...).
    #[error("backend error: {0}")]
    Backend(String),

    #[error("remote file not found: '{0}'")]
    FileMissing(String),

    #[error("remote folder not found: {0}")]
    FolderMissing(String),

    #[error("name resolution failed: {0}")]
    NameResolution(String),

    /// Decryption/encryption failure. Never downgraded to an I/O error so
    /// callers can distinguish corruption from transport trouble.
    #[error("cryptographic error: {0}")]
    Crypto(String),

    #[error("verification failed for '{path}': {expected}, got {actual}")]
    VerificationMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("operation not supported by backend: {0}")]
    Unsupported(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl SkiffError {
    /// Whether this error means "the remote file does not exist".
    /// Covers both the typed variant and a NotFound I/O error surfaced
    /// by a backend that maps straight from the filesystem or HTTP 404.
    pub fn is_not_found(&self) -> bool {
        match self {
            SkiffError::FileMissing(_) => true,
            SkiffError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_folder_missing(&self) -> bool {
        matches!(self, SkiffError::FolderMissing(_))
    }

    pub fn is_dns_failure(&self) -> bool {
        matches!(self, SkiffError::NameResolution(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SkiffError::Cancelled)
    }

    /// A cheap copy carrying the message. Used where one failure has to be
    /// reported through two channels (the operation's completion slot and
    /// the dispatcher's own exit status).
    pub fn clone_message(&self) -> SkiffError {
        match self {
            SkiffError::Backend(m) => SkiffError::Backend(m.clone()),
            SkiffError::FileMissing(m) => SkiffError::FileMissing(m.clone()),
            SkiffError::FolderMissing(m) => SkiffError::FolderMissing(m.clone()),
            SkiffError::NameResolution(m) => SkiffError::NameResolution(m.clone()),
            SkiffError::Crypto(m) => SkiffError::Crypto(m.clone()),
            SkiffError::VerificationMismatch {
                path,
                expected,
                actual,
            } => SkiffError::VerificationMismatch {
                path: path.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            },
            SkiffError::Unsupported(m) => SkiffError::Unsupported(m.clone()),
            SkiffError::Cancelled => SkiffError::Cancelled,
            SkiffError::Database(m) => SkiffError::Database(m.clone()),
            SkiffError::Config(m) => SkiffError::Config(m.clone()),
            SkiffError::Io(e) => SkiffError::Backend(e.to_string()),
            SkiffError::Other(m) => SkiffError::Other(m.clone()),
        }
    }
}
