use core::fmt;

pub type IoResult<T> = core::result::Result<T, IoError>;

/// Failure category for block-layer operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoErrorKind {
    /// Named device (or volume) does not exist.
    NotFound,
    /// A device with this name is already registered.
    NameConflict,
    /// An exclusive claim on the device is already held.
    AlreadyClaimed,
    /// Device has open channels or a standing claim.
    Busy,
    /// LBA + block count exceeds the device geometry.
    InvalidRange,
    /// Operation is not in the device's capability set.
    Unsupported,
    /// Submission queue is full; retry on the next poll.
    QueueFull,
    /// Allocation failed; retry after backing off.
    ResourceExhausted,
    /// Link to the remote media was lost; retry after reconnecting.
    Disconnected,
    /// Encryption or decryption failed for this request only.
    CryptoError,
    /// On-media metadata was written by an incompatible newer version.
    IncompatibleVersion,
    /// Channel teardown exceeded its poll budget.
    TeardownTimeout,
    /// Request was cancelled before reaching media.
    Aborted,
    /// Backend media failure.
    Io,
}

/// Error surfaced by registry operations and request completions.
#[derive(Clone, Debug)]
pub struct IoError {
    kind: IoErrorKind,
    message: Option<String>,
}

impl IoError {
    pub const fn new(kind: IoErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: IoErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> IoErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether the caller may retry the same operation later.
    pub fn retriable(&self) -> bool {
        matches!(
            self.kind,
            IoErrorKind::QueueFull | IoErrorKind::ResourceExhausted | IoErrorKind::Disconnected
        )
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for IoError {}

impl From<std::io::Error> for IoError {
    fn from(err: std::io::Error) -> Self {
        IoError::with_message(IoErrorKind::Io, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds() {
        assert!(IoError::new(IoErrorKind::QueueFull).retriable());
        assert!(IoError::new(IoErrorKind::Disconnected).retriable());
        assert!(!IoError::new(IoErrorKind::InvalidRange).retriable());
        assert!(!IoError::new(IoErrorKind::CryptoError).retriable());
    }

    #[test]
    fn display_includes_message() {
        let err = IoError::with_message(IoErrorKind::Busy, "2 channels open");
        assert_eq!(err.to_string(), "Busy: 2 channels open");
        assert_eq!(IoError::new(IoErrorKind::NotFound).to_string(), "NotFound");
    }
}
