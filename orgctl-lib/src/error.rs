//! Error types for orgctl
//!
//! Every failure the control plane can surface is a typed variant so that
//! callers (bulk runners, the CLI, a caching daemon) can branch on the kind
//! instead of parsing messages. Errors are `Clone` because a failed credential
//! renewal is cached and handed to every caller until it expires.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using OrgError
pub type Result<T> = std::result::Result<T, OrgError>;

/// Remote error codes that indicate request throttling.
const THROTTLE_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "SlowDown",
];

/// Remote error codes that indicate missing or rejected credentials.
const ACCESS_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "InvalidClientTokenId",
    "UnrecognizedClientException",
    "ExpiredToken",
    "ExpiredTokenException",
];

/// Errors produced while parsing or evaluating an account spec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    /// A non-negated account ID matched no known account
    #[error("unknown account id: {0}")]
    UnknownId(String),

    /// A non-negated account name matched no known account
    #[error("unknown account name: {0}")]
    UnknownName(String),

    /// Negation is only meaningful for tags and owner
    #[error("negation is not allowed for account id or name: {0}")]
    IllegalNegation(String),

    /// Account IDs and names/tags cannot be combined in one spec
    #[error("account ids cannot be mixed with names or tags: {0}")]
    MixedEntries(String),

    /// Entry does not follow the `[!]name[[!]=value]` syntax
    #[error("invalid spec entry {entry:?}: {reason}")]
    InvalidEntry { entry: String, reason: String },

    /// More distinct tags than fit in the selection mask
    #[error("too many tags in spec (max {0})")]
    TooManyTags(usize),
}

impl SpecError {
    pub(crate) fn invalid(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEntry {
            entry: entry.into(),
            reason: reason.into(),
        }
    }
}

/// Comprehensive error type for all orgctl operations
#[derive(Error, Debug, Clone)]
pub enum OrgError {
    /// Credentials are missing, invalid, or were denied
    #[error("no access: {0}")]
    NoAccess(String),

    /// Account has no control record (not under management)
    #[error("account {0} is not under management")]
    NoCtl(String),

    /// Optimistic control update lost a race or failed verification
    #[error("control update conflict: {0}")]
    CtlUpdate(String),

    /// Control record already exists
    #[error("account {0} is already under management")]
    CtlExists(String),

    /// Renewed credentials still cannot cover the requested window
    #[error("credentials cannot satisfy requested validity of {want:?}")]
    Unable { want: Duration },

    /// Account spec errors
    #[error("account spec: {0}")]
    Spec(#[from] SpecError),

    /// Control record encoding errors
    #[error("control record: {0}")]
    Codec(String),

    /// Remote service error with its error code
    #[error("{code}: {message}")]
    Api { code: String, message: String },

    /// A bounded wait ran past its deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A worker task failed without producing a result
    #[error("task failed: {0}")]
    Task(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input/request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Error restored from a persisted session
    #[error("{0}")]
    Cached(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[source] Arc<serde_json::Error>),
}

impl OrgError {
    /// Create a no-access error with context
    pub fn no_access(msg: impl Into<String>) -> Self {
        Self::NoAccess(msg.into())
    }

    /// Create a control conflict error with context
    pub fn ctl_update(msg: impl Into<String>) -> Self {
        Self::CtlUpdate(msg.into())
    }

    /// Create a codec error with context
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Create a config error with context
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error with context
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a remote service error.
    ///
    /// Access-denied codes are folded into [`OrgError::NoAccess`] so callers
    /// only need to check one variant for rejected credentials.
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();
        if ACCESS_CODES.contains(&code.as_str()) {
            return Self::NoAccess(format!("{code}: {message}"));
        }
        Self::Api { code, message }
    }

    /// Map an HTTP status from a remote call to an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => Self::NoAccess(message.into()),
            429 => Self::api("TooManyRequestsException", message),
            _ => Self::api(format!("Http{status}"), message),
        }
    }

    /// Remote error code, if this is a service error.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Returns true if the remote service asked us to slow down.
    pub fn is_throttle(&self) -> bool {
        self.code().is_some_and(|c| THROTTLE_CODES.contains(&c))
    }

    /// Returns true for errors that mean "credentials don't work (yet)".
    pub fn is_no_access(&self) -> bool {
        matches!(self, Self::NoAccess(_))
    }

    /// Short stable label used when aggregating batch results.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoAccess(_) => "no_access",
            Self::NoCtl(_) => "no_ctl",
            Self::CtlUpdate(_) => "ctl_update",
            Self::CtlExists(_) => "ctl_exists",
            Self::Unable { .. } => "unable",
            Self::Spec(_) => "spec",
            Self::Codec(_) => "codec",
            Self::Api { .. } if self.is_throttle() => "throttle",
            Self::Api { .. } => "api",
            Self::Timeout(_) => "timeout",
            Self::Task(_) => "task",
            Self::Config(_) => "config",
            Self::InvalidInput(_) => "invalid_input",
            Self::Cached(_) => "cached",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

impl From<std::io::Error> for OrgError {
    fn from(e: std::io::Error) -> Self {
        OrgError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for OrgError {
    fn from(e: serde_json::Error) -> Self {
        OrgError::Json(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = OrgError::ctl_update("owner changed");
        assert_eq!(err.to_string(), "control update conflict: owner changed");

        let err = OrgError::NoCtl("123456789012".into());
        assert_eq!(err.to_string(), "account 123456789012 is not under management");

        let err = OrgError::from(SpecError::IllegalNegation("b".into()));
        assert_eq!(
            err.to_string(),
            "account spec: negation is not allowed for account id or name: b"
        );
    }

    #[test]
    fn test_error_conversion_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let org_err: OrgError = io_err.into();
        assert!(matches!(org_err, OrgError::Io(_)));
        assert_eq!(org_err.kind(), "io");
    }

    #[test]
    fn access_codes_fold_into_no_access() {
        let err = OrgError::api("AccessDenied", "not authorized to perform sts:AssumeRole");
        assert!(err.is_no_access());
        assert!(err.code().is_none());

        assert!(OrgError::from_status(403, "forbidden").is_no_access());
    }

    #[test]
    fn throttle_detection() {
        assert!(OrgError::api("Throttling", "Rate exceeded").is_throttle());
        assert!(OrgError::from_status(429, "slow down").is_throttle());
        assert!(!OrgError::api("NoSuchEntity", "missing").is_throttle());
        assert!(!OrgError::no_access("denied").is_throttle());
        assert_eq!(OrgError::api("Throttling", "x").kind(), "throttle");
    }

    #[test]
    fn errors_are_cloneable() {
        let err: OrgError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }
}
