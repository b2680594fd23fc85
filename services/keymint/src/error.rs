//! Error types for token minting.
//!
//! Every backend failure is wrapped with enough context to tell which
//! keystore refused and why. [`TokenError::class`] folds the variants into
//! the coarse taxonomy callers use to decide whether to retry.

use thiserror::Error;

/// Result alias used across the crate.
pub type TokenResult<T> = Result<T, TokenError>;

/// Coarse error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad construction input. Never retried.
    ConfigInvalid,
    /// Device or network unreachable. Callers may retry with backoff.
    ResourceUnavailable,
    /// Authorization failure. Needs operator intervention.
    PermissionDenied,
    /// Serialization bug. Treat as fatal.
    Encoding,
    /// A remote backend answered with something unusable.
    Upstream,
    /// The keystore refused to sign for another reason.
    Signing,
    /// Unexpected internal failure.
    Internal,
}

/// Errors returned by token sources and their backends.
#[derive(Error, Debug)]
pub enum TokenError {
    /// Configuration rejected at construction time
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Security device could not be opened
    #[error("unable to open security device {path}: {reason}")]
    DeviceUnavailable {
        /// Device path
        path: String,
        /// Backend reason
        reason: String,
    },

    /// Remote keystore or endpoint unreachable
    #[error("{service} unavailable: {reason}")]
    RemoteUnavailable {
        /// Backend name
        service: &'static str,
        /// Transport or server failure
        reason: String,
    },

    /// Referenced key does not exist
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Signing operation failed inside the keystore
    #[error("signing failed: {0}")]
    SigningFailed(String),

    /// Caller credential not authorized by the backend
    #[error("{service} denied access: {message}")]
    PermissionDenied {
        /// Backend name
        service: &'static str,
        /// Upstream message
        message: String,
    },

    /// Acting principal lacks delegation rights on the target
    #[error("insufficient permission to act as {principal}: {message}")]
    InsufficientPermission {
        /// Target principal
        principal: String,
        /// Upstream message
        message: String,
    },

    /// An intermediate delegate refused the hop
    #[error("delegation chain rejected at {delegate}: {message}")]
    InvalidDelegationChain {
        /// Rejecting delegate
        delegate: String,
        /// Upstream message
        message: String,
    },

    /// Header or claim serialization failed
    #[error("token encoding error: {0}")]
    Encoding(String),

    /// Remote backend answered with a non-success status
    #[error("{service} rejected request with status {status}: {body}")]
    UpstreamRejected {
        /// Backend name
        service: &'static str,
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Remote backend answered without the expected fields
    #[error("malformed response from {service}: {reason}")]
    MalformedResponse {
        /// Backend name
        service: &'static str,
        /// What was missing or invalid
        reason: String,
    },

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl TokenError {
    /// Classify this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::ConfigInvalid(_) => ErrorClass::ConfigInvalid,
            Self::DeviceUnavailable { .. } | Self::RemoteUnavailable { .. } => {
                ErrorClass::ResourceUnavailable
            }
            Self::PermissionDenied { .. }
            | Self::InsufficientPermission { .. }
            | Self::InvalidDelegationChain { .. } => ErrorClass::PermissionDenied,
            Self::Encoding(_) => ErrorClass::Encoding,
            Self::UpstreamRejected { .. } | Self::MalformedResponse { .. } => ErrorClass::Upstream,
            Self::KeyNotFound(_) | Self::SigningFailed(_) => ErrorClass::Signing,
            Self::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Check if a retry with backoff may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::ResourceUnavailable)
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    /// Create a signing error.
    #[must_use]
    pub fn signing(msg: impl Into<String>) -> Self {
        Self::SigningFailed(msg.into())
    }

    /// Create a remote unavailable error.
    #[must_use]
    pub fn unavailable(service: &'static str, reason: impl Into<String>) -> Self {
        Self::RemoteUnavailable {
            service,
            reason: reason.into(),
        }
    }

    /// Create a malformed response error.
    #[must_use]
    pub fn malformed(service: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            service,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for TokenError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

impl From<keymint_common::HttpConfigError> for TokenError {
    fn from(err: keymint_common::HttpConfigError) -> Self {
        Self::ConfigInvalid(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TokenError::unavailable("cloud-kms", "connection refused");
        assert_eq!(err.to_string(), "cloud-kms unavailable: connection refused");

        let err = TokenError::UpstreamRejected {
            service: "vault",
            status: 403,
            body: "permission denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "vault rejected request with status 403: permission denied"
        );
    }

    #[test]
    fn test_resource_errors_are_retryable() {
        let device = TokenError::DeviceUnavailable {
            path: "/dev/tpmrm0".to_string(),
            reason: "no such file".to_string(),
        };
        assert_eq!(device.class(), ErrorClass::ResourceUnavailable);
        assert!(device.is_retryable());
        assert!(TokenError::unavailable("sts", "timeout").is_retryable());
    }

    #[test]
    fn test_non_retryable_errors() {
        assert!(!TokenError::config("empty email").is_retryable());
        assert!(!TokenError::KeyNotFound("0x81008001".to_string()).is_retryable());
        assert!(!TokenError::Encoding("bad".to_string()).is_retryable());
        assert!(!TokenError::malformed("vault", "no token").is_retryable());
    }

    #[test]
    fn test_permission_class() {
        let err = TokenError::InvalidDelegationChain {
            delegate: "hop@example.iam.gserviceaccount.com".to_string(),
            message: "denied".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::PermissionDenied);

        let err = TokenError::InsufficientPermission {
            principal: "target@example.iam.gserviceaccount.com".to_string(),
            message: "denied".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::PermissionDenied);
    }

    #[test]
    fn test_from_serde_error() {
        let err: TokenError = serde_json::from_str::<u32>("x").unwrap_err().into();
        assert_eq!(err.class(), ErrorClass::Encoding);
    }
}
