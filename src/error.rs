//! Error types for the IamRole operator
//!
//! Every unit returns an explicit [`Error`]; the controller's error policy is
//! the only place that turns one into a requeue decision via
//! [`Error::is_retryable`].

use thiserror::Error;

/// Classification of a failed IAM API call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IamErrorKind {
    /// The entity does not exist
    NotFound,
    /// The entity already exists
    AlreadyExists,
    /// The operator's credentials are not allowed to perform the call
    Unauthorized,
    /// The backend rejected the request content (malformed document, limits)
    Invalid,
    /// The backend asked us to slow down
    Throttled,
    /// The backend could not be reached
    Unavailable,
    /// The call did not complete before its deadline
    Timeout,
    /// Any other service error
    Other,
}

impl std::fmt::Display for IamErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Invalid => write!(f, "invalid"),
            Self::Throttled => write!(f, "throttled"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Timeout => write!(f, "timeout"),
            Self::Other => write!(f, "error"),
        }
    }
}

/// Main error type for IamRole operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Optimistic-concurrency write lost against a newer version of the record
    #[error("conflict: {0}")]
    Conflict(String),

    /// IAM backend error
    #[error("iam {operation} {kind}: {message}")]
    Iam {
        /// Gateway operation that failed (e.g. "CreateRole")
        operation: &'static str,
        /// Failure classification
        kind: IamErrorKind,
        /// Backend-provided detail
        message: String,
    },

    /// A role with the desired name exists but was not created for this record
    #[error("ownership error for role {role}: {message}")]
    Ownership {
        /// IAM role name
        role: String,
        /// Description of the collision
        message: String,
    },

    /// Validation error for IamRole specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operator configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create an IAM error for the given operation
    pub fn iam(operation: &'static str, kind: IamErrorKind, msg: impl Into<String>) -> Self {
        Self::Iam {
            operation,
            kind,
            message: msg.into(),
        }
    }

    /// Create an ownership error for the given role
    pub fn ownership(role: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Ownership {
            role: role.into(),
            message: msg.into(),
        }
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The IAM failure kind, if this is an IAM error
    pub fn iam_kind(&self) -> Option<IamErrorKind> {
        match self {
            Self::Iam { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Check if this error is transient
    ///
    /// Transient errors requeue with exponential backoff. Permanent errors
    /// (bad spec, foreign role, missing permissions) still requeue, but at a
    /// longer fixed interval since only manual remediation resolves them.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(source) => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Conflict(_) => true,
            Error::Iam { kind, .. } => {
                !matches!(kind, IamErrorKind::Unauthorized | IamErrorKind::Invalid)
            }
            Error::Ownership { .. } => false,
            Error::Validation(_) => false,
            Error::Serialization(_) => true,
            Error::Config(_) => false,
        }
    }

    /// Short machine-readable reason used on status conditions and events
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube(_) => "KubernetesError",
            Error::Conflict(_) => "Conflict",
            Error::Iam {
                kind: IamErrorKind::Unauthorized,
                ..
            } => "IamUnauthorized",
            Error::Iam {
                kind: IamErrorKind::Invalid,
                ..
            } => "InvalidPolicy",
            Error::Iam { .. } => "IamError",
            Error::Ownership { .. } => "RoleNotOwned",
            Error::Validation(_) => "InvalidSpec",
            Error::Serialization(_) => "SerializationError",
            Error::Config(_) => "ConfigurationError",
        }
    }
}
