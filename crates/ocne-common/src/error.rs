//! Error types shared by every ocne crate
//!
//! Errors carry the resource or cluster they concern so that a failure deep in
//! a node roll or an image import can be reported without re-wrapping. The
//! variants map onto the failure classes the drivers care about: missing
//! resources, wrong-state transitions, transient platform failures, bad input
//! and unrecoverable infrastructure failures.

use thiserror::Error;

/// Main error type for ocne operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A resource that was expected to exist is absent
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (e.g. "Node", "OCIMachineTemplate", "domain")
        kind: String,
        /// Resource name
        name: String,
    },

    /// The cluster or resource is in the wrong state for the requested transition
    #[error("precondition failed for {subject}: {message}")]
    Precondition {
        /// What the precondition is about (node, cluster, template)
        subject: String,
        /// Description of the unmet condition
        message: String,
    },

    /// Platform API timeouts, quota and rate limits
    #[error("transient error: {message}")]
    Transient {
        /// Description of what failed
        message: String,
    },

    /// Malformed configuration or references missing required fields
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.infrastructureRef.name")
        field: Option<String>,
    },

    /// Unrecoverable infrastructure failure
    #[error("fatal error: {message}")]
    Fatal {
        /// Description of what failed
        message: String,
    },

    /// A wall-clock timeout elapsed
    #[error("timed out after {seconds}s waiting for {operation}")]
    Timeout {
        /// What was being waited on
        operation: String,
        /// Timeout in seconds
        seconds: u64,
    },

    /// An external command exited unsuccessfully
    #[error("command `{command}` failed: {message}")]
    Command {
        /// The program and leading arguments
        command: String,
        /// Captured stderr or spawn failure
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation is not supported by this driver
    #[error("{operation} is not supported by the {driver} driver")]
    Unsupported {
        /// Operation name (e.g. "Join")
        operation: String,
        /// Driver name
        driver: String,
    },
}

impl Error {
    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a precondition error for a subject
    pub fn precondition(subject: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Precondition {
            subject: subject.into(),
            message: msg.into(),
        }
    }

    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient {
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error naming the offending field path
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal {
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds: timeout.as_secs(),
        }
    }

    /// Create a command failure
    pub fn command(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an unsupported-operation error
    pub fn unsupported(operation: impl Into<String>, driver: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            driver: driver.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, precondition and not-found errors need a change in input or
    /// cluster state before a retry can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 429
            ),
            Error::Transient { .. } | Error::Timeout { .. } | Error::Command { .. } => true,
            Error::Io(_) => true,
            Error::NotFound { .. }
            | Error::Precondition { .. }
            | Error::Validation { .. }
            | Error::Fatal { .. }
            | Error::Serialization { .. }
            | Error::Unsupported { .. } => false,
        }
    }

    /// True if this error means the resource does not exist
    ///
    /// Delete paths use this to treat already-gone resources as success.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Prefix the error message with context, keeping the variant
    pub fn with_context(self, ctx: &str) -> Self {
        match self {
            Error::NotFound { kind, name } => Error::NotFound {
                kind,
                name: format!("{name} ({ctx})"),
            },
            Error::Precondition { subject, message } => Error::Precondition {
                subject,
                message: format!("{ctx}: {message}"),
            },
            Error::Transient { message } => Error::Transient {
                message: format!("{ctx}: {message}"),
            },
            Error::Validation { message, field } => Error::Validation {
                message: format!("{ctx}: {message}"),
                field,
            },
            Error::Fatal { message } => Error::Fatal {
                message: format!("{ctx}: {message}"),
            },
            Error::Command { command, message } => Error::Command {
                command,
                message: format!("{ctx}: {message}"),
            },
            Error::Serialization { message } => Error::Serialization {
                message: format!("{ctx}: {message}"),
            },
            Error::Kube { source } => Error::Fatal {
                message: format!("{ctx}: kubernetes error: {source}"),
            },
            Error::Io(e) => Error::Fatal {
                message: format!("{ctx}: io error: {e}"),
            },
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

/// Extension trait that prefixes an error with context on the way up.
///
/// The lowest layer tags errors with the resource it was touching; callers
/// only add context where it helps a human find the failure.
pub trait ErrorContext<T> {
    /// Prefix the error, if any, with a fixed context string
    fn context(self, ctx: &str) -> Result<T, Error>;

    /// Prefix the error, if any, with a lazily built context string
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T, Error>;
}

impl<T, E: Into<Error>> ErrorContext<T> for Result<T, E> {
    fn context(self, ctx: &str) -> Result<T, Error> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T, Error> {
        self.map_err(|e| e.into().with_context(&f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: how failures surface to the driver callers
    // ==========================================================================

    /// Story: a worker upgrade blocked by a lagging control plane names the node
    #[test]
    fn story_precondition_names_the_node() {
        let err = Error::precondition("w1", "control plane node cp1 has an update pending");
        assert!(err.to_string().contains("w1"));
        assert!(err.to_string().contains("cp1"));
        assert!(!err.is_retryable());
    }

    /// Story: delete paths swallow missing resources
    #[test]
    fn story_not_found_is_recognised_on_delete() {
        let err = Error::not_found("domain", "demo-control-plane-1");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "domain demo-control-plane-1 not found");

        let api = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "clusters.cluster.x-k8s.io \"demo\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        assert!(Error::from(api).is_not_found());

        let forbidden = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "configmaps \"ocne-image-amd64-0\" is forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        });
        assert!(!Error::from(forbidden).is_not_found());
    }

    /// Story: the platform rate limits us and the loop retries
    #[test]
    fn story_transient_and_timeouts_are_retryable() {
        assert!(Error::transient("429 too many requests").is_retryable());
        let err = Error::timeout("nodes to be listed", std::time::Duration::from_secs(600));
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "timed out after 600s waiting for nodes to be listed"
        );

        let throttled = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "slow down".to_string(),
            reason: "TooManyRequests".to_string(),
            code: 429,
        });
        assert!(Error::from(throttled).is_retryable());
    }

    /// Story: bad configuration is rejected without retry
    #[test]
    fn story_validation_carries_field_path() {
        let err = Error::validation_for_field("spec.infrastructureRef.kind", "missing kind");
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.infrastructureRef.kind"))
            }
            _ => panic!("Expected Validation variant"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn context_prefixes_message_and_keeps_variant() {
        let res: Result<(), Error> = Err(Error::fatal("disk full"));
        let err = res.context("uploading boot image").unwrap_err();
        assert_eq!(err.to_string(), "fatal error: uploading boot image: disk full");

        let res: Result<(), Error> = Err(Error::transient("quota"));
        let err = res
            .with_context(|| format!("importing image {}", "ocid1.image"))
            .unwrap_err();
        assert!(matches!(err, Error::Transient { .. }));
        assert!(err.to_string().contains("importing image ocid1.image: quota"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let res: Result<(), std::io::Error> = Err(io);
        let err = res.context("writing ips.yaml").unwrap_err();
        assert!(err.to_string().contains("writing ips.yaml"));
    }
}
