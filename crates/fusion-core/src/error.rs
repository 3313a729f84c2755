//! The orchestrator's error taxonomy.
//!
//! Every failure that can escape a request handler, a provider connection,
//! or the file-transaction layer maps onto one of the [`ErrorCategory`]
//! variants below. The category drives propagation policy (close the
//! connection vs. reply with an `Exception` vs. abandon a provider vs.
//! terminate the process) — see the table in the orchestrator spec.

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FusionError>;

/// Coarse-grained propagation policy for a [`FusionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad magic/version/short read on the wire. Close only the offending
    /// connection; never propagate across threads.
    Protocol,
    /// Bad arguments, unknown command, or a handler-thrown failure.
    /// Returned to the client as an `Exception` reply.
    ClientRequest,
    /// A task's inputs/outputs could not be resolved, or its requirements
    /// conflict statically. Surfaces as a synthetic failed task.
    TaskConstruction,
    /// A provider reported job failure, or a dead provider's `StopJob`
    /// never acknowledged.
    TaskRuntime,
    /// A `Request` to a provider timed out or the socket errored.
    /// Schedules provider abandonment.
    ProviderCommunication,
    /// The file-transaction commit (rename of `.new` files) failed.
    /// Aborts the enclosing `PendingAssetGuard`.
    StorageCommit,
    /// Unrecoverable: missing volumes at startup, duplicate singleton
    /// instance, malformed asset root. Logs and terminates the process.
    Fatal,
}

/// The orchestrator-wide error type. One stable `&'static str` code per
/// variant plus a human-readable message; the optional `source` preserves
/// the underlying cause for logging.
#[derive(Debug, Error)]
pub enum FusionError {
    #[error("protocol error: {message}")]
    Protocol {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("bad request `{command}`: {message}")]
    ClientRequest { command: String, message: String },

    #[error("cannot construct task for {verref}: {message}")]
    TaskConstruction {
        verref: String,
        message: String,
    },

    #[error("task {taskid} for {verref} failed: {message}")]
    TaskRuntime {
        taskid: u32,
        verref: String,
        message: String,
    },

    #[error("communication with provider `{host}` failed: {message}")]
    ProviderCommunication { host: String, message: String },

    #[error("storage commit failed: {message}")]
    StorageCommit {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("fatal: {message}")]
    Fatal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl FusionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            FusionError::Protocol { .. } => ErrorCategory::Protocol,
            FusionError::ClientRequest { .. } => ErrorCategory::ClientRequest,
            FusionError::TaskConstruction { .. } => ErrorCategory::TaskConstruction,
            FusionError::TaskRuntime { .. } => ErrorCategory::TaskRuntime,
            FusionError::ProviderCommunication { .. } => ErrorCategory::ProviderCommunication,
            FusionError::StorageCommit { .. } => ErrorCategory::StorageCommit,
            FusionError::Fatal { .. } => ErrorCategory::Fatal,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        FusionError::Protocol {
            message: message.into(),
            source: None,
        }
    }

    pub fn protocol_io(message: impl Into<String>, source: std::io::Error) -> Self {
        FusionError::Protocol {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn client_request(command: impl Into<String>, message: impl Into<String>) -> Self {
        FusionError::ClientRequest {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn task_construction(verref: impl Into<String>, message: impl Into<String>) -> Self {
        FusionError::TaskConstruction {
            verref: verref.into(),
            message: message.into(),
        }
    }

    pub fn task_runtime(
        taskid: u32,
        verref: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        FusionError::TaskRuntime {
            taskid,
            verref: verref.into(),
            message: message.into(),
        }
    }

    pub fn provider_communication(host: impl Into<String>, message: impl Into<String>) -> Self {
        FusionError::ProviderCommunication {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn storage_commit(message: impl Into<String>) -> Self {
        FusionError::StorageCommit {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_commit_io(message: impl Into<String>, source: std::io::Error) -> Self {
        FusionError::StorageCommit {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        FusionError::Fatal {
            message: message.into(),
            source: None,
        }
    }
}

/// Renders an `Exception` wire-message payload: just the display text, no
/// structured fields, per the wire protocol's "Exception payload is a
/// UTF-8 error string" contract.
impl FusionError {
    pub fn as_exception_payload(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::ClientRequest => "client_request",
            ErrorCategory::TaskConstruction => "task_construction",
            ErrorCategory::TaskRuntime => "task_runtime",
            ErrorCategory::ProviderCommunication => "provider_communication",
            ErrorCategory::StorageCommit => "storage_commit",
            ErrorCategory::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_payload_is_display_text() {
        let err = FusionError::client_request("Build", "unknown asset");
        assert_eq!(
            err.as_exception_payload(),
            "bad request `Build`: unknown asset"
        );
        assert_eq!(err.category(), ErrorCategory::ClientRequest);
    }

    #[test]
    fn category_matches_variant() {
        assert_eq!(
            FusionError::fatal("volumes missing").category(),
            ErrorCategory::Fatal
        );
        assert_eq!(
            FusionError::task_runtime(3, "Foo?version=1", "boom").category(),
            ErrorCategory::TaskRuntime
        );
    }
}
