use crate::auth::DenyReason;
use crate::error_code::ErrorCode;
use crate::resilience::FailureClass;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "messages[0].content", "retry.max_attempts")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "normalizer", "config_loader")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Which independently enforced timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Connect,
    ChunkRead,
    Deadline,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutPhase::Connect => "connect",
            TimeoutPhase::ChunkRead => "chunk read",
            TimeoutPhase::Deadline => "request deadline",
        })
    }
}

/// Unified error type for the gateway.
///
/// `UpstreamTransient` is internal: the resiliency layer retries it and turns
/// exhaustion into `UpstreamFatal` (or `Timeout` for connect timeouts).
#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("The model '{model}' does not exist")]
    NotFound { model: String },

    #[error("{message}")]
    Authorization { reason: DenyReason, message: String },

    #[error("Unsupported capability: {message}{}", format_context(.context))]
    UnsupportedCapability {
        message: String,
        context: ErrorContext,
    },

    #[error("Transient upstream failure ({class}): {message}")]
    UpstreamTransient {
        class: FailureClass,
        status: Option<u16>,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Upstream call failed after {attempts} attempt(s): {message}")]
    UpstreamFatal {
        status: Option<u16>,
        attempts: u32,
        message: String,
    },

    #[error("Circuit open for {endpoint}; retry in {}s", .retry_after.as_secs().max(1))]
    CircuitOpen {
        endpoint: String,
        retry_after: Duration,
    },

    #[error("Timed out: {phase} timeout exceeded")]
    Timeout { phase: TimeoutPhase },

    #[error("Stream aborted after {delivered} chunk(s): {message}")]
    StreamAborted { delivered: u64, message: String },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Validation error pointing at a request field
    pub fn invalid_field(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::validation_with_context(
            msg,
            ErrorContext::new()
                .with_field_path(path)
                .with_source("normalizer"),
        )
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::configuration_with_context(msg, ErrorContext::new())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::UnsupportedCapability {
            message: msg.into(),
            context: ErrorContext::new().with_source("adapter"),
        }
    }

    pub fn denied(reason: DenyReason, msg: impl Into<String>) -> Self {
        Error::Authorization {
            reason,
            message: msg.into(),
        }
    }

    pub fn transient(class: FailureClass, msg: impl Into<String>) -> Self {
        Error::UpstreamTransient {
            class,
            status: None,
            message: msg.into(),
            retry_after: None,
        }
    }

    /// Failure class if this error is retryable upstream noise.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            Error::UpstreamTransient { class, .. } => Some(*class),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::UpstreamTransient { retry_after, .. } => *retry_after,
            Error::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Get the error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Validation { context, .. }
            | Error::UnsupportedCapability { context, .. }
            | Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Wire error code for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::Validation { .. } | Error::Serialization(_) => ErrorCode::InvalidRequest,
            Error::NotFound { .. } => ErrorCode::ModelNotFound,
            Error::Authorization {
                reason: DenyReason::Unauthenticated,
                ..
            } => ErrorCode::Unauthenticated,
            Error::Authorization { .. } => ErrorCode::PermissionDenied,
            Error::UnsupportedCapability { .. } => ErrorCode::UnsupportedCapability,
            Error::UpstreamTransient { .. } | Error::UpstreamFatal { .. } => {
                ErrorCode::UpstreamFatal
            }
            Error::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Error::Timeout { .. } => ErrorCode::Timeout,
            Error::StreamAborted { .. } => ErrorCode::StreamAborted,
            Error::Configuration { .. } | Error::Io(_) | Error::Yaml(_) => ErrorCode::Internal,
        }
    }

    /// HTTP status the server answers with.
    ///
    /// Upstream 4xx rejections of the request pass through. Upstream 401, 403
    /// and 407 concern the gateway's own credentials and answer 502.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::UpstreamFatal {
                status: Some(s), ..
            } if (400..500).contains(s) && !matches!(*s, 401 | 403 | 407 | 429) => *s,
            other => other.error_code().http_status(),
        }
    }

    /// `code` field of the wire error body.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Error::Authorization { reason, .. } => reason.code(),
            other => other.error_code().code(),
        }
    }
}
