//! 网关错误码：对外错误体中的 type / code 以及对应的 HTTP 状态码。
//!
//! Wire error codes of the OpenAI-compatible error body.
//!
//! Every non-transient error the gateway surfaces is rendered as
//! `{"error": {"message", "type", "code"}}`. This module owns the mapping from
//! an error kind to its `type`, `code` and HTTP status.
//!
//! | Code | Type | Status |
//! |------|------|--------|
//! | `invalid_request` | invalid_request_error | 400 |
//! | `model_not_found` | invalid_request_error | 404 |
//! | `unauthenticated` | authentication_error | 401 |
//! | `permission_denied` | permission_error | 403 |
//! | `unsupported_capability` | invalid_request_error | 422 |
//! | `upstream_fatal` | upstream_error | 502 |
//! | `circuit_open` | upstream_error | 503 |
//! | `timeout` | timeout_error | 504 |
//! | `stream_aborted` | upstream_error | in-band |
//! | `internal_error` | server_error | 500 |
//!
//! ## Example
//!
//! ```rust
//! use ai_gateway_rust::error_code::ErrorCode;
//!
//! let code = ErrorCode::CircuitOpen;
//! assert_eq!(code.code(), "circuit_open");
//! assert_eq!(code.http_status(), 503);
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Malformed body, missing or out-of-range fields
    InvalidRequest,
    /// Requested model is not in the catalog
    ModelNotFound,
    /// Missing or unknown caller credential
    Unauthenticated,
    /// Caller is not allowed to use the model, or the model is disabled
    PermissionDenied,
    /// Conversion cannot preserve the requested semantics
    UnsupportedCapability,
    /// Upstream rejected the call or retries were exhausted
    UpstreamFatal,
    /// Breaker is open for the target endpoint
    CircuitOpen,
    /// Connect, chunk-read or overall deadline exceeded
    Timeout,
    /// Partial stream delivered, then the upstream failed
    StreamAborted,
    /// Anything else
    Internal,
}

impl ErrorCode {
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::ModelNotFound => "model_not_found",
            Self::Unauthenticated => "unauthenticated",
            Self::PermissionDenied => "permission_denied",
            Self::UnsupportedCapability => "unsupported_capability",
            Self::UpstreamFatal => "upstream_fatal",
            Self::CircuitOpen => "circuit_open",
            Self::Timeout => "timeout",
            Self::StreamAborted => "stream_aborted",
            Self::Internal => "internal_error",
        }
    }

    /// The `type` field of the error body.
    #[inline]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest | Self::ModelNotFound | Self::UnsupportedCapability => {
                "invalid_request_error"
            }
            Self::Unauthenticated => "authentication_error",
            Self::PermissionDenied => "permission_error",
            Self::UpstreamFatal | Self::CircuitOpen | Self::StreamAborted => "upstream_error",
            Self::Timeout => "timeout_error",
            Self::Internal => "server_error",
        }
    }

    #[inline]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Unauthenticated => 401,
            Self::PermissionDenied => 403,
            Self::ModelNotFound => 404,
            Self::UnsupportedCapability => 422,
            Self::Internal => 500,
            Self::UpstreamFatal | Self::StreamAborted => 502,
            Self::CircuitOpen => 503,
            Self::Timeout => 504,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_are_4xx() {
        for code in [
            ErrorCode::InvalidRequest,
            ErrorCode::ModelNotFound,
            ErrorCode::Unauthenticated,
            ErrorCode::PermissionDenied,
            ErrorCode::UnsupportedCapability,
        ] {
            assert!((400..500).contains(&code.http_status()), "{}", code);
        }
    }

    #[test]
    fn test_upstream_errors_share_type() {
        assert_eq!(ErrorCode::CircuitOpen.error_type(), "upstream_error");
        assert_eq!(ErrorCode::StreamAborted.error_type(), "upstream_error");
        assert_eq!(ErrorCode::Timeout.error_type(), "timeout_error");
    }
}
