//! Errors raised by policy administration and policy loading.
//!
//! A denied decision is never an error: the resolution engine reports it as
//! [`Decision::Deny`](crate::authz::Decision). Only malformed administrative
//! writes and policy-store failures surface as [`AuthzError`], and every
//! caller treats a propagated error as a denial.
//!
//! Each [`ErrorCode`] carries a numeric code, an HTTP status, and a
//! category label used by the `warden_errors_total` counter. Store failures
//! map to 403 so that an outage is indistinguishable from a denial.
//!
//! ```rust,ignore
//! use warden_core::error::{AuthzError, Result};
//!
//! fn require_tenant(tenant: Option<&str>) -> Result<&str> {
//!     tenant.ok_or_else(|| AuthzError::validation("tenant-scoped row needs a tenant"))
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Warden operations.
pub type Result<T> = std::result::Result<T, AuthzError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Administrative write errors (1000-1099)
    ValidationError,
    ConflictError,
    RecordNotFound,

    // Authentication/Authorization (4000-4099)
    Unauthorized,
    Forbidden,

    // Policy store errors (5000-5099)
    ConfigurationError,
    DeadlineExceeded,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::ValidationError => 1000,
            Self::ConflictError => 1001,
            Self::RecordNotFound => 1002,

            Self::Unauthorized => 4000,
            Self::Forbidden => 4001,

            Self::ConfigurationError => 5000,
            Self::DeadlineExceeded => 5001,

            Self::InternalError => 9000,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ConflictError => StatusCode::CONFLICT,
            Self::RecordNotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,

            // Store failures fail closed: the caller sees a plain 403.
            Self::Forbidden | Self::ConfigurationError | Self::DeadlineExceeded => {
                StatusCode::FORBIDDEN
            }

            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "administration",
            4000..=4099 => "authorization",
            5000..=5099 => "policy_store",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad keys, duplicates)
    Low,
    /// Operational issues (deadlines, rejected requests)
    Medium,
    /// Store corruption or unreachable store
    High,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError
            | ErrorCode::ConflictError
            | ErrorCode::RecordNotFound
            | ErrorCode::Unauthorized
            | ErrorCode::Forbidden => Self::Low,

            ErrorCode::DeadlineExceeded => Self::Medium,

            ErrorCode::ConfigurationError | ErrorCode::InternalError => Self::High,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// Error carrying a client-safe message and a log-only detail.
#[derive(Error, Debug)]
pub struct AuthzError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional context key-value pairs
    context: HashMap<String, serde_json::Value>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for AuthzError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl AuthzError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Build an error and count it.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            context: HashMap::new(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Like [`new`](Self::new), plus a log-only detail.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Malformed key or flag on an administrative write.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Duplicate key on create, or a delete blocked by a reference.
    pub fn conflict(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ConflictError, message)
    }

    /// Policy store unreachable or holding corrupt data.
    pub fn configuration(internal_message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Access policy is unavailable",
            internal_message,
        )
    }

    /// The decision could not complete within the request deadline.
    pub fn deadline_exceeded(timeout_ms: u64) -> Self {
        Self::with_internal(
            ErrorCode::DeadlineExceeded,
            "Access policy is unavailable",
            format!("policy lookup exceeded {}ms", timeout_ms),
        )
        .with_context("timeout_ms", timeout_ms)
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::RecordNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_context("entity_type", entity_type)
        .with_context("entity_id", entity_id)
    }

    /// Create an unauthorized error.
    pub fn unauthorized(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// Create a forbidden error.
    pub fn forbidden(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add context.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn context(&self) -> &HashMap<String, serde_json::Value> {
        &self.context
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Emit at `error`, `warn`, or `debug` depending on severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "Policy store error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    internal_message = ?self.internal_message,
                    "Authorization degraded"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Rejected request"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "warden_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response for API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always false for errors
    pub success: bool,

    /// Error information
    pub error: ErrorInfo,
}

/// Error information for API responses. Internal messages are never included.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub numeric_code: u32,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&AuthzError> for ErrorResponse {
    fn from(error: &AuthzError) -> Self {
        // Store failures are reported as a plain denial.
        let (code, message) = match error.code {
            ErrorCode::ConfigurationError | ErrorCode::DeadlineExceeded => {
                (ErrorCode::Forbidden, "Access denied".to_string())
            }
            code => (code, error.user_message.to_string()),
        };
        Self {
            success: false,
            error: ErrorInfo {
                code,
                numeric_code: code.numeric_code(),
                message,
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

impl IntoResponse for AuthzError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for AuthzError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::RowNotFound => Self::with_internal(
                ErrorCode::RecordNotFound,
                "The requested record was not found",
                error.to_string(),
            ),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                let constraint = db_err.constraint().unwrap_or("unknown").to_string();
                Self::with_internal(
                    ErrorCode::ConflictError,
                    "A record with this key already exists",
                    format!("Constraint violation: {}", constraint),
                )
                .with_source(error)
            }
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::with_internal(
                    ErrorCode::ConflictError,
                    "The record is still referenced or refers to a missing record",
                    db_err.message().to_string(),
                )
                .with_source(error)
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::configuration(format!("corrupt policy row: {}", error)).with_source(error)
            }
            _ => Self::configuration(error.to_string()).with_source(error),
        }
    }
}

impl From<serde_json::Error> for AuthzError {
    fn from(error: serde_json::Error) -> Self {
        Self::configuration(format!("malformed policy data: {}", error)).with_source(error)
    }
}

impl From<config::ConfigError> for AuthzError {
    fn from(error: config::ConfigError) -> Self {
        Self::configuration(format!("configuration error: {}", error)).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for AuthzError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(
            ErrorCode::DeadlineExceeded,
            "Access policy is unavailable",
            error.to_string(),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
