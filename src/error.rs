use std::time::Duration;
use thiserror::Error;

/// Errors produced by the resilience engine and the chat facade.
#[derive(Error, Debug)]
pub enum LlmError {
    /// The estimated input size exceeds the configured limit.
    #[error("input too large: estimated {estimated} tokens exceeds the {max} token limit")]
    InputTooLarge { estimated: u32, max: u32 },

    /// No API key could be resolved for a provider that requires one.
    #[error("no API key for provider '{0}'")]
    AuthMissing(String),

    /// The requested provider id is unknown or inactive.
    #[error("unknown or inactive provider '{0}'")]
    InvalidProvider(String),

    /// The operation was cancelled via its cancellation token.
    #[error("operation was cancelled")]
    Cancelled,

    /// The whole-operation deadline fired.
    #[error("operation timed out")]
    Timeout,

    /// The circuit breaker for the bucket was open at attempt start.
    #[error("circuit breaker for '{0}' is open")]
    CircuitOpen(String),

    /// The bulkhead rejected the operation: too many in flight.
    #[error("too many concurrent operations for '{0}'")]
    ConcurrencyExceeded(String),

    /// The provider returned a non-success status code.
    ///
    /// `retry_after` is populated from the `Retry-After` response header
    /// when present. Use [`LlmError::kind`] to branch on the status class.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Provider error message, or the raw response body.
        body: String,
        /// Parsed `Retry-After` hint, if present.
        retry_after: Option<Duration>,
    },

    /// Low-level transport failure (connection refused, DNS, reset, etc.).
    #[error("transport failure: {0}")]
    Transport(String),

    /// Cross-provider fallback ran out of candidates.
    #[error("no alternative provider available")]
    NoAlternativeProvider,

    /// The response body did not contain content at the configured path.
    #[error("failed to extract response content at '{path}': {message}")]
    ResponseParse { path: String, message: String },

    /// Invalid configuration detected before execution.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

/// Programmatic classification of an [`LlmError`].
///
/// HTTP statuses map per the crate's status policy: 400 → `BadRequest`,
/// 401 → `InvalidApiKey`, 403 → `Forbidden`, 404 → `NotFound`,
/// 429 → `RateLimited`, 500 → `Internal`, 503 → `Unavailable`,
/// 529 → `Overloaded`, other 5xx → `Transient`, other 4xx → `Hard`,
/// anything else → `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InputTooLarge,
    AuthMissing,
    InvalidProvider,
    Cancelled,
    Timeout,
    CircuitOpen,
    ConcurrencyExceeded,
    BadRequest,
    InvalidApiKey,
    Forbidden,
    NotFound,
    RateLimited,
    Internal,
    Unavailable,
    Overloaded,
    Transient,
    Hard,
    NoAlternativeProvider,
    ResponseParse,
    InvalidConfig,
    Unknown,
}

impl LlmError {
    /// Classify this error into its [`ErrorKind`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            LlmError::InputTooLarge { .. } => ErrorKind::InputTooLarge,
            LlmError::AuthMissing(_) => ErrorKind::AuthMissing,
            LlmError::InvalidProvider(_) => ErrorKind::InvalidProvider,
            LlmError::Cancelled => ErrorKind::Cancelled,
            LlmError::Timeout => ErrorKind::Timeout,
            LlmError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            LlmError::ConcurrencyExceeded(_) => ErrorKind::ConcurrencyExceeded,
            LlmError::Http { status, .. } => match *status {
                400 => ErrorKind::BadRequest,
                401 => ErrorKind::InvalidApiKey,
                403 => ErrorKind::Forbidden,
                404 => ErrorKind::NotFound,
                429 => ErrorKind::RateLimited,
                500 => ErrorKind::Internal,
                503 => ErrorKind::Unavailable,
                529 => ErrorKind::Overloaded,
                501..=599 => ErrorKind::Transient,
                402..=499 => ErrorKind::Hard,
                _ => ErrorKind::Unknown,
            },
            LlmError::Transport(_) => ErrorKind::Transient,
            LlmError::NoAlternativeProvider => ErrorKind::NoAlternativeProvider,
            LlmError::ResponseParse { .. } => ErrorKind::ResponseParse,
            LlmError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            LlmError::Json(_) => ErrorKind::Hard,
            LlmError::Other(_) => ErrorKind::Unknown,
        }
    }

    /// Whether the resilience engine may retry after this error.
    ///
    /// Cancellation, open circuits, and bulkhead rejections never retry.
    /// Timeouts, 429/529, 5xx, and transport faults retry while the
    /// budget lasts; other client-side faults surface immediately.
    pub fn should_retry(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout
                | ErrorKind::RateLimited
                | ErrorKind::Overloaded
                | ErrorKind::Internal
                | ErrorKind::Unavailable
                | ErrorKind::Transient
        )
    }

    /// Whether this error counts as a failure vote on the circuit breaker.
    ///
    /// Every provider-side fault votes, including hard 4xx responses.
    /// Cancellation and the engine's own rejections (open circuit, full
    /// bulkhead) do not.
    pub fn counts_as_breaker_failure(&self) -> bool {
        match self {
            LlmError::Http { .. } | LlmError::Transport(_) | LlmError::Timeout => true,
            LlmError::Json(_) => true,
            _ => false,
        }
    }

    /// The server-suggested minimum wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Transport(err.to_string())
        }
    }
}

impl From<anyhow::Error> for LlmError {
    fn from(err: anyhow::Error) -> Self {
        LlmError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;
