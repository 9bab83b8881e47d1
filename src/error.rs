use std::{sync::Arc, time::Duration};

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the engine and its collaborators.
///
/// Only construction-time misconfiguration and blocking-call timeouts are meant to reach the
/// caller. Everything else is recovered locally, logged, and reflected in
/// [`EvaluationDetails::reason`](crate::EvaluationDetails).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An update carried an `lcut` that is not newer than the active snapshot.
    #[error("stale specs update: current lcut {current_lcut}, incoming lcut {incoming_lcut}")]
    StaleUpdate {
        /// `lcut` of the active snapshot.
        current_lcut: u64,
        /// `lcut` of the rejected update.
        incoming_lcut: u64,
    },

    /// Payload could not be parsed or failed schema validation.
    #[error("malformed specs payload: {0}")]
    MalformedPayload(String),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Server answered with an unexpected status code.
    #[error("unexpected response status {0}")]
    UnexpectedStatus(u16),

    /// The request was unauthorized, the SDK key is likely invalid.
    #[error("unauthorized, sdk_key is likely invalid")]
    Unauthorized,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// A host-provided callback returned an error or panicked.
    #[error("adapter callback failed: {0}")]
    AdapterCallbackFailure(String),

    /// SDK key is empty or contains characters that cannot be sent in a header.
    #[error("invalid sdk key")]
    InvalidSdkKey,

    /// Options could not be parsed or hold an invalid value.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// A configured URL is not valid.
    #[error("invalid url configuration")]
    InvalidUrl(#[source] url::ParseError),

    /// Override value does not apply to the entity kind it was set for.
    #[error("invalid override: {0}")]
    InvalidOverride(String),

    /// A blocking call did not complete within its timeout.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Name of the operation that timed out.
        operation: &'static str,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// A background thread panicked. This should normally never happen.
    #[error("background thread panicked")]
    ThreadPanicked,

    /// Operation is not allowed in the current engine state.
    #[error("operation not allowed while engine is {0}")]
    InvalidState(crate::EngineState),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<url::ParseError> for Error {
    fn from(value: url::ParseError) -> Self {
        Error::InvalidUrl(value)
    }
}

/// Call into host-provided code, turning returned errors and panics into
/// [`Error::AdapterCallbackFailure`].
pub(crate) fn guard_host_call<T>(
    what: &str,
    f: impl FnOnce() -> std::result::Result<T, String>,
) -> Result<T> {
    catch_adapter_panic(what, || {
        f().map_err(|message| Error::AdapterCallbackFailure(format!("{what}: {message}")))
    })
}

/// Call an adapter, turning a panic into [`Error::AdapterCallbackFailure`]. Returned errors are
/// passed through unchanged.
pub(crate) fn catch_adapter_panic<T>(what: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f))
        .unwrap_or_else(|_| Err(Error::AdapterCallbackFailure(format!("{what} panicked"))))
}
