//! Support utilities for [`keen_retry`]'s retry API.
//!
//! Backend and dispatcher calls can fail in ways that are worth retrying (a
//! timed-out connection, an overloaded server) and ways that are not (a
//! malformed request, an auth failure). We use [`keen_retry::RetryResult`] as
//! our common vocabulary for "this failed, and here's whether it's worth
//! trying again."

use core::fmt;

use keen_retry::RetryResult;
use reqwest::StatusCode;

use crate::prelude::*;

/// Unwrap a `Result`, returning early with [`RetryResult::Fatal`] on error.
///
/// Use this for errors that should never be retried: malformed requests,
/// responses we can't parse into our own types, and similar non-recoverable
/// failures.
macro_rules! try_fatal {
    ($result:expr) => {
        match $result {
            ::std::result::Result::Ok(value) => value,
            ::std::result::Result::Err(error) => {
                return $crate::retry::retry_result_fatal(::core::convert::From::from(
                    error,
                ));
            }
        }
    };
}
pub(crate) use try_fatal;

/// Unwrap a `Result`, returning early with [`RetryResult::Transient`] on
/// error.
///
/// Use this for errors where we already know we want another attempt, such as
/// a model that failed to emit valid JSON.
macro_rules! try_transient {
    ($result:expr) => {
        match $result {
            ::std::result::Result::Ok(value) => value,
            ::std::result::Result::Err(error) => {
                return $crate::retry::retry_result_transient(
                    ::core::convert::From::from(error),
                );
            }
        }
    };
}
pub(crate) use try_transient;

/// Unwrap a `Result`, returning early with either [`RetryResult::Transient`]
/// or [`RetryResult::Fatal`], depending on
/// [`IsKnownTransient::is_known_transient`].
///
/// Use this for errors coming straight from an HTTP client, where we don't
/// yet know whether the failure is worth retrying.
macro_rules! try_potentially_transient {
    ($result:expr) => {
        match $result {
            ::std::result::Result::Ok(value) => value,
            ::std::result::Result::Err(error) => {
                if $crate::retry::IsKnownTransient::is_known_transient(&error) {
                    return $crate::retry::retry_result_transient(error);
                } else {
                    return $crate::retry::retry_result_fatal(error);
                }
            }
        }
    };
}
pub(crate) use try_potentially_transient;

/// Build a [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build a [`RetryResult::Fatal`] value.
pub(crate) fn retry_result_fatal<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Fatal { input: (), error }
}

/// Build a [`RetryResult::Transient`] value.
pub(crate) fn retry_result_transient<T, E>(error: E) -> RetryResult<(), (), T, E>
where
    E: fmt::Display,
{
    debug!("Potentially transient error: {}", error);
    RetryResult::Transient { input: (), error }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they've been
/// observed in the wild, investigated and determined to be transient. This
/// prevents us from retrying errors that will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Connection resets, timeouts and the like don't carry a status
            // code. These are exactly the transport-level failures we want to
            // retry.
            self.is_timeout() || self.is_connect() || self.is_request()
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        matches!(
            *self,
            StatusCode::TOO_MANY_REQUESTS
                | StatusCode::INTERNAL_SERVER_ERROR
                | StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT
                | StatusCode::REQUEST_TIMEOUT
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_transience() {
        assert!(StatusCode::TOO_MANY_REQUESTS.is_known_transient());
        assert!(StatusCode::SERVICE_UNAVAILABLE.is_known_transient());
        assert!(!StatusCode::BAD_REQUEST.is_known_transient());
        assert!(!StatusCode::UNAUTHORIZED.is_known_transient());
        assert!(!StatusCode::UNPROCESSABLE_ENTITY.is_known_transient());
    }
}
