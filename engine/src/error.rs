//! Error taxonomy shared by the executor, the runner and the alert evaluator.
use thiserror::Error;

/// Exit code reserved for a fired critical alert.
pub const RC_ALERT: i32 = 3;

/// Exit code for configuration or aggregated runtime errors.
pub const RC_ERROR: i32 = 1;

/// Errors produced while executing jobs and evaluating alerts.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The cluster does not serve the requested (apiVersion, kind) pair.
    #[error("unknown kind {kind} in {api_version}")]
    UnknownKind {
        /// apiVersion of the unresolvable pair.
        api_version: String,
        /// Kind of the unresolvable pair.
        kind: String,
    },

    /// Template parse or render failure.
    #[error("template error: {0}")]
    Template(String),

    /// The metrics backend returned an unexpected result shape.
    #[error("unexpected query result: {0}")]
    BadResult(String),

    /// The API server rejected a request for authorization reasons. Fatal.
    #[error("authorization error: {0}")]
    Forbidden(String),

    /// The API server answered 409.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The API server answered 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// The wait engine gave up before every resource became ready.
    #[error("timed out waiting for {unmet} resources")]
    WaitTimeout {
        /// Resources that had not satisfied their predicate at the deadline.
        unmet: usize,
    },

    /// Network failure or 5xx, worth retrying.
    #[error("transient api error: {0}")]
    Transient(String),

    /// A critical alert fired. Fatal, reserved exit code.
    #[error("critical alert fired: {0}")]
    AlertCritical(String),

    /// The run was cancelled by a signal.
    #[error("interrupted")]
    Interrupted,

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Fatal errors terminate the whole run instead of being tallied.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Forbidden(_) | Error::AlertCritical(_))
    }

    /// Transient errors are retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Process exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::AlertCritical(_) => RC_ALERT,
            _ => RC_ERROR,
        }
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                403 => Error::Forbidden(resp.message),
                404 => Error::NotFound(resp.message),
                409 => Error::Conflict(resp.message),
                code if code >= 500 => Error::Transient(resp.message),
                code => Error::Other(anyhow::anyhow!("api error {code}: {}", resp.message)),
            },
            kube::Error::Service(err) => Error::Transient(err.to_string()),
            kube::Error::HyperError(err) => Error::Transient(err.to_string()),
            other => Error::Other(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_owned(),
            message: "denied".to_owned(),
            reason: "Forbidden".to_owned(),
            code,
        })
    }

    #[test]
    fn forbidden_is_fatal() {
        let err = Error::from(api_error(403));
        assert!(matches!(err, Error::Forbidden(_)));
        assert!(err.is_fatal());
        assert_eq!(err.exit_code(), RC_ERROR);
    }

    #[test]
    fn server_errors_are_transient() {
        let err = Error::from(api_error(503));
        assert!(err.is_transient());
    }

    #[test]
    fn critical_alert_has_reserved_exit_code() {
        assert_eq!(Error::AlertCritical("up == 0".to_owned()).exit_code(), RC_ALERT);
    }
}
