use core::time::Duration;
use stampede::CollaboratorError;

/// Result alias used across the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors raised while talking to the live platform.
///
/// Everything converts into [`CollaboratorError`] at the trait boundary, so
/// the core only ever sees the collaborator taxonomy.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A configured base URL cannot be used.
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The HTTP client could not be set up (TLS backend, resolver).
    #[error("cannot build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// The request never produced a response.
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// An endpoint whose status is part of its contract answered with an
    /// unexpected one.
    #[error("{endpoint} answered with status {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// A `200` response whose body is not the platform envelope.
    #[error("cannot decode response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },

    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    /// A call exceeded its per-call budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The resource is not provisioned in this environment.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl From<Error> for CollaboratorError {
    fn from(err: Error) -> Self {
        match err {
            Error::Transport { .. } | Error::Status { .. } => Self::Transport(err.to_string()),
            Error::Redis(ref source)
                if source.is_connection_refusal() || source.is_connection_dropped() =>
            {
                Self::Unavailable(err.to_string())
            }
            Error::Redis(_) => Self::Transport(err.to_string()),
            Error::InvalidUrl { .. } | Error::Decode { .. } | Error::Client(_) => {
                Self::Protocol(err.to_string())
            }
            Error::Timeout(waited) => Self::Timeout(waited),
            Error::Unavailable(reason) => Self::Unavailable(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_failures_are_protocol_errors() {
        let err = Error::Decode {
            endpoint: "/api/engine/user-coupon/redeem".into(),
            reason: "expected value".into(),
        };
        let mapped = CollaboratorError::from(err);
        assert!(matches!(mapped, CollaboratorError::Protocol(ref m) if m.contains("redeem")));
    }

    #[test]
    fn client_setup_failures_surface_as_protocol_errors() {
        let source = reqwest::Client::builder()
            .user_agent("stampede\n")
            .build()
            .unwrap_err();
        assert!(matches!(
            CollaboratorError::from(Error::Client(source)),
            CollaboratorError::Protocol(ref m) if m.contains("HTTP client")
        ));
    }

    #[test]
    fn timeouts_and_gaps_keep_their_class() {
        let waited = Duration::from_millis(250);
        assert!(matches!(
            CollaboratorError::from(Error::Timeout(waited)),
            CollaboratorError::Timeout(w) if w == waited
        ));
        assert!(matches!(
            CollaboratorError::from(Error::Unavailable("t_user_coupon_31".into())),
            CollaboratorError::Unavailable(ref t) if t == "t_user_coupon_31"
        ));
    }

    #[test]
    fn unexpected_status_is_a_transport_failure() {
        let err = Error::Status {
            endpoint: "/ops/shard-count".into(),
            status: 502,
            body: "bad gateway".into(),
        };
        assert!(matches!(
            CollaboratorError::from(err),
            CollaboratorError::Transport(ref m) if m.contains("502")
        ));
    }
}
