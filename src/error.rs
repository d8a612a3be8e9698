use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("invalid object reference '{0}', expected <namespace>/<name>")]
    InvalidReference(String),

    #[error("{stream} subscription could not be re-established: {reason}")]
    SubscriptionFailure { stream: &'static str, reason: String },

    #[error("work dispatcher is no longer accepting items")]
    DispatcherClosed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Absent objects are an expected condition, never a process error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    /// Rate limiting and server-side failures that the next event or sweep retries.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(e)) => e.code == 429 || e.code >= 500,
            Error::Kube(kube::Error::HyperError(_)) | Error::Kube(kube::Error::Service(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn classifies_not_found() {
        assert!(api_error(404).is_not_found());
        assert!(Error::not_found("Secret", "ns/creds").is_not_found());
        assert!(!api_error(409).is_not_found());
    }

    #[test]
    fn classifies_transient() {
        assert!(api_error(429).is_transient());
        assert!(api_error(503).is_transient());
        assert!(!api_error(404).is_transient());
        assert!(!Error::InvalidReference("x".into()).is_transient());
    }
}
