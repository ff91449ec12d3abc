//! Error types shared by the rollout engine.

use crate::image_reference::ParseError;
use crate::target::Kind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Any Kubernetes API failure that is not an optimistic-concurrency conflict.
    #[error("Kubernetes API error: {0}")]
    Kube(kube::Error),

    /// The API server rejected a write with HTTP 409.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Patching a workload failed with a terminal error, or conflicts outlasted the retry bound.
    #[error("failed to patch {kind} {name}: {source}")]
    PatchFailed {
        kind: Kind,
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("container {container} not found in {kind} {name}")]
    ContainerNotFound {
        kind: Kind,
        name: String,
        container: String,
    },

    #[error("invalid image reference: {0}")]
    InvalidImage(#[from] ParseError),

    #[error("registry error: {0}")]
    Registry(String),

    /// The operation exists on the interface but the backing implementation does not offer it.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("history error: {0}")]
    History(String),

    #[error("sign-off error: {0}")]
    SignOff(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(response)) if response.code == 404)
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref response) if response.code == 409 => {
                Error::Conflict(response.message.clone())
            }
            other => Error::Kube(other),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
