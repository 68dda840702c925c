//! Error kinds distinguished by the provisioning workers.
//!
//! The worker dispatches on a small set of error kinds: `NotFound` usually
//! means the entity was removed upstream, `TryAgain` re-arms the calling
//! timer, `Forbidden` and `NotLeader` are suppressed where disordered events
//! are expected. Everything else is fatal to the worker and is carried as an
//! opaque [`anyhow::Error`].

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not leader")]
    NotLeader,

    /// Transient condition, convertible to and from the RPC try-again code.
    #[error("try again")]
    TryAgain,

    /// Shutdown was requested while the worker was waiting.
    #[error("worker is dying")]
    Dying,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn other(msg: impl std::fmt::Display) -> Self {
        Error::Other(anyhow::anyhow!("{msg}"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, Error::Forbidden(_))
    }

    pub fn is_try_again(&self) -> bool {
        matches!(self, Error::TryAgain)
    }

    /// Prefix the error message with context, preserving the kind so that
    /// dispatch on `is_not_found` and friends still works up the stack.
    /// Sentinel kinds carry no message and pass through unchanged.
    pub fn annotate(self, context: impl std::fmt::Display) -> Self {
        match self {
            Error::NotFound(msg) => Error::NotFound(format!("{context}: {msg}")),
            Error::NotImplemented(msg) => Error::NotImplemented(format!("{context}: {msg}")),
            Error::Forbidden(msg) => Error::Forbidden(format!("{context}: {msg}")),
            Error::Other(err) => Error::Other(err.context(context.to_string())),
            sentinel @ (Error::NotLeader | Error::TryAgain | Error::Dying) => sentinel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotate_preserves_kind() {
        let err = Error::not_found("unit red/0").annotate("fetching life");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "fetching life: unit red/0 not found");
    }

    #[test]
    fn annotate_passes_sentinels_through() {
        assert!(Error::TryAgain.annotate("scaling").is_try_again());
        assert!(matches!(Error::Dying.annotate("scaling"), Error::Dying));
    }

    #[test]
    fn annotate_chains_context_on_fatal_errors() {
        let err = Error::other("boom").annotate("ensuring application red");
        assert!(err.to_string().contains("ensuring application red"));
    }
}
