use crate::domain::AccountId;

/// Core error type.
///
/// Adapter crates should map their specific errors into this type so the
/// operator surface can handle failures consistently. Per-link join outcomes
/// (flood wait, permission denied, ...) are not errors; see
/// [`crate::client::JoinOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("no valid links: {}", rejected.join(", "))]
    ValidationRejected { rejected: Vec<String> },

    #[error("a join job is already running for account {0}")]
    AlreadyRunning(AccountId),

    #[error("join job for account {0} was cancelled before it started")]
    Cancelled(AccountId),

    #[error("account {0} has no pending links")]
    NoPendingLinks(AccountId),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("account {0} is inactive")]
    AccountInactive(AccountId),

    #[error("account session is not authorised: {0}")]
    AuthRequired(String),

    #[error("remote service unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Errors the operator can fix by acting (and should be told about verbatim).
    pub fn is_operator_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ValidationRejected { .. }
                | Error::AlreadyRunning(_)
                | Error::Cancelled(_)
                | Error::NoPendingLinks(_)
                | Error::AccountNotFound(_)
                | Error::AccountInactive(_)
                | Error::AuthRequired(_)
                | Error::RemoteUnreachable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
