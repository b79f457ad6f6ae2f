use thiserror::Error;

use tether_types::messages::{
    ERRNO_DUPLICATE_SESSION, ERRNO_INVALID_CREDENTIAL, ERRNO_REGISTRATION_FAILED, MsgKind,
};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid user id or password")]
    InvalidCredential,

    #[error("this account is already logged in")]
    DuplicateSession,

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("malformed {kind} message: {reason}")]
    Malformed { kind: MsgKind, reason: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("fanout unavailable: {0}")]
    FanoutUnavailable(String),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ChatError {
    pub fn store(err: anyhow::Error) -> Self {
        Self::StoreUnavailable(format!("{:#}", err))
    }

    pub fn malformed(kind: MsgKind, reason: impl ToString) -> Self {
        Self::Malformed {
            kind,
            reason: reason.to_string(),
        }
    }

    /// Code reported in ack frames. Everything that is not a duplicate
    /// session or a registration failure is reported as a credential failure.
    pub fn errno(&self) -> i32 {
        match self {
            Self::DuplicateSession => ERRNO_DUPLICATE_SESSION,
            Self::RegistrationFailed(_) => ERRNO_REGISTRATION_FAILED,
            _ => ERRNO_INVALID_CREDENTIAL,
        }
    }
}
