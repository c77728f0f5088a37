use super::types::VersionId;
use super::version::ApprovalStatus;
use sled::transaction::TransactionError;

/// Coarse classification API layers map onto their own status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidState,
    InvalidArgument,
    ApprovalRequired,
    Unauthorized,
    Cancelled,
    Failure,
}

#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("{0} was not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("version {version_id} must be approved before publishing (approval is {approval_status})")]
    ApprovalRequired {
        version_id: VersionId,
        approval_status: ApprovalStatus,
    },
    #[error("caller is not authenticated")]
    Unauthorized,
    #[error("operation was cancelled before commit")]
    Cancelled,
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode or decode a stored record: {0}")]
    Codec(String),
    #[error("internal failure: {0}")]
    Failure(String),
}

impl PublishError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::ApprovalRequired { .. } => ErrorKind::ApprovalRequired,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Storage(_) | Self::Codec(_) | Self::Failure(_) => ErrorKind::Failure,
        }
    }

    pub fn version_not_found(id: &VersionId) -> Self {
        Self::NotFound(format!("version {id}"))
    }
}

impl From<TransactionError<PublishError>> for PublishError {
    fn from(value: TransactionError<PublishError>) -> Self {
        match value {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => PublishError::Storage(err),
        }
    }
}

impl From<anyhow::Error> for PublishError {
    fn from(value: anyhow::Error) -> Self {
        PublishError::Failure(format!("{value:#}"))
    }
}
