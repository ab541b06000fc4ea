//! Error taxonomy for conversation routing and live-agent control actions.

use crate::messaging::DeliveryError;
use crate::nlu::NluError;

#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("message {0} was already processed")]
    DuplicateMessage(String),
    #[error("live agent already requested")]
    AlreadyRequested,
    #[error("a representative has already joined the conversation")]
    RepresentativeAlreadyPresent,
    #[error("no representative is present in the conversation")]
    NoRepresentativePresent,
    #[error("missing arguments: {0}")]
    MissingArguments(String),
    #[error("no nlu credentials configured for agent {0}")]
    CredentialsUnavailable(String),
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Nlu(#[from] NluError),
    #[error("conversation store: {0}")]
    Store(String),
}

impl ConversationError {
    /// HTTP status used when the error is surfaced through the gateway.
    pub fn status_code(&self) -> u16 {
        match self {
            ConversationError::DuplicateMessage(_)
            | ConversationError::AlreadyRequested
            | ConversationError::RepresentativeAlreadyPresent
            | ConversationError::NoRepresentativePresent => 409,
            ConversationError::MissingArguments(_) => 400,
            ConversationError::ConversationNotFound(_) => 404,
            ConversationError::CredentialsUnavailable(_) => 503,
            ConversationError::Delivery(_) | ConversationError::Nlu(_) => 502,
            ConversationError::Store(_) => 500,
        }
    }
}
