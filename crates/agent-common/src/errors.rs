// Handler failure taxonomy mapping the exception classes thrown by `Handler.cs` subclasses.

use agent_sdk::ArgumentError;

/// Why a step's handler failed.
///
/// `Task` failures respect a result the step already reported through a logging
/// command; `Infrastructure` failures always fail the step because the execution
/// mechanism itself broke.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Validation(#[from] ArgumentError),

    #[error("{0}")]
    Task(String),

    #[error("{0}")]
    Infrastructure(String),

    #[error("{0}")]
    NotSupported(String),
}

impl HandlerError {
    pub fn task(message: impl Into<String>) -> Self {
        HandlerError::Task(message.into())
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        HandlerError::Infrastructure(message.into())
    }

    pub fn is_infrastructure(&self) -> bool {
        matches!(self, HandlerError::Infrastructure(_))
    }

    /// Find the taxonomy entry inside an `anyhow` chain, if the failure carries one.
    pub fn classify(error: &anyhow::Error) -> Option<&HandlerError> {
        error.chain().find_map(|e| e.downcast_ref::<HandlerError>())
    }
}
