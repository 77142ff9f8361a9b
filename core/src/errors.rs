use thiserror::Error;
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Database unavailable")] DbUnavailable,
    #[error("Conversation not found")] ConversationNotFound,
    #[error("A reply is already being generated for this conversation")] TurnInFlight,
    #[error("Prompt must not be empty")] EmptyPrompt,
    #[error("No provider produced a reply")] ProviderUnavailable,
    #[error("Unknown error")] Unknown,
}
impl RouterError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DbUnavailable => "DB-1001",
            Self::ConversationNotFound => "CHT-1001",
            Self::TurnInFlight => "CHT-1002",
            Self::EmptyPrompt => "CHT-1003",
            Self::ProviderUnavailable => "PRV-1001",
            Self::Unknown => "GEN-1000",
        }
    }
    pub fn explain(&self) -> &'static str {
        match self {
            Self::DbUnavailable => "The application could not access the SQLite database.",
            Self::ConversationNotFound => "No conversation exists for the requested ID.",
            Self::TurnInFlight => "The previous turn has not finished; resend after it completes.",
            Self::EmptyPrompt => "The request contained no prompt text.",
            Self::ProviderUnavailable => "Every configured provider failed or was unreachable.",
            Self::Unknown => "An unspecified error occurred.",
        }
    }
}
