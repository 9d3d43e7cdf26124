use thiserror::Error;

/// Failure of one orchestrated action. The message is what the user sees.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Service(String),
    #[error("{0}")]
    Transport(String),
    #[error("{0}")]
    LocalTransform(String),
    #[error("another action is already in progress")]
    Busy,
    #[error("action result discarded after session reset")]
    Cancelled,
}

impl ActionError {
    pub fn validation(message: impl Into<String>) -> Self {
        ActionError::Validation(message.into())
    }

    pub fn service(message: impl Into<String>) -> Self {
        ActionError::Service(message.into())
    }

    pub fn local(message: impl Into<String>) -> Self {
        ActionError::LocalTransform(message.into())
    }

    /// Transport failure rendered from the whole error chain.
    pub fn transport(err: &anyhow::Error) -> Self {
        ActionError::Transport(error_chain_text(err, 600))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ActionError::Validation(_) => "validation",
            ActionError::Service(_) => "service",
            ActionError::Transport(_) => "transport",
            ActionError::LocalTransform(_) => "local_transform",
            ActionError::Busy => "busy",
            ActionError::Cancelled => "cancelled",
        }
    }
}

pub type ActionResult<T> = std::result::Result<T, ActionError>;

/// Failure reported by an [`crate::client::OperationClient`] call.
///
/// `Service` means the call went through but the payload was unusable;
/// everything else is a transport failure.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Service(String),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl From<ClientError> for ActionError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Service(message) => ActionError::Service(message),
            ClientError::Transport(err) => ActionError::transport(&err),
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
