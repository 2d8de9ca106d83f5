use thiserror::Error;

/// Error taxonomy for the bridge. Every long-lived loop matches on this
/// enum to decide whether to exit the process or log-and-continue.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    FatalConfig(String),

    #[error("shared store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("shared store operation failed: {0}")]
    StoreTransient(String),

    #[error("telegram api error (fatal): {0}")]
    TelegramFatal(String),

    #[error("telegram api error (transient): {0}")]
    TelegramTransient(String),

    #[error("agent call timed out: {0}")]
    AgentTransient(String),

    #[error("agent turn aborted")]
    AgentAborted,
}

impl BridgeError {
    /// Whether this error should terminate the process when it occurs at
    /// startup. Only FatalConfig and TelegramFatal qualify; everything
    /// else is handled by degrading or retrying.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, BridgeError::FatalConfig(_) | BridgeError::TelegramFatal(_))
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_config_is_fatal_at_startup() {
        assert!(BridgeError::FatalConfig("no token".into()).is_fatal_at_startup());
    }

    #[test]
    fn telegram_fatal_is_fatal_at_startup() {
        assert!(BridgeError::TelegramFatal("401".into()).is_fatal_at_startup());
    }

    #[test]
    fn store_unavailable_is_not_fatal_at_startup() {
        assert!(!BridgeError::StoreUnavailable("missing root".into()).is_fatal_at_startup());
    }

    #[test]
    fn agent_aborted_is_not_fatal_at_startup() {
        assert!(!BridgeError::AgentAborted.is_fatal_at_startup());
    }
}
