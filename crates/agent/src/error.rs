//! Structured error type for the agent crate.
//!
//! Every variant carries typed context. Nothing here is fatal to the
//! process: runner flows convert these into `run_failed` / `play_failed`
//! progress events before the stream closes.

use thiserror::Error;

use crate::gateway::GatewayError;
use crate::sandbox::platform::SandboxError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    #[error("max turns ({0}) exceeded")]
    MaxTurnsExceeded(usize),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for AgentError {
    fn from(e: anyhow::Error) -> Self {
        AgentError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_human_readable() {
        assert_eq!(
            AgentError::MaxTurnsExceeded(50).to_string(),
            "max turns (50) exceeded"
        );
        assert_eq!(
            AgentError::Internal("oops".into()).to_string(),
            "internal error: oops"
        );
    }

    #[test]
    fn from_serde_json_error() {
        let json_err: serde_json::Error =
            serde_json::from_str::<serde_json::Value>("{ bad json").unwrap_err();
        let agent_err: AgentError = json_err.into();
        assert!(matches!(agent_err, AgentError::Serialization(_)));
    }
}
