use std::path::Path;

use async_trait::async_trait;

use crate::types::Product;

pub mod suse_connect;
pub use suse_connect::SuseConnect;

/// Result of one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Success,
    AgentError(String),
    AgentMissing,
}

/// One registration call: the base product when `product` is `None`,
/// otherwise the given extension.
#[derive(Debug, Clone, Copy)]
pub struct AgentRequest<'a> {
    pub url: &'a str,
    pub product: Option<&'a Product>,
    pub instance_data: Option<&'a Path>,
}

#[async_trait]
pub trait RegistrationAgent: Send + Sync {
    /// Human-readable location of the agent, for diagnostics.
    fn describe(&self) -> String;

    /// Whether the agent can be invoked at all.
    fn is_available(&self) -> bool;

    async fn register(&self, request: AgentRequest<'_>) -> AgentOutcome;
}

/// Classify agent output.  Any line carrying the error marker is a failure;
/// otherwise a non-zero exit status is one too.
pub fn classify_output(output: &str, exit_ok: bool) -> AgentOutcome {
    let errors: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|line| line.contains("Error"))
        .collect();
    if !errors.is_empty() {
        return AgentOutcome::AgentError(errors.join("; "));
    }
    if !exit_ok {
        return AgentOutcome::AgentError("agent exited with failure status".to_string());
    }
    AgentOutcome::Success
}
