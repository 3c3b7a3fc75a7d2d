//! Errors raised by bandwidth rule management.

use thiserror::Error;

use crate::context::NetworkContext;

#[derive(Debug, Error)]
pub enum BandwidthError {
    /// Global and per-type default contexts always keep a rule set.
    #[error("rules for {context} cannot be deleted")]
    ProtectedContext { context: String },
}

impl BandwidthError {
    pub fn protected_context(context: &NetworkContext) -> Self {
        Self::ProtectedContext {
            context: context.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protected_context_display() {
        let err = BandwidthError::protected_context(&NetworkContext::global());
        assert_eq!(err.to_string(), "rules for global cannot be deleted");
    }
}
