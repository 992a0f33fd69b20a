//! Request momentum policy.
//!
//! Bounds how many job or block requests may be sent without an accepted
//! response before the active transfer is abandoned. This is what stops the
//! agent from retrying forever against an unresponsive or malicious service.

use crate::error::UpdateAgentError;

/// Counter of consecutive outbound requests with no accepted response.
#[derive(Debug, Clone)]
pub struct RequestMomentum {
    sent: u32,
    max: u32,
}

impl RequestMomentum {
    /// Create a counter that permits up to `max` unanswered requests.
    #[must_use]
    pub fn new(max: u32) -> Self {
        Self { sent: 0, max }
    }

    /// Account for one outbound request.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateAgentError::MomentumAbort`] once `max` requests are
    /// already unanswered; the caller must abort the transfer instead of
    /// sending.
    pub fn try_acquire(&mut self) -> Result<(), UpdateAgentError> {
        if self.sent >= self.max {
            return Err(UpdateAgentError::MomentumAbort {
                sent: self.sent,
                max: self.max,
            });
        }
        self.sent = self.sent.saturating_add(1);
        Ok(())
    }

    /// Clear the counter after an accepted response.
    pub fn reset(&mut self) {
        self.sent = 0;
    }

    /// Requests currently unanswered.
    #[must_use]
    pub fn sent(&self) -> u32 {
        self.sent
    }

    /// Configured maximum of unanswered requests.
    #[must_use]
    pub fn max(&self) -> u32 {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausts_after_max() {
        let mut momentum = RequestMomentum::new(3);
        for _ in 0..3 {
            momentum.try_acquire().expect("within budget");
        }
        assert!(matches!(
            momentum.try_acquire(),
            Err(UpdateAgentError::MomentumAbort { sent: 3, max: 3 })
        ));
    }

    #[test]
    fn test_reset_restores_budget() {
        let mut momentum = RequestMomentum::new(1);
        momentum.try_acquire().expect("first");
        assert!(momentum.try_acquire().is_err());
        momentum.reset();
        assert_eq!(momentum.sent(), 0);
        momentum.try_acquire().expect("after reset");
    }
}
