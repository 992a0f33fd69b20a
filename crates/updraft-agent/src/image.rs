//! Image lifecycle state and its manager.
//!
//! The platform persists the image state across device resets, so the agent
//! can tell at boot whether it is running a new image under self test.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::UpdateAgentError;
use crate::interfaces::PalInterface;

/// Lifecycle state of the running or pending firmware image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageState {
    /// No image lifecycle information is available.
    #[default]
    Unknown,
    /// A new image is running under self test and awaits acceptance.
    Testing,
    /// The image was accepted and is permanent.
    Accepted,
    /// The image was rejected; the previous image is restored.
    Rejected,
    /// The update was aborted before completion.
    Aborted,
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageState::Unknown => "unknown",
            ImageState::Testing => "testing",
            ImageState::Accepted => "accepted",
            ImageState::Rejected => "rejected",
            ImageState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Image state as persisted and reported by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PalImageState {
    /// The platform cannot tell.
    #[default]
    Unknown,
    /// A new image booted and awaits commit or rollback.
    PendingCommit,
    /// The running image is committed.
    Valid,
    /// The last image was invalidated.
    Invalid,
}

impl fmt::Display for PalImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PalImageState::Unknown => "unknown",
            PalImageState::PendingCommit => "pending-commit",
            PalImageState::Valid => "valid",
            PalImageState::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

/// Owns [`ImageState`] transitions and the matching platform persistence call.
pub struct ImageStateManager {
    current: ImageState,
    pal: Arc<dyn PalInterface>,
}

impl ImageStateManager {
    /// Create a manager starting from [`ImageState::Unknown`].
    pub fn new(pal: Arc<dyn PalInterface>) -> Self {
        Self {
            current: ImageState::Unknown,
            pal,
        }
    }

    /// State the manager currently tracks.
    #[must_use]
    pub fn current(&self) -> ImageState {
        self.current
    }

    /// Boot-time check: a platform reporting a pending-commit image means the
    /// device is running a new image under self test.
    ///
    /// # Errors
    ///
    /// Fails when the platform cannot report its state.
    pub async fn boot_self_test_pending(&mut self) -> Result<bool, UpdateAgentError> {
        let platform = self
            .pal
            .image_state()
            .await
            .map_err(UpdateAgentError::ImageStateQuery)?;
        if platform == PalImageState::PendingCommit {
            self.current = ImageState::Testing;
            info!("platform reports a pending-commit image");
            return Ok(true);
        }
        Ok(false)
    }

    /// Mark a freshly downloaded, verified image as awaiting self test.
    ///
    /// # Errors
    ///
    /// Fails when the platform cannot persist the state.
    pub async fn enter_testing(&mut self) -> Result<(), UpdateAgentError> {
        self.persist(ImageState::Testing).await
    }

    /// Verify that the platform agrees with the job's self-test claim.
    ///
    /// A disagreement in either direction is an integrity failure (a possible
    /// tampering signal), never silently reconciled.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateAgentError::ImageStateMismatch`] on disagreement, or a
    /// query error when the platform cannot report its state.
    pub async fn check_self_test_consistency(
        &self,
        job_in_self_test: bool,
    ) -> Result<(), UpdateAgentError> {
        let platform = self
            .pal
            .image_state()
            .await
            .map_err(UpdateAgentError::ImageStateQuery)?;
        let platform_testing = platform == PalImageState::PendingCommit;
        if job_in_self_test != platform_testing {
            return Err(UpdateAgentError::ImageStateMismatch { platform });
        }
        Ok(())
    }

    /// Apply an application-requested final state.
    ///
    /// # Errors
    ///
    /// Only `Accepted`, `Rejected`, and `Aborted` may be requested; anything
    /// else is [`UpdateAgentError::BadImageState`]. Persistence failures are
    /// reported per requested state (commit, reject, or abort failure).
    pub async fn apply(&mut self, requested: ImageState) -> Result<(), UpdateAgentError> {
        match requested {
            ImageState::Accepted | ImageState::Rejected | ImageState::Aborted => {
                self.persist(requested).await
            }
            ImageState::Testing | ImageState::Unknown => {
                Err(UpdateAgentError::BadImageState(requested))
            }
        }
    }

    async fn persist(&mut self, state: ImageState) -> Result<(), UpdateAgentError> {
        self.pal
            .set_image_state(state)
            .await
            .map_err(|source| UpdateAgentError::ImageStatePersist { state, source })?;
        self.current = state;
        info!(state = %state, "image state persisted");
        Ok(())
    }
}
