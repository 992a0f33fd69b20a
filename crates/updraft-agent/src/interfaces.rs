//! Collaborator capability interfaces.
//!
//! The agent core performs no I/O of its own. Everything that touches the
//! network, the filesystem, or the device is reached through one of these
//! traits, supplied by the hosting application at initialization.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::{JobParseError, PalError};
use crate::image::{ImageState, PalImageState};
use crate::job::{BlockRequest, FileContext};

/// Publish/subscribe control channel used for job traffic and status updates.
///
/// Topic strings are built by the agent into bounded buffers; implementations
/// receive them fully formed.
#[async_trait]
pub trait ControlInterface: Send + Sync {
    /// Subscribe to a topic.
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Unsubscribe from a topic.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Publish a message to a topic.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;
}

/// Request/response data channel used to fetch file blocks.
///
/// Implementations read the transfer parameters they need (stream name,
/// presigned URL, auth scheme, protocol) from the [`FileContext`].
#[async_trait]
pub trait DataInterface: Send + Sync {
    /// Prepare a data transfer session for the file.
    async fn init_session(&self, file: &FileContext) -> Result<()>;

    /// Request the blocks named by `request`. Responses are delivered
    /// asynchronously through the agent handle.
    async fn request_blocks(&self, file: &FileContext, request: &BlockRequest) -> Result<()>;

    /// Tear the session down.
    async fn cleanup(&self) -> Result<()>;
}

/// Platform abstraction: file storage, integrity verification, image
/// activation, and device reset.
#[async_trait]
pub trait PalInterface: Send + Sync {
    /// Create the receive file for an accepted job.
    async fn create_receive_file(&self, file: &FileContext) -> Result<(), PalError>;

    /// Store one block at `offset`; returns the number of bytes written.
    async fn write_block(&self, file: &FileContext, offset: u64, data: &[u8])
    -> Result<usize, PalError>;

    /// Close the receive file, verifying the signature carried by the
    /// [`FileContext`] against its signing-key identifier.
    async fn close_receive_file(&self, file: &FileContext) -> Result<(), PalError>;

    /// Abort and discard the receive file.
    async fn abort_receive_file(&self, file: &FileContext) -> Result<(), PalError>;

    /// Persist the image state so it survives a device reset.
    async fn set_image_state(&self, state: ImageState) -> Result<(), PalError>;

    /// Read back the persisted image state.
    async fn image_state(&self) -> Result<PalImageState, PalError>;

    /// Make the new image the boot target.
    async fn activate_image(&self) -> Result<(), PalError>;

    /// Reset the device.
    async fn reset_device(&self) -> Result<(), PalError>;
}

/// Bundle of collaborator interfaces injected at initialization.
#[derive(Clone)]
pub struct AgentInterfaces {
    /// Publish/subscribe control channel.
    pub control: Arc<dyn ControlInterface>,
    /// Request/response data channel.
    pub data: Arc<dyn DataInterface>,
    /// Platform abstraction.
    pub pal: Arc<dyn PalInterface>,
}

/// Job lifecycle events delivered to the application callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// A verified image is ready; the application should activate and reset.
    Activate,
    /// The update failed and cannot be used.
    Fail,
    /// The device is running a new image under self test; the application
    /// should run its acceptance checks and then accept or reject.
    StartTest,
}

/// Callback invoked by the agent on job lifecycle events.
pub type JobEventCallback = Box<dyn Fn(JobEvent) + Send + Sync>;

/// Outcome of the optional custom job parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomJobOutcome {
    /// The hook does not recognize the document; run the standard parser.
    Declined,
    /// The hook consumed the document; the agent takes no further action.
    Handled,
    /// The hook recognized the document and rejects it.
    Error(JobParseError),
}

/// Hook offered the raw job document bytes before the standard parser runs.
pub type CustomJobCallback = Box<dyn Fn(&[u8]) -> CustomJobOutcome + Send + Sync>;
