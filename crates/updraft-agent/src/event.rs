//! Agent events.
//!
//! Everything the agent reacts to — transport deliveries, application calls,
//! its own timers — arrives as one of these events through the single FIFO
//! queue. Producers only enqueue; the processing loop is the sole consumer.

use std::fmt;

use tokio::sync::oneshot;

use crate::error::UpdateAgentError;
use crate::image::ImageState;

/// A firmware block delivered by the data transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMessage {
    /// Served file identifier the block belongs to.
    pub file_id: u32,
    /// Zero-based block index inside the file.
    pub block_index: u32,
    /// Block payload; the last block of a file may be short.
    pub payload: Vec<u8>,
}

/// Events consumed by the agent processing loop.
pub enum AgentEvent {
    /// The loop is starting; subscribe and run the boot-time self-test check.
    Start,
    /// Ask the job service for the next pending job.
    RequestJobDocument,
    /// A raw job document arrived from the control channel.
    JobDocumentReceived(Vec<u8>),
    /// Allocate the receive file for the accepted job.
    CreateFile,
    /// Request the next batch of missing blocks.
    RequestFileBlocks,
    /// A file block arrived from the data channel.
    FileBlockReceived(BlockMessage),
    /// The request timer fired with no response seen.
    RequestTimer,
    /// The self-test acceptance deadline passed.
    SelfTestTimer,
    /// All blocks are present; close and verify the file.
    CloseFile,
    /// Pause processing, preserving all context.
    Suspend,
    /// Resume processing in the exact pre-suspension state.
    Resume,
    /// Application request to set the image state.
    SetImageState {
        /// Requested state.
        state: ImageState,
        /// Completion channel for the caller.
        reply: oneshot::Sender<Result<(), UpdateAgentError>>,
    },
    /// Application request to activate the new image.
    ActivateImage {
        /// Completion channel for the caller.
        reply: oneshot::Sender<Result<(), UpdateAgentError>>,
    },
    /// Application request to abort the active update.
    UserAbort,
    /// Stop the agent, releasing transports and the open transfer.
    Shutdown,
}

impl AgentEvent {
    /// Short name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::Start => "start",
            AgentEvent::RequestJobDocument => "request-job-document",
            AgentEvent::JobDocumentReceived(_) => "job-document-received",
            AgentEvent::CreateFile => "create-file",
            AgentEvent::RequestFileBlocks => "request-file-blocks",
            AgentEvent::FileBlockReceived(_) => "file-block-received",
            AgentEvent::RequestTimer => "request-timer",
            AgentEvent::SelfTestTimer => "self-test-timer",
            AgentEvent::CloseFile => "close-file",
            AgentEvent::Suspend => "suspend",
            AgentEvent::Resume => "resume",
            AgentEvent::SetImageState { .. } => "set-image-state",
            AgentEvent::ActivateImage { .. } => "activate-image",
            AgentEvent::UserAbort => "user-abort",
            AgentEvent::Shutdown => "shutdown",
        }
    }

    /// Whether this event carries a transport packet counted in statistics.
    pub(crate) fn is_packet(&self) -> bool {
        matches!(
            self,
            AgentEvent::JobDocumentReceived(_) | AgentEvent::FileBlockReceived(_)
        )
    }
}

impl fmt::Debug for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentEvent::JobDocumentReceived(raw) => f
                .debug_struct("JobDocumentReceived")
                .field("len", &raw.len())
                .finish(),
            AgentEvent::FileBlockReceived(msg) => f
                .debug_struct("FileBlockReceived")
                .field("file_id", &msg.file_id)
                .field("block_index", &msg.block_index)
                .field("len", &msg.payload.len())
                .finish(),
            AgentEvent::SetImageState { state, .. } => f
                .debug_struct("SetImageState")
                .field("state", state)
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_classification() {
        assert!(AgentEvent::JobDocumentReceived(Vec::new()).is_packet());
        assert!(
            AgentEvent::FileBlockReceived(BlockMessage {
                file_id: 0,
                block_index: 0,
                payload: Vec::new(),
            })
            .is_packet()
        );
        assert!(!AgentEvent::Suspend.is_packet());
        assert!(!AgentEvent::RequestTimer.is_packet());
    }
}
