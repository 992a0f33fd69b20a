//! Error types for the update agent.
//!
//! Internally every failure is a typed error. The packed 32-bit form — agent
//! kind in the upper 8 bits, platform sub-code in the lower 24 — survives only
//! at compatibility boundaries through [`ErrorCode::as_wire`].

use thiserror::Error;

use crate::image::{ImageState, PalImageState};

/// Mask of the 24-bit platform sub-code inside a packed error word.
const SUB_CODE_MASK: u32 = 0x00ff_ffff;

/// Agent-level error kinds, the upper 8 bits of the packed wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    /// The signature check failed for the received file.
    SignatureCheckFailed = 0x01,
    /// The signer certificate was unreadable or empty.
    BadSignerCert = 0x02,
    /// General out-of-memory condition.
    OutOfMemory = 0x03,
    /// Activation of the new image failed.
    ActivateFailed = 0x04,
    /// The acceptance commit of the new image failed.
    CommitFailed = 0x05,
    /// Rejecting the image failed.
    RejectFailed = 0x06,
    /// Aborting the update failed.
    AbortFailed = 0x07,
    /// A control-channel publish failed.
    PublishFailed = 0x08,
    /// The requested image state was out of range.
    BadImageState = 0x09,
    /// A final image state was requested without an active job.
    NoActiveJob = 0x0a,
    /// No free file transfer context was available.
    NoFreeContext = 0x0b,
    /// Initializing the data transfer session failed.
    SessionInitFailed = 0x0c,
    /// Sending the data request failed.
    RequestFailed = 0x0d,
    /// Low-level file abort failed.
    FileAbort = 0x10,
    /// Low-level file close failed.
    FileClose = 0x11,
    /// The platform could not create the receive file.
    FileCreateFailed = 0x12,
    /// The receive file is too big for the configured block capacity.
    FileTooLarge = 0x14,
    /// Too many requests were sent without any response.
    MomentumAbort = 0x21,
    /// The offered firmware is older than the running version.
    DowngradeNotAllowed = 0x22,
    /// The offered firmware version matches the running version.
    SameFirmwareVersion = 0x23,
    /// Job document parsing failed; the reason is in the sub-code.
    JobParserError = 0x24,
    /// The job was in self test but the platform image state disagreed.
    ImageStateMismatch = 0x26,
    /// A failure in block ingestion not caused by the platform.
    IngestError = 0x27,
    /// The user aborted the active update.
    UserAbort = 0x28,
    /// Resetting the device failed or is unsupported.
    ResetFailed = 0x29,
    /// A topic string was larger than its buffer.
    TopicTooLarge = 0x2a,
    /// The self-test timer could not be started.
    SelfTestTimerFailed = 0x2b,
    /// Posting to the event queue failed.
    EventEnqueueFailed = 0x2c,
    /// The job names no data protocol the agent can use.
    InvalidDataProtocol = 0x2d,
    /// The operation needs a running agent and the agent is stopped.
    AgentStopped = 0x2e,
    /// Subscribing to a topic failed.
    SubscribeFailed = 0x40,
    /// Unsubscribing from a topic failed.
    UnsubscribeFailed = 0x41,
    /// Invalid buffer sizes or limits supplied at initialization.
    InvalidConfiguration = 0x50,
    /// Unrecoverable error; log and reboot is the only recommended recovery.
    Panic = 0xfe,
    /// Catch-all for wire words whose kind byte is unknown.
    Uninitialized = 0xff,
}

impl ErrorKind {
    /// Failure class this kind belongs to.
    #[must_use]
    pub fn category(self) -> ErrorCategory {
        use ErrorKind::*;
        match self {
            OutOfMemory | NoFreeContext | FileCreateFailed | FileTooLarge
            | EventEnqueueFailed | InvalidConfiguration => ErrorCategory::ResourceExhaustion,
            PublishFailed | SessionInitFailed | RequestFailed | TopicTooLarge
            | SubscribeFailed | UnsubscribeFailed => ErrorCategory::Transport,
            JobParserError | InvalidDataProtocol => ErrorCategory::Parsing,
            SignatureCheckFailed | BadSignerCert | ImageStateMismatch | FileClose
            | IngestError => ErrorCategory::Integrity,
            MomentumAbort | DowngradeNotAllowed | SameFirmwareVersion | NoActiveJob
            | BadImageState | UserAbort | AgentStopped => ErrorCategory::Policy,
            ActivateFailed | CommitFailed | RejectFailed | AbortFailed | FileAbort
            | ResetFailed | SelfTestTimerFailed | Panic | Uninitialized => ErrorCategory::Fatal,
        }
    }

    fn from_byte(byte: u8) -> Self {
        use ErrorKind::*;
        match byte {
            0x01 => SignatureCheckFailed,
            0x02 => BadSignerCert,
            0x03 => OutOfMemory,
            0x04 => ActivateFailed,
            0x05 => CommitFailed,
            0x06 => RejectFailed,
            0x07 => AbortFailed,
            0x08 => PublishFailed,
            0x09 => BadImageState,
            0x0a => NoActiveJob,
            0x0b => NoFreeContext,
            0x0c => SessionInitFailed,
            0x0d => RequestFailed,
            0x10 => FileAbort,
            0x11 => FileClose,
            0x12 => FileCreateFailed,
            0x14 => FileTooLarge,
            0x21 => MomentumAbort,
            0x22 => DowngradeNotAllowed,
            0x23 => SameFirmwareVersion,
            0x24 => JobParserError,
            0x26 => ImageStateMismatch,
            0x27 => IngestError,
            0x28 => UserAbort,
            0x29 => ResetFailed,
            0x2a => TopicTooLarge,
            0x2b => SelfTestTimerFailed,
            0x2c => EventEnqueueFailed,
            0x2d => InvalidDataProtocol,
            0x2e => AgentStopped,
            0x40 => SubscribeFailed,
            0x41 => UnsubscribeFailed,
            0x50 => InvalidConfiguration,
            0xfe => Panic,
            _ => Uninitialized,
        }
    }
}

/// Failure classes used for logging and recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// No free transfer context, out of memory, bad buffer sizing.
    ResourceExhaustion,
    /// Publish/subscribe/request failures, session-init failure.
    Transport,
    /// Job document parsing failures.
    Parsing,
    /// Signature, certificate, or image-state integrity failures.
    Integrity,
    /// Momentum exceeded, version policy, caller misuse.
    Policy,
    /// Panic-class failures; log and reboot is the recommended recovery.
    Fatal,
}

/// Composite error code in its unpacked form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode {
    /// Agent-level error kind.
    pub kind: ErrorKind,
    /// Platform-specific sub-code, when one was reported.
    pub sub_code: Option<u32>,
}

impl ErrorCode {
    /// Code with no platform sub-code.
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            sub_code: None,
        }
    }

    /// Code carrying a platform sub-code (masked to 24 bits).
    #[must_use]
    pub fn with_sub_code(kind: ErrorKind, sub_code: u32) -> Self {
        Self {
            kind,
            sub_code: Some(sub_code & SUB_CODE_MASK),
        }
    }

    /// Packed wire form: kind in the upper 8 bits, sub-code in the lower 24.
    #[must_use]
    pub fn as_wire(self) -> u32 {
        (u32::from(self.kind as u8) << 24) | (self.sub_code.unwrap_or(0) & SUB_CODE_MASK)
    }

    /// Unpack a wire word. `None` is the success word (zero).
    #[must_use]
    pub fn from_wire(word: u32) -> Option<Self> {
        if word == 0 {
            return None;
        }
        let kind = ErrorKind::from_byte((word >> 24) as u8);
        let sub = word & SUB_CODE_MASK;
        Some(Self {
            kind,
            sub_code: (sub != 0).then_some(sub),
        })
    }
}

/// Error reported by the platform collaborator.
///
/// The sub-code occupies the low 24 bits of the packed wire form; its meaning
/// is defined by the platform implementation in use.
#[derive(Debug, Clone, Error)]
#[error("platform error {sub_code:#08x}: {message}")]
pub struct PalError {
    /// Platform-defined sub-code, masked to 24 bits.
    pub sub_code: u32,
    /// Human-readable description from the platform layer.
    pub message: String,
}

impl PalError {
    /// Create a platform error; the sub-code is masked to 24 bits.
    pub fn new(sub_code: u32, message: impl Into<String>) -> Self {
        Self {
            sub_code: sub_code & SUB_CODE_MASK,
            message: message.into(),
        }
    }
}

/// Job document parser error codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobParseError {
    /// A new job arrived while an unfinished job is still active.
    #[error("busy with an existing job")]
    BusyWithExistingJob,
    /// The document carries no job identifier.
    #[error("job document carries no job id")]
    NullJob,
    /// The document names the job that is already active; treated as a
    /// resume by the controller, not as a failure.
    #[error("document updates the currently active job")]
    UpdateCurrentJob,
    /// The document declares a zero-sized file.
    #[error("job document declares a zero-sized file")]
    ZeroFileSize,
    /// A required field is missing, malformed, or larger than its buffer.
    #[error("non-conforming job document: {0}")]
    NonConformingJobDoc(String),
    /// The parser itself was misconfigured.
    #[error("job parser misconfigured: {0}")]
    BadModelInitParams(String),
    /// No free file transfer context.
    #[error("no free file transfer context")]
    NoContextAvailable,
    /// The service reports nothing pending.
    #[error("service reports no active jobs")]
    NoActiveJobs,
}

impl JobParseError {
    /// Parser reason embedded in the composite code's sub-code bits.
    #[must_use]
    pub fn sub_code(&self) -> u32 {
        match self {
            JobParseError::BusyWithExistingJob => 1,
            JobParseError::NullJob => 2,
            JobParseError::UpdateCurrentJob => 3,
            JobParseError::ZeroFileSize => 4,
            JobParseError::NonConformingJobDoc(_) => 5,
            JobParseError::BadModelInitParams(_) => 6,
            JobParseError::NoContextAvailable => 7,
            JobParseError::NoActiveJobs => 8,
        }
    }
}

/// Errors surfaced by agent operations.
#[derive(Debug, Error)]
pub enum UpdateAgentError {
    /// Invalid buffer sizes or limits supplied at initialization.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A value did not fit the fixed-capacity buffer assigned to it.
    #[error("{field} of {needed} bytes exceeds its buffer capacity of {capacity}")]
    BufferTooSmall {
        /// Name of the destination field.
        field: &'static str,
        /// Bytes the rejected write required.
        needed: usize,
        /// Fixed capacity of the destination buffer.
        capacity: usize,
    },

    /// A topic string did not fit the topic buffer.
    #[error("topic of {needed} bytes exceeds the topic buffer capacity of {capacity}")]
    TopicTooLarge {
        /// Bytes the topic required.
        needed: usize,
        /// Fixed capacity of the topic buffer.
        capacity: usize,
    },

    /// The transfer needs more blocks than the bitmap can track.
    #[error("bitmap capacity exceeded: {requested} blocks, capacity {capacity}")]
    BitmapCapacityExceeded {
        /// Blocks the transfer would need.
        requested: u32,
        /// Fixed bitmap capacity in blocks.
        capacity: u32,
    },

    /// A block index at or past the logical block count.
    #[error("block index {index} out of range for {block_count} blocks")]
    BlockOutOfRange {
        /// Offending index.
        index: u32,
        /// Logical block count of the transfer.
        block_count: u32,
    },

    /// A block payload of unexpected length.
    #[error("block {index} payload of {actual} bytes, expected {expected}")]
    BlockSizeMismatch {
        /// Block index the payload was delivered for.
        index: u32,
        /// Expected payload length.
        expected: u32,
        /// Delivered payload length.
        actual: usize,
    },

    /// The declared file size exceeds what the block capacity can cover.
    #[error("file of {file_size} bytes needs {blocks_needed} blocks, above the {max_blocks} block limit")]
    FileTooLarge {
        /// Declared file size in bytes.
        file_size: u64,
        /// Blocks the file would occupy.
        blocks_needed: u64,
        /// Configured maximum block count.
        max_blocks: u32,
    },

    /// Too many requests were sent without any accepted response.
    #[error("request momentum exhausted after {sent} unanswered requests (max {max})")]
    MomentumAbort {
        /// Unanswered requests at the time of the abort.
        sent: u32,
        /// Configured maximum.
        max: u32,
    },

    /// The job and the agent configuration share no data protocol.
    #[error("no data protocol shared between the job and the agent configuration")]
    InvalidDataProtocol,

    /// The offered firmware is older than the running version.
    #[error("downgrade from {running} to {offered} is not allowed")]
    DowngradeNotAllowed {
        /// Version currently running.
        running: semver::Version,
        /// Version the job offered.
        offered: semver::Version,
    },

    /// The offered firmware version matches the running version.
    #[error("offered firmware version {0} matches the running version")]
    SameFirmwareVersion(semver::Version),

    /// A final image state was requested without a pending job or image.
    #[error("no active job")]
    NoActiveJob,

    /// The requested image state cannot be applied by the application.
    #[error("image state {0} cannot be requested")]
    BadImageState(ImageState),

    /// The platform image state contradicts the job's self-test phase.
    #[error("platform image state {platform} does not match the job self-test phase")]
    ImageStateMismatch {
        /// State the platform reported.
        platform: PalImageState,
    },

    /// Job document parsing failed.
    #[error("job parse failed: {0}")]
    JobParse(#[from] JobParseError),

    /// Control-channel subscribe failed.
    #[error("subscribe failed")]
    Subscribe(#[source] anyhow::Error),

    /// Control-channel unsubscribe failed.
    #[error("unsubscribe failed")]
    Unsubscribe(#[source] anyhow::Error),

    /// Control-channel publish failed.
    #[error("publish failed")]
    Publish(#[source] anyhow::Error),

    /// Data transfer session initialization failed.
    #[error("data session init failed")]
    SessionInit(#[source] anyhow::Error),

    /// Sending a block request failed.
    #[error("block request failed")]
    BlockRequest(#[source] anyhow::Error),

    /// The platform could not create the receive file.
    #[error("failed to create receive file")]
    FileCreate(#[source] PalError),

    /// The platform could not store a block.
    #[error("failed to write block")]
    BlockWrite(#[source] PalError),

    /// The platform could not close or verify the receive file.
    #[error("failed to close receive file")]
    FileClose(#[source] PalError),

    /// The platform could not abort the receive file.
    #[error("failed to abort receive file")]
    FileAbort(#[source] PalError),

    /// The platform could not persist the requested image state.
    #[error("failed to persist image state {state}")]
    ImageStatePersist {
        /// State that was being persisted.
        state: ImageState,
        /// Underlying platform error.
        #[source]
        source: PalError,
    },

    /// The platform could not report its image state.
    #[error("failed to query platform image state")]
    ImageStateQuery(#[source] PalError),

    /// Image activation failed.
    #[error("failed to activate image")]
    Activate(#[source] PalError),

    /// Device reset failed.
    #[error("device reset failed")]
    Reset(#[source] PalError),

    /// The event queue was full or its receiver is gone.
    #[error("event queue full or receiver gone")]
    EventEnqueueFailed,

    /// The operation needs a running agent and the agent is stopped.
    #[error("agent is stopped")]
    AgentStopped,

    /// The user aborted the active update.
    #[error("user aborted the active update")]
    UserAbort,

    /// A payload could not be serialized for publishing.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl UpdateAgentError {
    /// Agent-level kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        use UpdateAgentError::*;
        match self {
            InvalidConfiguration(_) | BufferTooSmall { .. } => ErrorKind::InvalidConfiguration,
            TopicTooLarge { .. } => ErrorKind::TopicTooLarge,
            BitmapCapacityExceeded { .. } | FileTooLarge { .. } => ErrorKind::FileTooLarge,
            BlockOutOfRange { .. } | BlockSizeMismatch { .. } | BlockWrite(_) => {
                ErrorKind::IngestError
            }
            MomentumAbort { .. } => ErrorKind::MomentumAbort,
            InvalidDataProtocol => ErrorKind::InvalidDataProtocol,
            DowngradeNotAllowed { .. } => ErrorKind::DowngradeNotAllowed,
            SameFirmwareVersion(_) => ErrorKind::SameFirmwareVersion,
            NoActiveJob => ErrorKind::NoActiveJob,
            BadImageState(_) | ImageStateQuery(_) => ErrorKind::BadImageState,
            ImageStateMismatch { .. } => ErrorKind::ImageStateMismatch,
            JobParse(_) => ErrorKind::JobParserError,
            Subscribe(_) => ErrorKind::SubscribeFailed,
            Unsubscribe(_) => ErrorKind::UnsubscribeFailed,
            Publish(_) | Serialization(_) => ErrorKind::PublishFailed,
            SessionInit(_) => ErrorKind::SessionInitFailed,
            BlockRequest(_) => ErrorKind::RequestFailed,
            FileCreate(_) => ErrorKind::FileCreateFailed,
            FileClose(_) => ErrorKind::FileClose,
            FileAbort(_) => ErrorKind::FileAbort,
            ImageStatePersist { state, .. } => match state {
                ImageState::Accepted => ErrorKind::CommitFailed,
                ImageState::Rejected => ErrorKind::RejectFailed,
                ImageState::Aborted => ErrorKind::AbortFailed,
                ImageState::Testing | ImageState::Unknown => ErrorKind::BadImageState,
            },
            Activate(_) => ErrorKind::ActivateFailed,
            Reset(_) => ErrorKind::ResetFailed,
            EventEnqueueFailed => ErrorKind::EventEnqueueFailed,
            AgentStopped => ErrorKind::AgentStopped,
            UserAbort => ErrorKind::UserAbort,
        }
    }

    /// Composite code: kind plus the platform or parser sub-code, if any.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        use UpdateAgentError::*;
        let sub = match self {
            JobParse(e) => Some(e.sub_code()),
            FileCreate(e) | BlockWrite(e) | FileClose(e) | FileAbort(e) | ImageStateQuery(e)
            | Activate(e) | Reset(e) => Some(e.sub_code),
            ImageStatePersist { source, .. } => Some(source.sub_code),
            _ => None,
        };
        match sub {
            Some(sub_code) => ErrorCode::with_sub_code(self.kind(), sub_code),
            None => ErrorCode::new(self.kind()),
        }
    }

    /// Failure class of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.kind().category()
    }
}

impl From<serde_json::Error> for UpdateAgentError {
    fn from(e: serde_json::Error) -> Self {
        UpdateAgentError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip_with_sub_code() {
        let code = ErrorCode::with_sub_code(ErrorKind::JobParserError, 5);
        let word = code.as_wire();
        assert_eq!(word, 0x2400_0005);
        assert_eq!(ErrorCode::from_wire(word), Some(code));
    }

    #[test]
    fn test_wire_success_word() {
        assert_eq!(ErrorCode::from_wire(0), None);
        assert_eq!(ErrorCode::new(ErrorKind::MomentumAbort).as_wire(), 0x2100_0000);
    }

    #[test]
    fn test_sub_code_is_masked() {
        let code = ErrorCode::with_sub_code(ErrorKind::FileClose, 0xffff_ffff);
        assert_eq!(code.sub_code, Some(0x00ff_ffff));
        assert_eq!(code.as_wire(), 0x11ff_ffff);
    }

    #[test]
    fn test_unknown_kind_byte_maps_to_uninitialized() {
        let code = ErrorCode::from_wire(0x7b00_0001).expect("non-zero word");
        assert_eq!(code.kind, ErrorKind::Uninitialized);
    }

    #[test]
    fn test_error_kind_and_sub_code_of_parse_failure() {
        let err = UpdateAgentError::from(JobParseError::ZeroFileSize);
        assert_eq!(err.kind(), ErrorKind::JobParserError);
        assert_eq!(err.code().sub_code, Some(4));
        assert_eq!(err.category(), ErrorCategory::Parsing);
    }

    #[test]
    fn test_persist_kind_follows_requested_state() {
        let err = UpdateAgentError::ImageStatePersist {
            state: ImageState::Accepted,
            source: PalError::new(0x42, "flash write failed"),
        };
        assert_eq!(err.kind(), ErrorKind::CommitFailed);
        assert_eq!(err.code().as_wire(), 0x0500_0042);
    }

    #[test]
    fn test_categories_cover_spec_classes() {
        assert_eq!(
            ErrorKind::NoFreeContext.category(),
            ErrorCategory::ResourceExhaustion
        );
        assert_eq!(ErrorKind::PublishFailed.category(), ErrorCategory::Transport);
        assert_eq!(
            ErrorKind::SignatureCheckFailed.category(),
            ErrorCategory::Integrity
        );
        assert_eq!(ErrorKind::MomentumAbort.category(), ErrorCategory::Policy);
        assert_eq!(ErrorKind::Panic.category(), ErrorCategory::Fatal);
    }
}
