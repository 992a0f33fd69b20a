//! Convenience re-exports for common agent types

pub use crate::agent::{AgentHandle, AgentState, UpdateAgent};
pub use crate::bitmap::{BlockBitmap, MarkOutcome};
pub use crate::config::{AgentConfig, AgentConfigBuilder, BufferLimits};
pub use crate::error::{
    ErrorCategory, ErrorCode, ErrorKind, JobParseError, PalError, UpdateAgentError,
};
pub use crate::event::{AgentEvent, BlockMessage};
pub use crate::image::{ImageState, ImageStateManager, PalImageState};
pub use crate::interfaces::{
    AgentInterfaces, ControlInterface, CustomJobCallback, CustomJobOutcome, DataInterface,
    JobEvent, JobEventCallback, PalInterface,
};
pub use crate::job::{
    BlockRequest, DataProtocol, FileContext, JobDescriptor, JobStatus, parse_job_document,
};
pub use crate::momentum::RequestMomentum;
pub use crate::stats::{AgentStatistics, StatisticsSnapshot};
