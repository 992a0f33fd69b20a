//! Over-the-air firmware update agent for connected devices
//!
//! This crate is the control core of an OTA pipeline: it acquires an
//! update-job descriptor from a remote job service, downloads the firmware
//! image in fixed-size blocks over a pluggable transport, tracks block-level
//! completeness, verifies integrity through the platform layer, and manages a
//! self-test/commit/rollback lifecycle before the new image becomes
//! permanent.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`agent`]: the state-machine controller, processing loop, and handle
//! - [`job`]: job document parsing/validation and the file transfer context
//! - [`bitmap`]: block-reception tracking
//! - [`image`]: image lifecycle management
//! - [`momentum`]: the bounded-retry policy
//! - [`stats`]: packet statistics
//! - [`interfaces`]: collaborator capability traits supplied by the host
//! - [`config`]: validated configuration and buffer limits
//! - [`buffer`]: fixed-capacity owned buffers
//! - [`event`]: the agent event set
//! - [`error`]: error types and the composite wire code
//!
//! # Concurrency model
//!
//! One logical consumer: the processing loop started by
//! [`UpdateAgent::run`] dequeues and fully handles one event at a time, so no
//! agent structure is ever mutated concurrently. Transport callbacks and
//! application calls go through the cloneable [`AgentHandle`], which only
//! enqueues. Buffers are allocated once at initialization with fixed
//! capacities; an oversized write is an error, never a truncation.
//!
//! # Example
//!
//! ```ignore
//! use updraft_agent::prelude::*;
//!
//! # async fn example(interfaces: AgentInterfaces) -> Result<(), UpdateAgentError> {
//! let config = AgentConfig::builder()
//!     .current_version("1.4.2".parse().expect("version"))
//!     .build()?;
//!
//! let callback: JobEventCallback = Box::new(|event| match event {
//!     JobEvent::Activate => println!("image verified, activate and reset"),
//!     JobEvent::StartTest => println!("running under self test"),
//!     JobEvent::Fail => println!("update failed"),
//! });
//!
//! let (agent, handle) = UpdateAgent::init(config, "thing-001", interfaces, callback, None)?;
//! let worker = tokio::spawn(agent.run());
//!
//! handle.check_for_update().await?;
//! # let _ = worker;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod agent;
pub mod bitmap;
pub mod buffer;
pub mod config;
pub mod error;
pub mod event;
pub mod image;
pub mod interfaces;
pub mod job;
pub mod momentum;
pub mod prelude;
pub mod stats;

pub use agent::{AgentHandle, AgentState, UpdateAgent};
pub use bitmap::{BlockBitmap, MarkOutcome};
pub use buffer::{BoundedBytes, BoundedString, CapacityError};
pub use config::{AgentConfig, AgentConfigBuilder, BufferLimits};
pub use error::{
    ErrorCategory, ErrorCode, ErrorKind, JobParseError, PalError, UpdateAgentError,
};
pub use event::{AgentEvent, BlockMessage};
pub use image::{ImageState, ImageStateManager, PalImageState};
pub use interfaces::{
    AgentInterfaces, ControlInterface, CustomJobCallback, CustomJobOutcome, DataInterface,
    JobEvent, JobEventCallback, PalInterface,
};
pub use job::{
    BlockRequest, DataProtocol, FileContext, FileSpec, JobDescriptor, JobStatus, ParseContext,
    parse_job_document,
};
pub use momentum::RequestMomentum;
pub use stats::{AgentStatistics, StatisticsSnapshot};
