//! The agent controller.
//!
//! A single-consumer state machine: every transport delivery, application
//! call, and timer arrives as an [`AgentEvent`] on one FIFO queue, and the
//! processing loop handles exactly one event to completion before taking the
//! next. All context mutation happens on that loop, so none of the agent's
//! structures need locking.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::BoundedString;
use crate::config::AgentConfig;
use crate::error::{JobParseError, UpdateAgentError};
use crate::event::{AgentEvent, BlockMessage};
use crate::image::{ImageState, ImageStateManager};
use crate::interfaces::{
    AgentInterfaces, ControlInterface, CustomJobCallback, CustomJobOutcome, DataInterface,
    JobEvent, JobEventCallback, PalInterface,
};
use crate::job::{
    BlockRequest, FileContext, JobDescriptor, JobStatus, ParseContext, parse_job_document,
};
use crate::momentum::RequestMomentum;
use crate::stats::{AgentStatistics, StatisticsSnapshot};

/// States of the agent controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentState {
    /// Collaborators and buffers are being set up.
    Init,
    /// Idle; ready to check for updates or run a self test.
    Ready,
    /// A job request is being dispatched.
    RequestingJob,
    /// A job request is out; waiting for the service's answer.
    WaitingForJob,
    /// A job was accepted; the receive file is being allocated.
    CreatingFile,
    /// A block request is being dispatched.
    RequestingFileBlock,
    /// A block request is out; waiting for blocks.
    WaitingForFileBlock,
    /// All blocks arrived; the file is being closed and verified.
    ClosingFile,
    /// Processing is paused; context is preserved, events are deferred.
    Suspended,
    /// Shutdown is in progress: unsubscribing and releasing the transfer.
    ShuttingDown,
    /// Terminal state; the processing loop has exited.
    Stopped,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Init => "init",
            AgentState::Ready => "ready",
            AgentState::RequestingJob => "requesting-job",
            AgentState::WaitingForJob => "waiting-for-job",
            AgentState::CreatingFile => "creating-file",
            AgentState::RequestingFileBlock => "requesting-file-block",
            AgentState::WaitingForFileBlock => "waiting-for-file-block",
            AgentState::ClosingFile => "closing-file",
            AgentState::Suspended => "suspended",
            AgentState::ShuttingDown => "shutting-down",
            AgentState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct AgentShared {
    stats: AgentStatistics,
    image: RwLock<ImageState>,
}

#[derive(Serialize)]
struct JobRequestPayload<'a> {
    #[serde(rename = "clientToken")]
    client_token: &'a str,
}

#[derive(Serialize)]
struct StatusPayload<'a> {
    status: JobStatus,
    reason: &'a str,
    #[serde(rename = "receivedBlocks")]
    received_blocks: u32,
    #[serde(rename = "totalBlocks")]
    total_blocks: u32,
    #[serde(rename = "updatedAt")]
    updated_at: DateTime<Utc>,
}

/// The update agent: owner of all workflow context and the processing loop.
///
/// Constructed by [`UpdateAgent::init`] together with the [`AgentHandle`]
/// producers use; consumed by [`UpdateAgent::run`].
pub struct UpdateAgent {
    config: AgentConfig,
    state: AgentState,
    device_name: BoundedString,
    active_job: BoundedString,
    client_token: BoundedString,
    job_timestamp: Option<DateTime<Utc>>,
    topic_buf: BoundedString,
    file: FileContext,
    image_mgr: ImageStateManager,
    momentum: RequestMomentum,
    blocks_in_flight: u32,
    saved_state: Option<AgentState>,
    deferred: VecDeque<AgentEvent>,
    control: Arc<dyn ControlInterface>,
    data: Arc<dyn DataInterface>,
    pal: Arc<dyn PalInterface>,
    app_callback: JobEventCallback,
    custom_job: Option<CustomJobCallback>,
    events: mpsc::Receiver<AgentEvent>,
    tx: mpsc::Sender<AgentEvent>,
    state_tx: watch::Sender<AgentState>,
    shared: Arc<AgentShared>,
    request_timer: Option<JoinHandle<()>>,
    self_test_timer: Option<JoinHandle<()>>,
}

impl UpdateAgent {
    /// Initialize the agent: validate the configuration, allocate every
    /// buffer, and wire up the event queue.
    ///
    /// On success the agent is in [`AgentState::Ready`]. On failure nothing
    /// was started and no background activity exists.
    ///
    /// # Errors
    ///
    /// Configuration problems (including a device identity that does not fit
    /// its configured buffer) are returned synchronously; the agent never
    /// leaves [`AgentState::Init`].
    pub fn init(
        config: AgentConfig,
        device_name: &str,
        interfaces: AgentInterfaces,
        app_callback: JobEventCallback,
        custom_job: Option<CustomJobCallback>,
    ) -> Result<(Self, AgentHandle), UpdateAgentError> {
        config.validate()?;

        let mut device = BoundedString::with_capacity(config.limits.device_name);
        device
            .set(device_name)
            .map_err(|e| UpdateAgentError::BufferTooSmall {
                field: "device_name",
                needed: e.needed,
                capacity: e.capacity,
            })?;

        let file = FileContext::new(&config.limits, config.max_block_count);
        let momentum = RequestMomentum::new(config.max_request_momentum);
        let image_mgr = ImageStateManager::new(Arc::clone(&interfaces.pal));

        let (tx, events) = mpsc::channel(config.event_queue_depth);
        let (state_tx, state_rx) = watch::channel(AgentState::Init);
        let shared = Arc::new(AgentShared {
            stats: AgentStatistics::new(),
            image: RwLock::new(ImageState::Unknown),
        });

        let agent = Self {
            active_job: BoundedString::with_capacity(config.limits.job_id),
            client_token: BoundedString::with_capacity(config.limits.client_token),
            topic_buf: BoundedString::with_capacity(config.limits.topic),
            config,
            state: AgentState::Ready,
            device_name: device,
            job_timestamp: None,
            file,
            image_mgr,
            momentum,
            blocks_in_flight: 0,
            saved_state: None,
            deferred: VecDeque::new(),
            control: Arc::clone(&interfaces.control),
            data: Arc::clone(&interfaces.data),
            pal: Arc::clone(&interfaces.pal),
            app_callback,
            custom_job,
            events,
            tx: tx.clone(),
            state_tx,
            shared: Arc::clone(&shared),
            request_timer: None,
            self_test_timer: None,
        };
        agent.state_tx.send_replace(AgentState::Ready);
        info!(device = device_name, "update agent initialized");

        let handle = AgentHandle {
            tx,
            state_rx,
            shared,
        };
        Ok((agent, handle))
    }

    /// The processing entry point. Consumes the agent, handles events until
    /// shutdown, and returns the final state.
    pub async fn run(mut self) -> AgentState {
        info!(device = self.device_name.as_str(), "agent processing loop started");
        self.enqueue(AgentEvent::Start);

        while self.state != AgentState::Stopped {
            let event = if self.state == AgentState::Suspended {
                match self.events.recv().await {
                    Some(event) => event,
                    None => break,
                }
            } else if let Some(deferred) = self.deferred.pop_front() {
                deferred
            } else {
                match self.events.recv().await {
                    Some(event) => event,
                    None => break,
                }
            };
            self.dispatch(event).await;
        }

        while let Ok(event) = self.events.try_recv() {
            if event.is_packet() {
                self.shared.stats.record_dropped();
            }
        }
        for event in self.deferred.drain(..) {
            if event.is_packet() {
                self.shared.stats.record_dropped();
            }
        }
        info!(state = %self.state, "agent processing loop ended");
        self.state
    }

    async fn dispatch(&mut self, event: AgentEvent) {
        debug!(state = %self.state, event = event.name(), "dispatching event");

        // Suspension control and shutdown bypass the per-state table.
        match event {
            AgentEvent::Shutdown => {
                self.handle_shutdown().await;
                return;
            }
            AgentEvent::Suspend => {
                self.handle_suspend();
                return;
            }
            AgentEvent::Resume => {
                self.handle_resume();
                return;
            }
            _ => {}
        }
        if self.state == AgentState::Suspended {
            debug!(event = event.name(), "deferring event while suspended");
            self.deferred.push_back(event);
            return;
        }

        match (self.state, event) {
            (
                AgentState::Ready | AgentState::RequestingJob | AgentState::WaitingForJob,
                AgentEvent::Start,
            ) => self.handle_start().await,
            (
                AgentState::Ready | AgentState::WaitingForJob | AgentState::RequestingJob,
                AgentEvent::RequestJobDocument,
            )
            | (
                AgentState::RequestingJob | AgentState::WaitingForJob,
                AgentEvent::RequestTimer,
            ) => self.handle_request_job().await,
            (
                AgentState::Ready
                | AgentState::RequestingJob
                | AgentState::WaitingForJob
                | AgentState::WaitingForFileBlock,
                AgentEvent::JobDocumentReceived(raw),
            ) => self.handle_job_document(raw).await,
            (AgentState::CreatingFile, AgentEvent::CreateFile | AgentEvent::RequestTimer) => {
                self.handle_create_file().await;
            }
            (
                AgentState::RequestingFileBlock | AgentState::WaitingForFileBlock,
                AgentEvent::RequestFileBlocks | AgentEvent::RequestTimer,
            ) => self.handle_request_blocks().await,
            (AgentState::WaitingForFileBlock, AgentEvent::FileBlockReceived(msg)) => {
                self.handle_file_block(msg).await;
            }
            (
                AgentState::WaitingForFileBlock
                | AgentState::RequestingFileBlock
                | AgentState::ClosingFile,
                AgentEvent::CloseFile,
            ) => self.handle_close_file().await,
            (_, AgentEvent::SelfTestTimer) => self.handle_self_test_timer().await,
            (_, AgentEvent::SetImageState { state, reply }) => {
                let result = self.handle_set_image_state(state).await;
                if reply.send(result).is_err() {
                    debug!("image state caller went away before the reply");
                }
            }
            (_, AgentEvent::ActivateImage { reply }) => {
                let result = self.handle_activate_image().await;
                if reply.send(result).is_err() {
                    debug!("activate caller went away before the reply");
                }
            }
            (_, AgentEvent::UserAbort) => self.handle_user_abort().await,
            (state, event) => {
                warn!(state = %state, event = event.name(), "unexpected event");
                if event.is_packet() {
                    self.shared.stats.record_dropped();
                }
            }
        }
    }

    async fn handle_start(&mut self) {
        match self.notify_topic() {
            Ok(()) => {
                if let Err(e) = self.control.subscribe(self.topic_buf.as_str()).await {
                    warn!(error = %e, "job notification subscribe failed");
                }
            }
            Err(e) => warn!(error = %e, "cannot build the job notification topic"),
        }

        match self.image_mgr.boot_self_test_pending().await {
            Ok(true) => {
                info!("running a new image under self test");
                self.sync_image_state();
                (self.app_callback)(JobEvent::StartTest);
                self.start_self_test_timer();
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "platform image state query failed at start"),
        }
    }

    async fn handle_request_job(&mut self) {
        self.set_state(AgentState::RequestingJob);
        if let Err(e) = self.momentum.try_acquire() {
            self.abort_active_transfer(&e).await;
            return;
        }
        match self.publish_job_request().await {
            Ok(()) => {
                debug!(momentum = self.momentum.sent(), "job request dispatched");
                self.set_state(AgentState::WaitingForJob);
            }
            Err(e) => warn!(error = %e, "job request publish failed, will retry"),
        }
        self.start_request_timer();
    }

    async fn handle_job_document(&mut self, raw: Vec<u8>) {
        self.stop_request_timer();
        self.momentum.reset();
        self.shared.stats.record_processed();

        if let Some(custom) = &self.custom_job {
            match custom(&raw) {
                CustomJobOutcome::Declined => {}
                CustomJobOutcome::Handled => {
                    info!("job document handled by the custom parser");
                    self.set_state(AgentState::Ready);
                    return;
                }
                CustomJobOutcome::Error(e) => {
                    let err = UpdateAgentError::from(e);
                    error!(error = %err, code = err.code().as_wire(), "custom parser rejected the job document");
                    (self.app_callback)(JobEvent::Fail);
                    self.set_state(AgentState::WaitingForJob);
                    return;
                }
            }
        }

        let active_job = if self.active_job.is_empty() {
            None
        } else {
            Some(self.active_job.as_str())
        };
        let parse_result = parse_job_document(
            &raw,
            &self.config,
            ParseContext {
                active_job_id: active_job,
                file_slot_in_use: self.file.is_active(),
            },
        );

        match parse_result {
            Ok(job) => self.accept_job(job).await,
            Err(JobParseError::NoActiveJobs) => {
                info!("job service reports nothing pending");
                self.set_state(AgentState::WaitingForJob);
            }
            Err(JobParseError::UpdateCurrentJob) => {
                if self.file.is_active() {
                    info!(
                        job = self.active_job.as_str(),
                        received = self.file.bitmap().received_count(),
                        total = self.file.block_count(),
                        "job document refreshes the active job, resuming transfer"
                    );
                    self.set_state(AgentState::RequestingFileBlock);
                    self.enqueue(AgentEvent::RequestFileBlocks);
                } else {
                    debug!(
                        job = self.active_job.as_str(),
                        "job document repeats the active job with no open transfer"
                    );
                }
            }
            Err(JobParseError::BusyWithExistingJob) => {
                warn!(job = self.active_job.as_str(), "ignoring a new job while busy");
                if self.file.is_active() && self.state == AgentState::WaitingForFileBlock {
                    self.start_request_timer();
                }
            }
            Err(e) => {
                let err = UpdateAgentError::from(e);
                error!(error = %err, code = err.code().as_wire(), "job document rejected");
                (self.app_callback)(JobEvent::Fail);
                self.set_state(AgentState::WaitingForJob);
            }
        }
    }

    async fn accept_job(&mut self, job: JobDescriptor) {
        if let Err(e) = self.adopt_job_identity(&job) {
            error!(error = %e, "job identity does not fit its buffers");
            (self.app_callback)(JobEvent::Fail);
            self.set_state(AgentState::WaitingForJob);
            return;
        }

        match self
            .image_mgr
            .check_self_test_consistency(job.self_test)
            .await
        {
            Ok(()) => {}
            Err(e @ UpdateAgentError::ImageStateMismatch { .. }) => {
                error!(error = %e, code = e.code().as_wire(), "image state mismatch, possible tampering");
                self.reject_self_test_image(&e.to_string()).await;
                return;
            }
            Err(e) => {
                error!(error = %e, "platform image state query failed");
                (self.app_callback)(JobEvent::Fail);
                self.clear_job_identity();
                self.set_state(AgentState::WaitingForJob);
                return;
            }
        }

        if job.self_test {
            if let Err(e) = self.check_self_test_version(&job) {
                error!(error = %e, code = e.code().as_wire(), "version policy rejected the image");
                self.reject_self_test_image(&e.to_string()).await;
                return;
            }
            info!(
                job = self.active_job.as_str(),
                "job is in self test, deferring to application checks"
            );
            (self.app_callback)(JobEvent::StartTest);
            self.start_self_test_timer();
            self.set_state(AgentState::Ready);
            return;
        }

        let protocol = match job.select_protocol(&self.config) {
            Ok(protocol) => protocol,
            Err(e) => {
                error!(error = %e, code = e.code().as_wire(), "job names no usable data protocol");
                self.fail_job(&e).await;
                return;
            }
        };
        if let Err(e) = self.file.load(&job, protocol, &self.config) {
            error!(error = %e, code = e.code().as_wire(), "transfer context rejected the job");
            self.fail_job(&e).await;
            return;
        }

        info!(
            job = self.active_job.as_str(),
            file = self.file.file_path(),
            size = self.file.file_size(),
            blocks = self.file.block_count(),
            protocol = protocol.as_str(),
            "job accepted"
        );
        if let Err(e) = self
            .publish_job_status(JobStatus::InProgress, "job accepted")
            .await
        {
            warn!(error = %e, "status update failed");
        }
        self.set_state(AgentState::CreatingFile);
        self.enqueue(AgentEvent::CreateFile);
    }

    async fn handle_create_file(&mut self) {
        if !self.file.is_active() {
            warn!("create file with no active transfer context");
            return;
        }
        if let Err(source) = self.pal.create_receive_file(&self.file).await {
            let e = UpdateAgentError::FileCreate(source);
            self.abort_active_transfer(&e).await;
            return;
        }
        if let Err(source) = self.data.init_session(&self.file).await {
            let e = UpdateAgentError::SessionInit(source);
            self.abort_active_transfer(&e).await;
            return;
        }
        debug!(file = self.file.file_path(), "receive file created");
        self.set_state(AgentState::RequestingFileBlock);
        self.enqueue(AgentEvent::RequestFileBlocks);
    }

    async fn handle_request_blocks(&mut self) {
        if !self.file.is_active() {
            warn!("block request with no active transfer context");
            return;
        }
        if self.file.bitmap().is_complete() {
            self.set_state(AgentState::ClosingFile);
            self.enqueue(AgentEvent::CloseFile);
            return;
        }
        self.set_state(AgentState::RequestingFileBlock);
        if let Err(e) = self.momentum.try_acquire() {
            self.abort_active_transfer(&e).await;
            return;
        }

        let indices: Vec<u32> = self
            .file
            .bitmap()
            .next_missing(self.config.blocks_per_request as usize)
            .collect();
        self.blocks_in_flight = indices.len() as u32;
        let request = BlockRequest {
            file_id: self.file.file_id(),
            block_size: self.file.block_size(),
            indices,
        };
        debug!(
            requested = request.indices.len(),
            momentum = self.momentum.sent(),
            "requesting file blocks"
        );
        match self.data.request_blocks(&self.file, &request).await {
            Ok(()) => self.set_state(AgentState::WaitingForFileBlock),
            Err(source) => {
                let e = UpdateAgentError::BlockRequest(source);
                warn!(error = %e, "block request failed, will retry");
            }
        }
        self.start_request_timer();
    }

    async fn handle_file_block(&mut self, msg: BlockMessage) {
        if !self.file.is_active() {
            warn!("file block with no active transfer context");
            self.shared.stats.record_dropped();
            return;
        }
        self.momentum.reset();

        if msg.file_id != self.file.file_id() {
            warn!(
                file_id = msg.file_id,
                expected = self.file.file_id(),
                "block for an unknown file"
            );
            self.shared.stats.record_dropped();
            return;
        }
        if msg.block_index >= self.file.block_count() {
            let e = UpdateAgentError::BlockOutOfRange {
                index: msg.block_index,
                block_count: self.file.block_count(),
            };
            self.abort_active_transfer(&e).await;
            return;
        }
        let expected = self.file.expected_block_len(msg.block_index);
        if msg.payload.len() != expected as usize {
            let e = UpdateAgentError::BlockSizeMismatch {
                index: msg.block_index,
                expected,
                actual: msg.payload.len(),
            };
            self.abort_active_transfer(&e).await;
            return;
        }

        match self.file.bitmap_mut().mark_received(msg.block_index) {
            Ok(crate::bitmap::MarkOutcome::Duplicate) => {
                debug!(block = msg.block_index, "duplicate block");
                self.shared.stats.record_dropped();
            }
            Ok(crate::bitmap::MarkOutcome::First) => {
                let offset = self.file.block_offset(msg.block_index);
                if let Err(source) = self.pal.write_block(&self.file, offset, &msg.payload).await {
                    let e = UpdateAgentError::BlockWrite(source);
                    self.abort_active_transfer(&e).await;
                    return;
                }
                self.shared.stats.record_processed();
                self.blocks_in_flight = self.blocks_in_flight.saturating_sub(1);
                debug!(
                    block = msg.block_index,
                    received = self.file.bitmap().received_count(),
                    total = self.file.block_count(),
                    "block stored"
                );
            }
            Err(e) => {
                self.abort_active_transfer(&e).await;
                return;
            }
        }

        if self.file.bitmap().is_complete() {
            self.stop_request_timer();
            self.set_state(AgentState::ClosingFile);
            self.enqueue(AgentEvent::CloseFile);
        } else if self.blocks_in_flight == 0 {
            self.enqueue(AgentEvent::RequestFileBlocks);
        } else {
            self.start_request_timer();
        }
    }

    async fn handle_close_file(&mut self) {
        self.set_state(AgentState::ClosingFile);
        self.stop_request_timer();

        match self.pal.close_receive_file(&self.file).await {
            Ok(()) => {
                info!(
                    job = self.active_job.as_str(),
                    file = self.file.file_path(),
                    "file received and signature verified"
                );
                if let Err(e) = self.data.cleanup().await {
                    warn!(error = %e, "data session cleanup failed");
                }
                if let Err(e) = self.image_mgr.enter_testing().await {
                    self.abort_active_transfer(&e).await;
                    return;
                }
                self.sync_image_state();
                if let Err(e) = self
                    .publish_job_status(JobStatus::InProgress, "awaiting self test")
                    .await
                {
                    warn!(error = %e, "status update failed");
                }
                // The job stays active until the image is accepted or rejected.
                self.file.reset();
                self.momentum.reset();
                (self.app_callback)(JobEvent::Activate);
                self.set_state(AgentState::Ready);
            }
            Err(source) => {
                let e = UpdateAgentError::FileClose(source);
                error!(error = %e, code = e.code().as_wire(), "file close failed");
                let detail = e.to_string();
                if let Err(publish_err) = self.publish_job_status(JobStatus::Failed, &detail).await
                {
                    warn!(error = %publish_err, "status update failed");
                }
                if let Err(cleanup_err) = self.data.cleanup().await {
                    warn!(error = %cleanup_err, "data session cleanup failed");
                }
                self.file.reset();
                self.clear_job_identity();
                self.momentum.reset();
                (self.app_callback)(JobEvent::Fail);
                // This update is unusable; go straight for a fresh job.
                self.set_state(AgentState::RequestingJob);
                self.enqueue(AgentEvent::RequestJobDocument);
            }
        }
    }

    async fn handle_set_image_state(
        &mut self,
        requested: ImageState,
    ) -> Result<(), UpdateAgentError> {
        match requested {
            ImageState::Accepted => {
                if self.active_job.is_empty() && self.image_mgr.current() != ImageState::Testing {
                    return Err(UpdateAgentError::NoActiveJob);
                }
                self.image_mgr.apply(ImageState::Accepted).await?;
                self.sync_image_state();
                self.stop_self_test_timer();
                if !self.active_job.is_empty() {
                    if let Err(e) = self
                        .publish_job_status(JobStatus::Succeeded, "image accepted")
                        .await
                    {
                        warn!(error = %e, "status update failed");
                    }
                    self.clear_job_identity();
                }
                info!("new image accepted and committed");
                Ok(())
            }
            ImageState::Rejected | ImageState::Aborted => {
                if self.active_job.is_empty() && self.image_mgr.current() != ImageState::Testing {
                    return Err(UpdateAgentError::NoActiveJob);
                }
                let rolling_back = self.image_mgr.current() == ImageState::Testing;
                self.image_mgr.apply(requested).await?;
                self.sync_image_state();
                self.stop_self_test_timer();
                if self.file.is_active() {
                    self.stop_request_timer();
                    if let Err(e) = self.pal.abort_receive_file(&self.file).await {
                        warn!(error = %e, "receive file abort failed");
                    }
                    if let Err(e) = self.data.cleanup().await {
                        warn!(error = %e, "data session cleanup failed");
                    }
                    self.file.reset();
                    self.momentum.reset();
                    self.set_state(AgentState::Ready);
                }
                if !self.active_job.is_empty() {
                    let status = if requested == ImageState::Rejected {
                        JobStatus::Rejected
                    } else {
                        JobStatus::Failed
                    };
                    if let Err(e) = self.publish_job_status(status, "image not accepted").await {
                        warn!(error = %e, "status update failed");
                    }
                    self.clear_job_identity();
                }
                if rolling_back {
                    info!("rolling back to the previous image");
                    self.pal
                        .reset_device()
                        .await
                        .map_err(UpdateAgentError::Reset)?;
                }
                Ok(())
            }
            ImageState::Testing | ImageState::Unknown => {
                Err(UpdateAgentError::BadImageState(requested))
            }
        }
    }

    async fn handle_activate_image(&mut self) -> Result<(), UpdateAgentError> {
        info!("activating the new image");
        self.pal
            .activate_image()
            .await
            .map_err(UpdateAgentError::Activate)?;
        self.pal
            .reset_device()
            .await
            .map_err(UpdateAgentError::Reset)?;
        Ok(())
    }

    async fn handle_user_abort(&mut self) {
        if !self.file.is_active() && self.active_job.is_empty() {
            warn!("user abort with no active update");
            return;
        }
        info!("user abort requested");
        if let Err(e) = self.image_mgr.apply(ImageState::Aborted).await {
            warn!(error = %e, "failed to persist the aborted state");
        }
        self.sync_image_state();
        let reason = UpdateAgentError::UserAbort;
        self.abort_active_transfer(&reason).await;
    }

    async fn handle_self_test_timer(&mut self) {
        self.self_test_timer = None;
        if self.image_mgr.current() != ImageState::Testing {
            return;
        }
        error!("self test acceptance deadline passed");
        self.reject_self_test_image("self test acceptance deadline passed")
            .await;
    }

    fn handle_suspend(&mut self) {
        match self.state {
            AgentState::Suspended => {}
            AgentState::ShuttingDown | AgentState::Stopped => {
                warn!("suspend ignored during shutdown");
            }
            _ => {
                self.stop_request_timer();
                self.saved_state = Some(self.state);
                info!(from = %self.state, "agent suspended");
                self.set_state(AgentState::Suspended);
            }
        }
    }

    fn handle_resume(&mut self) {
        if self.state != AgentState::Suspended {
            warn!(state = %self.state, "resume while not suspended");
            return;
        }
        let restored = self.saved_state.take().unwrap_or(AgentState::Ready);
        self.set_state(restored);
        info!(state = %restored, "agent resumed");
        if matches!(
            restored,
            AgentState::RequestingJob
                | AgentState::WaitingForJob
                | AgentState::CreatingFile
                | AgentState::RequestingFileBlock
                | AgentState::WaitingForFileBlock
        ) {
            // A response may have been missed while suspended; the request
            // timer re-drives the pending request.
            self.start_request_timer();
        }
    }

    async fn handle_shutdown(&mut self) {
        info!("agent shutting down");
        self.set_state(AgentState::ShuttingDown);
        self.stop_request_timer();
        self.stop_self_test_timer();

        if self.file.is_active() {
            if let Err(e) = self.pal.abort_receive_file(&self.file).await {
                warn!(error = %e, "receive file abort failed during shutdown");
            }
            if let Err(e) = self.data.cleanup().await {
                warn!(error = %e, "data session cleanup failed during shutdown");
            }
            self.file.reset();
        }
        if self.notify_topic().is_ok()
            && let Err(e) = self.control.unsubscribe(self.topic_buf.as_str()).await
        {
            warn!(error = %e, "unsubscribe failed during shutdown");
        }
        self.clear_job_identity();
        self.set_state(AgentState::Stopped);
    }

    /// Abort whatever transfer is open, notify the application, and return to
    /// [`AgentState::Ready`]. Transfers are never left half-open.
    async fn abort_active_transfer(&mut self, reason: &UpdateAgentError) {
        error!(error = %reason, code = reason.code().as_wire(), "aborting active transfer");
        self.stop_request_timer();
        if self.file.is_active() {
            if let Err(e) = self.pal.abort_receive_file(&self.file).await {
                warn!(error = %e, "receive file abort failed");
            }
            if let Err(e) = self.data.cleanup().await {
                warn!(error = %e, "data session cleanup failed");
            }
        }
        if !self.active_job.is_empty() {
            let detail = reason.to_string();
            if let Err(e) = self.publish_job_status(JobStatus::Failed, &detail).await {
                warn!(error = %e, "status update failed");
            }
        }
        self.file.reset();
        self.clear_job_identity();
        self.momentum.reset();
        self.blocks_in_flight = 0;
        (self.app_callback)(JobEvent::Fail);
        self.set_state(AgentState::Ready);
    }

    /// Fail a job that never opened a transfer; keep waiting for jobs.
    async fn fail_job(&mut self, reason: &UpdateAgentError) {
        let detail = reason.to_string();
        if let Err(e) = self.publish_job_status(JobStatus::Failed, &detail).await {
            warn!(error = %e, "status update failed");
        }
        self.file.reset();
        self.clear_job_identity();
        (self.app_callback)(JobEvent::Fail);
        self.set_state(AgentState::WaitingForJob);
    }

    /// Reject the image under self test and roll back through a device reset.
    async fn reject_self_test_image(&mut self, detail: &str) {
        self.stop_self_test_timer();
        if let Err(e) = self.image_mgr.apply(ImageState::Rejected).await {
            warn!(error = %e, "failed to persist the rejected state");
        }
        self.sync_image_state();
        if !self.active_job.is_empty() {
            if let Err(e) = self.publish_job_status(JobStatus::Rejected, detail).await {
                warn!(error = %e, "status update failed");
            }
            self.clear_job_identity();
        }
        (self.app_callback)(JobEvent::Fail);
        if let Err(e) = self.pal.reset_device().await {
            warn!(error = %e, "device reset failed");
        }
        self.set_state(AgentState::Ready);
    }

    fn check_self_test_version(&self, job: &JobDescriptor) -> Result<(), UpdateAgentError> {
        let Some(offered) = job.file.version.as_ref() else {
            return Ok(());
        };
        let running = &self.config.current_version;
        if offered == running {
            // The new image reports the old version: the update never took.
            return Err(UpdateAgentError::SameFirmwareVersion(offered.clone()));
        }
        if offered < running && !self.config.allow_downgrade {
            return Err(UpdateAgentError::DowngradeNotAllowed {
                running: running.clone(),
                offered: offered.clone(),
            });
        }
        Ok(())
    }

    fn adopt_job_identity(&mut self, job: &JobDescriptor) -> Result<(), UpdateAgentError> {
        self.active_job
            .set(&job.job_id)
            .map_err(|e| UpdateAgentError::BufferTooSmall {
                field: "job_id",
                needed: e.needed,
                capacity: e.capacity,
            })?;
        match &job.client_token {
            Some(token) => {
                self.client_token
                    .set(token)
                    .map_err(|e| UpdateAgentError::BufferTooSmall {
                        field: "client_token",
                        needed: e.needed,
                        capacity: e.capacity,
                    })?;
            }
            None => self.client_token.clear(),
        }
        self.job_timestamp = job.timestamp;
        Ok(())
    }

    fn clear_job_identity(&mut self) {
        self.active_job.clear();
        self.client_token.clear();
        self.job_timestamp = None;
    }

    async fn publish_job_request(&mut self) -> Result<(), UpdateAgentError> {
        self.topic_buf
            .set_fmt(format_args!(
                "updates/{}/jobs/get",
                self.device_name.as_str()
            ))
            .map_err(|e| UpdateAgentError::TopicTooLarge {
                needed: e.needed,
                capacity: e.capacity,
            })?;
        let payload = serde_json::to_vec(&JobRequestPayload {
            client_token: self.device_name.as_str(),
        })?;
        self.control
            .publish(self.topic_buf.as_str(), &payload)
            .await
            .map_err(UpdateAgentError::Publish)
    }

    async fn publish_job_status(
        &mut self,
        status: JobStatus,
        reason: &str,
    ) -> Result<(), UpdateAgentError> {
        if self.active_job.is_empty() {
            return Ok(());
        }
        self.topic_buf
            .set_fmt(format_args!(
                "updates/{}/jobs/{}/status",
                self.device_name.as_str(),
                self.active_job.as_str()
            ))
            .map_err(|e| UpdateAgentError::TopicTooLarge {
                needed: e.needed,
                capacity: e.capacity,
            })?;
        let payload = serde_json::to_vec(&StatusPayload {
            status,
            reason,
            received_blocks: self.file.bitmap().received_count(),
            total_blocks: self.file.block_count(),
            updated_at: Utc::now(),
        })?;
        self.control
            .publish(self.topic_buf.as_str(), &payload)
            .await
            .map_err(UpdateAgentError::Publish)
    }

    fn notify_topic(&mut self) -> Result<(), UpdateAgentError> {
        self.topic_buf
            .set_fmt(format_args!(
                "updates/{}/jobs/notify",
                self.device_name.as_str()
            ))
            .map_err(|e| UpdateAgentError::TopicTooLarge {
                needed: e.needed,
                capacity: e.capacity,
            })
    }

    fn enqueue(&self, event: AgentEvent) {
        if let Err(err) = self.tx.try_send(event) {
            let event = match err {
                TrySendError::Full(event) | TrySendError::Closed(event) => event,
            };
            error!(event = event.name(), "event queue rejected an internal event");
        }
    }

    fn start_request_timer(&mut self) {
        self.stop_request_timer();
        let tx = self.tx.clone();
        let timeout = self.config.request_timeout;
        self.request_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if tx.send(AgentEvent::RequestTimer).await.is_err() {
                debug!("request timer fired after the agent stopped");
            }
        }));
    }

    fn stop_request_timer(&mut self) {
        if let Some(timer) = self.request_timer.take() {
            timer.abort();
        }
    }

    fn start_self_test_timer(&mut self) {
        self.stop_self_test_timer();
        let tx = self.tx.clone();
        let timeout = self.config.self_test_timeout;
        self.self_test_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if tx.send(AgentEvent::SelfTestTimer).await.is_err() {
                debug!("self test timer fired after the agent stopped");
            }
        }));
    }

    fn stop_self_test_timer(&mut self) {
        if let Some(timer) = self.self_test_timer.take() {
            timer.abort();
        }
    }

    fn sync_image_state(&self) {
        *self.shared.image.write() = self.image_mgr.current();
    }

    fn set_state(&mut self, next: AgentState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "state transition");
            self.state = next;
            self.state_tx.send_replace(next);
        }
    }
}

/// Cloneable producer-side handle to a running agent.
///
/// Transport callbacks and the application use it to enqueue events and read
/// shared state; it never touches agent context directly.
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<AgentEvent>,
    state_rx: watch::Receiver<AgentState>,
    shared: Arc<AgentShared>,
}

impl AgentHandle {
    /// Current state of the agent controller.
    #[must_use]
    pub fn state(&self) -> AgentState {
        *self.state_rx.borrow()
    }

    /// A watch receiver that observes every state transition.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<AgentState> {
        self.state_rx.clone()
    }

    /// State of the running or pending image.
    #[must_use]
    pub fn image_state(&self) -> ImageState {
        *self.shared.image.read()
    }

    /// Snapshot of all four packet counters.
    #[must_use]
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Packets received from transports since initialization.
    #[must_use]
    pub fn packets_received(&self) -> u64 {
        self.shared.stats.received()
    }

    /// Packets queued for processing since initialization.
    #[must_use]
    pub fn packets_queued(&self) -> u64 {
        self.shared.stats.queued()
    }

    /// Packets fully processed since initialization.
    #[must_use]
    pub fn packets_processed(&self) -> u64 {
        self.shared.stats.processed()
    }

    /// Packets dropped since initialization.
    #[must_use]
    pub fn packets_dropped(&self) -> u64 {
        self.shared.stats.dropped()
    }

    /// Ask the job service for the next pending update.
    ///
    /// # Errors
    ///
    /// [`UpdateAgentError::AgentStopped`] when the processing loop is gone.
    pub async fn check_for_update(&self) -> Result<(), UpdateAgentError> {
        self.send(AgentEvent::RequestJobDocument).await
    }

    /// Pause processing; context is preserved and queued events are kept.
    ///
    /// # Errors
    ///
    /// [`UpdateAgentError::AgentStopped`] when the processing loop is gone.
    pub async fn suspend(&self) -> Result<(), UpdateAgentError> {
        self.send(AgentEvent::Suspend).await
    }

    /// Resume processing in the exact pre-suspension state.
    ///
    /// # Errors
    ///
    /// [`UpdateAgentError::AgentStopped`] when the processing loop is gone.
    pub async fn resume(&self) -> Result<(), UpdateAgentError> {
        self.send(AgentEvent::Resume).await
    }

    /// Abort the active update.
    ///
    /// # Errors
    ///
    /// [`UpdateAgentError::AgentStopped`] when the processing loop is gone.
    pub async fn abort_update(&self) -> Result<(), UpdateAgentError> {
        self.send(AgentEvent::UserAbort).await
    }

    /// Set the image state: `Accepted` commits, `Rejected` and `Aborted`
    /// roll back through the platform.
    ///
    /// # Errors
    ///
    /// [`UpdateAgentError::NoActiveJob`] without a pending job or image,
    /// [`UpdateAgentError::BadImageState`] for states the application may not
    /// request, platform errors from persistence, or
    /// [`UpdateAgentError::AgentStopped`] when the loop is gone.
    pub async fn set_image_state(&self, state: ImageState) -> Result<(), UpdateAgentError> {
        let (reply, response) = oneshot::channel();
        self.send(AgentEvent::SetImageState { state, reply }).await?;
        response
            .await
            .map_err(|_recv_error| UpdateAgentError::AgentStopped)?
    }

    /// Activate the newest image: make it the boot target and reset.
    ///
    /// # Errors
    ///
    /// Platform activation or reset errors, or
    /// [`UpdateAgentError::AgentStopped`] when the loop is gone.
    pub async fn activate_new_image(&self) -> Result<(), UpdateAgentError> {
        let (reply, response) = oneshot::channel();
        self.send(AgentEvent::ActivateImage { reply }).await?;
        response
            .await
            .map_err(|_recv_error| UpdateAgentError::AgentStopped)?
    }

    /// Request shutdown and wait up to `max_wait` for the agent to stop.
    /// Returns the state attained by the time the wait ended.
    pub async fn shutdown(&self, max_wait: Duration) -> AgentState {
        if self.tx.send(AgentEvent::Shutdown).await.is_err() {
            return self.state();
        }
        let mut state_rx = self.state_rx.clone();
        match tokio::time::timeout(
            max_wait,
            state_rx.wait_for(|state| *state == AgentState::Stopped),
        )
        .await
        {
            Ok(Ok(_state)) => {}
            Ok(Err(_closed)) => {}
            Err(_elapsed) => warn!("shutdown wait timed out"),
        }
        self.state()
    }

    /// Transport callback: deliver a raw job document.
    ///
    /// Never blocks; a full queue drops the packet.
    ///
    /// # Errors
    ///
    /// [`UpdateAgentError::EventEnqueueFailed`] when the packet was dropped.
    pub fn deliver_job_document(&self, raw: Vec<u8>) -> Result<(), UpdateAgentError> {
        self.shared.stats.record_received();
        match self.tx.try_send(AgentEvent::JobDocumentReceived(raw)) {
            Ok(()) => {
                self.shared.stats.record_queued();
                Ok(())
            }
            Err(_rejected) => {
                self.shared.stats.record_dropped();
                Err(UpdateAgentError::EventEnqueueFailed)
            }
        }
    }

    /// Transport callback: deliver one file block.
    ///
    /// Never blocks; a full queue drops the packet.
    ///
    /// # Errors
    ///
    /// [`UpdateAgentError::EventEnqueueFailed`] when the packet was dropped.
    pub fn deliver_file_block(&self, block: BlockMessage) -> Result<(), UpdateAgentError> {
        self.shared.stats.record_received();
        match self.tx.try_send(AgentEvent::FileBlockReceived(block)) {
            Ok(()) => {
                self.shared.stats.record_queued();
                Ok(())
            }
            Err(_rejected) => {
                self.shared.stats.record_dropped();
                Err(UpdateAgentError::EventEnqueueFailed)
            }
        }
    }

    async fn send(&self, event: AgentEvent) -> Result<(), UpdateAgentError> {
        self.tx
            .send(event)
            .await
            .map_err(|_send_error| UpdateAgentError::AgentStopped)
    }
}
