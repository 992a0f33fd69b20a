//! Agent configuration.
//!
//! All buffer capacities are decided here, once, before the agent allocates
//! anything. `validate` runs during initialization; a bad configuration keeps
//! the agent from ever reaching the ready state.

use std::time::Duration;

use crate::error::UpdateAgentError;
use crate::job::DataProtocol;

/// Fixed capacities, in bytes, for every bounded buffer the agent owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferLimits {
    /// Device identity string.
    pub device_name: usize,
    /// Job identifier.
    pub job_id: usize,
    /// Client correlation token copied from the job.
    pub client_token: usize,
    /// Receive file path.
    pub file_path: usize,
    /// Signer certificate path.
    pub cert_file: usize,
    /// Data stream identifier.
    pub stream_name: usize,
    /// Authentication scheme for resource downloads.
    pub auth_scheme: usize,
    /// Presigned download URL.
    pub url: usize,
    /// Decoded file signature.
    pub signature: usize,
    /// Topic strings built for the control channel.
    pub topic: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            device_name: 64,
            job_id: 96,
            client_token: 64,
            file_path: 256,
            cert_file: 256,
            stream_name: 128,
            auth_scheme: 64,
            url: 1536,
            signature: 384,
            topic: 256,
        }
    }
}

impl BufferLimits {
    fn validate(&self) -> Result<(), UpdateAgentError> {
        let fields = [
            ("device_name", self.device_name),
            ("job_id", self.job_id),
            ("client_token", self.client_token),
            ("file_path", self.file_path),
            ("cert_file", self.cert_file),
            ("stream_name", self.stream_name),
            ("auth_scheme", self.auth_scheme),
            ("url", self.url),
            ("signature", self.signature),
            ("topic", self.topic),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(UpdateAgentError::InvalidConfiguration(format!(
                    "buffer limit {name} must be greater than 0"
                )));
            }
        }
        Ok(())
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Buffer capacities.
    pub limits: BufferLimits,
    /// Maximum blocks the bitmap can track; bounds the receivable file size.
    pub max_block_count: u32,
    /// Block size used when the job document does not name one.
    pub default_block_size: u32,
    /// Largest block size a job may request.
    pub max_block_size: u32,
    /// Missing blocks requested per request message, ascending from the
    /// lowest missing index.
    pub blocks_per_request: u32,
    /// Unanswered requests tolerated before the transfer is aborted.
    pub max_request_momentum: u32,
    /// How long to wait for a response before re-driving the pending request.
    pub request_timeout: Duration,
    /// How long the application may take to accept a new image under self
    /// test before it is rejected.
    pub self_test_timeout: Duration,
    /// Depth of the agent event queue.
    pub event_queue_depth: usize,
    /// Largest job document the parser will look at.
    pub max_job_doc_len: usize,
    /// Data protocols this agent is willing to use.
    pub enabled_protocols: Vec<DataProtocol>,
    /// Protocol preferred when a job permits more than one.
    pub primary_protocol: DataProtocol,
    /// Whether a job may carry a version older than the running one.
    pub allow_downgrade: bool,
    /// Version of the firmware currently running.
    pub current_version: semver::Version,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            limits: BufferLimits::default(),
            max_block_count: 16_384,
            default_block_size: 1024,
            max_block_size: 4096,
            blocks_per_request: 4,
            max_request_momentum: 32,
            request_timeout: Duration::from_secs(10),
            self_test_timeout: Duration::from_secs(16),
            event_queue_depth: 32,
            max_job_doc_len: 4096,
            enabled_protocols: vec![DataProtocol::Stream, DataProtocol::Resource],
            primary_protocol: DataProtocol::Stream,
            allow_downgrade: false,
            current_version: semver::Version::new(0, 0, 0),
        }
    }
}

impl AgentConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateAgentError::InvalidConfiguration`] naming the first
    /// offending value.
    pub fn validate(&self) -> Result<(), UpdateAgentError> {
        self.limits.validate()?;
        if self.max_block_count == 0 {
            return Err(UpdateAgentError::InvalidConfiguration(
                "max_block_count must be greater than 0".to_string(),
            ));
        }
        if self.default_block_size == 0 {
            return Err(UpdateAgentError::InvalidConfiguration(
                "default_block_size must be greater than 0".to_string(),
            ));
        }
        if self.max_block_size < self.default_block_size {
            return Err(UpdateAgentError::InvalidConfiguration(
                "max_block_size must be at least default_block_size".to_string(),
            ));
        }
        if self.blocks_per_request == 0 {
            return Err(UpdateAgentError::InvalidConfiguration(
                "blocks_per_request must be greater than 0".to_string(),
            ));
        }
        if self.max_request_momentum == 0 {
            return Err(UpdateAgentError::InvalidConfiguration(
                "max_request_momentum must be greater than 0".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(UpdateAgentError::InvalidConfiguration(
                "request_timeout must be greater than 0".to_string(),
            ));
        }
        if self.self_test_timeout.is_zero() {
            return Err(UpdateAgentError::InvalidConfiguration(
                "self_test_timeout must be greater than 0".to_string(),
            ));
        }
        if self.event_queue_depth == 0 {
            return Err(UpdateAgentError::InvalidConfiguration(
                "event_queue_depth must be greater than 0".to_string(),
            ));
        }
        if self.max_job_doc_len == 0 {
            return Err(UpdateAgentError::InvalidConfiguration(
                "max_job_doc_len must be greater than 0".to_string(),
            ));
        }
        if self.enabled_protocols.is_empty() {
            return Err(UpdateAgentError::InvalidConfiguration(
                "at least one data protocol must be enabled".to_string(),
            ));
        }
        if !self.enabled_protocols.contains(&self.primary_protocol) {
            return Err(UpdateAgentError::InvalidConfiguration(
                "primary_protocol must be among enabled_protocols".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }
}

/// Builder for [`AgentConfig`].
#[derive(Debug, Default)]
pub struct AgentConfigBuilder {
    config: AgentConfig,
}

impl AgentConfigBuilder {
    /// Set the buffer capacities.
    #[must_use]
    pub fn limits(mut self, limits: BufferLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Set the maximum trackable block count.
    #[must_use]
    pub fn max_block_count(mut self, blocks: u32) -> Self {
        self.config.max_block_count = blocks;
        self
    }

    /// Set the fallback block size.
    #[must_use]
    pub fn default_block_size(mut self, bytes: u32) -> Self {
        self.config.default_block_size = bytes;
        self
    }

    /// Set the largest acceptable block size.
    #[must_use]
    pub fn max_block_size(mut self, bytes: u32) -> Self {
        self.config.max_block_size = bytes;
        self
    }

    /// Set the request batch width.
    #[must_use]
    pub fn blocks_per_request(mut self, blocks: u32) -> Self {
        self.config.blocks_per_request = blocks;
        self
    }

    /// Set the unanswered-request budget.
    #[must_use]
    pub fn max_request_momentum(mut self, requests: u32) -> Self {
        self.config.max_request_momentum = requests;
        self
    }

    /// Set the response timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the self-test acceptance deadline.
    #[must_use]
    pub fn self_test_timeout(mut self, timeout: Duration) -> Self {
        self.config.self_test_timeout = timeout;
        self
    }

    /// Set the event queue depth.
    #[must_use]
    pub fn event_queue_depth(mut self, depth: usize) -> Self {
        self.config.event_queue_depth = depth;
        self
    }

    /// Set the largest acceptable job document length.
    #[must_use]
    pub fn max_job_doc_len(mut self, bytes: usize) -> Self {
        self.config.max_job_doc_len = bytes;
        self
    }

    /// Set the enabled data protocols.
    #[must_use]
    pub fn enabled_protocols(mut self, protocols: Vec<DataProtocol>) -> Self {
        self.config.enabled_protocols = protocols;
        self
    }

    /// Set the preferred data protocol.
    #[must_use]
    pub fn primary_protocol(mut self, protocol: DataProtocol) -> Self {
        self.config.primary_protocol = protocol;
        self
    }

    /// Allow jobs carrying a version older than the running one.
    #[must_use]
    pub fn allow_downgrade(mut self, allow: bool) -> Self {
        self.config.allow_downgrade = allow;
        self
    }

    /// Set the running firmware version used by the version policy.
    #[must_use]
    pub fn current_version(mut self, version: semver::Version) -> Self {
        self.config.current_version = version;
        self
    }

    /// Validate and return the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateAgentError::InvalidConfiguration`] naming the first
    /// offending value.
    pub fn build(self) -> Result<AgentConfig, UpdateAgentError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        AgentConfig::default().validate().expect("default config");
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        let mut config = AgentConfig::default();
        config.limits.stream_name = 0;
        assert!(matches!(
            config.validate(),
            Err(UpdateAgentError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_builder_rejects_zero_batch_width() {
        let result = AgentConfig::builder().blocks_per_request(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_primary_outside_enabled() {
        let result = AgentConfig::builder()
            .enabled_protocols(vec![DataProtocol::Resource])
            .primary_protocol(DataProtocol::Stream)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_applies_settings() {
        let config = AgentConfig::builder()
            .max_request_momentum(3)
            .blocks_per_request(8)
            .request_timeout(Duration::from_millis(250))
            .build()
            .expect("valid config");
        assert_eq!(config.max_request_momentum, 3);
        assert_eq!(config.blocks_per_request, 8);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
    }
}
