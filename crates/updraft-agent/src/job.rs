//! Job document parsing, validation, and the file transfer context.
//!
//! A job document is a JSON descriptor of one pending firmware update. The
//! parser turns raw bytes into a validated [`JobDescriptor`] or one of the
//! specific [`JobParseError`] codes; the descriptor's fields are then copied
//! into the preallocated [`FileContext`] with every write bounds-checked.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bitmap::BlockBitmap;
use crate::buffer::{BoundedBytes, BoundedString, CapacityError};
use crate::config::{AgentConfig, BufferLimits};
use crate::error::{JobParseError, UpdateAgentError};

/// Data transfer protocol a job may be served over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataProtocol {
    /// Blocks arrive over the publish/subscribe stream channel.
    Stream,
    /// Blocks are fetched from an addressed resource (presigned URL).
    Resource,
}

impl DataProtocol {
    /// Wire name used inside job documents.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DataProtocol::Stream => "stream",
            DataProtocol::Resource => "resource",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "stream" => Some(DataProtocol::Stream),
            "resource" => Some(DataProtocol::Resource),
            _ => None,
        }
    }
}

/// Job execution status reported back to the job service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// The job was accepted and is being worked.
    InProgress,
    /// The job finished and the image was accepted.
    Succeeded,
    /// The job failed.
    Failed,
    /// The image was rejected after download or self test.
    Rejected,
}

/// Ranged request for missing blocks, ascending indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    /// Served file identifier from the job.
    pub file_id: u32,
    /// Block size of the transfer in bytes.
    pub block_size: u32,
    /// Missing block indices, ascending, at most the configured batch width.
    pub indices: Vec<u32>,
}

/// One file entry of a validated job document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    /// Destination path for the receive file.
    pub path: String,
    /// Declared file size in bytes; never zero.
    pub size: u64,
    /// Served file identifier.
    pub file_id: u32,
    /// Block size for this transfer.
    pub block_size: u32,
    /// Signer certificate path, when named.
    pub cert_file: Option<String>,
    /// Decoded file signature.
    pub signature: Vec<u8>,
    /// Authentication scheme for resource downloads.
    pub auth_scheme: Option<String>,
    /// Presigned download URL for resource downloads.
    pub presigned_url: Option<String>,
    /// Firmware version carried by the file entry.
    pub version: Option<semver::Version>,
}

/// A validated job document.
///
/// Transient: only the fields copied into the [`FileContext`] and the agent
/// context outlive the parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    /// Job identifier.
    pub job_id: String,
    /// Client correlation token, when present.
    pub client_token: Option<String>,
    /// Timestamp from the job service, when present.
    pub timestamp: Option<DateTime<Utc>>,
    /// Whether the service marked this job as being in its self-test phase.
    pub self_test: bool,
    /// Version of the agent that staged the update, when reported.
    pub updated_by: Option<semver::Version>,
    /// Protocols the job may be served over; empty means unrestricted.
    pub protocols: Vec<DataProtocol>,
    /// Stream identifier for stream downloads.
    pub stream_name: Option<String>,
    /// The single file this job transfers.
    pub file: FileSpec,
}

impl JobDescriptor {
    /// Pick the data protocol for this job: the configured primary when the
    /// job permits it, otherwise the first enabled protocol the job names.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateAgentError::InvalidDataProtocol`] when the job and the
    /// configuration share no protocol.
    pub fn select_protocol(&self, config: &AgentConfig) -> Result<DataProtocol, UpdateAgentError> {
        if self.protocols.is_empty() {
            return Ok(config.primary_protocol);
        }
        if self.protocols.contains(&config.primary_protocol) {
            return Ok(config.primary_protocol);
        }
        self.protocols
            .iter()
            .copied()
            .find(|p| config.enabled_protocols.contains(p))
            .ok_or(UpdateAgentError::InvalidDataProtocol)
    }
}

/// Agent-side context the parser needs to judge a document.
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    /// Identifier of the currently active job, if any.
    pub active_job_id: Option<&'a str>,
    /// Whether the single file transfer slot is occupied.
    pub file_slot_in_use: bool,
}

// Raw serde model. Everything is optional; validation decides what is
// required and maps absences to specific parse errors.

#[derive(Debug, Deserialize)]
struct RawJobDocument {
    #[serde(rename = "clientToken")]
    client_token: Option<String>,
    timestamp: Option<i64>,
    execution: Option<RawExecution>,
}

#[derive(Debug, Deserialize)]
struct RawExecution {
    #[serde(rename = "jobId")]
    job_id: Option<String>,
    #[serde(rename = "statusDetails")]
    status_details: Option<RawStatusDetails>,
    #[serde(rename = "jobDocument")]
    job_document: Option<RawJobPayload>,
}

#[derive(Debug, Deserialize)]
struct RawStatusDetails {
    #[serde(rename = "selfTest")]
    self_test: Option<bool>,
    #[serde(rename = "updatedBy")]
    updated_by: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawJobPayload {
    update: Option<RawUpdate>,
}

#[derive(Debug, Deserialize)]
struct RawUpdate {
    protocols: Option<Vec<String>>,
    #[serde(rename = "streamName")]
    stream_name: Option<String>,
    files: Option<Vec<RawFile>>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(rename = "filePath")]
    file_path: Option<String>,
    #[serde(rename = "fileSize")]
    file_size: Option<u64>,
    #[serde(rename = "fileId")]
    file_id: Option<u32>,
    #[serde(rename = "blockSize")]
    block_size: Option<u32>,
    #[serde(rename = "certFile")]
    cert_file: Option<String>,
    signature: Option<String>,
    #[serde(rename = "authScheme")]
    auth_scheme: Option<String>,
    #[serde(rename = "presignedUrl")]
    presigned_url: Option<String>,
    version: Option<String>,
}

fn non_conforming(reason: impl Into<String>) -> JobParseError {
    JobParseError::NonConformingJobDoc(reason.into())
}

fn check_len(
    field: &str,
    value: Option<&str>,
    limit: usize,
) -> Result<(), JobParseError> {
    if let Some(value) = value
        && value.len() > limit
    {
        return Err(non_conforming(format!(
            "{field} of {} bytes exceeds its {limit} byte buffer",
            value.len()
        )));
    }
    Ok(())
}

fn parse_version(field: &str, value: &str) -> Result<semver::Version, JobParseError> {
    value
        .parse()
        .map_err(|_parse_error| non_conforming(format!("{field} is not a valid version: {value}")))
}

/// Parse and validate a raw job document.
///
/// The custom-parse hook, when the application registered one, is offered the
/// bytes before this function runs; see the agent controller.
///
/// # Errors
///
/// One of the [`JobParseError`] codes. `UpdateCurrentJob` and `NoActiveJobs`
/// are flow outcomes rather than failures; the controller treats the former
/// as a resume and the latter as "nothing to do".
pub fn parse_job_document(
    raw: &[u8],
    config: &AgentConfig,
    ctx: ParseContext<'_>,
) -> Result<JobDescriptor, JobParseError> {
    let limits = &config.limits;
    if config.max_job_doc_len == 0 || limits.job_id == 0 || limits.file_path == 0 {
        return Err(JobParseError::BadModelInitParams(
            "document and field limits must be non-zero".to_string(),
        ));
    }
    if raw.len() > config.max_job_doc_len {
        return Err(non_conforming(format!(
            "document of {} bytes exceeds the {} byte limit",
            raw.len(),
            config.max_job_doc_len
        )));
    }

    let doc: RawJobDocument =
        serde_json::from_slice(raw).map_err(|e| non_conforming(e.to_string()))?;

    let Some(execution) = doc.execution else {
        return Err(JobParseError::NoActiveJobs);
    };
    if execution.job_id.is_none() && execution.job_document.is_none() {
        return Err(JobParseError::NoActiveJobs);
    }

    let job_id = match execution.job_id {
        Some(id) if !id.is_empty() => id,
        _ => return Err(JobParseError::NullJob),
    };
    check_len("jobId", Some(&job_id), limits.job_id)?;

    match ctx.active_job_id {
        Some(active) if active == job_id => return Err(JobParseError::UpdateCurrentJob),
        Some(_) => return Err(JobParseError::BusyWithExistingJob),
        None if ctx.file_slot_in_use => return Err(JobParseError::NoContextAvailable),
        None => {}
    }

    let (self_test, updated_by) = match execution.status_details {
        Some(details) => {
            let updated_by = details
                .updated_by
                .map(|v| parse_version("updatedBy", &v))
                .transpose()?;
            (details.self_test.unwrap_or(false), updated_by)
        }
        None => (false, None),
    };

    let update = execution
        .job_document
        .and_then(|payload| payload.update)
        .ok_or_else(|| non_conforming("missing job document"))?;

    let mut files = update.files.unwrap_or_default();
    if files.is_empty() {
        return Err(non_conforming("job document names no files"));
    }
    // Single-file jobs only; multi-file documents are non-conforming.
    if files.len() > 1 {
        return Err(non_conforming("job document names more than one file"));
    }
    let raw_file = files.remove(0);

    let file_path = raw_file
        .file_path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| non_conforming("missing file path"))?;
    check_len("filePath", Some(&file_path), limits.file_path)?;

    let file_size = raw_file
        .file_size
        .ok_or_else(|| non_conforming("missing file size"))?;
    if file_size == 0 {
        return Err(JobParseError::ZeroFileSize);
    }

    let file_id = raw_file
        .file_id
        .ok_or_else(|| non_conforming("missing file id"))?;

    let block_size = match raw_file.block_size {
        Some(0) => return Err(non_conforming("block size must be greater than 0")),
        Some(size) if size > config.max_block_size => {
            return Err(non_conforming(format!(
                "block size {size} exceeds the {} byte maximum",
                config.max_block_size
            )));
        }
        Some(size) => size,
        None => config.default_block_size,
    };

    let signature_b64 = raw_file
        .signature
        .filter(|s| !s.is_empty())
        .ok_or_else(|| non_conforming("missing signature"))?;
    let signature = base64::engine::general_purpose::STANDARD
        .decode(&signature_b64)
        .map_err(|_decode_error| non_conforming("signature is not valid base64"))?;
    if signature.len() > limits.signature {
        return Err(non_conforming(format!(
            "signature of {} bytes exceeds its {} byte buffer",
            signature.len(),
            limits.signature
        )));
    }

    check_len("certFile", raw_file.cert_file.as_deref(), limits.cert_file)?;
    check_len("authScheme", raw_file.auth_scheme.as_deref(), limits.auth_scheme)?;
    check_len("presignedUrl", raw_file.presigned_url.as_deref(), limits.url)?;
    check_len("streamName", update.stream_name.as_deref(), limits.stream_name)?;
    check_len("clientToken", doc.client_token.as_deref(), limits.client_token)?;

    let version = raw_file
        .version
        .map(|v| parse_version("version", &v))
        .transpose()?;

    // Unknown protocol names are skipped; the job service may speak a newer
    // dialect than this agent.
    let protocols = update
        .protocols
        .unwrap_or_default()
        .iter()
        .filter_map(|name| DataProtocol::from_name(name))
        .collect();

    let timestamp = doc
        .timestamp
        .and_then(|seconds| DateTime::<Utc>::from_timestamp(seconds, 0));

    Ok(JobDescriptor {
        job_id,
        client_token: doc.client_token,
        timestamp,
        self_test,
        updated_by,
        protocols,
        stream_name: update.stream_name,
        file: FileSpec {
            path: file_path,
            size: file_size,
            file_id,
            block_size,
            cert_file: raw_file.cert_file,
            signature,
            auth_scheme: raw_file.auth_scheme,
            presigned_url: raw_file.presigned_url,
            version,
        },
    })
}

/// The single active file transfer.
///
/// Buffers and bitmap storage are allocated once, at agent initialization;
/// accepting a job populates them and discarding the transfer clears them.
#[derive(Debug)]
pub struct FileContext {
    file_path: BoundedString,
    cert_file: BoundedString,
    stream_name: BoundedString,
    auth_scheme: BoundedString,
    presigned_url: BoundedString,
    signature: BoundedBytes,
    file_size: u64,
    block_size: u32,
    block_count: u32,
    file_id: u32,
    protocol: DataProtocol,
    version: Option<semver::Version>,
    bitmap: BlockBitmap,
    active: bool,
}

fn field_error(field: &'static str) -> impl FnOnce(CapacityError) -> UpdateAgentError {
    move |e| UpdateAgentError::BufferTooSmall {
        field,
        needed: e.needed,
        capacity: e.capacity,
    }
}

impl FileContext {
    /// Allocate an empty context with the configured capacities.
    #[must_use]
    pub fn new(limits: &BufferLimits, max_block_count: u32) -> Self {
        Self {
            file_path: BoundedString::with_capacity(limits.file_path),
            cert_file: BoundedString::with_capacity(limits.cert_file),
            stream_name: BoundedString::with_capacity(limits.stream_name),
            auth_scheme: BoundedString::with_capacity(limits.auth_scheme),
            presigned_url: BoundedString::with_capacity(limits.url),
            signature: BoundedBytes::with_capacity(limits.signature),
            file_size: 0,
            block_size: 0,
            block_count: 0,
            file_id: 0,
            protocol: DataProtocol::Stream,
            version: None,
            bitmap: BlockBitmap::with_capacity(max_block_count),
            active: false,
        }
    }

    /// Populate the context from a validated job.
    ///
    /// # Errors
    ///
    /// Fails when the file needs more blocks than the bitmap can track or a
    /// field does not fit its buffer; the context stays inactive.
    pub fn load(
        &mut self,
        job: &JobDescriptor,
        protocol: DataProtocol,
        config: &AgentConfig,
    ) -> Result<(), UpdateAgentError> {
        let spec = &job.file;
        let blocks_needed = spec.size.div_ceil(u64::from(spec.block_size));
        let block_count = u32::try_from(blocks_needed)
            .ok()
            .filter(|count| *count <= config.max_block_count)
            .ok_or(UpdateAgentError::FileTooLarge {
                file_size: spec.size,
                blocks_needed,
                max_blocks: config.max_block_count,
            })?;
        self.bitmap.init(block_count)?;

        self.file_path
            .set(&spec.path)
            .map_err(field_error("file_path"))?;
        self.cert_file
            .set(spec.cert_file.as_deref().unwrap_or(""))
            .map_err(field_error("cert_file"))?;
        self.stream_name
            .set(job.stream_name.as_deref().unwrap_or(""))
            .map_err(field_error("stream_name"))?;
        self.auth_scheme
            .set(spec.auth_scheme.as_deref().unwrap_or(""))
            .map_err(field_error("auth_scheme"))?;
        self.presigned_url
            .set(spec.presigned_url.as_deref().unwrap_or(""))
            .map_err(field_error("presigned_url"))?;
        self.signature
            .set(&spec.signature)
            .map_err(field_error("signature"))?;

        self.file_size = spec.size;
        self.block_size = spec.block_size;
        self.block_count = block_count;
        self.file_id = spec.file_id;
        self.protocol = protocol;
        self.version = spec.version.clone();
        self.active = true;
        Ok(())
    }

    /// Discard the transfer, clearing every field and the bitmap.
    pub fn reset(&mut self) {
        self.file_path.clear();
        self.cert_file.clear();
        self.stream_name.clear();
        self.auth_scheme.clear();
        self.presigned_url.clear();
        self.signature.clear();
        self.file_size = 0;
        self.block_size = 0;
        self.block_count = 0;
        self.file_id = 0;
        self.version = None;
        self.bitmap.reset();
        self.active = false;
    }

    /// Whether a transfer is loaded.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Destination path of the receive file.
    #[must_use]
    pub fn file_path(&self) -> &str {
        self.file_path.as_str()
    }

    /// Signer certificate path; empty when the job named none.
    #[must_use]
    pub fn cert_file(&self) -> &str {
        self.cert_file.as_str()
    }

    /// Stream identifier; empty for resource downloads.
    #[must_use]
    pub fn stream_name(&self) -> &str {
        self.stream_name.as_str()
    }

    /// Authentication scheme; empty when the job named none.
    #[must_use]
    pub fn auth_scheme(&self) -> &str {
        self.auth_scheme.as_str()
    }

    /// Presigned download URL; empty for stream downloads.
    #[must_use]
    pub fn presigned_url(&self) -> &str {
        self.presigned_url.as_str()
    }

    /// Decoded file signature.
    #[must_use]
    pub fn signature(&self) -> &[u8] {
        self.signature.as_slice()
    }

    /// Declared file size in bytes.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Block size of the transfer in bytes.
    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Total number of blocks, `ceil(file_size / block_size)`.
    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Served file identifier.
    #[must_use]
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Data protocol selected for this transfer.
    #[must_use]
    pub fn protocol(&self) -> DataProtocol {
        self.protocol
    }

    /// Firmware version the job carried, when any.
    #[must_use]
    pub fn version(&self) -> Option<&semver::Version> {
        self.version.as_ref()
    }

    /// The block-reception bitmap.
    #[must_use]
    pub fn bitmap(&self) -> &BlockBitmap {
        &self.bitmap
    }

    /// Mutable access to the bitmap, for the controller's ingest path.
    pub fn bitmap_mut(&mut self) -> &mut BlockBitmap {
        &mut self.bitmap
    }

    /// Byte offset of a block inside the file.
    #[must_use]
    pub fn block_offset(&self, index: u32) -> u64 {
        u64::from(index) * u64::from(self.block_size)
    }

    /// Expected payload length of a block; the last block may be short.
    #[must_use]
    pub fn expected_block_len(&self, index: u32) -> u32 {
        if self.block_count > 0 && index == self.block_count - 1 {
            let full = u64::from(self.block_size) * u64::from(self.block_count - 1);
            u32::try_from(self.file_size - full).unwrap_or(self.block_size)
        } else {
            self.block_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AgentConfig {
        AgentConfig {
            default_block_size: 256,
            ..AgentConfig::default()
        }
    }

    fn no_job_context() -> ParseContext<'static> {
        ParseContext {
            active_job_id: None,
            file_slot_in_use: false,
        }
    }

    fn signature_b64() -> String {
        base64::engine::general_purpose::STANDARD.encode([0xAB; 48])
    }

    fn valid_doc() -> serde_json::Value {
        serde_json::json!({
            "clientToken": "tok-1",
            "timestamp": 1_700_000_000,
            "execution": {
                "jobId": "job-0042",
                "jobDocument": {
                    "update": {
                        "protocols": ["stream"],
                        "streamName": "updates-stream-7",
                        "files": [{
                            "filePath": "/fw/image.bin",
                            "fileSize": 1000,
                            "fileId": 7,
                            "blockSize": 256,
                            "certFile": "/certs/signer.pem",
                            "signature": signature_b64(),
                            "version": "1.2.0"
                        }]
                    }
                }
            }
        })
    }

    fn parse(doc: &serde_json::Value, ctx: ParseContext<'_>) -> Result<JobDescriptor, JobParseError> {
        let raw = serde_json::to_vec(doc).expect("serialize test doc");
        parse_job_document(&raw, &test_config(), ctx)
    }

    #[test]
    fn test_valid_document() {
        let job = parse(&valid_doc(), no_job_context()).expect("valid doc");
        assert_eq!(job.job_id, "job-0042");
        assert_eq!(job.client_token.as_deref(), Some("tok-1"));
        assert_eq!(job.file.size, 1000);
        assert_eq!(job.file.block_size, 256);
        assert_eq!(job.file.file_id, 7);
        assert_eq!(job.file.version, Some(semver::Version::new(1, 2, 0)));
        assert_eq!(job.protocols, vec![DataProtocol::Stream]);
        assert!(!job.self_test);
        assert!(job.timestamp.is_some());
    }

    #[test]
    fn test_missing_execution_is_no_active_jobs() {
        let doc = serde_json::json!({ "clientToken": "tok-1", "timestamp": 1 });
        assert_eq!(
            parse(&doc, no_job_context()).expect_err("no jobs"),
            JobParseError::NoActiveJobs
        );
    }

    #[test]
    fn test_empty_execution_is_no_active_jobs() {
        let doc = serde_json::json!({ "execution": {} });
        assert_eq!(
            parse(&doc, no_job_context()).expect_err("no jobs"),
            JobParseError::NoActiveJobs
        );
    }

    #[test]
    fn test_missing_job_id_is_null_job() {
        let mut doc = valid_doc();
        doc["execution"]
            .as_object_mut()
            .expect("execution object")
            .remove("jobId");
        assert_eq!(
            parse(&doc, no_job_context()).expect_err("null job"),
            JobParseError::NullJob
        );
    }

    #[test]
    fn test_zero_file_size_is_rejected() {
        let mut doc = valid_doc();
        doc["execution"]["jobDocument"]["update"]["files"][0]["fileSize"] =
            serde_json::json!(0);
        assert_eq!(
            parse(&doc, no_job_context()).expect_err("zero size"),
            JobParseError::ZeroFileSize
        );
    }

    #[test]
    fn test_same_job_is_update_current_job() {
        let ctx = ParseContext {
            active_job_id: Some("job-0042"),
            file_slot_in_use: true,
        };
        assert_eq!(
            parse(&valid_doc(), ctx).expect_err("resume"),
            JobParseError::UpdateCurrentJob
        );
    }

    #[test]
    fn test_different_job_while_active_is_busy() {
        let ctx = ParseContext {
            active_job_id: Some("job-0001"),
            file_slot_in_use: true,
        };
        assert_eq!(
            parse(&valid_doc(), ctx).expect_err("busy"),
            JobParseError::BusyWithExistingJob
        );
    }

    #[test]
    fn test_orphaned_file_slot_is_no_context() {
        let ctx = ParseContext {
            active_job_id: None,
            file_slot_in_use: true,
        };
        assert_eq!(
            parse(&valid_doc(), ctx).expect_err("no context"),
            JobParseError::NoContextAvailable
        );
    }

    #[test]
    fn test_oversized_document_is_non_conforming() {
        let mut config = test_config();
        config.max_job_doc_len = 16;
        let raw = serde_json::to_vec(&valid_doc()).expect("serialize");
        assert!(matches!(
            parse_job_document(&raw, &config, no_job_context()),
            Err(JobParseError::NonConformingJobDoc(_))
        ));
    }

    #[test]
    fn test_oversized_field_is_non_conforming_not_truncated() {
        let mut doc = valid_doc();
        doc["execution"]["jobDocument"]["update"]["files"][0]["filePath"] =
            serde_json::json!("/fw/".to_string() + &"x".repeat(300));
        assert!(matches!(
            parse(&doc, no_job_context()),
            Err(JobParseError::NonConformingJobDoc(_))
        ));
    }

    #[test]
    fn test_missing_signature_is_non_conforming() {
        let mut doc = valid_doc();
        doc["execution"]["jobDocument"]["update"]["files"][0]
            .as_object_mut()
            .expect("file object")
            .remove("signature");
        assert!(matches!(
            parse(&doc, no_job_context()),
            Err(JobParseError::NonConformingJobDoc(_))
        ));
    }

    #[test]
    fn test_bad_signature_encoding_is_non_conforming() {
        let mut doc = valid_doc();
        doc["execution"]["jobDocument"]["update"]["files"][0]["signature"] =
            serde_json::json!("not!!base64##");
        assert!(matches!(
            parse(&doc, no_job_context()),
            Err(JobParseError::NonConformingJobDoc(_))
        ));
    }

    #[test]
    fn test_block_size_above_maximum_is_non_conforming() {
        let mut doc = valid_doc();
        doc["execution"]["jobDocument"]["update"]["files"][0]["blockSize"] =
            serde_json::json!(1 << 20);
        assert!(matches!(
            parse(&doc, no_job_context()),
            Err(JobParseError::NonConformingJobDoc(_))
        ));
    }

    #[test]
    fn test_unknown_protocols_are_skipped() {
        let mut doc = valid_doc();
        doc["execution"]["jobDocument"]["update"]["protocols"] =
            serde_json::json!(["carrier-pigeon", "resource"]);
        let job = parse(&doc, no_job_context()).expect("valid doc");
        assert_eq!(job.protocols, vec![DataProtocol::Resource]);
    }

    #[test]
    fn test_protocol_selection_prefers_primary() {
        let mut job = parse(&valid_doc(), no_job_context()).expect("valid doc");
        job.protocols = vec![DataProtocol::Resource, DataProtocol::Stream];
        let config = test_config();
        assert_eq!(
            job.select_protocol(&config).expect("selectable"),
            DataProtocol::Stream
        );
    }

    #[test]
    fn test_protocol_selection_falls_back_to_enabled() {
        let mut job = parse(&valid_doc(), no_job_context()).expect("valid doc");
        job.protocols = vec![DataProtocol::Resource];
        let config = test_config();
        assert_eq!(
            job.select_protocol(&config).expect("selectable"),
            DataProtocol::Resource
        );
    }

    #[test]
    fn test_protocol_selection_fails_on_disjoint_sets() {
        let mut job = parse(&valid_doc(), no_job_context()).expect("valid doc");
        job.protocols = vec![DataProtocol::Resource];
        let mut config = test_config();
        config.enabled_protocols = vec![DataProtocol::Stream];
        assert!(matches!(
            job.select_protocol(&config),
            Err(UpdateAgentError::InvalidDataProtocol)
        ));
    }

    #[test]
    fn test_file_context_block_math() {
        let config = test_config();
        let job = parse(&valid_doc(), no_job_context()).expect("valid doc");
        let mut file = FileContext::new(&config.limits, config.max_block_count);
        file.load(&job, DataProtocol::Stream, &config).expect("load");

        assert!(file.is_active());
        assert_eq!(file.block_count(), 4);
        assert_eq!(file.expected_block_len(0), 256);
        assert_eq!(file.expected_block_len(2), 256);
        assert_eq!(file.expected_block_len(3), 232);
        assert_eq!(file.block_offset(3), 768);
        assert_eq!(file.file_path(), "/fw/image.bin");
        assert_eq!(file.stream_name(), "updates-stream-7");
        assert_eq!(file.signature().len(), 48);

        file.reset();
        assert!(!file.is_active());
        assert_eq!(file.block_count(), 0);
        assert_eq!(file.file_path(), "");
    }

    #[test]
    fn test_file_context_rejects_oversized_file() {
        let mut config = test_config();
        config.max_block_count = 2;
        let job = parse(&valid_doc(), no_job_context()).expect("valid doc");
        let mut file = FileContext::new(&config.limits, config.max_block_count);
        assert!(matches!(
            file.load(&job, DataProtocol::Stream, &config),
            Err(UpdateAgentError::FileTooLarge {
                file_size: 1000,
                blocks_needed: 4,
                max_blocks: 2
            })
        ));
        assert!(!file.is_active());
    }
}
