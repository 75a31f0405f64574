//! Opaque entity metadata and the workflow envelope.
//!
//! Metadata travels through the catalog as JSON text. Large blobs are
//! transparently compressed (zlib + base64) above a size threshold and
//! tagged with a sentinel prefix; decoding recognizes the prefix, and
//! encoding an already-compressed blob is a no-op so nothing is ever
//! double-compressed.
//!
//! The user's workflow description is stored as a tagged
//! `{kind, version, payload}` envelope rather than a runtime-class dump,
//! so round-tripping through storage never depends on code loading.

use std::collections::HashMap;
use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sentinel prefix marking a compressed metadata blob.
const ZIP_PREFIX: &str = "idds-zip:";

/// Default compression threshold in bytes.
pub const DEFAULT_ZIP_THRESHOLD: usize = 4096;

/// Serialize a JSON value into its stored text form, compressing it when it
/// exceeds `threshold` bytes.
pub fn encode_blob(value: &serde_json::Value, threshold: usize) -> Result<String> {
    let text = serde_json::to_string(value)?;
    Ok(maybe_compress(&text, threshold))
}

/// Decode stored text back into a JSON value, decompressing if marked.
pub fn decode_blob(text: &str) -> Result<serde_json::Value> {
    let plain = decompress(text)?;
    Ok(serde_json::from_str(&plain)?)
}

/// Prepare a metadata value for storage: below the threshold it is stored
/// as-is, above it the JSON text is compressed and stored as a single
/// sentinel-prefixed string value.
pub fn store_value(value: &serde_json::Value, threshold: usize) -> Result<serde_json::Value> {
    let text = encode_blob(value, threshold)?;
    if text.starts_with(ZIP_PREFIX) {
        Ok(serde_json::Value::String(text))
    } else {
        Ok(value.clone())
    }
}

/// Reverse of [`store_value`]: expand a compressed string value back into
/// the original JSON, passing plain values through untouched.
pub fn load_value(value: &serde_json::Value) -> Result<serde_json::Value> {
    match value.as_str() {
        Some(text) if text.starts_with(ZIP_PREFIX) => decode_blob(text),
        _ => Ok(value.clone()),
    }
}

fn maybe_compress(text: &str, threshold: usize) -> String {
    // Already-compressed input passes through untouched.
    if text.starts_with(ZIP_PREFIX) || text.len() <= threshold {
        return text.to_string();
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    // Writing to a Vec cannot fail.
    let _ = encoder.write_all(text.as_bytes());
    match encoder.finish() {
        Ok(compressed) => format!("{ZIP_PREFIX}{}", BASE64.encode(compressed)),
        Err(_) => text.to_string(),
    }
}

fn decompress(text: &str) -> Result<String> {
    let Some(encoded) = text.strip_prefix(ZIP_PREFIX) else {
        return Ok(text.to_string());
    };
    let compressed = BASE64
        .decode(encoded)
        .map_err(|e| Error::Metadata(format!("invalid base64 in compressed blob: {e}")))?;
    let mut decoder = ZlibDecoder::new(compressed.as_slice());
    let mut plain = String::new();
    decoder
        .read_to_string(&mut plain)
        .map_err(|e| Error::Metadata(format!("invalid zlib stream in compressed blob: {e}")))?;
    Ok(plain)
}

/// The category of work a transform performs, selecting how collections and
/// contents are materialized and how the carrier drives its processings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkKind {
    StageIn,
    ActiveLearning,
    HyperParameterOpt,
    EventStreaming,
    Derivation,
    Generic,
}

impl WorkKind {
    pub fn name(self) -> &'static str {
        match self {
            WorkKind::StageIn => "stagein",
            WorkKind::ActiveLearning => "activelearning",
            WorkKind::HyperParameterOpt => "hyperparameteropt",
            WorkKind::EventStreaming => "eventstreaming",
            WorkKind::Derivation => "derivation",
            WorkKind::Generic => "generic",
        }
    }
}

/// One file (or event range) inside a work's input dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub scope: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_id: Option<u64>,
}

impl FileSpec {
    pub fn key(&self) -> String {
        format!("{}:{}", self.scope, self.name)
    }
}

/// One unit of executable work inside a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkSpec {
    pub name: String,
    pub kind: WorkKind,
    /// Backend plugin name this work is bound to ("condor", "rucio-rule", ...).
    pub backend: String,
    pub scope: String,
    pub input_dataset: String,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    /// Script/command descriptor for job-style backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Stage-in: seconds a replication rule may run before a supplementary
    /// rule is created for the still-missing files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_waiting_time: Option<i64>,
    /// Iterative work: upper bound on chained follow-on processings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chained_processings: Option<u32>,
}

/// The workflow payload: an ordered list of works derived into transforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub works: Vec<WorkSpec>,
}

/// Versioned storage envelope for the workflow description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEnvelope {
    pub kind: String,
    pub version: u32,
    pub payload: WorkflowSpec,
}

pub const WORKFLOW_ENVELOPE_KIND: &str = "workflow";
pub const WORKFLOW_ENVELOPE_VERSION: u32 = 1;

impl WorkflowEnvelope {
    pub fn new(payload: WorkflowSpec) -> Self {
        Self {
            kind: WORKFLOW_ENVELOPE_KIND.to_string(),
            version: WORKFLOW_ENVELOPE_VERSION,
            payload,
        }
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let envelope: WorkflowEnvelope = serde_json::from_value(value.clone())?;
        if envelope.kind != WORKFLOW_ENVELOPE_KIND {
            return Err(Error::Metadata(format!(
                "unexpected envelope kind: {}",
                envelope.kind
            )));
        }
        if envelope.version > WORKFLOW_ENVELOPE_VERSION {
            return Err(Error::Metadata(format!(
                "unsupported envelope version: {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Typed transform metadata: the work description plus the carrier's
/// bookkeeping for rule chaining and follow-on processings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformMeta {
    pub work: WorkSpec,
    /// Replication rule created at submission time (stage-in works).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_rule_id: Option<String>,
    /// Supplementary rules chained when the basic rule overruns its budget.
    #[serde(default)]
    pub new_rule_ids: Vec<String>,
    /// Number of follow-on processings chained so far.
    #[serde(default)]
    pub chained_processings: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_submitted_at: Option<DateTime<Utc>>,
}

impl TransformMeta {
    pub fn new(work: WorkSpec) -> Self {
        Self {
            work,
            basic_rule_id: None,
            new_rule_ids: Vec::new(),
            chained_processings: 0,
            first_submitted_at: None,
        }
    }

    /// All rule ids, basic first, in creation order.
    pub fn all_rule_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        if let Some(basic) = &self.basic_rule_id {
            ids.push(basic.clone());
        }
        ids.extend(self.new_rule_ids.iter().cloned());
        ids
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Descriptor of a backend-declared output artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    /// Path of the JSON output file in the per-processing working directory.
    pub path: String,
}

/// Typed processing metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputDescriptor>,
    /// Operator-visible error text for terminal failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<String>,
    /// Histogram of output-content status names at last poll.
    #[serde(default)]
    pub content_status_statistics: HashMap<String, usize>,
}

impl ProcessingMeta {
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
