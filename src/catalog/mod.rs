//! Abstract persistence boundary.
//!
//! Agents never talk to storage directly; they go through the [`Catalog`]
//! trait: per-entity create/read/update plus status-filtered bulk claims
//! with advisory-lease semantics. The in-memory implementation in
//! [`memory`] backs tests and the demo; a SQL-backed implementation would
//! plug in behind the same trait.

pub mod memory;

use chrono::{DateTime, Utc};

use crate::entities::{
    Collection, CollectionRelationType, Command, CommandStatus, Content,
    ContentStatus, Message, MessageDestination, MessageStatus, Processing, ProcessingStatus,
    Request, RequestStatus, Transform, TransformStatus,
};
use crate::error::Result;
use crate::health::HealthRecord;
use crate::lease::LockOwner;

pub use memory::MemoryCatalog;

/// Claim parameters shared by every `claim_*` call.
#[derive(Debug, Clone, Copy)]
pub struct ClaimOptions {
    /// Maximum number of rows returned per claim.
    pub bulk_size: usize,
    /// Leases older than this are treated as abandoned and reclaimable.
    pub stale_ttl_secs: i64,
}

impl Default for ClaimOptions {
    fn default() -> Self {
        Self {
            bulk_size: 10,
            stale_ttl_secs: 3600,
        }
    }
}

/// Partial update for a request row. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct RequestUpdate {
    pub status: Option<RequestStatus>,
    pub substatus: Option<RequestStatus>,
    pub errors: Option<String>,
    pub next_poll_at: Option<DateTime<Utc>>,
    /// New expiry deadline, set by the Extend command.
    pub expired_at: Option<DateTime<Utc>>,
    pub request_metadata: Option<serde_json::Value>,
    /// Explicit operator override path; the only way out of a terminal state.
    pub via_command: bool,
    /// Release the lease on commit.
    pub unlock: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TransformUpdate {
    pub status: Option<TransformStatus>,
    pub substatus: Option<TransformStatus>,
    pub errors: Option<String>,
    pub retries: Option<u32>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub transform_metadata: Option<serde_json::Value>,
    pub via_command: bool,
    pub unlock: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessingUpdate {
    pub status: Option<ProcessingStatus>,
    pub substatus: Option<ProcessingStatus>,
    /// Set-at-most-once; rejected if it would change an existing value.
    pub submitted_id: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub processing_metadata: Option<serde_json::Value>,
    pub output_metadata: Option<serde_json::Value>,
    pub via_command: bool,
    pub unlock: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ContentUpdate {
    pub id: u64,
    pub status: Option<ContentStatus>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageUpdate {
    pub status: Option<MessageStatus>,
    pub retries: Option<u32>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Row counts per entity, for the status surface.
#[derive(Debug, Clone, Default)]
pub struct CatalogCounts {
    pub requests: usize,
    pub transforms: usize,
    pub processings: usize,
    pub collections: usize,
    pub contents: usize,
    pub messages: usize,
    pub commands: usize,
    pub archived_requests: usize,
}

/// The persistence boundary consumed by every agent.
///
/// All writes are transactional per call. Status writes are validated
/// against the monotone transition graph; terminal writes implicitly clear
/// the row lease.
pub trait Catalog: Send + Sync {
    // -- requests -----------------------------------------------------------

    fn add_request(&self, request: Request) -> Result<u64>;
    fn get_request(&self, id: u64) -> Result<Request>;
    fn update_request(&self, id: u64, update: RequestUpdate) -> Result<()>;
    /// Atomically select-and-lease requests in one of `statuses` whose
    /// `next_poll_at` has elapsed, oldest-updated first.
    fn claim_requests(
        &self,
        statuses: &[RequestStatus],
        owner: &LockOwner,
        options: ClaimOptions,
    ) -> Result<Vec<Request>>;

    // -- transforms ---------------------------------------------------------

    fn add_transform(&self, transform: Transform) -> Result<u64>;
    fn get_transform(&self, id: u64) -> Result<Transform>;
    fn get_transforms_by_request(&self, request_id: u64) -> Result<Vec<Transform>>;
    fn update_transform(&self, id: u64, update: TransformUpdate) -> Result<()>;
    /// Compare-and-set update: fails with `StaleVersion` when the row has
    /// been written since `expected_version` was read.
    fn update_transform_guarded(
        &self,
        id: u64,
        expected_version: u64,
        update: TransformUpdate,
    ) -> Result<()>;
    fn claim_transforms(
        &self,
        statuses: &[TransformStatus],
        owner: &LockOwner,
        options: ClaimOptions,
    ) -> Result<Vec<Transform>>;

    // -- processings --------------------------------------------------------

    /// Rejects creation while another non-terminal processing exists for the
    /// same transform (one active execution attempt at a time).
    fn add_processing(&self, processing: Processing) -> Result<u64>;
    fn get_processing(&self, id: u64) -> Result<Processing>;
    fn get_processings_by_transform(&self, transform_id: u64) -> Result<Vec<Processing>>;
    fn update_processing(&self, id: u64, update: ProcessingUpdate) -> Result<()>;
    fn claim_processings(
        &self,
        statuses: &[ProcessingStatus],
        owner: &LockOwner,
        options: ClaimOptions,
    ) -> Result<Vec<Processing>>;

    // -- collections / contents --------------------------------------------

    fn add_collection(&self, collection: Collection) -> Result<u64>;
    fn get_collections_by_transform(
        &self,
        transform_id: u64,
        relation: Option<CollectionRelationType>,
    ) -> Result<Vec<Collection>>;
    fn add_contents(&self, contents: Vec<Content>) -> Result<Vec<u64>>;
    fn get_contents_by_collection(&self, coll_id: u64) -> Result<Vec<Content>>;
    /// Bulk content update; each item's status change must follow the
    /// one-directional content progression. Collection counters are
    /// refreshed as part of the same write.
    fn update_contents(&self, updates: Vec<ContentUpdate>) -> Result<()>;

    // -- messages -----------------------------------------------------------

    fn add_message(&self, message: Message) -> Result<u64>;
    fn get_message(&self, id: u64) -> Result<Message>;
    /// Atomically fetch deliverable messages for `destinations`: New ones,
    /// plus Fetched/Delivered ones whose retry delay has elapsed and whose
    /// replay budget (`max_replay_times`) is not exhausted. Fetched rows are
    /// marked Fetched so concurrent conductors do not double-deliver.
    fn fetch_messages(
        &self,
        destinations: &[MessageDestination],
        bulk_size: usize,
        max_replay_times: u32,
    ) -> Result<Vec<Message>>;
    fn update_message(&self, id: u64, update: MessageUpdate) -> Result<()>;

    // -- commands -----------------------------------------------------------

    fn add_command(&self, command: Command) -> Result<u64>;
    /// Atomically fetch New commands, marking them Processing.
    fn claim_commands(&self, bulk_size: usize) -> Result<Vec<Command>>;
    fn update_command(&self, id: u64, status: CommandStatus, errors: Option<String>) -> Result<()>;

    // -- maintenance --------------------------------------------------------

    /// Reset leases older than `ttl_secs` back to idle. Returns the number
    /// of rows recovered.
    fn clean_stale_locks(&self, ttl_secs: i64) -> Result<usize>;
    /// Move terminal requests older than the retention period (and their
    /// cascade) into the archive store. Returns archived request ids.
    fn archive_terminal_requests(&self, retention_secs: i64) -> Result<Vec<u64>>;
    fn get_archived_request(&self, id: u64) -> Result<Request>;

    // -- health -------------------------------------------------------------

    fn upsert_heartbeat(&self, record: HealthRecord) -> Result<()>;
    fn get_heartbeats(&self) -> Result<Vec<HealthRecord>>;

    fn counts(&self) -> Result<CatalogCounts>;
}
