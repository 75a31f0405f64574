//! In-memory catalog.
//!
//! A single mutex guards the whole store, which makes every call
//! transactional and every claim atomic: between two concurrent claims of
//! the same row, exactly one sees it idle.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use super::{
    CatalogCounts, ClaimOptions, ContentUpdate, MessageUpdate, ProcessingUpdate, RequestUpdate,
    TransformUpdate,
};
use crate::entities::{
    Collection, CollectionRelationType, CollectionStatus, Command, CommandStatus, Content,
    ContentStatus, Locking, Message, MessageDestination, MessageStatus, Processing,
    ProcessingStatus, Request, RequestStatus, Transform, TransformStatus,
};
use crate::error::{Error, Result};
use crate::health::HealthRecord;
use crate::lease::{Lease, LockOwner};
use crate::metadata;

/// Uniform access to the lease fields shared by every lockable row.
trait Lockable {
    fn row_id(&self) -> u64;
    fn locking(&self) -> Locking;
    fn lease(&self) -> Option<&Lease>;
    fn next_poll_at(&self) -> DateTime<Utc>;
    fn updated_at(&self) -> DateTime<Utc>;
    fn set_lease(&mut self, locking: Locking, lease: Option<Lease>);
    fn touch(&mut self);
}

macro_rules! impl_lockable {
    ($ty:ty) => {
        impl Lockable for $ty {
            fn row_id(&self) -> u64 {
                self.id
            }
            fn locking(&self) -> Locking {
                self.locking
            }
            fn lease(&self) -> Option<&Lease> {
                self.lease.as_ref()
            }
            fn next_poll_at(&self) -> DateTime<Utc> {
                self.next_poll_at
            }
            fn updated_at(&self) -> DateTime<Utc> {
                self.updated_at
            }
            fn set_lease(&mut self, locking: Locking, lease: Option<Lease>) {
                self.locking = locking;
                self.lease = lease;
            }
            fn touch(&mut self) {
                self.updated_at = Utc::now();
            }
        }
    };
}

impl_lockable!(Request);
impl_lockable!(Transform);
impl_lockable!(Processing);

/// Claim matching rows: target status, poll time elapsed, and either idle or
/// holding a stale lease (crash recovery). Oldest-updated first, so starved
/// rows are served before recently-touched ones.
fn claim_rows<T: Lockable + Clone>(
    map: &mut BTreeMap<u64, T>,
    matches: impl Fn(&T) -> bool,
    owner: &LockOwner,
    options: ClaimOptions,
) -> Vec<T> {
    let now = Utc::now();
    let mut candidates: Vec<(DateTime<Utc>, u64)> = map
        .values()
        .filter(|row| {
            matches(row)
                && row.next_poll_at() <= now
                && (row.locking() == Locking::Idle
                    || row
                        .lease()
                        .is_none_or(|l| l.is_stale(options.stale_ttl_secs)))
        })
        .map(|row| (row.updated_at(), row.row_id()))
        .collect();
    candidates.sort();
    candidates.truncate(options.bulk_size);

    let mut claimed = Vec::with_capacity(candidates.len());
    for (_, id) in candidates {
        if let Some(row) = map.get_mut(&id) {
            row.set_lease(Locking::Locking, Some(Lease::acquire(owner.clone())));
            row.touch();
            claimed.push(row.clone());
        }
    }
    claimed
}

fn release<T: Lockable>(row: &mut T) {
    row.set_lease(Locking::Idle, None);
}

/// Metadata blobs cross the storage boundary encoded: large values are kept
/// compressed at rest and expanded again on every read.
fn encode_meta(value: serde_json::Value) -> Result<serde_json::Value> {
    metadata::store_value(&value, metadata::DEFAULT_ZIP_THRESHOLD)
}

fn decoded_request(mut row: Request) -> Result<Request> {
    row.request_metadata = metadata::load_value(&row.request_metadata)?;
    Ok(row)
}

fn decoded_transform(mut row: Transform) -> Result<Transform> {
    row.transform_metadata = metadata::load_value(&row.transform_metadata)?;
    Ok(row)
}

fn decoded_processing(mut row: Processing) -> Result<Processing> {
    row.processing_metadata = metadata::load_value(&row.processing_metadata)?;
    if let Some(output) = &row.output_metadata {
        row.output_metadata = Some(metadata::load_value(output)?);
    }
    Ok(row)
}

#[derive(Default)]
struct Inner {
    requests: BTreeMap<u64, Request>,
    transforms: BTreeMap<u64, Transform>,
    processings: BTreeMap<u64, Processing>,
    collections: BTreeMap<u64, Collection>,
    contents: BTreeMap<u64, Content>,
    messages: BTreeMap<u64, Message>,
    commands: BTreeMap<u64, Command>,
    archived_requests: BTreeMap<u64, Request>,
    heartbeats: HashMap<String, HealthRecord>,
    next_id: u64,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Refresh a collection's counters from its contents; called inside the
    /// same transaction as the content write.
    fn refresh_collection(&mut self, coll_id: u64) {
        let contents: Vec<&Content> = self
            .contents
            .values()
            .filter(|c| c.coll_id == coll_id)
            .collect();
        let total = contents.len() as u64;
        let new = contents
            .iter()
            .filter(|c| c.status == ContentStatus::New)
            .count() as u64;
        let processing = contents
            .iter()
            .filter(|c| c.status == ContentStatus::Processing)
            .count() as u64;
        let processed = contents
            .iter()
            .filter(|c| c.status == ContentStatus::Available)
            .count() as u64;
        let all_terminal = contents.iter().all(|c| c.status.is_terminal());

        if let Some(coll) = self.collections.get_mut(&coll_id) {
            coll.total_files = total;
            coll.new_files = new;
            coll.processing_files = processing;
            coll.processed_files = processed;
            coll.status = if total > 0 && all_terminal {
                CollectionStatus::Closed
            } else if processing > 0 || processed > 0 {
                CollectionStatus::Updated
            } else {
                coll.status
            };
            coll.updated_at = Utc::now();
        }
    }
}

/// Mutex-guarded in-memory implementation of [`super::Catalog`].
#[derive(Default)]
pub struct MemoryCatalog {
    inner: Mutex<Inner>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned mutex means a panic inside a catalog call; the store is
        // plain data, so continuing with it is safe.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl super::Catalog for MemoryCatalog {
    fn add_request(&self, mut request: Request) -> Result<u64> {
        // Encode before the duplicate comparison so both sides are in the
        // stored form.
        request.request_metadata = encode_meta(request.request_metadata)?;
        let mut inner = self.lock();
        if let Some(workload_id) = request.workload_id {
            let existing = inner
                .requests
                .values()
                .chain(inner.archived_requests.values())
                .find(|r| r.workload_id == Some(workload_id));
            if let Some(existing) = existing {
                if existing.scope == request.scope
                    && existing.name == request.name
                    && existing.request_metadata == request.request_metadata
                {
                    // Idempotent resubmission of the identical request.
                    return Ok(existing.id);
                }
                return Err(Error::DuplicateRequest {
                    workload_id,
                    existing_id: existing.id,
                });
            }
        }
        let id = inner.next_id();
        request.id = id;
        inner.requests.insert(id, request);
        Ok(id)
    }

    fn get_request(&self, id: u64) -> Result<Request> {
        let row = self
            .lock()
            .requests
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound { kind: "request", id })?;
        decoded_request(row)
    }

    fn update_request(&self, id: u64, update: RequestUpdate) -> Result<()> {
        let mut inner = self.lock();
        let row = inner
            .requests
            .get_mut(&id)
            .ok_or(Error::NotFound { kind: "request", id })?;
        if let Some(status) = update.status {
            if !row.status.allows(status, update.via_command) {
                return Err(Error::InvalidRequestTransition {
                    from: row.status,
                    to: status,
                });
            }
            row.status = status;
            if status.is_terminal() {
                release(row);
            }
        }
        if let Some(substatus) = update.substatus {
            row.substatus = Some(substatus);
        }
        if let Some(errors) = update.errors {
            row.errors = Some(errors);
        }
        if let Some(next_poll_at) = update.next_poll_at {
            row.next_poll_at = next_poll_at;
        }
        if let Some(expired_at) = update.expired_at {
            row.expired_at = Some(expired_at);
        }
        if let Some(metadata) = update.request_metadata {
            row.request_metadata = encode_meta(metadata)?;
        }
        if update.unlock {
            release(row);
        }
        // An active holder committing progress keeps its lease fresh.
        if let Some(lease) = row.lease.as_mut() {
            lease.renew();
        }
        row.touch();
        Ok(())
    }

    fn claim_requests(
        &self,
        statuses: &[RequestStatus],
        owner: &LockOwner,
        options: ClaimOptions,
    ) -> Result<Vec<Request>> {
        let mut inner = self.lock();
        claim_rows(
            &mut inner.requests,
            |r| statuses.contains(&r.status),
            owner,
            options,
        )
        .into_iter()
        .map(decoded_request)
        .collect()
    }

    fn add_transform(&self, mut transform: Transform) -> Result<u64> {
        transform.transform_metadata = encode_meta(transform.transform_metadata)?;
        let mut inner = self.lock();
        if !inner.requests.contains_key(&transform.request_id) {
            return Err(Error::NotFound {
                kind: "request",
                id: transform.request_id,
            });
        }
        let id = inner.next_id();
        transform.id = id;
        inner.transforms.insert(id, transform);
        Ok(id)
    }

    fn get_transform(&self, id: u64) -> Result<Transform> {
        let row = self
            .lock()
            .transforms
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound {
                kind: "transform",
                id,
            })?;
        decoded_transform(row)
    }

    fn get_transforms_by_request(&self, request_id: u64) -> Result<Vec<Transform>> {
        self.lock()
            .transforms
            .values()
            .filter(|t| t.request_id == request_id)
            .cloned()
            .map(decoded_transform)
            .collect()
    }

    fn update_transform(&self, id: u64, update: TransformUpdate) -> Result<()> {
        let mut inner = self.lock();
        apply_transform_update(&mut inner, id, None, update)
    }

    fn update_transform_guarded(
        &self,
        id: u64,
        expected_version: u64,
        update: TransformUpdate,
    ) -> Result<()> {
        let mut inner = self.lock();
        apply_transform_update(&mut inner, id, Some(expected_version), update)
    }

    fn claim_transforms(
        &self,
        statuses: &[TransformStatus],
        owner: &LockOwner,
        options: ClaimOptions,
    ) -> Result<Vec<Transform>> {
        let mut inner = self.lock();
        claim_rows(
            &mut inner.transforms,
            |t| statuses.contains(&t.status),
            owner,
            options,
        )
        .into_iter()
        .map(decoded_transform)
        .collect()
    }

    fn add_processing(&self, mut processing: Processing) -> Result<u64> {
        processing.processing_metadata = encode_meta(processing.processing_metadata)?;
        let mut inner = self.lock();
        if !inner.transforms.contains_key(&processing.transform_id) {
            return Err(Error::NotFound {
                kind: "transform",
                id: processing.transform_id,
            });
        }
        let active = inner
            .processings
            .values()
            .find(|p| p.transform_id == processing.transform_id && !p.status.is_terminal());
        if let Some(active) = active {
            return Err(Error::Conflict(format!(
                "transform {} already has active processing {}",
                processing.transform_id, active.id
            )));
        }
        let id = inner.next_id();
        processing.id = id;
        inner.processings.insert(id, processing);
        Ok(id)
    }

    fn get_processing(&self, id: u64) -> Result<Processing> {
        let row = self
            .lock()
            .processings
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound {
                kind: "processing",
                id,
            })?;
        decoded_processing(row)
    }

    fn get_processings_by_transform(&self, transform_id: u64) -> Result<Vec<Processing>> {
        self.lock()
            .processings
            .values()
            .filter(|p| p.transform_id == transform_id)
            .cloned()
            .map(decoded_processing)
            .collect()
    }

    fn update_processing(&self, id: u64, update: ProcessingUpdate) -> Result<()> {
        let mut inner = self.lock();
        let row = inner.processings.get_mut(&id).ok_or(Error::NotFound {
            kind: "processing",
            id,
        })?;
        if let Some(submitted_id) = &update.submitted_id {
            match &row.submitted_id {
                Some(existing) if existing != submitted_id => {
                    return Err(Error::Conflict(format!(
                        "processing {id} already submitted as {existing}, refusing to overwrite with {submitted_id}"
                    )));
                }
                Some(_) => {}
                None => {
                    row.submitted_id = Some(submitted_id.clone());
                    row.submitted_at = Some(update.submitted_at.unwrap_or_else(Utc::now));
                }
            }
        }
        if let Some(status) = update.status {
            if !row.status.allows(status, update.via_command) {
                return Err(Error::InvalidProcessingTransition {
                    from: row.status,
                    to: status,
                });
            }
            row.status = status;
            if status.is_terminal() {
                row.finished_at = Some(update.finished_at.unwrap_or_else(Utc::now));
                release(row);
            }
        }
        if let Some(substatus) = update.substatus {
            row.substatus = Some(substatus);
        }
        if let Some(next_poll_at) = update.next_poll_at {
            row.next_poll_at = next_poll_at;
        }
        if let Some(metadata) = update.processing_metadata {
            row.processing_metadata = encode_meta(metadata)?;
        }
        if let Some(output) = update.output_metadata {
            row.output_metadata = Some(encode_meta(output)?);
        }
        if update.unlock {
            release(row);
        }
        if let Some(lease) = row.lease.as_mut() {
            lease.renew();
        }
        row.touch();
        Ok(())
    }

    fn claim_processings(
        &self,
        statuses: &[ProcessingStatus],
        owner: &LockOwner,
        options: ClaimOptions,
    ) -> Result<Vec<Processing>> {
        let mut inner = self.lock();
        claim_rows(
            &mut inner.processings,
            |p| statuses.contains(&p.status),
            owner,
            options,
        )
        .into_iter()
        .map(decoded_processing)
        .collect()
    }

    fn add_collection(&self, mut collection: Collection) -> Result<u64> {
        let mut inner = self.lock();
        let id = inner.next_id();
        collection.id = id;
        inner.collections.insert(id, collection);
        Ok(id)
    }

    fn get_collections_by_transform(
        &self,
        transform_id: u64,
        relation: Option<CollectionRelationType>,
    ) -> Result<Vec<Collection>> {
        Ok(self
            .lock()
            .collections
            .values()
            .filter(|c| {
                c.transform_id == transform_id && relation.is_none_or(|r| c.relation_type == r)
            })
            .cloned()
            .collect())
    }

    fn add_contents(&self, contents: Vec<Content>) -> Result<Vec<u64>> {
        let mut inner = self.lock();
        let mut ids = Vec::with_capacity(contents.len());
        let mut touched = Vec::new();
        for mut content in contents {
            let id = inner.next_id();
            content.id = id;
            touched.push(content.coll_id);
            inner.contents.insert(id, content);
            ids.push(id);
        }
        touched.dedup();
        for coll_id in touched {
            inner.refresh_collection(coll_id);
        }
        Ok(ids)
    }

    fn get_contents_by_collection(&self, coll_id: u64) -> Result<Vec<Content>> {
        Ok(self
            .lock()
            .contents
            .values()
            .filter(|c| c.coll_id == coll_id)
            .cloned()
            .collect())
    }

    fn update_contents(&self, updates: Vec<ContentUpdate>) -> Result<()> {
        let mut inner = self.lock();
        // Validate the whole batch first so the write is all-or-nothing.
        for update in &updates {
            let row = inner.contents.get(&update.id).ok_or(Error::NotFound {
                kind: "content",
                id: update.id,
            })?;
            if let Some(status) = update.status
                && !row.status.allows(status)
            {
                return Err(Error::Conflict(format!(
                    "content {} cannot move {} -> {}",
                    update.id, row.status, status
                )));
            }
        }
        let mut touched = Vec::new();
        for update in updates {
            if let Some(row) = inner.contents.get_mut(&update.id) {
                if let Some(status) = update.status {
                    row.status = status;
                }
                if let Some(path) = update.path {
                    row.path = Some(path);
                }
                row.updated_at = Utc::now();
                touched.push(row.coll_id);
            }
        }
        touched.sort_unstable();
        touched.dedup();
        for coll_id in touched {
            inner.refresh_collection(coll_id);
        }
        Ok(())
    }

    fn add_message(&self, mut message: Message) -> Result<u64> {
        let mut inner = self.lock();
        let id = inner.next_id();
        message.id = id;
        inner.messages.insert(id, message);
        Ok(id)
    }

    fn get_message(&self, id: u64) -> Result<Message> {
        self.lock()
            .messages
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound { kind: "message", id })
    }

    fn fetch_messages(
        &self,
        destinations: &[MessageDestination],
        bulk_size: usize,
        max_replay_times: u32,
    ) -> Result<Vec<Message>> {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut ids: Vec<(DateTime<Utc>, u64)> = inner
            .messages
            .values()
            .filter(|m| {
                destinations.contains(&m.destination)
                    && match m.status {
                        MessageStatus::New => true,
                        // Fetched: a conductor crashed mid-delivery.
                        // Delivered: a replay tier is due.
                        MessageStatus::Fetched | MessageStatus::Delivered => {
                            m.next_retry_at <= now && m.retries < max_replay_times
                        }
                        MessageStatus::ConfirmDelivered => false,
                    }
            })
            .map(|m| (m.updated_at, m.id))
            .collect();
        ids.sort();
        ids.truncate(bulk_size);

        let mut fetched = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            if let Some(m) = inner.messages.get_mut(&id) {
                m.status = MessageStatus::Fetched;
                m.updated_at = now;
                fetched.push(m.clone());
            }
        }
        Ok(fetched)
    }

    fn update_message(&self, id: u64, update: MessageUpdate) -> Result<()> {
        let mut inner = self.lock();
        let row = inner
            .messages
            .get_mut(&id)
            .ok_or(Error::NotFound { kind: "message", id })?;
        if let Some(status) = update.status {
            row.status = status;
        }
        if let Some(retries) = update.retries {
            row.retries = retries;
        }
        if let Some(next_retry_at) = update.next_retry_at {
            row.next_retry_at = next_retry_at;
        }
        row.updated_at = Utc::now();
        Ok(())
    }

    fn add_command(&self, mut command: Command) -> Result<u64> {
        let mut inner = self.lock();
        let id = inner.next_id();
        command.id = id;
        inner.commands.insert(id, command);
        Ok(id)
    }

    fn claim_commands(&self, bulk_size: usize) -> Result<Vec<Command>> {
        let mut inner = self.lock();
        let ids: Vec<u64> = inner
            .commands
            .values()
            .filter(|c| c.status == CommandStatus::New)
            .map(|c| c.id)
            .take(bulk_size)
            .collect();
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(cmd) = inner.commands.get_mut(&id) {
                cmd.status = CommandStatus::Processing;
                cmd.updated_at = Utc::now();
                claimed.push(cmd.clone());
            }
        }
        Ok(claimed)
    }

    fn update_command(&self, id: u64, status: CommandStatus, errors: Option<String>) -> Result<()> {
        let mut inner = self.lock();
        let row = inner
            .commands
            .get_mut(&id)
            .ok_or(Error::NotFound { kind: "command", id })?;
        row.status = status;
        row.errors = errors;
        row.updated_at = Utc::now();
        Ok(())
    }

    fn clean_stale_locks(&self, ttl_secs: i64) -> Result<usize> {
        let mut inner = self.lock();
        let mut recovered = 0;

        fn sweep<T: Lockable>(map: &mut BTreeMap<u64, T>, ttl_secs: i64) -> usize {
            let mut n = 0;
            for row in map.values_mut() {
                if row.locking() == Locking::Locking
                    && row.lease().is_none_or(|l| l.is_stale(ttl_secs))
                {
                    row.set_lease(Locking::Idle, None);
                    n += 1;
                }
            }
            n
        }

        recovered += sweep(&mut inner.requests, ttl_secs);
        recovered += sweep(&mut inner.transforms, ttl_secs);
        recovered += sweep(&mut inner.processings, ttl_secs);
        Ok(recovered)
    }

    fn archive_terminal_requests(&self, retention_secs: i64) -> Result<Vec<u64>> {
        let mut inner = self.lock();
        let cutoff = Utc::now() - Duration::seconds(retention_secs);
        let ids: Vec<u64> = inner
            .requests
            .values()
            .filter(|r| r.status.is_terminal() && r.updated_at < cutoff)
            .map(|r| r.id)
            .collect();

        for id in &ids {
            if let Some(request) = inner.requests.remove(id) {
                inner.archived_requests.insert(*id, request);
            }
            // Cascade: transforms own processings and collections own
            // contents; archive removes the whole subtree.
            let transform_ids: Vec<u64> = inner
                .transforms
                .values()
                .filter(|t| t.request_id == *id)
                .map(|t| t.id)
                .collect();
            for tid in transform_ids {
                inner.transforms.remove(&tid);
                inner.processings.retain(|_, p| p.transform_id != tid);
                let coll_ids: Vec<u64> = inner
                    .collections
                    .values()
                    .filter(|c| c.transform_id == tid)
                    .map(|c| c.id)
                    .collect();
                for cid in coll_ids {
                    inner.collections.remove(&cid);
                    inner.contents.retain(|_, c| c.coll_id != cid);
                }
            }
        }
        Ok(ids)
    }

    fn get_archived_request(&self, id: u64) -> Result<Request> {
        let row = self
            .lock()
            .archived_requests
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound { kind: "request", id })?;
        decoded_request(row)
    }

    fn upsert_heartbeat(&self, record: HealthRecord) -> Result<()> {
        let mut inner = self.lock();
        inner.heartbeats.insert(record.key(), record);
        Ok(())
    }

    fn get_heartbeats(&self) -> Result<Vec<HealthRecord>> {
        Ok(self.lock().heartbeats.values().cloned().collect())
    }

    fn counts(&self) -> Result<CatalogCounts> {
        let inner = self.lock();
        Ok(CatalogCounts {
            requests: inner.requests.len(),
            transforms: inner.transforms.len(),
            processings: inner.processings.len(),
            collections: inner.collections.len(),
            contents: inner.contents.len(),
            messages: inner.messages.len(),
            commands: inner.commands.len(),
            archived_requests: inner.archived_requests.len(),
        })
    }
}

fn apply_transform_update(
    inner: &mut Inner,
    id: u64,
    expected_version: Option<u64>,
    update: TransformUpdate,
) -> Result<()> {
    let row = inner.transforms.get_mut(&id).ok_or(Error::NotFound {
        kind: "transform",
        id,
    })?;
    if let Some(expected) = expected_version
        && row.version != expected
    {
        return Err(Error::StaleVersion {
            transform_id: id,
            expected,
            found: row.version,
        });
    }
    if let Some(status) = update.status {
        if !row.status.allows(status, update.via_command) {
            return Err(Error::InvalidTransformTransition {
                from: row.status,
                to: status,
            });
        }
        row.status = status;
        if status.is_terminal() {
            release(row);
        }
    }
    if let Some(substatus) = update.substatus {
        row.substatus = Some(substatus);
    }
    if let Some(errors) = update.errors {
        row.errors = Some(errors);
    }
    if let Some(retries) = update.retries {
        row.retries = retries;
    }
    if let Some(next_poll_at) = update.next_poll_at {
        row.next_poll_at = next_poll_at;
    }
    if let Some(metadata) = update.transform_metadata {
        row.transform_metadata = encode_meta(metadata)?;
    }
    if update.unlock {
        release(row);
    }
    if let Some(lease) = row.lease.as_mut() {
        lease.renew();
    }
    row.version += 1;
    row.touch();
    Ok(())
}
