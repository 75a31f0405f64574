use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::{CollectionStatus, ContentStatus};

/// How a collection relates to its owning transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionRelationType {
    Input,
    Output,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CollectionType {
    #[default]
    Dataset,
    Container,
    File,
}

/// A named grouping of contents (e.g. a dataset) owned by a transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: u64,
    pub transform_id: u64,
    pub scope: String,
    pub name: String,
    pub coll_type: CollectionType,
    pub relation_type: CollectionRelationType,
    pub status: CollectionStatus,
    pub total_files: u64,
    pub new_files: u64,
    pub processing_files: u64,
    pub processed_files: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub coll_metadata: serde_json::Value,
}

impl Collection {
    pub fn new(
        transform_id: u64,
        scope: impl Into<String>,
        name: impl Into<String>,
        relation_type: CollectionRelationType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            transform_id,
            scope: scope.into(),
            name: name.into(),
            coll_type: CollectionType::Dataset,
            relation_type,
            status: CollectionStatus::New,
            total_files: 0,
            new_files: 0,
            processing_files: 0,
            processed_files: 0,
            created_at: now,
            updated_at: now,
            coll_metadata: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ContentType {
    #[default]
    File,
    Event,
    PseudoContent,
}

/// One item (file or event range) inside a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub id: u64,
    pub coll_id: u64,
    pub scope: String,
    pub name: String,
    pub min_id: Option<u64>,
    pub max_id: Option<u64>,
    pub content_type: ContentType,
    pub status: ContentStatus,
    pub path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub content_metadata: serde_json::Value,
}

impl Content {
    pub fn new(coll_id: u64, scope: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            coll_id,
            scope: scope.into(),
            name: name.into(),
            min_id: None,
            max_id: None,
            content_type: ContentType::File,
            status: ContentStatus::New,
            path: None,
            created_at: now,
            updated_at: now,
            content_metadata: serde_json::Value::Null,
        }
    }

    /// Scope-qualified key matched against backend per-file reports.
    pub fn key(&self) -> String {
        format!("{}:{}", self.scope, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_defaults() {
        let coll = Collection::new(5, "user.test", "ds1", CollectionRelationType::Output);
        assert_eq!(coll.status, CollectionStatus::New);
        assert_eq!(coll.total_files, 0);
        assert_eq!(coll.relation_type, CollectionRelationType::Output);
    }

    #[test]
    fn content_key_matches_file_spec_format() {
        let content = Content::new(1, "user.test", "file1");
        assert_eq!(content.key(), "user.test:file1");
        assert_eq!(content.status, ContentStatus::New);
    }
}
