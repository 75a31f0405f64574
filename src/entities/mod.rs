//! Persisted entity model: requests, transforms, processings, collections,
//! contents, messages and commands, plus their status enums.

pub mod collection;
pub mod command;
pub mod message;
pub mod processing;
pub mod request;
pub mod status;
pub mod transform;

pub use collection::{Collection, CollectionRelationType, CollectionType, Content, ContentType};
pub use command::{Command, CommandKind};
pub use message::{Message, MessageDestination, MessageLevel, message_type};
pub use processing::{GranularityType, Processing};
pub use request::Request;
pub use status::{
    CollectionStatus, CommandStatus, ContentStatus, Locking, MessageStatus, ProcessingStatus,
    RequestStatus, Rollup, TransformStatus, rollup, rollup_contents, rollup_transforms,
};
pub use transform::Transform;
