//! iDDS core: a poll-based orchestration service for data-intensive
//! workflows.
//!
//! A user submits a request carrying a workflow description. The clerk
//! decomposes it into transforms, the transformer materializes collections
//! and contents and starts processings, the carrier drives each processing
//! through an external backend, and the conductor delivers progress
//! messages to the outside. All coordination happens through the catalog:
//! agents claim rows by status with advisory leases, process them, and
//! commit, so any agent can crash and another replica picks up where it
//! left off.

pub mod agents;
pub mod backend;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod entities;
pub mod error;
pub mod eventbus;
pub mod health;
pub mod lease;
pub mod metadata;
pub mod notifier;
pub mod retry;
pub mod scheduler;

pub use config::IddsConfig;
pub use error::{BackendError, Error, Result};
