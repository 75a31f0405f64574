use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::CommandStatus;

/// Inbound control instruction kinds, written by the REST layer or an
/// external system and consumed by the clerk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    AbortRequest,
    ResumeRequest,
    UpdateProcessing,
}

/// A human-triggered status override, bypassing the bottom-up aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: u64,
    pub cmd_type: CommandKind,
    pub request_id: u64,
    pub processing_id: Option<u64>,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub errors: Option<String>,
    pub payload: serde_json::Value,
}

impl Command {
    pub fn new(cmd_type: CommandKind, request_id: u64, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            cmd_type,
            request_id,
            processing_id: None,
            status: CommandStatus::New,
            created_at: now,
            updated_at: now,
            errors: None,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_command_defaults() {
        let cmd = Command::new(CommandKind::AbortRequest, 9, serde_json::Value::Null);
        assert_eq!(cmd.status, CommandStatus::New);
        assert_eq!(cmd.request_id, 9);
        assert!(cmd.processing_id.is_none());
    }
}
