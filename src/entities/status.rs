//! Status enums for every persisted entity, with their stable integer codes,
//! terminal-state predicates, the monotone transition guard, and the
//! histogram rollup that derives a parent status from its children.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Advisory lock flag carried by every lockable row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Locking {
    #[default]
    Idle,
    Locking,
}

impl Locking {
    pub fn code(self) -> i32 {
        match self {
            Locking::Idle => 0,
            Locking::Locking => 1,
        }
    }
}

/// Request lifecycle states.
///
/// Terminal states only re-open through an explicit command (ReQueue/Extend/
/// Resume); the catalog rejects every other terminal-to-non-terminal write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    New,
    Transforming,
    Finished,
    SubFinished,
    Failed,
    Extend,
    ToCancel,
    Cancelling,
    Cancelled,
    ToSuspend,
    Suspending,
    Suspended,
    ToResume,
    ReQueue,
    Lost,
}

impl RequestStatus {
    pub fn code(self) -> i32 {
        match self {
            RequestStatus::New => 0,
            RequestStatus::Transforming => 2,
            RequestStatus::Finished => 3,
            RequestStatus::SubFinished => 4,
            RequestStatus::Failed => 5,
            RequestStatus::Extend => 6,
            RequestStatus::ToCancel => 7,
            RequestStatus::Cancelling => 8,
            RequestStatus::Cancelled => 9,
            RequestStatus::ToSuspend => 10,
            RequestStatus::Suspending => 11,
            RequestStatus::Suspended => 12,
            RequestStatus::ToResume => 13,
            RequestStatus::ReQueue => 20,
            RequestStatus::Lost => 21,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Finished
                | RequestStatus::SubFinished
                | RequestStatus::Failed
                | RequestStatus::Cancelled
                | RequestStatus::Lost
        )
    }

    /// Whether a status write is allowed by the monotone transition graph.
    ///
    /// `via_command` marks the explicit re-open path (ReQueue/Extend/Resume)
    /// issued by an operator, which is the only way out of a terminal state.
    pub fn allows(self, to: RequestStatus, via_command: bool) -> bool {
        if self == to {
            return true;
        }
        if self.is_terminal() {
            return via_command
                && matches!(
                    to,
                    RequestStatus::ReQueue | RequestStatus::Extend | RequestStatus::Transforming
                );
        }
        true
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Transform lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformStatus {
    New,
    Transforming,
    Finished,
    SubFinished,
    Failed,
    ToCancel,
    Cancelling,
    Cancelled,
    Suspended,
}

impl TransformStatus {
    pub fn code(self) -> i32 {
        match self {
            TransformStatus::New => 0,
            TransformStatus::Transforming => 2,
            TransformStatus::Finished => 3,
            TransformStatus::SubFinished => 4,
            TransformStatus::Failed => 5,
            TransformStatus::ToCancel => 7,
            TransformStatus::Cancelling => 8,
            TransformStatus::Cancelled => 9,
            TransformStatus::Suspended => 12,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransformStatus::Finished
                | TransformStatus::SubFinished
                | TransformStatus::Failed
                | TransformStatus::Cancelled
        )
    }

    pub fn allows(self, to: TransformStatus, via_command: bool) -> bool {
        if self == to {
            return true;
        }
        if self.is_terminal() {
            return via_command && matches!(to, TransformStatus::New | TransformStatus::Transforming);
        }
        true
    }
}

impl fmt::Display for TransformStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Processing lifecycle states.
///
/// `FinishedOnExec` is terminal for the processing itself but signals the
/// carrier that the logical unit of work may chain a follow-on processing
/// before its transform is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingStatus {
    New,
    Submitting,
    Submitted,
    Running,
    Finished,
    Failed,
    Lost,
    Cancel,
    FinishedOnExec,
    SubFinished,
    Cancelled,
}

impl ProcessingStatus {
    pub fn code(self) -> i32 {
        match self {
            ProcessingStatus::New => 0,
            ProcessingStatus::Submitting => 1,
            ProcessingStatus::Submitted => 2,
            ProcessingStatus::Running => 3,
            ProcessingStatus::Finished => 4,
            ProcessingStatus::Failed => 5,
            ProcessingStatus::Lost => 6,
            ProcessingStatus::Cancel => 7,
            ProcessingStatus::FinishedOnExec => 9,
            ProcessingStatus::SubFinished => 11,
            ProcessingStatus::Cancelled => 14,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessingStatus::Finished
                | ProcessingStatus::FinishedOnExec
                | ProcessingStatus::SubFinished
                | ProcessingStatus::Failed
                | ProcessingStatus::Lost
                | ProcessingStatus::Cancelled
        )
    }

    pub fn allows(self, to: ProcessingStatus, via_command: bool) -> bool {
        if self == to {
            return true;
        }
        if self.is_terminal() {
            return via_command && matches!(to, ProcessingStatus::New);
        }
        true
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Collection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionStatus {
    New,
    Updated,
    Open,
    Closed,
}

impl CollectionStatus {
    pub fn code(self) -> i32 {
        match self {
            CollectionStatus::New => 0,
            CollectionStatus::Updated => 1,
            CollectionStatus::Open => 3,
            CollectionStatus::Closed => 4,
        }
    }
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Content states. Transitions are one-directional per item:
/// New -> Processing -> {Available | Failed | Lost}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentStatus {
    New,
    Processing,
    Available,
    Failed,
    Lost,
}

impl ContentStatus {
    pub fn code(self) -> i32 {
        match self {
            ContentStatus::New => 0,
            ContentStatus::Processing => 1,
            ContentStatus::Available => 2,
            ContentStatus::Failed => 3,
            ContentStatus::Lost => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ContentStatus::Available | ContentStatus::Failed | ContentStatus::Lost
        )
    }

    /// One-directional content progression guard.
    pub fn allows(self, to: ContentStatus) -> bool {
        if self == to {
            return true;
        }
        match self {
            ContentStatus::New => true,
            ContentStatus::Processing => to != ContentStatus::New,
            _ => false,
        }
    }

    /// Stable name used as the rollup histogram key.
    pub fn name(self) -> &'static str {
        match self {
            ContentStatus::New => "New",
            ContentStatus::Processing => "Processing",
            ContentStatus::Available => "Available",
            ContentStatus::Failed => "Failed",
            ContentStatus::Lost => "Lost",
        }
    }
}

impl fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Outbound message states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    New,
    Fetched,
    Delivered,
    ConfirmDelivered,
}

impl MessageStatus {
    pub fn code(self) -> i32 {
        match self {
            MessageStatus::New => 0,
            MessageStatus::Fetched => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::ConfirmDelivered => 4,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Inbound command states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    New,
    Processing,
    Processed,
    Failed,
    UnknownCommand,
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Outcome of aggregating child statuses into a parent status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollup {
    Finished,
    SubFinished,
    Failed,
}

/// Derive a parent outcome from a histogram over child status names.
///
/// Keyed by name rather than enum identity so the result is stable across
/// code/version drift in the persisted integer values. All children in the
/// success class map to `Finished`; all children in a failure class map to
/// `Failed`; any other mixture is `SubFinished` (a single non-success class
/// is enough to deny `Finished`).
pub fn rollup(histogram: &HashMap<String, usize>, success: &str, failures: &[&str]) -> Rollup {
    let keys: Vec<&str> = histogram
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(name, _)| name.as_str())
        .collect();

    if keys.is_empty() || keys.iter().all(|k| *k == success) {
        return Rollup::Finished;
    }
    if keys.iter().all(|k| failures.contains(k)) {
        return Rollup::Failed;
    }
    Rollup::SubFinished
}

/// Rollup over output-content statuses, the rule applied at both the
/// transform level (over its processings' outputs) and the request level.
pub fn rollup_contents(statuses: impl IntoIterator<Item = ContentStatus>) -> Rollup {
    let mut histogram: HashMap<String, usize> = HashMap::new();
    for status in statuses {
        *histogram.entry(status.name().to_string()).or_insert(0) += 1;
    }
    rollup(&histogram, "Available", &["Failed", "Lost"])
}

/// Rollup over terminal transform statuses into the owning request's outcome.
pub fn rollup_transforms(statuses: impl IntoIterator<Item = TransformStatus>) -> Rollup {
    let mut histogram: HashMap<String, usize> = HashMap::new();
    for status in statuses {
        *histogram.entry(format!("{status:?}")).or_insert(0) += 1;
    }
    rollup(&histogram, "Finished", &["Failed", "Cancelled"])
}

impl From<Rollup> for RequestStatus {
    fn from(value: Rollup) -> Self {
        match value {
            Rollup::Finished => RequestStatus::Finished,
            Rollup::SubFinished => RequestStatus::SubFinished,
            Rollup::Failed => RequestStatus::Failed,
        }
    }
}

impl From<Rollup> for TransformStatus {
    fn from(value: Rollup) -> Self {
        match value {
            Rollup::Finished => TransformStatus::Finished,
            Rollup::SubFinished => TransformStatus::SubFinished,
            Rollup::Failed => TransformStatus::Failed,
        }
    }
}

impl From<Rollup> for ProcessingStatus {
    fn from(value: Rollup) -> Self {
        match value {
            Rollup::Finished => ProcessingStatus::Finished,
            Rollup::SubFinished => ProcessingStatus::SubFinished,
            Rollup::Failed => ProcessingStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_terminal_states() {
        assert!(RequestStatus::Finished.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
        assert!(RequestStatus::Cancelled.is_terminal());
        assert!(RequestStatus::Lost.is_terminal());
        assert!(!RequestStatus::Transforming.is_terminal());
        assert!(!RequestStatus::ToCancel.is_terminal());
    }

    #[test]
    fn terminal_reopen_requires_command() {
        assert!(!RequestStatus::Finished.allows(RequestStatus::Transforming, false));
        assert!(RequestStatus::Finished.allows(RequestStatus::ReQueue, true));
        assert!(RequestStatus::Failed.allows(RequestStatus::Extend, true));
        // A command cannot push a terminal request to another terminal state.
        assert!(!RequestStatus::Finished.allows(RequestStatus::Failed, true));
    }

    #[test]
    fn same_status_write_is_idempotent() {
        assert!(RequestStatus::Finished.allows(RequestStatus::Finished, false));
        assert!(ProcessingStatus::Failed.allows(ProcessingStatus::Failed, false));
    }

    #[test]
    fn processing_terminal_includes_finished_on_exec() {
        assert!(ProcessingStatus::FinishedOnExec.is_terminal());
        assert!(ProcessingStatus::Lost.is_terminal());
        assert!(!ProcessingStatus::Submitted.is_terminal());
        assert!(!ProcessingStatus::Running.is_terminal());
    }

    #[test]
    fn content_progression_is_one_directional() {
        assert!(ContentStatus::New.allows(ContentStatus::Processing));
        assert!(ContentStatus::New.allows(ContentStatus::Available));
        assert!(ContentStatus::Processing.allows(ContentStatus::Failed));
        assert!(!ContentStatus::Processing.allows(ContentStatus::New));
        assert!(!ContentStatus::Available.allows(ContentStatus::Failed));
        assert!(!ContentStatus::Failed.allows(ContentStatus::Available));
    }

    #[test]
    fn rollup_all_available_is_finished() {
        let statuses = vec![
            ContentStatus::Available,
            ContentStatus::Available,
            ContentStatus::Available,
        ];
        assert_eq!(rollup_contents(statuses), Rollup::Finished);
    }

    #[test]
    fn rollup_mixed_is_subfinished() {
        let statuses = vec![
            ContentStatus::Available,
            ContentStatus::Available,
            ContentStatus::Failed,
        ];
        assert_eq!(rollup_contents(statuses), Rollup::SubFinished);
    }

    #[test]
    fn rollup_all_failed_is_failed() {
        let statuses = vec![ContentStatus::Failed, ContentStatus::Lost];
        assert_eq!(rollup_contents(statuses), Rollup::Failed);
    }

    #[test]
    fn rollup_pending_contents_deny_finished() {
        let statuses = vec![ContentStatus::Available, ContentStatus::New];
        assert_eq!(rollup_contents(statuses), Rollup::SubFinished);
    }

    #[test]
    fn rollup_transforms_matches_request_rule() {
        assert_eq!(
            rollup_transforms(vec![TransformStatus::Finished, TransformStatus::Finished]),
            Rollup::Finished
        );
        assert_eq!(
            rollup_transforms(vec![TransformStatus::Failed, TransformStatus::Failed]),
            Rollup::Failed
        );
        assert_eq!(
            rollup_transforms(vec![TransformStatus::Finished, TransformStatus::Failed]),
            Rollup::SubFinished
        );
        assert_eq!(
            rollup_transforms(vec![
                TransformStatus::Finished,
                TransformStatus::SubFinished
            ]),
            Rollup::SubFinished
        );
    }

    #[test]
    fn rollup_is_keyed_by_name_not_code() {
        // Histograms built from names produce the same outcome regardless of
        // the integer codes behind the enum variants.
        let mut histogram = HashMap::new();
        histogram.insert("Available".to_string(), 2);
        histogram.insert("Failed".to_string(), 1);
        assert_eq!(
            rollup(&histogram, "Available", &["Failed", "Lost"]),
            Rollup::SubFinished
        );
    }

    #[test]
    fn status_codes_are_stable() {
        assert_eq!(RequestStatus::New.code(), 0);
        assert_eq!(RequestStatus::Transforming.code(), 2);
        assert_eq!(RequestStatus::Failed.code(), 5);
        assert_eq!(TransformStatus::SubFinished.code(), 4);
        assert_eq!(ProcessingStatus::FinishedOnExec.code(), 9);
        assert_eq!(ContentStatus::Available.code(), 2);
        assert_eq!(MessageStatus::ConfirmDelivered.code(), 4);
    }
}
