//! Persisted transfer record and its lifecycle enums.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---

use super::error::ErrorCode;

/// Default block size for a transfer when the request does not set one.
pub const DEFAULT_BLOCK_SIZE: u32 = 0x10000;

// ---------------------------------------------------------------------------
// GlobalStep
// ---------------------------------------------------------------------------

/// Stage a transfer is in. See [`crate::step_successors`] for legal moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GlobalStep {
    // ---
    #[default]
    NoTask,
    PreTask,
    TransferTask,
    PostTask,
    ErrorTask,
    AllDone,
}

impl fmt::Display for GlobalStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// StepStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StepStatus {
    // ---
    #[default]
    Unknown,
    Running,
    Ok,
    Error,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// UpdatedInfo
// ---------------------------------------------------------------------------

/// Scheduler-visible lifecycle tag. Read by the commander and by any
/// external console, so the set of states is a contract with the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum UpdatedInfo {
    // ---
    #[default]
    Unknown,
    NotUpdated,
    Interrupted,
    ToSubmit,
    InError,
    Running,
    Done,
}

impl fmt::Display for UpdatedInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// TransferKey
// ---------------------------------------------------------------------------

/// At-most-once key: one live execution per `(requested, requester, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferKey {
    // ---
    pub requested: String,
    pub requester: String,
    pub transfer_id: i64,
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.requested, self.requester, self.transfer_id)
    }
}

// ---------------------------------------------------------------------------
// TransferRecord
// ---------------------------------------------------------------------------

/// One transfer as persisted. Survives process restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    // ---
    pub owner_host: String,
    pub requester: String,
    pub requested: String,
    pub transfer_id: i64,

    pub rule_name: String,
    pub is_sender: bool,

    pub global_step: GlobalStep,
    /// Last non-error stage reached; drives resume after an interruption.
    pub global_last_step: GlobalStep,
    /// Index into the active stage's task list.
    pub step: u32,
    /// Last acknowledged block.
    pub rank: u32,
    pub status: StepStatus,
    pub info_status: ErrorCode,

    pub filename: String,
    pub original_filename: String,
    /// Free-form metadata; its space-separated words also feed `%s`
    /// substitution in task arguments.
    pub file_info: String,
    pub block_size: u32,
    pub is_file_moved: bool,

    pub updated_info: UpdatedInfo,
    pub error_message: Option<String>,

    pub start: DateTime<Utc>,
    pub stop: Option<DateTime<Utc>>,
}

impl TransferRecord {
    // ---
    /// Fresh record for a newly requested transfer, flagged `ToSubmit`.
    pub fn new(
        owner_host: impl Into<String>,
        key: TransferKey,
        rule_name: impl Into<String>,
        is_sender: bool,
        filename: impl Into<String>,
    ) -> Self {
        // ---
        let filename = filename.into();
        Self {
            owner_host: owner_host.into(),
            requester: key.requester,
            requested: key.requested,
            transfer_id: key.transfer_id,
            rule_name: rule_name.into(),
            is_sender,
            global_step: GlobalStep::NoTask,
            global_last_step: GlobalStep::NoTask,
            step: 0,
            rank: 0,
            status: StepStatus::Unknown,
            info_status: ErrorCode::Unknown,
            original_filename: filename.clone(),
            filename,
            file_info: String::new(),
            block_size: DEFAULT_BLOCK_SIZE,
            is_file_moved: false,
            updated_info: UpdatedInfo::ToSubmit,
            error_message: None,
            start: Utc::now(),
            stop: None,
        }
    }

    // ---

    pub fn with_file_info(mut self, info: impl Into<String>) -> Self {
        self.file_info = info.into();
        self
    }

    // ---

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    // ---

    pub fn key(&self) -> TransferKey {
        TransferKey {
            requested: self.requested.clone(),
            requester: self.requester.clone(),
            transfer_id: self.transfer_id,
        }
    }

    // ---

    /// File name of this record's marker in a store-less archive directory.
    pub fn archive_name(&self) -> String {
        format!(
            "{}_{}_{}.json",
            self.requester, self.requested, self.transfer_id
        )
    }

    // ---

    /// `requested` is this host and `requester` is someone else: the request
    /// came back to us, which is a configuration error, not retried.
    pub fn is_self_requested(&self, host_id: &str) -> bool {
        self.requested == host_id && self.requester != host_id
    }

    // ---

    /// Failed for good, with a recorded cause. Distinct from a stalled
    /// transfer (`ToSubmit`/`Interrupted` without a message).
    pub fn is_terminal_failure(&self) -> bool {
        self.status == StepStatus::Error && self.error_message.is_some()
    }

    // ---

    /// Fill in the failure fields the admin view reads.
    pub fn mark_failed(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.status = StepStatus::Error;
        self.info_status = code;
        self.error_message = Some(message.into());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn key() -> TransferKey {
        TransferKey {
            requested: "hostb".into(),
            requester: "hosta".into(),
            transfer_id: 42,
        }
    }

    #[test]
    fn key_display_orders_requested_first() {
        assert_eq!(key().to_string(), "hostb hosta 42");
    }

    #[test]
    fn self_requested_needs_foreign_requester() {
        // ---
        let rec = TransferRecord::new("hostb", key(), "default", true, "a.txt");
        assert!(rec.is_self_requested("hostb"));
        assert!(!rec.is_self_requested("hosta"));

        let mut local = rec.clone();
        local.requester = "hostb".into();
        assert!(
            !local.is_self_requested("hostb"),
            "a transfer both requested and requested by us is not a loop"
        );
    }

    #[test]
    fn record_survives_json_round_trip_with_state() {
        // ---
        let mut rec = TransferRecord::new("hosta", key(), "default", false, "in.bin")
            .with_file_info("alpha beta");
        rec.global_step = GlobalStep::TransferTask;
        rec.rank = 7;
        rec.updated_info = UpdatedInfo::Interrupted;

        let json = serde_json::to_string(&rec).unwrap();
        let back: TransferRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
        assert_eq!(back.archive_name(), "hosta_hostb_42.json");
    }

    #[test]
    fn terminal_failure_requires_message() {
        // ---
        let mut rec = TransferRecord::new("hosta", key(), "default", false, "in.bin");
        rec.status = StepStatus::Error;
        assert!(!rec.is_terminal_failure());
        rec.mark_failed(ErrorCode::ExternalOp, "exit 2");
        assert!(rec.is_terminal_failure());
    }
}
