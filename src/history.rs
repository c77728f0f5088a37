//! Append-only audit trail of lifecycle, approval and schedule actions
use super::types::{ActorId, Scope, TimeStamp, VersionId};
use super::version::{ApprovalStatus, Change, Version, VersionStatus};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryAction {
    #[n(0)]
    Created,
    #[n(1)]
    Modified,
    #[n(2)]
    SubmittedForApproval,
    #[n(3)]
    Approved,
    #[n(4)]
    Rejected,
    #[n(5)]
    Scheduled,
    #[n(6)]
    ScheduleCancelled,
    #[n(7)]
    Published,
    #[n(8)]
    Archived,
    #[n(9)]
    Discarded,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::SubmittedForApproval => "submitted_for_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Scheduled => "scheduled",
            Self::ScheduleCancelled => "schedule_cancelled",
            Self::Published => "published",
            Self::Archived => "archived",
            Self::Discarded => "discarded",
        }
    }
}

impl std::fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable audit record. `seq` is a store-wide monotonic sequence that
/// orders entries across versions.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    #[n(0)]
    pub seq: u64,
    #[n(1)]
    pub version_id: VersionId,
    #[n(2)]
    pub scope: Scope,
    #[n(3)]
    pub version_number: u64,
    #[n(4)]
    pub action: HistoryAction,
    #[n(5)]
    pub performed_by: ActorId,
    #[n(6)]
    pub performed_at: TimeStamp,
    #[n(7)]
    pub notes: Option<String>,
    #[n(8)]
    pub old_status: Option<VersionStatus>,
    #[n(9)]
    pub new_status: Option<VersionStatus>,
    #[n(10)]
    pub old_approval_status: Option<ApprovalStatus>,
    #[n(11)]
    pub new_approval_status: Option<ApprovalStatus>,
    #[n(12)]
    pub change_summary: Option<String>,
    #[n(13)]
    pub scheduled_publish_at: Option<TimeStamp>,
}

impl HistoryEntry {
    pub fn new(
        seq: u64,
        version: &Version,
        action: HistoryAction,
        performed_by: &ActorId,
        performed_at: TimeStamp,
    ) -> Self {
        Self {
            seq,
            version_id: version.id.clone(),
            scope: version.scope.clone(),
            version_number: version.version_number,
            action,
            performed_by: performed_by.clone(),
            performed_at,
            notes: None,
            old_status: None,
            new_status: None,
            old_approval_status: None,
            new_approval_status: None,
            change_summary: None,
            scheduled_publish_at: None,
        }
    }
    pub fn set_notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }
    pub fn set_status_change(mut self, change: Change<VersionStatus>) -> Self {
        self.old_status = Some(change.old);
        self.new_status = Some(change.new);
        self
    }
    pub fn set_new_status(mut self, status: VersionStatus) -> Self {
        self.new_status = Some(status);
        self
    }
    pub fn set_old_status(mut self, status: VersionStatus) -> Self {
        self.old_status = Some(status);
        self
    }
    pub fn set_approval_change(mut self, change: Change<ApprovalStatus>) -> Self {
        self.old_approval_status = Some(change.old);
        self.new_approval_status = Some(change.new);
        self
    }
    pub fn set_change_summary(mut self, summary: String) -> Self {
        self.change_summary = Some(summary);
        self
    }
    pub fn set_scheduled_publish_at(mut self, at: Option<TimeStamp>) -> Self {
        self.scheduled_publish_at = at;
        self
    }
}

/// Resolves actor ids to display names for rendered history.
pub trait ActorDirectory: Send + Sync {
    fn display_name(&self, actor: &ActorId) -> Option<String>;
}

/// A history entry paired with the performer's resolved name, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryLine {
    pub entry: HistoryEntry,
    pub performed_by_name: Option<String>,
}

impl HistoryLine {
    pub fn resolve(entry: HistoryEntry, directory: Option<&dyn ActorDirectory>) -> Self {
        let performed_by_name = directory.and_then(|dir| dir.display_name(&entry.performed_by));
        Self {
            entry,
            performed_by_name,
        }
    }

    pub fn performer(&self) -> &str {
        self.performed_by_name
            .as_deref()
            .unwrap_or(self.entry.performed_by.as_str())
    }
}

impl std::fmt::Display for HistoryLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entry = &self.entry;
        write!(
            f,
            "{} v{} {} by {}",
            entry.performed_at,
            entry.version_number,
            entry.action,
            self.performer()
        )?;
        if let (Some(old), Some(new)) = (entry.old_status, entry.new_status) {
            write!(f, " [{old} -> {new}]")?;
        }
        if let (Some(old), Some(new)) = (entry.old_approval_status, entry.new_approval_status) {
            write!(f, " [approval {old} -> {new}]")?;
        }
        if let Some(summary) = &entry.change_summary {
            write!(f, ": {summary}")?;
        }
        if let Some(notes) = &entry.notes {
            write!(f, " ({notes})")?;
        }
        Ok(())
    }
}
