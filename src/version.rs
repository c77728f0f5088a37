//! Version record and its two orthogonal state machines.
//!
//! The status axis (`Draft -> Published -> Archived`, or `Draft -> Archived`)
//! and the approval axis (`None -> Pending -> Approved | Rejected`) are closed
//! enums. Every transition goes through an exhaustive `match`, so adding a
//! state forces every rule to be revisited.
use super::error::PublishError;
use super::types::{ActorId, Scope, TimeStamp, VersionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum VersionStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    Published,
    #[n(2)]
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAction {
    Publish,
    Archive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum ApprovalStatus {
    #[n(0)]
    None,
    #[n(1)]
    Pending,
    #[n(2)]
    Approved,
    #[n(3)]
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalAction {
    Submit,
    Approve,
    Reject,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }

    pub fn transition(self, action: StatusAction) -> Result<VersionStatus, PublishError> {
        match (self, action) {
            (Self::Draft, StatusAction::Publish) => Ok(Self::Published),
            (Self::Draft | Self::Published, StatusAction::Archive) => Ok(Self::Archived),
            (Self::Published, StatusAction::Publish) => Err(PublishError::InvalidState(
                "version is already published".into(),
            )),
            (Self::Archived, StatusAction::Publish) => Err(PublishError::InvalidState(
                "archived versions cannot be published".into(),
            )),
            (Self::Archived, StatusAction::Archive) => Err(PublishError::InvalidState(
                "version is already archived".into(),
            )),
        }
    }
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn transition(self, action: ApprovalAction) -> Result<ApprovalStatus, PublishError> {
        match (self, action) {
            (Self::Pending, ApprovalAction::Submit) => Err(PublishError::Conflict(
                "version is already pending approval".into(),
            )),
            (Self::None | Self::Approved | Self::Rejected, ApprovalAction::Submit) => {
                Ok(Self::Pending)
            }
            (Self::Pending, ApprovalAction::Approve) => Ok(Self::Approved),
            (Self::Pending, ApprovalAction::Reject) => Ok(Self::Rejected),
            (
                Self::None | Self::Approved | Self::Rejected,
                ApprovalAction::Approve | ApprovalAction::Reject,
            ) => Err(PublishError::InvalidState(format!(
                "an approval decision needs a pending submission, approval is {self}"
            ))),
        }
    }
}

impl std::fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Before/after pair captured for the history entry of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change<T> {
    pub old: T,
    pub new: T,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Version {
    #[n(0)]
    pub id: VersionId,
    #[n(1)]
    pub scope: Scope,
    #[n(2)]
    pub version_number: u64,
    #[n(3)]
    pub status: VersionStatus,
    #[n(4)]
    pub approval_status: ApprovalStatus,
    #[n(5)]
    pub notes: Option<String>,
    #[n(6)]
    pub created_by: ActorId,
    #[n(7)]
    pub created_at: TimeStamp,
    #[n(8)]
    pub updated_at: TimeStamp,
    #[n(9)]
    pub published_by: Option<ActorId>,
    #[n(10)]
    pub published_at: Option<TimeStamp>,
    #[n(11)]
    pub archived_at: Option<TimeStamp>,
    #[n(12)]
    pub scheduled_publish_at: Option<TimeStamp>,
    #[n(13)]
    pub scheduled_by: Option<ActorId>,
    #[n(14)]
    pub submitted_by: Option<ActorId>,
    #[n(15)]
    pub submitted_at: Option<TimeStamp>,
    #[n(16)]
    pub approved_by: Option<ActorId>,
    #[n(17)]
    pub approved_at: Option<TimeStamp>,
    #[n(18)]
    pub rejected_by: Option<ActorId>,
    #[n(19)]
    pub rejected_at: Option<TimeStamp>,
    #[n(20)]
    pub rejection_reason: Option<String>,
    #[n(21)]
    pub restored_from: Option<VersionId>,
}

impl Version {
    pub fn new_draft(
        id: VersionId,
        scope: Scope,
        version_number: u64,
        created_by: ActorId,
        notes: Option<String>,
        now: TimeStamp,
    ) -> Self {
        Self {
            id,
            scope,
            version_number,
            status: VersionStatus::Draft,
            approval_status: ApprovalStatus::None,
            notes,
            created_by,
            created_at: now,
            updated_at: now,
            published_by: None,
            published_at: None,
            archived_at: None,
            scheduled_publish_at: None,
            scheduled_by: None,
            submitted_by: None,
            submitted_at: None,
            approved_by: None,
            approved_at: None,
            rejected_by: None,
            rejected_at: None,
            rejection_reason: None,
            restored_from: None,
        }
    }

    pub fn is_draft(&self) -> bool {
        self.status == VersionStatus::Draft
    }

    pub fn ensure_draft(&self, operation: &str) -> Result<(), PublishError> {
        match self.status {
            VersionStatus::Draft => Ok(()),
            VersionStatus::Published | VersionStatus::Archived => {
                Err(PublishError::InvalidState(format!(
                    "cannot {operation} version {} while it is {}",
                    self.version_number, self.status
                )))
            }
        }
    }

    /// True when the draft carries a schedule that has elapsed at `now`.
    pub fn is_due(&self, now: TimeStamp) -> bool {
        self.is_draft() && self.scheduled_publish_at.is_some_and(|at| at <= now)
    }

    pub fn publish(
        &mut self,
        actor: &ActorId,
        now: TimeStamp,
    ) -> Result<Change<VersionStatus>, PublishError> {
        let old = self.status;
        let new = old.transition(StatusAction::Publish)?;

        self.status = new;
        self.published_by = Some(actor.clone());
        self.published_at = Some(now);
        self.scheduled_publish_at = None;
        self.scheduled_by = None;
        self.updated_at = now;

        Ok(Change { old, new })
    }

    pub fn archive(&mut self, now: TimeStamp) -> Result<Change<VersionStatus>, PublishError> {
        let old = self.status;
        let new = old.transition(StatusAction::Archive)?;

        self.status = new;
        self.archived_at = Some(now);
        self.scheduled_publish_at = None;
        self.scheduled_by = None;
        self.updated_at = now;

        Ok(Change { old, new })
    }

    pub fn submit_for_approval(
        &mut self,
        actor: &ActorId,
        now: TimeStamp,
    ) -> Result<Change<ApprovalStatus>, PublishError> {
        self.ensure_draft("submit")?;
        let old = self.approval_status;
        let new = old.transition(ApprovalAction::Submit)?;

        self.approval_status = new;
        self.submitted_by = Some(actor.clone());
        self.submitted_at = Some(now);
        self.approved_by = None;
        self.approved_at = None;
        self.rejected_by = None;
        self.rejected_at = None;
        self.rejection_reason = None;
        self.updated_at = now;

        Ok(Change { old, new })
    }

    pub fn approve(
        &mut self,
        actor: &ActorId,
        now: TimeStamp,
    ) -> Result<Change<ApprovalStatus>, PublishError> {
        self.ensure_draft("approve")?;
        let old = self.approval_status;
        let new = old.transition(ApprovalAction::Approve)?;

        self.approval_status = new;
        self.approved_by = Some(actor.clone());
        self.approved_at = Some(now);
        self.updated_at = now;

        Ok(Change { old, new })
    }

    pub fn reject(
        &mut self,
        actor: &ActorId,
        reason: Option<String>,
        now: TimeStamp,
    ) -> Result<Change<ApprovalStatus>, PublishError> {
        self.ensure_draft("reject")?;
        let old = self.approval_status;
        let new = old.transition(ApprovalAction::Reject)?;

        self.approval_status = new;
        self.rejected_by = Some(actor.clone());
        self.rejected_at = Some(now);
        self.rejection_reason = reason;
        self.updated_at = now;

        Ok(Change { old, new })
    }

    /// Drops an existing approval after the draft content changed.
    pub fn reset_approval(&mut self) -> Option<Change<ApprovalStatus>> {
        match self.approval_status {
            ApprovalStatus::Approved => {
                self.approval_status = ApprovalStatus::None;
                self.approved_by = None;
                self.approved_at = None;
                Some(Change {
                    old: ApprovalStatus::Approved,
                    new: ApprovalStatus::None,
                })
            }
            ApprovalStatus::None | ApprovalStatus::Pending | ApprovalStatus::Rejected => None,
        }
    }

    /// Returns the schedule being replaced, if any.
    pub fn schedule(
        &mut self,
        publish_at: TimeStamp,
        actor: &ActorId,
        now: TimeStamp,
    ) -> Result<Option<TimeStamp>, PublishError> {
        self.ensure_draft("schedule")?;
        if publish_at <= now {
            return Err(PublishError::InvalidArgument(format!(
                "publish time {publish_at} must be after {now}"
            )));
        }
        if publish_at.to_datetime_utc().timestamp_nanos_opt().is_none() {
            return Err(PublishError::InvalidArgument(format!(
                "publish time {publish_at} is out of the storable range"
            )));
        }

        let previous = self.scheduled_publish_at.replace(publish_at);
        self.scheduled_by = Some(actor.clone());
        self.updated_at = now;

        Ok(previous)
    }

    pub fn cancel_schedule(&mut self, now: TimeStamp) -> Result<TimeStamp, PublishError> {
        let Some(previous) = self.scheduled_publish_at.take() else {
            return Err(PublishError::InvalidState(format!(
                "version {} has no scheduled publication",
                self.version_number
            )));
        };
        self.scheduled_by = None;
        self.updated_at = now;

        Ok(previous)
    }
}
