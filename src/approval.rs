//! Approval axis operations on a draft
//!
//! Whether publishing consults the approval status is decided by the
//! publisher's [`ApprovalPolicy`](super::config::ApprovalPolicy); these calls
//! only move the draft along `None -> Pending -> Approved | Rejected`.
use super::error::PublishError;
use super::history::{HistoryAction, HistoryEntry};
use super::lifecycle::Publisher;
use super::store::Abortable;
use super::types::{ActorId, TimeStamp, VersionId};
use super::version::{ApprovalStatus, Change, Version};

enum Decision {
    Submit,
    Approve,
    Reject(Option<String>),
}

impl Decision {
    fn operation(&self) -> &'static str {
        match self {
            Self::Submit => "submit_for_approval",
            Self::Approve => "approve",
            Self::Reject(_) => "reject",
        }
    }

    fn action(&self) -> HistoryAction {
        match self {
            Self::Submit => HistoryAction::SubmittedForApproval,
            Self::Approve => HistoryAction::Approved,
            Self::Reject(_) => HistoryAction::Rejected,
        }
    }

    fn apply(
        &self,
        version: &mut Version,
        actor: &ActorId,
        now: TimeStamp,
    ) -> Result<Change<ApprovalStatus>, PublishError> {
        match self {
            Self::Submit => version.submit_for_approval(actor, now),
            Self::Approve => version.approve(actor, now),
            Self::Reject(reason) => version.reject(actor, reason.clone(), now),
        }
    }
}

impl Publisher {
    pub fn submit_for_approval(
        &self,
        version_id: &VersionId,
        actor: &ActorId,
        notes: Option<String>,
    ) -> Result<Version, PublishError> {
        self.decide(version_id, actor, notes, Decision::Submit)
    }

    pub fn approve(
        &self,
        version_id: &VersionId,
        actor: &ActorId,
        notes: Option<String>,
    ) -> Result<Version, PublishError> {
        self.decide(version_id, actor, notes, Decision::Approve)
    }

    /// The reason is kept on the version and doubles as the history note.
    pub fn reject(
        &self,
        version_id: &VersionId,
        actor: &ActorId,
        reason: Option<String>,
    ) -> Result<Version, PublishError> {
        self.decide(version_id, actor, reason.clone(), Decision::Reject(reason))
    }

    fn decide(
        &self,
        version_id: &VersionId,
        actor: &ActorId,
        notes: Option<String>,
        decision: Decision,
    ) -> Result<Version, PublishError> {
        Self::authorize(actor)?;
        let now = self.clock.now();

        let version = self.commit(decision.operation(), |tx| {
            let mut version = self.load_in_scope(tx, version_id)?;
            let change = decision.apply(&mut version, actor, now).or_abort()?;
            tx.put_version(&version)?;

            let entry = HistoryEntry::new(tx.next_seq()?, &version, decision.action(), actor, now)
                .set_approval_change(change)
                .set_notes(notes.clone());
            tx.append_history(&entry)?;

            Ok(version)
        })?;

        tracing::info!(
            version_id = %version.id,
            version_number = version.version_number,
            actor = %actor,
            approval = %version.approval_status,
            "{}",
            decision.action()
        );
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorKind;
    use crate::lifecycle::Publisher;
    use crate::store::VersionStore;
    use crate::types::ActorId;
    use crate::version::ApprovalStatus;
    use tempfile::tempdir;

    #[test]
    fn rejected_draft_can_be_resubmitted() {
        let dir = tempdir().unwrap();
        let publisher = Publisher::new(VersionStore::open(dir.path().join("db")).unwrap(), "site");
        let author = ActorId::from("user_author");
        let reviewer = ActorId::from("user_reviewer");
        let draft = publisher.create_draft(&author, None).unwrap();

        publisher.submit_for_approval(&draft.id, &author, None).unwrap();
        let rejected = publisher
            .reject(&draft.id, &reviewer, Some("needs a hero image".into()))
            .unwrap();
        assert_eq!(rejected.approval_status, ApprovalStatus::Rejected);
        assert_eq!(rejected.rejected_by, Some(reviewer.clone()));

        let again = publisher.submit_for_approval(&draft.id, &author, None).unwrap();
        assert_eq!(again.approval_status, ApprovalStatus::Pending);
        assert!(again.rejection_reason.is_none());
    }

    #[test]
    fn duplicate_submission_conflicts_without_history() {
        let dir = tempdir().unwrap();
        let publisher = Publisher::new(VersionStore::open(dir.path().join("db")).unwrap(), "site");
        let author = ActorId::from("user_author");
        let draft = publisher.create_draft(&author, None).unwrap();
        publisher.submit_for_approval(&draft.id, &author, None).unwrap();

        let err = publisher
            .submit_for_approval(&draft.id, &author, None)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(publisher.history(&draft.id).unwrap().len(), 2);
    }

    #[test]
    fn approve_without_submission_is_invalid() {
        let dir = tempdir().unwrap();
        let publisher = Publisher::new(VersionStore::open(dir.path().join("db")).unwrap(), "site");
        let author = ActorId::from("user_author");
        let draft = publisher.create_draft(&author, None).unwrap();

        let err = publisher.approve(&draft.id, &author, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
