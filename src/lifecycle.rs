//! Draft -> Published -> Archived lifecycle for one scope
use super::block::{self, BlockMutation, ChangeSummary, ContentBlock, NewBlock};
use super::clock::{Clock, SystemClock};
use super::config::{ApprovalPolicy, PublisherConfig};
use super::error::{ErrorKind, PublishError};
use super::history::{ActorDirectory, HistoryAction, HistoryEntry, HistoryLine};
use super::store::{Abortable, SlotKind, StoreTx, TxResult, VersionStore};
use super::types::{ActorId, BlockId, Scope, TimeStamp, VersionId};
use super::version::{ApprovalStatus, Version, VersionStatus};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Content used to seed the first draft of a scope that has never published.
pub trait LiveContentSource: Send + Sync {
    fn load(&self, scope: &Scope) -> anyhow::Result<Vec<NewBlock>>;
}

/// A version together with its blocks and a fingerprint of their content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDetail {
    pub version: Version,
    pub blocks: Vec<ContentBlock>,
    pub content_hash: String,
}

/// Published blocks of one section, in display order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedSection {
    pub section_key: String,
    pub blocks: Vec<ContentBlock>,
}

/// Lifecycle, approval and scheduling operations for a single scope.
///
/// Every state-changing call validates and writes inside one store
/// transaction, so a failed call leaves no trace, history included.
#[derive(Clone)]
pub struct Publisher {
    pub(crate) store: VersionStore,
    pub(crate) scope: Scope,
    pub(crate) approval: ApprovalPolicy,
    pub(crate) track_metadata: bool,
    pub(crate) clock: Arc<dyn Clock>,
    live_source: Option<Arc<dyn LiveContentSource>>,
    actors: Option<Arc<dyn ActorDirectory>>,
    cancel: CancellationToken,
}

enum DraftSource {
    Published,
    Restore(VersionId),
}

impl Publisher {
    pub fn new(store: VersionStore, scope: impl Into<Scope>) -> Self {
        Self {
            store,
            scope: scope.into(),
            approval: ApprovalPolicy::default(),
            track_metadata: true,
            clock: Arc::new(SystemClock),
            live_source: None,
            actors: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(store: VersionStore, config: &PublisherConfig) -> Self {
        Self::new(store, config.scope.as_str())
            .with_approval_policy(config.approval)
            .with_diff_metadata(config.diff_track_metadata)
    }

    pub fn with_approval_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.approval = policy;
        self
    }
    pub fn with_diff_metadata(mut self, track: bool) -> Self {
        self.track_metadata = track;
        self
    }
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
    pub fn with_live_source(mut self, source: Arc<dyn LiveContentSource>) -> Self {
        self.live_source = Some(source);
        self
    }
    pub fn with_actor_directory(mut self, directory: Arc<dyn ActorDirectory>) -> Self {
        self.actors = Some(directory);
        self
    }
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub(crate) fn authorize(actor: &ActorId) -> Result<(), PublishError> {
        if actor.is_empty() {
            return Err(PublishError::Unauthorized);
        }
        Ok(())
    }

    /// Runs `f` in a store transaction, aborting with `Cancelled` if the
    /// token fires before commit.
    pub(crate) fn commit<T, F>(&self, operation: &'static str, f: F) -> Result<T, PublishError>
    where
        F: Fn(&StoreTx<'_>) -> TxResult<T>,
    {
        if self.cancel.is_cancelled() {
            return Err(PublishError::Cancelled);
        }

        let result = self.store.transact(|tx| {
            let out = f(tx)?;
            if self.cancel.is_cancelled() {
                return sled::transaction::abort(PublishError::Cancelled);
            }
            Ok(out)
        });

        if let Err(err) = &result {
            match err.kind() {
                ErrorKind::Failure => {
                    tracing::error!(operation, scope = %self.scope, error = %err, "store failure")
                }
                _ => tracing::debug!(operation, scope = %self.scope, error = %err, "rejected"),
            }
        }
        result
    }

    /// Loads `id` for mutation, treating versions of other scopes as unknown.
    pub(crate) fn load_in_scope(&self, tx: &StoreTx<'_>, id: &VersionId) -> TxResult<Version> {
        let version = tx.require_version(id)?;
        if version.scope != self.scope {
            return sled::transaction::abort(PublishError::version_not_found(id));
        }
        Ok(version)
    }

    fn read_in_scope(&self, id: &VersionId) -> Result<Version, PublishError> {
        let version = self.store.require_version(id)?;
        if version.scope != self.scope {
            return Err(PublishError::version_not_found(id));
        }
        Ok(version)
    }

    pub fn create_draft(&self, actor: &ActorId, notes: Option<String>) -> Result<Version, PublishError> {
        Self::authorize(actor)?;
        self.create_from(actor, notes, DraftSource::Published)
    }

    /// Starts a new draft from the blocks of an archived version.
    pub fn restore_version(
        &self,
        archived_id: &VersionId,
        actor: &ActorId,
        notes: Option<String>,
    ) -> Result<Version, PublishError> {
        Self::authorize(actor)?;
        self.create_from(actor, notes, DraftSource::Restore(archived_id.clone()))
    }

    fn create_from(
        &self,
        actor: &ActorId,
        notes: Option<String>,
        source: DraftSource,
    ) -> Result<Version, PublishError> {
        let now = self.clock.now();
        let id = VersionId::generate()?;

        // a one-time migration: never consulted once the scope has published,
        // even if that version was later archived
        let bootstrap = match (&source, &self.live_source) {
            (DraftSource::Published, Some(live)) if !self.store.has_published(&self.scope)? => {
                live.load(&self.scope)?
            }
            _ => Vec::new(),
        };

        let version = self.commit("create_draft", |tx| {
            if tx.slot(&self.scope, SlotKind::Draft)?.is_some() {
                return sled::transaction::abort(PublishError::Conflict(format!(
                    "scope {} already has a draft",
                    self.scope
                )));
            }

            let (source_blocks, restored_from, notes) = match &source {
                DraftSource::Published => {
                    match tx.slot(&self.scope, SlotKind::Published)? {
                        Some(published) => (tx.blocks(&published)?, None, notes.clone()),
                        None if bootstrap.is_empty() || tx.has_published(&self.scope)? => {
                            (Vec::new(), None, notes.clone())
                        }
                        None => {
                            let adds = bootstrap.iter().cloned().map(BlockMutation::Add).collect();
                            let (blocks, _) = block::apply_mutations(&[], adds).or_abort()?;
                            (blocks, None, notes.clone())
                        }
                    }
                }
                DraftSource::Restore(archived_id) => {
                    let archived = self.load_in_scope(tx, archived_id)?;
                    if archived.status != VersionStatus::Archived {
                        return sled::transaction::abort(PublishError::InvalidState(format!(
                            "only archived versions can be restored, version {} is {}",
                            archived.version_number, archived.status
                        )));
                    }
                    let restored_note = match &notes {
                        Some(text) => format!(
                            "Restored from version {}: {text}",
                            archived.version_number
                        ),
                        None => format!("Restored from version {}", archived.version_number),
                    };
                    (tx.blocks(archived_id)?, Some(archived.id), Some(restored_note))
                }
            };

            let blocks = source_blocks
                .iter()
                .map(ContentBlock::duplicate)
                .collect::<Result<Vec<_>, _>>()
                .or_abort()?;

            let number = tx.next_version_number(&self.scope)?;
            let mut version = Version::new_draft(
                id.clone(),
                self.scope.clone(),
                number,
                actor.clone(),
                notes,
                now,
            );
            version.restored_from = restored_from;

            tx.put_version(&version)?;
            tx.put_blocks(&version.id, &blocks)?;
            tx.set_slot(&self.scope, SlotKind::Draft, Some(&version.id))?;
            tx.set_approval_policy(&self.scope, self.approval)?;

            let entry = HistoryEntry::new(tx.next_seq()?, &version, HistoryAction::Created, actor, now)
                .set_new_status(VersionStatus::Draft)
                .set_notes(version.notes.clone());
            tx.append_history(&entry)?;

            Ok(version)
        })?;

        tracing::info!(
            version_id = %version.id,
            version_number = version.version_number,
            scope = %self.scope,
            actor = %actor,
            restored_from = ?version.restored_from,
            "draft created"
        );
        Ok(version)
    }

    pub fn update_draft_blocks(
        &self,
        version_id: &VersionId,
        actor: &ActorId,
        mutations: Vec<BlockMutation>,
    ) -> Result<ChangeSummary, PublishError> {
        Self::authorize(actor)?;
        let now = self.clock.now();

        let summary = self.commit("update_draft_blocks", |tx| {
            let mut version = self.load_in_scope(tx, version_id)?;
            version.ensure_draft("modify").or_abort()?;

            let current = tx.blocks(version_id)?;
            let (blocks, summary) = block::apply_mutations(&current, mutations.clone()).or_abort()?;

            version.updated_at = now;
            let reset = if self.approval.reset_on_edit {
                version.reset_approval()
            } else {
                None
            };

            tx.put_version(&version)?;
            tx.put_blocks(version_id, &blocks)?;

            let mut entry =
                HistoryEntry::new(tx.next_seq()?, &version, HistoryAction::Modified, actor, now)
                    .set_change_summary(summary.to_string());
            if let Some(change) = reset {
                entry = entry
                    .set_approval_change(change)
                    .set_notes(Some("approval reset after edit".into()));
            }
            tx.append_history(&entry)?;

            Ok(summary)
        })?;

        tracing::info!(version_id = %version_id, actor = %actor, changes = %summary, "draft blocks updated");
        Ok(summary)
    }

    pub fn update_notes(
        &self,
        version_id: &VersionId,
        actor: &ActorId,
        notes: Option<String>,
    ) -> Result<Version, PublishError> {
        Self::authorize(actor)?;
        let now = self.clock.now();

        self.commit("update_notes", |tx| {
            let mut version = self.load_in_scope(tx, version_id)?;
            version.ensure_draft("edit notes of").or_abort()?;
            version.notes = notes.clone();
            version.updated_at = now;
            tx.put_version(&version)?;

            let entry = HistoryEntry::new(tx.next_seq()?, &version, HistoryAction::Modified, actor, now)
                .set_change_summary("notes updated".into())
                .set_notes(notes.clone());
            tx.append_history(&entry)?;

            Ok(version)
        })
    }

    pub fn publish(&self, version_id: &VersionId, actor: &ActorId) -> Result<Version, PublishError> {
        Self::authorize(actor)?;
        self.publish_version(version_id, actor, None, None)
    }

    /// Shared by manual and scheduled publishing. With `due_at`, the draft must
    /// still carry a schedule that has elapsed at that instant, and approval is
    /// gated by the policy recorded for the scope rather than this publisher's.
    pub(crate) fn publish_version(
        &self,
        version_id: &VersionId,
        actor: &ActorId,
        notes: Option<String>,
        due_at: Option<TimeStamp>,
    ) -> Result<Version, PublishError> {
        let now = self.clock.now();

        let (version, superseded) = self.commit("publish", |tx| {
            let mut version = self.load_in_scope(tx, version_id)?;
            version.ensure_draft("publish").or_abort()?;

            let policy = match due_at {
                Some(due_at) => {
                    if !version.is_due(due_at) {
                        return sled::transaction::abort(PublishError::InvalidState(format!(
                            "version {} is no longer scheduled for publication",
                            version.version_number
                        )));
                    }
                    tx.approval_policy(&self.scope)?.unwrap_or(self.approval)
                }
                None => self.approval,
            };
            if policy.required && version.approval_status != ApprovalStatus::Approved {
                return sled::transaction::abort(PublishError::ApprovalRequired {
                    version_id: version.id.clone(),
                    approval_status: version.approval_status,
                });
            }

            let mut superseded = None;
            if let Some(previous_id) = tx.slot(&self.scope, SlotKind::Published)? {
                let mut previous = tx.require_version(&previous_id)?;
                let change = previous.archive(now).or_abort()?;
                tx.put_version(&previous)?;

                let entry =
                    HistoryEntry::new(tx.next_seq()?, &previous, HistoryAction::Archived, actor, now)
                        .set_status_change(change)
                        .set_notes(Some(format!(
                            "Superseded by version {}",
                            version.version_number
                        )));
                tx.append_history(&entry)?;
                superseded = Some(previous.version_number);
            }

            let scheduled_at = version.scheduled_publish_at;
            let change = version.publish(actor, now).or_abort()?;
            if let Some(at) = scheduled_at {
                tx.unindex_schedule(&version.id, at)?;
            }

            tx.put_version(&version)?;
            tx.set_slot(&self.scope, SlotKind::Published, Some(&version.id))?;
            tx.set_slot(&self.scope, SlotKind::Draft, None)?;
            tx.mark_published(&self.scope)?;

            let entry = HistoryEntry::new(tx.next_seq()?, &version, HistoryAction::Published, actor, now)
                .set_status_change(change)
                .set_notes(notes.clone());
            tx.append_history(&entry)?;

            Ok((version, superseded))
        })?;

        tracing::info!(
            version_id = %version.id,
            version_number = version.version_number,
            scope = %self.scope,
            actor = %actor,
            superseded = ?superseded,
            "version published"
        );
        Ok(version)
    }

    pub fn archive(
        &self,
        version_id: &VersionId,
        actor: &ActorId,
        notes: Option<String>,
    ) -> Result<Version, PublishError> {
        Self::authorize(actor)?;
        let now = self.clock.now();

        let version = self.commit("archive", |tx| {
            let mut version = self.load_in_scope(tx, version_id)?;
            let scheduled_at = version.scheduled_publish_at;
            let change = version.archive(now).or_abort()?;

            match change.old {
                VersionStatus::Draft => {
                    tx.set_slot(&self.scope, SlotKind::Draft, None)?;
                    if let Some(at) = scheduled_at {
                        tx.unindex_schedule(&version.id, at)?;
                    }
                }
                VersionStatus::Published => tx.set_slot(&self.scope, SlotKind::Published, None)?,
                VersionStatus::Archived => {}
            }
            tx.put_version(&version)?;

            let entry = HistoryEntry::new(tx.next_seq()?, &version, HistoryAction::Archived, actor, now)
                .set_status_change(change)
                .set_notes(notes.clone());
            tx.append_history(&entry)?;

            Ok(version)
        })?;

        tracing::info!(version_id = %version.id, version_number = version.version_number, actor = %actor, "version archived");
        Ok(version)
    }

    /// Hard-deletes a draft and its blocks. Its history stays readable.
    pub fn discard_draft(
        &self,
        version_id: &VersionId,
        actor: &ActorId,
        notes: Option<String>,
    ) -> Result<(), PublishError> {
        Self::authorize(actor)?;
        let now = self.clock.now();

        let number = self.commit("discard_draft", |tx| {
            let version = self.load_in_scope(tx, version_id)?;
            version.ensure_draft("discard").or_abort()?;

            if let Some(at) = version.scheduled_publish_at {
                tx.unindex_schedule(&version.id, at)?;
            }
            tx.delete_version(&version.id)?;
            tx.set_slot(&self.scope, SlotKind::Draft, None)?;

            let entry = HistoryEntry::new(tx.next_seq()?, &version, HistoryAction::Discarded, actor, now)
                .set_old_status(VersionStatus::Draft)
                .set_notes(notes.clone());
            tx.append_history(&entry)?;

            Ok(version.version_number)
        })?;

        tracing::info!(version_id = %version_id, version_number = number, actor = %actor, "draft discarded");
        Ok(())
    }

    pub fn active_draft(&self) -> Result<Option<Version>, PublishError> {
        self.store.slot_version(&self.scope, SlotKind::Draft)
    }

    pub fn current_published(&self) -> Result<Option<Version>, PublishError> {
        self.store.slot_version(&self.scope, SlotKind::Published)
    }

    pub fn get(&self, version_id: &VersionId) -> Result<VersionDetail, PublishError> {
        let version = self.read_in_scope(version_id)?;
        let mut blocks = self.store.load_blocks(version_id)?;
        block::sort_for_display(&mut blocks);
        let content_hash = block::fingerprint(&blocks)?;

        Ok(VersionDetail {
            version,
            blocks,
            content_hash,
        })
    }

    /// Every version of the scope, newest first.
    pub fn list_versions(&self) -> Result<Vec<Version>, PublishError> {
        self.store.list_versions(&self.scope)
    }

    pub fn blocks(
        &self,
        version_id: &VersionId,
        section_key: Option<&str>,
        language: Option<&str>,
    ) -> Result<Vec<ContentBlock>, PublishError> {
        self.read_in_scope(version_id)?;
        let mut blocks: Vec<ContentBlock> = self
            .store
            .load_blocks(version_id)?
            .into_iter()
            .filter(|b| section_key.is_none_or(|section| b.section_key == section))
            .filter(|b| language.is_none_or(|lang| b.language.eq_ignore_ascii_case(lang)))
            .collect();
        block::sort_for_display(&mut blocks);
        Ok(blocks)
    }

    pub fn block(&self, version_id: &VersionId, block_id: &BlockId) -> Result<ContentBlock, PublishError> {
        self.read_in_scope(version_id)?;
        self.store
            .load_blocks(version_id)?
            .into_iter()
            .find(|b| &b.id == block_id)
            .ok_or_else(|| PublishError::NotFound(format!("block {block_id}")))
    }

    /// History of one version, newest first. Still answers after the version
    /// was discarded.
    pub fn history(&self, version_id: &VersionId) -> Result<Vec<HistoryEntry>, PublishError> {
        let entries = self.store.history_for(version_id)?;
        if !entries.first().is_some_and(|entry| entry.scope == self.scope) {
            return Err(PublishError::version_not_found(version_id));
        }
        Ok(entries)
    }

    pub fn scope_history(&self) -> Result<Vec<HistoryEntry>, PublishError> {
        self.store.history_for_scope(&self.scope)
    }

    /// History with performer names resolved through the actor directory.
    pub fn history_view(&self, version_id: &VersionId) -> Result<Vec<HistoryLine>, PublishError> {
        let directory = self.actors.as_deref();
        Ok(self
            .history(version_id)?
            .into_iter()
            .map(|entry| HistoryLine::resolve(entry, directory))
            .collect())
    }

    /// Published blocks in `language`, grouped by section.
    pub fn published_content(
        &self,
        section_key: Option<&str>,
        language: &str,
    ) -> Result<Vec<PublishedSection>, PublishError> {
        let Some(published) = self.current_published()? else {
            return Ok(Vec::new());
        };
        let blocks = self.blocks(&published.id, section_key, Some(language))?;
        Ok(group_by_section(blocks))
    }

    /// Published sections whose keys are prefixed `{page_key}.`.
    pub fn published_content_for_page(
        &self,
        page_key: &str,
        language: &str,
    ) -> Result<Vec<PublishedSection>, PublishError> {
        let prefix = format!("{page_key}.");
        let sections = self.published_content(None, language)?;
        Ok(sections
            .into_iter()
            .filter(|section| section.section_key.starts_with(&prefix))
            .collect())
    }
}

fn group_by_section(blocks: Vec<ContentBlock>) -> Vec<PublishedSection> {
    let mut sections: Vec<PublishedSection> = Vec::new();
    for block in blocks {
        match sections.last_mut() {
            Some(section) if section.section_key == block.section_key => section.blocks.push(block),
            _ => sections.push(PublishedSection {
                section_key: block.section_key.clone(),
                blocks: vec![block],
            }),
        }
    }
    sections
}
