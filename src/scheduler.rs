//! Scheduled publication
//!
//! Drafts carry an optional publish time, indexed by due time in the store.
//! [`Scheduler::process_due`] is a re-entrant sweep: every due draft is
//! claimed with a lease before it is published, and the publish transaction
//! re-checks that the draft is still scheduled, so concurrent sweepers never
//! publish the same draft twice.
use super::clock::{Clock, SystemClock};
use super::config::{ApprovalPolicy, PublisherConfig};
use super::error::{ErrorKind, PublishError};
use super::history::{HistoryAction, HistoryEntry};
use super::lifecycle::Publisher;
use super::store::{Abortable, DueDraft, VersionStore};
use super::types::{ActorId, TimeStamp, VersionId};
use super::utils;
use super::version::Version;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const SCHEDULED_PUBLISH_NOTE: &str = "Scheduled publishing";

impl Publisher {
    /// Sets or replaces the publish time of a draft.
    pub fn schedule(
        &self,
        version_id: &VersionId,
        publish_at: TimeStamp,
        actor: &ActorId,
        notes: Option<String>,
    ) -> Result<Version, PublishError> {
        Self::authorize(actor)?;
        let now = self.clock.now();

        let version = self.commit("schedule", |tx| {
            let mut version = self.load_in_scope(tx, version_id)?;
            let previous = version.schedule(publish_at, actor, now).or_abort()?;
            if let Some(previous) = previous {
                tx.unindex_schedule(&version.id, previous)?;
            }
            tx.index_schedule(&version, publish_at)?;
            tx.put_version(&version)?;
            tx.set_approval_policy(&self.scope, self.approval)?;

            let entry = HistoryEntry::new(tx.next_seq()?, &version, HistoryAction::Scheduled, actor, now)
                .set_scheduled_publish_at(Some(publish_at))
                .set_notes(notes.clone());
            tx.append_history(&entry)?;

            Ok(version)
        })?;

        tracing::info!(version_id = %version.id, actor = %actor, publish_at = %publish_at, "publication scheduled");
        Ok(version)
    }

    pub fn cancel_schedule(
        &self,
        version_id: &VersionId,
        actor: &ActorId,
        notes: Option<String>,
    ) -> Result<Version, PublishError> {
        Self::authorize(actor)?;
        let now = self.clock.now();

        let version = self.commit("cancel_schedule", |tx| {
            let mut version = self.load_in_scope(tx, version_id)?;
            let previous = version.cancel_schedule(now).or_abort()?;
            tx.unindex_schedule(&version.id, previous)?;
            tx.put_version(&version)?;

            let entry = HistoryEntry::new(
                tx.next_seq()?,
                &version,
                HistoryAction::ScheduleCancelled,
                actor,
                now,
            )
            .set_scheduled_publish_at(Some(previous))
            .set_notes(notes.clone());
            tx.append_history(&entry)?;

            Ok(version)
        })?;

        tracing::info!(version_id = %version.id, actor = %actor, "scheduled publication cancelled");
        Ok(version)
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub published: Vec<VersionId>,
    pub skipped: Vec<SkippedDraft>,
}

impl SweepReport {
    pub fn count(&self) -> usize {
        self.published.len()
    }
}

/// A due draft the sweep left for the next pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDraft {
    pub version_id: VersionId,
    pub kind: ErrorKind,
    pub reason: String,
}

// Pins a sweep's publications to the instant the sweep was asked about.
struct SweepClock(TimeStamp);

impl Clock for SweepClock {
    fn now(&self) -> TimeStamp {
        self.0
    }
}

pub struct Scheduler {
    store: VersionStore,
    /// Fallback for scopes that never recorded a policy.
    approval: ApprovalPolicy,
    claim_ttl: chrono::Duration,
    owner: String,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(store: VersionStore, config: &PublisherConfig) -> Result<Self, PublishError> {
        Ok(Self {
            store,
            approval: config.approval,
            claim_ttl: config.claim_ttl,
            owner: utils::new_uuid_to_bech32(utils::SWEEP_HRP)?,
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Claim owner id of this sweeper.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn now(&self) -> TimeStamp {
        self.clock.now()
    }

    /// Publishes every draft, in any scope, whose schedule elapsed at `now`.
    ///
    /// A draft that cannot be published is logged and skipped; it stays due
    /// and is attempted again by the next sweep.
    pub fn process_due(&self, now: TimeStamp) -> Result<SweepReport, PublishError> {
        let mut report = SweepReport::default();

        for due in self.store.due_drafts(now)? {
            if self.cancel.is_cancelled() {
                tracing::info!(owner = %self.owner, "sweep cancelled");
                break;
            }

            match self.store.try_claim(&due.version_id, &self.owner, now, self.claim_ttl) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(version_id = %due.version_id, "claimed by another sweeper");
                    report.skipped.push(SkippedDraft {
                        version_id: due.version_id,
                        kind: ErrorKind::Conflict,
                        reason: "claimed by another sweeper".into(),
                    });
                    continue;
                }
                Err(err) => {
                    tracing::warn!(version_id = %due.version_id, error = %err, "failed to claim due draft");
                    report.skipped.push(SkippedDraft {
                        version_id: due.version_id,
                        kind: err.kind(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            }

            let outcome = self.publish_due(&due, now);
            if let Err(err) = self.store.release_claim(&due.version_id, &self.owner) {
                tracing::warn!(version_id = %due.version_id, error = %err, "failed to release claim");
            }

            match outcome {
                Ok(version) => report.published.push(version.id),
                Err(err) => {
                    tracing::warn!(
                        version_id = %due.version_id,
                        scope = %due.scope,
                        error = %err,
                        "skipping scheduled draft"
                    );
                    report.skipped.push(SkippedDraft {
                        version_id: due.version_id,
                        kind: err.kind(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    fn publish_due(&self, due: &DueDraft, now: TimeStamp) -> Result<Version, PublishError> {
        let version = self.store.require_version(&due.version_id)?;
        let actor = version
            .scheduled_by
            .clone()
            .unwrap_or_else(|| version.created_by.clone());

        let publisher = Publisher::new(self.store.clone(), due.scope.clone())
            .with_approval_policy(self.approval)
            .with_clock(Arc::new(SweepClock(now)))
            .with_cancellation(self.cancel.clone());

        publisher.publish_version(
            &due.version_id,
            &actor,
            Some(SCHEDULED_PUBLISH_NOTE.into()),
            Some(now),
        )
    }
}

/// Sweeps on a fixed interval until `cancel` fires.
pub async fn run(scheduler: Arc<Scheduler>, interval: std::time::Duration, cancel: CancellationToken) {
    tracing::info!(
        owner = %scheduler.owner(),
        interval_secs = interval.as_secs(),
        "publish sweeper started"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("publish sweeper stopping");
                break;
            }
            _ = ticker.tick() => {
                let worker = Arc::clone(&scheduler);
                let sweep = tokio::task::spawn_blocking(move || {
                    let now = worker.now();
                    worker.process_due(now)
                })
                .await;

                match sweep {
                    Ok(Ok(report)) => {
                        if report.count() > 0 || !report.skipped.is_empty() {
                            tracing::info!(
                                published = report.count(),
                                skipped = report.skipped.len(),
                                "sweep finished"
                            );
                        } else {
                            tracing::debug!("sweep found nothing due");
                        }
                    }
                    Ok(Err(err)) => tracing::error!(error = %err, "sweep failed"),
                    Err(err) => tracing::error!(error = %err, "sweep task did not complete"),
                }
            }
        }
    }
}
