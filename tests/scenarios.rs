use anyhow::Context;
use chrono::Duration;
use content_publisher::block::{BlockMutation, NewBlock};
use content_publisher::clock::{Clock, ManualClock};
use content_publisher::config::{ApprovalPolicy, PublisherConfig};
use content_publisher::diff::BlockDiffStatus;
use content_publisher::history::{ActorDirectory, HistoryAction};
use content_publisher::lifecycle::LiveContentSource;
use content_publisher::types::{ActorId, Scope, TimeStamp};
use content_publisher::version::{ApprovalStatus, VersionStatus};
use content_publisher::{ErrorKind, Publisher, Scheduler, VersionStore};
use std::sync::Arc;

use tempfile::{TempDir, tempdir}; // Use for test db cleanup.

// sled locks its directory, so every test opens its own database under a
// temp dir that is removed on drop.
fn open_store(name: &str) -> anyhow::Result<(TempDir, VersionStore)> {
    let temp_dir = tempdir()?;
    let store = VersionStore::open(temp_dir.path().join(name))?;
    Ok((temp_dir, store))
}

fn start() -> TimeStamp {
    TimeStamp::new_with(2025, 4, 14, 9, 0, 0).expect("valid date")
}

fn author() -> ActorId {
    ActorId::from("user_author")
}

/// Publishes three versions, the last one holding `hero = "Welcome"`.
fn published_v3(publisher: &Publisher) -> anyhow::Result<()> {
    let actor = author();
    for content in ["Bienvenue", "Hello", "Welcome"] {
        let draft = publisher.create_draft(&actor, None)?;
        let mutation = match publisher.blocks(&draft.id, None, None)?.first() {
            Some(hero) => BlockMutation::Update {
                block_id: hero.id.clone(),
                content: content.into(),
                metadata: None,
            },
            None => BlockMutation::Add(NewBlock::new("home.hero", "hero").set_content(content)),
        };
        publisher.update_draft_blocks(&draft.id, &actor, vec![mutation])?;
        publisher.publish(&draft.id, &actor)?;
    }
    Ok(())
}

#[test]
fn scenario_a_edit_then_compare() -> anyhow::Result<()> {
    let (_dir, store) = open_store("scenario_a.db")?;
    let publisher = Publisher::new(store, "site");
    published_v3(&publisher)?;

    let v3 = publisher.current_published()?.context("v3 is published")?;
    assert_eq!(v3.version_number, 3);

    let v4 = publisher.create_draft(&author(), Some("spring refresh".into()))?;
    assert_eq!(v4.version_number, 4);

    let blocks = publisher.blocks(&v4.id, None, None)?;
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].content, "Welcome");
    // clones get their own block ids
    assert_ne!(blocks[0].id, publisher.blocks(&v3.id, None, None)?[0].id);

    let summary = publisher.update_draft_blocks(
        &v4.id,
        &author(),
        vec![BlockMutation::Update {
            block_id: blocks[0].id.clone(),
            content: "Welcome!!".into(),
            metadata: None,
        }],
    )?;
    assert_eq!(summary.to_string(), "1 block changed (1 updated)");

    let diff = publisher.compare(&v4.id, &v3.id, None)?;
    assert_eq!(diff.summary.total_changes, 1);
    assert_eq!(diff.summary.modified, 1);

    let changed: Vec<_> = diff.changes().collect();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].key.block_key, "hero");
    assert_eq!(changed[0].status, BlockDiffStatus::Modified);
    assert_eq!(changed[0].source_content.as_deref(), Some("Welcome!!"));
    assert_eq!(changed[0].target_content.as_deref(), Some("Welcome"));

    let convenience = publisher.draft_vs_published_diff(None)?;
    assert_eq!(convenience.summary, diff.summary);

    Ok(())
}

#[test]
fn scenario_b_scheduled_publication() -> anyhow::Result<()> {
    let (_dir, store) = open_store("scenario_b.db")?;
    let clock = Arc::new(ManualClock::new(start()));
    let publisher = Publisher::new(store.clone(), "site").with_clock(clock.clone());
    published_v3(&publisher)?;
    let v3 = publisher.current_published()?.context("v3 is published")?;
    let v4 = publisher.create_draft(&author(), None)?;

    let now = clock.now();
    publisher.schedule(&v4.id, now.plus(Duration::hours(1)), &author(), None)?;

    let scheduler = Scheduler::new(store, &PublisherConfig::default())?;

    let report = scheduler.process_due(now)?;
    assert_eq!(report.count(), 0);
    let still_draft = publisher.get(&v4.id)?.version;
    assert_eq!(still_draft.status, VersionStatus::Draft);

    let report = scheduler.process_due(now.plus(Duration::hours(2)))?;
    assert_eq!(report.count(), 1);

    let v3 = publisher.get(&v3.id)?.version;
    let v4 = publisher.get(&v4.id)?.version;
    assert_eq!(v3.status, VersionStatus::Archived);
    assert_eq!(v4.status, VersionStatus::Published);
    assert!(v4.scheduled_publish_at.is_none());

    // a second sweep finds nothing left to do
    assert_eq!(scheduler.process_due(now.plus(Duration::hours(3)))?.count(), 0);

    Ok(())
}

#[test]
fn unapproved_due_draft_is_retried_by_the_next_sweep() -> anyhow::Result<()> {
    let (_dir, store) = open_store("sweep_retry.db")?;
    let clock = Arc::new(ManualClock::new(start()));
    let policy = ApprovalPolicy {
        required: true,
        reset_on_edit: true,
    };
    let publisher = Publisher::new(store.clone(), "site")
        .with_clock(clock.clone())
        .with_approval_policy(policy);
    let reviewer = ActorId::from("user_reviewer");

    let draft = publisher.create_draft(&author(), None)?;
    publisher.submit_for_approval(&draft.id, &author(), None)?;
    let due_at = clock.now().plus(Duration::hours(1));
    publisher.schedule(&draft.id, due_at, &author(), None)?;

    let scheduler = Scheduler::new(
        store.clone(),
        &PublisherConfig {
            approval: policy,
            ..PublisherConfig::default()
        },
    )?;

    let report = scheduler.process_due(due_at)?;
    assert_eq!(report.count(), 0);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].kind, ErrorKind::ApprovalRequired);
    assert_eq!(store.due_drafts(due_at)?.len(), 1);
    assert!(store.claim(&draft.id)?.is_none());

    publisher.approve(&draft.id, &reviewer, None)?;
    let report = scheduler.process_due(due_at.plus(Duration::minutes(5)))?;
    assert_eq!(report.published, vec![draft.id.clone()]);
    assert!(report.skipped.is_empty());
    assert_eq!(publisher.get(&draft.id)?.version.status, VersionStatus::Published);
    assert!(store.due_drafts(due_at.plus(Duration::days(1)))?.is_empty());

    Ok(())
}

#[test]
fn scenario_c_approval_gates_publish() -> anyhow::Result<()> {
    let (_dir, store) = open_store("scenario_c.db")?;
    let publisher = Publisher::new(store, "site").with_approval_policy(ApprovalPolicy {
        required: true,
        reset_on_edit: true,
    });
    let reviewer = ActorId::from("user_reviewer");

    let v1 = publisher.create_draft(&author(), None)?;
    let submitted = publisher.submit_for_approval(&v1.id, &author(), None)?;
    assert_eq!(submitted.approval_status, ApprovalStatus::Pending);

    let err = publisher.publish(&v1.id, &author()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ApprovalRequired);
    assert_eq!(publisher.get(&v1.id)?.version.status, VersionStatus::Draft);
    assert_eq!(publisher.history(&v1.id)?.len(), 2);

    publisher.approve(&v1.id, &reviewer, Some("looks good".into()))?;
    let published = publisher.publish(&v1.id, &author())?;
    assert_eq!(published.status, VersionStatus::Published);
    assert_eq!(published.approved_by, Some(reviewer));

    Ok(())
}

#[test]
fn scenario_d_second_draft_conflicts() -> anyhow::Result<()> {
    let (_dir, store) = open_store("scenario_d.db")?;
    let publisher = Publisher::new(store, "site");

    let draft = publisher.create_draft(&author(), Some("first".into()))?;
    let err = publisher
        .create_draft(&ActorId::from("user_other"), Some("second".into()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let active = publisher.active_draft()?.context("draft still present")?;
    assert_eq!(active, draft);
    assert_eq!(publisher.list_versions()?.len(), 1);

    Ok(())
}

#[test]
fn scenario_e_discarded_history_survives() -> anyhow::Result<()> {
    let (_dir, store) = open_store("scenario_e.db")?;
    let publisher = Publisher::new(store, "site");
    published_v3(&publisher)?;

    let v4 = publisher.create_draft(&author(), None)?;
    publisher.submit_for_approval(&v4.id, &author(), None)?;
    publisher.discard_draft(&v4.id, &author(), Some("abandoned".into()))?;

    assert!(publisher.active_draft()?.is_none());
    assert_eq!(publisher.get(&v4.id).unwrap_err().kind(), ErrorKind::NotFound);

    let actions: Vec<HistoryAction> = publisher
        .history(&v4.id)?
        .into_iter()
        .map(|entry| entry.action)
        .collect();
    assert_eq!(
        actions,
        vec![
            HistoryAction::Discarded,
            HistoryAction::SubmittedForApproval,
            HistoryAction::Created,
        ]
    );

    // the discarded number is not handed out again
    let v5 = publisher.create_draft(&author(), None)?;
    assert_eq!(v5.version_number, 5);

    Ok(())
}

#[test]
fn publish_swaps_atomically_and_records_both_sides() -> anyhow::Result<()> {
    let (_dir, store) = open_store("publish_swap.db")?;
    let publisher = Publisher::new(store, "site");

    let v1 = publisher.create_draft(&author(), None)?;
    publisher.publish(&v1.id, &author())?;
    let v2 = publisher.create_draft(&author(), None)?;
    publisher.publish(&v2.id, &author())?;

    let versions = publisher.list_versions()?;
    let statuses: Vec<(u64, VersionStatus)> = versions
        .iter()
        .map(|v| (v.version_number, v.status))
        .collect();
    assert_eq!(
        statuses,
        vec![(2, VersionStatus::Published), (1, VersionStatus::Archived)]
    );

    let v1_latest = &publisher.history(&v1.id)?[0];
    assert_eq!(v1_latest.action, HistoryAction::Archived);
    assert_eq!(v1_latest.notes.as_deref(), Some("Superseded by version 2"));
    assert_eq!(v1_latest.old_status, Some(VersionStatus::Published));

    let err = publisher.publish(&v2.id, &author()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    Ok(())
}

#[test]
fn archived_versions_reject_everything() -> anyhow::Result<()> {
    let (_dir, store) = open_store("archived.db")?;
    let publisher = Publisher::new(store, "site");
    let draft = publisher.create_draft(&author(), None)?;
    publisher.archive(&draft.id, &author(), Some("never shipping".into()))?;

    assert!(publisher.active_draft()?.is_none());
    for err in [
        publisher.publish(&draft.id, &author()).unwrap_err(),
        publisher.archive(&draft.id, &author(), None).unwrap_err(),
        publisher
            .update_draft_blocks(
                &draft.id,
                &author(),
                vec![BlockMutation::Add(NewBlock::new("home.hero", "hero"))],
            )
            .unwrap_err(),
        publisher.discard_draft(&draft.id, &author(), None).unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    Ok(())
}

#[test]
fn restore_clones_archived_content() -> anyhow::Result<()> {
    let (_dir, store) = open_store("restore.db")?;
    let publisher = Publisher::new(store, "site");
    published_v3(&publisher)?;

    let v2 = publisher
        .list_versions()?
        .into_iter()
        .find(|v| v.version_number == 2)
        .context("v2 exists")?;
    let v3 = publisher.current_published()?.context("v3 is published")?;

    let err = publisher.restore_version(&v3.id, &author(), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let restored = publisher.restore_version(&v2.id, &author(), None)?;
    assert_eq!(restored.version_number, 4);
    assert_eq!(restored.restored_from, Some(v2.id.clone()));
    assert_eq!(restored.notes.as_deref(), Some("Restored from version 2"));
    assert_eq!(publisher.blocks(&restored.id, None, None)?[0].content, "Hello");
    assert_eq!(
        publisher.get(&restored.id)?.content_hash,
        publisher.get(&v2.id)?.content_hash
    );

    let err = publisher.restore_version(&v2.id, &author(), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    Ok(())
}

#[test]
fn editing_an_approved_draft_resets_approval() -> anyhow::Result<()> {
    let (_dir, store) = open_store("approval_reset.db")?;
    let publisher = Publisher::new(store, "site").with_approval_policy(ApprovalPolicy {
        required: true,
        reset_on_edit: true,
    });
    let reviewer = ActorId::from("user_reviewer");

    let draft = publisher.create_draft(&author(), None)?;
    publisher.submit_for_approval(&draft.id, &author(), None)?;
    publisher.approve(&draft.id, &reviewer, None)?;
    publisher.update_draft_blocks(
        &draft.id,
        &author(),
        vec![BlockMutation::Add(NewBlock::new("home.hero", "hero").set_content("late edit"))],
    )?;

    let version = publisher.get(&draft.id)?.version;
    assert_eq!(version.approval_status, ApprovalStatus::None);
    let modified = &publisher.history(&draft.id)?[0];
    assert_eq!(modified.old_approval_status, Some(ApprovalStatus::Approved));
    assert_eq!(
        publisher.publish(&draft.id, &author()).unwrap_err().kind(),
        ErrorKind::ApprovalRequired
    );

    Ok(())
}

struct StaticSite;

impl LiveContentSource for StaticSite {
    fn load(&self, _scope: &Scope) -> anyhow::Result<Vec<NewBlock>> {
        Ok(vec![
            NewBlock::new("home.hero", "title").set_content("Plan your business"),
            NewBlock::new("home.hero", "title")
                .set_language("en")
                .set_content("Plan your business"),
            NewBlock::new("about.team", "intro").set_content("Who we are"),
        ])
    }
}

#[test]
fn first_draft_bootstraps_from_live_content() -> anyhow::Result<()> {
    let (_dir, store) = open_store("bootstrap.db")?;
    let publisher = Publisher::new(store, "site").with_live_source(Arc::new(StaticSite));

    let v1 = publisher.create_draft(&author(), None)?;
    assert_eq!(publisher.blocks(&v1.id, None, None)?.len(), 3);
    publisher.publish(&v1.id, &author())?;

    let home = publisher.published_content_for_page("home", "fr")?;
    assert_eq!(home.len(), 1);
    assert_eq!(home[0].section_key, "home.hero");
    assert_eq!(home[0].blocks[0].content, "Plan your business");

    let everything = publisher.published_content(None, "FR")?;
    assert_eq!(everything.len(), 2);

    // later drafts clone the published version, not the live source
    let v2 = publisher.create_draft(&author(), None)?;
    let summary = publisher.update_draft_blocks(
        &v2.id,
        &author(),
        vec![BlockMutation::Remove {
            block_id: publisher.blocks(&v2.id, Some("about.team"), None)?[0].id.clone(),
        }],
    )?;
    assert_eq!(summary.removed, 1);
    assert_eq!(publisher.draft_vs_published_diff(Some("fr"))?.summary.removed, 1);

    Ok(())
}

#[test]
fn live_content_is_not_reimported_after_archive() -> anyhow::Result<()> {
    let (_dir, store) = open_store("bootstrap_once.db")?;
    let publisher = Publisher::new(store, "site").with_live_source(Arc::new(StaticSite));

    let v1 = publisher.create_draft(&author(), None)?;
    let intro = publisher.blocks(&v1.id, Some("about.team"), None)?[0].id.clone();
    publisher.update_draft_blocks(
        &v1.id,
        &author(),
        vec![BlockMutation::Update {
            block_id: intro,
            content: "Our team".into(),
            metadata: None,
        }],
    )?;
    publisher.publish(&v1.id, &author())?;
    publisher.archive(&v1.id, &author(), None)?;
    assert!(publisher.current_published()?.is_none());

    let v2 = publisher.create_draft(&author(), None)?;
    assert!(publisher.blocks(&v2.id, None, None)?.is_empty());

    // the archived content is still reachable through restore
    publisher.discard_draft(&v2.id, &author(), None)?;
    let v3 = publisher.restore_version(&v1.id, &author(), None)?;
    let restored = publisher.blocks(&v3.id, Some("about.team"), None)?;
    assert_eq!(restored[0].content, "Our team");

    Ok(())
}

struct Staff;

impl ActorDirectory for Staff {
    fn display_name(&self, actor: &ActorId) -> Option<String> {
        (actor.as_str() == "user_author").then(|| "Alex Martin".to_owned())
    }
}

#[test]
fn history_view_resolves_names() -> anyhow::Result<()> {
    let (_dir, store) = open_store("history_view.db")?;
    let publisher = Publisher::new(store, "site").with_actor_directory(Arc::new(Staff));

    let draft = publisher.create_draft(&author(), None)?;
    publisher.submit_for_approval(&draft.id, &ActorId::from("user_unknown"), None)?;

    let lines = publisher.history_view(&draft.id)?;
    assert_eq!(lines[0].performer(), "user_unknown");
    assert_eq!(lines[1].performer(), "Alex Martin");
    assert!(lines[1].to_string().contains("created by Alex Martin"));
    assert_eq!(publisher.scope_history()?.len(), 2);

    Ok(())
}

#[test]
fn racing_create_draft_yields_one_draft() -> anyhow::Result<()> {
    let (_dir, store) = open_store("race.db")?;
    let publisher = Publisher::new(store, "site");

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let publisher = publisher.clone();
                s.spawn(move || publisher.create_draft(&ActorId::from(format!("user_{i}")), None))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("thread finished"))
            .collect()
    });

    let created = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(created, 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|err| err.kind() == ErrorKind::Conflict)
    );
    assert_eq!(publisher.list_versions()?.len(), 1);

    Ok(())
}
