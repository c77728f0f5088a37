//! sled-backed version store
//!
//! Layout:
//! - `versions`: version id -> `Version`
//! - `blocks`:   version id -> `Vec<ContentBlock>`
//! - `history`:  version id ‖ `/` ‖ seq (be) -> `HistoryEntry`
//! - `slots`:    scope ‖ 0 ‖ `draft` | `published` -> version id
//! - `schedule`: due time (be, sign-flipped) ‖ version id -> scope
//! - `meta`:     scope ‖ 0 ‖ `version_counter` -> u64 (be)
//!               scope ‖ 0 ‖ `approval_policy` -> `ApprovalPolicy`
//!               scope ‖ 0 ‖ `published_once` -> empty
//!               `history_seq` -> u64 (be)
//! - `claims`:   version id -> `Claim`
//!
//! Everything but `claims` is written through [`VersionStore::transact`], so a
//! state change, its block writes and its history entries commit together or
//! not at all.
use super::block::ContentBlock;
use super::config::ApprovalPolicy;
use super::error::PublishError;
use super::history::HistoryEntry;
use super::types::{Scope, TimeStamp, VersionId};
use super::version::Version;
use chrono::DateTime;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree};
use sled::{Db, IVec, Transactional, Tree};
use std::path::Path;
use std::sync::Arc;

pub type TxResult<T> = ConflictableTransactionResult<T, PublishError>;

const HISTORY_SEQ_KEY: &[u8] = b"history_seq";

/// Moves a `PublishError` into the transaction's abort channel.
pub trait Abortable<T> {
    fn or_abort(self) -> TxResult<T>;
}

impl<T> Abortable<T> for Result<T, PublishError> {
    fn or_abort(self) -> TxResult<T> {
        self.map_err(ConflictableTransactionError::Abort)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Draft,
    Published,
}

impl SlotKind {
    fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Draft => b"draft",
            Self::Published => b"published",
        }
    }
}

/// Lease a sweeper holds on a due draft while publishing it.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    #[n(0)]
    pub owner: String,
    #[n(1)]
    pub expires_at: TimeStamp,
}

/// A draft whose scheduled publication time has elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueDraft {
    pub version_id: VersionId,
    pub scope: Scope,
    pub publish_at: TimeStamp,
}

#[derive(Clone)]
pub struct VersionStore {
    db: Arc<Db>,
    versions: Tree,
    blocks: Tree,
    history: Tree,
    slots: Tree,
    schedule: Tree,
    meta: Tree,
    claims: Tree,
}

fn encode<T: minicbor::Encode<()> + ?Sized>(value: &T) -> Result<Vec<u8>, PublishError> {
    minicbor::to_vec(value).map_err(|err| PublishError::Codec(err.to_string()))
}

fn decode<'b, T: minicbor::Decode<'b, ()>>(bytes: &'b [u8]) -> Result<T, PublishError> {
    minicbor::decode(bytes).map_err(|err| PublishError::Codec(err.to_string()))
}

fn slot_key(scope: &Scope, kind: SlotKind) -> Vec<u8> {
    [scope.as_bytes(), &[0u8][..], kind.as_bytes()].concat()
}

fn scope_meta_key(scope: &Scope, name: &[u8]) -> Vec<u8> {
    [scope.as_bytes(), &[0u8][..], name].concat()
}

fn history_prefix(version_id: &VersionId) -> Vec<u8> {
    [version_id.as_bytes(), &b"/"[..]].concat()
}

fn history_key(version_id: &VersionId, seq: u64) -> Vec<u8> {
    [history_prefix(version_id).as_slice(), seq.to_be_bytes().as_slice()].concat()
}

// Flipping the sign bit makes big-endian bytes sort like the signed value.
fn due_key(at: TimeStamp, version_id: &VersionId) -> Vec<u8> {
    let ordered = (at.nanos() as u64) ^ (1 << 63);
    [ordered.to_be_bytes().as_slice(), version_id.as_bytes()].concat()
}

fn parse_due_key(key: &[u8]) -> Result<(TimeStamp, VersionId), PublishError> {
    let (time, id) = key
        .split_at_checked(8)
        .ok_or_else(|| PublishError::Codec("schedule key is too short".into()))?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(time);
    let nanos = (u64::from_be_bytes(raw) ^ (1 << 63)) as i64;
    let id = std::str::from_utf8(id).map_err(|err| PublishError::Codec(err.to_string()))?;

    Ok((
        TimeStamp::from(DateTime::from_timestamp_nanos(nanos)),
        VersionId::from(id),
    ))
}

fn parse_id(bytes: &[u8]) -> Result<VersionId, PublishError> {
    std::str::from_utf8(bytes)
        .map(VersionId::from)
        .map_err(|err| PublishError::Codec(err.to_string()))
}

impl VersionStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PublishError> {
        let db = sled::open(path)?;
        Self::new(Arc::new(db))
    }

    pub fn new(db: Arc<Db>) -> Result<Self, PublishError> {
        Ok(Self {
            versions: db.open_tree("versions")?,
            blocks: db.open_tree("blocks")?,
            history: db.open_tree("history")?,
            slots: db.open_tree("slots")?,
            schedule: db.open_tree("schedule")?,
            meta: db.open_tree("meta")?,
            claims: db.open_tree("claims")?,
            db,
        })
    }

    /// Runs `f` as one transaction over every tree except `claims`.
    ///
    /// sled may run `f` more than once on conflict; only the attempt that
    /// commits has any effect. Returning an error aborts with zero writes.
    pub fn transact<T, F>(&self, f: F) -> Result<T, PublishError>
    where
        F: Fn(&StoreTx<'_>) -> TxResult<T>,
    {
        let trees = (
            &self.versions,
            &self.blocks,
            &self.history,
            &self.slots,
            &self.schedule,
            &self.meta,
        );
        let result = trees.transaction(|(versions, blocks, history, slots, schedule, meta)| {
            let tx = StoreTx {
                versions,
                blocks,
                history,
                slots,
                schedule,
                meta,
            };
            f(&tx)
        });

        Ok(result?)
    }

    pub fn flush(&self) -> Result<(), PublishError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn get_version(&self, id: &VersionId) -> Result<Option<Version>, PublishError> {
        self.versions
            .get(id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn require_version(&self, id: &VersionId) -> Result<Version, PublishError> {
        self.get_version(id)?
            .ok_or_else(|| PublishError::version_not_found(id))
    }

    pub fn load_blocks(&self, id: &VersionId) -> Result<Vec<ContentBlock>, PublishError> {
        match self.blocks.get(id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Ok(Vec::new()),
        }
    }

    pub fn slot(&self, scope: &Scope, kind: SlotKind) -> Result<Option<VersionId>, PublishError> {
        self.slots
            .get(slot_key(scope, kind))?
            .map(|bytes| parse_id(&bytes))
            .transpose()
    }

    /// True once any version of `scope` has been published.
    pub fn has_published(&self, scope: &Scope) -> Result<bool, PublishError> {
        Ok(self.meta.contains_key(scope_meta_key(scope, b"published_once"))?)
    }

    pub fn slot_version(&self, scope: &Scope, kind: SlotKind) -> Result<Option<Version>, PublishError> {
        match self.slot(scope, kind)? {
            Some(id) => self.get_version(&id),
            None => Ok(None),
        }
    }

    /// All versions of `scope`, newest first.
    pub fn list_versions(&self, scope: &Scope) -> Result<Vec<Version>, PublishError> {
        let mut versions = Vec::new();
        for item in self.versions.iter() {
            let (_, bytes) = item?;
            let version: Version = decode(&bytes)?;
            if &version.scope == scope {
                versions.push(version);
            }
        }
        versions.sort_by(|a, b| b.version_number.cmp(&a.version_number));
        Ok(versions)
    }

    /// History of one version, newest first. Survives a discarded draft.
    pub fn history_for(&self, id: &VersionId) -> Result<Vec<HistoryEntry>, PublishError> {
        let mut entries = Vec::new();
        for item in self.history.scan_prefix(history_prefix(id)) {
            let (_, bytes) = item?;
            entries.push(decode::<HistoryEntry>(&bytes)?);
        }
        entries.reverse();
        Ok(entries)
    }

    /// History of every version in `scope`, newest first.
    pub fn history_for_scope(&self, scope: &Scope) -> Result<Vec<HistoryEntry>, PublishError> {
        let mut entries = Vec::new();
        for item in self.history.iter() {
            let (_, bytes) = item?;
            let entry: HistoryEntry = decode(&bytes)?;
            if &entry.scope == scope {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        Ok(entries)
    }

    /// Drafts in any scope whose publish time is at or before `now`, oldest
    /// due first.
    pub fn due_drafts(&self, now: TimeStamp) -> Result<Vec<DueDraft>, PublishError> {
        let mut due = Vec::new();
        for item in self.schedule.iter() {
            let (key, scope) = item?;
            let (publish_at, version_id) = parse_due_key(&key)?;
            if publish_at > now {
                break;
            }
            let scope = std::str::from_utf8(&scope)
                .map_err(|err| PublishError::Codec(err.to_string()))?;
            due.push(DueDraft {
                version_id,
                scope: Scope::from(scope),
                publish_at,
            });
        }
        Ok(due)
    }

    /// Takes the claim on `version_id` for `owner` unless another owner holds
    /// an unexpired one. Re-claiming an own claim extends it.
    pub fn try_claim(
        &self,
        version_id: &VersionId,
        owner: &str,
        now: TimeStamp,
        ttl: chrono::Duration,
    ) -> Result<bool, PublishError> {
        let claim = Claim {
            owner: owner.to_owned(),
            expires_at: now.plus(ttl),
        };
        let encoded = encode(&claim)?;

        loop {
            let current = self.claims.get(version_id.as_bytes())?;
            if let Some(bytes) = &current {
                let held: Claim = decode(bytes)?;
                if held.owner != owner && held.expires_at > now {
                    return Ok(false);
                }
            }

            match self.claims.compare_and_swap(
                version_id.as_bytes(),
                current,
                Some(encoded.clone()),
            )? {
                Ok(()) => return Ok(true),
                Err(_) => continue,
            }
        }
    }

    pub fn release_claim(&self, version_id: &VersionId, owner: &str) -> Result<(), PublishError> {
        let Some(current) = self.claims.get(version_id.as_bytes())? else {
            return Ok(());
        };
        let held: Claim = decode(&current)?;
        if held.owner == owner {
            // lost races mean someone else took over; nothing to release
            let _ = self
                .claims
                .compare_and_swap(version_id.as_bytes(), Some(current), None::<IVec>)?;
        }
        Ok(())
    }

    pub fn claim(&self, version_id: &VersionId) -> Result<Option<Claim>, PublishError> {
        self.claims
            .get(version_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }
}

/// Transactional view handed to [`VersionStore::transact`] closures.
pub struct StoreTx<'a> {
    versions: &'a TransactionalTree,
    blocks: &'a TransactionalTree,
    history: &'a TransactionalTree,
    slots: &'a TransactionalTree,
    schedule: &'a TransactionalTree,
    meta: &'a TransactionalTree,
}

impl StoreTx<'_> {
    pub fn version(&self, id: &VersionId) -> TxResult<Option<Version>> {
        match self.versions.get(id.as_bytes())? {
            Some(bytes) => decode(&bytes).map(Some).or_abort(),
            None => Ok(None),
        }
    }

    pub fn require_version(&self, id: &VersionId) -> TxResult<Version> {
        match self.version(id)? {
            Some(version) => Ok(version),
            None => sled::transaction::abort(PublishError::version_not_found(id)),
        }
    }

    pub fn put_version(&self, version: &Version) -> TxResult<()> {
        let bytes = encode(version).or_abort()?;
        self.versions.insert(version.id.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn delete_version(&self, id: &VersionId) -> TxResult<()> {
        self.versions.remove(id.as_bytes())?;
        self.blocks.remove(id.as_bytes())?;
        Ok(())
    }

    pub fn blocks(&self, id: &VersionId) -> TxResult<Vec<ContentBlock>> {
        match self.blocks.get(id.as_bytes())? {
            Some(bytes) => decode(&bytes).or_abort(),
            None => Ok(Vec::new()),
        }
    }

    pub fn put_blocks(&self, id: &VersionId, blocks: &[ContentBlock]) -> TxResult<()> {
        let bytes = encode(blocks).or_abort()?;
        self.blocks.insert(id.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn slot(&self, scope: &Scope, kind: SlotKind) -> TxResult<Option<VersionId>> {
        match self.slots.get(slot_key(scope, kind))? {
            Some(bytes) => parse_id(&bytes).map(Some).or_abort(),
            None => Ok(None),
        }
    }

    pub fn set_slot(&self, scope: &Scope, kind: SlotKind, id: Option<&VersionId>) -> TxResult<()> {
        match id {
            Some(id) => {
                self.slots.insert(slot_key(scope, kind), id.as_bytes())?;
            }
            None => {
                self.slots.remove(slot_key(scope, kind))?;
            }
        }
        Ok(())
    }

    /// Next version number for `scope`. Numbers are never reused, even when
    /// the draft that took one is discarded.
    pub fn next_version_number(&self, scope: &Scope) -> TxResult<u64> {
        self.bump_counter(scope_meta_key(scope, b"version_counter"))
    }

    /// Store-wide history sequence. Taken inside the transaction, so
    /// newest-first order matches commit order.
    pub fn next_seq(&self) -> TxResult<u64> {
        self.bump_counter(HISTORY_SEQ_KEY.to_vec())
    }

    fn bump_counter(&self, key: Vec<u8>) -> TxResult<u64> {
        let current = match self.meta.get(&key)? {
            Some(bytes) => {
                let raw = <[u8; 8]>::try_from(&bytes[..]).map_err(|_| {
                    ConflictableTransactionError::Abort(PublishError::Codec(
                        "counter is not 8 bytes".into(),
                    ))
                })?;
                u64::from_be_bytes(raw)
            }
            None => 0,
        };
        let next = current + 1;
        self.meta.insert(key, next.to_be_bytes().to_vec())?;
        Ok(next)
    }

    /// Approval policy last recorded for `scope` by a publisher.
    pub fn approval_policy(&self, scope: &Scope) -> TxResult<Option<ApprovalPolicy>> {
        match self.meta.get(scope_meta_key(scope, b"approval_policy"))? {
            Some(bytes) => decode(&bytes).map(Some).or_abort(),
            None => Ok(None),
        }
    }

    pub fn set_approval_policy(&self, scope: &Scope, policy: ApprovalPolicy) -> TxResult<()> {
        let bytes = encode(&policy).or_abort()?;
        self.meta
            .insert(scope_meta_key(scope, b"approval_policy"), bytes)?;
        Ok(())
    }

    pub fn has_published(&self, scope: &Scope) -> TxResult<bool> {
        Ok(self
            .meta
            .get(scope_meta_key(scope, b"published_once"))?
            .is_some())
    }

    pub fn mark_published(&self, scope: &Scope) -> TxResult<()> {
        self.meta
            .insert(scope_meta_key(scope, b"published_once"), Vec::new())?;
        Ok(())
    }

    pub fn append_history(&self, entry: &HistoryEntry) -> TxResult<()> {
        let bytes = encode(entry).or_abort()?;
        self.history
            .insert(history_key(&entry.version_id, entry.seq), bytes)?;
        Ok(())
    }

    pub fn index_schedule(&self, version: &Version, at: TimeStamp) -> TxResult<()> {
        self.schedule
            .insert(due_key(at, &version.id), version.scope.as_bytes())?;
        Ok(())
    }

    pub fn unindex_schedule(&self, id: &VersionId, at: TimeStamp) -> TxResult<()> {
        self.schedule.remove(due_key(at, id))?;
        Ok(())
    }
}
