//! Block-by-block comparison of two versions
//!
//! Blocks are matched across versions by their [`NaturalKey`]. The source is
//! treated as the newer side: a key only in the source is `Added`, a key only
//! in the target is `Removed`. Output is ordered by section, block key and
//! language.
use super::block::{BlockType, ContentBlock, NaturalKey};
use super::error::PublishError;
use super::lifecycle::Publisher;
use super::types::{BlockId, VersionId};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockDiffStatus {
    Added,
    Removed,
    Modified,
    Unchanged,
}

impl BlockDiffStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Removed => "removed",
            Self::Modified => "modified",
            Self::Unchanged => "unchanged",
        }
    }
}

impl std::fmt::Display for BlockDiffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDiff {
    pub key: NaturalKey,
    pub block_type: BlockType,
    pub status: BlockDiffStatus,
    pub source_content: Option<String>,
    pub target_content: Option<String>,
    pub source_metadata: Option<String>,
    pub target_metadata: Option<String>,
    pub source_block_id: Option<BlockId>,
    pub target_block_id: Option<BlockId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub total_changes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDiff {
    pub source_version_id: VersionId,
    pub source_version_number: u64,
    pub target_version_id: VersionId,
    pub target_version_number: u64,
    pub blocks: Vec<BlockDiff>,
    pub summary: DiffSummary,
}

impl VersionDiff {
    pub fn changes(&self) -> impl Iterator<Item = &BlockDiff> {
        self.blocks
            .iter()
            .filter(|diff| diff.status != BlockDiffStatus::Unchanged)
    }
}

fn index<'a>(blocks: &'a [ContentBlock], language: Option<&str>) -> BTreeMap<NaturalKey, &'a ContentBlock> {
    blocks
        .iter()
        .filter(|block| language.is_none_or(|lang| block.language.eq_ignore_ascii_case(lang)))
        .map(|block| (block.natural_key(), block))
        .collect()
}

/// Classifies every natural key present in either side.
///
/// Content is compared byte for byte; metadata participates only when
/// `track_metadata` is set.
pub fn compare_blocks(
    source: &[ContentBlock],
    target: &[ContentBlock],
    language: Option<&str>,
    track_metadata: bool,
) -> (Vec<BlockDiff>, DiffSummary) {
    let source = index(source, language);
    let target = index(target, language);
    let keys: BTreeSet<&NaturalKey> = source.keys().chain(target.keys()).collect();

    let mut summary = DiffSummary::default();
    let mut diffs = Vec::with_capacity(keys.len());

    for key in keys {
        let (src, tgt) = (source.get(key).copied(), target.get(key).copied());
        let status = match (src, tgt) {
            (Some(_), None) => BlockDiffStatus::Added,
            (None, Some(_)) => BlockDiffStatus::Removed,
            (Some(s), Some(t)) => {
                let same = s.content == t.content && (!track_metadata || s.metadata == t.metadata);
                if same {
                    BlockDiffStatus::Unchanged
                } else {
                    BlockDiffStatus::Modified
                }
            }
            (None, None) => continue,
        };

        match status {
            BlockDiffStatus::Added => summary.added += 1,
            BlockDiffStatus::Removed => summary.removed += 1,
            BlockDiffStatus::Modified => summary.modified += 1,
            BlockDiffStatus::Unchanged => summary.unchanged += 1,
        }

        let block_type = src.or(tgt).map(|b| b.block_type).unwrap_or_default();
        diffs.push(BlockDiff {
            key: key.clone(),
            block_type,
            status,
            source_content: src.map(|b| b.content.clone()),
            target_content: tgt.map(|b| b.content.clone()),
            source_metadata: src.and_then(|b| b.metadata.clone()),
            target_metadata: tgt.and_then(|b| b.metadata.clone()),
            source_block_id: src.map(|b| b.id.clone()),
            target_block_id: tgt.map(|b| b.id.clone()),
        });
    }

    summary.total_changes = summary.added + summary.removed + summary.modified;
    (diffs, summary)
}

impl Publisher {
    pub fn compare(
        &self,
        source_id: &VersionId,
        target_id: &VersionId,
        language: Option<&str>,
    ) -> Result<VersionDiff, PublishError> {
        let source = self.get(source_id)?;
        let target = self.get(target_id)?;
        let (blocks, summary) =
            compare_blocks(&source.blocks, &target.blocks, language, self.track_metadata);

        tracing::debug!(
            source = source.version.version_number,
            target = target.version.version_number,
            changes = summary.total_changes,
            "versions compared"
        );

        Ok(VersionDiff {
            source_version_id: source.version.id,
            source_version_number: source.version.version_number,
            target_version_id: target.version.id,
            target_version_number: target.version.version_number,
            blocks,
            summary,
        })
    }

    /// Current draft against current published version.
    pub fn draft_vs_published_diff(&self, language: Option<&str>) -> Result<VersionDiff, PublishError> {
        let draft = self
            .active_draft()?
            .ok_or_else(|| PublishError::NotFound(format!("draft in scope {}", self.scope())))?;
        let published = self.current_published()?.ok_or_else(|| {
            PublishError::NotFound(format!("published version in scope {}", self.scope()))
        })?;

        self.compare(&draft.id, &published.id, language)
    }
}
