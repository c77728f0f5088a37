//! Content blocks owned by a version and the mutations a draft accepts
use super::error::PublishError;
use super::types::BlockId;

pub const DEFAULT_LANGUAGE: &str = "fr";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlockType {
    #[n(0)]
    #[default]
    Text,
    #[n(1)]
    RichText,
    #[n(2)]
    Image,
    #[n(3)]
    Link,
    #[n(4)]
    Json,
    #[n(5)]
    Number,
    #[n(6)]
    Boolean,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::RichText => "rich_text",
            Self::Image => "image",
            Self::Link => "link",
            Self::Json => "json",
            Self::Number => "number",
            Self::Boolean => "boolean",
        }
    }
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a logical block across versions.
///
/// Field order is significant: the derived `Ord` sorts by section, then block
/// key, then language, which is the order diffs are reported in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NaturalKey {
    pub section_key: String,
    pub block_key: String,
    pub language: String,
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.section_key, self.block_key, self.language)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ContentBlock {
    #[n(0)]
    pub id: BlockId,
    #[n(1)]
    pub block_key: String,
    #[n(2)]
    pub section_key: String,
    #[n(3)]
    pub language: String,
    #[n(4)]
    pub block_type: BlockType,
    #[n(5)]
    pub content: String,
    #[n(6)]
    pub sort_order: i32,
    #[n(7)]
    pub metadata: Option<String>,
}

impl ContentBlock {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            section_key: self.section_key.clone(),
            block_key: self.block_key.clone(),
            language: self.language.clone(),
        }
    }

    /// Copy of this block under a fresh id, for a new owning version.
    pub fn duplicate(&self) -> Result<Self, PublishError> {
        Ok(Self {
            id: BlockId::generate()?,
            ..self.clone()
        })
    }
}

/// Builder for a block added to a draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBlock {
    section_key: String,
    block_key: String,
    language: String,
    block_type: BlockType,
    content: String,
    sort_order: i32,
    metadata: Option<String>,
}

impl NewBlock {
    pub fn new(section_key: &str, block_key: &str) -> Self {
        Self {
            section_key: section_key.to_owned(),
            block_key: block_key.to_owned(),
            language: DEFAULT_LANGUAGE.to_owned(),
            block_type: BlockType::default(),
            content: String::new(),
            sort_order: 0,
            metadata: None,
        }
    }
    pub fn set_content(mut self, content: &str) -> Self {
        self.content = content.to_owned();
        self
    }
    pub fn set_language(mut self, language: &str) -> Self {
        self.language = language.to_owned();
        self
    }
    pub fn set_block_type(mut self, block_type: BlockType) -> Self {
        self.block_type = block_type;
        self
    }
    pub fn set_sort_order(mut self, sort_order: i32) -> Self {
        self.sort_order = sort_order;
        self
    }
    pub fn set_metadata(mut self, metadata: &str) -> Self {
        self.metadata = Some(metadata.to_owned());
        self
    }
    pub fn section_key(&self) -> &str {
        &self.section_key
    }

    pub fn validate(&self) -> Result<(), PublishError> {
        if self.section_key.trim().is_empty() {
            return Err(PublishError::InvalidArgument("section key is blank".into()));
        }
        if self.block_key.trim().is_empty() {
            return Err(PublishError::InvalidArgument("block key is blank".into()));
        }
        if self.language.trim().is_empty() {
            return Err(PublishError::InvalidArgument("language is blank".into()));
        }
        Ok(())
    }

    pub fn into_block(self) -> Result<ContentBlock, PublishError> {
        self.validate()?;
        Ok(ContentBlock {
            id: BlockId::generate()?,
            block_key: self.block_key,
            section_key: self.section_key,
            language: self.language,
            block_type: self.block_type,
            content: self.content,
            sort_order: self.sort_order,
            metadata: self.metadata,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockMutation {
    Add(NewBlock),
    /// Replaces content and metadata of an existing block.
    Update {
        block_id: BlockId,
        content: String,
        metadata: Option<String>,
    },
    Remove {
        block_id: BlockId,
    },
    Reorder {
        block_id: BlockId,
        sort_order: i32,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub reordered: usize,
}

impl ChangeSummary {
    pub fn total(&self) -> usize {
        self.added + self.updated + self.removed + self.reordered
    }
}

impl std::fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total = self.total();
        let noun = if total == 1 { "block" } else { "blocks" };
        write!(f, "{total} {noun} changed")?;

        let parts: Vec<String> = [
            (self.added, "added"),
            (self.updated, "updated"),
            (self.removed, "removed"),
            (self.reordered, "reordered"),
        ]
        .into_iter()
        .filter(|(count, _)| *count > 0)
        .map(|(count, label)| format!("{count} {label}"))
        .collect();

        if !parts.is_empty() {
            write!(f, " ({})", parts.join(", "))?;
        }
        Ok(())
    }
}

fn position_of(blocks: &[ContentBlock], block_id: &BlockId) -> Result<usize, PublishError> {
    blocks
        .iter()
        .position(|block| &block.id == block_id)
        .ok_or_else(|| PublishError::NotFound(format!("block {block_id}")))
}

/// Applies `mutations` in order to a copy of `blocks`.
///
/// Either every mutation applies or the error of the first failing one is
/// returned and `blocks` is left untouched.
pub fn apply_mutations(
    blocks: &[ContentBlock],
    mutations: Vec<BlockMutation>,
) -> Result<(Vec<ContentBlock>, ChangeSummary), PublishError> {
    if mutations.is_empty() {
        return Err(PublishError::InvalidArgument(
            "no block mutations supplied".into(),
        ));
    }

    let mut working = blocks.to_vec();
    let mut summary = ChangeSummary::default();

    for mutation in mutations {
        match mutation {
            BlockMutation::Add(new_block) => {
                let block = new_block.into_block()?;
                let key = block.natural_key();
                if working.iter().any(|existing| existing.natural_key() == key) {
                    return Err(PublishError::Conflict(format!("block {key} already exists")));
                }
                working.push(block);
                summary.added += 1;
            }
            BlockMutation::Update {
                block_id,
                content,
                metadata,
            } => {
                let idx = position_of(&working, &block_id)?;
                working[idx].content = content;
                working[idx].metadata = metadata;
                summary.updated += 1;
            }
            BlockMutation::Remove { block_id } => {
                let idx = position_of(&working, &block_id)?;
                working.remove(idx);
                summary.removed += 1;
            }
            BlockMutation::Reorder {
                block_id,
                sort_order,
            } => {
                let idx = position_of(&working, &block_id)?;
                working[idx].sort_order = sort_order;
                summary.reordered += 1;
            }
        }
    }

    sort_for_display(&mut working);
    Ok((working, summary))
}

/// Section, then sort order, then block key.
pub fn sort_for_display(blocks: &mut [ContentBlock]) {
    blocks.sort_by(|a, b| {
        a.section_key
            .cmp(&b.section_key)
            .then(a.sort_order.cmp(&b.sort_order))
            .then_with(|| a.block_key.cmp(&b.block_key))
    });
}

/// sha256 over the natural keys, types, content and metadata of `blocks`.
/// Block ids and ordering do not contribute, so a clone fingerprints the same
/// as its source.
pub fn fingerprint(blocks: &[ContentBlock]) -> Result<String, PublishError> {
    let mut rows: Vec<(&str, &str, &str, &str, &str, Option<&str>)> = blocks
        .iter()
        .map(|block| {
            (
                block.section_key.as_str(),
                block.block_key.as_str(),
                block.language.as_str(),
                block.block_type.as_str(),
                block.content.as_str(),
                block.metadata.as_deref(),
            )
        })
        .collect();
    rows.sort();

    let contents = minicbor::to_vec(&rows).map_err(|err| PublishError::Codec(err.to_string()))?;
    Ok(sha256::digest(&contents))
}
