//! Runtime configuration and the injected section registry
use super::block::BlockMutation;
use super::error::PublishError;
use anyhow::Context;
use std::path::PathBuf;

/// Scope-level approval switch.
///
/// Recorded in the store for its scope when a draft is created or scheduled,
/// so scheduled publishing honours the same gate as a manual publish.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalPolicy {
    /// Publishing requires `ApprovalStatus::Approved`.
    #[n(0)]
    pub required: bool,
    /// Editing an approved draft returns it to `ApprovalStatus::None`.
    #[n(1)]
    pub reset_on_edit: bool,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            required: false,
            reset_on_edit: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub db_path: PathBuf,
    pub scope: String,
    pub approval: ApprovalPolicy,
    /// Metadata differences count as modifications in diffs.
    pub diff_track_metadata: bool,
    pub sweep_interval: std::time::Duration,
    /// Lease length of a scheduler claim on a due draft.
    pub claim_ttl: chrono::Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("publisher.db"),
            scope: "site".into(),
            approval: ApprovalPolicy::default(),
            diff_track_metadata: true,
            sweep_interval: std::time::Duration::from_secs(60),
            claim_ttl: chrono::Duration::seconds(300),
        }
    }
}

impl PublisherConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                            | Default        |
    /// |------------------------------------|----------------|
    /// | `PUBLISHER_DB_PATH`                | `publisher.db` |
    /// | `PUBLISHER_SCOPE`                  | `site`         |
    /// | `PUBLISHER_REQUIRE_APPROVAL`       | `false`        |
    /// | `PUBLISHER_RESET_APPROVAL_ON_EDIT` | `true`         |
    /// | `PUBLISHER_DIFF_TRACK_METADATA`    | `true`         |
    /// | `PUBLISHER_SWEEP_INTERVAL_SECS`    | `60`           |
    /// | `PUBLISHER_CLAIM_TTL_SECS`         | `300`          |
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let db_path = lookup("PUBLISHER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let scope = lookup("PUBLISHER_SCOPE").unwrap_or(defaults.scope);
        if scope.trim().is_empty() {
            anyhow::bail!("PUBLISHER_SCOPE must not be blank");
        }

        let required = parse_or(&lookup, "PUBLISHER_REQUIRE_APPROVAL", defaults.approval.required)?;
        let reset_on_edit = parse_or(
            &lookup,
            "PUBLISHER_RESET_APPROVAL_ON_EDIT",
            defaults.approval.reset_on_edit,
        )?;
        let diff_track_metadata = parse_or(
            &lookup,
            "PUBLISHER_DIFF_TRACK_METADATA",
            defaults.diff_track_metadata,
        )?;
        let sweep_interval_secs: u64 = parse_or(&lookup, "PUBLISHER_SWEEP_INTERVAL_SECS", 60)?;
        if sweep_interval_secs == 0 {
            anyhow::bail!("PUBLISHER_SWEEP_INTERVAL_SECS must be greater than zero");
        }
        let claim_ttl_secs: i64 = parse_or(&lookup, "PUBLISHER_CLAIM_TTL_SECS", 300)?;
        if claim_ttl_secs <= 0 {
            anyhow::bail!("PUBLISHER_CLAIM_TTL_SECS must be greater than zero");
        }

        Ok(Self {
            db_path,
            scope,
            approval: ApprovalPolicy {
                required,
                reset_on_edit,
            },
            diff_track_metadata,
            sweep_interval: std::time::Duration::from_secs(sweep_interval_secs),
            claim_ttl: chrono::Duration::seconds(claim_ttl_secs),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        None => Ok(default),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDefinition {
    pub key: String,
    pub label: String,
    pub sort_order: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDefinition {
    pub key: String,
    pub label: String,
    pub sections: Vec<SectionDefinition>,
}

/// Known pages and the sections blocks may be placed in.
///
/// Owned by the caller and checked at the API boundary before mutations reach
/// a `Publisher`.
#[derive(Debug, Clone, Default)]
pub struct SectionRegistry {
    pages: Vec<PageDefinition>,
}

impl SectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, key: &str, label: &str, sections: &[(&str, &str)]) -> Self {
        let sections = sections
            .iter()
            .zip(0..)
            .map(|((key, label), sort_order)| SectionDefinition {
                key: (*key).to_owned(),
                label: (*label).to_owned(),
                sort_order,
            })
            .collect();
        self.pages.push(PageDefinition {
            key: key.to_owned(),
            label: label.to_owned(),
            sections,
        });
        self
    }

    pub fn pages(&self) -> &[PageDefinition] {
        &self.pages
    }

    pub fn page_sections(&self, page_key: &str) -> Option<&[SectionDefinition]> {
        self.pages
            .iter()
            .find(|page| page.key == page_key)
            .map(|page| page.sections.as_slice())
    }

    pub fn section(&self, section_key: &str) -> Option<&SectionDefinition> {
        self.pages
            .iter()
            .flat_map(|page| page.sections.iter())
            .find(|section| section.key == section_key)
    }

    /// Rejects additions that target a section this registry does not know.
    pub fn validate(&self, mutations: &[BlockMutation]) -> Result<(), PublishError> {
        for mutation in mutations {
            if let BlockMutation::Add(new_block) = mutation {
                if self.section(new_block.section_key()).is_none() {
                    return Err(PublishError::InvalidArgument(format!(
                        "unknown section {}",
                        new_block.section_key()
                    )));
                }
            }
        }
        Ok(())
    }
}
