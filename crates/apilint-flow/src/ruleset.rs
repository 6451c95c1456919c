//! Ruleset catalogue types and the linter selection policy.
//!
//! A ruleset is a linter-specific rule file plus metadata. At most one
//! ruleset per (api type, linter) pair is active at any instant; selection
//! maps a document's api type to the linter that handles it and the active
//! ruleset to lint with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use apilint_core::RulesetId;

use crate::error::{Error, Result};
use crate::store::TaskStore;

/// Api types the pipeline can lint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiType {
    /// OpenAPI 2.0 (Swagger).
    #[serde(rename = "openapi-2-0")]
    OpenApi20,
    /// OpenAPI 3.0.
    #[serde(rename = "openapi-3-0")]
    OpenApi30,
    /// OpenAPI 3.1.
    #[serde(rename = "openapi-3-1")]
    OpenApi31,
}

impl ApiType {
    /// Parses a hub api-type string; `None` for unsupported types.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "openapi-2-0" => Some(Self::OpenApi20),
            "openapi-3-0" => Some(Self::OpenApi30),
            "openapi-3-1" => Some(Self::OpenApi31),
            _ => None,
        }
    }

    /// Returns the hub vocabulary string for this type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OpenApi20 => "openapi-2-0",
            Self::OpenApi30 => "openapi-3-0",
            Self::OpenApi31 => "openapi-3-1",
        }
    }
}

impl std::fmt::Display for ApiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The linter assigned to a document task.
///
/// Spectral handles every supported OpenAPI flavor today; Vacuum is
/// reserved for auxiliary flows. `Unknown` marks documents no linter
/// handles — the fan-out records those tasks as failed instead of
/// dispatching them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinterKind {
    /// The Spectral linter.
    Spectral,
    /// The Vacuum linter (auxiliary flows only).
    Vacuum,
    /// No linter handles the document's api type.
    Unknown,
}

impl LinterKind {
    /// Returns the linter that handles the given hub api-type string.
    #[must_use]
    pub fn for_api_type(api_type: &str) -> Self {
        match ApiType::parse(api_type) {
            Some(_) => Self::Spectral,
            None => Self::Unknown,
        }
    }

    /// Returns a lowercase label suitable for logs and storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Spectral => "spectral",
            Self::Vacuum => "vacuum",
            Self::Unknown => "unknown",
        }
    }

    /// Parses a stored label back into a linter kind.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` when the label is unknown.
    pub fn parse_label(label: &str) -> Result<Self> {
        match label {
            "spectral" => Ok(Self::Spectral),
            "vacuum" => Ok(Self::Vacuum),
            "unknown" => Ok(Self::Unknown),
            other => Err(Error::serialization(format!("unknown linter '{other}'"))),
        }
    }
}

impl std::fmt::Display for LinterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a catalogue ruleset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulesetStatus {
    /// Selected for new lint work.
    Active,
    /// Kept for existing results; never selected.
    Inactive,
}

impl RulesetStatus {
    /// Returns a lowercase label suitable for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    /// Parses a stored label back into a status.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` when the label is unknown.
    pub fn parse_label(label: &str) -> Result<Self> {
        match label {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(Error::serialization(format!(
                "unknown ruleset status '{other}'"
            ))),
        }
    }
}

/// A linter rule file plus catalogue metadata.
///
/// Rulesets are append-only from the pipeline's perspective: deactivation
/// never deletes, and deletion is permitted only for inactive rulesets
/// through an external flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ruleset {
    /// Ruleset identifier.
    pub id: RulesetId,
    /// Human-readable name.
    pub name: String,
    /// Hub api-type string this ruleset applies to.
    pub api_type: String,
    /// Linter the rule file targets.
    pub linter: LinterKind,
    /// Original rule file name; its extension matters to the linter.
    pub file_name: String,
    /// Raw rule file bytes.
    #[serde(skip)]
    pub data: Vec<u8>,
    /// Lifecycle state.
    pub status: RulesetStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Whether an external flow may delete this (inactive) ruleset.
    pub can_be_deleted: bool,
}

impl Ruleset {
    /// Creates a new active ruleset.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        api_type: impl Into<String>,
        linter: LinterKind,
        file_name: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            id: RulesetId::generate(),
            name: name.into(),
            api_type: api_type.into(),
            linter,
            file_name: file_name.into(),
            data,
            status: RulesetStatus::Active,
            created_at: Utc::now(),
            can_be_deleted: false,
        }
    }
}

/// Outcome of selecting a linter and ruleset for one api type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulesetChoice {
    /// A linter handles the type and an active ruleset exists.
    Lint {
        /// The selected linter.
        linter: LinterKind,
        /// The active ruleset to lint with.
        ruleset_id: RulesetId,
    },
    /// A linter handles the type but the catalogue has no active ruleset.
    NoActiveRuleset {
        /// The linter that would have been used.
        linter: LinterKind,
    },
    /// No linter handles the type.
    Unsupported,
}

/// Selects the linter and active ruleset for a document's api type.
///
/// Unsupported api types are not an error: the caller records the
/// corresponding document task as failed with an explanatory detail
/// rather than failing the whole version.
///
/// # Errors
///
/// Returns storage errors from the catalogue lookup. A missing active
/// ruleset is reported through [`RulesetChoice::NoActiveRuleset`], not as
/// an error.
pub async fn select_ruleset(store: &dyn TaskStore, api_type: &str) -> Result<RulesetChoice> {
    let linter = LinterKind::for_api_type(api_type);
    if linter == LinterKind::Unknown {
        return Ok(RulesetChoice::Unsupported);
    }

    match store.get_active_ruleset(api_type, linter).await? {
        Some(ruleset) => Ok(RulesetChoice::Lint {
            linter,
            ruleset_id: ruleset.id,
        }),
        None => Ok(RulesetChoice::NoActiveRuleset { linter }),
    }
}
