//! `sources.yaml`: which dataset plays which role, how to fetch it, and how its
//! identifiers map onto BIN/BBL.

use std::collections::BTreeMap;
use std::path::PathBuf;

use bis_adapters::{PagedEndpoint, SourceKind};
use bis_core::{has_column, SourceSchema};
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::{PermitAggregateConfig, SaleAggregateConfig};
use crate::flags::DerivedFlagConfig;
use crate::leads::LeadScoreConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    Footprints,
    Parcels,
    Permits,
    Sales,
}

impl SourceRole {
    pub const ALL: [SourceRole; 4] = [
        SourceRole::Footprints,
        SourceRole::Parcels,
        SourceRole::Permits,
        SourceRole::Sales,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceRole::Footprints => "footprints",
            SourceRole::Parcels => "parcels",
            SourceRole::Permits => "permits",
            SourceRole::Sales => "sales",
        }
    }

    fn needs_bin(self) -> bool {
        matches!(self, SourceRole::Footprints | SourceRole::Permits)
    }

    fn needs_bbl(self) -> bool {
        matches!(self, SourceRole::Footprints | SourceRole::Parcels | SourceRole::Sales)
    }
}

impl std::fmt::Display for SourceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub role: SourceRole,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub endpoint: Option<PagedEndpoint>,
    /// Input file for `kind: csv`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Local copy read instead of the endpoint on offline runs.
    #[serde(default)]
    pub backup_csv: Option<PathBuf>,
    /// Raw column -> name used by the linkage settings, applied before the
    /// identifier mapping runs.
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    #[serde(default)]
    pub schema: SourceSchema,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    /// A column already carrying its target name counts as renamed, so a
    /// previously exported frame passes through unchanged.
    pub fn rename_columns(&self, mut frame: DataFrame) -> Result<DataFrame, RegistryError> {
        for (from, to) in &self.rename {
            if has_column(&frame, from) {
                frame
                    .rename(from, to)
                    .map_err(|err| RegistryError::InvalidSource {
                        source_id: self.source_id.clone(),
                        message: format!("renaming `{from}` to `{to}`: {err}"),
                    })?;
            } else if !has_column(&frame, to) {
                return Err(RegistryError::InvalidSource {
                    source_id: self.source_id.clone(),
                    message: format!(
                        "rename column `{from}` not found; available columns: {}",
                        frame.get_column_names().join(", ")
                    ),
                });
            }
        }
        Ok(frame)
    }
}

/// Settings for the pure linkage stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkageSettings {
    #[serde(default)]
    pub permits: PermitAggregateConfig,
    #[serde(default)]
    pub sales: SaleAggregateConfig,
    #[serde(default)]
    pub flags: DerivedFlagConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
    #[serde(flatten)]
    pub linkage: LinkageSettings,
    #[serde(default)]
    pub leads: LeadScoreConfig,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no enabled source has role {0}")]
    MissingRole(SourceRole),
    #[error("role {role} has more than one enabled source: {source_ids:?}")]
    DuplicateRole {
        role: SourceRole,
        source_ids: Vec<String>,
    },
    #[error("source_id {0} is declared more than once")]
    DuplicateSourceId(String),
    #[error("source {source_id}: {message}")]
    InvalidSource { source_id: String, message: String },
    #[error("unknown source {0}")]
    UnknownSource(String),
    #[error("{setting} is `{actual}` but {reference} is `{expected}`")]
    InconsistentColumns {
        setting: &'static str,
        actual: String,
        reference: &'static str,
        expected: String,
    },
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        let mut ids = std::collections::BTreeSet::new();
        for source in &self.sources {
            if !ids.insert(source.source_id.as_str()) {
                return Err(RegistryError::DuplicateSourceId(source.source_id.clone()));
            }
            validate_source(source)?;
        }

        let mut by_role: BTreeMap<SourceRole, Vec<String>> = BTreeMap::new();
        for source in self.sources.iter().filter(|s| s.enabled) {
            by_role
                .entry(source.role)
                .or_default()
                .push(source.source_id.clone());
        }
        for role in SourceRole::ALL {
            match by_role.remove(&role) {
                None => return Err(RegistryError::MissingRole(role)),
                Some(source_ids) if source_ids.len() > 1 => {
                    return Err(RegistryError::DuplicateRole { role, source_ids })
                }
                Some(_) => {}
            }
        }
        self.validate_columns()
    }

    /// The master carries the sale and permit date columns under the names the
    /// aggregators produce, so the flag and lead settings must use the same names.
    fn validate_columns(&self) -> Result<(), RegistryError> {
        let sales = &self.linkage.sales;
        let mut pairs = vec![
            (
                "flags.sale_date_column",
                &self.linkage.flags.sale_date_column,
                "sales.date_column",
                &sales.date_column,
            ),
            (
                "leads.sale_date_column",
                &self.leads.sale_date_column,
                "sales.date_column",
                &sales.date_column,
            ),
            (
                "leads.price_column",
                &self.leads.price_column,
                "sales.price_column",
                &sales.price_column,
            ),
        ];
        if let Some(issuance) = &self.linkage.permits.issuance_column {
            pairs.push((
                "flags.issuance_date_column",
                &self.linkage.flags.issuance_date_column,
                "permits.issuance_column",
                issuance,
            ));
        }
        for (setting, actual, reference, expected) in pairs {
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(RegistryError::InconsistentColumns {
                    setting,
                    actual: actual.clone(),
                    reference,
                    expected: expected.clone(),
                });
            }
        }
        Ok(())
    }

    /// The enabled source filling `role`.
    pub fn for_role(&self, role: SourceRole) -> Result<&SourceConfig, RegistryError> {
        self.sources
            .iter()
            .find(|s| s.enabled && s.role == role)
            .ok_or(RegistryError::MissingRole(role))
    }

    pub fn get(&self, source_id: &str) -> Result<&SourceConfig, RegistryError> {
        self.sources
            .iter()
            .find(|s| s.source_id == source_id)
            .ok_or_else(|| RegistryError::UnknownSource(source_id.to_string()))
    }
}

fn validate_source(source: &SourceConfig) -> Result<(), RegistryError> {
    let invalid = |message: String| RegistryError::InvalidSource {
        source_id: source.source_id.clone(),
        message,
    };
    if source.source_id.trim().is_empty() {
        return Err(invalid("source_id is empty".to_string()));
    }
    match (source.kind, &source.endpoint) {
        (SourceKind::Csv, _) if source.path.is_none() => {
            return Err(invalid("kind csv needs a path".to_string()))
        }
        (SourceKind::Csv, _) => {}
        (_, None) => return Err(invalid(format!("kind {:?} needs an endpoint", source.kind))),
        (_, Some(endpoint)) if endpoint.url.trim().is_empty() => {
            return Err(invalid("endpoint url is empty".to_string()))
        }
        (_, Some(endpoint)) if endpoint.page_size == 0 => {
            return Err(invalid("page_size must be greater than zero".to_string()))
        }
        (_, Some(_)) => {}
    }
    let mut targets = std::collections::BTreeSet::new();
    for (from, to) in &source.rename {
        if from.trim().is_empty() || to.trim().is_empty() {
            return Err(invalid("rename entries need a source and a target column".to_string()));
        }
        if !targets.insert(to.as_str()) {
            return Err(invalid(format!("more than one column is renamed to `{to}`")));
        }
    }
    if source.role.needs_bin() && !source.schema.maps_bin() {
        return Err(invalid(format!("role {} needs a bin mapping", source.role)));
    }
    if source.role.needs_bbl() && !source.schema.maps_bbl() {
        return Err(invalid(format!("role {} needs a bbl mapping", source.role)));
    }
    Ok(())
}
