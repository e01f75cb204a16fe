//! Pipeline configuration (YAML v1 + `SCDFLOW_*` environment overrides)
//!
//! ```yaml
//! version: 1
//! engine:
//!   batch_size: 500
//! datasets:
//!   - name: customers
//!     kind: dimension
//!     key_columns: [customer_id]
//!     required_columns: [name]
//!   - name: orders
//!     kind: fact
//!     key_columns: [order_id]
//!     measures: [amount]
//!     references:
//!       - dimension: customers
//!         columns: [customer_id]
//!     rules:
//!       - rule: unique_insert_keys
//! aggregates:
//!   - name: revenue_by_region
//!     fact_dataset: orders
//!     granularity: day
//!     group_by:
//!       - dimension: customers
//!         attribute: region
//!     measures:
//!       - name: revenue
//!         source: amount
//!         func: sum
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::{AggregateFunc, AggregateSpec};
use crate::validation::ValidationRule;

/// Supported configuration schema versions
pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Unsupported version
    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    /// Range validation error
    #[error("Invalid value for field '{field}': {value}. {hint}")]
    Range {
        field: String,
        value: String,
        hint: String,
    },

    /// Dataset or aggregate declaration is inconsistent
    #[error("Invalid declaration '{name}': {issue}")]
    Declaration { name: String, issue: String },

    /// Environment override could not be parsed
    #[error("Invalid environment override {var}={value}: expected {expected}")]
    EnvOverride {
        var: String,
        value: String,
        expected: &'static str,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    fn range(field: &str, value: impl ToString, hint: &str) -> Self {
        Self::Range {
            field: field.to_string(),
            value: value.to_string(),
            hint: hint.to_string(),
        }
    }

    fn declaration(name: &str, issue: impl Into<String>) -> Self {
        Self::Declaration {
            name: name.to_string(),
            issue: issue.into(),
        }
    }
}

/// Configuration result type
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// ═══════════════════════════════════════════════════════════════════════════
// Sections
// ═══════════════════════════════════════════════════════════════════════════

/// Merge engine tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Max ledger events per merge batch
    pub batch_size: usize,
    /// Rows fetched from the ledger store per page
    pub page_size: usize,
    /// Batches an update/delete may wait for its predecessor before it is surfaced
    pub orphan_retry_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            page_size: 128,
            orphan_retry_limit: 2,
        }
    }
}

/// Scheduling, retry and lease settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Attempts per task-tick before the task is BLOCKED
    pub max_attempts: u32,
    pub lease_ttl_ms: u64,
    /// Base of the exponential backoff between attempts
    pub retry_backoff_ms: u64,
    /// Inline retries of a lost optimistic commit within one attempt
    pub conflict_retries: u32,
    pub max_parallel_tasks: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lease_ttl_ms: 30_000,
            retry_backoff_ms: 200,
            conflict_retries: 3,
            max_parallel_tasks: (num_cpus::get() * 3 / 4).max(1), // 75% of cores
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

/// What a dataset's ledger feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// SCD2 versioned entities
    Dimension,
    /// Immutable measurements
    Fact,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Dimension => "dimension",
            DatasetKind::Fact => "fact",
        }
    }
}

/// Fact → dimension reference (`columns[i]` of the fact = i-th key column of the dimension)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DimensionReference {
    pub dimension: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    pub name: String,
    pub kind: DatasetKind,
    pub key_columns: Vec<String>,
    /// Shorthand for a `not_null` rule
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<DimensionReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub measures: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ValidationRule>,
}

impl DatasetConfig {
    pub fn dimension(name: impl Into<String>, key_columns: &[&str]) -> Self {
        Self::new(name, DatasetKind::Dimension, key_columns)
    }

    pub fn fact(name: impl Into<String>, key_columns: &[&str]) -> Self {
        Self::new(name, DatasetKind::Fact, key_columns)
    }

    fn new(name: impl Into<String>, kind: DatasetKind, key_columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            kind,
            key_columns: key_columns.iter().map(|c| c.to_string()).collect(),
            required_columns: Vec::new(),
            references: Vec::new(),
            measures: Vec::new(),
            rules: Vec::new(),
        }
    }

    pub fn required(mut self, columns: &[&str]) -> Self {
        self.required_columns
            .extend(columns.iter().map(|c| c.to_string()));
        self
    }

    pub fn reference(mut self, dimension: impl Into<String>, columns: &[&str]) -> Self {
        self.references.push(DimensionReference {
            dimension: dimension.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn measures(mut self, measures: &[&str]) -> Self {
        self.measures.extend(measures.iter().map(|m| m.to_string()));
        self
    }

    pub fn rule(mut self, rule: ValidationRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Declared rules plus the `not_null` rule implied by `required_columns`
    pub fn effective_rules(&self) -> Vec<ValidationRule> {
        let mut rules = self.rules.clone();
        if !self.required_columns.is_empty() {
            rules.push(ValidationRule::NotNull {
                columns: self.required_columns.clone(),
            });
        }
        rules
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Root
// ═══════════════════════════════════════════════════════════════════════════

/// Root configuration (YAML schema v1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScdflowConfig {
    /// Schema version (always 1 for v1)
    pub version: u32,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub datasets: Vec<DatasetConfig>,
    #[serde(default)]
    pub aggregates: Vec<AggregateSpec>,
}

impl Default for ScdflowConfig {
    fn default() -> Self {
        Self {
            version: 1,
            engine: EngineConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            logging: LoggingConfig::default(),
            datasets: Vec::new(),
            aggregates: Vec::new(),
        }
    }
}

impl ScdflowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, dataset: DatasetConfig) -> Self {
        self.datasets.push(dataset);
        self
    }

    pub fn with_aggregate(mut self, aggregate: AggregateSpec) -> Self {
        self.aggregates.push(aggregate);
        self
    }

    /// Load, version-check and validate a YAML file
    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let config: ScdflowConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        serde_yaml::to_string(self).map_err(ConfigError::Yaml)
    }

    /// Apply `SCDFLOW_*` variables from the process environment
    pub fn apply_env_overrides(self) -> ConfigResult<Self> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply `SCDFLOW_*` overrides from an explicit variable list
    pub fn apply_overrides<I>(mut self, vars: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (var, value) in vars {
            match var.as_str() {
                "SCDFLOW_BATCH_SIZE" => self.engine.batch_size = parse_env(&var, &value)?,
                "SCDFLOW_PAGE_SIZE" => self.engine.page_size = parse_env(&var, &value)?,
                "SCDFLOW_ORPHAN_RETRY_LIMIT" => {
                    self.engine.orphan_retry_limit = parse_env(&var, &value)?
                }
                "SCDFLOW_MAX_ATTEMPTS" => {
                    self.orchestrator.max_attempts = parse_env(&var, &value)?
                }
                "SCDFLOW_LEASE_TTL_MS" => {
                    self.orchestrator.lease_ttl_ms = parse_env(&var, &value)?
                }
                "SCDFLOW_RETRY_BACKOFF_MS" => {
                    self.orchestrator.retry_backoff_ms = parse_env(&var, &value)?
                }
                "SCDFLOW_CONFLICT_RETRIES" => {
                    self.orchestrator.conflict_retries = parse_env(&var, &value)?
                }
                "SCDFLOW_MAX_PARALLEL_TASKS" => {
                    self.orchestrator.max_parallel_tasks = parse_env(&var, &value)?
                }
                "SCDFLOW_LOG" => self.logging.filter = value,
                _ => {}
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn dataset(&self, name: &str) -> Option<&DatasetConfig> {
        self.datasets.iter().find(|d| d.name == name)
    }

    pub fn aggregate(&self, name: &str) -> Option<&AggregateSpec> {
        self.aggregates.iter().find(|a| a.name == name)
    }

    /// Check version, sizes and cross-references between declarations
    pub fn validate(&self) -> ConfigResult<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version) {
            return Err(ConfigError::UnsupportedVersion {
                found: self.version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        if self.engine.batch_size == 0 {
            return Err(ConfigError::range("engine.batch_size", 0, "Must be at least 1"));
        }
        if self.engine.page_size == 0 {
            return Err(ConfigError::range("engine.page_size", 0, "Must be at least 1"));
        }
        if self.orchestrator.max_attempts == 0 {
            return Err(ConfigError::range(
                "orchestrator.max_attempts",
                0,
                "Must be at least 1",
            ));
        }
        if self.orchestrator.lease_ttl_ms == 0 {
            return Err(ConfigError::range(
                "orchestrator.lease_ttl_ms",
                0,
                "Leases need a positive time-to-live",
            ));
        }
        if self.orchestrator.max_parallel_tasks == 0 {
            return Err(ConfigError::range(
                "orchestrator.max_parallel_tasks",
                0,
                "Must be at least 1",
            ));
        }

        let mut names = HashSet::new();
        for dataset in &self.datasets {
            if !names.insert(dataset.name.as_str()) {
                return Err(ConfigError::declaration(&dataset.name, "declared twice"));
            }
            self.validate_dataset(dataset)?;
        }

        let mut aggregate_names = HashSet::new();
        for spec in &self.aggregates {
            if !aggregate_names.insert(spec.name.as_str()) {
                return Err(ConfigError::declaration(&spec.name, "declared twice"));
            }
            self.validate_aggregate(spec)?;
        }

        Ok(())
    }

    fn validate_dataset(&self, dataset: &DatasetConfig) -> ConfigResult<()> {
        if dataset.name.trim().is_empty() {
            return Err(ConfigError::declaration("<unnamed>", "dataset name is empty"));
        }
        if dataset.key_columns.is_empty() {
            return Err(ConfigError::declaration(
                &dataset.name,
                "at least one key column is required",
            ));
        }

        if dataset.kind == DatasetKind::Dimension
            && (!dataset.references.is_empty() || !dataset.measures.is_empty())
        {
            return Err(ConfigError::declaration(
                &dataset.name,
                "references and measures are only allowed on fact datasets",
            ));
        }

        for reference in &dataset.references {
            let target = self.dataset(&reference.dimension).ok_or_else(|| {
                ConfigError::declaration(
                    &dataset.name,
                    format!("references unknown dataset '{}'", reference.dimension),
                )
            })?;
            if target.kind != DatasetKind::Dimension {
                return Err(ConfigError::declaration(
                    &dataset.name,
                    format!("'{}' is not a dimension", reference.dimension),
                ));
            }
            if reference.columns.len() != target.key_columns.len() {
                return Err(ConfigError::declaration(
                    &dataset.name,
                    format!(
                        "reference to '{}' has {} column(s) but its key has {}",
                        reference.dimension,
                        reference.columns.len(),
                        target.key_columns.len()
                    ),
                ));
            }
        }

        for rule in &dataset.rules {
            if let ValidationRule::ForeignKey { dimension, columns } = rule {
                let target = self
                    .dataset(dimension)
                    .filter(|d| d.kind == DatasetKind::Dimension)
                    .ok_or_else(|| {
                        ConfigError::declaration(
                            &dataset.name,
                            format!("foreign_key rule targets unknown dimension '{}'", dimension),
                        )
                    })?;
                if columns.len() != target.key_columns.len() {
                    return Err(ConfigError::declaration(
                        &dataset.name,
                        format!(
                            "foreign_key rule on '{}' has {} column(s) but its key has {}",
                            dimension,
                            columns.len(),
                            target.key_columns.len()
                        ),
                    ));
                }
            }
        }

        Ok(())
    }

    fn validate_aggregate(&self, spec: &AggregateSpec) -> ConfigResult<()> {
        let facts = self
            .dataset(&spec.fact_dataset)
            .filter(|d| d.kind == DatasetKind::Fact)
            .ok_or_else(|| {
                ConfigError::declaration(
                    &spec.name,
                    format!("unknown fact dataset '{}'", spec.fact_dataset),
                )
            })?;

        if spec.measures.is_empty() {
            return Err(ConfigError::declaration(&spec.name, "no measures declared"));
        }

        for group in &spec.group_by {
            if !facts.references.iter().any(|r| r.dimension == group.dimension) {
                return Err(ConfigError::declaration(
                    &spec.name,
                    format!(
                        "groups by '{}' which '{}' does not reference",
                        group.dimension, facts.name
                    ),
                ));
            }
        }

        for measure in &spec.measures {
            match (&measure.source, measure.func) {
                (None, AggregateFunc::Count) => {}
                (None, func) => {
                    return Err(ConfigError::declaration(
                        &spec.name,
                        format!("measure '{}' ({}) needs a source column", measure.name, func),
                    ))
                }
                (Some(source), _) if !facts.measures.contains(source) => {
                    return Err(ConfigError::declaration(
                        &spec.name,
                        format!(
                            "measure '{}' reads '{}' which is not a measure of '{}'",
                            measure.name, source, facts.name
                        ),
                    ))
                }
                _ => {}
            }
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| ConfigError::EnvOverride {
        var: var.to_string(),
        value: value.to_string(),
        expected: "a non-negative integer",
    })
}
