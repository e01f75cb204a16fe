//! Validation gate
//!
//! Batch-level checks run before a merge is prepared. A rejected batch is
//! never committed and its cursor does not move.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use scdflow_storage::{ChangeAction, ChangeEvent, NaturalKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::CatalogReader;

/// Configurable batch check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationRule {
    /// No natural key is inserted twice within the batch
    UniqueInsertKeys,
    /// Columns must be present and non-null (UPDATE patches: only if present)
    NotNull { columns: Vec<String> },
    /// `columns` must resolve to an entity already merged into `dimension`
    ForeignKey {
        dimension: String,
        columns: Vec<String>,
    },
}

impl ValidationRule {
    pub fn name(&self) -> &'static str {
        match self {
            ValidationRule::UniqueInsertKeys => "unique_insert_keys",
            ValidationRule::NotNull { .. } => "not_null",
            ValidationRule::ForeignKey { .. } => "foreign_key",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub natural_key: Option<String>,
    pub message: String,
}

impl Violation {
    pub fn new(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            sequence_id: None,
            natural_key: None,
            message: message.into(),
        }
    }

    fn at(mut self, event: &ChangeEvent) -> Self {
        self.sequence_id = Some(event.sequence_id);
        self.natural_key = Some(event.key.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Approved,
    Rejected(Vec<Violation>),
}

impl Verdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, Verdict::Approved)
    }
}

pub struct ValidationGate {
    catalog: Arc<dyn CatalogReader>,
    /// dimension → declared key columns
    dimension_keys: HashMap<String, Vec<String>>,
}

impl ValidationGate {
    pub fn new(catalog: Arc<dyn CatalogReader>, dimension_keys: HashMap<String, Vec<String>>) -> Self {
        Self {
            catalog,
            dimension_keys,
        }
    }

    /// Run every rule over the batch; all violations are collected
    pub fn evaluate(&self, rules: &[ValidationRule], batch: &[ChangeEvent]) -> Verdict {
        let mut violations = Vec::new();
        for rule in rules {
            match rule {
                ValidationRule::UniqueInsertKeys => unique_insert_keys(batch, &mut violations),
                ValidationRule::NotNull { columns } => not_null(columns, batch, &mut violations),
                ValidationRule::ForeignKey { dimension, columns } => {
                    self.foreign_key(dimension, columns, batch, &mut violations)
                }
            }
        }

        debug!(
            events = batch.len(),
            rules = rules.len(),
            violations = violations.len(),
            "Validation gate evaluated"
        );

        if violations.is_empty() {
            Verdict::Approved
        } else {
            Verdict::Rejected(violations)
        }
    }

    fn foreign_key(
        &self,
        dimension: &str,
        columns: &[String],
        batch: &[ChangeEvent],
        violations: &mut Vec<Violation>,
    ) {
        let rule = "foreign_key";
        let Some(target_columns) = self.dimension_keys.get(dimension) else {
            violations.push(Violation::new(
                rule,
                format!("unknown dimension '{}'", dimension),
            ));
            return;
        };

        let mut checked: HashMap<NaturalKey, bool> = HashMap::new();
        for event in batch {
            if event.action == ChangeAction::Delete {
                continue;
            }
            // Patches that leave the reference untouched
            if event.action == ChangeAction::Update
                && columns.iter().all(|c| !event.payload.contains_key(c))
            {
                continue;
            }

            match NaturalKey::from_columns(&event.payload, columns, target_columns) {
                Ok(key) => {
                    let exists = *checked
                        .entry(key.clone())
                        .or_insert_with(|| self.catalog.has_entity(dimension, &key));
                    if !exists {
                        violations.push(
                            Violation::new(
                                rule,
                                format!("{} has no merged entity {}", dimension, key),
                            )
                            .at(event),
                        );
                    }
                }
                Err(e) => violations.push(Violation::new(rule, e.message).at(event)),
            }
        }
    }
}

fn unique_insert_keys(batch: &[ChangeEvent], violations: &mut Vec<Violation>) {
    let mut seen = HashSet::new();
    for event in batch.iter().filter(|e| e.action == ChangeAction::Insert) {
        if !seen.insert(&event.key) {
            violations.push(
                Violation::new(
                    "unique_insert_keys",
                    format!("key {} inserted more than once", event.key),
                )
                .at(event),
            );
        }
    }
}

fn not_null(columns: &[String], batch: &[ChangeEvent], violations: &mut Vec<Violation>) {
    for event in batch {
        if event.action == ChangeAction::Delete {
            continue;
        }
        for column in columns {
            let message = match event.payload.get(column) {
                Some(value) if value.is_null() => format!("column '{}' is null", column),
                Some(_) => continue,
                None if event.action == ChangeAction::Update => continue,
                None => format!("column '{}' is missing", column),
            };
            violations.push(Violation::new("not_null", message).at(event));
        }
    }
}
