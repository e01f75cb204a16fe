use std::collections::HashMap;
use std::sync::Arc;

use scdflow_storage::{InMemoryLedgerStore, LedgerStore};

use crate::aggregate::AggregateMaintainer;
use crate::anomaly::{AnomalyReporter, AnomalySink, TracingAnomalySink};
use crate::catalog::SinkCatalog;
use crate::config::{DatasetKind, ScdflowConfig};
use crate::cursor::CursorManager;
use crate::error::{OrchestratorError, Result};
use crate::ledger::ChangeLedger;
use crate::merge::{DatasetMapping, MergeEngine};
use crate::validation::{ValidationGate, ValidationRule};

/// Everything a task needs, wired from one configuration
pub struct CoreServices {
    pub config: Arc<ScdflowConfig>,
    pub store: Arc<dyn LedgerStore>,
    pub ledger: Arc<ChangeLedger>,
    pub cursors: CursorManager,
    pub reporter: AnomalyReporter,
    pub catalog: Arc<SinkCatalog>,
    pub engine: Arc<MergeEngine>,
    pub aggregates: Arc<AggregateMaintainer>,
    pub gate: Arc<ValidationGate>,
    mappings: Arc<HashMap<String, DatasetMapping>>,
}

impl CoreServices {
    pub fn new(
        config: ScdflowConfig,
        store: Arc<dyn LedgerStore>,
        catalog: Arc<SinkCatalog>,
        sink: Arc<dyn AnomalySink>,
    ) -> Result<Self> {
        config.validate()?;
        let reporter = AnomalyReporter::new(store.clone(), sink);
        let ledger = Arc::new(ChangeLedger::new(store.clone(), &config, reporter.clone()));
        let mappings = Arc::new(DatasetMapping::all(&config)?);

        Ok(Self::assemble(
            Arc::new(config),
            store,
            ledger,
            reporter,
            mappings,
            catalog,
        ))
    }

    /// In-memory ledger, fresh catalog, anomalies logged through `tracing`
    pub fn in_memory(config: ScdflowConfig) -> Result<Self> {
        Self::new(
            config,
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(SinkCatalog::new("live")),
            Arc::new(TracingAnomalySink),
        )
    }

    /// Same ledger, cursors and alert channel writing into another catalog
    pub fn with_catalog(&self, catalog: Arc<SinkCatalog>) -> Self {
        Self::assemble(
            self.config.clone(),
            self.store.clone(),
            self.ledger.clone(),
            self.reporter.clone(),
            self.mappings.clone(),
            catalog,
        )
    }

    fn assemble(
        config: Arc<ScdflowConfig>,
        store: Arc<dyn LedgerStore>,
        ledger: Arc<ChangeLedger>,
        reporter: AnomalyReporter,
        mappings: Arc<HashMap<String, DatasetMapping>>,
        catalog: Arc<SinkCatalog>,
    ) -> Self {
        let dimension_keys = config
            .datasets
            .iter()
            .filter(|d| d.kind == DatasetKind::Dimension)
            .map(|d| (d.name.clone(), d.key_columns.clone()))
            .collect();

        Self {
            cursors: CursorManager::new(store.clone()),
            engine: Arc::new(MergeEngine::new(
                catalog.clone(),
                config.engine.orphan_retry_limit,
            )),
            aggregates: Arc::new(AggregateMaintainer::new(catalog.clone(), &config.aggregates)),
            gate: Arc::new(ValidationGate::new(catalog.clone(), dimension_keys)),
            config,
            store,
            ledger,
            reporter,
            catalog,
            mappings,
        }
    }

    pub fn mapping(&self, dataset: &str) -> Result<&DatasetMapping> {
        self.mappings
            .get(dataset)
            .ok_or_else(|| OrchestratorError::UnknownDataset(dataset.to_string()))
    }

    pub fn rules(&self, dataset: &str) -> Vec<ValidationRule> {
        self.config
            .dataset(dataset)
            .map(|d| d.effective_rules())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogReader;
    use crate::config::DatasetConfig;

    fn config() -> ScdflowConfig {
        ScdflowConfig::new()
            .with_dataset(DatasetConfig::dimension("customers", &["customer_id"]).required(&["name"]))
    }

    #[test]
    fn test_services_wiring() {
        let services = CoreServices::in_memory(config()).unwrap();
        assert_eq!(services.mapping("customers").unwrap().key_columns, vec!["customer_id"]);
        assert!(services.mapping("orders").is_err());
        assert_eq!(services.rules("customers").len(), 1);
        assert_eq!(services.catalog.name(), "live");
    }

    #[test]
    fn test_with_catalog_shares_ledger_only() {
        let live = CoreServices::in_memory(config()).unwrap();
        let shadow = live.with_catalog(Arc::new(SinkCatalog::new("shadow")));

        assert!(Arc::ptr_eq(&live.ledger, &shadow.ledger));
        assert!(!Arc::ptr_eq(&live.catalog, &shadow.catalog));
        assert_eq!(shadow.engine.catalog().name(), "shadow");
        assert_eq!(shadow.catalog.applied_through("customers"), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut bad = config();
        bad.engine.batch_size = 0;
        assert!(matches!(
            CoreServices::in_memory(bad),
            Err(OrchestratorError::Configuration(_))
        ));
    }
}
