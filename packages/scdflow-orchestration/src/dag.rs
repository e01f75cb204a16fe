use crate::config::{DatasetKind, ScdflowConfig};
use crate::error::{OrchestratorError, Result};
use crate::job::TaskId;
use std::collections::{BTreeSet, HashMap, HashSet};

/// What a task does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    MergeDimension { dataset: String },
    MergeFacts { dataset: String },
    RefreshAggregate { aggregate: String, fact_dataset: String },
}

impl TaskKind {
    /// Dataset whose ledger the task consumes
    pub fn dataset(&self) -> &str {
        match self {
            TaskKind::MergeDimension { dataset } | TaskKind::MergeFacts { dataset } => dataset,
            TaskKind::RefreshAggregate { fact_dataset, .. } => fact_dataset,
        }
    }
}

/// Task node in DAG
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: TaskId,
    pub kind: TaskKind,
    pub dependencies: Vec<TaskId>,
}

impl TaskNode {
    pub fn new(id: TaskId, kind: TaskKind, dependencies: Vec<TaskId>) -> Self {
        Self {
            id,
            kind,
            dependencies,
        }
    }
}

/// Task DAG with topological sort
#[derive(Debug, Clone)]
pub struct TaskDag {
    tasks: HashMap<TaskId, TaskNode>,
    execution_order: Vec<Vec<TaskId>>, // Vec of parallel groups
}

impl TaskDag {
    /// Create a new DAG from task definitions
    pub fn new(tasks: Vec<TaskNode>) -> Result<Self> {
        let mut task_map = HashMap::new();
        for task in tasks {
            task_map.insert(task.id.clone(), task);
        }

        // Validate dependencies exist
        for task in task_map.values() {
            for dep in &task.dependencies {
                if !task_map.contains_key(dep) {
                    return Err(OrchestratorError::MissingDependency(format!(
                        "Task {} depends on non-existent task {}",
                        task.id, dep
                    )));
                }
            }
        }

        // Compute execution order via topological sort
        let execution_order = Self::topological_sort(&task_map)?;

        Ok(Self {
            tasks: task_map,
            execution_order,
        })
    }

    /// Dimension merges, then fact merges, then aggregate refreshes
    pub fn from_config(config: &ScdflowConfig) -> Result<Self> {
        let mut nodes = Vec::new();

        for dataset in &config.datasets {
            let node = match dataset.kind {
                DatasetKind::Dimension => TaskNode::new(
                    TaskId::merge_dimension(&dataset.name),
                    TaskKind::MergeDimension {
                        dataset: dataset.name.clone(),
                    },
                    vec![],
                ),
                DatasetKind::Fact => {
                    let dimensions: BTreeSet<&str> = dataset
                        .references
                        .iter()
                        .map(|r| r.dimension.as_str())
                        .collect();
                    TaskNode::new(
                        TaskId::merge_facts(&dataset.name),
                        TaskKind::MergeFacts {
                            dataset: dataset.name.clone(),
                        },
                        dimensions.into_iter().map(TaskId::merge_dimension).collect(),
                    )
                }
            };
            nodes.push(node);
        }

        for spec in &config.aggregates {
            nodes.push(TaskNode::new(
                TaskId::refresh_aggregate(&spec.name),
                TaskKind::RefreshAggregate {
                    aggregate: spec.name.clone(),
                    fact_dataset: spec.fact_dataset.clone(),
                },
                vec![TaskId::merge_facts(&spec.fact_dataset)],
            ));
        }

        Self::new(nodes)
    }

    /// Topological sort with parallel group detection
    fn topological_sort(tasks: &HashMap<TaskId, TaskNode>) -> Result<Vec<Vec<TaskId>>> {
        let mut in_degree: HashMap<&TaskId, usize> = tasks
            .values()
            .map(|task| (&task.id, task.dependencies.len()))
            .collect();

        let mut result = Vec::new();
        let mut processed = HashSet::new();

        while processed.len() < tasks.len() {
            // Find all tasks with in-degree 0 (can run in parallel)
            let mut ready: Vec<TaskId> = in_degree
                .iter()
                .filter(|(id, &degree)| degree == 0 && !processed.contains(**id))
                .map(|(&id, _)| id.clone())
                .collect();

            if ready.is_empty() {
                return Err(OrchestratorError::DagCycleDetected);
            }
            ready.sort();

            // Mark as processed and decrement dependents
            for task_id in &ready {
                processed.insert(task_id.clone());
                in_degree.remove(task_id);

                for dependent in tasks.values() {
                    if dependent.dependencies.contains(task_id) {
                        if let Some(degree) = in_degree.get_mut(&dependent.id) {
                            *degree = degree.saturating_sub(1);
                        }
                    }
                }
            }

            result.push(ready);
        }

        Ok(result)
    }

    /// Get execution order
    pub fn execution_order(&self) -> &[Vec<TaskId>] {
        &self.execution_order
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&TaskNode> {
        self.tasks.get(id)
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.execution_order.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn dependencies(&self, id: &TaskId) -> &[TaskId] {
        self.tasks
            .get(id)
            .map(|t| t.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Tasks that list `id` as a dependency
    pub fn dependents(&self, id: &TaskId) -> Vec<&TaskId> {
        let mut dependents: Vec<&TaskId> = self
            .tasks
            .values()
            .filter(|t| t.dependencies.contains(id))
            .map(|t| &t.id)
            .collect();
        dependents.sort();
        dependents
    }

    /// Everything reachable from `id`, in execution order
    pub fn downstream_of(&self, id: &TaskId) -> Vec<TaskId> {
        let mut reached: HashSet<&TaskId> = HashSet::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            for dependent in self.dependents(current) {
                if reached.insert(dependent) {
                    frontier.push(dependent);
                }
            }
        }
        self.task_ids()
            .filter(|t| reached.contains(t))
            .cloned()
            .collect()
    }

    /// Get execution plan as string (for logging)
    pub fn execution_plan(&self) -> String {
        self.execution_order
            .iter()
            .enumerate()
            .map(|(i, group)| {
                let names: Vec<_> = group.iter().map(|id| id.as_str()).collect();

                if group.len() > 1 {
                    format!("Phase {}: {} (parallel)", i + 1, names.join(" ∥ "))
                } else {
                    format!("Phase {}: {}", i + 1, names[0])
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregateFunc, AggregateSpec, MeasureSpec};
    use crate::config::DatasetConfig;
    use scdflow_storage::Granularity;

    fn node(id: &str, deps: &[&str]) -> TaskNode {
        TaskNode::new(
            TaskId::new(id),
            TaskKind::MergeDimension {
                dataset: id.to_string(),
            },
            deps.iter().map(|d| TaskId::new(*d)).collect(),
        )
    }

    fn config() -> ScdflowConfig {
        ScdflowConfig::new()
            .with_dataset(DatasetConfig::dimension("customers", &["customer_id"]))
            .with_dataset(DatasetConfig::dimension("products", &["sku"]))
            .with_dataset(
                DatasetConfig::fact("orders", &["order_id"])
                    .measures(&["amount"])
                    .reference("customers", &["customer_id"])
                    .reference("products", &["sku"]),
            )
            .with_aggregate(AggregateSpec {
                name: "daily_revenue".to_string(),
                fact_dataset: "orders".to_string(),
                group_by: vec![],
                granularity: Granularity::Day,
                measures: vec![MeasureSpec {
                    name: "revenue".to_string(),
                    source: Some("amount".to_string()),
                    func: AggregateFunc::Sum,
                }],
            })
    }

    #[test]
    fn test_dag_topological_sort_simple() {
        let dag = TaskDag::new(vec![node("a", &[]), node("b", &["a"])]).unwrap();
        let order = dag.execution_order();

        assert_eq!(order.len(), 2);
        assert_eq!(order[0], vec![TaskId::new("a")]);
        assert_eq!(order[1], vec![TaskId::new("b")]);
    }

    #[test]
    fn test_dag_parallel_detection() {
        let dag = TaskDag::new(vec![node("a", &[]), node("b", &[])]).unwrap();
        let order = dag.execution_order();

        assert_eq!(order.len(), 1);
        assert_eq!(order[0].len(), 2); // Both in same parallel group
    }

    #[test]
    fn test_dag_from_config() {
        let dag = TaskDag::from_config(&config()).unwrap();
        let order = dag.execution_order();

        // Phase 1: both dimensions
        assert_eq!(order.len(), 3);
        assert_eq!(
            order[0],
            vec![
                TaskId::merge_dimension("customers"),
                TaskId::merge_dimension("products")
            ]
        );
        assert_eq!(order[1], vec![TaskId::merge_facts("orders")]);
        assert_eq!(order[2], vec![TaskId::refresh_aggregate("daily_revenue")]);

        assert_eq!(dag.dependencies(&TaskId::merge_facts("orders")).len(), 2);
        assert_eq!(
            dag.downstream_of(&TaskId::merge_dimension("customers")),
            vec![
                TaskId::merge_facts("orders"),
                TaskId::refresh_aggregate("daily_revenue")
            ]
        );
    }

    #[test]
    fn test_dag_missing_dependency() {
        let result = TaskDag::new(vec![node("b", &["a"])]);
        assert!(matches!(result, Err(OrchestratorError::MissingDependency(_))));
    }

    #[test]
    fn test_dag_cycle_detection() {
        let result = TaskDag::new(vec![node("a", &["b"]), node("b", &["a"])]);
        assert!(matches!(result, Err(OrchestratorError::DagCycleDetected)));
    }

    #[test]
    fn test_dag_execution_plan_string() {
        let dag = TaskDag::from_config(&config()).unwrap();
        let plan = dag.execution_plan();

        assert!(plan.contains("Phase 1:"));
        assert!(plan.contains("parallel"));
        assert!(plan.contains("merge_dimension:customers ∥ merge_dimension:products"));
        assert!(plan.contains("Phase 3: refresh_aggregate:daily_revenue"));
    }
}
