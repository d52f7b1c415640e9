//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! This module provides the TaskDAG structure that represents task dependencies
//! as a directed acyclic graph, enabling parallel execution of independent tasks.
//! Edges point from a dependency to its dependent.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// The task dependency graph.
///
/// Node indices follow insertion order, which the scheduler uses as the
/// tie-breaker between tasks of equal priority.
pub struct TaskDAG {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    /// Create a new empty TaskDAG.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build a DAG from a batch of tasks, wiring each task's `dependencies`.
    ///
    /// # Errors
    /// - `Validation` if two tasks share an id or a dependency names an unknown task
    /// - `CyclicDependency` if the dependencies form a cycle
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut dag = Self::new();
        for task in tasks {
            dag.add_task(task)?;
        }

        let mut edges = Vec::new();
        for task in dag.graph.node_weights() {
            for dep in &task.dependencies {
                if !dag.task_index.contains_key(dep) {
                    return Err(Error::Validation(format!(
                        "Task {} depends on unknown task {}",
                        task.id, dep
                    )));
                }
                edges.push((dep.clone(), task.id.clone()));
            }
        }
        for (from, to) in edges {
            let from_index = dag.task_index[&from];
            let to_index = dag.task_index[&to];
            dag.graph.add_edge(from_index, to_index, ());
        }

        toposort(&dag.graph, None).map_err(|cycle| {
            let id = dag
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::CyclicDependency(id)
        })?;

        Ok(dag)
    }

    /// Add a task to the DAG.
    ///
    /// # Errors
    /// Returns `Validation` if a task with the same id is already present.
    pub fn add_task(&mut self, task: Task) -> Result<NodeIndex> {
        if self.task_index.contains_key(&task.id) {
            return Err(Error::Validation(format!("Duplicate task id: {}", task.id)));
        }

        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        Ok(index)
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get a mutable reference to a task by its ID.
    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        match self.task_index.get(id) {
            Some(&index) => self.graph.node_weight_mut(index),
            None => None,
        }
    }

    /// Insertion position of a task, used for stable ordering.
    pub fn position(&self, id: &TaskId) -> Option<usize> {
        self.task_index.get(id).map(|index| index.index())
    }

    /// Get the number of tasks in the DAG.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependencies (edges) in the DAG.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Tasks the given task depends on, in insertion order.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => {
                let mut tasks: Vec<&Task> = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .filter_map(|n| self.graph.node_weight(n))
                    .collect();
                tasks.sort_by_key(|t| self.task_index[&t.id].index());
                tasks
            }
            None => Vec::new(),
        }
    }

    /// Ids in the given status, in insertion order.
    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.graph
            .node_weights()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Check whether every task is in a terminal state.
    pub fn all_finished(&self) -> bool {
        self.graph.node_weights().all(Task::is_finished)
    }

    /// Consume the DAG, returning tasks in insertion order.
    pub fn into_tasks(self) -> Vec<Task> {
        let (nodes, _) = self.graph.into_nodes_edges();
        nodes.into_iter().map(|node| node.weight).collect()
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
