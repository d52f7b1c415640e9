//! Step graph: an arena of step nodes joined by index-based, optionally
//! conditional edges.
//!
//! Edges point from a predecessor step to its successor. The graph is
//! validated once, when it is built from a template; afterwards every
//! query is infallible.

use super::types::{StepOutcome, StepTemplate, WorkflowRun, WorkflowTemplate};
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// Condition attached to an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeCondition {
    /// Followed by every outcome except `Failed`.
    Always,
    /// Followed only when the predecessor's outcome matches.
    On(StepOutcome),
}

impl EdgeCondition {
    /// Whether a predecessor with `outcome` takes this edge.
    pub fn is_taken(&self, outcome: StepOutcome) -> bool {
        match self {
            EdgeCondition::Always => outcome != StepOutcome::Failed,
            EdgeCondition::On(expected) => *expected == outcome,
        }
    }
}

/// Where the live loop stands for a given run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Frontier {
    /// Steps to execute next, in template order.
    pub ready: Vec<String>,
    /// Steps that can never run, in template order.
    pub skipped: Vec<String>,
}

/// Validated step graph of one workflow template.
#[derive(Debug)]
pub struct StepGraph {
    graph: DiGraph<StepTemplate, EdgeCondition>,
    index: HashMap<String, NodeIndex>,
}

impl StepGraph {
    /// Build and validate the graph for `template`.
    ///
    /// # Errors
    /// - `InvalidTemplate` for an empty template, duplicate step names,
    ///   duplicate fan-out parts or unknown predecessors
    /// - `CyclicDependency` if the steps form a cycle
    pub fn from_template(template: &WorkflowTemplate) -> Result<Self> {
        Self::from_steps(&template.steps)
    }

    pub fn from_steps(steps: &[StepTemplate]) -> Result<Self> {
        if steps.is_empty() {
            return Err(Error::InvalidTemplate("workflow has no steps".to_string()));
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut task_ids = HashSet::new();

        for step in steps {
            if step.name.trim().is_empty() {
                return Err(Error::InvalidTemplate("step with empty name".to_string()));
            }
            if index.contains_key(&step.name) {
                return Err(Error::InvalidTemplate(format!(
                    "duplicate step name: {}",
                    step.name
                )));
            }
            let mut parts = HashSet::new();
            if let Some(dup) = step.fan_out.iter().find(|p| !parts.insert(p.as_str())) {
                return Err(Error::InvalidTemplate(format!(
                    "step {} repeats fan-out part {}",
                    step.name, dup
                )));
            }
            if let Some(clash) = step.task_ids().into_iter().find(|id| !task_ids.insert(id.clone())) {
                return Err(Error::InvalidTemplate(format!(
                    "task id {} produced by more than one step",
                    clash
                )));
            }
            let node = graph.add_node(step.clone());
            index.insert(step.name.clone(), node);
        }

        for step in steps {
            let to = index[&step.name];
            for pred in &step.after {
                let from = *index.get(pred.step()).ok_or_else(|| {
                    Error::InvalidTemplate(format!(
                        "step {} follows unknown step {}",
                        step.name,
                        pred.step()
                    ))
                })?;
                let condition = match pred.condition() {
                    Some(outcome) => EdgeCondition::On(outcome),
                    None => EdgeCondition::Always,
                };
                graph.add_edge(from, to, condition);
            }
        }

        toposort(&graph, None).map_err(|cycle| {
            let name = graph
                .node_weight(cycle.node_id())
                .map(|s| s.name.clone())
                .unwrap_or_default();
            Error::CyclicDependency(format!("step {}", name))
        })?;

        Ok(Self { graph, index })
    }

    pub fn step(&self, name: &str) -> Option<&StepTemplate> {
        self.index.get(name).and_then(|i| self.graph.node_weight(*i))
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All steps in template order.
    pub fn steps(&self) -> impl Iterator<Item = &StepTemplate> {
        self.graph.node_weights()
    }

    /// Incoming edges of `name` as `(predecessor, condition)`.
    pub fn incoming(&self, name: &str) -> Vec<(&StepTemplate, EdgeCondition)> {
        self.edges(name, Direction::Incoming)
    }

    /// Outgoing edges of `name` as `(successor, condition)`.
    pub fn outgoing(&self, name: &str) -> Vec<(&StepTemplate, EdgeCondition)> {
        self.edges(name, Direction::Outgoing)
    }

    fn edges(&self, name: &str, direction: Direction) -> Vec<(&StepTemplate, EdgeCondition)> {
        let Some(&node) = self.index.get(name) else {
            return Vec::new();
        };
        let mut edges: Vec<(NodeIndex, EdgeCondition)> = self
            .graph
            .edges_directed(node, direction)
            .map(|e| {
                let other = match direction {
                    Direction::Incoming => e.source(),
                    Direction::Outgoing => e.target(),
                };
                (other, *e.weight())
            })
            .collect();
        edges.sort_by_key(|(i, _)| i.index());
        edges
            .into_iter()
            .filter_map(|(i, c)| self.graph.node_weight(i).map(|s| (s, c)))
            .collect()
    }

    /// A failed outcome is handled when some outgoing edge is labelled `failed`.
    pub fn handles_failure(&self, name: &str) -> bool {
        self.outgoing(name)
            .iter()
            .any(|(_, c)| *c == EdgeCondition::On(StepOutcome::Failed))
    }

    /// Steps whose outcome is `Failed` with no `failed` edge to follow.
    pub fn unhandled_failures(&self, run: &WorkflowRun) -> Vec<String> {
        self.steps()
            .filter(|s| run.step_outcomes.get(&s.name) == Some(&StepOutcome::Failed))
            .filter(|s| !self.handles_failure(&s.name))
            .map(|s| s.name.clone())
            .collect()
    }

    /// Compute the next frontier for `run`.
    ///
    /// A step that is not yet settled is considered once every predecessor
    /// is settled. It is ready when at least one incoming edge was taken and
    /// no predecessor failed without a handler; otherwise it is skipped.
    /// Skips cascade, so the returned `skipped` list is complete.
    pub fn frontier(&self, run: &WorkflowRun) -> Frontier {
        let mut settled: HashSet<&str> = self
            .steps()
            .map(|s| s.name.as_str())
            .filter(|name| run.is_settled(name))
            .collect();
        let mut frontier = Frontier::default();

        loop {
            let mut newly_skipped = Vec::new();

            for step in self.steps() {
                let name = step.name.as_str();
                if settled.contains(name) || frontier.ready.iter().any(|r| r == name) {
                    continue;
                }

                let incoming = self.incoming(name);
                if incoming.is_empty() {
                    frontier.ready.push(step.name.clone());
                    continue;
                }
                if !incoming.iter().all(|(p, _)| settled.contains(p.name.as_str())) {
                    continue;
                }

                let mut taken = false;
                let mut blocked = false;
                for (pred, condition) in &incoming {
                    match run.step_outcomes.get(&pred.name) {
                        Some(outcome) if condition.is_taken(*outcome) => taken = true,
                        Some(StepOutcome::Failed) if !self.handles_failure(&pred.name) => {
                            blocked = true
                        }
                        _ => {}
                    }
                }

                if taken && !blocked {
                    frontier.ready.push(step.name.clone());
                } else {
                    newly_skipped.push(name);
                }
            }

            if newly_skipped.is_empty() {
                break;
            }
            for name in newly_skipped {
                settled.insert(name);
                frontier.skipped.push(name.to_string());
            }
        }

        let order: HashMap<&str, usize> = self
            .steps()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();
        frontier.ready.sort_by_key(|n| order.get(n.as_str()).copied());
        frontier.skipped.sort_by_key(|n| order.get(n.as_str()).copied());
        frontier
    }
}
