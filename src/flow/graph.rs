//! Static analysis of a flow's step graph.
//!
//! An edge `a -> b` exists when `a` emits a kind that `b` subscribes to.
//! Definitions are rejected unless that graph is acyclic.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::warn;

use crate::error::{Error, Result};
use crate::model::flow::{AwaitKind, AwaitSpec, FlowDefinition, StepRole};
use crate::scheduler::schedule;

/// Adjacency and levelling of a validated flow.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowGraph {
    /// `step -> steps fed by it`.
    pub edges: BTreeMap<String, BTreeSet<String>>,
    /// Steps grouped by longest distance from an entry step.
    pub levels: Vec<Vec<String>>,
    /// Subscribed kinds no step emits; they can only arrive from outside.
    pub external_kinds: BTreeSet<String>,
}

impl FlowGraph {
    /// Validate `flow` and compute its graph.
    pub fn analyze(flow: &FlowDefinition) -> Result<Self> {
        if flow.name.trim().is_empty() {
            return Err(Error::Validation("flow name must not be empty".into()));
        }
        if flow.steps.is_empty() {
            return Err(Error::Validation(format!("flow '{}' has no steps", flow.name)));
        }

        let mut names = HashSet::new();
        for step in &flow.steps {
            if step.name.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "flow '{}' has a step with an empty name",
                    flow.name
                )));
            }
            if !names.insert(step.name.as_str()) {
                return Err(Error::Validation(format!(
                    "flow '{}' defines step '{}' twice",
                    flow.name, step.name
                )));
            }
            match step.role {
                StepRole::Entry if !step.subscribes.is_empty() => {
                    return Err(Error::Validation(format!(
                        "entry step '{}' must not subscribe to events",
                        step.name
                    )));
                }
                StepRole::Step if step.subscribes.is_empty() => {
                    return Err(Error::Validation(format!(
                        "step '{}' subscribes to nothing and can never run",
                        step.name
                    )));
                }
                _ => {}
            }
            if step.retry.attempts == 0 {
                return Err(Error::Validation(format!(
                    "step '{}' must allow at least one attempt",
                    step.name
                )));
            }
            for spec in [&step.await_before, &step.await_after].into_iter().flatten() {
                validate_await(&step.name, spec)?;
            }
        }
        if flow.entry_steps().next().is_none() {
            return Err(Error::Validation(format!(
                "flow '{}' has no entry step",
                flow.name
            )));
        }

        let mut edges: BTreeMap<String, BTreeSet<String>> = flow
            .steps
            .iter()
            .map(|s| (s.name.clone(), BTreeSet::new()))
            .collect();
        for from in &flow.steps {
            for kind in &from.emits {
                for to in flow.subscribers_of(kind) {
                    if let Some(targets) = edges.get_mut(&from.name) {
                        targets.insert(to.name.clone());
                    }
                }
            }
        }

        let levels = levels(&edges).map_err(|cycle| {
            Error::Validation(format!(
                "flow '{}' has a cycle: {}",
                flow.name,
                cycle.join(" -> ")
            ))
        })?;

        let emitted: BTreeSet<&str> = flow
            .steps
            .iter()
            .flat_map(|s| s.emits.iter().map(String::as_str))
            .collect();
        let external_kinds: BTreeSet<String> = flow
            .steps
            .iter()
            .flat_map(|s| s.subscribes.iter())
            .filter(|k| !emitted.contains(k.as_str()))
            .cloned()
            .collect();
        for kind in &external_kinds {
            warn!(flow = %flow.name, kind = %kind, "subscribed kind is not emitted by any step");
        }

        Ok(Self {
            edges,
            levels,
            external_kinds,
        })
    }

    /// Steps in a valid execution order.
    pub fn topological_order(&self) -> impl Iterator<Item = &str> {
        self.levels.iter().flatten().map(String::as_str)
    }
}

fn validate_await(step: &str, spec: &AwaitSpec) -> Result<()> {
    match &spec.kind {
        AwaitKind::Webhook { method, path } => {
            if method.trim().is_empty() || path.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "webhook await on step '{step}' needs a method and a path"
                )));
            }
        }
        AwaitKind::Schedule { cron, timezone } => {
            schedule::parse_cron(cron)?;
            schedule::parse_timezone(timezone.as_deref())?;
        }
        AwaitKind::Time { .. } => {}
    }
    Ok(())
}

/// Kahn's algorithm by waves. On failure returns the steps of one cycle.
fn levels(edges: &BTreeMap<String, BTreeSet<String>>) -> std::result::Result<Vec<Vec<String>>, Vec<String>> {
    let mut indegree: BTreeMap<&str, usize> = edges.keys().map(|k| (k.as_str(), 0)).collect();
    for targets in edges.values() {
        for t in targets {
            if let Some(d) = indegree.get_mut(t.as_str()) {
                *d += 1;
            }
        }
    }

    let mut levels = Vec::new();
    let mut frontier: Vec<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(k, _)| *k)
        .collect();
    let mut placed = 0;
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for node in &frontier {
            for t in &edges[*node] {
                if let Some(d) = indegree.get_mut(t.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        next.push(t.as_str());
                    }
                }
            }
        }
        placed += frontier.len();
        levels.push(frontier.iter().map(|s| s.to_string()).collect());
        next.sort_unstable();
        frontier = next;
    }

    if placed == edges.len() {
        return Ok(levels);
    }
    let remaining: BTreeSet<&str> = indegree
        .into_iter()
        .filter(|(_, d)| *d > 0)
        .map(|(k, _)| k)
        .collect();
    Err(find_cycle(edges, &remaining))
}

/// Walk successors inside `remaining`, only along edges that can lead back,
/// until a node repeats.
fn find_cycle(edges: &BTreeMap<String, BTreeSet<String>>, remaining: &BTreeSet<&str>) -> Vec<String> {
    let Some(start) = remaining.iter().next() else {
        return Vec::new();
    };
    let mut path: Vec<&str> = vec![start];
    let mut seen: HashSet<&str> = HashSet::from([*start]);
    loop {
        let current = path[path.len() - 1];
        let Some(next) = edges[current]
            .iter()
            .map(String::as_str)
            .find(|n| remaining.contains(n) && has_path_back(edges, remaining, n, current))
        else {
            return path.iter().map(|s| s.to_string()).collect();
        };
        if !seen.insert(next) {
            let from = path.iter().position(|n| *n == next).unwrap_or(0);
            let mut cycle: Vec<String> = path[from..].iter().map(|s| s.to_string()).collect();
            cycle.push(next.to_string());
            return cycle;
        }
        path.push(next);
    }
}

fn has_path_back(
    edges: &BTreeMap<String, BTreeSet<String>>,
    remaining: &BTreeSet<&str>,
    from: &str,
    to: &str,
) -> bool {
    let mut stack = vec![from];
    let mut visited = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if !visited.insert(node) {
            continue;
        }
        for n in &edges[node] {
            if remaining.contains(n.as_str()) {
                stack.push(n.as_str());
            }
        }
    }
    false
}
