//! Dependency graph over workflow steps.
//!
//! [`find_cycle`] reports a cycle as the path that closes it, [`topological_order`]
//! produces a Kahn ordering with ties broken by input order, and
//! [`StepScheduler`] drives execution: it tracks remaining in-degrees and
//! yields steps as their dependencies finish.

use std::collections::{BTreeSet, HashMap};

/// A step id and the ids it must wait for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepNode {
    pub id: String,
    pub deps: Vec<String>,
}

impl StepNode {
    pub fn new(id: impl Into<String>, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id: id.into(),
            deps: deps.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

/// Find a dependency cycle with a depth-first walk that tracks the current path.
///
/// Returns the cycle as a closed path (`["a", "c", "b", "a"]`). Edges to
/// unknown ids are ignored; those are reported separately.
pub fn find_cycle(nodes: &[StepNode]) -> Option<Vec<String>> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; nodes.len()];

    for start in 0..nodes.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        // Explicit (node, next dep position) stack keeps deep graphs off the call stack.
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        marks[start] = Mark::OnPath;

        while let Some((node, pos)) = stack.last_mut() {
            let node = *node;
            let Some(dep) = nodes[node].deps.get(*pos) else {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            };
            *pos += 1;

            let Some(&next) = index.get(dep.as_str()) else {
                continue;
            };
            match marks[next] {
                Mark::Unvisited => {
                    marks[next] = Mark::OnPath;
                    stack.push((next, 0));
                }
                Mark::OnPath => {
                    let from = stack.iter().position(|&(n, _)| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[from..]
                        .iter()
                        .map(|&(n, _)| nodes[n].id.clone())
                        .collect();
                    cycle.push(nodes[next].id.clone());
                    return Some(cycle);
                }
                Mark::Done => {}
            }
        }
    }
    None
}

/// Kahn ordering of `nodes`. Among ready steps the earliest in input order
/// goes first.
///
/// Returns the ids that could not be ordered when the graph has a cycle.
pub fn topological_order(nodes: &[StepNode]) -> Result<Vec<String>, Vec<String>> {
    let mut scheduler = StepScheduler::new(nodes);
    let mut ready: BTreeSet<usize> = scheduler.initially_ready().into_iter().collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(next) = ready.pop_first() {
        order.push(nodes[next].id.clone());
        ready.extend(scheduler.complete(next));
    }

    if order.len() == nodes.len() {
        Ok(order)
    } else {
        Err(nodes
            .iter()
            .filter(|n| !order.contains(&n.id))
            .map(|n| n.id.clone())
            .collect())
    }
}

/// Execution-time dependency tracking, by input position.
#[derive(Debug)]
pub struct StepScheduler {
    /// Reverse dependencies: step -> steps waiting on it.
    dependents: Vec<Vec<usize>>,
    /// Unfinished dependency count per step.
    remaining: Vec<usize>,
    /// Forward dependencies, kept for branch-skip propagation.
    deps: Vec<Vec<usize>>,
}

impl StepScheduler {
    /// Build from validated nodes. Edges to unknown ids are dropped.
    pub fn new(nodes: &[StepNode]) -> Self {
        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();

        let mut dependents = vec![Vec::new(); nodes.len()];
        let mut deps = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for dep in &node.deps {
                if let Some(&d) = index.get(dep.as_str())
                    && !deps[i].contains(&d)
                {
                    deps[i].push(d);
                    dependents[d].push(i);
                }
            }
        }
        let remaining = deps.iter().map(Vec::len).collect();

        Self {
            dependents,
            remaining,
            deps,
        }
    }

    /// Steps with no dependencies, in input order.
    pub fn initially_ready(&self) -> Vec<usize> {
        (0..self.remaining.len())
            .filter(|&i| self.remaining[i] == 0)
            .collect()
    }

    /// Mark `step` finished. Returns dependents that just became ready, in
    /// input order.
    pub fn complete(&mut self, step: usize) -> Vec<usize> {
        let mut newly_ready = Vec::new();
        for &ds in &self.dependents[step] {
            let deg = &mut self.remaining[ds];
            *deg = deg.saturating_sub(1);
            if *deg == 0 {
                newly_ready.push(ds);
            }
        }
        newly_ready.sort_unstable();
        newly_ready
    }

    pub fn deps_of(&self, step: usize) -> &[usize] {
        &self.deps[step]
    }

    pub fn len(&self) -> usize {
        self.remaining.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }
}
