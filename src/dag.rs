//! DAG validation over a workflow's job set and dependency edges.
//!
//! Validation runs before any row is written for a workflow create or
//! update; a workflow whose edge set induces a cycle is rejected with no
//! partial state.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{FlowmeshError, Result};
use crate::model::DependencyEdge;

/// Validate that `edges` over `job_ids` form a DAG.
///
/// Edges are stored as (job, parent); traversal runs parent -> child.
/// Returns the jobs in a valid topological order (parents first), or
/// `CycleDetected` naming one participating cycle, or `MissingNode` if an
/// edge references a job outside the set.
pub fn validate(job_ids: &[i64], edges: &[DependencyEdge]) -> Result<Vec<i64>> {
    let nodes: HashSet<i64> = job_ids.iter().copied().collect();

    let mut children: HashMap<i64, Vec<i64>> = HashMap::new();
    let mut in_degree: HashMap<i64, usize> = nodes.iter().map(|&id| (id, 0)).collect();

    for edge in edges {
        if !nodes.contains(&edge.job_id) {
            return Err(FlowmeshError::MissingNode(edge.job_id));
        }
        if !nodes.contains(&edge.parent_job_id) {
            return Err(FlowmeshError::MissingNode(edge.parent_job_id));
        }
        children
            .entry(edge.parent_job_id)
            .or_default()
            .push(edge.job_id);
        *in_degree.entry(edge.job_id).or_insert(0) += 1;
    }

    // Kahn's algorithm: repeatedly remove zero-in-degree nodes. Anything
    // left over participates in (or depends on) a cycle.
    let mut queue: VecDeque<i64> = {
        let mut roots: Vec<i64> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        roots.sort_unstable();
        roots.into()
    };

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(id) = queue.pop_front() {
        order.push(id);
        if let Some(kids) = children.get(&id) {
            for &child in kids {
                let deg = in_degree
                    .get_mut(&child)
                    .ok_or(FlowmeshError::MissingNode(child))?;
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(child);
                }
            }
        }
    }

    if order.len() == nodes.len() {
        return Ok(order);
    }

    let remaining: HashSet<i64> = nodes
        .iter()
        .copied()
        .filter(|id| !order.contains(id))
        .collect();
    Err(FlowmeshError::CycleDetected(describe_cycle(
        &remaining, edges,
    )))
}

/// Walk parent links inside the remaining node set until a node repeats,
/// producing one concrete cycle for the error message.
fn describe_cycle(remaining: &HashSet<i64>, edges: &[DependencyEdge]) -> String {
    let mut parent_of: HashMap<i64, i64> = HashMap::new();
    for edge in edges {
        if remaining.contains(&edge.job_id) && remaining.contains(&edge.parent_job_id) {
            parent_of.entry(edge.job_id).or_insert(edge.parent_job_id);
        }
    }

    let start = match remaining.iter().min() {
        Some(&id) => id,
        None => return "empty cycle set".to_string(),
    };

    let mut path = vec![start];
    let mut current = start;
    while let Some(&parent) = parent_of.get(&current) {
        if let Some(pos) = path.iter().position(|&id| id == parent) {
            let cycle: Vec<String> = path[pos..].iter().map(|id| id.to_string()).collect();
            return format!("{} -> {}", cycle.join(" -> "), parent);
        }
        path.push(parent);
        current = parent;
    }

    path.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// All transitive children of `start`, excluding `start` itself. Used by
/// cascade rerun to reset everything downstream of a node.
pub fn downstream_closure(start: i64, edges: &[DependencyEdge]) -> Vec<i64> {
    let mut children: HashMap<i64, Vec<i64>> = HashMap::new();
    for edge in edges {
        children
            .entry(edge.parent_job_id)
            .or_default()
            .push(edge.job_id);
    }

    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        if let Some(kids) = children.get(&id) {
            for &child in kids {
                if visited.insert(child) {
                    queue.push_back(child);
                }
            }
        }
    }

    let mut result: Vec<i64> = visited.into_iter().collect();
    result.sort_unstable();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(job_id: i64, parent_job_id: i64) -> DependencyEdge {
        DependencyEdge {
            job_id,
            parent_job_id,
        }
    }

    #[test]
    fn empty_workflow_is_valid() {
        assert_eq!(validate(&[], &[]).unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn single_chain_orders_parents_first() {
        // 1 -> 2 -> 3
        let order = validate(&[3, 1, 2], &[edge(2, 1), edge(3, 2)]).unwrap();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn diamond_is_valid() {
        // C depends on A and B
        let order = validate(&[1, 2, 3], &[edge(3, 1), edge(3, 2)]).unwrap();
        assert_eq!(order.last(), Some(&3));
    }

    #[test]
    fn self_edge_is_a_cycle() {
        let err = validate(&[1], &[edge(1, 1)]).unwrap_err();
        assert!(matches!(err, FlowmeshError::CycleDetected(_)));
    }

    #[test]
    fn two_node_cycle_is_rejected_and_named() {
        let err = validate(&[1, 2], &[edge(2, 1), edge(1, 2)]).unwrap_err();
        match err {
            FlowmeshError::CycleDetected(desc) => {
                assert!(desc.contains("1"));
                assert!(desc.contains("2"));
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn cycle_behind_valid_prefix_is_rejected() {
        // 1 -> 2, then 3 <-> 4
        let err = validate(&[1, 2, 3, 4], &[edge(2, 1), edge(4, 3), edge(3, 4)]).unwrap_err();
        assert!(matches!(err, FlowmeshError::CycleDetected(_)));
    }

    #[test]
    fn edge_to_unknown_job_is_rejected() {
        let err = validate(&[1, 2], &[edge(2, 99)]).unwrap_err();
        assert!(matches!(err, FlowmeshError::MissingNode(99)));
    }

    #[test]
    fn downstream_closure_is_transitive() {
        // 1 -> 2 -> 3, 1 -> 4
        let edges = [edge(2, 1), edge(3, 2), edge(4, 1)];
        assert_eq!(downstream_closure(1, &edges), vec![2, 3, 4]);
        assert_eq!(downstream_closure(2, &edges), vec![3]);
        assert!(downstream_closure(3, &edges).is_empty());
    }
}
