//! Dependency gating and cycle validation.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::operation::{ExecutionResult, Operation};

/// Whether an operation may be selected into a batch right now.
///
/// Eligible means: currently pending, its backoff window (if any) has
/// elapsed, and every dependency has a recorded successful outcome. An
/// outstanding or failed dependency leaves the operation pending; it is
/// re-evaluated on every scheduling pass and never failed on that basis
/// alone.
pub fn is_eligible(
    op: &Operation,
    operations: &HashMap<Uuid, Operation>,
    results: &HashMap<Uuid, ExecutionResult>,
    now: DateTime<Utc>,
) -> bool {
    if !matches!(op.status, crate::operation::OperationStatus::Pending) {
        return false;
    }
    if let Some(next_attempt) = op.next_attempt_at {
        if next_attempt > now {
            return false;
        }
    }
    op.dependencies.iter().all(|dep| {
        match results.get(dep) {
            Some(result) => result.success,
            // Result may have been pruned by retention; a completed
            // operation still satisfies its dependents.
            None => operations
                .get(dep)
                .is_some_and(|dep_op| dep_op.status.satisfies_dependencies()),
        }
    })
}

/// Validate that adding `candidate_id` with `candidate_deps` keeps the
/// dependency graph acyclic.
///
/// Iterative DFS over the edge set `operation -> its dependencies`,
/// starting from the candidate. Fails with `DependencyCycle` if the walk
/// re-enters any node on the current path (this also rejects pre-existing
/// cycles reachable from the candidate, e.g. out of a corrupt snapshot).
pub fn validate_acyclic(
    candidate_id: Uuid,
    candidate_deps: &[Uuid],
    existing: &HashMap<Uuid, Operation>,
) -> Result<()> {
    let deps_of = |id: Uuid| -> &[Uuid] {
        if id == candidate_id {
            candidate_deps
        } else {
            existing.get(&id).map(|op| op.dependencies.as_slice()).unwrap_or(&[])
        }
    };

    // (node, next child index) stack; `on_path` tracks the current DFS path.
    let mut stack: Vec<(Uuid, usize)> = vec![(candidate_id, 0)];
    let mut on_path: Vec<Uuid> = vec![candidate_id];
    let mut finished: std::collections::HashSet<Uuid> = std::collections::HashSet::new();

    while let Some((node, child_idx)) = stack.pop() {
        let deps = deps_of(node);
        if child_idx < deps.len() {
            let child = deps[child_idx];
            stack.push((node, child_idx + 1));
            if on_path.contains(&child) {
                return Err(SyncError::DependencyCycle(child));
            }
            if !finished.contains(&child) {
                stack.push((child, 0));
                on_path.push(child);
            }
        } else {
            finished.insert(node);
            on_path.pop();
        }
    }
    Ok(())
}
