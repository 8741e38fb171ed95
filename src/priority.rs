//! Deterministic candidate ordering for batch selection.

use std::cmp::Ordering;

use crate::operation::Operation;

/// Total order over candidates: priority weight descending, then
/// `created_at` ascending (FIFO within a tier), then id as a final
/// tie-break so the order is stable across repeated calls.
pub fn compare(a: &Operation, b: &Operation) -> Ordering {
    b.priority
        .weight()
        .partial_cmp(&a.priority.weight())
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Sort a candidate set into selection order.
pub fn sort_candidates(candidates: &mut [Operation]) {
    candidates.sort_by(compare);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationPriority, OperationSpec};
    use chrono::Duration;

    fn op(priority: OperationPriority) -> Operation {
        Operation::from_spec(
            OperationSpec::new("customer", "edit").with_priority(priority),
            3,
        )
    }

    #[test]
    fn test_priority_beats_age() {
        let mut older_low = op(OperationPriority::Low);
        older_low.created_at -= Duration::seconds(60);
        let newer_critical = op(OperationPriority::Critical);

        let mut candidates = vec![older_low.clone(), newer_critical.clone()];
        sort_candidates(&mut candidates);

        assert_eq!(candidates[0].id, newer_critical.id);
        assert_eq!(candidates[1].id, older_low.id);
    }

    #[test]
    fn test_fifo_within_tier() {
        let mut first = op(OperationPriority::Normal);
        first.created_at -= Duration::seconds(10);
        let second = op(OperationPriority::Normal);

        let mut candidates = vec![second.clone(), first.clone()];
        sort_candidates(&mut candidates);

        assert_eq!(candidates[0].id, first.id);
    }

    #[test]
    fn test_order_is_stable_across_calls() {
        let ops: Vec<Operation> = vec![
            op(OperationPriority::High),
            op(OperationPriority::Low),
            op(OperationPriority::Critical),
            op(OperationPriority::Normal),
        ];

        let mut a = ops.clone();
        let mut b = ops.clone();
        b.reverse();
        sort_candidates(&mut a);
        sort_candidates(&mut b);

        let ids_a: Vec<_> = a.iter().map(|o| o.id).collect();
        let ids_b: Vec<_> = b.iter().map(|o| o.id).collect();
        assert_eq!(ids_a, ids_b);
    }
}
