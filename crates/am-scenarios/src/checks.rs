//! Verification helpers for drained scenario results.

use std::collections::BTreeMap;
use std::fmt::Debug;

/// Pass, or fail with a human-readable reason.
pub type CheckResult = Result<(), String>;

/// Every expected value arrived exactly once, in any order.
pub fn verify_delivery<T: Ord + Debug + Copy>(delivered: &[T], expected: &[T]) -> CheckResult {
    if delivered.len() != expected.len() {
        return Err(format!(
            "delivered {} elements (expected {})",
            delivered.len(),
            expected.len()
        ));
    }
    let mut counts: BTreeMap<T, i64> = BTreeMap::new();
    for v in expected {
        *counts.entry(*v).or_default() += 1;
    }
    for v in delivered {
        let slot = counts.entry(*v).or_default();
        *slot -= 1;
        if *slot < 0 {
            return Err(format!("value {v:?} delivered more often than sent"));
        }
    }
    if let Some((missing, _)) = counts.iter().find(|(_, n)| **n > 0) {
        return Err(format!("value {missing:?} was never delivered"));
    }
    Ok(())
}

/// Every expected value arrived exactly once and in the expected order.
pub fn verify_ordered_delivery<T: Ord + Debug + Copy>(
    delivered: &[T],
    expected: &[T],
) -> CheckResult {
    verify_delivery(delivered, expected)?;
    if delivered != expected {
        return Err("delivery order differs from send order".into());
    }
    Ok(())
}

/// The transport saw exactly the expected number of full and flush-sealed
/// sends, and every send shape respects the coalescing capacity.
pub fn verify_send_shapes(
    full_sends: &[(usize, usize)],
    flushed_sends: &[(usize, usize)],
    capacity: usize,
    expected_full: usize,
    expected_flushed: usize,
) -> CheckResult {
    if full_sends.len() != expected_full {
        return Err(format!(
            "{} full-buffer sends (expected {expected_full})",
            full_sends.len()
        ));
    }
    if flushed_sends.len() != expected_flushed {
        return Err(format!(
            "{} flush-sealed sends (expected {expected_flushed})",
            flushed_sends.len()
        ));
    }
    if let Some((dest, count)) = full_sends.iter().find(|(_, count)| *count != capacity) {
        return Err(format!(
            "full send to {dest} carried {count} elements (capacity {capacity})"
        ));
    }
    if let Some((dest, count)) = flushed_sends
        .iter()
        .find(|(_, count)| *count == 0 || *count >= capacity)
    {
        return Err(format!(
            "flush-sealed send to {dest} carried {count} elements (must be in 1..{capacity})"
        ));
    }
    Ok(())
}
