//! Dynamic progress arithmetic.
//!
//! `steps_total` starts from the plan's estimate and grows whenever the
//! completed count catches up, so the user-visible percent approaches but
//! never reaches 100 until the workflow actually finishes.

/// User-visible percent, clamped to 0..=100.
pub fn percent(completed: usize, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let raw = (completed as u64 * 100) / total as u64;
    raw.min(100) as u8
}

/// New total after a step completes: grows by `delta` once the completed
/// count reaches the current total.
pub fn grown_total(completed: usize, total: u32, delta: u32) -> u32 {
    if completed as u64 >= total as u64 {
        total + delta
    } else {
        total
    }
}
