//! Learning-rate annealing.

/// Learning rate for update `update` (1-based) of `num_updates`.
///
/// Decays linearly from `base` on the first update towards zero; the last
/// update runs at `base / num_updates`.
pub fn linear_anneal(base: f64, update: usize, num_updates: usize) -> f64 {
    if num_updates == 0 {
        return base;
    }
    let done = update.saturating_sub(1).min(num_updates) as f64;
    (1.0 - done / num_updates as f64) * base
}
