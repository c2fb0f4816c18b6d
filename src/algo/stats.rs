//! Small descriptive statistics over value slices.

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Variance with `ddof` delta degrees of freedom (0 = population, 1 = sample).
pub fn variance(values: &[f64], ddof: usize) -> Option<f64> {
    if values.len() <= ddof {
        return None;
    }
    let mu = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - mu) * (v - mu)).sum();
    Some(ss / (values.len() - ddof) as f64)
}

/// `(mean, standard deviation)` in one pass over the slice.
pub fn mean_std(values: &[f64], ddof: usize) -> Option<(f64, f64)> {
    let mu = mean(values)?;
    let var = variance(values, ddof)?;
    Some((mu, var.sqrt()))
}

/// Percentile of an ascending-sorted slice, `q` in `[0, 1]`, linearly
/// interpolated between the closest ranks.
pub fn percentile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let q = q.clamp(0.0, 1.0);
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Percentile of an unsorted slice. Sorts a copy.
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    percentile_sorted(&sorted, q)
}

/// Whether `value` sits on `centre` up to a relative epsilon.
pub fn is_on_centre(value: f64, centre: f64) -> bool {
    (value - centre).abs() <= 1e-9 * centre.abs().max(1.0)
}
