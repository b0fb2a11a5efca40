/// Compute summary metrics (mean, median, 25th percentile, 75th percentile) from samples
pub fn compute_metrics(samples: &[f64]) -> Option<(f64, f64, f64, f64)> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let mean = samples.iter().sum::<f64>() / n as f64;
    let median = sorted[n / 2];
    let p25 = sorted[n / 4];
    let p75 = sorted[3 * n / 4];
    Some((mean, median, p25, p75))
}

/// Wall-clock seconds of every attempt that actually ran the model.
pub fn attempt_durations_secs<'a>(
    results: impl IntoIterator<Item = &'a crate::model::RunResult>,
) -> Vec<f64> {
    results
        .into_iter()
        .filter(|r| !r.reused)
        .map(|r| r.duration_ms as f64 / 1000.0)
        .collect()
}
