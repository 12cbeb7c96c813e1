use super::rr_to_ms;

/// Shortest RR interval accepted for variability, in ms (200 bpm)
pub const MIN_RR_MS: f64 = 300.0;

/// Longest RR interval accepted for variability, in ms (30 bpm)
pub const MAX_RR_MS: f64 = 2000.0;

/// Root mean square of successive RR differences, in milliseconds.
///
/// Needs at least two intervals, all within 300-2000 ms; anything else is
/// treated as an artifact and yields `None`.
pub fn rmssd(rr_intervals: &[u16]) -> Option<f64> {
    if rr_intervals.len() < 2 {
        return None;
    }

    let ms: Vec<f64> = rr_intervals.iter().map(|&rr| rr_to_ms(rr)).collect();
    if ms.iter().any(|&v| !(MIN_RR_MS..=MAX_RR_MS).contains(&v)) {
        return None;
    }

    let sum_sq: f64 = ms.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum();
    Some((sum_sq / (ms.len() - 1) as f64).sqrt())
}
