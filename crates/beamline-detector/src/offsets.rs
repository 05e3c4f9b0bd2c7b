//! Clock and counter offsets derived from the scratch images and histories.

use beamline_core::Value;

/// Median of `values`, ignoring NaN. `None` if nothing is left.
pub fn median(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let mut sorted: Vec<f64> = values.into_iter().filter(|v| !v.is_nan()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    })
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
}

/// Estimate of `xdet_trig_count_offset` from `trig_count_at_image - image_number`
/// samples.
///
/// Returns the rounded median, or `None` when there are no samples or their
/// standard deviation is `max_spread` counts or more.
pub fn estimate_trig_count_offset(samples: &[i64], max_spread: f64) -> Option<i64> {
    let values: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
    let center = median(values.iter().copied())?;
    if std_dev(&values) >= max_spread {
        return None;
    }
    Some(center.round() as i64)
}

/// `trig - acq` at the latest instant at or before `at` where both counters
/// fired within `tolerance` seconds of each other.
///
/// Both slices are `(time, value)` pairs sorted by time, as returned by
/// [`beamline_core::EventHistory::events`].
pub fn acq_count_offset(
    trig: &[(f64, Value)],
    acq: &[(f64, Value)],
    at: f64,
    tolerance: f64,
) -> Option<i64> {
    let end = trig.partition_point(|(t, _)| *t <= at);
    trig[..end].iter().rev().find_map(|(t_trig, trig_value)| {
        let trig_count = trig_value.as_i64()?;
        let start = acq.partition_point(|(t, _)| *t < t_trig - tolerance);
        acq[start..]
            .iter()
            .take_while(|(t, _)| *t <= t_trig + tolerance)
            .filter_map(|(t, v)| v.as_i64().map(|count| ((t - t_trig).abs(), count)))
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, acq_count)| trig_count - acq_count)
    })
}
