//! Trend indicators for the congestion monitors: an order-1 Savitzky-Golay
//! filter and the classical Wilder RSI.

/// Smooth a series with a Savitzky-Golay filter of polynomial order 1: each
/// point becomes the least-squares line over its trailing window, evaluated
/// at that point.
pub fn savgol(data: &[f64], window: usize) -> Vec<f64> {
    data.iter()
        .enumerate()
        .map(|(i, _)| {
            let start = (i + 1).saturating_sub(window.max(1));
            linear_fit_last(&data[start..=i])
        })
        .collect()
}

/// Least-squares line over `points` (x = 0..n), evaluated at the last x.
fn linear_fit_last(points: &[f64]) -> f64 {
    let n = points.len();
    if n < 2 {
        return points[n - 1];
    }
    let n_f = n as f64;
    let sum_x: f64 = (0..n).map(|x| x as f64).sum();
    let sum_y: f64 = points.iter().sum();
    let sum_xy: f64 = points.iter().enumerate().map(|(x, y)| x as f64 * y).sum();
    let sum_x2: f64 = (0..n).map(|x| (x * x) as f64).sum();
    let denominator = n_f * sum_x2 - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return points[n - 1];
    }
    let slope = (n_f * sum_xy - sum_x * sum_y) / denominator;
    let intercept = (sum_y - slope * sum_x) / n_f;
    intercept + slope * (n_f - 1.0)
}

/// Classical Wilder RSI. Returns the neutral 50 when the series is shorter
/// than one period, 100 when there are no losses, 0 when there are no gains.
pub fn rsi(data: &[f64], period: usize) -> f64 {
    if period == 0 || data.len() < period + 1 {
        return 50.0;
    }
    let deltas: Vec<f64> = data.windows(2).map(|pair| pair[1] - pair[0]).collect();
    let period_f = period as f64;
    let mut average_gain = deltas[..period]
        .iter()
        .filter(|delta| **delta > 0.0)
        .sum::<f64>()
        / period_f;
    let mut average_loss = deltas[..period]
        .iter()
        .filter(|delta| **delta < 0.0)
        .map(|delta| -delta)
        .sum::<f64>()
        / period_f;
    for delta in &deltas[period..] {
        let (gain, loss) = if *delta >= 0.0 {
            (*delta, 0.0)
        } else {
            (0.0, -delta)
        };
        average_gain = (average_gain * (period_f - 1.0) + gain) / period_f;
        average_loss = (average_loss * (period_f - 1.0) + loss) / period_f;
    }
    if average_gain < f64::EPSILON && average_loss < f64::EPSILON {
        return 50.0;
    }
    if average_loss < f64::EPSILON {
        return 100.0;
    }
    100.0 - 100.0 / (1.0 + average_gain / average_loss)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn savgol_preserves_constant_series() {
        let data = vec![0.1; 20];
        let smoothed = savgol(&data, 14);
        assert_eq!(smoothed.len(), 20);
        for value in smoothed {
            assert!((value - 0.1).abs() < 1e-9);
        }
    }

    #[test]
    fn savgol_tracks_a_line_exactly() {
        let data: Vec<f64> = (0..30).map(|i| 2.0 + 0.5 * i as f64).collect();
        let smoothed = savgol(&data, 14);
        for (raw, smooth) in data.iter().zip(&smoothed) {
            assert!((raw - smooth).abs() < 1e-9);
        }
    }

    #[test]
    fn rsi_of_rising_series_is_high() {
        let data: Vec<f64> = (0..40).map(|i| i as f64).collect();
        assert!(rsi(&data, 14) > 70.0);
    }

    #[test]
    fn rsi_of_falling_series_is_low() {
        let data: Vec<f64> = (0..40).map(|i| 40.0 - i as f64).collect();
        assert!(rsi(&data, 14) < 30.0);
    }

    #[test]
    fn rsi_is_neutral_without_enough_samples() {
        assert_eq!(rsi(&[1.0, 2.0, 3.0], 14), 50.0);
        assert_eq!(rsi(&[0.1; 30], 14), 50.0);
    }
}
