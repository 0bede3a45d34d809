// =============================================================================
// Indicator Functions — time-aligned SMA / EMA / RSI
// =============================================================================
//
// Every function returns a series with exactly the same length as its input,
// NaN-padded at the head where the look-back window is not yet full.  Keeping
// the output index-aligned with the candle table lets script outputs be
// plotted against open times without offset bookkeeping.
// =============================================================================

/// Simple moving average.  `result[i]` is the mean of `values[i+1-period ..= i]`
/// once `i >= period - 1`, NaN before that.
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let mut result = vec![f64::NAN; values.len()];
    if period == 0 || values.len() < period {
        return result;
    }

    let mut sum: f64 = values[..period].iter().sum();
    result[period - 1] = sum / period as f64;
    for i in period..values.len() {
        sum += values[i] - values[i - period];
        result[i] = sum / period as f64;
    }
    result
}

/// Exponential moving average, seeded with the SMA of the first `period`
/// values.
///
///   multiplier = 2 / (period + 1)
///   ema[i]     = value[i] * multiplier + ema[i-1] * (1 - multiplier)
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let mut result = vec![f64::NAN; values.len()];
    if period == 0 || values.len() < period {
        return result;
    }

    let multiplier = 2.0 / (period + 1) as f64;
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    result[period - 1] = seed;

    let mut prev = seed;
    for i in period..values.len() {
        let next = values[i] * multiplier + prev * (1.0 - multiplier);
        result[i] = next;
        prev = next;
    }
    result
}

/// Relative Strength Index with Wilder's smoothing.  The first `period`
/// positions are NaN (those closes seed the averages).
pub fn rsi(values: &[f64], period: usize) -> Vec<f64> {
    let mut result = vec![f64::NAN; values.len()];
    if period == 0 || values.len() < period + 1 {
        return result;
    }

    let deltas: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;
    result[period] = rsi_from_averages(avg_gain, avg_loss);

    for (i, &delta) in deltas.iter().enumerate().skip(period) {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
        result[i + 1] = rsi_from_averages(avg_gain, avg_loss);
    }
    result
}

/// RSI in [0, 100] from smoothed averages.  Both averages zero means a flat
/// market (50.0); zero loss with gains clamps to 100.0.
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_is_head_padded_and_aligned() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let out = sma(&values, 3);
        assert_eq!(out.len(), values.len());
        assert!(out[0].is_nan());
        assert!(out[1].is_nan());
        assert!((out[2] - 2.0).abs() < 1e-10);
        assert!((out[4] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn sma_degenerate_inputs_are_all_nan() {
        assert!(sma(&[1.0, 2.0], 0).iter().all(|v| v.is_nan()));
        assert!(sma(&[1.0, 2.0], 5).iter().all(|v| v.is_nan()));
        assert!(sma(&[], 3).is_empty());
    }

    #[test]
    fn ema_seeds_with_sma_then_smooths() {
        // 5-period EMA of 1..=10: seed = 3.0 at index 4, multiplier = 1/3.
        let values: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let out = ema(&values, 5);
        assert_eq!(out.len(), 10);
        assert!(out[3].is_nan());
        assert!((out[4] - 3.0).abs() < 1e-10);

        let mult = 2.0 / 6.0;
        let mut expected = 3.0;
        for i in 5..10 {
            expected = values[i] * mult + expected * (1.0 - mult);
            assert!((out[i] - expected).abs() < 1e-10);
        }
    }

    #[test]
    fn rsi_extremes() {
        let rising: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let out = rsi(&rising, 14);
        assert_eq!(out.len(), 30);
        assert!(out[13].is_nan());
        assert!((out[14] - 100.0).abs() < 1e-10);
        assert!((out[29] - 100.0).abs() < 1e-10);

        let falling: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        let out = rsi(&falling, 14);
        assert!(out[29].abs() < 1e-10);

        let flat = vec![100.0; 30];
        let out = rsi(&flat, 14);
        assert!((out[20] - 50.0).abs() < 1e-10);
    }

    #[test]
    fn rsi_stays_in_range() {
        let values = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        for v in rsi(&values, 14) {
            if !v.is_nan() {
                assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
            }
        }
    }
}
