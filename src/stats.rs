//! Weighted gas price statistics for observed blocks

/// Per-block gas price summary, in the unit of the input prices
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BlockStats {
    pub tx_count: usize,
    pub avg_gas_price: f64,
    pub median_gas_price: f64,
    pub q5_gas_price: f64,
    pub q95_gas_price: f64,
}

/// Weighted percentiles with numpy-style linear interpolation.
///
/// Values are sorted, each gets the position `cumsum(w) - w/2` normalised
/// by the total weight, and every quantile in `[0, 1]` is interpolated on
/// that axis (clamped to the first/last value outside it). A non-positive
/// total weight falls back to equal weights.
pub fn weighted_quantile(values: &[f64], quantiles: &[f64], weights: &[f64]) -> Vec<f64> {
    assert_eq!(values.len(), weights.len(), "values and weights differ in length");
    assert!(
        quantiles.iter().all(|q| (0.0..=1.0).contains(q)),
        "quantiles should be in [0, 1]"
    );

    if values.is_empty() {
        return vec![0.0; quantiles.len()];
    }

    let mut pairs: Vec<(f64, f64)> = values.iter().copied().zip(weights.iter().copied()).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let total: f64 = pairs.iter().map(|(_, w)| w).sum();
    if !(total > 0.0) {
        pairs.iter_mut().for_each(|(_, w)| *w = 1.0);
    }
    let total: f64 = pairs.iter().map(|(_, w)| w).sum();

    let mut cumulative = 0.0;
    let positions: Vec<f64> = pairs
        .iter()
        .map(|(_, w)| {
            cumulative += w;
            (cumulative - 0.5 * w) / total
        })
        .collect();
    let sorted: Vec<f64> = pairs.iter().map(|(v, _)| *v).collect();

    quantiles.iter().map(|q| interpolate(*q, &positions, &sorted)).collect()
}

/// `numpy.interp` for a non-decreasing `xp`
fn interpolate(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let last = xp.len() - 1;
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[last] {
        return fp[last];
    }

    // first index with xp[i] > x; 1 <= i <= last here
    let i = xp.partition_point(|p| *p <= x);
    let (x0, x1) = (xp[i - 1], xp[i]);
    let (y0, y1) = (fp[i - 1], fp[i]);
    if x1 == x0 {
        return y1;
    }
    y0 + (x - x0) * (y1 - y0) / (x1 - x0)
}

/// Summarise `(gas_price, gas_used)` samples. Empty input gives all zeros.
pub fn compute_block_stats(samples: &[(f64, f64)]) -> BlockStats {
    if samples.is_empty() {
        return BlockStats::default();
    }

    let prices: Vec<f64> = samples.iter().map(|(p, _)| *p).collect();
    let weights: Vec<f64> = samples.iter().map(|(_, w)| *w).collect();

    let total_weight: f64 = weights.iter().sum();
    let avg_gas_price = if total_weight > 0.0 {
        samples.iter().map(|(p, w)| p * w).sum::<f64>() / total_weight
    } else {
        prices.iter().sum::<f64>() / prices.len() as f64
    };

    let q = weighted_quantile(&prices, &[0.5, 0.05, 0.95], &weights);

    BlockStats {
        tx_count: samples.len(),
        avg_gas_price,
        median_gas_price: q[0],
        q5_gas_price: q[1],
        q95_gas_price: q[2],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_equal_weights_match_median() {
        let q = weighted_quantile(&[1.0, 2.0, 3.0], &[0.5], &[1.0, 1.0, 1.0]);
        assert!(close(q[0], 2.0));

        // order of input does not matter
        let q = weighted_quantile(&[3.0, 1.0, 2.0], &[0.5], &[1.0, 1.0, 1.0]);
        assert!(close(q[0], 2.0));
    }

    #[test]
    fn test_heavier_weight_biases_median() {
        let q = weighted_quantile(&[1.0, 2.0, 3.0], &[0.5], &[1.0, 1.0, 2.0]);
        // positions [0.125, 0.375, 0.75] -> 2 + (0.125 / 0.375)
        assert!(close(q[0], 2.0 + 1.0 / 3.0));
        assert!(q[0] > 2.0);
    }

    #[test]
    fn test_quantiles_clamp_to_extremes() {
        let q = weighted_quantile(&[10.0, 20.0], &[0.0, 0.05, 0.95, 1.0], &[1.0, 1.0]);
        // positions [0.25, 0.75]
        assert_eq!(q, vec![10.0, 10.0, 20.0, 20.0]);
    }

    #[test]
    fn test_single_value() {
        let q = weighted_quantile(&[5.0], &[0.05, 0.5, 0.95], &[21000.0]);
        assert_eq!(q, vec![5.0, 5.0, 5.0]);
    }

    #[test]
    fn test_zero_weights_fall_back_to_equal() {
        let q = weighted_quantile(&[1.0, 2.0, 3.0], &[0.5], &[0.0, 0.0, 0.0]);
        assert!(close(q[0], 2.0));
    }

    #[test]
    fn test_empty_block_stats_are_zero() {
        assert_eq!(compute_block_stats(&[]), BlockStats::default());
    }

    #[test]
    fn test_block_stats_weighted_average() {
        let stats = compute_block_stats(&[(1.0, 21000.0), (3.0, 63000.0)]);
        assert_eq!(stats.tx_count, 2);
        // (1 * 21000 + 3 * 63000) / 84000
        assert!(close(stats.avg_gas_price, 2.5));
        // positions [0.125, 0.625] -> 1 + (0.375 / 0.5) * 2
        assert!(close(stats.median_gas_price, 2.5));
        assert!(close(stats.q5_gas_price, 1.0));
        assert!(close(stats.q95_gas_price, 3.0));
    }
}
