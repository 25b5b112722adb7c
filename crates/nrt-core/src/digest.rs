//! Streaming latency quantile sketch.
//!
//! A merging t-digest variant: samples accumulate in a small unsorted buffer
//! and are periodically merged into a sorted list of centroids, none of which
//! may hold more than `1/compression` of the total weight. Rank error is
//! therefore bounded by `1/(2*compression)` and inserts are O(1) amortized.
//!
//! Quantiles are monotone in `q` by construction, so the emitted
//! `p50 <= p95 <= p99` ordering always holds. The quantile of an empty
//! digest is defined as 0.

/// Default compression; ~1% relative error at the median.
pub const DEFAULT_COMPRESSION: f64 = 100.0;

/// Unmerged samples buffered per unit of compression before a merge pass.
const BUFFER_FACTOR: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Centroid {
    mean: f64,
    weight: f64,
}

/// Streaming quantile digest over latency samples.
#[derive(Debug, Clone)]
pub struct LatencyDigest {
    compression: f64,
    centroids: Vec<Centroid>,
    buffer: Vec<f64>,
    count: u64,
    min: f64,
    max: f64,
}

impl Default for LatencyDigest {
    fn default() -> Self {
        LatencyDigest::new(DEFAULT_COMPRESSION)
    }
}

impl LatencyDigest {
    pub fn new(compression: f64) -> Self {
        let compression = if compression.is_finite() && compression >= 10.0 {
            compression
        } else {
            DEFAULT_COMPRESSION
        };
        LatencyDigest {
            compression,
            centroids: Vec::new(),
            buffer: Vec::with_capacity(BUFFER_FACTOR * compression as usize),
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Insert one sample. Non-finite samples are ignored.
    pub fn insert(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        self.buffer.push(value);
        if self.buffer.len() >= BUFFER_FACTOR * self.compression as usize {
            self.compress();
        }
    }

    /// Total number of samples inserted.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Estimate the `q`-quantile (`0.0..=1.0`). Empty digest yields 0.
    pub fn quantile(&mut self, q: f64) -> f64 {
        self.compress();
        if self.centroids.is_empty() {
            return 0.0;
        }
        let q = q.clamp(0.0, 1.0);
        if q == 0.0 {
            return self.min;
        }
        if q == 1.0 {
            return self.max;
        }
        let total: f64 = self.centroids.iter().map(|c| c.weight).sum();
        let target = q * total;

        // Walk centroids, interpolating between adjacent means around the
        // target rank. Singleton centroids report their mean exactly.
        let mut cumulative = 0.0;
        for (i, c) in self.centroids.iter().enumerate() {
            let mid = cumulative + c.weight / 2.0;
            if target <= mid || i == self.centroids.len() - 1 {
                if target <= c.weight / 2.0 && i == 0 {
                    // Below the first centroid's midpoint.
                    return self.min.max(c.mean.min(self.max));
                }
                if i == self.centroids.len() - 1 && target >= mid {
                    return self.max.min(c.mean.max(self.min));
                }
                let prev = &self.centroids[i - 1];
                let prev_mid = cumulative - prev.weight / 2.0;
                let span = mid - prev_mid;
                let frac = if span > 0.0 {
                    (target - prev_mid) / span
                } else {
                    0.5
                };
                return prev.mean + frac * (c.mean - prev.mean);
            }
            cumulative += c.weight;
        }
        self.max
    }

    /// Merge buffered samples into the centroid list, then re-merge adjacent
    /// centroids whose combined weight stays under the uniform size limit.
    fn compress(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut all: Vec<Centroid> = self
            .buffer
            .drain(..)
            .map(|v| Centroid {
                mean: v,
                weight: 1.0,
            })
            .collect();
        all.extend(self.centroids.drain(..));
        all.sort_by(|a, b| a.mean.partial_cmp(&b.mean).unwrap_or(std::cmp::Ordering::Equal));

        // Uniform weight limit: no centroid grows past total/compression, so
        // rank error stays within 1/(2*compression) and the merged list never
        // exceeds ~2*compression entries.
        let total: f64 = all.iter().map(|c| c.weight).sum();
        let limit = (total / self.compression).max(1.0);
        let mut merged: Vec<Centroid> = Vec::with_capacity(self.compression as usize * 2);

        for c in all {
            if let Some(last) = merged.last_mut() {
                let proposed = last.weight + c.weight;
                if proposed <= limit {
                    last.mean = (last.mean * last.weight + c.mean * c.weight) / proposed;
                    last.weight = proposed;
                    continue;
                }
            }
            merged.push(c);
        }
        self.centroids = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digest_reports_zero() {
        let mut d = LatencyDigest::default();
        assert_eq!(d.quantile(0.5), 0.0);
        assert_eq!(d.quantile(0.99), 0.0);
        assert_eq!(d.count(), 0);
    }

    #[test]
    fn single_sample_is_every_quantile() {
        let mut d = LatencyDigest::default();
        d.insert(42.0);
        assert_eq!(d.quantile(0.0), 42.0);
        assert_eq!(d.quantile(0.5), 42.0);
        assert_eq!(d.quantile(1.0), 42.0);
    }

    #[test]
    fn quantiles_are_monotone() {
        let mut d = LatencyDigest::new(50.0);
        for i in 0..10_000 {
            d.insert(((i * 7919) % 1000) as f64);
        }
        let p50 = d.quantile(0.50);
        let p95 = d.quantile(0.95);
        let p99 = d.quantile(0.99);
        assert!(p50 <= p95, "p50={p50} p95={p95}");
        assert!(p95 <= p99, "p95={p95} p99={p99}");
    }

    #[test]
    fn uniform_accuracy_within_bounds() {
        let mut d = LatencyDigest::default();
        for i in 10..110 {
            d.insert(i as f64);
        }
        // True quantiles of 10..=109: p50 ~ 59.5, p95 ~ 104, p99 ~ 108.
        let p50 = d.quantile(0.50);
        let p95 = d.quantile(0.95);
        let p99 = d.quantile(0.99);
        assert!((p50 - 59.5).abs() <= 5.0, "p50={p50}");
        assert!((p95 - 104.5).abs() <= 2.5, "p95={p95}");
        assert!((p99 - 108.0).abs() <= 1.5, "p99={p99}");
    }

    #[test]
    fn compression_bounds_centroid_count() {
        let mut d = LatencyDigest::new(100.0);
        for i in 0..100_000 {
            d.insert((i % 5000) as f64);
        }
        d.compress();
        assert!(
            d.centroids.len() <= 2 * d.compression as usize + 1,
            "centroids={}",
            d.centroids.len()
        );
        assert_eq!(d.count(), 100_000);
    }

    #[test]
    fn ignores_non_finite_samples() {
        let mut d = LatencyDigest::default();
        d.insert(f64::NAN);
        d.insert(f64::INFINITY);
        d.insert(5.0);
        assert_eq!(d.count(), 1);
        assert_eq!(d.quantile(0.5), 5.0);
    }

    #[test]
    fn extreme_quantiles_clamp_to_observed_range() {
        let mut d = LatencyDigest::new(20.0);
        for i in 0..1000 {
            d.insert(i as f64);
        }
        assert!(d.quantile(0.0) >= 0.0);
        assert!(d.quantile(1.0) <= 999.0);
    }
}
