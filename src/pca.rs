//! Incremental principal component analysis over row chunks.
//!
//! The fit is a fold of [PcaAccumulator] values: each chunk yields an accumulator holding its
//! sample count, mean and scatter matrix, and accumulators are merged pairwise. The merged
//! covariance is decomposed once into a [PcaModel].

use crate::error::ProcessingError;

use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Replace non-finite values with zero.
pub fn sanitize(data: ArrayView2<f64>) -> Array2<f64> {
    data.mapv(|value| if value.is_finite() { value } else { 0.0 })
}

/// Sufficient statistics for the covariance of a set of channel vectors.
#[derive(Clone, Debug, PartialEq)]
pub struct PcaAccumulator {
    /// Number of samples (rows)
    pub n: usize,
    /// Per-channel mean
    pub mean: Array1<f64>,
    /// Sum of outer products of the centred samples
    pub scatter: Array2<f64>,
}

impl PcaAccumulator {
    /// Returns an accumulator of no samples.
    pub fn empty(channels: usize) -> Self {
        Self {
            n: 0,
            mean: Array1::zeros(channels),
            scatter: Array2::zeros((channels, channels)),
        }
    }

    /// Returns the accumulator of one chunk of samples, one per row.
    ///
    /// Non-finite values are counted as zero.
    pub fn from_rows(data: ArrayView2<f64>) -> Self {
        let data = sanitize(data);
        let Some(mean) = data.mean_axis(Axis(0)) else {
            return Self::empty(data.ncols());
        };
        let centred = &data - &mean;
        let scatter = centred.t().dot(&centred);
        Self {
            n: data.nrows(),
            mean,
            scatter,
        }
    }

    /// Merge two accumulators (Chan et al.).
    pub fn merge(self, other: Self) -> Self {
        if self.n == 0 {
            return other;
        }
        if other.n == 0 {
            return self;
        }
        let n = self.n + other.n;
        let (na, nb) = (self.n as f64, other.n as f64);
        let delta = &other.mean - &self.mean;
        let mean = &self.mean + &(&delta * (nb / n as f64));
        let outer = delta
            .view()
            .insert_axis(Axis(1))
            .dot(&delta.view().insert_axis(Axis(0)));
        let scatter = self.scatter + other.scatter + outer * (na * nb / n as f64);
        Self { n, mean, scatter }
    }

    /// Fit a model retaining `components` principal components.
    ///
    /// Fails with [ProcessingError::PcaFit] when fewer samples than components were
    /// accumulated.
    pub fn fit(self, components: usize) -> Result<PcaModel, ProcessingError> {
        let channels = self.mean.len();
        if self.n < components || self.n == 0 {
            return Err(ProcessingError::PcaFit {
                reason: format!("{} samples for {} components", self.n, components),
            });
        }
        let denominator = (self.n.max(2) - 1) as f64;
        let covariance =
            DMatrix::from_fn(channels, channels, |i, j| self.scatter[[i, j]] / denominator);
        let eigen = SymmetricEigen::new(covariance);

        let mut order: Vec<usize> = (0..channels).collect();
        order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

        let variances: Vec<f64> = order
            .iter()
            .map(|&i| eigen.eigenvalues[i].max(0.0))
            .collect();
        let total: f64 = variances.iter().sum();

        let mut loadings = Array2::zeros((components, channels));
        for (row, &i) in order.iter().take(components).enumerate() {
            let vector = eigen.eigenvectors.column(i);
            // Sign convention: the largest magnitude loading is positive.
            let pivot = vector
                .iter()
                .copied()
                .fold(0.0_f64, |pivot, v| if v.abs() > pivot.abs() { v } else { pivot });
            let sign = if pivot < 0.0 { -1.0 } else { 1.0 };
            for (j, v) in vector.iter().enumerate() {
                loadings[[row, j]] = sign * v;
            }
        }

        let explained_variance: Vec<f64> = variances.into_iter().take(components).collect();
        let explained_variance_ratio = explained_variance
            .iter()
            .map(|v| if total > 0.0 { v / total } else { 0.0 })
            .collect();
        Ok(PcaModel {
            mean: self.mean,
            components: loadings,
            explained_variance,
            explained_variance_ratio,
        })
    }
}

/// A fitted PCA model.
#[derive(Clone, Debug, PartialEq)]
pub struct PcaModel {
    /// Per-channel mean subtracted before projection
    pub mean: Array1<f64>,
    /// Principal axes, one per row (K × C)
    pub components: Array2<f64>,
    /// Variance along each retained axis
    pub explained_variance: Vec<f64>,
    /// Fraction of the total variance along each retained axis
    pub explained_variance_ratio: Vec<f64>,
}

impl PcaModel {
    /// Project rows of channel vectors onto the principal axes.
    ///
    /// Non-finite values are counted as zero.
    pub fn transform(&self, data: ArrayView2<f64>) -> Array2<f64> {
        let centred = &sanitize(data) - &self.mean;
        centred.dot(&self.components.t())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::{array, s};

    fn assert_close(a: &Array2<f64>, b: &Array2<f64>) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-9, "{a} != {b}");
        }
    }

    fn sample_rows() -> Array2<f64> {
        array![
            [1.0, 2.0, 0.5],
            [2.0, 4.5, 0.0],
            [3.0, 5.5, 1.0],
            [4.0, 8.0, 0.5],
            [5.0, 9.5, 2.0],
            [6.0, 12.5, 1.0],
            [7.0, 13.0, 0.0],
        ]
    }

    #[test]
    fn accumulate_single_chunk() {
        let acc = PcaAccumulator::from_rows(array![[1.0, 2.0], [3.0, 6.0]].view());
        assert_eq!(2, acc.n);
        assert_eq!(array![2.0, 4.0], acc.mean);
        assert_eq!(array![[2.0, 4.0], [4.0, 8.0]], acc.scatter);
    }

    #[test]
    fn merge_matches_single_pass() {
        let rows = sample_rows();
        let whole = PcaAccumulator::from_rows(rows.view());
        let merged = PcaAccumulator::from_rows(rows.slice(s![..3, ..]))
            .merge(PcaAccumulator::from_rows(rows.slice(s![3..4, ..])))
            .merge(PcaAccumulator::from_rows(rows.slice(s![4.., ..])));
        assert_eq!(whole.n, merged.n);
        for (x, y) in whole.mean.iter().zip(merged.mean.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
        assert_close(&whole.scatter, &merged.scatter);
    }

    #[test]
    fn merge_with_empty() {
        let acc = PcaAccumulator::from_rows(sample_rows().view());
        assert_eq!(acc, PcaAccumulator::empty(3).merge(acc.clone()));
        assert_eq!(acc, acc.clone().merge(PcaAccumulator::empty(3)));
    }

    #[test]
    fn empty_rows() {
        let acc = PcaAccumulator::from_rows(Array2::zeros((0, 2)).view());
        assert_eq!(PcaAccumulator::empty(2), acc);
    }

    #[test]
    fn non_finite_counted_as_zero() {
        let acc = PcaAccumulator::from_rows(array![[f64::NAN, 2.0], [2.0, f64::INFINITY]].view());
        assert_eq!(array![1.0, 1.0], acc.mean);
    }

    #[test]
    fn fit_line() {
        // Samples along (1, 2).
        let rows = array![[0.0, 0.0], [1.0, 2.0], [2.0, 4.0], [3.0, 6.0]];
        let model = PcaAccumulator::from_rows(rows.view()).fit(1).unwrap();
        let norm = 5.0_f64.sqrt();
        assert!((model.components[[0, 0]] - 1.0 / norm).abs() < 1e-9);
        assert!((model.components[[0, 1]] - 2.0 / norm).abs() < 1e-9);
        assert!((model.explained_variance_ratio[0] - 1.0).abs() < 1e-9);
        // var of t * sqrt(5) for t in 0..4 with n - 1 denominator
        assert!((model.explained_variance[0] - 5.0 * 5.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn fit_components_ordered_and_ratios_sum_to_one() {
        let model = PcaAccumulator::from_rows(sample_rows().view())
            .fit(3)
            .unwrap();
        assert_eq!((3, 3), model.components.dim());
        assert!(model.explained_variance[0] >= model.explained_variance[1]);
        assert!(model.explained_variance[1] >= model.explained_variance[2]);
        let total: f64 = model.explained_variance_ratio.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        for row in model.components.rows() {
            let norm: f64 = row.iter().map(|v| v * v).sum();
            assert!((norm - 1.0).abs() < 1e-9);
            let pivot = row.iter().fold(0.0_f64, |p, &v| if v.abs() > p.abs() { v } else { p });
            assert!(pivot > 0.0);
        }
    }

    #[test]
    fn fit_too_few_samples() {
        let acc = PcaAccumulator::from_rows(array![[1.0, 2.0, 3.0]].view());
        match acc.fit(2).unwrap_err() {
            ProcessingError::PcaFit { reason } => assert_eq!("1 samples for 2 components", reason),
            error => panic!("unexpected error {error:?}"),
        }
    }

    #[test]
    fn fit_no_samples() {
        match PcaAccumulator::empty(2).fit(1).unwrap_err() {
            ProcessingError::PcaFit { reason: _ } => (),
            error => panic!("unexpected error {error:?}"),
        }
    }

    #[test]
    fn transform_projects_onto_axes() {
        let rows = array![[0.0, 0.0], [1.0, 2.0], [2.0, 4.0], [3.0, 6.0]];
        let model = PcaAccumulator::from_rows(rows.view()).fit(1).unwrap();
        let projected = model.transform(rows.view());
        let norm = 5.0_f64.sqrt();
        let expected = array![[-1.5 * norm], [-0.5 * norm], [0.5 * norm], [1.5 * norm]];
        assert_close(&expected, &projected);
    }

    #[test]
    fn transform_mean_is_origin() {
        let model = PcaAccumulator::from_rows(sample_rows().view())
            .fit(2)
            .unwrap();
        let mean = model.mean.clone().insert_axis(Axis(0));
        let projected = model.transform(mean.view());
        assert_close(&Array2::zeros((1, 2)), &projected);
    }
}
