//! K-means clustering of scalar intensities.
//!
//! Assignments depend only on a sample's value, so a channel is clustered through its distinct
//! values weighted by their counts. This gives the same centres and inertia as clustering every
//! sample while the working set is bounded by the number of distinct intensities.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;

/// Parameters of the k-means search.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KMeansParams {
    /// Number of randomly initialised runs; the lowest-inertia run is kept
    pub restarts: usize,
    /// Maximum Lloyd iterations per run
    pub max_iterations: usize,
    /// A run converges once no centre moves further than this
    pub epsilon: f64,
    /// Seed for the initialisation, or `None` for a random seed
    pub seed: Option<u64>,
}

impl Default for KMeansParams {
    fn default() -> Self {
        Self {
            restarts: 10,
            max_iterations: 100,
            epsilon: 0.2,
            seed: None,
        }
    }
}

/// Distinct values in ascending order with their multiplicities.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WeightedValues {
    values: Vec<f64>,
    weights: Vec<f64>,
}

impl WeightedValues {
    /// Collect samples. Non-finite samples are counted as zero.
    pub fn from_samples<I: IntoIterator<Item = f64>>(samples: I) -> Self {
        let mut samples: Vec<f64> = samples
            .into_iter()
            .map(|value| if value.is_finite() { value } else { 0.0 })
            .collect();
        samples.sort_by(f64::total_cmp);
        let mut values: Vec<f64> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        for sample in samples {
            match values.last() {
                Some(&last) if last == sample => {
                    if let Some(weight) = weights.last_mut() {
                        *weight += 1.0;
                    }
                }
                _ => {
                    values.push(sample);
                    weights.push(1.0);
                }
            }
        }
        Self { values, weights }
    }

    /// Merge two sets of weighted values.
    pub fn merge(self, other: Self) -> Self {
        let mut values = Vec::with_capacity(self.values.len() + other.values.len());
        let mut weights = Vec::with_capacity(values.capacity());
        let mut left = self.values.into_iter().zip(self.weights).peekable();
        let mut right = other.values.into_iter().zip(other.weights).peekable();
        loop {
            let next = match (left.peek().map(|p| p.0), right.peek().map(|p| p.0)) {
                (Some(l), Some(r)) if l < r => left.next(),
                (Some(l), Some(r)) if r < l => right.next(),
                (Some(_), Some(_)) => left
                    .next()
                    .zip(right.next())
                    .map(|((value, lw), (_, rw))| (value, lw + rw)),
                (Some(_), None) => left.next(),
                (None, _) => right.next(),
            };
            let Some((value, weight)) = next else {
                break;
            };
            values.push(value);
            weights.push(weight);
        }
        Self { values, weights }
    }

    /// Number of distinct values.
    fn len(&self) -> usize {
        self.values.len()
    }

    fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.values.iter().copied().zip(self.weights.iter().copied())
    }
}

/// Index of the nearest of a set of ascending centres. Ties go to the lower index.
fn nearest(centres: &[f64], value: f64) -> usize {
    let above = centres.partition_point(|&centre| centre < value);
    if above == 0 {
        0
    } else if above == centres.len() {
        centres.len() - 1
    } else if value - centres[above - 1] <= centres[above] - value {
        above - 1
    } else {
        above
    }
}

fn inertia(data: &WeightedValues, centres: &[f64]) -> f64 {
    data.iter()
        .map(|(value, weight)| {
            let distance = value - centres[nearest(centres, value)];
            weight * distance * distance
        })
        .sum()
}

/// A fitted clustering.
#[derive(Clone, Debug, PartialEq)]
pub struct KMeansModel {
    /// Cluster centres in ascending order; the label of a cluster is its position
    pub centres: Vec<f64>,
    /// Weighted sum of squared distances to the nearest centre
    pub inertia: f64,
    /// Lloyd iterations performed by the selected run
    pub iterations: usize,
}

impl KMeansModel {
    /// Returns the label of the centre nearest to a value. Non-finite values are counted as
    /// zero.
    pub fn label(&self, value: f64) -> u32 {
        if self.centres.is_empty() {
            return 0;
        }
        let value = if value.is_finite() { value } else { 0.0 };
        nearest(&self.centres, value) as u32
    }
}

/// Returns up to `count` values farthest from their nearest centre, farthest first.
///
/// Values lying on a centre are never returned.
fn farthest_values(data: &WeightedValues, centres: &[f64], count: usize) -> Vec<f64> {
    if count == 0 {
        return vec![];
    }
    let mut distances: Vec<(f64, f64)> = data
        .values
        .iter()
        .map(|&value| ((value - centres[nearest(centres, value)]).abs(), value))
        .filter(|(distance, _)| *distance > 0.0)
        .collect();
    let farther = |a: &(f64, f64), b: &(f64, f64)| b.0.total_cmp(&a.0);
    if distances.len() > count {
        distances.select_nth_unstable_by(count - 1, farther);
        distances.truncate(count);
    }
    distances.sort_by(farther);
    distances.into_iter().map(|(_, value)| value).collect()
}

/// Run Lloyd's algorithm from the given centres.
fn lloyd(data: &WeightedValues, mut centres: Vec<f64>, params: &KMeansParams) -> KMeansModel {
    let k = centres.len();
    let mut iterations = 0;
    while iterations < params.max_iterations {
        iterations += 1;
        centres.sort_by(f64::total_cmp);
        let mut sums = vec![0.0; k];
        let mut counts = vec![0.0; k];
        for (value, weight) in data.iter() {
            let label = nearest(&centres, value);
            sums[label] += value * weight;
            counts[label] += weight;
        }

        // Empty clusters take the values farthest from their centres.
        let empty = counts.iter().filter(|&&count| count == 0.0).count();
        let mut farthest = farthest_values(data, &centres, empty).into_iter();

        let mut shift: f64 = 0.0;
        for label in 0..k {
            let centre = if counts[label] > 0.0 {
                sums[label] / counts[label]
            } else {
                farthest.next().unwrap_or(centres[label])
            };
            shift = shift.max((centre - centres[label]).abs());
            centres[label] = centre;
        }
        if shift <= params.epsilon {
            break;
        }
    }
    centres.sort_by(f64::total_cmp);
    let inertia = inertia(data, &centres);
    KMeansModel {
        centres,
        inertia,
        iterations,
    }
}

/// Cluster weighted values into `k` groups.
///
/// Each restart starts from `k` distinct sample values chosen at random and the run with the
/// lowest inertia is returned. With fewer than `k` distinct values every value is its own
/// cluster. `k` must be at least one.
#[tracing::instrument(level = "DEBUG", skip(data), fields(distinct = data.len()))]
pub fn fit(data: &WeightedValues, k: usize, params: &KMeansParams) -> KMeansModel {
    if data.len() <= k {
        return KMeansModel {
            centres: data.values.clone(),
            inertia: 0.0,
            iterations: 0,
        };
    }
    let mut rng = match params.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let mut best: Option<KMeansModel> = None;
    for restart in 0..params.restarts.max(1) {
        let centres = index::sample(&mut rng, data.len(), k)
            .into_iter()
            .map(|i| data.values[i])
            .collect();
        let model = lloyd(data, centres, params);
        tracing::trace!(restart, inertia = model.inertia, iterations = model.iterations);
        best = match best {
            Some(best) if best.inertia <= model.inertia => Some(best),
            _ => Some(model),
        };
    }
    let best = best.unwrap_or_default();
    tracing::debug!(inertia = best.inertia, centres = ?best.centres, "selected k-means run");
    best
}

impl Default for KMeansModel {
    fn default() -> Self {
        Self {
            centres: vec![],
            inertia: 0.0,
            iterations: 0,
        }
    }
}
