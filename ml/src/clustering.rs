//! Unsupervised reduction of patch and kernel sets: k-means with k-means++
//! seeding, and principal component analysis.
//!
//! Samples are the rows of a matrix. Both procedures are deterministic for
//! a given seed and sample order.
use crate::WeightPrecision;
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::cmp::Ordering;

/// K-means clustering
pub struct KMeans {
    /// Number of clusters
    k: usize,
    /// Maximum Lloyd iterations
    max_iter: usize,
    seed: u64,
    /// One centroid per row
    centroids: Array2<WeightPrecision>,
    /// Cluster of every sample
    assignments: Vec<usize>,
}

impl KMeans {
    pub fn new(k: usize, seed: u64) -> Self {
        Self {
            k,
            max_iter: 100,
            seed,
            centroids: Array2::zeros((0, 0)),
            assignments: Vec::new(),
        }
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Fits the model. With fewer samples than clusters every sample becomes
    /// its own centroid.
    pub fn fit(&mut self, data: ArrayView2<WeightPrecision>) {
        let n_samples = data.nrows();
        if n_samples == 0 || self.k == 0 {
            self.centroids = Array2::zeros((0, data.ncols()));
            self.assignments = Vec::new();
            return;
        }
        if n_samples <= self.k {
            self.centroids = data.to_owned();
            self.assignments = (0..n_samples).collect();
            return;
        }

        self.centroids = self.init_centroids(data);
        self.assignments = vec![usize::MAX; n_samples];

        for _ in 0..self.max_iter {
            let assignments: Vec<usize> = data
                .rows()
                .into_iter()
                .map(|sample| nearest_row(sample, self.centroids.view()))
                .collect();
            if assignments == self.assignments {
                break;
            }
            self.assignments = assignments;

            let mut sums = Array2::<WeightPrecision>::zeros(self.centroids.raw_dim());
            let mut counts = vec![0usize; self.k];
            for (sample, &c) in data.rows().into_iter().zip(&self.assignments) {
                counts[c] += 1;
                let mut row = sums.row_mut(c);
                row += &sample;
            }
            // empty clusters keep their previous centroid
            for (c, &count) in counts.iter().enumerate() {
                if count > 0 {
                    let mean = sums.row(c).mapv(|v| v / count as WeightPrecision);
                    self.centroids.row_mut(c).assign(&mean);
                }
            }
        }
    }

    /// k-means++: the first centroid is drawn uniformly, the rest with
    /// probability proportional to the squared distance to the closest chosen one.
    fn init_centroids(&self, data: ArrayView2<WeightPrecision>) -> Array2<WeightPrecision> {
        let n_samples = data.nrows();
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut chosen = Vec::with_capacity(self.k);
        chosen.push(rng.gen_range(0..n_samples));

        let mut distances: Vec<f64> = data
            .rows()
            .into_iter()
            .map(|s| squared_distance(s, data.row(chosen[0])))
            .collect();

        while chosen.len() < self.k {
            let total: f64 = distances.iter().sum();
            let next = if total > 0.0 {
                let target = rng.gen::<f64>() * total;
                let mut cumsum = 0.0;
                distances
                    .iter()
                    .position(|&d| {
                        cumsum += d;
                        d > 0.0 && cumsum >= target
                    })
                    .unwrap_or_else(|| distances.iter().rposition(|&d| d > 0.0).unwrap_or(0))
            } else {
                // all remaining samples coincide with a centroid
                (0..n_samples).find(|i| !chosen.contains(i)).unwrap_or(0)
            };
            chosen.push(next);
            for (d, sample) in distances.iter_mut().zip(data.rows()) {
                *d = d.min(squared_distance(sample, data.row(next)));
            }
        }

        data.select(Axis(0), &chosen)
    }

    /// Centroids, one per row.
    pub fn centroids(&self) -> &Array2<WeightPrecision> {
        &self.centroids
    }

    pub fn into_centroids(self) -> Array2<WeightPrecision> {
        self.centroids
    }

    pub fn labels(&self) -> &[usize] {
        &self.assignments
    }
}

fn squared_distance(a: ArrayView1<WeightPrecision>, b: ArrayView1<WeightPrecision>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = (*x - *y) as f64;
            d * d
        })
        .sum()
}

/// Index of the closest row of `centroids`; ties go to the lowest index.
fn nearest_row(
    sample: ArrayView1<WeightPrecision>,
    centroids: ArrayView2<WeightPrecision>,
) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (c, centroid) in centroids.rows().into_iter().enumerate() {
        let d = squared_distance(sample, centroid);
        if d < best_distance {
            best = c;
            best_distance = d;
        }
    }
    best
}

/// Scales every row to unit Euclidean norm. Rows with a norm below `eps` are
/// left untouched.
pub fn normalize_rows(
    mut data: Array2<WeightPrecision>,
    eps: WeightPrecision,
) -> Array2<WeightPrecision> {
    for mut row in data.rows_mut() {
        let norm = row.dot(&row).sqrt();
        if norm > eps {
            row.mapv_inplace(|v| v / norm);
        }
    }
    data
}

/// Top `k` principal axes of the rows of `data`, one axis per output row.
///
/// Axes are ordered by decreasing variance (ties by eigenvector index) and
/// their signs are fixed so that the entry of largest magnitude is positive.
pub fn principal_axes(data: ArrayView2<WeightPrecision>, k: usize) -> Array2<WeightPrecision> {
    let (n, d) = data.dim();
    if n == 0 || k == 0 {
        return Array2::zeros((0, d));
    }
    let mean = data.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(d));
    let centered = &data - &mean;
    let covariance = centered.t().dot(&centered) / n.max(1) as WeightPrecision;

    let matrix = DMatrix::from_fn(d, d, |i, j| covariance[[i, j]] as f64);
    let eigen = SymmetricEigen::new(matrix);
    let mut pairs: Vec<(usize, f64)> = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .map(|(idx, &value)| (idx, value))
        .collect();
    pairs.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });

    let mut axes = Array2::zeros((k.min(d), d));
    for (rank, (idx, _)) in pairs.into_iter().take(k).enumerate() {
        let eigenvector = eigen.eigenvectors.column(idx);
        let pivot = eigenvector
            .iter()
            .copied()
            .fold(0.0f64, |acc, v| if v.abs() > acc.abs() { v } else { acc });
        let sign = if pivot < 0.0 { -1.0 } else { 1.0 };
        for (j, v) in eigenvector.iter().enumerate() {
            axes[[rank, j]] = (sign * v) as WeightPrecision;
        }
    }
    axes
}
