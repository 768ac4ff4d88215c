//! K-Means partitioning and partition quality

use linfa::prelude::*;
use linfa::DatasetBase;
use linfa_clustering::KMeans;
use linfa_nn::distance::L2Dist;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;

use crate::config::SegmentationConfig;
use crate::data::MetricsTable;
use crate::error::{Advisory, Result, SegmentationError};
use crate::features::ScaledFeatures;

/// Solver settings shared by every fit of one run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KMeansSettings {
    /// Seed for k-means++ seeding and restarts
    pub seed: u64,
    /// Restarts, best inertia kept
    pub n_runs: usize,
    /// Maximum iterations per restart
    pub max_iterations: u64,
    /// Convergence tolerance
    pub tolerance: f64,
}

impl From<&SegmentationConfig> for KMeansSettings {
    fn from(config: &SegmentationConfig) -> Self {
        Self {
            seed: config.seed,
            n_runs: config.n_runs,
            max_iterations: config.max_iterations,
            tolerance: config.tolerance,
        }
    }
}

impl Default for KMeansSettings {
    fn default() -> Self {
        (&SegmentationConfig::default()).into()
    }
}

/// A fitted partition of the scaled feature matrix
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    /// Number of clusters
    pub k: usize,
    /// Cluster of each row
    pub labels: Vec<usize>,
    /// Cluster centers in scaled space (k, 3)
    pub centroids: Array2<f64>,
    /// Within-cluster sum of squares
    pub inertia: f64,
    /// Clusters that came out of the solver empty and were refilled
    pub repaired: Vec<usize>,
}

impl Partition {
    /// Nearest centroid for a scaled point (lowest index on ties)
    pub fn predict(&self, features: ArrayView1<f64>) -> usize {
        nearest_centroid(features, self.centroids.view())
    }

    /// Members per cluster
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.k];
        for &label in &self.labels {
            sizes[label] += 1;
        }
        sizes
    }

    /// Mean silhouette coefficient of the partition.
    ///
    /// Members of singleton clusters score 0, as does every point when there
    /// is only one cluster. With `sample_size` below the number of rows, an
    /// evenly strided subset of rows is scored against itself. Points are
    /// scored on the rayon pool only when `parallel` is set.
    pub fn silhouette(&self, features: ArrayView2<f64>, sample_size: Option<usize>, parallel: bool) -> f64 {
        let n = features.nrows();
        let indices: Vec<usize> = match sample_size {
            Some(m) if m < n => (0..m).map(|j| j * n / m).collect(),
            _ => (0..n).collect(),
        };
        if indices.len() < 2 {
            return 0.0;
        }

        let mut counts = vec![0usize; self.k];
        for &i in &indices {
            counts[self.labels[i]] += 1;
        }

        let coefficient = |&i: &usize| -> f64 {
            let own = self.labels[i];
            if counts[own] < 2 {
                return 0.0;
            }

            let mut sums = vec![0.0; self.k];
            for &j in &indices {
                if i != j {
                    sums[self.labels[j]] += euclidean_distance(features.row(i), features.row(j));
                }
            }

            let a_i = sums[own] / (counts[own] - 1) as f64;
            let b_i = (0..self.k)
                .filter(|&c| c != own && counts[c] > 0)
                .map(|c| sums[c] / counts[c] as f64)
                .fold(f64::INFINITY, f64::min);

            if b_i.is_infinite() || a_i.max(b_i) == 0.0 {
                0.0
            } else {
                (b_i - a_i) / a_i.max(b_i)
            }
        };

        let coefficients: Vec<f64> = if parallel {
            indices.par_iter().map(&coefficient).collect()
        } else {
            indices.iter().map(&coefficient).collect()
        };

        coefficients.iter().sum::<f64>() / coefficients.len() as f64
    }
}

/// Customer → cluster mapping, rows aligned with the metrics table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterAssignment {
    /// Number of clusters
    pub k: usize,
    /// Customer of each row
    pub customer_ids: Vec<String>,
    /// Cluster of each row, in `0..k`
    pub clusters: Vec<usize>,
}

impl ClusterAssignment {
    /// Number of assigned customers
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    /// Whether nobody is assigned
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Members per cluster
    pub fn sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.k];
        for &cluster in &self.clusters {
            sizes[cluster] += 1;
        }
        sizes
    }

    /// `(customer_id, cluster)` pairs in row order
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.customer_ids
            .iter()
            .map(String::as_str)
            .zip(self.clusters.iter().copied())
    }
}

/// Fit K-Means on scaled features
///
/// # Arguments
/// * `features` - Scaled matrix (n_samples, n_features)
/// * `k` - Number of clusters, `1..=n_samples`
/// * `settings` - Seed and solver limits
///
/// # Returns
/// * A `Partition` with no empty cluster
pub fn fit_partition(features: ArrayView2<f64>, k: usize, settings: &KMeansSettings) -> Result<Partition> {
    let n_samples = features.nrows();
    if k == 0 || k > n_samples {
        return Err(SegmentationError::parameter(
            "k",
            format!("k ({k}) must be between 1 and the number of customers ({n_samples})"),
        ));
    }

    let centroids = if k == 1 {
        features
            .mean_axis(Axis(0))
            .ok_or_else(|| SegmentationError::clustering_failure(k, "no rows to average"))?
            .insert_axis(Axis(0))
    } else {
        let dataset = DatasetBase::from(features.to_owned());
        let rng = StdRng::seed_from_u64(settings.seed);
        let model = KMeans::params_with(k, rng, L2Dist)
            .n_runs(settings.n_runs)
            .max_n_iterations(settings.max_iterations)
            .tolerance(settings.tolerance)
            .fit(&dataset)
            .map_err(|e| SegmentationError::clustering_failure(k, e.to_string()))?;

        // The solver stops at the iteration limit without reporting it
        let shift = lloyd_shift(features, model.centroids().view());
        if shift.is_nan() || shift >= settings.tolerance {
            return Err(SegmentationError::clustering_failure(
                k,
                format!(
                    "did not converge within {} iterations (centroid shift {shift:.3e})",
                    settings.max_iterations
                ),
            ));
        }
        model.centroids().clone()
    };

    if centroids.iter().any(|v| !v.is_finite()) {
        return Err(SegmentationError::clustering_failure(k, "solver produced non-finite centroids"));
    }

    let labels: Vec<usize> = features
        .outer_iter()
        .map(|row| nearest_centroid(row, centroids.view()))
        .collect();

    let mut partition = Partition {
        k,
        labels,
        centroids,
        inertia: 0.0,
        repaired: Vec::new(),
    };
    repair_empty_clusters(&mut partition, features);
    partition.inertia = compute_inertia(features, &partition.labels, partition.centroids.view());

    if !partition.inertia.is_finite() {
        return Err(SegmentationError::clustering_failure(
            k,
            format!("non-finite inertia {}", partition.inertia),
        ));
    }

    tracing::trace!(k, inertia = partition.inertia, repaired = partition.repaired.len(), "fitted partition");
    Ok(partition)
}

/// Partition the customers at a fixed k
///
/// # Returns
/// * The assignment, the underlying partition and one advisory per repaired cluster
pub fn partition_customers(
    metrics: &MetricsTable,
    features: &ScaledFeatures,
    k: usize,
    settings: &KMeansSettings,
) -> Result<(ClusterAssignment, Partition, Vec<Advisory>)> {
    let partition = fit_partition(features.matrix.view(), k, settings)?;
    let advisories = partition
        .repaired
        .iter()
        .map(|&cluster| Advisory::EmptyClusterRepaired { k, cluster })
        .collect();

    let assignment = ClusterAssignment {
        k,
        customer_ids: metrics.rows.iter().map(|m| m.customer_id.clone()).collect(),
        clusters: partition.labels.clone(),
    };

    tracing::debug!(k, sizes = ?assignment.sizes(), "partitioned customers");
    Ok((assignment, partition, advisories))
}

/// Refill empty clusters with the point farthest from its own centroid.
///
/// Donors come from clusters with more than one member; ties go to the
/// lowest row. Centroids are recomputed as member means afterwards.
fn repair_empty_clusters(partition: &mut Partition, features: ArrayView2<f64>) {
    let mut sizes = partition.cluster_sizes();
    let empty: Vec<usize> = (0..partition.k).filter(|&c| sizes[c] == 0).collect();
    if empty.is_empty() {
        return;
    }

    for cluster in empty {
        let mut donor: Option<(usize, f64)> = None;
        for (i, row) in features.outer_iter().enumerate() {
            let own = partition.labels[i];
            if sizes[own] < 2 {
                continue;
            }
            let distance = euclidean_distance(row, partition.centroids.row(own));
            if donor.map_or(true, |(_, best)| distance > best) {
                donor = Some((i, distance));
            }
        }

        // Pigeonhole: with k <= n and an empty cluster, some cluster has 2+ members
        let Some((i, _)) = donor else { break };
        sizes[partition.labels[i]] -= 1;
        sizes[cluster] += 1;
        partition.labels[i] = cluster;
        partition.centroids.row_mut(cluster).assign(&features.row(i));
        partition.repaired.push(cluster);
        tracing::debug!(k = partition.k, cluster, row = i, "refilled empty cluster");
    }

    let mut sums = Array2::<f64>::zeros(partition.centroids.raw_dim());
    for (i, row) in features.outer_iter().enumerate() {
        let mut target = sums.row_mut(partition.labels[i]);
        target += &row;
    }
    for (cluster, mut row) in sums.outer_iter_mut().enumerate() {
        row /= sizes[cluster] as f64;
        partition.centroids.row_mut(cluster).assign(&row);
    }
}

/// How far the centroids would move in one more assignment/update step.
///
/// Clusters that would come out empty keep their centroid.
fn lloyd_shift(features: ArrayView2<f64>, centroids: ArrayView2<f64>) -> f64 {
    let mut sums = Array2::<f64>::zeros(centroids.raw_dim());
    let mut counts = vec![0usize; centroids.nrows()];
    for row in features.outer_iter() {
        let cluster = nearest_centroid(row, centroids);
        let mut target = sums.row_mut(cluster);
        target += &row;
        counts[cluster] += 1;
    }

    sums.outer_iter()
        .zip(centroids.outer_iter())
        .zip(&counts)
        .filter(|(_, n)| **n > 0)
        .map(|((sum, old), &n)| {
            sum.iter()
                .zip(old.iter())
                .map(|(s, o)| (s / n as f64 - o).powi(2))
                .sum::<f64>()
        })
        .sum::<f64>()
        .sqrt()
}

/// Index of the closest centroid (lowest index on ties)
pub fn nearest_centroid(point: ArrayView1<f64>, centroids: ArrayView2<f64>) -> usize {
    let mut min_distance = f64::INFINITY;
    let mut closest_cluster = 0;

    for (cluster_idx, centroid) in centroids.outer_iter().enumerate() {
        let distance = euclidean_distance(point, centroid);
        if distance < min_distance {
            min_distance = distance;
            closest_cluster = cluster_idx;
        }
    }

    closest_cluster
}

/// Within-cluster sum of squares
fn compute_inertia(features: ArrayView2<f64>, labels: &[usize], centroids: ArrayView2<f64>) -> f64 {
    labels
        .iter()
        .enumerate()
        .map(|(i, &cluster)| euclidean_distance(features.row(i), centroids.row(cluster)).powi(2))
        .sum()
}

fn euclidean_distance(point1: ArrayView1<f64>, point2: ArrayView1<f64>) -> f64 {
    point1
        .iter()
        .zip(point2.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn create_test_features() -> Array2<f64> {
        array![
            [-1.0, -1.0, -1.0],
            [-1.1, -0.9, -1.0],
            [-0.9, -1.0, -1.1],
            [1.0, 1.0, 1.0],
            [1.1, 0.9, 1.0],
            [0.9, 1.0, 1.1],
            [-1.0, 1.0, 3.0],
            [-1.1, 1.0, 3.1],
            [-0.9, 1.1, 2.9],
        ]
    }

    #[test]
    fn test_fit_partition() {
        let features = create_test_features();
        let partition = fit_partition(features.view(), 3, &KMeansSettings::default()).unwrap();

        assert_eq!(partition.k, 3);
        assert_eq!(partition.labels.len(), 9);
        assert_eq!(partition.centroids.shape(), &[3, 3]);
        assert_eq!(partition.cluster_sizes(), vec![3, 3, 3]);
        assert!(partition.inertia >= 0.0 && partition.inertia < 1.0);

        // Each blob lands in one cluster
        for blob in partition.labels.chunks(3) {
            assert!(blob.iter().all(|&l| l == blob[0]));
        }
    }

    #[test]
    fn test_fit_is_deterministic() {
        let features = create_test_features();
        let settings = KMeansSettings::default();
        let first = fit_partition(features.view(), 3, &settings).unwrap();
        let second = fit_partition(features.view(), 3, &settings).unwrap();
        assert_eq!(first.labels, second.labels);
        assert_eq!(first.centroids, second.centroids);
    }

    #[test]
    fn test_single_cluster() {
        let features = create_test_features();
        let partition = fit_partition(features.view(), 1, &KMeansSettings::default()).unwrap();
        assert!(partition.labels.iter().all(|&l| l == 0));
        assert_eq!(partition.silhouette(features.view(), None, true), 0.0);
    }

    #[test]
    fn test_invalid_k() {
        let features = create_test_features();
        assert!(fit_partition(features.view(), 0, &KMeansSettings::default()).is_err());
        assert!(fit_partition(features.view(), 10, &KMeansSettings::default()).is_err());
    }

    #[test]
    fn test_predict() {
        let features = create_test_features();
        let partition = fit_partition(features.view(), 3, &KMeansSettings::default()).unwrap();
        let cluster = partition.predict(array![1.05, 0.95, 1.0].view());
        assert_eq!(cluster, partition.labels[3]);
    }

    #[test]
    fn test_silhouette_well_separated() {
        let features = create_test_features();
        let partition = fit_partition(features.view(), 3, &KMeansSettings::default()).unwrap();
        let score = partition.silhouette(features.view(), None, true);
        assert!(score > 0.8 && score <= 1.0, "score {score}");

        let sampled = partition.silhouette(features.view(), Some(6), true);
        assert!((-1.0..=1.0).contains(&sampled));
    }

    #[test]
    fn test_silhouette_sequential_matches_parallel() {
        let features = create_test_features();
        let partition = fit_partition(features.view(), 3, &KMeansSettings::default()).unwrap();
        assert_eq!(
            partition.silhouette(features.view(), None, false),
            partition.silhouette(features.view(), None, true)
        );
        assert_eq!(
            partition.silhouette(features.view(), Some(6), false),
            partition.silhouette(features.view(), Some(6), true)
        );
    }

    #[test]
    fn test_iteration_limit_reports_non_convergence() {
        // Skewed spacing keeps Lloyd steps moving well past the first one
        let features = Array2::from_shape_fn((60, 3), |(i, j)| if j == 0 { (i * i) as f64 } else { 0.0 });
        let settings = KMeansSettings {
            max_iterations: 1,
            n_runs: 1,
            ..KMeansSettings::default()
        };

        match fit_partition(features.view(), 4, &settings) {
            Err(SegmentationError::ClusteringFailure { k, message }) => {
                assert_eq!(k, 4);
                assert!(message.contains("did not converge within 1 iterations"), "{message}");
            }
            other => panic!("expected non-convergence, got {:?}", other.map(|p| p.labels)),
        }

        assert!(fit_partition(features.view(), 4, &KMeansSettings::default()).is_ok());
    }

    #[test]
    fn test_lloyd_shift_is_zero_at_fixed_point() {
        let features = create_test_features();
        let centroids = array![
            [-1.0, -2.9 / 3.0, -3.1 / 3.0],
            [1.0, 2.9 / 3.0, 3.1 / 3.0],
            [-1.0, 3.1 / 3.0, 3.0],
        ];
        assert!(lloyd_shift(features.view(), centroids.view()) < 1e-12);

        let shifted = &centroids + 0.5;
        assert!(lloyd_shift(features.view(), shifted.view()) > 0.5);
    }

    #[test]
    fn test_silhouette_singletons_score_zero() {
        let features = array![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [5.0, 0.0, 0.0]];
        let partition = fit_partition(features.view(), 3, &KMeansSettings::default()).unwrap();
        assert_eq!(partition.silhouette(features.view(), None, true), 0.0);
    }

    #[test]
    fn test_repair_fills_empty_cluster() {
        let features = array![[0.0, 0.0, 0.0], [0.0, 0.0, 0.2], [0.0, 0.0, 1.0], [0.0, 0.0, 5.0]];
        let mut partition = Partition {
            k: 2,
            labels: vec![0, 0, 0, 0],
            centroids: array![[0.0, 0.0, 1.55], [100.0, 100.0, 100.0]],
            inertia: 0.0,
            repaired: Vec::new(),
        };

        repair_empty_clusters(&mut partition, features.view());

        assert_eq!(partition.repaired, vec![1]);
        assert_eq!(partition.labels, vec![0, 0, 0, 1]);
        assert_eq!(partition.cluster_sizes(), vec![3, 1]);
        assert!((partition.centroids[[0, 2]] - 0.4).abs() < 1e-12);
        assert_eq!(partition.centroids.row(1), array![0.0, 0.0, 5.0]);
    }

    #[test]
    fn test_assignment_lookup() {
        let assignment = ClusterAssignment {
            k: 2,
            customer_ids: vec!["a".into(), "b".into(), "c".into()],
            clusters: vec![1, 0, 1],
        };
        assert_eq!(assignment.sizes(), vec![1, 2]);
        assert_eq!(assignment.iter().next(), Some(("a", 1)));
    }
}
