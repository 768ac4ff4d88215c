//! End-to-end segmentation run
//!
//! [`segment`] takes an immutable transaction snapshot and a configuration
//! and returns an immutable result bundle. Nothing is shared between calls,
//! so unrelated datasets can be segmented concurrently.

use std::collections::HashMap;

use ndarray::Array2;
use serde::Serialize;

use crate::config::SegmentationConfig;
use crate::data::{compute_customer_metrics, CustomerMetrics, MetricsTable, TransactionInput};
use crate::error::{Advisory, Result, SegmentationError};
use crate::features::{scale_features, FeatureScaler};
use crate::labeling::{customer_labels, label_clusters, ClusterLabel};
use crate::model::{nearest_centroid, partition_customers, ClusterAssignment, KMeansSettings};
use crate::selection::{select_k, SelectionParams, SelectionReport};
use crate::summary::{summarize_segments, SegmentSummary};

/// Pipeline stages, in the only order they can be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Nothing done yet
    Idle,
    /// Customer metrics derived
    MetricsComputed,
    /// Features scaled
    FeaturesScaled,
    /// Partition count chosen
    KSelected,
    /// Customers assigned to clusters
    Partitioned,
    /// Clusters labeled
    Labeled,
    /// Segments summarized
    Summarized,
    /// Result assembled
    Done,
}

impl Stage {
    /// The stage that follows, if any
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Idle => Some(Stage::MetricsComputed),
            Stage::MetricsComputed => Some(Stage::FeaturesScaled),
            Stage::FeaturesScaled => Some(Stage::KSelected),
            Stage::KSelected => Some(Stage::Partitioned),
            Stage::Partitioned => Some(Stage::Labeled),
            Stage::Labeled => Some(Stage::Summarized),
            Stage::Summarized => Some(Stage::Done),
            Stage::Done => None,
        }
    }
}

/// Progress of one invocation
struct Run {
    stage: Stage,
    diagnostics: Vec<Advisory>,
}

impl Run {
    fn new() -> Self {
        Self {
            stage: Stage::Idle,
            diagnostics: Vec::new(),
        }
    }

    /// Move one stage forward, keeping the advisories raised by the stage
    fn advance(&mut self, advisories: Vec<Advisory>) {
        let next = self.stage.next().unwrap_or(Stage::Done);
        for advisory in &advisories {
            tracing::debug!(stage = ?next, %advisory, "advisory");
        }
        self.diagnostics.extend(advisories);
        tracing::debug!(from = ?self.stage, to = ?next, "stage complete");
        self.stage = next;
    }
}

/// A customer's metrics together with their segment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerSegment<'a> {
    /// RFM metrics
    pub metrics: &'a CustomerMetrics,
    /// Cluster id
    pub cluster: usize,
    /// Segment label
    pub label: &'a str,
}

/// Everything a successful run produces
#[derive(Debug, Clone, Serialize)]
pub struct SegmentationResult {
    /// Per-customer RFM metrics
    pub metrics: MetricsTable,
    /// Cluster of each customer
    pub assignment: ClusterAssignment,
    /// Segment label of each customer, rows aligned with `assignment`
    pub customer_labels: Vec<String>,
    /// Label and centroid of each cluster
    pub clusters: Vec<ClusterLabel>,
    /// Per-segment statistics
    pub summary: SegmentSummary,
    /// Score curve; absent when k was fixed by the caller
    pub selection: Option<SelectionReport>,
    /// Scaling fitted on this run's customers
    pub scaler: FeatureScaler,
    /// Cluster centers in scaled space (k, 3)
    pub centroids: Array2<f64>,
    /// Advisories in detection order
    pub diagnostics: Vec<Advisory>,
    /// Always [`Stage::Done`]
    pub stage: Stage,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl SegmentationResult {
    /// Number of segments
    pub fn k(&self) -> usize {
        self.assignment.k
    }

    /// Metrics and segment of a customer
    pub fn customer(&self, customer_id: &str) -> Option<CustomerSegment<'_>> {
        let row = *self.index.get(customer_id)?;
        let cluster = self.assignment.clusters[row];
        Some(CustomerSegment {
            metrics: &self.metrics.rows[row],
            cluster,
            label: &self.clusters[cluster].label,
        })
    }

    /// `(customer_id, cluster, label)` for every customer in row order
    pub fn labeled_customers(&self) -> impl Iterator<Item = (&str, usize, &str)> + '_ {
        self.assignment
            .iter()
            .zip(&self.customer_labels)
            .map(|((customer_id, cluster), label)| (customer_id, cluster, label.as_str()))
    }

    /// Label of a cluster id
    pub fn label_of(&self, cluster: usize) -> Option<&str> {
        self.clusters.get(cluster).map(|c| c.label.as_str())
    }

    /// Segment of an unseen customer from raw RFM values
    ///
    /// The values are scaled with this run's scaler and matched to the
    /// nearest cluster center.
    pub fn classify(&self, recency: f64, frequency: f64, monetary: f64) -> (usize, &str) {
        let scaled = self.scaler.transform_one([recency, frequency, monetary]);
        let cluster = nearest_centroid(scaled.view(), self.centroids.view());
        (cluster, self.clusters[cluster].label.as_str())
    }
}

/// Segment customers, choosing the number of segments automatically
///
/// # Arguments
/// * `input` - Transaction snapshot with resolved column roles
/// * `config` - Engine options
///
/// # Returns
/// * The full result bundle, or the first error raised by any stage
pub fn segment(input: &TransactionInput, config: &SegmentationConfig) -> Result<SegmentationResult> {
    run_pipeline(input, config, None)
}

/// Segment customers into exactly `k` segments, skipping the search
pub fn segment_with_k(input: &TransactionInput, config: &SegmentationConfig, k: usize) -> Result<SegmentationResult> {
    run_pipeline(input, config, Some(k))
}

fn run_pipeline(input: &TransactionInput, config: &SegmentationConfig, fixed_k: Option<usize>) -> Result<SegmentationResult> {
    let span = tracing::debug_span!("segment", records = input.records.len());
    let _guard = span.enter();

    config.validate()?;
    let mut run = Run::new();

    let (metrics, advisories) = compute_customer_metrics(input, config.reference_date, config.monetary_filter)?;
    run.advance(advisories);

    let (features, advisories) = scale_features(metrics.raw_features().view())?;
    run.advance(advisories);

    let (k, selection, advisories) = match fixed_k {
        None => {
            let (report, advisories) = select_k(&features, &SelectionParams::from(config))?;
            (report.selected_k, Some(report), advisories)
        }
        Some(k) => {
            let samples = features.n_samples();
            let distinct = features.distinct_points();
            let mut advisories = Vec::new();
            if distinct < samples {
                advisories.push(Advisory::CollapsedValues { distinct, samples });
            }
            check_fixed_k(k, samples, distinct)?;
            (k, None, advisories)
        }
    };
    run.advance(advisories);

    let settings = KMeansSettings::from(config);
    let (assignment, partition, advisories) = partition_customers(&metrics, &features, k, &settings)?;
    run.advance(advisories);

    let clusters = label_clusters(&metrics.rows, &assignment, &config.rule_table())?;
    run.advance(Vec::new());

    let summary = summarize_segments(&metrics.rows, &assignment, &clusters);
    run.advance(Vec::new());

    let labels = customer_labels(&assignment, &clusters)
        .into_iter()
        .map(str::to_string)
        .collect();

    let index = metrics
        .rows
        .iter()
        .enumerate()
        .map(|(row, m)| (m.customer_id.clone(), row))
        .collect();
    run.advance(Vec::new());

    tracing::debug!(
        customers = metrics.len(),
        k,
        advisories = run.diagnostics.len(),
        "segmentation complete"
    );

    Ok(SegmentationResult {
        metrics,
        assignment,
        customer_labels: labels,
        clusters,
        summary,
        selection,
        scaler: features.scaler,
        centroids: partition.centroids,
        diagnostics: run.diagnostics,
        stage: run.stage,
        index,
    })
}

/// A caller-chosen k must fit the customers and their distinct profiles
fn check_fixed_k(k: usize, samples: usize, distinct: usize) -> Result<()> {
    if k == 0 {
        return Err(SegmentationError::parameter("k", "k must be at least 1"));
    }
    if k > samples {
        return Err(SegmentationError::parameter(
            "k",
            format!("k ({k}) exceeds the number of customers ({samples}); choose k of at most {samples}"),
        ));
    }
    if k > distinct {
        return Err(SegmentationError::parameter(
            "k",
            format!("k ({k}) exceeds the number of distinct customer profiles ({distinct} among {samples} customers)"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ColumnRoles, TransactionRecord};
    use crate::error::SegmentationError;
    use chrono::{Duration, NaiveDate};

    fn create_test_input() -> TransactionInput {
        let end = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap().and_hms_opt(12, 0, 0).unwrap();
        let mut records = Vec::new();
        // (customer, days before end of each purchase, value per purchase)
        let plan: [(&str, &[i64], f64); 8] = [
            ("vip-1", &[1, 5, 9, 14, 20, 30], 400.0),
            ("vip-2", &[2, 6, 11, 18, 25], 380.0),
            ("vip-3", &[1, 4, 8, 16, 22, 29, 35], 420.0),
            ("lapsed-1", &[300], 15.0),
            ("lapsed-2", &[320, 330], 12.0),
            ("lapsed-3", &[350], 10.0),
            ("mid-1", &[60, 90, 120], 80.0),
            ("mid-2", &[70, 100], 90.0),
        ];
        for (customer, days, value) in plan {
            for &d in days {
                records.push(TransactionRecord::new(customer, end - Duration::days(d), 1.0, value));
            }
        }
        TransactionInput::new(ColumnRoles::new("CustomerID", "InvoiceDate", "Quantity", "UnitPrice"), records)
    }

    #[test]
    fn test_stage_order() {
        let mut stage = Stage::Idle;
        let mut visited = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            stage = next;
            visited.push(stage);
        }
        assert_eq!(visited.len(), 8);
        assert_eq!(stage, Stage::Done);
    }

    #[test]
    fn test_segment() {
        let result = segment(&create_test_input(), &SegmentationConfig::new(2, 4)).unwrap();

        assert_eq!(result.stage, Stage::Done);
        assert_eq!(result.metrics.len(), 8);
        assert_eq!(result.assignment.len(), 8);
        assert!((2..=4).contains(&result.k()));
        assert_eq!(result.clusters.len(), result.k());
        assert_eq!(result.centroids.nrows(), result.k());
        assert!(result.assignment.sizes().iter().all(|&s| s > 0));

        let selection = result.selection.as_ref().unwrap();
        assert_eq!(selection.curve.len(), 3);
        assert_eq!(selection.selected_k, result.k());

        let vip = result.customer("vip-1").unwrap();
        let lapsed = result.customer("lapsed-1").unwrap();
        assert_eq!(vip.metrics.frequency, 6);
        assert_ne!(vip.cluster, lapsed.cluster);
        assert_eq!(result.customer("vip-2").unwrap().cluster, vip.cluster);
        assert!(result.customer("nobody").is_none());
    }

    #[test]
    fn test_segment_with_fixed_k() {
        let result = segment_with_k(&create_test_input(), &SegmentationConfig::default(), 3).unwrap();
        assert_eq!(result.k(), 3);
        assert!(result.selection.is_none());

        let err = segment_with_k(&create_test_input(), &SegmentationConfig::default(), 9).unwrap_err();
        assert!(matches!(err, SegmentationError::Parameter { parameter: "k", .. }));

        let err = segment_with_k(&create_test_input(), &SegmentationConfig::default(), 0).unwrap_err();
        assert!(matches!(err, SegmentationError::Parameter { parameter: "k", .. }));
    }

    #[test]
    fn test_fixed_k_above_distinct_profiles() {
        let mut input = create_test_input();
        // Two more customers with vip-1's exact history collapse onto one profile
        let copies: Vec<TransactionRecord> = input
            .records
            .iter()
            .filter(|r| r.customer_id == "vip-1")
            .flat_map(|r| {
                ["vip-1b", "vip-1c"]
                    .into_iter()
                    .map(move |id| TransactionRecord::new(id, r.timestamp, r.quantity, r.unit_price))
            })
            .collect();
        input.records.extend(copies);

        // 10 customers, 8 distinct profiles
        match segment_with_k(&input, &SegmentationConfig::default(), 9) {
            Err(SegmentationError::Parameter { parameter, message }) => {
                assert_eq!(parameter, "k");
                assert!(message.contains("distinct"), "{message}");
            }
            other => panic!("expected parameter error, got {:?}", other.map(|r| r.k())),
        }
    }

    #[test]
    fn test_customer_labels_follow_assignment() {
        let result = segment_with_k(&create_test_input(), &SegmentationConfig::default(), 3).unwrap();
        assert_eq!(result.customer_labels.len(), result.assignment.len());

        for (customer_id, cluster, label) in result.labeled_customers() {
            let segment = result.customer(customer_id).unwrap();
            assert_eq!(segment.cluster, cluster);
            assert_eq!(segment.label, label);
        }
    }

    #[test]
    fn test_classify_new_customer() {
        let result = segment_with_k(&create_test_input(), &SegmentationConfig::default(), 3).unwrap();
        let vip_cluster = result.customer("vip-1").unwrap().cluster;

        let (cluster, label) = result.classify(3.0, 6.0, 2400.0);
        assert_eq!(cluster, vip_cluster);
        assert_eq!(Some(label), result.label_of(vip_cluster));
    }

    #[test]
    fn test_invalid_config_fails_before_any_stage() {
        let err = segment(&create_test_input(), &SegmentationConfig::new(4, 2)).unwrap_err();
        assert!(matches!(err, SegmentationError::Parameter { parameter: "k_min", .. }));
    }
}
